//! Line-oriented maintenance commands (serial console or debug socket).
//! Every command answers with a short textual acknowledgement.

use alloc::{
    format,
    string::{String, ToString},
};
use core::fmt::Write as _;

use log::info;

use crate::{
    download::EnqueueResult,
    storage::check_path,
    ticker::{Platform, Ticker},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AdminCommand {
    ShowQueue,
    Queue {
        url: String,
        path: String,
        checksum: Option<String>,
    },
    ClearDownloads,
    DeleteBundle {
        uid: String,
    },
    Reconcile,
    ShowStats,
    ResetStats,
    ShowFiles,
    WipeConfig,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AdminError {
    Empty,
    UnknownCommand,
    /// Wrong argument count; carries the usage line.
    Usage(&'static str),
}

impl AdminError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty command",
            Self::UnknownCommand => "unknown command",
            Self::Usage(usage) => usage,
        }
    }
}

pub const HELP: &str = "commands: show-queue, queue <url> <path> [checksum], clear-downloads, \
delete-bundle <uid>, reconcile, show-stats, reset-stats, show-files, wipe-config";

impl AdminCommand {
    pub fn parse(line: &str) -> Result<Self, AdminError> {
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else {
            return Err(AdminError::Empty);
        };
        let args: alloc::vec::Vec<&str> = parts.collect();

        let command = match (name, args.as_slice()) {
            ("show-queue", []) => Self::ShowQueue,
            ("queue", [url, path]) => Self::Queue {
                url: url.to_string(),
                path: path.to_string(),
                checksum: None,
            },
            ("queue", [url, path, checksum]) => Self::Queue {
                url: url.to_string(),
                path: path.to_string(),
                checksum: Some(checksum.to_string()),
            },
            ("queue", _) => return Err(AdminError::Usage("usage: queue <url> <path> [checksum]")),
            ("clear-downloads", []) => Self::ClearDownloads,
            ("delete-bundle", [uid]) => Self::DeleteBundle {
                uid: uid.to_ascii_uppercase(),
            },
            ("delete-bundle", _) => return Err(AdminError::Usage("usage: delete-bundle <uid>")),
            ("reconcile", []) => Self::Reconcile,
            ("show-stats", []) => Self::ShowStats,
            ("reset-stats", []) => Self::ResetStats,
            ("show-files", []) => Self::ShowFiles,
            ("wipe-config", []) => Self::WipeConfig,
            (
                "show-queue" | "clear-downloads" | "reconcile" | "show-stats" | "reset-stats"
                | "show-files" | "wipe-config",
                _,
            ) => return Err(AdminError::Usage("usage: command takes no arguments")),
            _ => return Err(AdminError::UnknownCommand),
        };
        Ok(command)
    }
}

impl<P: Platform> Ticker<P> {
    /// Parse and run one console line.
    pub fn execute_line(&mut self, line: &str, now_ms: u64) -> String {
        match AdminCommand::parse(line) {
            Ok(command) => self.execute(command, now_ms),
            Err(AdminError::UnknownCommand) => format!("error: unknown command\n{HELP}"),
            Err(err) => format!("error: {}", err.as_str()),
        }
    }

    pub fn execute(&mut self, command: AdminCommand, now_ms: u64) -> String {
        info!("admin: execute command={:?}", command);
        let reply = match command {
            AdminCommand::ShowQueue => self.show_queue(),
            AdminCommand::Queue {
                url,
                path,
                checksum,
            } => {
                if check_path(&path).is_err() {
                    return format!("error: invalid path {path}");
                }
                match self.downloads.enqueue(&url, &path, checksum.as_deref()) {
                    EnqueueResult::Queued => format!("queued {path}"),
                    EnqueueResult::Duplicate => format!("already queued {path}"),
                }
            }
            AdminCommand::ClearDownloads => {
                let dropped = self.downloads.cancel_all(&mut self.config);
                self.figures
                    .on_downloads_cancelled(&self.downloads, &mut self.events);
                format!("cleared {dropped}")
            }
            AdminCommand::DeleteBundle { uid } => {
                match self.figures.delete_bundle(
                    &uid,
                    &mut self.storage,
                    &mut self.registry,
                    &mut self.config,
                ) {
                    Ok(deleted) => format!("deleted {deleted} files for {uid}"),
                    Err(reason) => format!("error: {} {uid}", reason.as_str()),
                }
            }
            AdminCommand::Reconcile => {
                let scheduled = self
                    .registry
                    .reconcile(now_ms, &mut self.storage, &mut self.downloads);
                format!("reconcile scheduled {scheduled}")
            }
            AdminCommand::ShowStats => {
                let stats = self.downloads.stats();
                format!(
                    "total={} succeeded={} failed={} failed_attempts={} bytes={}",
                    stats.total, stats.succeeded, stats.failed, stats.failed_attempts, stats.bytes
                )
            }
            AdminCommand::ResetStats => {
                self.downloads.reset_stats(now_ms, &mut self.config);
                String::from("stats reset")
            }
            AdminCommand::ShowFiles => self.show_files(),
            AdminCommand::WipeConfig => match self.config.wipe() {
                Ok(()) => String::from("config wiped"),
                Err(err) => format!("error: {}", err.as_str()),
            },
        };
        self.dispatch(now_ms);
        reply
    }

    fn show_queue(&self) -> String {
        let queue = self.downloads.queue();
        let mut out = format!(
            "queue: {} task(s), {} pending",
            queue.len(),
            self.downloads.pending_len()
        );
        let in_flight = self.downloads.in_flight();
        for task in queue {
            let marker = if in_flight == Some((task.url.as_str(), task.path.as_str())) {
                "*"
            } else {
                "-"
            };
            let _ = write!(
                out,
                "\n{} {} -> {} retries={}",
                marker, task.url, task.path, task.retry_count
            );
            if let Some(checksum) = task.expected_checksum() {
                let _ = write!(out, " crc={checksum}");
            }
        }
        out
    }

    fn show_files(&mut self) -> String {
        let mut out = format!("files: {}", self.registry.len());
        for entry in self.registry.entries() {
            let state = if self.storage.exists(&entry.path) {
                "present"
            } else {
                "missing"
            };
            let _ = write!(out, "\n{} {} <- {}", state, entry.path, entry.url);
        }
        out
    }
}
