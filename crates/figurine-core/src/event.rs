//! Typed events exchanged between components on the loop thread.

use alloc::{collections::VecDeque, string::String};

use crate::{
    download::DownloadError,
    figure::{BundleFailure, Figure},
    nfc::{NfcCard, SessionHandle},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FsOp {
    Mount,
    Unmount,
    Write,
    Mkdir,
    Rename,
    Remove,
}

impl FsOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Unmount => "unmount",
            Self::Write => "write",
            Self::Mkdir => "mkdir",
            Self::Rename => "rename",
            Self::Remove => "remove",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Reed closed and debounced; a new session generation began.
    SessionStart { generation: u32 },
    /// First UID decoded in the session.
    CardRead {
        card: NfcCard,
        session: SessionHandle,
    },
    /// Reed opened after a card was read.
    SessionEnd { session: SessionHandle },
    DownloadProgress {
        url: String,
        path: String,
        percent: u8,
        bytes: u64,
        total: Option<u64>,
    },
    /// One per attempt; `Err(DownloadError::MaxRetries)` is the only
    /// terminal failure.
    DownloadComplete {
        url: String,
        path: String,
        result: Result<(), DownloadError>,
    },
    BundleReady {
        session: SessionHandle,
        manifest: Figure,
    },
    BundleFailed {
        session: SessionHandle,
        manifest: Option<Figure>,
        reason: BundleFailure,
    },
    FileSystem {
        op: FsOp,
        path: String,
        success: bool,
    },
}

impl Event {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session-start",
            Self::CardRead { .. } => "card-read",
            Self::SessionEnd { .. } => "session-end",
            Self::DownloadProgress { .. } => "download-progress",
            Self::DownloadComplete { .. } => "download-complete",
            Self::BundleReady { .. } => "bundle-ready",
            Self::BundleFailed { .. } => "bundle-failed",
            Self::FileSystem { .. } => "file-system",
        }
    }
}

/// FIFO of pending events, delivered in the order they were raised.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.events.drain(..)
    }
}

/// External collaborator notified of every event (LED animator, presence
/// client, logger). Each event kind has its own method.
pub trait Observer {
    fn session_start(&mut self, _generation: u32) {}

    fn after_nfc_read(&mut self, _card: &NfcCard) {}

    fn after_detach_nfc(&mut self) {}

    fn figure_download_complete(
        &mut self,
        _uid: &str,
        _name: &str,
        _success: bool,
        _error: Option<&BundleFailure>,
        _manifest: Option<&Figure>,
    ) {
    }

    fn download_progress(
        &mut self,
        _url: &str,
        _path: &str,
        _percent: u8,
        _bytes: u64,
        _total: Option<u64>,
    ) {
    }

    fn download_complete(
        &mut self,
        _url: &str,
        _path: &str,
        _success: bool,
        _error: Option<DownloadError>,
    ) {
    }

    fn file_system_event(&mut self, _op: FsOp, _path: &str, _success: bool) {}
}

pub fn notify(observer: &mut dyn Observer, event: &Event) {
    match event {
        Event::SessionStart { generation } => observer.session_start(*generation),
        Event::CardRead { card, .. } => observer.after_nfc_read(card),
        Event::SessionEnd { .. } => observer.after_detach_nfc(),
        Event::DownloadProgress {
            url,
            path,
            percent,
            bytes,
            total,
        } => observer.download_progress(url, path, *percent, *bytes, *total),
        Event::DownloadComplete { url, path, result } => {
            observer.download_complete(url, path, result.is_ok(), result.as_ref().err().copied())
        }
        Event::BundleReady { session, manifest } => observer.figure_download_complete(
            session.uid(),
            &manifest.name,
            true,
            None,
            Some(manifest),
        ),
        Event::BundleFailed {
            session,
            manifest,
            reason,
        } => observer.figure_download_complete(
            session.uid(),
            manifest.as_ref().map(|m| m.name.as_str()).unwrap_or(""),
            false,
            Some(reason),
            manifest.as_ref(),
        ),
        Event::FileSystem { op, path, success } => observer.file_system_event(*op, path, *success),
    }
}
