//! Removable-media storage layer.
//!
//! [`FileSystem`] is the contract a block-device backend fulfils (SD card,
//! RAM). [`StorageLayer`] adds what every caller relies on: mount
//! lifecycle, implicit parent-directory creation, checksums and
//! file-system events.

pub mod checksum;
mod memory;

use alloc::{string::String, vec, vec::Vec};

use log::{debug, info, warn};

use crate::{
    error::ErrorKind,
    event::{Event, EventQueue, FsOp},
};

pub use memory::MemoryFileSystem;

use checksum::{Crc32, checksum_hex, checksum_matches};

pub const MAX_PATH_BYTES: usize = 96;
pub const CHECKSUM_CHUNK_BYTES: usize = 512;
pub const MOUNT_RETRY_MS: u64 = 5_000;
pub const TEMP_SUFFIX: &str = ".tmp";

pub const AUDIO_DIR: &str = "/audio";
pub const LOGS_DIR: &str = "/logs";
pub const TEMP_DIR: &str = "/temp";
pub const FIGURES_DIR: &str = "/figures";
pub const SOUNDS_DIR: &str = "/sounds";

const RESERVED_DIRS: [&str; 5] = [AUDIO_DIR, LOGS_DIR, TEMP_DIR, FIGURES_DIR, SOUNDS_DIR];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageError {
    DeviceAbsent,
    DeviceFull,
    PathTooLong,
    InvalidPath,
    NotFound,
    /// The backend cannot perform this operation (directory removal on FAT).
    Unsupported,
    Io,
}

impl StorageError {
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::Absent,
            _ => ErrorKind::Storage,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeviceAbsent => "device-absent",
            Self::DeviceFull => "device-full",
            Self::PathTooLong => "path-too-long",
            Self::InvalidPath => "invalid-path",
            Self::NotFound => "not-found",
            Self::Unsupported => "unsupported",
            Self::Io => "io-error",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Block-device filesystem backend. Paths are absolute, `/`-separated.
///
/// Backends do not create missing parents; [`StorageLayer`] does.
pub trait FileSystem {
    fn mount(&mut self) -> Result<(), StorageError>;
    fn unmount(&mut self);

    fn exists(&mut self, path: &str) -> bool;
    fn size(&mut self, path: &str) -> Result<u64, StorageError>;

    /// Create one directory level. Succeeds if it already exists.
    fn create_dir(&mut self, path: &str) -> Result<(), StorageError>;

    /// Create or truncate `path` with `bytes`.
    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Append to `path`, creating it when missing.
    fn append(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError>;

    /// Move `from` to `to`, replacing any existing file at `to`.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError>;

    fn remove(&mut self, path: &str) -> Result<(), StorageError>;
    fn list(&mut self, dir: &str) -> Result<Vec<DirEntry>, StorageError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MountState {
    Unmounted,
    Mounted,
    /// Unmounted on request; never remounted during this boot.
    Ejected,
}

#[derive(Debug)]
pub struct StorageLayer<F> {
    fs: F,
    state: MountState,
    last_mount_attempt_ms: Option<u64>,
    events: Vec<Event>,
}

impl<F> StorageLayer<F>
where
    F: FileSystem,
{
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            state: MountState::Unmounted,
            last_mount_attempt_ms: None,
            events: Vec::new(),
        }
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut F {
        &mut self.fs
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    pub fn is_mounted(&self) -> bool {
        self.state == MountState::Mounted
    }

    pub fn mount(&mut self, now_ms: u64) -> Result<(), StorageError> {
        match self.state {
            MountState::Mounted => return Ok(()),
            MountState::Ejected => return Err(StorageError::DeviceAbsent),
            MountState::Unmounted => {}
        }

        self.last_mount_attempt_ms = Some(now_ms);
        let result = self.fs.mount();
        self.record(FsOp::Mount, "/", result.is_ok());
        result?;

        self.state = MountState::Mounted;
        info!("storage: mounted");
        for dir in RESERVED_DIRS {
            if let Err(err) = self.ensure_dir(dir) {
                warn!("storage: reserved dir failed path={} err={}", dir, err.as_str());
            }
        }
        Ok(())
    }

    /// Terminal for this boot.
    pub fn unmount(&mut self) {
        if self.state == MountState::Mounted {
            self.fs.unmount();
        }
        self.state = MountState::Ejected;
        self.record(FsOp::Unmount, "/", true);
        info!("storage: unmounted");
    }

    pub fn poll(&mut self, now_ms: u64, events: &mut EventQueue) {
        if self.state == MountState::Unmounted {
            let due = match self.last_mount_attempt_ms {
                Some(last) => now_ms.saturating_sub(last) >= MOUNT_RETRY_MS,
                None => true,
            };
            if due && let Err(err) = self.mount(now_ms) {
                debug!("storage: mount retry failed err={}", err.as_str());
            }
        }
        self.drain_events(events);
    }

    pub fn drain_events(&mut self, events: &mut EventQueue) {
        for event in self.events.drain(..) {
            events.push(event);
        }
    }

    pub fn exists(&mut self, path: &str) -> bool {
        self.is_mounted() && check_path(path).is_ok() && self.fs.exists(path)
    }

    pub fn size(&mut self, path: &str) -> Result<u64, StorageError> {
        self.ready(path)?;
        self.fs.size(path)
    }

    /// Create `path` and any missing ancestors.
    pub fn mkdir(&mut self, path: &str) -> Result<(), StorageError> {
        self.ready(path)?;
        let result = self.ensure_dir(path);
        self.record(FsOp::Mkdir, path, result.is_ok());
        result
    }

    pub fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.ready(path)?;
        let result = self
            .ensure_dir(parent_of(path))
            .and_then(|_| self.fs.write(path, bytes));
        self.record(FsOp::Write, path, result.is_ok());
        result
    }

    pub fn append(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.ready(path)?;
        self.ensure_dir(parent_of(path))?;
        self.fs.append(path, bytes)
    }

    pub fn read(&mut self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.ready(path)?;
        let len = self.fs.size(path)? as usize;
        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.fs.read_at(path, filled as u64, &mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        Ok(data)
    }

    pub fn read_at(
        &mut self,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        self.ready(path)?;
        self.fs.read_at(path, offset, buf)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        self.ready(from)?;
        check_path(to)?;
        let result = self
            .ensure_dir(parent_of(to))
            .and_then(|_| self.fs.rename(from, to));
        self.record(FsOp::Rename, to, result.is_ok());
        result
    }

    pub fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        self.ready(path)?;
        let result = self.fs.remove(path);
        self.record(FsOp::Remove, path, result.is_ok());
        result
    }

    /// Remove `path` when present. Returns whether a file was removed.
    pub fn remove_if_exists(&mut self, path: &str) -> Result<bool, StorageError> {
        if !self.exists(path) {
            return Ok(false);
        }
        self.remove(path).map(|_| true)
    }

    pub fn list(&mut self, dir: &str) -> Result<Vec<DirEntry>, StorageError> {
        self.ready(dir)?;
        self.fs.list(dir)
    }

    /// CRC-32 of the file contents, lowercase hex.
    pub fn checksum(&mut self, path: &str) -> Result<String, StorageError> {
        self.crc32(path).map(checksum_hex)
    }

    pub fn crc32(&mut self, path: &str) -> Result<u32, StorageError> {
        self.ready(path)?;
        let mut crc = Crc32::new();
        let mut buf = [0u8; CHECKSUM_CHUNK_BYTES];
        let mut offset = 0u64;
        loop {
            let n = self.fs.read_at(path, offset, &mut buf)?;
            if n == 0 {
                break;
            }
            crc.update(&buf[..n]);
            offset += n as u64;
        }
        Ok(crc.finish())
    }

    /// Whether the file exists and matches `expected` (case-insensitive hex).
    pub fn verify(&mut self, path: &str, expected: &str) -> Result<bool, StorageError> {
        let actual = self.crc32(path)?;
        Ok(checksum_matches(expected, actual))
    }

    fn ready(&self, path: &str) -> Result<(), StorageError> {
        if !self.is_mounted() {
            return Err(StorageError::DeviceAbsent);
        }
        check_path(path)
    }

    fn ensure_dir(&mut self, path: &str) -> Result<(), StorageError> {
        if path == "/" || self.fs.exists(path) {
            return Ok(());
        }
        for (index, _) in path.match_indices('/').skip(1) {
            let prefix = &path[..index];
            if !self.fs.exists(prefix) {
                self.fs.create_dir(prefix)?;
            }
        }
        self.fs.create_dir(path)
    }

    fn record(&mut self, op: FsOp, path: &str, success: bool) {
        if !success {
            warn!("storage: {} failed path={}", op.as_str(), path);
        }
        self.events.push(Event::FileSystem {
            op,
            path: String::from(path),
            success,
        });
    }
}

pub fn check_path(path: &str) -> Result<(), StorageError> {
    if path.len() > MAX_PATH_BYTES {
        return Err(StorageError::PathTooLong);
    }
    if !path.starts_with('/')
        || (path.len() > 1 && path.ends_with('/'))
        || path.contains("//")
        || path.split('/').any(|c| c == "..")
    {
        return Err(StorageError::InvalidPath);
    }
    Ok(())
}

pub fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

/// Temporary sibling used for atomic publish.
pub fn temp_path_for(path: &str) -> String {
    let mut tmp = String::with_capacity(path.len() + TEMP_SUFFIX.len());
    tmp.push_str(path);
    tmp.push_str(TEMP_SUFFIX);
    tmp
}
