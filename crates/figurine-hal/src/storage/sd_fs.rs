//! FAT file system on the SD card, behind the core [`FileSystem`] seam.
//!
//! The volume and its root directory stay open while mounted; every other
//! directory and file is opened for the duration of one call. Components
//! that are not valid 8.3 names live under an alias recorded in the
//! directory's name index (see [`names`]), so listings report the names
//! callers wrote and two long names never share an entry.
//!
//! The driver cannot delete directories: removing one reports
//! [`StorageError::Unsupported`].

mod names;

use alloc::{string::String, vec, vec::Vec};

use embedded_sdmmc::{
    BlockDevice, Mode, RawDirectory, RawFile, RawVolume, ShortFileName, TimeSource, Timestamp,
    VolumeIdx, VolumeManager,
};
use log::{debug, info, warn};

use figurine_core::storage::{DirEntry, FileSystem, StorageError};

use names::{ALIAS_SLOTS, INDEX_NAME, IndexEntry, ShortText, split_path};

const COPY_CHUNK_BYTES: usize = 512;
const MAX_INDEX_BYTES: u32 = 32 * 1024;

/// Fixed timestamp source used until RTC time integration is added.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedTimeSource;

impl TimeSource for FixedTimeSource {
    fn get_timestamp(&self) -> Timestamp {
        // 2026-01-01 00:00:00
        Timestamp {
            year_since_1970: 56,
            zero_indexed_month: 0,
            zero_indexed_day: 0,
            hours: 0,
            minutes: 0,
            seconds: 0,
        }
    }
}

#[derive(Clone, Copy)]
struct Mounted {
    volume: RawVolume,
    root: RawDirectory,
}

#[derive(Clone, Copy)]
struct OpenDir {
    dir: RawDirectory,
    owned: bool,
}

/// A path component resolved inside an open directory.
struct Resolved {
    name: ShortFileName,
    aliased: bool,
}

pub struct SdFileSystem<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    volume_mgr: VolumeManager<D, T>,
    mounted: Option<Mounted>,
}

impl<D, T> SdFileSystem<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    /// `block_device` is usually an `embedded_sdmmc::SdCard` on the SPI bus.
    pub fn new(block_device: D, time_source: T) -> Self {
        Self {
            volume_mgr: VolumeManager::new(block_device, time_source),
            mounted: None,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    fn root(&self) -> Result<RawDirectory, StorageError> {
        self.mounted
            .map(|mounted| mounted.root)
            .ok_or(StorageError::DeviceAbsent)
    }

    /// Walk `dir_path` from the root, keeping only the innermost directory
    /// open.
    fn open_dir_path(&mut self, dir_path: &str) -> Result<OpenDir, StorageError> {
        let mut current = OpenDir {
            dir: self.root()?,
            owned: false,
        };
        for component in dir_path.split('/').filter(|part| !part.is_empty()) {
            let next = self
                .resolve(current.dir, component, false)
                .and_then(|resolved| {
                    self.volume_mgr
                        .open_dir(current.dir, &resolved.name)
                        .map_err(map_sd_error)
                });
            self.close_dir(current);
            current = OpenDir {
                dir: next?,
                owned: true,
            };
        }
        Ok(current)
    }

    fn close_dir(&mut self, dir: OpenDir) {
        if dir.owned
            && let Err(err) = self.volume_mgr.close_dir(dir.dir)
        {
            warn!("sd: close dir failed err={:?}", err);
        }
    }

    /// Open the parent of `path`, resolve its leaf, then run `f`.
    fn with_parent<R, F>(&mut self, path: &str, create: bool, f: F) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Self, RawDirectory, Resolved) -> Result<R, StorageError>,
    {
        let (parent, leaf) = split_path(path)?;
        let dir = self.open_dir_path(parent)?;
        let result = self
            .resolve(dir.dir, leaf, create)
            .and_then(|resolved| f(self, dir.dir, resolved));
        self.close_dir(dir);
        result
    }

    /// Close errors are reported: closing flushes pending writes.
    fn with_file<R, F>(
        &mut self,
        dir: RawDirectory,
        name: &ShortFileName,
        mode: Mode,
        f: F,
    ) -> Result<R, StorageError>
    where
        F: FnOnce(&mut Self, RawFile) -> Result<R, StorageError>,
    {
        let file = self
            .volume_mgr
            .open_file_in_dir(dir, name, mode)
            .map_err(map_sd_error)?;
        let result = f(self, file);
        let closed = self.volume_mgr.close_file(file).map_err(map_sd_error);
        result.and_then(|value| closed.map(|()| value))
    }

    /// Short name for `component` in `dir`. With `create`, a long name
    /// without an alias gets one allocated and recorded.
    fn resolve(
        &mut self,
        dir: RawDirectory,
        component: &str,
        create: bool,
    ) -> Result<Resolved, StorageError> {
        if let Some(plain) = names::plain_name(component)? {
            return Ok(Resolved {
                name: to_short(&plain)?,
                aliased: false,
            });
        }

        let mut index = self.load_index(dir)?;
        if let Some(entry) = index.iter().find(|entry| entry.long == component) {
            return Ok(Resolved {
                name: to_short(&entry.alias)?,
                aliased: true,
            });
        }
        if !create {
            return Err(StorageError::NotFound);
        }

        let alias = self.allocate_alias(dir, component, &index)?;
        debug!("sd: alias name={} alias={}", component, alias.as_str());
        let name = to_short(&alias)?;
        index.push(IndexEntry {
            alias,
            long: String::from(component),
        });
        self.store_index(dir, &index)?;
        Ok(Resolved {
            name,
            aliased: true,
        })
    }

    /// First alias slot, from the name's hash onward, that neither the index
    /// nor the directory already uses.
    fn allocate_alias(
        &mut self,
        dir: RawDirectory,
        component: &str,
        index: &[IndexEntry],
    ) -> Result<ShortText, StorageError> {
        for step in 0..ALIAS_SLOTS {
            let candidate = names::alias(component, step)?;
            if index.iter().any(|entry| entry.alias == candidate) {
                continue;
            }
            match self.volume_mgr.find_directory_entry(dir, &to_short(&candidate)?) {
                Ok(_) => continue,
                Err(embedded_sdmmc::Error::NotFound) => {
                    if step > 0 {
                        info!("sd: alias collision name={} step={}", component, step);
                    }
                    return Ok(candidate);
                }
                Err(err) => return Err(map_sd_error(err)),
            }
        }
        warn!("sd: alias slots exhausted name={}", component);
        Err(StorageError::DeviceFull)
    }

    fn load_index(&mut self, dir: RawDirectory) -> Result<Vec<IndexEntry>, StorageError> {
        let index_name = to_short(INDEX_NAME)?;
        let bytes = match self.with_file(dir, &index_name, Mode::ReadOnly, |fs, file| {
            fs.read_all(file)
        }) {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(names::parse_index(&bytes))
    }

    fn store_index(&mut self, dir: RawDirectory, index: &[IndexEntry]) -> Result<(), StorageError> {
        let index_name = to_short(INDEX_NAME)?;
        if index.is_empty() {
            return match self.volume_mgr.delete_file_in_dir(dir, &index_name) {
                Ok(()) | Err(embedded_sdmmc::Error::NotFound) => Ok(()),
                Err(err) => Err(map_sd_error(err)),
            };
        }
        let bytes = names::encode_index(index);
        self.with_file(dir, &index_name, Mode::ReadWriteCreateOrTruncate, |fs, file| {
            fs.volume_mgr.write(file, &bytes).map_err(map_sd_error)
        })
    }

    /// Drop the index entry for `component` after its file went away.
    fn forget_alias(&mut self, dir: RawDirectory, component: &str) -> Result<(), StorageError> {
        let mut index = self.load_index(dir)?;
        let before = index.len();
        index.retain(|entry| entry.long != component);
        if index.len() == before {
            return Ok(());
        }
        self.store_index(dir, &index)
    }

    fn read_all(&mut self, file: RawFile) -> Result<Vec<u8>, StorageError> {
        let length = self.volume_mgr.file_length(file).map_err(map_sd_error)?;
        if length > MAX_INDEX_BYTES {
            warn!("sd: name index too large len={}", length);
            return Err(StorageError::Io);
        }
        let mut bytes = vec![0u8; length as usize];
        let read = self.read_file(file, 0, &mut bytes)?;
        bytes.truncate(read);
        Ok(bytes)
    }

    fn read_file(&mut self, file: RawFile, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        let length = u64::from(self.volume_mgr.file_length(file).map_err(map_sd_error)?);
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let offset = u32::try_from(offset).map_err(|_| StorageError::Io)?;
        self.volume_mgr
            .file_seek_from_start(file, offset)
            .map_err(map_sd_error)?;

        let mut total = 0usize;
        while total < buf.len() {
            let read = self
                .volume_mgr
                .read(file, &mut buf[total..])
                .map_err(map_sd_error)?;
            if read == 0 {
                break;
            }
            total += read;
        }
        Ok(total)
    }

    fn copy_file(&mut self, source: RawFile, target: RawFile) -> Result<(), StorageError> {
        let mut chunk = [0u8; COPY_CHUNK_BYTES];
        loop {
            let read = self
                .volume_mgr
                .read(source, &mut chunk)
                .map_err(map_sd_error)?;
            if read == 0 {
                return Ok(());
            }
            self.volume_mgr
                .write(target, &chunk[..read])
                .map_err(map_sd_error)?;
        }
    }

    fn move_file(
        &mut self,
        from_dir: RawDirectory,
        from_name: &ShortFileName,
        to_dir: RawDirectory,
        to_name: &ShortFileName,
    ) -> Result<(), StorageError> {
        self.with_file(from_dir, from_name, Mode::ReadOnly, |fs, source| {
            fs.with_file(to_dir, to_name, Mode::ReadWriteCreateOrTruncate, |fs, target| {
                fs.copy_file(source, target)
            })
        })?;
        self.volume_mgr
            .delete_file_in_dir(from_dir, from_name)
            .map_err(map_sd_error)
    }

    fn rename_in(
        &mut self,
        from_dir: RawDirectory,
        from_leaf: &str,
        to_dir: RawDirectory,
        to_leaf: &str,
        same_dir: bool,
    ) -> Result<(), StorageError> {
        let from = self.resolve(from_dir, from_leaf, false)?;
        let to = self.resolve(to_dir, to_leaf, true)?;
        if same_dir && from.name == to.name {
            return Ok(());
        }
        self.move_file(from_dir, &from.name, to_dir, &to.name)?;
        if from.aliased {
            self.forget_alias(from_dir, from_leaf)?;
        }
        Ok(())
    }
}

impl<D, T> FileSystem for SdFileSystem<D, T>
where
    D: BlockDevice,
    T: TimeSource,
{
    fn mount(&mut self) -> Result<(), StorageError> {
        if self.mounted.is_some() {
            return Ok(());
        }

        let volume = self
            .volume_mgr
            .open_raw_volume(VolumeIdx(0))
            .map_err(|err| {
                warn!("sd: open volume failed err={:?}", err);
                StorageError::DeviceAbsent
            })?;
        match self.volume_mgr.open_root_dir(volume) {
            Ok(root) => {
                self.mounted = Some(Mounted { volume, root });
                info!("sd: mounted");
                Ok(())
            }
            Err(err) => {
                warn!("sd: open root failed err={:?}", err);
                if let Err(err) = self.volume_mgr.close_volume(volume) {
                    warn!("sd: close volume failed err={:?}", err);
                }
                Err(StorageError::DeviceAbsent)
            }
        }
    }

    fn unmount(&mut self) {
        let Some(mounted) = self.mounted.take() else {
            return;
        };
        if let Err(err) = self.volume_mgr.close_dir(mounted.root) {
            warn!("sd: close root failed err={:?}", err);
        }
        if let Err(err) = self.volume_mgr.close_volume(mounted.volume) {
            warn!("sd: close volume failed err={:?}", err);
        }
        info!("sd: unmounted");
    }

    fn exists(&mut self, path: &str) -> bool {
        if path == "/" {
            return self.mounted.is_some();
        }
        self.with_parent(path, false, |fs, dir, leaf| {
            Ok(fs.volume_mgr.find_directory_entry(dir, &leaf.name).is_ok())
        })
        .unwrap_or(false)
    }

    fn size(&mut self, path: &str) -> Result<u64, StorageError> {
        self.with_parent(path, false, |fs, dir, leaf| {
            let entry = fs
                .volume_mgr
                .find_directory_entry(dir, &leaf.name)
                .map_err(map_sd_error)?;
            if entry.attributes.is_directory() {
                return Err(StorageError::Io);
            }
            Ok(u64::from(entry.size))
        })
    }

    fn create_dir(&mut self, path: &str) -> Result<(), StorageError> {
        self.with_parent(path, true, |fs, dir, leaf| {
            match fs.volume_mgr.make_dir_in_dir(dir, &leaf.name) {
                Ok(()) | Err(embedded_sdmmc::Error::DirAlreadyExists) => Ok(()),
                Err(err) => Err(map_sd_error(err)),
            }
        })
    }

    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.with_parent(path, true, |fs, dir, leaf| {
            fs.with_file(dir, &leaf.name, Mode::ReadWriteCreateOrTruncate, |fs, file| {
                fs.volume_mgr.write(file, bytes).map_err(map_sd_error)
            })
        })
    }

    fn append(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.with_parent(path, true, |fs, dir, leaf| {
            fs.with_file(dir, &leaf.name, Mode::ReadWriteCreateOrAppend, |fs, file| {
                fs.volume_mgr.write(file, bytes).map_err(map_sd_error)
            })
        })
    }

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.with_parent(path, false, |fs, dir, leaf| {
            fs.with_file(dir, &leaf.name, Mode::ReadOnly, |fs, file| {
                fs.read_file(file, offset, buf)
            })
        })
    }

    /// FAT has no in-place rename here: copy, then delete the source.
    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        let (from_parent, from_leaf) = split_path(from)?;
        let (to_parent, to_leaf) = split_path(to)?;
        if from == to {
            return Ok(());
        }

        let from_dir = self.open_dir_path(from_parent)?;
        let result = if from_parent == to_parent {
            self.rename_in(from_dir.dir, from_leaf, from_dir.dir, to_leaf, true)
        } else {
            match self.open_dir_path(to_parent) {
                Ok(to_dir) => {
                    let result = self.rename_in(from_dir.dir, from_leaf, to_dir.dir, to_leaf, false);
                    self.close_dir(to_dir);
                    result
                }
                Err(err) => Err(err),
            }
        };
        self.close_dir(from_dir);
        result
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        let (_, leaf_text) = split_path(path)?;
        self.with_parent(path, false, |fs, dir, leaf| {
            let entry = fs
                .volume_mgr
                .find_directory_entry(dir, &leaf.name)
                .map_err(map_sd_error)?;
            if entry.attributes.is_directory() {
                debug!("sd: directory removal unsupported path={}", path);
                return Err(StorageError::Unsupported);
            }
            fs.volume_mgr
                .delete_file_in_dir(dir, &leaf.name)
                .map_err(map_sd_error)?;
            if leaf.aliased {
                fs.forget_alias(dir, leaf_text)?;
            }
            Ok(())
        })
    }

    fn list(&mut self, dir: &str) -> Result<Vec<DirEntry>, StorageError> {
        if !dir.starts_with('/') {
            return Err(StorageError::InvalidPath);
        }
        let opened = self.open_dir_path(dir)?;
        let index_name = to_short(INDEX_NAME)?;
        let mut raw = Vec::new();
        let walked = self
            .volume_mgr
            .iterate_dir(opened.dir, |entry| {
                if entry.attributes.is_volume()
                    || entry.attributes.is_lfn()
                    || is_dot_entry(&entry.name)
                    || entry.name == index_name
                {
                    return;
                }
                raw.push((entry.name.clone(), entry.attributes.is_directory(), entry.size));
            })
            .map_err(map_sd_error);
        let index = walked.and_then(|()| self.load_index(opened.dir));
        self.close_dir(opened);
        let index = index?;

        Ok(raw
            .into_iter()
            .map(|(name, is_dir, size)| {
                let short = names::display_name(name.base_name(), name.extension());
                let long = index
                    .iter()
                    .find(|entry| entry.alias.eq_ignore_ascii_case(&short))
                    .map(|entry| entry.long.clone());
                DirEntry {
                    name: long.unwrap_or(short),
                    is_dir,
                    size: u64::from(size),
                }
            })
            .collect())
    }
}

fn map_sd_error<E: core::fmt::Debug>(err: embedded_sdmmc::Error<E>) -> StorageError {
    match err {
        embedded_sdmmc::Error::NotFound => StorageError::NotFound,
        embedded_sdmmc::Error::NotEnoughSpace | embedded_sdmmc::Error::DiskFull => {
            StorageError::DeviceFull
        }
        embedded_sdmmc::Error::FilenameError(_) => StorageError::InvalidPath,
        other => {
            warn!("sd: fs error err={:?}", other);
            StorageError::Io
        }
    }
}

fn to_short(text: &str) -> Result<ShortFileName, StorageError> {
    ShortFileName::create_from_str(text).map_err(|_| StorageError::InvalidPath)
}

fn is_dot_entry(name: &ShortFileName) -> bool {
    matches!(name.base_name(), b"." | b"..")
}

#[cfg(test)]
mod tests;
