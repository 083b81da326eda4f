use alloc::{
    collections::{BTreeMap, BTreeSet},
    string::String,
    vec::Vec,
};

use super::{DirEntry, FileSystem, StorageError, parent_of};

/// RAM-backed filesystem used for bring-up without an SD card and in tests.
#[derive(Clone, Debug)]
pub struct MemoryFileSystem {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    present: bool,
    mounted: bool,
    capacity_bytes: Option<usize>,
    dir_removal: bool,
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::from("/"));
        Self {
            files: BTreeMap::new(),
            dirs,
            present: true,
            mounted: false,
            capacity_bytes: None,
            dir_removal: true,
        }
    }

    pub fn with_capacity(mut self, capacity_bytes: usize) -> Self {
        self.capacity_bytes = Some(capacity_bytes);
        self
    }

    /// Refuse directory removal the way the FAT backend does.
    pub fn without_dir_removal(mut self) -> Self {
        self.dir_removal = false;
        self
    }

    /// Simulate inserting or pulling the card.
    pub fn set_present(&mut self, present: bool) {
        self.present = present;
        if !present {
            self.mounted = false;
        }
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn file_paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn used_bytes(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    fn ensure_mounted(&self) -> Result<(), StorageError> {
        if self.mounted && self.present {
            Ok(())
        } else {
            Err(StorageError::DeviceAbsent)
        }
    }

    fn ensure_parent(&self, path: &str) -> Result<(), StorageError> {
        if self.dirs.contains(parent_of(path)) {
            Ok(())
        } else {
            Err(StorageError::NotFound)
        }
    }

    fn ensure_room(&self, path: &str, new_len: usize) -> Result<(), StorageError> {
        let Some(capacity) = self.capacity_bytes else {
            return Ok(());
        };
        let current = self.files.get(path).map(Vec::len).unwrap_or(0);
        let used = self.used_bytes() - current;
        if used + new_len > capacity {
            Err(StorageError::DeviceFull)
        } else {
            Ok(())
        }
    }
}

impl FileSystem for MemoryFileSystem {
    fn mount(&mut self) -> Result<(), StorageError> {
        if !self.present {
            return Err(StorageError::DeviceAbsent);
        }
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self) {
        self.mounted = false;
    }

    fn exists(&mut self, path: &str) -> bool {
        self.ensure_mounted().is_ok() && (self.files.contains_key(path) || self.dirs.contains(path))
    }

    fn size(&mut self, path: &str) -> Result<u64, StorageError> {
        self.ensure_mounted()?;
        if let Some(data) = self.files.get(path) {
            return Ok(data.len() as u64);
        }
        if self.dirs.contains(path) {
            return Ok(0);
        }
        Err(StorageError::NotFound)
    }

    fn create_dir(&mut self, path: &str) -> Result<(), StorageError> {
        self.ensure_mounted()?;
        if self.dirs.contains(path) {
            return Ok(());
        }
        if self.files.contains_key(path) {
            return Err(StorageError::Io);
        }
        self.ensure_parent(path)?;
        self.dirs.insert(String::from(path));
        Ok(())
    }

    fn write(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.ensure_mounted()?;
        self.ensure_parent(path)?;
        if self.dirs.contains(path) {
            return Err(StorageError::Io);
        }
        self.ensure_room(path, bytes.len())?;
        self.files.insert(String::from(path), bytes.to_vec());
        Ok(())
    }

    fn append(&mut self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.ensure_mounted()?;
        self.ensure_parent(path)?;
        if self.dirs.contains(path) {
            return Err(StorageError::Io);
        }
        let current = self.files.get(path).map(Vec::len).unwrap_or(0);
        self.ensure_room(path, current + bytes.len())?;
        self.files
            .entry(String::from(path))
            .or_default()
            .extend_from_slice(bytes);
        Ok(())
    }

    fn read_at(&mut self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, StorageError> {
        self.ensure_mounted()?;
        let data = self.files.get(path).ok_or(StorageError::NotFound)?;
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), StorageError> {
        self.ensure_mounted()?;
        self.ensure_parent(to)?;
        if self.dirs.contains(to) {
            return Err(StorageError::Io);
        }
        let data = self.files.remove(from).ok_or(StorageError::NotFound)?;
        self.files.insert(String::from(to), data);
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<(), StorageError> {
        self.ensure_mounted()?;
        if self.files.remove(path).is_some() {
            return Ok(());
        }
        if path != "/" && self.dirs.contains(path) {
            if !self.dir_removal {
                return Err(StorageError::Unsupported);
            }
            let has_children = self
                .files
                .keys()
                .chain(self.dirs.iter())
                .any(|entry| entry != path && parent_of(entry) == path);
            if has_children {
                return Err(StorageError::Io);
            }
            self.dirs.remove(path);
            return Ok(());
        }
        Err(StorageError::NotFound)
    }

    fn list(&mut self, dir: &str) -> Result<Vec<DirEntry>, StorageError> {
        self.ensure_mounted()?;
        if !self.dirs.contains(dir) {
            return Err(StorageError::NotFound);
        }
        let mut entries = Vec::new();
        for sub in self.dirs.iter() {
            if sub != dir && parent_of(sub) == dir {
                entries.push(DirEntry {
                    name: String::from(file_name(sub)),
                    is_dir: true,
                    size: 0,
                });
            }
        }
        for (path, data) in self.files.iter() {
            if parent_of(path) == dir {
                entries.push(DirEntry {
                    name: String::from(file_name(path)),
                    is_dir: false,
                    size: data.len() as u64,
                });
            }
        }
        Ok(entries)
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}
