//! Durable list of files the device must keep locally.

use alloc::{string::String, vec::Vec};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ConfigStore, KeyValueStore, keys},
    download::DownloadEngine,
    net::HttpClient,
    storage::{FileSystem, StorageError, StorageLayer},
};

pub const RECONCILE_INTERVAL_MS: u64 = 300_000;

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct RequiredFile {
    pub path: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl RequiredFile {
    pub fn expected_checksum(&self) -> Option<&str> {
        self.checksum.as_deref().filter(|value| !value.trim().is_empty())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddResult {
    Added,
    AlreadyPresent,
}

#[derive(Debug)]
pub struct RequiredFilesRegistry {
    entries: Vec<RequiredFile>,
    interval_ms: u64,
    last_reconcile_ms: Option<u64>,
}

impl Default for RequiredFilesRegistry {
    fn default() -> Self {
        Self::new(RECONCILE_INTERVAL_MS)
    }
}

impl RequiredFilesRegistry {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            interval_ms,
            last_reconcile_ms: None,
        }
    }

    pub fn entries(&self) -> &[RequiredFile] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|entry| entry.path == path)
    }

    pub fn load<K>(&mut self, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        self.entries = match config.get_json::<Vec<RequiredFile>>(keys::FILE_LIST) {
            Ok(Some(entries)) => entries
                .into_iter()
                .filter(|entry| !entry.path.is_empty() && !entry.url.is_empty())
                .collect(),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("registry: load failed err={}", err.as_str());
                Vec::new()
            }
        };
        info!("registry: loaded entries={}", self.entries.len());
    }

    /// Register `path`. An existing entry for the same path keeps its slot
    /// and picks up the new url and checksum.
    pub fn add<K>(
        &mut self,
        path: &str,
        url: &str,
        checksum: Option<&str>,
        config: &mut ConfigStore<K>,
    ) -> AddResult
    where
        K: KeyValueStore,
    {
        let checksum = checksum.filter(|value| !value.trim().is_empty()).map(String::from);
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.path == path) {
            if entry.url != url || entry.checksum != checksum {
                entry.url = String::from(url);
                entry.checksum = checksum;
                self.persist(config);
            }
            return AddResult::AlreadyPresent;
        }

        self.entries.push(RequiredFile {
            path: String::from(path),
            url: String::from(url),
            checksum,
        });
        self.persist(config);
        debug!("registry: added path={}", path);
        AddResult::Added
    }

    /// Forget `path`. The local file is left alone.
    pub fn remove<K>(&mut self, path: &str, config: &mut ConfigStore<K>) -> bool
    where
        K: KeyValueStore,
    {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.path != path);
        let removed = self.entries.len() != before;
        if removed {
            self.persist(config);
        }
        removed
    }

    /// Forget every entry below `dir`. Returns the number dropped.
    pub fn remove_under<K>(&mut self, dir: &str, config: &mut ConfigStore<K>) -> usize
    where
        K: KeyValueStore,
    {
        let before = self.entries.len();
        self.entries.retain(|entry| {
            !(entry.path.starts_with(dir) && entry.path.as_bytes().get(dir.len()) == Some(&b'/'))
        });
        let removed = before - self.entries.len();
        if removed > 0 {
            self.persist(config);
        }
        removed
    }

    /// Delete the local file and drop its entry. Returns whether a file was
    /// deleted.
    pub fn delete_and_unregister<F, K>(
        &mut self,
        path: &str,
        storage: &mut StorageLayer<F>,
        config: &mut ConfigStore<K>,
    ) -> Result<bool, StorageError>
    where
        F: FileSystem,
        K: KeyValueStore,
    {
        let deleted = storage.remove_if_exists(path)?;
        self.remove(path, config);
        Ok(deleted)
    }

    pub fn missing<F>(&self, storage: &mut StorageLayer<F>) -> Vec<String>
    where
        F: FileSystem,
    {
        self.entries
            .iter()
            .filter(|entry| !storage.exists(&entry.path))
            .map(|entry| entry.path.clone())
            .collect()
    }

    /// Schedule every entry whose file is absent or fails verification.
    /// A corrupt file is deleted first. Returns the number of downloads
    /// scheduled.
    pub fn reconcile<F, H>(
        &mut self,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        downloads: &mut DownloadEngine<H>,
    ) -> usize
    where
        F: FileSystem,
        H: HttpClient,
    {
        self.last_reconcile_ms = Some(now_ms);
        if !storage.is_mounted() {
            debug!("registry: reconcile skipped, storage not mounted");
            return 0;
        }

        let mut scheduled = 0;
        for entry in &self.entries {
            let present = storage.exists(&entry.path);
            let intact = present
                && match entry.expected_checksum() {
                    Some(expected) => storage.verify(&entry.path, expected).unwrap_or(false),
                    None => true,
                };
            if intact {
                continue;
            }

            if present {
                warn!("registry: corrupt file removed path={}", entry.path);
                if let Err(err) = storage.remove(&entry.path) {
                    warn!("registry: remove failed path={} err={}", entry.path, err.as_str());
                }
            }
            downloads.enqueue(&entry.url, &entry.path, entry.expected_checksum());
            scheduled += 1;
        }

        info!(
            "registry: reconcile entries={} scheduled={}",
            self.entries.len(),
            scheduled
        );
        scheduled
    }

    /// Low-cadence reconciliation driven by the ticker.
    pub fn poll<F, H>(
        &mut self,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        downloads: &mut DownloadEngine<H>,
    ) where
        F: FileSystem,
        H: HttpClient,
    {
        let due = match self.last_reconcile_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
            None => true,
        };
        if due {
            self.reconcile(now_ms, storage, downloads);
        }
    }

    fn persist<K>(&self, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        if let Err(err) = config.put_json(keys::FILE_LIST, &self.entries) {
            warn!(
                "registry: persist failed err={} entries={}",
                err.as_str(),
                self.entries.len()
            );
        }
    }
}
