//! Typed access to the persistent key/value namespace.

mod memory;

use alloc::{string::String, vec::Vec};
use core::fmt::Debug;

use log::warn;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::ErrorKind;

pub use memory::MemoryKeyValueStore;

/// Durable key names. Each component owns a disjoint subset.
pub mod keys {
    pub const SSID: &str = "ssid";
    pub const PASS: &str = "pass";
    pub const DEVICE: &str = "device";
    pub const PIN: &str = "pin";
    pub const JWT: &str = "jwt";
    pub const DOWNLOAD_QUEUE: &str = "dl_queue";
    pub const FILE_LIST: &str = "file_list";
    pub const DOWNLOAD_STATS: &str = "dl_stats";
    pub const VOLUME_CEILING: &str = "volume_ceiling";
    pub const MAX_BRIGHTNESS: &str = "max_brightness";
    pub const FIGURE_MAP: &str = "fig_map";
}

/// Raw persistent key/value backend (NVS partition, flash record, RAM).
pub trait KeyValueStore {
    type Error: Debug;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Self::Error>;
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error>;
    fn remove(&mut self, key: &str) -> Result<(), Self::Error>;

    /// Drop every key of the namespace in one operation.
    fn clear(&mut self) -> Result<(), Self::Error>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigError {
    Closed,
    Backend,
    Decode,
    Encode,
}

impl ConfigError {
    pub const fn kind(self) -> ErrorKind {
        ErrorKind::Storage
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Backend => "backend",
            Self::Decode => "decode",
            Self::Encode => "encode",
        }
    }
}

/// Typed get/put wrapper over a [`KeyValueStore`].
#[derive(Debug)]
pub struct ConfigStore<K> {
    backend: K,
    open: bool,
}

impl<K> ConfigStore<K>
where
    K: KeyValueStore,
{
    pub const fn new(backend: K) -> Self {
        Self {
            backend,
            open: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn close(&mut self) {
        self.open = false;
    }

    pub fn backend(&self) -> &K {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut K {
        &mut self.backend
    }

    pub fn get_bytes(&mut self, key: &str) -> Result<Option<Vec<u8>>, ConfigError> {
        self.ensure_open()?;
        self.backend.get(key).map_err(|err| {
            warn!("config: get failed key={} err={:?}", key, err);
            ConfigError::Backend
        })
    }

    pub fn put_bytes(&mut self, key: &str, value: &[u8]) -> Result<(), ConfigError> {
        self.ensure_open()?;
        self.backend.put(key, value).map_err(|err| {
            warn!(
                "config: put failed key={} len={} err={:?}",
                key,
                value.len(),
                err
            );
            ConfigError::Backend
        })
    }

    pub fn get_u32(&mut self, key: &str) -> Result<Option<u32>, ConfigError> {
        let Some(raw) = self.get_bytes(key)? else {
            return Ok(None);
        };
        let bytes: [u8; 4] = raw.as_slice().try_into().map_err(|_| ConfigError::Decode)?;
        Ok(Some(u32::from_le_bytes(bytes)))
    }

    pub fn put_u32(&mut self, key: &str, value: u32) -> Result<(), ConfigError> {
        self.put_bytes(key, &value.to_le_bytes())
    }

    pub fn get_str(&mut self, key: &str) -> Result<Option<String>, ConfigError> {
        let Some(raw) = self.get_bytes(key)? else {
            return Ok(None);
        };
        String::from_utf8(raw)
            .map(Some)
            .map_err(|_| ConfigError::Decode)
    }

    pub fn put_str(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        self.put_bytes(key, value.as_bytes())
    }

    pub fn get_json<T>(&mut self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        let Some(raw) = self.get_bytes(key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&raw).map(Some).map_err(|err| {
            warn!("config: json decode failed key={} err={}", key, err);
            ConfigError::Decode
        })
    }

    pub fn put_json<T>(&mut self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize + ?Sized,
    {
        let raw = serde_json::to_vec(value).map_err(|_| ConfigError::Encode)?;
        self.put_bytes(key, &raw)
    }

    pub fn remove(&mut self, key: &str) -> Result<(), ConfigError> {
        self.ensure_open()?;
        self.backend.remove(key).map_err(|err| {
            warn!("config: remove failed key={} err={:?}", key, err);
            ConfigError::Backend
        })
    }

    /// Wipe the whole namespace.
    pub fn wipe(&mut self) -> Result<(), ConfigError> {
        self.ensure_open()?;
        self.backend.clear().map_err(|err| {
            warn!("config: wipe failed err={:?}", err);
            ConfigError::Backend
        })
    }

    fn ensure_open(&self) -> Result<(), ConfigError> {
        if self.open {
            Ok(())
        } else {
            Err(ConfigError::Closed)
        }
    }
}
