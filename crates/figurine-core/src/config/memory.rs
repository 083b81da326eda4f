use alloc::{collections::BTreeMap, string::String, vec::Vec};

use super::KeyValueStore;

/// RAM-backed namespace used during bring-up and in tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: BTreeMap<String, Vec<u8>>,
    writes: u32,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating operations seen so far.
    pub fn writes(&self) -> u32 {
        self.writes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    type Error = core::convert::Infallible;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        self.entries.insert(String::from(key), value.to_vec());
        self.writes = self.writes.saturating_add(1);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), Self::Error> {
        self.entries.remove(key);
        self.writes = self.writes.saturating_add(1);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), Self::Error> {
        self.entries.clear();
        self.writes = self.writes.saturating_add(1);
        Ok(())
    }
}
