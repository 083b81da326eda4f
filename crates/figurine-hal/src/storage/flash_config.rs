//! Config namespace kept as one checksummed record in a flash region.
//!
//! Layout (little endian):
//!
//! | off | len | field                         |
//! |-----|-----|-------------------------------|
//! | 0   | 4   | magic `FGC1`                  |
//! | 4   | 1   | version                       |
//! | 5   | 3   | reserved                      |
//! | 8   | 4   | payload length                |
//! | 12  | 4   | FNV-1a of the payload         |
//! | 16  | n   | entries: `klen:u8 key vlen:u16 value` |
//!
//! Every mutation that changes a value rewrites the whole record.

use alloc::{collections::BTreeMap, string::String, vec, vec::Vec};
use core::fmt::Debug;

use embedded_storage::{ReadStorage, Storage};
use log::{info, warn};

use figurine_core::config::KeyValueStore;

const CONFIG_MAGIC: u32 = 0x3143_4746; // "FGC1"
const CONFIG_VERSION: u8 = 1;
const HEADER_LEN: usize = 16;
const MAX_KEY_BYTES: usize = u8::MAX as usize;
const MAX_VALUE_BYTES: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlashConfigError<E> {
    Flash(E),
    /// Key or value too long, or the record outgrew the region.
    TooLarge,
}

#[derive(Debug)]
pub struct FlashKeyValueStore<F> {
    flash: F,
    offset: u32,
    region_len: usize,
    entries: BTreeMap<String, Vec<u8>>,
    loaded: bool,
}

impl<F> FlashKeyValueStore<F>
where
    F: Storage,
    F::Error: Debug,
{
    /// `offset`/`region_len` describe the flash window reserved for the
    /// record, usually the last sector of a data partition.
    pub fn new(flash: F, offset: u32, region_len: usize) -> Self {
        Self {
            flash,
            offset,
            region_len,
            entries: BTreeMap::new(),
            loaded: false,
        }
    }

    pub fn release(self) -> F {
        self.flash
    }

    fn ensure_loaded(&mut self) -> Result<(), FlashConfigError<F::Error>> {
        if self.loaded {
            return Ok(());
        }

        let mut header = [0u8; HEADER_LEN];
        self.flash
            .read(self.offset, &mut header)
            .map_err(FlashConfigError::Flash)?;
        self.loaded = true;

        if header.iter().all(|b| *b == 0xFF) {
            info!("config: flash record empty");
            return Ok(());
        }

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != CONFIG_MAGIC || header[4] != CONFIG_VERSION {
            warn!("config: unknown record magic={:#x} version={}", magic, header[4]);
            return Ok(());
        }

        let payload_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;
        if payload_len > self.region_len.saturating_sub(HEADER_LEN) {
            warn!("config: record length out of range len={}", payload_len);
            return Ok(());
        }
        let expected = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);

        let mut payload = vec![0u8; payload_len];
        self.flash
            .read(self.offset + HEADER_LEN as u32, &mut payload)
            .map_err(FlashConfigError::Flash)?;
        if checksum32(&payload) != expected {
            warn!("config: record checksum mismatch, starting empty");
            return Ok(());
        }

        match decode_entries(&payload) {
            Some(entries) => {
                info!("config: loaded keys={}", entries.len());
                self.entries = entries;
            }
            None => warn!("config: record entries malformed, starting empty"),
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<(), FlashConfigError<F::Error>> {
        let mut record = vec![0u8; HEADER_LEN];
        for (key, value) in self.entries.iter() {
            record.push(key.len() as u8);
            record.extend_from_slice(key.as_bytes());
            record.extend_from_slice(&(value.len() as u16).to_le_bytes());
            record.extend_from_slice(value);
        }
        if record.len() > self.region_len {
            return Err(FlashConfigError::TooLarge);
        }

        let payload_len = (record.len() - HEADER_LEN) as u32;
        let checksum = checksum32(&record[HEADER_LEN..]);
        record[0..4].copy_from_slice(&CONFIG_MAGIC.to_le_bytes());
        record[4] = CONFIG_VERSION;
        record[8..12].copy_from_slice(&payload_len.to_le_bytes());
        record[12..16].copy_from_slice(&checksum.to_le_bytes());

        self.flash
            .write(self.offset, &record)
            .map_err(FlashConfigError::Flash)
    }
}

impl<F> KeyValueStore for FlashKeyValueStore<F>
where
    F: Storage,
    F::Error: Debug,
{
    type Error = FlashConfigError<F::Error>;

    fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        self.ensure_loaded()?;
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        if key.len() > MAX_KEY_BYTES || value.len() > MAX_VALUE_BYTES {
            return Err(FlashConfigError::TooLarge);
        }
        self.ensure_loaded()?;
        let previous = self.entries.insert(String::from(key), value.to_vec());
        if previous.as_deref() == Some(value) {
            return Ok(());
        }
        if let Err(err) = self.persist() {
            match previous {
                Some(previous) => self.entries.insert(String::from(key), previous),
                None => self.entries.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), Self::Error> {
        self.ensure_loaded()?;
        let Some(previous) = self.entries.remove(key) else {
            return Ok(());
        };
        if let Err(err) = self.persist() {
            self.entries.insert(String::from(key), previous);
            return Err(err);
        }
        Ok(())
    }

    /// On a failed write the previous entries stay, and a record that was
    /// never loaded is still read on next access.
    fn clear(&mut self) -> Result<(), Self::Error> {
        let previous = core::mem::take(&mut self.entries);
        let was_loaded = core::mem::replace(&mut self.loaded, true);
        if let Err(err) = self.persist() {
            self.entries = previous;
            self.loaded = was_loaded;
            return Err(err);
        }
        Ok(())
    }
}

fn decode_entries(mut payload: &[u8]) -> Option<BTreeMap<String, Vec<u8>>> {
    let mut entries = BTreeMap::new();
    while let Some((&key_len, rest)) = payload.split_first() {
        let key_len = key_len as usize;
        let key = rest.get(..key_len)?;
        let rest = &rest[key_len..];
        let value_len = u16::from_le_bytes([*rest.first()?, *rest.get(1)?]) as usize;
        let value = rest.get(2..2 + value_len)?;
        let key = core::str::from_utf8(key).ok()?;
        entries.insert(String::from(key), value.to_vec());
        payload = &rest[2 + value_len..];
    }
    Some(entries)
}

fn checksum32(bytes: &[u8]) -> u32 {
    let mut hash = 0x811C9DC5u32;
    for b in bytes {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}
