use log::warn;

use crate::config::{ConfigStore, KeyValueStore, keys};

pub const STATS_ENCODED_LEN: usize = 24;
pub const STATS_FLUSH_DEBOUNCE_MS: u64 = 2_000;

/// Durable transfer counters. `total`, `succeeded` and `failed` move on
/// terminal events only; `failed_attempts` counts every failed attempt.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DownloadStats {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub failed_attempts: u32,
    pub bytes: u64,
}

impl DownloadStats {
    pub fn encode(&self) -> [u8; STATS_ENCODED_LEN] {
        let mut out = [0u8; STATS_ENCODED_LEN];
        out[0..4].copy_from_slice(&self.total.to_le_bytes());
        out[4..8].copy_from_slice(&self.succeeded.to_le_bytes());
        out[8..12].copy_from_slice(&self.failed.to_le_bytes());
        out[12..16].copy_from_slice(&self.failed_attempts.to_le_bytes());
        out[16..24].copy_from_slice(&self.bytes.to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != STATS_ENCODED_LEN {
            return None;
        }
        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&raw[16..24]);
        Some(Self {
            total: word(0),
            succeeded: word(4),
            failed: word(8),
            failed_attempts: word(12),
            bytes: u64::from_le_bytes(bytes),
        })
    }
}

/// Debounced persistence of [`DownloadStats`].
#[derive(Debug)]
pub struct StatsSync {
    last_saved: DownloadStats,
    pending: Option<(DownloadStats, u64)>,
}

impl StatsSync {
    pub fn new(initial: DownloadStats) -> Self {
        Self {
            last_saved: initial,
            pending: None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.pending.is_some()
    }

    pub fn track_current(&mut self, current: DownloadStats, now_ms: u64) {
        if current == self.last_saved {
            self.pending = None;
            return;
        }

        match self.pending.as_mut() {
            Some((pending, changed_at_ms)) => {
                if *pending != current {
                    *pending = current;
                    *changed_at_ms = now_ms;
                }
            }
            None => self.pending = Some((current, now_ms)),
        }
    }

    pub fn flush_if_due<K>(&mut self, config: &mut ConfigStore<K>, now_ms: u64)
    where
        K: KeyValueStore,
    {
        let Some((candidate, changed_at_ms)) = self.pending else {
            return;
        };

        if now_ms.saturating_sub(changed_at_ms) < STATS_FLUSH_DEBOUNCE_MS {
            return;
        }

        self.save(config, candidate, now_ms);
    }

    pub fn flush_now<K>(&mut self, config: &mut ConfigStore<K>, current: DownloadStats, now_ms: u64)
    where
        K: KeyValueStore,
    {
        self.save(config, current, now_ms);
    }

    fn save<K>(&mut self, config: &mut ConfigStore<K>, candidate: DownloadStats, now_ms: u64)
    where
        K: KeyValueStore,
    {
        match config.put_bytes(keys::DOWNLOAD_STATS, &candidate.encode()) {
            Ok(()) => {
                self.last_saved = candidate;
                self.pending = None;
            }
            Err(err) => {
                warn!("dl: stats flush failed err={}", err.as_str());
                self.pending = Some((candidate, now_ms));
            }
        }
    }
}
