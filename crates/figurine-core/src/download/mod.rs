//! Persistent download queue with one transfer in flight.
//!
//! Tasks are attempted in insertion order once the network gate opens.
//! A transfer streams into `<path>.tmp` a bounded number of chunks per
//! poll and is published with a rename once the body is complete and the
//! CRC-32 matches. The queue is rewritten to the config store after every
//! mutation.

mod stats;
mod task;

use alloc::{string::String, vec::Vec};

use log::{debug, error, info, warn};

use crate::{
    config::{ConfigStore, KeyValueStore, keys},
    error::ErrorKind,
    event::{Event, EventQueue},
    net::{HttpClient, TransportError},
    storage::{
        FileSystem, StorageError, StorageLayer,
        checksum::{Crc32, checksum_hex, checksum_matches},
        temp_path_for,
    },
};

pub use stats::{DownloadStats, STATS_ENCODED_LEN, STATS_FLUSH_DEBOUNCE_MS, StatsSync};
pub use task::DownloadTask;

pub const MAX_RETRY: u8 = 5;
pub const RETRY_DELAY_MS: u64 = 10_000;
pub const CHUNK_BYTES: usize = 1_024;
pub const CHUNKS_PER_TICK: usize = 8;
pub const HTTP_TIMEOUT_MS: u32 = 15_000;
pub const PROGRESS_STEP_PERCENT: u8 = 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DownloadError {
    Transport(TransportError),
    Storage(StorageError),
    ChecksumMismatch,
    /// Terminal: the task was dropped from the queue.
    MaxRetries,
}

impl DownloadError {
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Storage(_) => ErrorKind::Storage,
            Self::ChecksumMismatch => ErrorKind::Integrity,
            Self::MaxRetries => ErrorKind::Exhausted,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Storage(_) => "storage",
            Self::ChecksumMismatch => "checksum-mismatch",
            Self::MaxRetries => "max-retries",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::MaxRetries)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnqueueResult {
    Queued,
    Duplicate,
}

#[derive(Debug)]
struct Transfer {
    url: String,
    path: String,
    tmp_path: String,
    received: u64,
    total: Option<u64>,
    last_step: u8,
    crc: Crc32,
}

#[derive(Debug)]
pub struct DownloadEngine<H> {
    http: H,
    queue: Vec<DownloadTask>,
    pending: Vec<DownloadTask>,
    transfer: Option<Transfer>,
    stats: DownloadStats,
    stats_sync: StatsSync,
    transfers_started: u32,
}

impl<H> DownloadEngine<H>
where
    H: HttpClient,
{
    pub fn new(http: H) -> Self {
        Self {
            http,
            queue: Vec::new(),
            pending: Vec::new(),
            transfer: None,
            stats: DownloadStats::default(),
            stats_sync: StatsSync::new(DownloadStats::default()),
            transfers_started: 0,
        }
    }

    pub fn http_mut(&mut self) -> &mut H {
        &mut self.http
    }

    pub fn queue(&self) -> &[DownloadTask] {
        &self.queue
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_work(&self) -> bool {
        !self.queue.is_empty() || !self.pending.is_empty()
    }

    /// Whether a task for `path` is queued, pending or in flight.
    pub fn is_scheduled(&self, path: &str) -> bool {
        self.queue
            .iter()
            .chain(self.pending.iter())
            .any(|task| task.path == path)
    }

    pub fn in_flight(&self) -> Option<(&str, &str)> {
        self.transfer
            .as_ref()
            .map(|transfer| (transfer.url.as_str(), transfer.path.as_str()))
    }

    pub fn stats(&self) -> DownloadStats {
        self.stats
    }

    /// Number of GETs opened so far (diagnostics).
    pub fn transfers_started(&self) -> u32 {
        self.transfers_started
    }

    /// Restore queue and counters. Failed tasks wait a full retry delay
    /// measured from `now_ms`.
    pub fn load<K>(&mut self, now_ms: u64, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        match config.get_json::<Vec<DownloadTask>>(keys::DOWNLOAD_QUEUE) {
            Ok(Some(tasks)) => {
                self.queue = tasks
                    .into_iter()
                    .filter(|task| !task.completed && !task.url.is_empty() && !task.path.is_empty())
                    .map(|mut task| {
                        if task.retry_count > 0 {
                            task.last_attempt_ms = now_ms;
                        }
                        task
                    })
                    .collect();
            }
            Ok(None) => self.queue.clear(),
            Err(err) => {
                warn!("dl: queue load failed err={}", err.as_str());
                self.queue.clear();
            }
        }

        match config.get_bytes(keys::DOWNLOAD_STATS) {
            Ok(Some(raw)) => match DownloadStats::decode(&raw) {
                Some(stats) => self.stats = stats,
                None => warn!("dl: stats record malformed len={}", raw.len()),
            },
            Ok(None) => {}
            Err(err) => warn!("dl: stats load failed err={}", err.as_str()),
        }
        self.stats_sync = StatsSync::new(self.stats);

        info!("dl: loaded queue={} total={}", self.queue.len(), self.stats.total);
    }

    /// Schedule a transfer. Merged into the persistent queue on the next
    /// poll, so callbacks never start a second transfer.
    pub fn enqueue(&mut self, url: &str, path: &str, checksum: Option<&str>) -> EnqueueResult {
        let duplicate = self
            .queue
            .iter()
            .chain(self.pending.iter())
            .any(|task| task.same_target(url, path));
        if duplicate {
            debug!("dl: duplicate url={} path={}", url, path);
            return EnqueueResult::Duplicate;
        }

        self.pending.push(DownloadTask::new(url, path, checksum));
        EnqueueResult::Queued
    }

    /// Drop every queued task except the transfer in flight.
    pub fn cancel_all<K>(&mut self, config: &mut ConfigStore<K>) -> usize
    where
        K: KeyValueStore,
    {
        let before = self.queue.len() + self.pending.len();
        self.pending.clear();
        if let Some(transfer) = self.transfer.as_ref() {
            let (url, path) = (transfer.url.as_str(), transfer.path.as_str());
            self.queue.retain(|task| task.same_target(url, path));
        } else {
            self.queue.clear();
        }
        self.persist_queue(config);

        let dropped = before - self.queue.len();
        info!("dl: cancel all dropped={}", dropped);
        dropped
    }

    pub fn reset_stats<K>(&mut self, now_ms: u64, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        self.stats = DownloadStats::default();
        self.stats_sync.flush_now(config, self.stats, now_ms);
    }

    pub fn poll<F, K>(
        &mut self,
        now_ms: u64,
        gate_open: bool,
        storage: &mut StorageLayer<F>,
        config: &mut ConfigStore<K>,
        events: &mut EventQueue,
    ) where
        F: FileSystem,
        K: KeyValueStore,
    {
        if !self.pending.is_empty() {
            self.queue.append(&mut self.pending);
            self.persist_queue(config);
        }

        if self.transfer.is_some() {
            self.pump(now_ms, storage, config, events);
        } else if storage.is_mounted() && gate_open {
            if let Some(index) = self.queue.iter().position(|task| task.is_eligible(now_ms)) {
                self.attempt(index, now_ms, storage, config, events);
            }
        }

        self.stats_sync.flush_if_due(config, now_ms);
    }

    fn attempt<F, K>(
        &mut self,
        index: usize,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        config: &mut ConfigStore<K>,
        events: &mut EventQueue,
    ) where
        F: FileSystem,
        K: KeyValueStore,
    {
        self.queue[index].last_attempt_ms = now_ms;
        self.persist_queue(config);

        let task = self.queue[index].clone();
        if storage.exists(&task.path) {
            let verified = match task.expected_checksum() {
                None => true,
                Some(expected) => storage.verify(&task.path, expected).unwrap_or(false),
            };
            if verified {
                info!("dl: already present path={}", task.path);
                self.succeed(index, 0, now_ms, config, events);
                return;
            }
        }

        let tmp_path = temp_path_for(&task.path);
        if let Err(err) = storage.remove_if_exists(&tmp_path) {
            warn!("dl: stale tmp removal failed path={} err={}", tmp_path, err.as_str());
        }

        info!(
            "dl: attempt url={} path={} retry={}",
            task.url, task.path, task.retry_count
        );
        self.transfers_started = self.transfers_started.saturating_add(1);
        let head = match self.http.begin_get(&task.url, HTTP_TIMEOUT_MS) {
            Ok(head) if head.is_success() => head,
            Ok(head) => {
                self.http.finish();
                let error = DownloadError::Transport(TransportError::Status(head.status));
                self.fail(index, error, now_ms, config, events);
                return;
            }
            Err(err) => {
                self.fail(index, DownloadError::Transport(err), now_ms, config, events);
                return;
            }
        };

        if let Err(err) = storage.write(&tmp_path, &[]) {
            self.http.finish();
            self.fail(index, DownloadError::Storage(err), now_ms, config, events);
            return;
        }

        self.transfer = Some(Transfer {
            url: task.url,
            path: task.path,
            tmp_path,
            received: 0,
            total: head.content_length,
            last_step: 0,
            crc: Crc32::new(),
        });
        self.pump(now_ms, storage, config, events);
    }

    fn pump<F, K>(
        &mut self,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        config: &mut ConfigStore<K>,
        events: &mut EventQueue,
    ) where
        F: FileSystem,
        K: KeyValueStore,
    {
        let Some(mut transfer) = self.transfer.take() else {
            return;
        };

        let mut buf = [0u8; CHUNK_BYTES];
        for _ in 0..CHUNKS_PER_TICK {
            let read = match self.http.read_body(&mut buf) {
                Ok(read) => read,
                Err(err) => {
                    self.http.finish();
                    self.abort(transfer, DownloadError::Transport(err), now_ms, storage, config, events);
                    return;
                }
            };

            if read == 0 {
                self.http.finish();
                self.publish(transfer, now_ms, storage, config, events);
                return;
            }

            if let Err(err) = storage.append(&transfer.tmp_path, &buf[..read]) {
                self.http.finish();
                self.abort(transfer, DownloadError::Storage(err), now_ms, storage, config, events);
                return;
            }
            transfer.crc.update(&buf[..read]);
            transfer.received += read as u64;
            report_progress(&mut transfer, events);
        }

        self.transfer = Some(transfer);
    }

    fn publish<F, K>(
        &mut self,
        transfer: Transfer,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        config: &mut ConfigStore<K>,
        events: &mut EventQueue,
    ) where
        F: FileSystem,
        K: KeyValueStore,
    {
        if let Some(total) = transfer.total
            && transfer.received != total
        {
            warn!(
                "dl: short body path={} received={} total={}",
                transfer.path, transfer.received, total
            );
            let error = DownloadError::Transport(TransportError::Io);
            self.abort(transfer, error, now_ms, storage, config, events);
            return;
        }

        let index = self.task_index(&transfer.url, &transfer.path);
        let expected = index.and_then(|index| self.queue[index].checksum.clone());
        let actual = transfer.crc.finish();
        if let Some(expected) = expected.as_deref()
            && !checksum_matches(expected, actual)
        {
            warn!(
                "dl: checksum mismatch path={} expected={} actual={}",
                transfer.path,
                expected,
                checksum_hex(actual)
            );
            self.abort(transfer, DownloadError::ChecksumMismatch, now_ms, storage, config, events);
            return;
        }

        let published = storage
            .remove_if_exists(&transfer.path)
            .and_then(|_| storage.rename(&transfer.tmp_path, &transfer.path));
        if let Err(err) = published {
            self.abort(transfer, DownloadError::Storage(err), now_ms, storage, config, events);
            return;
        }

        info!(
            "dl: published path={} bytes={} crc={}",
            transfer.path,
            transfer.received,
            checksum_hex(actual)
        );
        match index {
            Some(index) => self.succeed(index, transfer.received, now_ms, config, events),
            None => {
                self.stats.bytes = self.stats.bytes.saturating_add(transfer.received);
                self.stats_sync.track_current(self.stats, now_ms);
                events.push(Event::DownloadComplete {
                    url: transfer.url,
                    path: transfer.path,
                    result: Ok(()),
                });
            }
        }
    }

    /// Drop the partial file and count the failed attempt.
    fn abort<F, K>(
        &mut self,
        transfer: Transfer,
        error: DownloadError,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        config: &mut ConfigStore<K>,
        events: &mut EventQueue,
    ) where
        F: FileSystem,
        K: KeyValueStore,
    {
        if let Err(err) = storage.remove_if_exists(&transfer.tmp_path) {
            warn!("dl: tmp removal failed path={} err={}", transfer.tmp_path, err.as_str());
        }

        match self.task_index(&transfer.url, &transfer.path) {
            Some(index) => self.fail(index, error, now_ms, config, events),
            None => {
                warn!("dl: attempt failed path={} err={}", transfer.path, error.as_str());
                events.push(Event::DownloadComplete {
                    url: transfer.url,
                    path: transfer.path,
                    result: Err(error),
                });
            }
        }
    }

    fn succeed<K>(
        &mut self,
        index: usize,
        bytes: u64,
        now_ms: u64,
        config: &mut ConfigStore<K>,
        events: &mut EventQueue,
    ) where
        K: KeyValueStore,
    {
        let task = self.queue.remove(index);
        self.persist_queue(config);

        self.stats.total = self.stats.total.saturating_add(1);
        self.stats.succeeded = self.stats.succeeded.saturating_add(1);
        self.stats.bytes = self.stats.bytes.saturating_add(bytes);
        self.stats_sync.track_current(self.stats, now_ms);

        events.push(Event::DownloadComplete {
            url: task.url,
            path: task.path,
            result: Ok(()),
        });
    }

    fn fail<K>(
        &mut self,
        index: usize,
        error: DownloadError,
        now_ms: u64,
        config: &mut ConfigStore<K>,
        events: &mut EventQueue,
    ) where
        K: KeyValueStore,
    {
        let task = &mut self.queue[index];
        task.retry_count = task.retry_count.saturating_add(1);
        self.stats.failed_attempts = self.stats.failed_attempts.saturating_add(1);
        warn!(
            "dl: attempt failed url={} path={} retry={} err={}",
            task.url,
            task.path,
            task.retry_count,
            error.as_str()
        );
        events.push(Event::DownloadComplete {
            url: task.url.clone(),
            path: task.path.clone(),
            result: Err(error),
        });

        if task.is_exhausted() {
            let task = self.queue.remove(index);
            error!("dl: giving up url={} path={}", task.url, task.path);
            self.stats.total = self.stats.total.saturating_add(1);
            self.stats.failed = self.stats.failed.saturating_add(1);
            events.push(Event::DownloadComplete {
                url: task.url,
                path: task.path,
                result: Err(DownloadError::MaxRetries),
            });
        }

        self.persist_queue(config);
        self.stats_sync.track_current(self.stats, now_ms);
    }

    fn task_index(&self, url: &str, path: &str) -> Option<usize> {
        self.queue.iter().position(|task| task.same_target(url, path))
    }

    fn persist_queue<K>(&mut self, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        if let Err(err) = config.put_json(keys::DOWNLOAD_QUEUE, &self.queue) {
            warn!("dl: queue persist failed err={} len={}", err.as_str(), self.queue.len());
        }
    }
}

fn report_progress(transfer: &mut Transfer, events: &mut EventQueue) {
    let Some(total) = transfer.total.filter(|total| *total > 0) else {
        return;
    };
    let percent = (transfer.received.saturating_mul(100) / total).min(100) as u8;
    let step = percent - percent % PROGRESS_STEP_PERCENT;
    if step <= transfer.last_step {
        return;
    }
    transfer.last_step = step;
    events.push(Event::DownloadProgress {
        url: transfer.url.clone(),
        path: transfer.path.clone(),
        percent: step,
        bytes: transfer.received,
        total: transfer.total,
    });
}

#[cfg(test)]
mod tests;
