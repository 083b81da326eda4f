use alloc::{string::String, vec, vec::Vec};

use super::*;
use crate::{
    config::MemoryKeyValueStore,
    storage::{MemoryFileSystem, checksum::crc32},
    test_support::{FakeHttp, Reply, body_with_crc},
};

struct Harness {
    engine: DownloadEngine<FakeHttp>,
    http: FakeHttp,
    storage: StorageLayer<MemoryFileSystem>,
    config: ConfigStore<MemoryKeyValueStore>,
    events: EventQueue,
}

impl Harness {
    fn new() -> Self {
        let http = FakeHttp::default();
        let mut storage = StorageLayer::new(MemoryFileSystem::new());
        storage.mount(0).unwrap();
        Self {
            engine: DownloadEngine::new(http.clone()),
            http,
            storage,
            config: ConfigStore::new(MemoryKeyValueStore::new()),
            events: EventQueue::new(),
        }
    }

    fn poll(&mut self, now_ms: u64, gate_open: bool) {
        self.engine.poll(
            now_ms,
            gate_open,
            &mut self.storage,
            &mut self.config,
            &mut self.events,
        );
    }

    fn completions(&mut self) -> Vec<(String, Result<(), DownloadError>)> {
        self.events
            .drain()
            .filter_map(|event| match event {
                Event::DownloadComplete { path, result, .. } => Some((path, result)),
                _ => None,
            })
            .collect()
    }

    fn persisted_queue(&mut self) -> Vec<DownloadTask> {
        self.config
            .get_json(keys::DOWNLOAD_QUEUE)
            .unwrap()
            .unwrap_or_default()
    }
}

#[test]
fn duplicate_enqueue_is_a_no_op() {
    let mut h = Harness::new();
    assert_eq!(h.engine.enqueue("http://h/a.wav", "/audio/a.wav", None), EnqueueResult::Queued);
    assert_eq!(
        h.engine.enqueue("http://h/a.wav", "/audio/a.wav", Some("1234")),
        EnqueueResult::Duplicate
    );
    assert_eq!(h.engine.enqueue("http://h/a.wav", "/audio/b.wav", None), EnqueueResult::Queued);

    h.poll(0, false);
    assert_eq!(h.engine.queue().len(), 2);
    assert_eq!(
        h.engine.enqueue("http://h/a.wav", "/audio/a.wav", None),
        EnqueueResult::Duplicate
    );
}

#[test]
fn enqueue_is_deferred_and_persisted_on_next_poll() {
    let mut h = Harness::new();
    h.engine.enqueue("http://h/a.wav", "/audio/a.wav", Some("cbf43926"));
    assert!(h.persisted_queue().is_empty());
    assert_eq!(h.engine.pending_len(), 1);

    h.poll(0, false);
    let persisted = h.persisted_queue();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].checksum.as_deref(), Some("cbf43926"));
    assert_eq!(h.engine.pending_len(), 0);
}

#[test]
fn successful_transfer_is_published_atomically() {
    let mut h = Harness::new();
    let body = vec![7u8; 1_024];
    h.http.route("http://h/a.wav", &body);
    let checksum = checksum_hex(crc32(&body));
    h.engine.enqueue("http://h/a.wav", "/figures/7/1/100.wav", Some(&checksum));

    h.poll(0, true);

    assert_eq!(h.completions(), [(String::from("/figures/7/1/100.wav"), Ok(()))]);
    assert_eq!(h.storage.read("/figures/7/1/100.wav").unwrap(), body);
    assert!(!h.storage.exists("/figures/7/1/100.wav.tmp"));
    assert!(h.engine.queue().is_empty());
    assert!(h.persisted_queue().is_empty());

    let stats = h.engine.stats();
    assert_eq!((stats.total, stats.succeeded, stats.bytes), (1, 1, 1_024));
}

#[test]
fn large_body_streams_across_polls_and_reports_progress() {
    let mut h = Harness::new();
    let body = vec![3u8; CHUNK_BYTES * CHUNKS_PER_TICK * 2];
    h.http.route("http://h/big.wav", &body);
    h.engine.enqueue("http://h/big.wav", "/audio/big.wav", None);

    h.poll(0, true);
    assert_eq!(h.engine.in_flight(), Some(("http://h/big.wav", "/audio/big.wav")));
    assert!(!h.storage.exists("/audio/big.wav"));
    assert!(h.storage.exists("/audio/big.wav.tmp"));

    h.poll(10, false);
    h.poll(20, false);
    assert!(h.engine.in_flight().is_none());
    assert_eq!(h.storage.size("/audio/big.wav"), Ok(body.len() as u64));

    let percents: Vec<u8> = h
        .events
        .iter()
        .filter_map(|event| match event {
            Event::DownloadProgress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents.first(), Some(&5));
    assert_eq!(percents.last(), Some(&100));
    assert!(percents.windows(2).all(|pair| pair[0] < pair[1]));
    assert!(percents.iter().all(|percent| percent % PROGRESS_STEP_PERCENT == 0));
}

#[test]
fn gate_closed_means_no_transfer() {
    let mut h = Harness::new();
    h.http.route("http://h/a.wav", b"abc");
    for index in 0..3 {
        let path = alloc::format!("/audio/{index}.wav");
        h.engine.enqueue("http://h/a.wav", &path, None);
    }

    for now in (0..60_000).step_by(10) {
        h.poll(now, false);
    }

    assert!(h.http.requests().is_empty());
    assert!(h.completions().is_empty());
    assert_eq!(h.engine.queue().len(), 3);
}

#[test]
fn existing_file_with_matching_checksum_skips_transport() {
    let mut h = Harness::new();
    h.storage.write("/audio/a.wav", b"123456789").unwrap();
    h.engine.enqueue("http://h/a.wav", "/audio/a.wav", Some("CBF43926"));

    h.poll(0, true);

    assert!(h.http.requests().is_empty());
    assert_eq!(h.completions(), [(String::from("/audio/a.wav"), Ok(()))]);
}

#[test]
fn existing_file_with_wrong_checksum_is_downloaded_again() {
    let mut h = Harness::new();
    h.storage.write("/audio/a.wav", b"stale").unwrap();
    h.http.route("http://h/a.wav", b"123456789");
    h.engine.enqueue("http://h/a.wav", "/audio/a.wav", Some("cbf43926"));

    h.poll(0, true);

    assert_eq!(h.http.request_count("http://h/a.wav"), 1);
    assert_eq!(h.storage.read("/audio/a.wav").unwrap(), b"123456789");
}

#[test]
fn checksum_mismatch_retries_then_recovers() {
    let mut h = Harness::new();
    let bad = body_with_crc(&[1u8; 1_020], 0x0BAD_C0DE);
    let good = body_with_crc(&[2u8; 1_020], 0xDEAD_BEEF);
    for _ in 0..4 {
        h.http.reply("http://h/x.wav", Reply::Body(200, bad.clone()));
    }
    h.http.reply("http://h/x.wav", Reply::Body(200, good.clone()));
    h.engine.enqueue("http://h/x.wav", "/figures/9/1/1.wav", Some("deadbeef"));

    let mut now = 0;
    let mut results = Vec::new();
    while results.len() < 5 && now < 120_000 {
        h.poll(now, true);
        results.extend(h.completions().into_iter().map(|(_, result)| result));
        if results.len() == 4 {
            assert_eq!(h.engine.queue()[0].retry_count, 4);
        }
        now += 1_000;
    }

    assert_eq!(
        results,
        [
            Err(DownloadError::ChecksumMismatch),
            Err(DownloadError::ChecksumMismatch),
            Err(DownloadError::ChecksumMismatch),
            Err(DownloadError::ChecksumMismatch),
            Ok(()),
        ]
    );
    assert_eq!(h.storage.crc32("/figures/9/1/1.wav"), Ok(0xDEAD_BEEF));
    assert!(!h.storage.exists("/figures/9/1/1.wav.tmp"));

    let stats = h.engine.stats();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.failed_attempts, 4);
}

#[test]
fn retries_wait_for_retry_delay() {
    let mut h = Harness::new();
    h.http.reply("http://h/a.wav", Reply::Fail(TransportError::Timeout));
    h.engine.enqueue("http://h/a.wav", "/audio/a.wav", None);

    h.poll(1_000, true);
    h.poll(1_000 + RETRY_DELAY_MS - 1, true);
    assert_eq!(h.http.request_count("http://h/a.wav"), 1);

    h.poll(1_000 + RETRY_DELAY_MS, true);
    assert_eq!(h.http.request_count("http://h/a.wav"), 2);
}

#[test]
fn exhausted_task_is_dropped_with_single_terminal_event() {
    let mut h = Harness::new();
    h.http.reply("http://h/a.wav", Reply::Fail(TransportError::Connect));
    h.engine.enqueue("http://h/a.wav", "/audio/a.wav", None);

    let mut results = Vec::new();
    for attempt in 0..(MAX_RETRY as u64 + 3) {
        h.poll(attempt * RETRY_DELAY_MS, true);
        results.extend(h.completions().into_iter().map(|(_, result)| result));
    }

    let terminal = results
        .iter()
        .filter(|result| **result == Err(DownloadError::MaxRetries))
        .count();
    assert_eq!(terminal, 1);
    assert_eq!(results.len(), MAX_RETRY as usize + 1);
    assert_eq!(h.http.request_count("http://h/a.wav"), MAX_RETRY as usize);
    assert!(h.engine.queue().is_empty());

    let stats = h.engine.stats();
    assert_eq!((stats.total, stats.failed, stats.failed_attempts), (1, 1, 5));
}

#[test]
fn error_status_counts_as_transport_failure() {
    let mut h = Harness::new();
    h.engine.enqueue("http://h/a.wav", "/audio/a.wav", None);
    h.http.reply("http://h/a.wav", Reply::Body(503, Vec::new()));

    h.poll(0, true);

    assert_eq!(
        h.completions(),
        [(
            String::from("/audio/a.wav"),
            Err(DownloadError::Transport(TransportError::Status(503)))
        )]
    );
    assert!(!h.storage.exists("/audio/a.wav.tmp"));
    assert_eq!(h.engine.queue()[0].retry_count, 1);
}

#[test]
fn queue_survives_restart_and_rebases_retry_delay() {
    let mut h = Harness::new();
    h.http.reply("http://h/a.wav", Reply::Fail(TransportError::Timeout));
    h.engine.enqueue("http://h/a.wav", "/audio/a.wav", Some("0badc0de"));
    h.engine.enqueue("http://h/b.wav", "/audio/b.wav", None);
    h.poll(50_000, true);
    h.poll(50_010, false);

    let mut restarted = DownloadEngine::new(h.http.clone());
    restarted.load(0, &mut h.config);

    let queue = restarted.queue();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].url, "http://h/a.wav");
    assert_eq!(queue[0].retry_count, 1);
    assert_eq!(queue[0].checksum.as_deref(), Some("0badc0de"));
    assert_eq!(queue[0].last_attempt_ms, 0);
    assert!(!queue[0].is_due(RETRY_DELAY_MS - 1));
    assert!(queue[0].is_due(RETRY_DELAY_MS));
    assert!(queue[1].is_due(0));
}

#[test]
fn queue_json_ignores_unknown_fields() {
    let mut h = Harness::new();
    h.config
        .put_bytes(
            keys::DOWNLOAD_QUEUE,
            br#"[{"url":"http://h/a.wav","path":"/audio/a.wav","retries":2,"completed":false,"lastAttempt":99,"checksum":"","priority":3}]"#,
        )
        .unwrap();

    h.engine.load(5, &mut h.config);

    let task = &h.engine.queue()[0];
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.last_attempt_ms, 5);
    assert_eq!(task.expected_checksum(), None);
}

#[test]
fn cancel_all_keeps_transfer_in_flight() {
    let mut h = Harness::new();
    h.http.route("http://h/big.wav", &vec![0u8; CHUNK_BYTES * CHUNKS_PER_TICK * 3]);
    h.engine.enqueue("http://h/big.wav", "/audio/big.wav", None);
    h.engine.enqueue("http://h/c.wav", "/audio/c.wav", None);
    h.poll(0, true);
    h.engine.enqueue("http://h/d.wav", "/audio/d.wav", None);

    let dropped = h.engine.cancel_all(&mut h.config);

    assert_eq!(dropped, 2);
    assert_eq!(h.engine.queue().len(), 1);
    for now in [10, 20, 30] {
        h.poll(now, true);
    }
    assert!(h.storage.exists("/audio/big.wav"));
    assert_eq!(h.http.request_count("http://h/c.wav"), 0);
}

#[test]
fn stats_flush_is_debounced() {
    let mut h = Harness::new();
    h.http.route("http://h/a.wav", b"abc");
    h.engine.enqueue("http://h/a.wav", "/audio/a.wav", None);

    h.poll(0, true);
    assert_eq!(h.config.get_bytes(keys::DOWNLOAD_STATS), Ok(None));

    h.poll(STATS_FLUSH_DEBOUNCE_MS, false);
    let raw = h.config.get_bytes(keys::DOWNLOAD_STATS).unwrap().unwrap();
    let stats = DownloadStats::decode(&raw).unwrap();
    assert_eq!((stats.total, stats.succeeded, stats.bytes), (1, 1, 3));
    assert_eq!(raw.len(), STATS_ENCODED_LEN);
}

#[test]
fn stats_layout_is_little_endian() {
    let stats = DownloadStats {
        total: 1,
        succeeded: 2,
        failed: 3,
        failed_attempts: 4,
        bytes: 0x0102_0304_0506_0708,
    };
    let raw = stats.encode();
    assert_eq!(&raw[0..4], &[1, 0, 0, 0]);
    assert_eq!(&raw[12..16], &[4, 0, 0, 0]);
    assert_eq!(&raw[16..24], &[8, 7, 6, 5, 4, 3, 2, 1]);
    assert_eq!(DownloadStats::decode(&raw), Some(stats));
    assert_eq!(DownloadStats::decode(&raw[..20]), None);
}
