use alloc::vec::Vec;

use super::*;
use crate::{
    audio::PlaybackState,
    config::MemoryKeyValueStore,
    figure::{BundleFailure, Figure, parse_manifest},
    nfc::{NfcCard, UidBytes, uid_text},
    storage::MemoryFileSystem,
    test_support::{FakeHttp, RecordingLed, RecordingOutput, pcm_pattern, wav_bytes},
};

const UID: [u8; 7] = [0x04, 0xAB, 0xCD, 0xEF, 0x12, 0x34, 0x56];
const MANIFEST: &str = r#"{"figure":{"id":7,"name":"Fox","episodes":[{"id":1,"tracks":[
    {"id":100,"audio_url":"http://h/a.wav"},
    {"id":101,"audio_url":"http://h/b.wav"}
]}]}}"#;

struct Harness {
    orchestrator: Orchestrator<RecordingLed>,
    led: RecordingLed,
    api: FakeHttp,
    output: RecordingOutput,
    storage: StorageLayer<MemoryFileSystem>,
    config: ConfigStore<MemoryKeyValueStore>,
    registry: RequiredFilesRegistry,
    downloads: DownloadEngine<FakeHttp>,
    figures: FigureTracker<FakeHttp>,
    audio: AudioEngine<RecordingOutput>,
    events: EventQueue,
}

impl Harness {
    fn new() -> Self {
        let led = RecordingLed::default();
        let api = FakeHttp::default();
        let output = RecordingOutput::default();
        let mut storage = StorageLayer::new(MemoryFileSystem::new());
        storage.mount(0).unwrap();
        Self {
            orchestrator: Orchestrator::new(led.clone()),
            led,
            api: api.clone(),
            output: output.clone(),
            storage,
            config: ConfigStore::new(MemoryKeyValueStore::new()),
            registry: RequiredFilesRegistry::default(),
            downloads: DownloadEngine::new(FakeHttp::default()),
            figures: FigureTracker::new(api, "http://api.local/v1"),
            audio: AudioEngine::new(output),
            events: EventQueue::new(),
        }
    }

    fn route(&mut self, event: &Event, live: Option<&SessionHandle>) {
        self.orchestrator.route(
            event,
            Components {
                now_ms: 0,
                online: true,
                live,
                storage: &mut self.storage,
                config: &mut self.config,
                registry: &mut self.registry,
                downloads: &mut self.downloads,
                figures: &mut self.figures,
                audio: &mut self.audio,
                events: &mut self.events,
            },
        );
    }

    fn write_tracks(&mut self) {
        for path in ["/figures/7/1/100.wav", "/figures/7/1/101.wav"] {
            self.storage
                .write(path, &wav_bytes(8_000, 1, 8, &pcm_pattern(64)))
                .unwrap();
        }
    }
}

fn session(generation: u32) -> SessionHandle {
    SessionHandle::new(uid_text(&UID).as_str(), generation)
}

fn figure() -> Figure {
    parse_manifest(MANIFEST.as_bytes()).unwrap()
}

#[test]
fn card_read_flashes_and_schedules_the_bundle() {
    let mut h = Harness::new();
    h.api.route(
        "http://api.local/v1/units/04-AB-CD-EF-12-34-56",
        MANIFEST.as_bytes(),
    );
    let mut uid = UidBytes::new();
    uid.extend_from_slice(&UID).unwrap();
    let card = NfcCard {
        uid_text: uid_text(&UID),
        uid,
        timestamp_ms: 0,
        valid: true,
    };

    let live = session(1);
    h.route(
        &Event::CardRead {
            card,
            session: live.clone(),
        },
        Some(&live),
    );

    assert_eq!(h.led.patterns(), [LedPattern::NewCard]);
    assert_eq!(h.downloads.pending_len(), 2);
    assert!(h.figures.tracker("04-AB-CD-EF-12-34-56").is_some());
}

#[test]
fn bundle_ready_for_live_session_starts_track_zero() {
    let mut h = Harness::new();
    h.write_tracks();
    let live = session(1);

    h.route(
        &Event::BundleReady {
            session: live.clone(),
            manifest: figure(),
        },
        Some(&live),
    );

    assert_eq!(h.led.patterns(), [LedPattern::Success]);
    assert_eq!(
        h.audio.playlist(),
        ["/figures/7/1/100.wav", "/figures/7/1/101.wav"]
    );
    assert_eq!(h.audio.playlist_index(), Some(0));
    assert_eq!(h.audio.state(), PlaybackState::Playing);
    assert_eq!(h.audio.playlist_owner(), Some(&live));
}

#[test]
fn bundle_ready_after_session_end_is_suppressed() {
    let mut h = Harness::new();
    h.write_tracks();
    let ended = session(1);
    let next = session(2);

    h.route(
        &Event::BundleReady {
            session: ended.clone(),
            manifest: figure(),
        },
        None,
    );
    h.route(
        &Event::BundleReady {
            session: ended,
            manifest: figure(),
        },
        Some(&next),
    );

    assert_eq!(h.orchestrator.suppressed(), 2);
    assert!(!h.audio.has_playlist());
    assert_eq!(h.audio.state(), PlaybackState::Stopped);
    assert!(h.led.patterns().is_empty());
    assert_eq!(h.output.byte_len(), 0);
}

#[test]
fn bundle_failed_signals_failure_without_playing() {
    let mut h = Harness::new();
    let live = session(1);

    h.route(
        &Event::BundleFailed {
            session: live.clone(),
            manifest: None,
            reason: BundleFailure::Absent,
        },
        Some(&live),
    );

    assert_eq!(h.led.patterns(), [LedPattern::Failure]);
    assert!(!h.audio.has_playlist());
}

#[test]
fn session_end_stops_and_clears_the_playlist() {
    let mut h = Harness::new();
    h.write_tracks();
    let live = session(1);
    h.route(
        &Event::BundleReady {
            session: live.clone(),
            manifest: figure(),
        },
        Some(&live),
    );

    h.route(&Event::SessionEnd { session: live }, None);

    assert_eq!(h.audio.state(), PlaybackState::Stopped);
    assert!(!h.audio.has_playlist());
}

#[test]
fn download_results_reach_the_figure_tracker() {
    let mut h = Harness::new();
    h.api.route(
        "http://api.local/v1/units/04-AB-CD-EF-12-34-56",
        MANIFEST.as_bytes(),
    );
    let live = session(1);
    h.figures
        .fetch_manifest(
            &live,
            FetchContext {
                online: true,
                storage: &mut h.storage,
                config: &mut h.config,
                registry: &mut h.registry,
                downloads: &mut h.downloads,
                events: &mut h.events,
            },
        )
        .unwrap();

    for path in ["/figures/7/1/100.wav", "/figures/7/1/101.wav"] {
        let event = Event::DownloadComplete {
            url: alloc::string::String::from("http://h/x.wav"),
            path: alloc::string::String::from(path),
            result: Ok(()),
        };
        h.route(&event, Some(&live));
    }

    let names: Vec<&str> = h.events.drain().map(|event| event.name()).collect();
    assert_eq!(names, ["bundle-ready"]);
}
