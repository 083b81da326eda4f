//! Cooperative loop that owns every component and polls them in a fixed
//! order.
//!
//! Per tick: storage, network gate, downloads, NFC session, audio, then
//! the required-files registry at its own low cadence. Events raised by a
//! component are delivered to observers and routed through the
//! orchestrator before the next component runs.

use alloc::{boxed::Box, vec::Vec};

use log::{info, warn};

use crate::{
    audio::{AudioEngine, AudioError, AudioOutput},
    config::{ConfigStore, KeyValueStore},
    download::DownloadEngine,
    event::{Event, EventQueue, Observer, notify},
    figure::FigureTracker,
    net::{GateConfig, HttpClient, LinkStatus, NetworkGate, PowerStatus, ReachabilityProbe},
    nfc::{NfcConfig, NfcReader, NfcSession, ReedSensor},
    orchestrator::{Components, LedSignal, Orchestrator},
    registry::{RECONCILE_INTERVAL_MS, RequiredFilesRegistry},
    storage::{FileSystem, StorageLayer},
};

pub const TICK_INTERVAL_MS: u32 = 10;
pub const DEFAULT_API_ROOT: &str = "http://localhost/api";

/// Concrete collaborator types for one board (or for the host tests).
pub trait Platform {
    type Fs: FileSystem;
    type Kv: KeyValueStore;
    /// Client used for media downloads.
    type Http: HttpClient;
    /// Client used for manifest requests.
    type Api: HttpClient;
    type Reed: ReedSensor;
    type Nfc: NfcReader;
    type Audio: AudioOutput;
    type Link: LinkStatus;
    type Probe: ReachabilityProbe;
    type Power: PowerStatus;
    type Led: LedSignal;
}

pub struct Peripherals<P: Platform> {
    pub fs: P::Fs,
    pub kv: P::Kv,
    pub http: P::Http,
    pub api: P::Api,
    pub reed: P::Reed,
    pub nfc: P::Nfc,
    pub audio: P::Audio,
    pub link: P::Link,
    pub probe: P::Probe,
    pub power: P::Power,
    pub led: P::Led,
}

pub trait Clock {
    fn now_ms(&mut self) -> u64;
    fn delay_ms(&mut self, ms: u32);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceConfig {
    api_root: &'static str,
    tick_interval_ms: u32,
    reconcile_interval_ms: u64,
    nfc: NfcConfig,
    gate: GateConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            api_root: DEFAULT_API_ROOT,
            tick_interval_ms: TICK_INTERVAL_MS,
            reconcile_interval_ms: RECONCILE_INTERVAL_MS,
            nfc: NfcConfig::default(),
            gate: GateConfig::default(),
        }
    }
}

impl DeviceConfig {
    pub const fn with_api_root(mut self, api_root: &'static str) -> Self {
        self.api_root = api_root;
        self
    }

    pub const fn with_tick_interval_ms(mut self, tick_interval_ms: u32) -> Self {
        self.tick_interval_ms = if tick_interval_ms == 0 {
            1
        } else {
            tick_interval_ms
        };
        self
    }

    pub const fn with_reconcile_interval_ms(mut self, reconcile_interval_ms: u64) -> Self {
        self.reconcile_interval_ms = reconcile_interval_ms;
        self
    }

    pub const fn with_nfc(mut self, nfc: NfcConfig) -> Self {
        self.nfc = nfc;
        self
    }

    pub const fn with_gate(mut self, gate: GateConfig) -> Self {
        self.gate = gate;
        self
    }

    pub const fn api_root(&self) -> &'static str {
        self.api_root
    }

    pub const fn tick_interval_ms(&self) -> u32 {
        self.tick_interval_ms
    }
}

pub struct Ticker<P: Platform> {
    pub(crate) config: ConfigStore<P::Kv>,
    pub(crate) storage: StorageLayer<P::Fs>,
    pub(crate) gate: NetworkGate<P::Link, P::Probe, P::Power>,
    pub(crate) downloads: DownloadEngine<P::Http>,
    pub(crate) registry: RequiredFilesRegistry,
    pub(crate) figures: FigureTracker<P::Api>,
    pub(crate) nfc: NfcSession<P::Reed, P::Nfc>,
    pub(crate) audio: AudioEngine<P::Audio>,
    orchestrator: Orchestrator<P::Led>,
    observers: Vec<Box<dyn Observer>>,
    pub(crate) events: EventQueue,
    settings: DeviceConfig,
    ticks: u64,
}

impl<P: Platform> Ticker<P> {
    pub fn new(peripherals: Peripherals<P>, settings: DeviceConfig) -> Self {
        let Peripherals {
            fs,
            kv,
            http,
            api,
            reed,
            nfc,
            audio,
            link,
            probe,
            power,
            led,
        } = peripherals;

        Self {
            config: ConfigStore::new(kv),
            storage: StorageLayer::new(fs),
            gate: NetworkGate::new(link, probe, power, settings.gate),
            downloads: DownloadEngine::new(http),
            registry: RequiredFilesRegistry::new(settings.reconcile_interval_ms),
            figures: FigureTracker::new(api, settings.api_root),
            nfc: NfcSession::new(reed, nfc, settings.nfc),
            audio: AudioEngine::new(audio),
            orchestrator: Orchestrator::new(led),
            observers: Vec::new(),
            events: EventQueue::new(),
            settings,
            ticks: 0,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    pub fn settings(&self) -> DeviceConfig {
        self.settings
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn storage(&self) -> &StorageLayer<P::Fs> {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut StorageLayer<P::Fs> {
        &mut self.storage
    }

    pub fn config_mut(&mut self) -> &mut ConfigStore<P::Kv> {
        &mut self.config
    }

    pub fn downloads(&self) -> &DownloadEngine<P::Http> {
        &self.downloads
    }

    pub fn registry(&self) -> &RequiredFilesRegistry {
        &self.registry
    }

    pub fn figures(&self) -> &FigureTracker<P::Api> {
        &self.figures
    }

    pub fn nfc(&self) -> &NfcSession<P::Reed, P::Nfc> {
        &self.nfc
    }

    pub fn audio(&self) -> &AudioEngine<P::Audio> {
        &self.audio
    }

    pub fn orchestrator(&self) -> &Orchestrator<P::Led> {
        &self.orchestrator
    }

    /// Mount storage, restore durable state and run a first
    /// reconciliation.
    pub fn boot(&mut self, now_ms: u64) {
        if let Err(err) = self.storage.mount(now_ms) {
            warn!("ticker: mount at boot failed err={}", err.as_str());
        }
        self.downloads.load(now_ms, &mut self.config);
        self.registry.load(&mut self.config);
        self.figures.load(&mut self.config);
        self.audio.load(&mut self.config);
        self.registry
            .reconcile(now_ms, &mut self.storage, &mut self.downloads);
        info!("ticker: boot done now_ms={}", now_ms);
        self.dispatch(now_ms);
    }

    pub fn tick(&mut self, now_ms: u64) {
        self.storage.poll(now_ms, &mut self.events);
        self.dispatch(now_ms);

        self.gate.poll(now_ms);
        let gate_open = self.downloads.has_work() && self.gate.ready(now_ms);

        self.downloads.poll(
            now_ms,
            gate_open,
            &mut self.storage,
            &mut self.config,
            &mut self.events,
        );
        self.dispatch(now_ms);

        self.nfc.poll(now_ms, &mut self.events);
        self.dispatch(now_ms);

        let live = self.nfc.live_session();
        self.audio.poll(now_ms, &mut self.storage, live.as_ref());
        self.dispatch(now_ms);

        self.registry
            .poll(now_ms, &mut self.storage, &mut self.downloads);
        self.dispatch(now_ms);

        self.ticks = self.ticks.wrapping_add(1);
    }

    /// Tick until `done` returns true, pacing with `clock`.
    pub fn run_until<C, D>(&mut self, clock: &mut C, mut done: D)
    where
        C: Clock,
        D: FnMut(&Self) -> bool,
    {
        while !done(self) {
            let now_ms = clock.now_ms();
            self.tick(now_ms);
            clock.delay_ms(self.settings.tick_interval_ms);
        }
    }

    pub fn run<C>(&mut self, clock: &mut C) -> !
    where
        C: Clock,
    {
        loop {
            let now_ms = clock.now_ms();
            self.tick(now_ms);
            clock.delay_ms(self.settings.tick_interval_ms);
        }
    }

    pub fn toggle_pause(&mut self, now_ms: u64) -> Result<(), AudioError> {
        self.audio.toggle_pause(now_ms, &mut self.storage)
    }

    pub fn next_track(&mut self, now_ms: u64) -> Result<(), AudioError> {
        let live = self.nfc.live_session();
        self.audio.next(now_ms, &mut self.storage, live.as_ref())
    }

    pub fn prev_track(&mut self, now_ms: u64) -> Result<(), AudioError> {
        let live = self.nfc.live_session();
        self.audio.prev(now_ms, &mut self.storage, live.as_ref())
    }

    pub fn volume_up(&mut self) -> u8 {
        self.audio.volume_up(&mut self.storage)
    }

    pub fn volume_down(&mut self) -> u8 {
        self.audio.volume_down(&mut self.storage)
    }

    pub fn set_volume_ceiling(&mut self, ceiling: u8) {
        self.audio.set_volume_ceiling(ceiling, &mut self.config);
    }

    /// Deliver queued events in order. Events raised while routing are
    /// appended and delivered in the same pass.
    pub(crate) fn dispatch(&mut self, now_ms: u64) {
        loop {
            self.storage.drain_events(&mut self.events);
            let Some(event) = self.events.pop() else {
                break;
            };
            for observer in self.observers.iter_mut() {
                notify(observer.as_mut(), &event);
            }
            self.route(now_ms, &event);
        }
    }

    fn route(&mut self, now_ms: u64, event: &Event) {
        let online = matches!(event, Event::CardRead { .. }) && self.gate.online(now_ms);
        let live = self.nfc.live_session();
        self.orchestrator.route(
            event,
            Components {
                now_ms,
                online,
                live: live.as_ref(),
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
}
