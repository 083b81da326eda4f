//! Wiring between a card read, the manifest fetch and the playback
//! decision. Cancellation is a predicate checked at delivery time: a bundle
//! that completes for a session that is no longer live is not played.

use log::{debug, info, warn};

use crate::{
    audio::{AudioEngine, AudioOutput},
    config::{ConfigStore, KeyValueStore},
    download::DownloadEngine,
    event::{Event, EventQueue},
    figure::{FetchContext, FigureTracker},
    net::HttpClient,
    nfc::SessionHandle,
    registry::RequiredFilesRegistry,
    storage::{FileSystem, StorageLayer},
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LedPattern {
    /// Short green flash.
    NewCard,
    /// Green pulses.
    Success,
    /// Red pulses.
    Failure,
}

impl LedPattern {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewCard => "new-card",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

pub trait LedSignal {
    fn signal(&mut self, pattern: LedPattern);
}

impl<T> LedSignal for &mut T
where
    T: LedSignal + ?Sized,
{
    fn signal(&mut self, pattern: LedPattern) {
        (**self).signal(pattern);
    }
}

/// Components an event may touch, borrowed from the ticker for one
/// delivery.
pub struct Components<'a, F, K, H, A, O> {
    pub now_ms: u64,
    /// Only evaluated for `card-read`.
    pub online: bool,
    pub live: Option<&'a SessionHandle>,
    pub storage: &'a mut StorageLayer<F>,
    pub config: &'a mut ConfigStore<K>,
    pub registry: &'a mut RequiredFilesRegistry,
    pub downloads: &'a mut DownloadEngine<H>,
    pub figures: &'a mut FigureTracker<A>,
    pub audio: &'a mut AudioEngine<O>,
    pub events: &'a mut EventQueue,
}

#[derive(Debug)]
pub struct Orchestrator<L> {
    led: L,
    suppressed: u32,
}

impl<L> Orchestrator<L>
where
    L: LedSignal,
{
    pub fn new(led: L) -> Self {
        Self { led, suppressed: 0 }
    }

    /// Bundles that completed after their session ended.
    pub fn suppressed(&self) -> u32 {
        self.suppressed
    }

    pub fn route<F, K, H, A, O>(&mut self, event: &Event, cx: Components<'_, F, K, H, A, O>)
    where
        F: FileSystem,
        K: KeyValueStore,
        H: HttpClient,
        A: HttpClient,
        O: AudioOutput,
    {
        match event {
            Event::CardRead { session, .. } => self.card_read(session, cx),
            Event::BundleReady { session, manifest } => {
                if cx.live != Some(session) {
                    self.suppressed = self.suppressed.saturating_add(1);
                    info!(
                        "orchestrator: bundle ready for ended session uid={} generation={}",
                        session.uid(),
                        session.generation()
                    );
                    return;
                }

                self.led.signal(LedPattern::Success);
                cx.audio.set_playlist(manifest.playlist(), session.clone());
                if let Err(err) = cx.audio.start_playlist(cx.now_ms, cx.storage, cx.live) {
                    warn!(
                        "orchestrator: playback failed uid={} err={}",
                        session.uid(),
                        err.as_str()
                    );
                }
            }
            Event::BundleFailed { session, reason, .. } => {
                warn!(
                    "orchestrator: bundle failed uid={} reason={}",
                    session.uid(),
                    reason.as_str()
                );
                self.led.signal(LedPattern::Failure);
            }
            Event::SessionEnd { session } => {
                debug!("orchestrator: session end uid={}", session.uid());
                cx.audio.stop();
                cx.audio.clear_playlist();
            }
            Event::DownloadComplete { path, result, .. } => {
                cx.figures.on_download_complete(path, result, cx.events);
            }
            Event::SessionStart { .. } | Event::DownloadProgress { .. } | Event::FileSystem { .. } => {}
        }
    }

    fn card_read<F, K, H, A, O>(&mut self, session: &SessionHandle, cx: Components<'_, F, K, H, A, O>)
    where
        F: FileSystem,
        K: KeyValueStore,
        H: HttpClient,
        A: HttpClient,
        O: AudioOutput,
    {
        self.led.signal(LedPattern::NewCard);
        let fetched = cx.figures.fetch_manifest(
            session,
            FetchContext {
                online: cx.online,
                storage: cx.storage,
                config: cx.config,
                registry: cx.registry,
                downloads: cx.downloads,
                events: cx.events,
            },
        );
        if let Err(reason) = fetched {
            debug!(
                "orchestrator: manifest unavailable uid={} reason={}",
                session.uid(),
                reason.as_str()
            );
        }
    }
}

#[cfg(test)]
mod tests;
