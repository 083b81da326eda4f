//! Per-figure aggregation of track downloads.
//!
//! A card read resolves to a manifest (from the service, or the copy cached
//! on the card when the service is unreachable). Every track missing
//! locally is registered and scheduled; once each track has either landed
//! or exhausted its retries, exactly one `bundle-ready` or `bundle-failed`
//! is raised for the session that asked.

mod manifest;

use alloc::{collections::BTreeSet, format, string::String, vec::Vec};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::{ConfigStore, KeyValueStore, keys},
    download::{DownloadEngine, DownloadError},
    error::ErrorKind,
    event::{Event, EventQueue},
    net::{HttpClient, TransportError, http::get_to_vec},
    nfc::SessionHandle,
    registry::RequiredFilesRegistry,
    storage::{FileSystem, StorageError, StorageLayer},
};

pub use manifest::{
    Episode, Figure, ManifestError, Track, extension_of, figure_dir, manifest_path, parse_manifest,
    track_path,
};

pub const FIGURE_MAP_CAPACITY: usize = 50;
pub const MANIFEST_TIMEOUT_MS: u32 = 5_000;
pub const MAX_MANIFEST_BYTES: usize = 32 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BundleFailure {
    /// The service has no manifest for this UID.
    Absent,
    /// Manifest fetch failed and no cached copy exists.
    Transport(TransportError),
    Malformed(ManifestError),
    /// Manifest lists no tracks.
    Empty,
    Storage(StorageError),
    /// Some tracks exhausted their retries.
    Incomplete { failed: u32 },
}

impl BundleFailure {
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::Absent | Self::Empty => ErrorKind::Absent,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Malformed(_) => ErrorKind::Integrity,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Incomplete { .. } => ErrorKind::Exhausted,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Transport(_) => "transport",
            Self::Malformed(_) => "malformed",
            Self::Empty => "empty",
            Self::Storage(_) => "storage",
            Self::Incomplete { .. } => "incomplete",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FigureMapEntry {
    pub uid: String,
    #[serde(rename = "figureId")]
    pub figure_id: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FigureDownloadTracker {
    pub session: SessionHandle,
    pub figure_id: String,
    pub figure_name: String,
    pub all_track_paths: BTreeSet<String>,
    waiting: BTreeSet<String>,
    pub ready_count: u32,
    pub failed_count: u32,
    pub total: u32,
    pub completed: bool,
    pub manifest: Figure,
}

impl FigureDownloadTracker {
    pub fn waiting(&self) -> impl Iterator<Item = &str> {
        self.waiting.iter().map(String::as_str)
    }
}

/// Collaborators a manifest fetch needs, borrowed from the ticker.
pub struct FetchContext<'a, F, K, H> {
    pub online: bool,
    pub storage: &'a mut StorageLayer<F>,
    pub config: &'a mut ConfigStore<K>,
    pub registry: &'a mut RequiredFilesRegistry,
    pub downloads: &'a mut DownloadEngine<H>,
    pub events: &'a mut EventQueue,
}

#[derive(Debug)]
pub struct FigureTracker<A> {
    api: A,
    api_root: String,
    trackers: Vec<FigureDownloadTracker>,
    figure_map: Vec<FigureMapEntry>,
}

impl<A> FigureTracker<A>
where
    A: HttpClient,
{
    pub fn new(api: A, api_root: &str) -> Self {
        Self {
            api,
            api_root: String::from(api_root.trim_end_matches('/')),
            trackers: Vec::new(),
            figure_map: Vec::new(),
        }
    }

    pub fn trackers(&self) -> &[FigureDownloadTracker] {
        &self.trackers
    }

    pub fn tracker(&self, uid: &str) -> Option<&FigureDownloadTracker> {
        self.trackers.iter().find(|tracker| tracker.session.uid() == uid)
    }

    pub fn figure_map(&self) -> &[FigureMapEntry] {
        &self.figure_map
    }

    pub fn figure_id_for(&self, uid: &str) -> Option<&str> {
        self.figure_map
            .iter()
            .find(|entry| entry.uid == uid)
            .map(|entry| entry.figure_id.as_str())
    }

    pub fn manifest_url(&self, uid: &str) -> String {
        format!("{}/units/{}", self.api_root, uid)
    }

    pub fn load<K>(&mut self, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        self.figure_map = match config.get_json::<Vec<FigureMapEntry>>(keys::FIGURE_MAP) {
            Ok(Some(mut entries)) => {
                let excess = entries.len().saturating_sub(FIGURE_MAP_CAPACITY);
                entries.drain(..excess);
                entries
            }
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("figure: map load failed err={}", err.as_str());
                Vec::new()
            }
        };
    }

    /// Resolve the manifest for `session` and start tracking its tracks.
    /// Failures are raised as `bundle-failed` and returned.
    pub fn fetch_manifest<F, K, H>(
        &mut self,
        session: &SessionHandle,
        ctx: FetchContext<'_, F, K, H>,
    ) -> Result<(), BundleFailure>
    where
        F: FileSystem,
        K: KeyValueStore,
        H: HttpClient,
    {
        let uid = session.uid();
        let fetched = if ctx.online {
            let url = self.manifest_url(uid);
            info!("figure: fetch manifest uid={} url={}", uid, url);
            get_to_vec(&mut self.api, &url, MANIFEST_TIMEOUT_MS, MAX_MANIFEST_BYTES)
        } else {
            Err(TransportError::Connect)
        };

        let resolved = match fetched {
            Ok(body) => parse_manifest(&body)
                .map_err(BundleFailure::Malformed)
                .map(|figure| {
                    self.cache_manifest(uid, &figure.id, &body, ctx.storage, ctx.config);
                    figure
                }),
            Err(TransportError::Status(404)) => Err(BundleFailure::Absent),
            Err(err) => {
                warn!("figure: manifest fetch failed uid={} err={}", uid, err.as_str());
                self.cached_manifest(uid, ctx.storage)
                    .ok_or(BundleFailure::Transport(err))
            }
        };

        match resolved {
            Ok(figure) => self.start_tracking(session, figure, ctx),
            Err(reason) => {
                warn!("figure: bundle failed uid={} reason={}", uid, reason.as_str());
                ctx.events.push(Event::BundleFailed {
                    session: session.clone(),
                    manifest: None,
                    reason,
                });
                Err(reason)
            }
        }
    }

    /// Track `figure` for `session`, replacing any tracker for the same UID.
    pub fn start_tracking<F, K, H>(
        &mut self,
        session: &SessionHandle,
        figure: Figure,
        ctx: FetchContext<'_, F, K, H>,
    ) -> Result<(), BundleFailure>
    where
        F: FileSystem,
        K: KeyValueStore,
        H: HttpClient,
    {
        self.trackers
            .retain(|tracker| tracker.session.uid() != session.uid());

        if figure.track_count() == 0 {
            ctx.events.push(Event::BundleFailed {
                session: session.clone(),
                manifest: Some(figure),
                reason: BundleFailure::Empty,
            });
            return Err(BundleFailure::Empty);
        }

        let mut all_track_paths = BTreeSet::new();
        let mut waiting = BTreeSet::new();
        for track in figure.tracks() {
            if !all_track_paths.insert(track.local_path.clone()) {
                continue;
            }
            if ctx.storage.exists(&track.local_path) {
                continue;
            }
            let checksum = track.checksum.as_deref();
            ctx.registry
                .add(&track.local_path, &track.audio_url, checksum, ctx.config);
            ctx.downloads
                .enqueue(&track.audio_url, &track.local_path, checksum);
            waiting.insert(track.local_path.clone());
        }

        let total = all_track_paths.len() as u32;
        let ready_count = total - waiting.len() as u32;
        info!(
            "figure: tracking uid={} figure={} total={} ready={}",
            session.uid(),
            figure.id,
            total,
            ready_count
        );

        if waiting.is_empty() {
            ctx.events.push(Event::BundleReady {
                session: session.clone(),
                manifest: figure,
            });
            return Ok(());
        }

        self.trackers.push(FigureDownloadTracker {
            session: session.clone(),
            figure_id: figure.id.clone(),
            figure_name: figure.name.clone(),
            all_track_paths,
            waiting,
            ready_count,
            failed_count: 0,
            total,
            completed: false,
            manifest: figure,
        });
        Ok(())
    }

    /// Feed one `download-complete`. Only success and the terminal
    /// `max-retries` settle a track.
    pub fn on_download_complete(
        &mut self,
        path: &str,
        result: &Result<(), DownloadError>,
        events: &mut EventQueue,
    ) {
        let succeeded = match result {
            Ok(()) => true,
            Err(DownloadError::MaxRetries) => false,
            Err(_) => return,
        };

        for tracker in self.trackers.iter_mut() {
            if !tracker.waiting.remove(path) {
                continue;
            }
            if succeeded {
                tracker.ready_count += 1;
            } else {
                tracker.failed_count += 1;
            }
            debug!(
                "figure: progress uid={} ready={} failed={} total={}",
                tracker.session.uid(),
                tracker.ready_count,
                tracker.failed_count,
                tracker.total
            );
            settle(tracker, events);
        }

        self.trackers.retain(|tracker| !tracker.completed);
    }

    /// Count every waiting track the download engine no longer holds as
    /// failed, then settle the affected trackers. Runs after the queue is
    /// cleared.
    pub fn on_downloads_cancelled<H>(
        &mut self,
        downloads: &DownloadEngine<H>,
        events: &mut EventQueue,
    ) where
        H: HttpClient,
    {
        for tracker in self.trackers.iter_mut() {
            let before = tracker.waiting.len();
            tracker.waiting.retain(|path| downloads.is_scheduled(path));
            let dropped = (before - tracker.waiting.len()) as u32;
            if dropped == 0 {
                continue;
            }
            info!(
                "figure: downloads cancelled uid={} dropped={}",
                tracker.session.uid(),
                dropped
            );
            tracker.failed_count += dropped;
            settle(tracker, events);
        }

        self.trackers.retain(|tracker| !tracker.completed);
    }

    /// Delete every file of the bundle mapped to `uid` and unregister it.
    /// Returns the number of files deleted.
    pub fn delete_bundle<F, K>(
        &mut self,
        uid: &str,
        storage: &mut StorageLayer<F>,
        registry: &mut RequiredFilesRegistry,
        config: &mut ConfigStore<K>,
    ) -> Result<usize, BundleFailure>
    where
        F: FileSystem,
        K: KeyValueStore,
    {
        let figure_id = self
            .figure_id_for(uid)
            .map(String::from)
            .ok_or(BundleFailure::Absent)?;
        self.trackers.retain(|tracker| tracker.session.uid() != uid);

        let dir = figure_dir(&figure_id);
        let deleted = if storage.exists(&dir) {
            delete_tree(&dir, storage, registry, config).map_err(BundleFailure::Storage)?
        } else {
            0
        };

        registry.remove_under(&dir, config);
        self.figure_map.retain(|entry| entry.uid != uid);
        self.persist_map(config);
        info!("figure: bundle deleted uid={} files={}", uid, deleted);
        Ok(deleted)
    }

    fn cache_manifest<F, K>(
        &mut self,
        uid: &str,
        figure_id: &str,
        body: &[u8],
        storage: &mut StorageLayer<F>,
        config: &mut ConfigStore<K>,
    ) where
        F: FileSystem,
        K: KeyValueStore,
    {
        if storage.is_mounted()
            && let Err(err) = storage.write(&manifest_path(figure_id), body)
        {
            warn!("figure: manifest cache failed figure={} err={}", figure_id, err.as_str());
        }
        self.remember(uid, figure_id, config);
    }

    fn cached_manifest<F>(&self, uid: &str, storage: &mut StorageLayer<F>) -> Option<Figure>
    where
        F: FileSystem,
    {
        let figure_id = self.figure_id_for(uid)?;
        let body = storage.read(&manifest_path(figure_id)).ok()?;
        match parse_manifest(&body) {
            Ok(figure) => {
                info!("figure: using cached manifest uid={} figure={}", uid, figure.id);
                Some(figure)
            }
            Err(err) => {
                warn!("figure: cached manifest unusable uid={} err={}", uid, err.as_str());
                None
            }
        }
    }

    fn remember<K>(&mut self, uid: &str, figure_id: &str, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        if self
            .figure_map
            .last()
            .is_some_and(|entry| entry.uid == uid && entry.figure_id == figure_id)
        {
            return;
        }

        self.figure_map.retain(|entry| entry.uid != uid);
        self.figure_map.push(FigureMapEntry {
            uid: String::from(uid),
            figure_id: String::from(figure_id),
        });
        let excess = self.figure_map.len().saturating_sub(FIGURE_MAP_CAPACITY);
        self.figure_map.drain(..excess);
        self.persist_map(config);
    }

    fn persist_map<K>(&self, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        if let Err(err) = config.put_json(keys::FIGURE_MAP, &self.figure_map) {
            warn!("figure: map persist failed err={}", err.as_str());
        }
    }
}

/// Raise the bundle outcome once every track has landed or failed.
fn settle(tracker: &mut FigureDownloadTracker, events: &mut EventQueue) {
    if tracker.ready_count + tracker.failed_count < tracker.total {
        return;
    }
    tracker.completed = true;
    if tracker.failed_count == 0 {
        info!("figure: bundle ready uid={}", tracker.session.uid());
        events.push(Event::BundleReady {
            session: tracker.session.clone(),
            manifest: tracker.manifest.clone(),
        });
    } else {
        warn!(
            "figure: bundle failed uid={} failed={}",
            tracker.session.uid(),
            tracker.failed_count
        );
        events.push(Event::BundleFailed {
            session: tracker.session.clone(),
            manifest: Some(tracker.manifest.clone()),
            reason: BundleFailure::Incomplete {
                failed: tracker.failed_count,
            },
        });
    }
}

fn delete_tree<F, K>(
    dir: &str,
    storage: &mut StorageLayer<F>,
    registry: &mut RequiredFilesRegistry,
    config: &mut ConfigStore<K>,
) -> Result<usize, StorageError>
where
    F: FileSystem,
    K: KeyValueStore,
{
    let mut deleted = 0;
    for entry in storage.list(dir)? {
        let path = format!("{}/{}", dir, entry.name);
        if entry.is_dir {
            deleted += delete_tree(&path, storage, registry, config)?;
        } else if registry.delete_and_unregister(&path, storage, config)? {
            deleted += 1;
        }
    }
    if let Err(err) = storage.remove(dir) {
        warn!("figure: directory kept path={} err={}", dir, err.as_str());
    }
    Ok(deleted)
}
