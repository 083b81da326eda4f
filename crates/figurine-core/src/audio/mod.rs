//! Playlist engine with explicit pause/resume positioning.
//!
//! Playback is driven from `poll`; `play` only builds the decoder chain.
//! A playlist is owned by the session that set it, and every advance checks
//! that the owner is still the live session.

mod chain;
mod wav;

use alloc::{string::String, vec::Vec};
use core::fmt::Debug;

use log::{debug, info, warn};

use crate::{
    config::{ConfigStore, KeyValueStore, keys},
    error::ErrorKind,
    nfc::SessionHandle,
    storage::{FileSystem, SOUNDS_DIR, StorageError, StorageLayer},
};

pub use chain::{PumpStatus, SOURCE_BUFFER_BYTES, WRITES_PER_PUMP, WavGenerator};
pub use wav::{WavInfo, read_header};

pub const MIN_VOLUME: u8 = 0;
pub const MAX_VOLUME: u8 = 100;
pub const DEFAULT_VOLUME: u8 = 50;
pub const VOLUME_STEP: u8 = 5;
pub const BEEP_MAX_PUMPS: usize = 256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl PcmFormat {
    pub const fn block_align(&self) -> u32 {
        self.channels as u32 * (self.bits_per_sample as u32 / 8)
    }

    pub const fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.block_align()
    }
}

/// PCM sink (I2S DAC or codec). `write` may accept fewer bytes than
/// offered when its FIFO is full.
pub trait AudioOutput {
    type Error: Debug;

    fn configure(&mut self, format: PcmFormat) -> Result<(), Self::Error>;
    fn write(&mut self, pcm: &[u8]) -> Result<usize, Self::Error>;
    fn set_volume(&mut self, volume: u8) -> Result<(), Self::Error>;
    /// Drop anything still queued.
    fn stop(&mut self);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AudioError {
    NotFound,
    /// Not a `.wav` file, or an encoding the generator cannot stream.
    Unsupported,
    Format,
    Storage(StorageError),
    Output,
    /// Operation illegal in the current playback state.
    State,
    NoPlaylist,
    /// The playlist owner is no longer the live session.
    NotOwner,
}

impl AudioError {
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::NotFound | Self::NoPlaylist => ErrorKind::Absent,
            Self::Unsupported | Self::Format => ErrorKind::Integrity,
            Self::Storage(_) | Self::Output => ErrorKind::Storage,
            Self::State | Self::NotOwner => ErrorKind::State,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::Unsupported => "unsupported",
            Self::Format => "format",
            Self::Storage(_) => "storage",
            Self::Output => "output",
            Self::State => "state",
            Self::NoPlaylist => "no-playlist",
            Self::NotOwner => "not-owner",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Paused => "paused",
        }
    }
}

pub fn beep_path() -> String {
    alloc::format!("{SOUNDS_DIR}/beep.wav")
}

#[derive(Debug)]
pub struct AudioEngine<O> {
    output: O,
    chain: Option<WavGenerator>,
    state: PlaybackState,
    current_path: Option<String>,
    paused_offset: u64,
    track_start_ms: u64,
    accumulated_ms: u64,
    volume: u8,
    volume_ceiling: u8,
    playlist: Vec<String>,
    playlist_index: Option<usize>,
    playlist_owner: Option<SessionHandle>,
    playlist_finished: bool,
}

impl<O> AudioEngine<O>
where
    O: AudioOutput,
{
    pub fn new(output: O) -> Self {
        Self {
            output,
            chain: None,
            state: PlaybackState::Stopped,
            current_path: None,
            paused_offset: 0,
            track_start_ms: 0,
            accumulated_ms: 0,
            volume: DEFAULT_VOLUME,
            volume_ceiling: MAX_VOLUME,
            playlist: Vec::new(),
            playlist_index: None,
            playlist_owner: None,
            playlist_finished: false,
        }
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn current_path(&self) -> Option<&str> {
        self.current_path.as_deref()
    }

    pub fn paused_offset(&self) -> u64 {
        self.paused_offset
    }

    /// File offset of the next byte the output has not accepted.
    pub fn position(&self) -> Option<u64> {
        self.chain.as_ref().map(WavGenerator::position)
    }

    pub fn accumulated_ms(&self) -> u64 {
        self.accumulated_ms
    }

    pub fn accumulated_seconds(&self) -> u64 {
        self.accumulated_ms / 1_000
    }

    pub fn play_ms(&self, now_ms: u64) -> u64 {
        match self.state {
            PlaybackState::Playing => {
                self.accumulated_ms + now_ms.saturating_sub(self.track_start_ms)
            }
            _ => self.accumulated_ms,
        }
    }

    pub fn play_seconds(&self, now_ms: u64) -> u64 {
        self.play_ms(now_ms) / 1_000
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn volume_ceiling(&self) -> u8 {
        self.volume_ceiling
    }

    pub fn playlist(&self) -> &[String] {
        &self.playlist
    }

    pub fn has_playlist(&self) -> bool {
        !self.playlist.is_empty()
    }

    pub fn playlist_index(&self) -> Option<usize> {
        self.playlist_index
    }

    pub fn playlist_owner(&self) -> Option<&SessionHandle> {
        self.playlist_owner.as_ref()
    }

    pub fn playlist_finished(&self) -> bool {
        self.playlist_finished
    }

    /// Restore the durable volume ceiling.
    pub fn load<K>(&mut self, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        match config.get_u32(keys::VOLUME_CEILING) {
            Ok(Some(ceiling)) => {
                self.volume_ceiling = u8::try_from(ceiling).unwrap_or(MAX_VOLUME).min(MAX_VOLUME);
            }
            Ok(None) => {}
            Err(err) => warn!("audio: ceiling load failed err={}", err.as_str()),
        }
        self.volume = self.volume.min(self.volume_ceiling);
        info!(
            "audio: loaded volume={} ceiling={}",
            self.volume, self.volume_ceiling
        );
    }

    pub fn play<F>(
        &mut self,
        path: &str,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
    ) -> Result<(), AudioError>
    where
        F: FileSystem,
    {
        if !is_wav(path) {
            warn!("audio: unsupported path={}", path);
            return Err(AudioError::Unsupported);
        }
        if !storage.exists(path) {
            warn!("audio: missing path={}", path);
            return Err(AudioError::NotFound);
        }

        self.teardown();
        let chain = match self.build_chain(path, storage) {
            Ok(chain) => chain,
            Err(err) => {
                warn!("audio: open failed path={} err={}", path, err.as_str());
                self.stop();
                return Err(err);
            }
        };
        self.chain = Some(chain);
        self.state = PlaybackState::Playing;
        self.current_path = Some(String::from(path));
        self.paused_offset = 0;
        self.track_start_ms = now_ms;
        self.accumulated_ms = 0;
        info!("audio: play path={}", path);
        Ok(())
    }

    pub fn pause(&mut self, now_ms: u64) -> Result<(), AudioError> {
        if self.state != PlaybackState::Playing {
            return Err(AudioError::State);
        }

        self.paused_offset = self.position().unwrap_or(0);
        self.accumulated_ms += now_ms.saturating_sub(self.track_start_ms);
        self.teardown();
        self.state = PlaybackState::Paused;
        info!(
            "audio: pause offset={} played_ms={}",
            self.paused_offset, self.accumulated_ms
        );
        Ok(())
    }

    /// Rebuild the chain, initialize it, then seek to the paused offset.
    pub fn resume<F>(&mut self, now_ms: u64, storage: &mut StorageLayer<F>) -> Result<(), AudioError>
    where
        F: FileSystem,
    {
        if self.state != PlaybackState::Paused {
            return Err(AudioError::State);
        }
        let Some(path) = self.current_path.clone() else {
            return Err(AudioError::State);
        };

        let mut chain = self.build_chain(&path, storage)?;
        chain.seek(self.paused_offset);
        self.chain = Some(chain);
        self.track_start_ms = now_ms;
        self.state = PlaybackState::Playing;
        info!("audio: resume offset={}", self.paused_offset);
        Ok(())
    }

    pub fn toggle_pause<F>(
        &mut self,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
    ) -> Result<(), AudioError>
    where
        F: FileSystem,
    {
        match self.state {
            PlaybackState::Playing => self.pause(now_ms),
            PlaybackState::Paused => self.resume(now_ms, storage),
            PlaybackState::Stopped => Err(AudioError::State),
        }
    }

    /// Tear down the chain and clear per-track state. Volume and the
    /// playlist survive.
    pub fn stop(&mut self) {
        if self.state != PlaybackState::Stopped {
            info!("audio: stop path={:?}", self.current_path);
        }
        self.teardown();
        self.state = PlaybackState::Stopped;
        self.current_path = None;
        self.paused_offset = 0;
        self.track_start_ms = 0;
        self.accumulated_ms = 0;
    }

    pub fn set_volume<F>(&mut self, volume: u8, storage: &mut StorageLayer<F>) -> u8
    where
        F: FileSystem,
    {
        let volume = volume.clamp(MIN_VOLUME, self.volume_ceiling);
        if volume == self.volume {
            return volume;
        }

        self.volume = volume;
        if let Err(err) = self.output.set_volume(volume) {
            warn!("audio: set volume failed err={:?}", err);
        }
        debug!("audio: volume={}", volume);
        if self.state == PlaybackState::Stopped {
            self.beep(storage);
        }
        volume
    }

    pub fn volume_up<F>(&mut self, storage: &mut StorageLayer<F>) -> u8
    where
        F: FileSystem,
    {
        self.set_volume(self.volume.saturating_add(VOLUME_STEP), storage)
    }

    pub fn volume_down<F>(&mut self, storage: &mut StorageLayer<F>) -> u8
    where
        F: FileSystem,
    {
        self.set_volume(self.volume.saturating_sub(VOLUME_STEP), storage)
    }

    /// Persist a new ceiling and pull the current volume under it.
    pub fn set_volume_ceiling<K>(&mut self, ceiling: u8, config: &mut ConfigStore<K>)
    where
        K: KeyValueStore,
    {
        self.volume_ceiling = ceiling.min(MAX_VOLUME);
        if let Err(err) = config.put_u32(keys::VOLUME_CEILING, u32::from(self.volume_ceiling)) {
            warn!("audio: ceiling persist failed err={}", err.as_str());
        }
        if self.volume > self.volume_ceiling {
            self.volume = self.volume_ceiling;
            if let Err(err) = self.output.set_volume(self.volume) {
                warn!("audio: set volume failed err={:?}", err);
            }
        }
    }

    /// Replace the playlist. Playback starts with `start_playlist`.
    pub fn set_playlist(&mut self, paths: Vec<String>, owner: SessionHandle) {
        info!(
            "audio: playlist set uid={} tracks={}",
            owner.uid(),
            paths.len()
        );
        self.playlist = paths;
        self.playlist_index = None;
        self.playlist_owner = Some(owner);
        self.playlist_finished = false;
    }

    pub fn clear_playlist(&mut self) {
        if self.has_playlist() {
            debug!("audio: playlist cleared");
        }
        self.playlist.clear();
        self.playlist_index = None;
        self.playlist_owner = None;
        self.playlist_finished = false;
    }

    /// Play track zero.
    pub fn start_playlist<F>(
        &mut self,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        live: Option<&SessionHandle>,
    ) -> Result<(), AudioError>
    where
        F: FileSystem,
    {
        self.playlist_index = None;
        self.playlist_finished = false;
        self.next(now_ms, storage, live)
    }

    /// Advance one track. Past the end the playlist is marked finished and
    /// playback stays stopped.
    pub fn next<F>(
        &mut self,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        live: Option<&SessionHandle>,
    ) -> Result<(), AudioError>
    where
        F: FileSystem,
    {
        self.ensure_owner(live)?;
        let index = self.playlist_index.map_or(0, |index| index + 1);
        if index >= self.playlist.len() {
            self.stop();
            self.playlist_finished = true;
            info!("audio: playlist finished tracks={}", self.playlist.len());
            return Ok(());
        }
        self.play_index(index, now_ms, storage)
    }

    /// Step back one track; at track zero, restart it.
    pub fn prev<F>(
        &mut self,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        live: Option<&SessionHandle>,
    ) -> Result<(), AudioError>
    where
        F: FileSystem,
    {
        self.ensure_owner(live)?;
        let index = self
            .playlist_index
            .map_or(0, |index| index.min(self.playlist.len() - 1).saturating_sub(1));
        self.playlist_finished = false;
        self.play_index(index, now_ms, storage)
    }

    /// Drive decoding; on end of track, auto-advance through the playlist.
    pub fn poll<F>(
        &mut self,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        live: Option<&SessionHandle>,
    ) where
        F: FileSystem,
    {
        if self.state != PlaybackState::Playing {
            return;
        }
        let Some(chain) = self.chain.as_mut() else {
            return;
        };

        match chain.pump(storage, &mut self.output) {
            Ok(PumpStatus::Playing) => {}
            Ok(PumpStatus::Eof) => {
                debug!("audio: eof path={:?}", self.current_path);
                self.stop();
                if self.has_playlist() && !self.playlist_finished {
                    self.advance(now_ms, storage, live);
                }
            }
            Err(err) => {
                warn!("audio: decode failed err={}", err.as_str());
                self.stop();
            }
        }
    }

    fn play_index<F>(
        &mut self,
        index: usize,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
    ) -> Result<(), AudioError>
    where
        F: FileSystem,
    {
        let Some(path) = self.playlist.get(index).cloned() else {
            return Err(AudioError::NoPlaylist);
        };
        self.playlist_index = Some(index);
        debug!("audio: playlist index={} path={}", index, path);
        let result = self.play(&path, now_ms, storage);
        if result.is_err() {
            self.stop();
        }
        result
    }

    /// Auto-advance, skipping tracks that fail to open. The index stays on
    /// a failed track, so each retry moves one further.
    fn advance<F>(
        &mut self,
        now_ms: u64,
        storage: &mut StorageLayer<F>,
        live: Option<&SessionHandle>,
    ) where
        F: FileSystem,
    {
        while let Err(err) = self.next(now_ms, storage, live) {
            warn!("audio: advance failed err={}", err.as_str());
            if !self.has_playlist() {
                break;
            }
        }
    }

    fn ensure_owner(&mut self, live: Option<&SessionHandle>) -> Result<(), AudioError> {
        if !self.has_playlist() {
            return Err(AudioError::NoPlaylist);
        }
        let owned = match (self.playlist_owner.as_ref(), live) {
            (Some(owner), Some(live)) => owner == live,
            _ => false,
        };
        if owned {
            return Ok(());
        }

        info!("audio: playlist owner gone, clearing");
        self.stop();
        self.clear_playlist();
        Err(AudioError::NotOwner)
    }

    fn build_chain<F>(
        &mut self,
        path: &str,
        storage: &mut StorageLayer<F>,
    ) -> Result<WavGenerator, AudioError>
    where
        F: FileSystem,
    {
        let chain = WavGenerator::open(storage, path)?;
        self.output
            .configure(chain.format())
            .map_err(|_| AudioError::Output)?;
        if let Err(err) = self.output.set_volume(self.volume) {
            warn!("audio: set volume failed err={:?}", err);
        }
        Ok(chain)
    }

    fn teardown(&mut self) {
        if self.chain.take().is_some() {
            self.output.stop();
        }
    }

    /// Feedback tone, played to completion before returning.
    fn beep<F>(&mut self, storage: &mut StorageLayer<F>)
    where
        F: FileSystem,
    {
        let path = beep_path();
        if !storage.exists(&path) {
            debug!("audio: no beep at path={}", path);
            return;
        }
        let mut chain = match self.build_chain(&path, storage) {
            Ok(chain) => chain,
            Err(err) => {
                warn!("audio: beep failed err={}", err.as_str());
                return;
            }
        };
        for _ in 0..BEEP_MAX_PUMPS {
            match chain.pump(storage, &mut self.output) {
                Ok(PumpStatus::Playing) => {}
                Ok(PumpStatus::Eof) => break,
                Err(err) => {
                    warn!("audio: beep failed err={}", err.as_str());
                    break;
                }
            }
        }
        self.output.stop();
    }
}

fn is_wav(path: &str) -> bool {
    path.rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("wav"))
}
