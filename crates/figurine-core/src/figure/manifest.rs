//! Bundle manifest as served by `/<api-root>/units/<uid>`.

use alloc::{format, string::String, vec::Vec};

use serde::Deserialize;

use crate::storage::FIGURES_DIR;

const DEFAULT_EXTENSION: &str = "wav";
const MAX_EXTENSION_BYTES: usize = 4;

#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: String,
    pub name: String,
    pub audio_url: String,
    pub local_path: String,
    pub checksum: Option<String>,
    /// Informational only; playback runs to end of file.
    pub duration_seconds: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Episode {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tracks: Vec<Track>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Figure {
    pub id: String,
    pub name: String,
    pub description: String,
    pub episodes: Vec<Episode>,
}

impl Figure {
    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.episodes.iter().flat_map(|episode| episode.tracks.iter())
    }

    pub fn track_count(&self) -> usize {
        self.episodes.iter().map(|episode| episode.tracks.len()).sum()
    }

    /// Local track paths in playback order.
    pub fn playlist(&self) -> Vec<String> {
        self.tracks().map(|track| track.local_path.clone()).collect()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManifestError {
    /// Not JSON, or the expected shape is missing.
    Malformed,
    /// None of `figure`, `data` or `unit` present.
    MissingFigure,
    /// An id cannot be used as a path component.
    BadId,
}

impl ManifestError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::MissingFigure => "missing-figure",
            Self::BadId => "bad-id",
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    figure: Option<RawFigure>,
    data: Option<RawFigure>,
    unit: Option<RawFigure>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Number(value) => format!("{value}"),
            Self::Text(value) => value,
        }
    }
}

#[derive(Deserialize)]
struct RawFigure {
    id: RawId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    episodes: Vec<RawEpisode>,
}

#[derive(Deserialize)]
struct RawEpisode {
    id: RawId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tracks: Vec<RawTrack>,
}

#[derive(Deserialize)]
struct RawTrack {
    id: RawId,
    #[serde(default)]
    name: String,
    audio_url: String,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
}

/// Parse a manifest body. The figure may sit under `figure`, `data` or
/// `unit`; the first present wins.
pub fn parse_manifest(body: &[u8]) -> Result<Figure, ManifestError> {
    let envelope: Envelope = serde_json::from_slice(body).map_err(|_| ManifestError::Malformed)?;
    let raw = envelope
        .figure
        .or(envelope.data)
        .or(envelope.unit)
        .ok_or(ManifestError::MissingFigure)?;

    let figure_id = path_component(raw.id)?;
    let mut episodes = Vec::with_capacity(raw.episodes.len());
    for raw_episode in raw.episodes {
        let episode_id = path_component(raw_episode.id)?;
        let mut tracks = Vec::with_capacity(raw_episode.tracks.len());
        for raw_track in raw_episode.tracks {
            let track_id = path_component(raw_track.id)?;
            let local_path = track_path(
                &figure_id,
                &episode_id,
                &track_id,
                extension_of(&raw_track.audio_url),
            );
            tracks.push(Track {
                id: track_id,
                name: raw_track.name,
                audio_url: raw_track.audio_url,
                local_path,
                checksum: raw_track.checksum.filter(|value| !value.trim().is_empty()),
                duration_seconds: raw_track.duration.unwrap_or(0.0),
            });
        }
        episodes.push(Episode {
            id: episode_id,
            name: raw_episode.name,
            description: raw_episode.description,
            tracks,
        });
    }

    Ok(Figure {
        id: figure_id,
        name: raw.name,
        description: raw.description,
        episodes,
    })
}

pub fn figure_dir(figure_id: &str) -> String {
    format!("{FIGURES_DIR}/{figure_id}")
}

pub fn manifest_path(figure_id: &str) -> String {
    format!("{FIGURES_DIR}/{figure_id}/manifest.json")
}

pub fn track_path(figure_id: &str, episode_id: &str, track_id: &str, extension: &str) -> String {
    format!("{FIGURES_DIR}/{figure_id}/{episode_id}/{track_id}.{extension}")
}

/// Lowercase extension of the URL's last path segment, `wav` when absent.
pub fn extension_of(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next().unwrap_or(path);
    match segment.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_BYTES
                && ext.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) =>
        {
            ext
        }
        _ => DEFAULT_EXTENSION,
    }
}

fn path_component(id: RawId) -> Result<String, ManifestError> {
    let id = id.into_string();
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    if valid { Ok(id) } else { Err(ManifestError::BadId) }
}
