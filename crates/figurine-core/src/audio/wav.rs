//! RIFF/WAVE header walk. Only the `fmt ` and `data` chunks matter; any
//! other chunk is skipped by its declared size.

use crate::storage::{FileSystem, StorageLayer};

use super::{AudioError, PcmFormat};

const RIFF_HEADER_BYTES: u64 = 12;
const CHUNK_HEADER_BYTES: u64 = 8;
const FMT_BODY_BYTES: usize = 16;
const MAX_CHUNKS: usize = 32;
const FORMAT_PCM: u16 = 0x0001;

/// Location of the PCM payload inside a WAV file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WavInfo {
    pub format: PcmFormat,
    pub data_offset: u64,
    pub data_len: u64,
}

impl WavInfo {
    pub const fn data_end(&self) -> u64 {
        self.data_offset + self.data_len
    }
}

pub fn read_header<F>(storage: &mut StorageLayer<F>, path: &str) -> Result<WavInfo, AudioError>
where
    F: FileSystem,
{
    let file_len = storage.size(path).map_err(AudioError::Storage)?;

    let mut riff = [0u8; RIFF_HEADER_BYTES as usize];
    read_exact(storage, path, 0, &mut riff)?;
    if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
        return Err(AudioError::Format);
    }

    let mut offset = RIFF_HEADER_BYTES;
    let mut format = None;
    for _ in 0..MAX_CHUNKS {
        if offset + CHUNK_HEADER_BYTES > file_len {
            break;
        }
        let mut header = [0u8; CHUNK_HEADER_BYTES as usize];
        read_exact(storage, path, offset, &mut header)?;
        let size = u64::from(u32::from_le_bytes([header[4], header[5], header[6], header[7]]));
        let body = offset + CHUNK_HEADER_BYTES;

        match &header[0..4] {
            b"fmt " => {
                if size < FMT_BODY_BYTES as u64 {
                    return Err(AudioError::Format);
                }
                let mut raw = [0u8; FMT_BODY_BYTES];
                read_exact(storage, path, body, &mut raw)?;
                format = Some(parse_fmt(&raw)?);
            }
            b"data" => {
                let format = format.ok_or(AudioError::Format)?;
                return Ok(WavInfo {
                    format,
                    data_offset: body,
                    data_len: size.min(file_len.saturating_sub(body)),
                });
            }
            _ => {}
        }
        // Chunks are word aligned.
        offset = body + size + (size & 1);
    }

    Err(AudioError::Format)
}

fn parse_fmt(raw: &[u8; FMT_BODY_BYTES]) -> Result<PcmFormat, AudioError> {
    let audio_format = u16::from_le_bytes([raw[0], raw[1]]);
    let channels = u16::from_le_bytes([raw[2], raw[3]]);
    let sample_rate = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let bits_per_sample = u16::from_le_bytes([raw[14], raw[15]]);

    if audio_format != FORMAT_PCM {
        return Err(AudioError::Unsupported);
    }
    if channels == 0 || sample_rate == 0 {
        return Err(AudioError::Format);
    }
    if !matches!(bits_per_sample, 8 | 16 | 24 | 32) {
        return Err(AudioError::Unsupported);
    }

    Ok(PcmFormat {
        sample_rate,
        channels,
        bits_per_sample,
    })
}

fn read_exact<F>(
    storage: &mut StorageLayer<F>,
    path: &str,
    offset: u64,
    buf: &mut [u8],
) -> Result<(), AudioError>
where
    F: FileSystem,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = storage
            .read_at(path, offset + filled as u64, &mut buf[filled..])
            .map_err(AudioError::Storage)?;
        if n == 0 {
            return Err(AudioError::Format);
        }
        filled += n;
    }
    Ok(())
}
