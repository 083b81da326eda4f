//! Decoder chain: file source, read-ahead buffer, WAV generator.
//!
//! The chain is owned by the engine while a track is playing and dropped
//! on every pause or stop. Its position is the file offset of the next
//! byte the output has not yet accepted, so a rebuilt chain seeked to that
//! offset continues the stream without gaps or repeats.

use alloc::{string::String, vec, vec::Vec};

use crate::storage::{FileSystem, StorageError, StorageLayer};

use super::{
    AudioError, AudioOutput, PcmFormat,
    wav::{WavInfo, read_header},
};

pub const SOURCE_BUFFER_BYTES: usize = 4_096;
pub const WRITES_PER_PUMP: usize = 4;

#[derive(Debug)]
struct FileSource {
    path: String,
    position: u64,
}

impl FileSource {
    fn read<F>(&mut self, storage: &mut StorageLayer<F>, buf: &mut [u8]) -> Result<usize, StorageError>
    where
        F: FileSystem,
    {
        let n = storage.read_at(&self.path, self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

#[derive(Debug)]
struct BufferedSource {
    file: FileSource,
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl BufferedSource {
    fn new(file: FileSource) -> Self {
        Self {
            file,
            buf: vec![0u8; SOURCE_BUFFER_BYTES],
            start: 0,
            end: 0,
        }
    }

    fn fill_buf<F>(&mut self, storage: &mut StorageLayer<F>) -> Result<&[u8], StorageError>
    where
        F: FileSystem,
    {
        if self.start == self.end {
            self.start = 0;
            self.end = self.file.read(storage, &mut self.buf)?;
        }
        Ok(&self.buf[self.start..self.end])
    }

    fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.end);
    }

    fn position(&self) -> u64 {
        self.file.position - (self.end - self.start) as u64
    }

    fn seek(&mut self, offset: u64) {
        self.file.position = offset;
        self.start = 0;
        self.end = 0;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PumpStatus {
    Playing,
    Eof,
}

#[derive(Debug)]
pub struct WavGenerator {
    info: WavInfo,
    source: BufferedSource,
}

impl WavGenerator {
    /// Parse the header of `path` and position the source at the first
    /// PCM byte.
    pub fn open<F>(storage: &mut StorageLayer<F>, path: &str) -> Result<Self, AudioError>
    where
        F: FileSystem,
    {
        let info = read_header(storage, path)?;
        let mut source = BufferedSource::new(FileSource {
            path: String::from(path),
            position: 0,
        });
        source.seek(info.data_offset);
        Ok(Self { info, source })
    }

    pub fn format(&self) -> PcmFormat {
        self.info.format
    }

    pub fn info(&self) -> WavInfo {
        self.info
    }

    pub fn position(&self) -> u64 {
        self.source.position()
    }

    /// Clamped to the PCM payload.
    pub fn seek(&mut self, offset: u64) {
        let offset = offset.clamp(self.info.data_offset, self.info.data_end());
        self.source.seek(offset);
    }

    /// Feed the output until it stops accepting bytes or the write budget
    /// is spent.
    pub fn pump<F, O>(
        &mut self,
        storage: &mut StorageLayer<F>,
        output: &mut O,
    ) -> Result<PumpStatus, AudioError>
    where
        F: FileSystem,
        O: AudioOutput,
    {
        let data_end = self.info.data_end();
        for _ in 0..WRITES_PER_PUMP {
            let remaining = data_end.saturating_sub(self.source.position());
            if remaining == 0 {
                return Ok(PumpStatus::Eof);
            }

            let chunk = self.source.fill_buf(storage).map_err(AudioError::Storage)?;
            if chunk.is_empty() {
                // File shorter than its data chunk claims.
                return Ok(PumpStatus::Eof);
            }
            let take = chunk.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            let accepted = output
                .write(&chunk[..take])
                .map_err(|_| AudioError::Output)?;
            self.source.consume(accepted);
            if accepted < take {
                break;
            }
        }
        Ok(PumpStatus::Playing)
    }
}
