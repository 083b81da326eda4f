//! Hand-written fakes shared by the unit and scenario tests. Each fake is
//! `Clone` over shared state so a test keeps a handle after moving the fake
//! into the component under test.

use alloc::{
    collections::{BTreeMap, VecDeque},
    format,
    rc::Rc,
    string::String,
    vec::Vec,
};
use core::cell::{Cell, RefCell};

use crate::{
    audio::{AudioOutput, PcmFormat},
    config::MemoryKeyValueStore,
    download::DownloadError,
    event::{FsOp, Observer},
    figure::{BundleFailure, Figure},
    net::{HttpClient, LinkStatus, PowerStatus, ReachabilityProbe, ResponseHead, TransportError},
    nfc::{NfcCard, NfcReader, ReedSensor, UidBytes},
    orchestrator::{LedPattern, LedSignal},
    storage::MemoryFileSystem,
    ticker::{Clock, Peripherals, Platform},
};

#[derive(Clone, Debug, Default)]
pub struct FakeReed {
    closed: Rc<Cell<bool>>,
}

impl FakeReed {
    pub fn set_closed(&self, closed: bool) {
        self.closed.set(closed);
    }
}

impl ReedSensor for FakeReed {
    type Error = ();

    fn is_closed(&mut self) -> Result<bool, Self::Error> {
        Ok(self.closed.get())
    }
}

#[derive(Debug, Default)]
struct NfcState {
    uid: Option<UidBytes>,
    reads: u32,
    reinits: u32,
}

#[derive(Clone, Debug, Default)]
pub struct FakeNfcReader {
    state: Rc<RefCell<NfcState>>,
}

impl FakeNfcReader {
    pub fn present(&self, uid: &[u8]) {
        let mut bytes = UidBytes::new();
        let _ = bytes.extend_from_slice(uid);
        self.state.borrow_mut().uid = Some(bytes);
    }

    pub fn remove(&self) {
        self.state.borrow_mut().uid = None;
    }

    pub fn reads(&self) -> u32 {
        self.state.borrow().reads
    }

    pub fn reinits(&self) -> u32 {
        self.state.borrow().reinits
    }
}

impl NfcReader for FakeNfcReader {
    type Error = ();

    fn read_passive_uid(&mut self, _timeout_ms: u32) -> Result<Option<UidBytes>, Self::Error> {
        let mut state = self.state.borrow_mut();
        state.reads += 1;
        Ok(state.uid.clone())
    }

    fn reinit(&mut self) -> Result<(), Self::Error> {
        self.state.borrow_mut().reinits += 1;
        Ok(())
    }
}

/// Shared boolean used for link, reachability and charger state.
#[derive(Clone, Debug)]
pub struct Flag {
    value: Rc<Cell<bool>>,
    reads: Rc<Cell<u32>>,
}

impl Flag {
    pub fn new(value: bool) -> Self {
        Self {
            value: Rc::new(Cell::new(value)),
            reads: Rc::new(Cell::new(0)),
        }
    }

    pub fn set(&self, value: bool) {
        self.value.set(value);
    }

    pub fn reads(&self) -> u32 {
        self.reads.get()
    }

    fn read(&self) -> bool {
        self.reads.set(self.reads.get() + 1);
        self.value.get()
    }
}

impl LinkStatus for Flag {
    fn link_connected(&mut self) -> bool {
        self.read()
    }
}

impl ReachabilityProbe for Flag {
    fn probe(&mut self, _timeout_ms: u32) -> bool {
        self.read()
    }
}

impl PowerStatus for Flag {
    fn is_charging(&mut self) -> bool {
        self.read()
    }
}

#[derive(Clone, Debug)]
pub enum Reply {
    Body(u16, Vec<u8>),
    Fail(TransportError),
}

#[derive(Debug)]
struct HttpState {
    routes: BTreeMap<String, VecDeque<Reply>>,
    requests: Vec<String>,
    open: Option<(Vec<u8>, usize)>,
    read_chunk: usize,
}

/// Routed HTTP fake. Replies queued for a URL are consumed in order; the
/// last one repeats. Unknown URLs answer 404.
#[derive(Clone, Debug)]
pub struct FakeHttp {
    state: Rc<RefCell<HttpState>>,
}

impl Default for FakeHttp {
    fn default() -> Self {
        Self {
            state: Rc::new(RefCell::new(HttpState {
                routes: BTreeMap::new(),
                requests: Vec::new(),
                open: None,
                read_chunk: usize::MAX,
            })),
        }
    }
}

impl FakeHttp {
    pub fn route(&self, url: &str, body: &[u8]) {
        self.reply(url, Reply::Body(200, body.to_vec()));
    }

    pub fn reply(&self, url: &str, reply: Reply) {
        self.state
            .borrow_mut()
            .routes
            .entry(String::from(url))
            .or_default()
            .push_back(reply);
    }

    /// Cap the bytes handed out per `read_body` call.
    pub fn set_read_chunk(&self, bytes: usize) {
        self.state.borrow_mut().read_chunk = bytes;
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.borrow().requests.clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|request| request.as_str() == url)
            .count()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().open.is_some()
    }
}

impl HttpClient for FakeHttp {
    fn begin_get(&mut self, url: &str, _timeout_ms: u32) -> Result<ResponseHead, TransportError> {
        let mut state = self.state.borrow_mut();
        if state.open.is_some() {
            return Err(TransportError::Busy);
        }
        state.requests.push(String::from(url));

        let reply = match state.routes.get_mut(url) {
            Some(replies) if replies.len() > 1 => replies.pop_front(),
            Some(replies) => replies.front().cloned(),
            None => None,
        };
        match reply {
            Some(Reply::Body(status, body)) => {
                let head = ResponseHead {
                    status,
                    content_length: Some(body.len() as u64),
                };
                if head.is_success() {
                    state.open = Some((body, 0));
                }
                Ok(head)
            }
            Some(Reply::Fail(err)) => Err(err),
            None => Ok(ResponseHead {
                status: 404,
                content_length: None,
            }),
        }
    }

    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut state = self.state.borrow_mut();
        let chunk = state.read_chunk;
        let Some((body, cursor)) = state.open.as_mut() else {
            return Err(TransportError::Io);
        };
        let n = buf.len().min(chunk).min(body.len() - *cursor);
        buf[..n].copy_from_slice(&body[*cursor..*cursor + n]);
        *cursor += n;
        Ok(n)
    }

    fn finish(&mut self) {
        self.state.borrow_mut().open = None;
    }
}

#[derive(Debug, Default)]
struct OutputState {
    bytes: Vec<u8>,
    format: Option<PcmFormat>,
    volume: u8,
    credit: Option<usize>,
    stops: u32,
}

/// Sink that records every accepted byte. With credit set it behaves like
/// a DAC FIFO: it accepts at most the credit granted so far.
#[derive(Clone, Debug, Default)]
pub struct RecordingOutput {
    state: Rc<RefCell<OutputState>>,
}

impl RecordingOutput {
    pub fn with_credit(credit: usize) -> Self {
        let output = Self::default();
        output.state.borrow_mut().credit = Some(credit);
        output
    }

    pub fn add_credit(&self, bytes: usize) {
        let mut state = self.state.borrow_mut();
        let credit = state.credit.unwrap_or(0);
        state.credit = Some(credit + bytes);
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.state.borrow().bytes.clone()
    }

    pub fn byte_len(&self) -> usize {
        self.state.borrow().bytes.len()
    }

    pub fn format(&self) -> Option<PcmFormat> {
        self.state.borrow().format
    }

    pub fn volume(&self) -> u8 {
        self.state.borrow().volume
    }

    pub fn stops(&self) -> u32 {
        self.state.borrow().stops
    }
}

impl AudioOutput for RecordingOutput {
    type Error = ();

    fn configure(&mut self, format: PcmFormat) -> Result<(), Self::Error> {
        self.state.borrow_mut().format = Some(format);
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize, Self::Error> {
        let mut state = self.state.borrow_mut();
        let accepted = match state.credit {
            Some(credit) => credit.min(pcm.len()),
            None => pcm.len(),
        };
        if let Some(credit) = state.credit.as_mut() {
            *credit -= accepted;
        }
        state.bytes.extend_from_slice(&pcm[..accepted]);
        Ok(accepted)
    }

    fn set_volume(&mut self, volume: u8) -> Result<(), Self::Error> {
        self.state.borrow_mut().volume = volume;
        Ok(())
    }

    fn stop(&mut self) {
        self.state.borrow_mut().stops += 1;
    }
}

#[derive(Clone, Debug, Default)]
pub struct RecordingLed {
    patterns: Rc<RefCell<Vec<LedPattern>>>,
}

impl RecordingLed {
    pub fn patterns(&self) -> Vec<LedPattern> {
        self.patterns.borrow().clone()
    }
}

impl LedSignal for RecordingLed {
    fn signal(&mut self, pattern: LedPattern) {
        self.patterns.borrow_mut().push(pattern);
    }
}

/// Observer that renders each notification as a short line.
#[derive(Clone, Debug, Default)]
pub struct RecordingObserver {
    lines: Rc<RefCell<Vec<String>>>,
}

impl RecordingObserver {
    pub fn lines(&self) -> Vec<String> {
        self.lines.borrow().clone()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.lines
            .borrow()
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    fn push(&self, line: String) {
        self.lines.borrow_mut().push(line);
    }
}

impl Observer for RecordingObserver {
    fn session_start(&mut self, generation: u32) {
        self.push(format!("session-start {generation}"));
    }

    fn after_nfc_read(&mut self, card: &NfcCard) {
        self.push(format!("card-read {}", card.uid_text));
    }

    fn after_detach_nfc(&mut self) {
        self.push(String::from("session-end"));
    }

    fn figure_download_complete(
        &mut self,
        uid: &str,
        _name: &str,
        success: bool,
        error: Option<&BundleFailure>,
        _manifest: Option<&Figure>,
    ) {
        let reason = error.map(|err| err.as_str()).unwrap_or("none");
        self.push(format!("bundle {uid} success={success} reason={reason}"));
    }

    fn download_complete(
        &mut self,
        _url: &str,
        path: &str,
        success: bool,
        error: Option<DownloadError>,
    ) {
        let reason = error.map(DownloadError::as_str).unwrap_or("none");
        self.push(format!("download {path} success={success} reason={reason}"));
    }

    fn file_system_event(&mut self, op: FsOp, path: &str, success: bool) {
        self.push(format!("fs {} {path} success={success}", op.as_str()));
    }
}

/// Clock advanced only by `delay_ms`.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now_ms: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn now(&self) -> u64 {
        self.now_ms.get()
    }
}

impl Clock for ManualClock {
    fn now_ms(&mut self) -> u64 {
        self.now_ms.get()
    }

    fn delay_ms(&mut self, ms: u32) {
        self.now_ms.set(self.now_ms.get() + u64::from(ms));
    }
}

/// Canonical PCM WAV file around `data`.
pub fn wav_bytes(sample_rate: u32, channels: u16, bits: u16, data: &[u8]) -> Vec<u8> {
    let block_align = channels * (bits / 8);
    let byte_rate = sample_rate * u32::from(block_align);
    let mut out = Vec::with_capacity(44 + data.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data.len() as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

/// Deterministic non-repeating-looking PCM payload.
pub fn pcm_pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8)
        .collect()
}

/// Body whose CRC-32 is `target`, built by appending four forcing bytes.
pub fn body_with_crc(prefix: &[u8], target: u32) -> Vec<u8> {
    use crate::storage::checksum::crc32;

    // CRC-32 is affine over GF(2): solve for the 32-bit suffix bit by bit.
    let base = {
        let mut body = prefix.to_vec();
        body.extend_from_slice(&[0, 0, 0, 0]);
        crc32(&body)
    };
    let mut columns = [0u32; 32];
    for (bit, column) in columns.iter_mut().enumerate() {
        let mut body = prefix.to_vec();
        body.extend_from_slice(&(1u32 << bit).to_le_bytes());
        *column = crc32(&body) ^ base;
    }

    let wanted = base ^ target;
    let mut rows: Vec<(u32, u32)> = columns
        .iter()
        .enumerate()
        .map(|(bit, column)| (*column, 1u32 << bit))
        .collect();
    let mut solution = 0u32;
    let mut residual = wanted;
    for pivot in (0..32).rev() {
        let Some(index) = rows.iter().position(|(value, _)| (value >> pivot) & 1 == 1) else {
            continue;
        };
        let (value, mask) = rows.remove(index);
        for row in rows.iter_mut() {
            if (row.0 >> pivot) & 1 == 1 {
                row.0 ^= value;
                row.1 ^= mask;
            }
        }
        if (residual >> pivot) & 1 == 1 {
            residual ^= value;
            solution ^= mask;
        }
    }

    let mut body = prefix.to_vec();
    body.extend_from_slice(&solution.to_le_bytes());
    body
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Fs = MemoryFileSystem;
    type Kv = MemoryKeyValueStore;
    type Http = FakeHttp;
    type Api = FakeHttp;
    type Reed = FakeReed;
    type Nfc = FakeNfcReader;
    type Audio = RecordingOutput;
    type Link = Flag;
    type Probe = Flag;
    type Power = Flag;
    type Led = RecordingLed;
}

/// Handles kept by a scenario test after the peripherals move into the
/// ticker.
#[derive(Clone, Debug)]
pub struct Rig {
    pub http: FakeHttp,
    pub api: FakeHttp,
    pub reed: FakeReed,
    pub nfc: FakeNfcReader,
    pub audio: RecordingOutput,
    pub link: Flag,
    pub probe: Flag,
    pub power: Flag,
    pub led: RecordingLed,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            http: FakeHttp::default(),
            api: FakeHttp::default(),
            reed: FakeReed::default(),
            nfc: FakeNfcReader::default(),
            audio: RecordingOutput::default(),
            link: Flag::new(true),
            probe: Flag::new(true),
            power: Flag::new(true),
            led: RecordingLed::default(),
        }
    }

    pub fn peripherals(&self, fs: MemoryFileSystem) -> Peripherals<TestPlatform> {
        Peripherals {
            fs,
            kv: MemoryKeyValueStore::new(),
            http: self.http.clone(),
            api: self.api.clone(),
            reed: self.reed.clone(),
            nfc: self.nfc.clone(),
            audio: self.audio.clone(),
            link: self.link.clone(),
            probe: self.probe.clone(),
            power: self.power.clone(),
            led: self.led.clone(),
        }
    }
}
