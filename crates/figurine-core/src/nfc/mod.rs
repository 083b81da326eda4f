//! Reed-switch gated NFC session.
//!
//! A session is the interval during which the reed switch reports a docked
//! figure. Within one session at most one UID is read and reported; the
//! transponder is not polled again until the reed opens and closes.

use core::fmt::{Debug, Write as _};

use log::{debug, info, warn};

use crate::event::{Event, EventQueue};

pub const UID_MIN_BYTES: usize = 4;
pub const UID_MAX_BYTES: usize = 7;
pub const UID_TEXT_BYTES: usize = UID_MAX_BYTES * 3 - 1;

pub const DEBOUNCE_MS: u64 = 50;
pub const READ_INTERVAL_MS: u64 = 100;
pub const READ_TIMEOUT_MS: u32 = 70;
pub const WATCHDOG_MS: u64 = 10_000;

pub type UidBytes = heapless::Vec<u8, UID_MAX_BYTES>;
pub type UidText = heapless::String<UID_TEXT_BYTES>;

/// Canonical UID text: uppercase hex, bytes separated by `-`.
pub fn uid_text(uid: &[u8]) -> UidText {
    let mut text = UidText::new();
    for (index, byte) in uid.iter().take(UID_MAX_BYTES).enumerate() {
        if index > 0 {
            let _ = text.push('-');
        }
        let _ = write!(text, "{:02X}", byte);
    }
    text
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NfcCard {
    pub uid: UidBytes,
    pub uid_text: UidText,
    pub timestamp_ms: u64,
    pub valid: bool,
}

/// Identifies one live session: the UID read in it plus the generation
/// counter bumped on every reed closure.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionHandle {
    uid: UidText,
    generation: u32,
}

impl SessionHandle {
    /// Text longer than a 7-byte UID is cut at the last char boundary that
    /// fits.
    pub fn new(uid: &str, generation: u32) -> Self {
        let mut end = uid.len().min(UID_TEXT_BYTES);
        while !uid.is_char_boundary(end) {
            end -= 1;
        }
        if end < uid.len() {
            warn!("nfc: session uid truncated len={}", uid.len());
        }
        let mut text = UidText::new();
        let _ = text.push_str(&uid[..end]);
        Self {
            uid: text,
            generation,
        }
    }

    pub fn uid(&self) -> &str {
        self.uid.as_str()
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Debounced input of the docking reed switch.
pub trait ReedSensor {
    type Error: Debug;

    fn is_closed(&mut self) -> Result<bool, Self::Error>;
}

/// Passive-target reader (PN532 or similar).
pub trait NfcReader {
    type Error: Debug;

    /// One short passive read. `Ok(None)` when no target answered.
    fn read_passive_uid(&mut self, timeout_ms: u32) -> Result<Option<UidBytes>, Self::Error>;

    /// Silent transport recovery.
    fn reinit(&mut self) -> Result<(), Self::Error>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    ActiveEmpty,
    ActiveRead,
}

impl SessionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ActiveEmpty => "active-empty",
            Self::ActiveRead => "active-read",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NfcConfig {
    debounce_ms: u64,
    read_interval_ms: u64,
    read_timeout_ms: u32,
    watchdog_ms: u64,
}

impl Default for NfcConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEBOUNCE_MS,
            read_interval_ms: READ_INTERVAL_MS,
            read_timeout_ms: READ_TIMEOUT_MS,
            watchdog_ms: WATCHDOG_MS,
        }
    }
}

impl NfcConfig {
    pub const fn with_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.debounce_ms = debounce_ms;
        self
    }

    pub const fn with_read_interval_ms(mut self, read_interval_ms: u64) -> Self {
        self.read_interval_ms = read_interval_ms;
        self
    }

    pub const fn with_read_timeout_ms(mut self, read_timeout_ms: u32) -> Self {
        self.read_timeout_ms = read_timeout_ms;
        self
    }

    pub const fn with_watchdog_ms(mut self, watchdog_ms: u64) -> Self {
        self.watchdog_ms = watchdog_ms;
        self
    }

    /// Read cadence after `failures` consecutive misses.
    pub const fn read_backoff_ms(&self, failures: u32) -> u64 {
        if failures >= 50 {
            500
        } else if failures >= 20 {
            300
        } else if failures >= 10 {
            200
        } else {
            self.read_interval_ms
        }
    }
}

#[derive(Debug)]
pub struct NfcSession<R, N> {
    reed: R,
    reader: N,
    config: NfcConfig,
    state: SessionState,
    raw_closed: bool,
    raw_changed_at_ms: u64,
    stable_closed: bool,
    generation: u32,
    card: Option<NfcCard>,
    consecutive_failures: u32,
    next_read_at_ms: u64,
    last_success_ms: u64,
    reinit_count: u32,
}

impl<R, N> NfcSession<R, N>
where
    R: ReedSensor,
    N: NfcReader,
{
    pub fn new(reed: R, reader: N, config: NfcConfig) -> Self {
        Self {
            reed,
            reader,
            config,
            state: SessionState::Idle,
            raw_closed: false,
            raw_changed_at_ms: 0,
            stable_closed: false,
            generation: 0,
            card: None,
            consecutive_failures: 0,
            next_read_at_ms: 0,
            last_success_ms: 0,
            reinit_count: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn card(&self) -> Option<&NfcCard> {
        self.card.as_ref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reinit_count(&self) -> u32 {
        self.reinit_count
    }

    pub fn reader_mut(&mut self) -> &mut N {
        &mut self.reader
    }

    /// Handle of the live session, once a card has been read in it.
    pub fn live_session(&self) -> Option<SessionHandle> {
        match (&self.card, self.state) {
            (Some(card), SessionState::ActiveRead) if card.valid => Some(SessionHandle {
                uid: card.uid_text.clone(),
                generation: self.generation,
            }),
            _ => None,
        }
    }

    /// Whether `session` is still the live session.
    pub fn owns(&self, session: &SessionHandle) -> bool {
        self.live_session().as_ref() == Some(session)
    }

    pub fn poll(&mut self, now_ms: u64, events: &mut EventQueue) {
        let raw = match self.reed.is_closed() {
            Ok(closed) => closed,
            Err(err) => {
                warn!("nfc: reed read failed err={:?}", err);
                self.raw_closed
            }
        };

        if raw != self.raw_closed {
            self.raw_closed = raw;
            self.raw_changed_at_ms = now_ms;
        }

        if raw != self.stable_closed
            && now_ms.saturating_sub(self.raw_changed_at_ms) >= self.config.debounce_ms
        {
            self.stable_closed = raw;
            if raw {
                self.begin_session(now_ms, events);
            } else {
                self.end_session(events);
            }
        }

        if self.state == SessionState::ActiveEmpty && now_ms >= self.next_read_at_ms {
            self.try_read(now_ms, events);
        }
    }

    fn begin_session(&mut self, now_ms: u64, events: &mut EventQueue) {
        self.generation = self.generation.wrapping_add(1);
        self.state = SessionState::ActiveEmpty;
        self.card = None;
        self.consecutive_failures = 0;
        self.next_read_at_ms = now_ms;
        self.last_success_ms = now_ms;
        info!("nfc: session start generation={}", self.generation);
        events.push(Event::SessionStart {
            generation: self.generation,
        });
    }

    fn end_session(&mut self, events: &mut EventQueue) {
        let previous = self.state;
        let session = self.live_session();
        self.state = SessionState::Idle;
        self.consecutive_failures = 0;
        if let Some(card) = self.card.as_mut() {
            card.valid = false;
        }
        self.card = None;

        info!(
            "nfc: session end generation={} from={}",
            self.generation,
            previous.as_str()
        );
        if let Some(session) = session {
            events.push(Event::SessionEnd { session });
        }
    }

    fn try_read(&mut self, now_ms: u64, events: &mut EventQueue) {
        match self.reader.read_passive_uid(self.config.read_timeout_ms) {
            Ok(Some(uid)) if uid.len() >= UID_MIN_BYTES => {
                let card = NfcCard {
                    uid_text: uid_text(&uid),
                    uid,
                    timestamp_ms: now_ms,
                    valid: true,
                };
                info!(
                    "nfc: card read uid={} generation={}",
                    card.uid_text, self.generation
                );
                let session = SessionHandle {
                    uid: card.uid_text.clone(),
                    generation: self.generation,
                };
                self.state = SessionState::ActiveRead;
                self.consecutive_failures = 0;
                self.last_success_ms = now_ms;
                self.card = Some(card.clone());
                events.push(Event::CardRead { card, session });
                return;
            }
            Ok(Some(uid)) => debug!("nfc: short uid ignored len={}", uid.len()),
            Ok(None) => {}
            Err(err) => debug!("nfc: read failed err={:?}", err),
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.next_read_at_ms = now_ms + self.config.read_backoff_ms(self.consecutive_failures);

        if now_ms.saturating_sub(self.last_success_ms) >= self.config.watchdog_ms {
            warn!(
                "nfc: watchdog reinit failures={} silent_ms={}",
                self.consecutive_failures,
                now_ms.saturating_sub(self.last_success_ms)
            );
            if let Err(err) = self.reader.reinit() {
                warn!("nfc: reinit failed err={:?}", err);
            }
            self.reinit_count = self.reinit_count.saturating_add(1);
            self.consecutive_failures = 0;
            self.last_success_ms = now_ms;
        }
    }
}
