//! Connectivity shared between the Wi-Fi/ping task and the ticker.
//!
//! The network task owns the radio. It publishes link and address state
//! into a [`ConnectivityHandle`] and answers reachability requests the
//! ticker files through a [`ProbeClient`]. A request is a ticket number;
//! the task pings once per pending ticket and posts the outcome against it.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use embedded_hal::delay::DelayNs;
use heapless::String;
use log::{debug, info, warn};

use figurine_core::{
    config::{ConfigStore, KeyValueStore, keys},
    net::{LinkStatus, ReachabilityProbe},
};

pub const SSID_MAX_BYTES: usize = 32;
pub const PASSWORD_MAX_BYTES: usize = 64;
pub const PROBE_POLL_MS: u32 = 10;

/// Station credentials read from the config namespace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WifiCredentials {
    pub ssid: String<SSID_MAX_BYTES>,
    pub password: String<PASSWORD_MAX_BYTES>,
}

impl WifiCredentials {
    /// `None` when no SSID is provisioned or a value does not fit.
    pub fn load<K: KeyValueStore>(config: &mut ConfigStore<K>) -> Option<Self> {
        let ssid = config.get_str(keys::SSID).ok().flatten()?;
        if ssid.is_empty() {
            return None;
        }
        let password = config.get_str(keys::PASS).ok().flatten().unwrap_or_default();

        let (Ok(ssid), Ok(password)) = (
            String::<SSID_MAX_BYTES>::try_from(ssid.as_str()),
            String::<PASSWORD_MAX_BYTES>::try_from(password.as_str()),
        ) else {
            warn!("wifi: stored credentials too long");
            return None;
        };
        Some(Self { ssid, password })
    }
}

/// One reachability request, numbered from 1.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProbeTicket(u32);

/// Lock-free link state plus the probe request/answer pair.
#[derive(Debug)]
pub struct ConnectivityHandle {
    link_up: AtomicBool,
    has_ipv4: AtomicBool,
    requested: AtomicU32,
    answered: AtomicU32,
    reachable: AtomicBool,
}

impl ConnectivityHandle {
    pub const fn new() -> Self {
        Self {
            link_up: AtomicBool::new(false),
            has_ipv4: AtomicBool::new(false),
            requested: AtomicU32::new(0),
            answered: AtomicU32::new(0),
            reachable: AtomicBool::new(false),
        }
    }

    /// Associated and holding an IPv4 address.
    pub fn online(&self) -> bool {
        self.link_up.load(Ordering::Acquire) && self.has_ipv4.load(Ordering::Acquire)
    }

    /// Network task: station association or DHCP changed.
    pub fn update_link(&self, link_up: bool, has_ipv4: bool) {
        let was_online = self.online();
        self.link_up.store(link_up, Ordering::Release);
        self.has_ipv4.store(link_up && has_ipv4, Ordering::Release);
        let online = self.online();
        if online != was_online {
            info!("wifi: online={} link_up={}", online, link_up);
        }
    }

    pub fn mark_disconnected(&self) {
        self.update_link(false, false);
    }

    /// Network task: the newest ticket still waiting for a ping, if any.
    /// Older unanswered tickets are covered by answering the newest.
    pub fn pending_probe(&self) -> Option<ProbeTicket> {
        let requested = self.requested.load(Ordering::Acquire);
        (requested != self.answered.load(Ordering::Acquire)).then_some(ProbeTicket(requested))
    }

    /// Network task: post the ping outcome for `ticket`.
    pub fn answer_probe(&self, ticket: ProbeTicket, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
        self.answered.store(ticket.0, Ordering::Release);
        debug!("wifi: probe answered ticket={} reachable={}", ticket.0, reachable);
    }

    fn request_probe(&self) -> ProbeTicket {
        let ticket = self.requested.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        ProbeTicket(ticket)
    }

    /// Outcome for `ticket` once the network task has answered it or a
    /// newer request.
    fn probe_outcome(&self, ticket: ProbeTicket) -> Option<bool> {
        let answered = self.answered.load(Ordering::Acquire);
        let covered = answered.wrapping_sub(ticket.0) < u32::MAX / 2;
        covered.then(|| self.reachable.load(Ordering::Acquire))
    }
}

impl Default for ConnectivityHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStatus for &ConnectivityHandle {
    fn link_connected(&mut self) -> bool {
        self.online()
    }
}

/// Ticker side of the probe: files a request and waits, in
/// `PROBE_POLL_MS` steps, for the network task to answer it.
pub struct ProbeClient<'a, D> {
    handle: &'a ConnectivityHandle,
    delay: D,
}

impl<'a, D> ProbeClient<'a, D>
where
    D: DelayNs,
{
    pub fn new(handle: &'a ConnectivityHandle, delay: D) -> Self {
        Self { handle, delay }
    }
}

impl<D> ReachabilityProbe for ProbeClient<'_, D>
where
    D: DelayNs,
{
    fn probe(&mut self, timeout_ms: u32) -> bool {
        if !self.handle.online() {
            return false;
        }

        let ticket = self.handle.request_probe();
        let mut waited_ms = 0;
        loop {
            if let Some(reachable) = self.handle.probe_outcome(ticket) {
                return reachable;
            }
            if waited_ms >= timeout_ms || !self.handle.online() {
                warn!("wifi: probe unanswered ticket={} waited_ms={}", ticket.0, waited_ms);
                return false;
            }
            self.delay.delay_ms(PROBE_POLL_MS);
            waited_ms += PROBE_POLL_MS;
        }
    }
}
