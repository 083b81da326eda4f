//! Network gate: "is the WAN reachable and are we allowed to download".

pub mod http;

use log::{debug, info};

pub use http::{HttpClient, ResponseHead, TransportError};

pub const REACH_TTL_MS: u64 = 60_000;
pub const PROBE_TIMEOUT_MS: u32 = 5_000;

/// Link-layer association state (Wi-Fi associated with an address).
pub trait LinkStatus {
    fn link_connected(&mut self) -> bool;
}

/// Lightweight reachability probe to a fixed external endpoint.
pub trait ReachabilityProbe {
    fn probe(&mut self, timeout_ms: u32) -> bool;
}

/// Battery subsystem charge state.
pub trait PowerStatus {
    fn is_charging(&mut self) -> bool;
}

impl<T: LinkStatus + ?Sized> LinkStatus for &mut T {
    fn link_connected(&mut self) -> bool {
        (**self).link_connected()
    }
}

impl<T: ReachabilityProbe + ?Sized> ReachabilityProbe for &mut T {
    fn probe(&mut self, timeout_ms: u32) -> bool {
        (**self).probe(timeout_ms)
    }
}

impl<T: PowerStatus + ?Sized> PowerStatus for &mut T {
    fn is_charging(&mut self) -> bool {
        (**self).is_charging()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GateConfig {
    reach_ttl_ms: u64,
    probe_timeout_ms: u32,
    require_charging: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            reach_ttl_ms: REACH_TTL_MS,
            probe_timeout_ms: PROBE_TIMEOUT_MS,
            require_charging: true,
        }
    }
}

impl GateConfig {
    pub const fn with_reach_ttl_ms(mut self, reach_ttl_ms: u64) -> Self {
        self.reach_ttl_ms = reach_ttl_ms;
        self
    }

    pub const fn with_probe_timeout_ms(mut self, probe_timeout_ms: u32) -> Self {
        self.probe_timeout_ms = probe_timeout_ms;
        self
    }

    pub const fn with_require_charging(mut self, require_charging: bool) -> Self {
        self.require_charging = require_charging;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ProbeResult {
    at_ms: u64,
    reachable: bool,
}

#[derive(Debug)]
pub struct NetworkGate<L, P, B> {
    link: L,
    probe: P,
    power: B,
    config: GateConfig,
    last_probe: Option<ProbeResult>,
    last_ready: bool,
    probes_issued: u32,
}

impl<L, P, B> NetworkGate<L, P, B>
where
    L: LinkStatus,
    P: ReachabilityProbe,
    B: PowerStatus,
{
    pub fn new(link: L, probe: P, power: B, config: GateConfig) -> Self {
        Self {
            link,
            probe,
            power,
            config,
            last_probe: None,
            last_ready: false,
            probes_issued: 0,
        }
    }

    pub fn probes_issued(&self) -> u32 {
        self.probes_issued
    }

    /// Refresh the reachability cache when it went stale.
    pub fn poll(&mut self, now_ms: u64) {
        if !self.link.link_connected() {
            self.last_probe = None;
            self.note_ready(false);
            return;
        }
        if self.cache_stale(now_ms) {
            self.run_probe(now_ms);
        }
        let ready = self.evaluate(now_ms);
        self.note_ready(ready);
    }

    /// Downloads may proceed: link up, reachable within TTL, and (by
    /// policy) on external power.
    pub fn ready(&mut self, now_ms: u64) -> bool {
        let ready = self.evaluate(now_ms);
        self.note_ready(ready);
        ready
    }

    /// Link up and reachable; ignores the charging policy.
    pub fn online(&mut self, now_ms: u64) -> bool {
        if !self.link.link_connected() {
            return false;
        }
        if self.cache_stale(now_ms) {
            self.run_probe(now_ms);
        }
        self.last_probe.is_some_and(|probe| probe.reachable)
    }

    fn evaluate(&mut self, now_ms: u64) -> bool {
        if self.config.require_charging && !self.power.is_charging() {
            return false;
        }
        self.online(now_ms)
    }

    fn cache_stale(&self, now_ms: u64) -> bool {
        match self.last_probe {
            Some(probe) => now_ms.saturating_sub(probe.at_ms) >= self.config.reach_ttl_ms,
            None => true,
        }
    }

    fn run_probe(&mut self, now_ms: u64) {
        let reachable = self.probe.probe(self.config.probe_timeout_ms);
        self.probes_issued = self.probes_issued.saturating_add(1);
        debug!("net: probe reachable={} at_ms={}", reachable, now_ms);
        self.last_probe = Some(ProbeResult {
            at_ms: now_ms,
            reachable,
        });
    }

    fn note_ready(&mut self, ready: bool) {
        if ready != self.last_ready {
            info!("net: gate ready={}", ready);
            self.last_ready = ready;
        }
    }
}
