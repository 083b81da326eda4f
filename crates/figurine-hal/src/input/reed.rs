use embedded_hal::digital::InputPin;
use log::warn;

use figurine_core::{net::PowerStatus, nfc::ReedSensor};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReedConfig {
    active_low: bool,
}

impl Default for ReedConfig {
    fn default() -> Self {
        Self { active_low: true }
    }
}

impl ReedConfig {
    pub const fn with_active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    pub const fn active_low(&self) -> bool {
        self.active_low
    }
}

/// Dock reed switch. Debouncing happens in the NFC session; this only
/// translates the pin level.
#[derive(Debug)]
pub struct ReedSwitch<PIN> {
    pin: PIN,
    config: ReedConfig,
}

impl<PIN> ReedSwitch<PIN>
where
    PIN: InputPin,
{
    pub fn new(pin: PIN, config: ReedConfig) -> Self {
        Self { pin, config }
    }

    pub fn release(self) -> PIN {
        self.pin
    }
}

impl<PIN> ReedSensor for ReedSwitch<PIN>
where
    PIN: InputPin,
{
    type Error = PIN::Error;

    fn is_closed(&mut self) -> Result<bool, Self::Error> {
        let high = self.pin.is_high()?;
        Ok(active_from_level(high, self.config.active_low))
    }
}

/// Charger status line (e.g. the CHRG output of a TP4056).
#[derive(Debug)]
pub struct ChargeDetectPin<PIN> {
    pin: PIN,
    active_low: bool,
    last: bool,
}

impl<PIN> ChargeDetectPin<PIN>
where
    PIN: InputPin,
{
    pub fn new(pin: PIN, active_low: bool) -> Self {
        Self {
            pin,
            active_low,
            last: false,
        }
    }
}

impl<PIN> PowerStatus for ChargeDetectPin<PIN>
where
    PIN: InputPin,
{
    /// A failed pin read reports "not charging".
    fn is_charging(&mut self) -> bool {
        let charging = match self.pin.is_high() {
            Ok(high) => active_from_level(high, self.active_low),
            Err(_) => {
                warn!("power: charge pin read failed");
                false
            }
        };
        self.last = charging;
        charging
    }
}

impl<PIN> ChargeDetectPin<PIN> {
    /// Level seen by the last [`PowerStatus::is_charging`] call.
    pub fn last(&self) -> bool {
        self.last
    }
}

#[inline]
fn active_from_level(high: bool, active_low: bool) -> bool {
    if active_low { !high } else { high }
}
