pub mod reed;

pub use reed::{ChargeDetectPin, ReedConfig, ReedSwitch};
