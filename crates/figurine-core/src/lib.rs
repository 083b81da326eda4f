//! Core logic for the figurine audio box: NFC session gating, the media
//! download pipeline, the required-files registry, figure tracking, the
//! playlist engine and the cooperative ticker that drives them.
//!
//! Everything hardware- or network-facing is a trait at the seam so the
//! crate stays host-testable; board adapters live in `figurine-hal`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod admin;
pub mod audio;
pub mod config;
pub mod download;
pub mod error;
pub mod event;
pub mod figure;
pub mod net;
pub mod nfc;
pub mod orchestrator;
pub mod registry;
pub mod storage;
pub mod ticker;

#[cfg(test)]
mod test_support;
