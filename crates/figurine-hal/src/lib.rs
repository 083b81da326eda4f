//! Board adapters for `figurine-core`: reed and charge pins over
//! `embedded-hal`, the shared connectivity flags written by the network
//! tasks, the flash-backed config namespace over `embedded-storage` and the
//! SD card file system over `embedded-sdmmc`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod input;
pub mod network;
pub mod storage;
