pub mod flash_config;
pub mod sd_fs;

pub use flash_config::{FlashConfigError, FlashKeyValueStore};
pub use sd_fs::{FixedTimeSource, SdFileSystem};
