use alloc::string::String;

use serde::{Deserialize, Serialize};

use super::{MAX_RETRY, RETRY_DELAY_MS};

/// One queued transfer, persisted under `dl_queue` as part of a JSON array.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct DownloadTask {
    pub url: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(rename = "retries")]
    pub retry_count: u8,
    #[serde(rename = "lastAttempt")]
    pub last_attempt_ms: u64,
    pub completed: bool,
}

impl DownloadTask {
    pub fn new(url: &str, path: &str, checksum: Option<&str>) -> Self {
        Self {
            url: String::from(url),
            path: String::from(path),
            checksum: checksum
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(String::from),
            ..Self::default()
        }
    }

    pub fn expected_checksum(&self) -> Option<&str> {
        self.checksum
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn same_target(&self, url: &str, path: &str) -> bool {
        self.url == url && self.path == path
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= MAX_RETRY
    }

    /// A task that never failed is due at once; a failed one waits
    /// `RETRY_DELAY_MS` after its last attempt.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.retry_count == 0 || now_ms >= self.last_attempt_ms.saturating_add(RETRY_DELAY_MS)
    }

    pub fn is_eligible(&self, now_ms: u64) -> bool {
        !self.completed && !self.is_exhausted() && self.is_due(now_ms)
    }
}
