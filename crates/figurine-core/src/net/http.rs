//! Streaming HTTP GET contract provided by the transport collaborator.

use alloc::vec::Vec;

use crate::error::ErrorKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransportError {
    Connect,
    Timeout,
    Tls,
    /// Non-success HTTP status.
    Status(u16),
    /// Body ended early or the stream broke.
    Io,
    /// A response is already open on this client.
    Busy,
    /// Body larger than the caller accepts.
    TooLarge,
}

impl TransportError {
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::Status(404) => ErrorKind::Absent,
            _ => ErrorKind::Transport,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Timeout => "timeout",
            Self::Tls => "tls",
            Self::Status(_) => "http-status",
            Self::Io => "io",
            Self::Busy => "busy",
            Self::TooLarge => "too-large",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_length: Option<u64>,
}

impl ResponseHead {
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// One response at a time: `begin_get`, then `read_body` until `Ok(0)`,
/// then `finish`.
pub trait HttpClient {
    fn begin_get(&mut self, url: &str, timeout_ms: u32) -> Result<ResponseHead, TransportError>;

    /// Read the next body bytes into `buf`. `Ok(0)` marks the end of body.
    fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Release the open response, if any.
    fn finish(&mut self);
}

/// GET a small body (manifests) into memory.
pub fn get_to_vec<H>(
    client: &mut H,
    url: &str,
    timeout_ms: u32,
    max_bytes: usize,
) -> Result<Vec<u8>, TransportError>
where
    H: HttpClient + ?Sized,
{
    let head = client.begin_get(url, timeout_ms)?;
    if !head.is_success() {
        client.finish();
        return Err(TransportError::Status(head.status));
    }

    let mut body = Vec::new();
    let mut chunk = [0u8; 512];
    let result = loop {
        match client.read_body(&mut chunk) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if body.len() + n > max_bytes {
                    break Err(TransportError::TooLarge);
                }
                body.extend_from_slice(&chunk[..n]);
            }
            Err(err) => break Err(err),
        }
    };
    client.finish();
    result.map(|_| body)
}
