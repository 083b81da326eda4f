//! Error taxonomy shared by every component.

/// Coarse error class used for propagation policy and event payloads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// HTTP error, timeout or TLS failure.
    Transport,
    /// Mount failure, write failure, device full or bad path.
    Storage,
    /// Checksum mismatch after a complete byte transfer.
    Integrity,
    /// Retry budget consumed.
    Exhausted,
    /// Operation illegal in the current state.
    State,
    /// Requested file or manifest does not exist.
    Absent,
    /// Blocked by the network gate.
    Gated,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Storage => "storage",
            Self::Integrity => "integrity",
            Self::Exhausted => "exhausted",
            Self::State => "state",
            Self::Absent => "absent",
            Self::Gated => "gated",
        }
    }
}
