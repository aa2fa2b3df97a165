use thiserror::Error;

/// Error taxonomy for the ring overlay.
///
/// Transient peer failures (`PeerUnreachable`, `RingUnavailable`) are handled
/// locally by the maintenance routines and never crash a node; `JoinFailure`
/// propagates to whoever called `join`; `InvalidIdentifier` marks a defect
/// (width misconfiguration or malformed wire input) and fails loudly.
#[derive(Error, Debug)]
pub enum RingError {
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("ring unavailable: {0}")]
    RingUnavailable(String),

    #[error("failed to join ring: {0}")]
    JoinFailure(String),

    #[error("invalid lifecycle state: {0}")]
    InvalidState(String),

    #[error("rpc server error: {0}")]
    Server(String),

    #[error("invalid config: {0}")]
    Config(String),
}

impl RingError {
    /// True for failures the maintenance loop absorbs and retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RingError::PeerUnreachable(_) | RingError::RingUnavailable(_)
        )
    }
}
