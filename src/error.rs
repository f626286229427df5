use thiserror::Error;

/// Failure kinds surfaced by every public vehicle operation.
///
/// Callers branch on these distinctly: a timeout may be worth retrying,
/// a rejected precondition will not resolve by itself, and a malformed
/// request never reached the vehicle at all.
#[derive(Debug, Error)]
pub enum UgvError {
    /// Link establishment failed or timed out. No link is retained.
    #[error("vehicle link connection failed: {0:#}")]
    Connection(#[source] anyhow::Error),

    /// A telemetry refresh read failed; the published snapshot is unchanged.
    #[error("telemetry refresh failed: {0:#}")]
    Telemetry(#[source] anyhow::Error),

    /// Malformed input, rejected before touching the link.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A precondition on the vehicle's state was violated.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Arming did not confirm within the 15 second deadline. The vehicle may
    /// still arm afterwards; the next refresh re-reads the actual state.
    #[error("vehicle arming timed out")]
    ArmTimeout,

    /// Disarming did not confirm within the 15 second deadline.
    #[error("vehicle disarming timed out")]
    DisarmTimeout,

    /// A mission waypoint file had a bad header or a malformed row.
    #[error("mission file format: {0}")]
    Format(String),

    /// Unknown parameter key.
    #[error("unknown parameter: {0}")]
    NotFound(String),

    /// Catch-all wrapping an unexpected underlying failure.
    #[error("{0:#}")]
    General(#[from] anyhow::Error),
}

impl UgvError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        UgvError::InvalidState(msg.into())
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        UgvError::InvalidRequest(msg.into())
    }
}
