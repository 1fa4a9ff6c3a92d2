use thiserror::Error;

/// Error taxonomy for the fleet connection core (spec §7).
///
/// Deliberately coarse — callers match on variant, not on the wrapped
/// string, the same way `errors::DaemonError` is consumed throughout the
/// daemon this core is descended from.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("not connected")]
    NotConnected,

    #[error("command timed out")]
    Timeout,

    #[error("transport broken: {0}")]
    TransportBroken(String),

    #[error("response did not match any known dialect")]
    ParseFailed,

    #[error("device rejected command: {0}")]
    CommandRejected(String),

    #[error("sign-in failed")]
    AuthFailed,

    #[error("invalid command parameter: {0}")]
    ConfigInvalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// True for the failure kinds that count toward the poller's
    /// three-consecutive-failure auto-disconnect rule (spec §4.5).
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            CoreError::Timeout | CoreError::TransportBroken(_) | CoreError::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
