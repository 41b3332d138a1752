use thiserror::Error;

// --------------------------------------------------------------------------------------------------------------
// Error taxonomy shared by every transport client and device adapter.
//
// `TransportUnavailable` and `Timeout` are the two kinds a polling loop should
// treat as "try again later" - they never poison adapter state. `ProtocolError`
// is dropped at the frame layer (logged, not surfaced). `RegisterError` is a
// programmer/config mistake and is always synchronous. `PartialRead` lets
// `poll()` return whatever registers did come back instead of failing the
// whole snapshot. `ContextMigration` is recovered internally by the session
// manager and should rarely escape to a caller.
// --------------------------------------------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("register error: {0}")]
    RegisterError(String),

    #[error("partial read: {0}")]
    PartialRead(String),

    #[error("stale executor context, recreating client: {0}")]
    ContextMigration(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl DeviceError {
    /// True for errors that a retry loop should treat as recoverable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeviceError::TransportUnavailable(_) | DeviceError::Timeout(_) | DeviceError::ContextMigration(_)
        )
    }

    /// `Timeout` behaves like `TransportUnavailable` everywhere except its
    /// message - spec says "treated as TransportUnavailable" for retry purposes.
    pub fn as_transport_unavailable(self) -> DeviceError {
        match self {
            DeviceError::Timeout(d) => DeviceError::TransportUnavailable(format!("timed out after {:?}", d)),
            other => other,
        }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;
