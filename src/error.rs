//! Error kinds for the gateway protocol client.

use crate::codec::CommandKind;

/// Everything that can go wrong talking to a gateway.
///
/// Frame-level errors (`InvalidFrame`, `UnknownResponse`) are logged and
/// emitted as `error` events without tearing the [`crate::Connection`] down.
/// Command-scoped errors reject only the caller's future. Connection-scoped
/// errors transition the state machine.
#[derive(Debug, thiserror::Error, Clone)]
pub enum GatewayError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("operation requires an authenticated connection")]
    NotAuthenticated,

    #[error("command {0:?} timed out waiting for a response")]
    CommandTimeout(CommandKind),

    #[error("reading request for serial {0} timed out")]
    ReadingTimeout(u64),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("unknown response with no matching pending command: {0}")]
    UnknownResponse(String),

    #[error("stream error: {0}")]
    StreamError(String),

    #[error("cancelled")]
    Cancelled,

    #[error("maximum reconnect attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),
}
