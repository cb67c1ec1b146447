//! Error types and the uniform error-reporting contract
//!
//! Every failure inside the transport is converted into an [`Error`] at the
//! point where it is detected. Before the error is returned to the caller it is
//! rendered into an [`ErrorRecord`] and handed to the connection's
//! [`ErrorSink`], which is how failures become visible to the rest of the
//! driver.

use crate::connection::{CallbackContext, ConnectionId};
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Provider tag attached to every error record produced by this crate.
pub const PROVIDER: &str = "np";

/// Driver-level error identifiers carried in [`ErrorRecord::driver_code`].
pub mod codes {
    /// Connection terminated by the peer
    pub const CONN_TERMINATED: u32 = 2;
    /// Timed out while establishing the connection
    pub const CONN_TIMEOUT: u32 = 11;
    /// Malformed data source
    pub const INVALID_DATA_SOURCE: u32 = 25;
    /// TLS handshake failed
    pub const HANDSHAKE_FAILURE: u32 = 31;
    /// I/O or state failure inside the transport
    pub const INTERNAL_EXCEPTION: u32 = 35;
    /// Could not open a connection to the server
    pub const CONN_OPEN_FAILED: u32 = 40;
}

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Pipe connect did not finish before the deadline
    #[error("timed out after {waited:?} connecting to pipe '{pipe}'")]
    ConnectTimeout {
        /// Pipe path that was being opened
        pipe: String,
        /// Time that was allowed for the connect
        waited: Duration,
    },

    /// Pipe connect failed with an I/O error
    #[error("could not open pipe '{pipe}': {source}")]
    ConnectIo {
        /// Pipe path that was being opened
        pipe: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Connected pipe does not report itself readable and writable
    #[error("pipe '{0}' is not ready for duplex I/O")]
    ChannelNotReady(String),

    /// A read returned zero bytes: the peer closed the pipe
    #[error("connection closed by peer (native code {native_code})")]
    ZeroLengthRead {
        /// Platform error code for the empty read. A clean end of stream
        /// carries no OS error and records 0.
        native_code: i32,
    },

    /// Operation attempted on a disposed handle
    #[error("transport handle has been disposed")]
    Disposed,

    /// Stream-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS handshake was rejected or failed
    #[error("TLS authentication failed: {0}")]
    TlsAuthentication(String),

    /// TLS operation attempted in the wrong state
    #[error("invalid TLS state: expected {expected}, got {actual}")]
    TlsInvalidState {
        /// State the operation requires
        expected: String,
        /// State the handle was in
        actual: String,
    },

    /// Invalid configuration or data source
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed pre-login framing
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Platform error code associated with this error, or 0 when there is none.
    pub fn native_code(&self) -> i32 {
        match self {
            Error::ConnectIo { source, .. } => source.raw_os_error().unwrap_or(0),
            Error::Io(e) => e.raw_os_error().unwrap_or(0),
            Error::ZeroLengthRead { native_code } => *native_code,
            _ => 0,
        }
    }

    /// Driver error identifier for this error.
    pub fn driver_code(&self) -> u32 {
        match self {
            Error::ConnectTimeout { .. } => codes::CONN_TIMEOUT,
            Error::ConnectIo { .. } | Error::ChannelNotReady(_) => codes::CONN_OPEN_FAILED,
            Error::ZeroLengthRead { .. } => codes::CONN_TERMINATED,
            Error::TlsAuthentication(_) => codes::HANDSHAKE_FAILURE,
            Error::Config(_) => codes::INVALID_DATA_SOURCE,
            Error::Disposed
            | Error::Io(_)
            | Error::TlsInvalidState { .. }
            | Error::Protocol(_) => codes::INTERNAL_EXCEPTION,
        }
    }

    /// Short, stable name of the error kind, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConnectTimeout { .. } => "connect_timeout",
            Error::ConnectIo { .. } => "connect_io",
            Error::ChannelNotReady(_) => "channel_not_ready",
            Error::ZeroLengthRead { .. } => "zero_length_read",
            Error::Disposed => "disposed",
            Error::Io(_) => "io",
            Error::TlsAuthentication(_) => "tls_authentication",
            Error::TlsInvalidState { .. } => "tls_invalid_state",
            Error::Config(_) => "config",
            Error::Protocol(_) => "protocol",
        }
    }

    /// Whether the error means the peer is gone and the pipe is unusable.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::ZeroLengthRead { .. } => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Render this error into the record delivered to an [`ErrorSink`].
    pub fn to_record(&self, connection_id: ConnectionId, context: CallbackContext) -> ErrorRecord {
        ErrorRecord {
            provider: PROVIDER,
            native_code: self.native_code(),
            driver_code: self.driver_code(),
            message: self.to_string(),
            connection_id,
            context,
        }
    }
}

/// Side-channel description of a failure, delivered to the error sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Provider tag, always [`PROVIDER`]
    pub provider: &'static str,
    /// Platform error code (0 if none)
    pub native_code: i32,
    /// Driver error identifier, see [`codes`]
    pub driver_code: u32,
    /// Human-readable message
    pub message: String,
    /// Connection the failure belongs to
    pub connection_id: ConnectionId,
    /// Opaque token supplied when the handle was created
    pub context: CallbackContext,
}

/// Centralized error-reporting collaborator.
///
/// Implementations must be cheap and must not block: `report` is called
/// from inside I/O paths, sometimes while locks are held.
pub trait ErrorSink: Send + Sync {
    /// Record one failure.
    fn report(&self, record: ErrorRecord);
}

/// Default sink that logs each record through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, record: ErrorRecord) {
        tracing::warn!(
            provider = record.provider,
            native_code = record.native_code,
            driver_code = record.driver_code,
            connection_id = %record.connection_id,
            context = record.context.0,
            "{}",
            record.message
        );
    }
}

/// Outcome code mirrored by every transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// Operation completed
    Success,
    /// Operation failed; an error record was reported
    Error,
    /// Asynchronous operation started; completion arrives on a channel
    IoPending,
}

impl<T> From<&Result<T>> for ReturnCode {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ReturnCode::Success,
            Err(_) => ReturnCode::Error,
        }
    }
}

/// Construction status of a transport handle, set once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// Not yet connected
    #[default]
    Uninitialized,
    /// Connected and usable
    Success,
    /// Connect failed; the handle cannot perform I/O
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_codes() {
        let timeout = Error::ConnectTimeout {
            pipe: "p".into(),
            waited: Duration::from_millis(50),
        };
        assert_eq!(timeout.driver_code(), codes::CONN_TIMEOUT);
        assert_eq!(
            Error::ChannelNotReady("p".into()).driver_code(),
            codes::CONN_OPEN_FAILED
        );
        assert_eq!(Error::Disposed.driver_code(), codes::INTERNAL_EXCEPTION);
        assert_eq!(
            Error::TlsAuthentication("bad cert".into()).driver_code(),
            codes::HANDSHAKE_FAILURE
        );
    }

    #[test]
    fn test_native_code_from_os_error() {
        let err = Error::ConnectIo {
            pipe: "p".into(),
            source: io::Error::from_raw_os_error(2),
        };
        assert_eq!(err.native_code(), 2);
        assert_eq!(Error::Disposed.native_code(), 0);
        assert_eq!(Error::ZeroLengthRead { native_code: 109 }.native_code(), 109);
    }

    #[test]
    fn test_connection_lost() {
        assert!(Error::ZeroLengthRead { native_code: 0 }.is_connection_lost());
        assert!(Error::Io(io::ErrorKind::BrokenPipe.into()).is_connection_lost());
        assert!(!Error::Io(io::ErrorKind::TimedOut.into()).is_connection_lost());
        assert!(!Error::Disposed.is_connection_lost());
    }

    #[test]
    fn test_record_carries_context() {
        let record = Error::Disposed.to_record(ConnectionId::from_raw(7), CallbackContext(42));
        assert_eq!(record.provider, PROVIDER);
        assert_eq!(record.driver_code, codes::INTERNAL_EXCEPTION);
        assert_eq!(record.connection_id, ConnectionId::from_raw(7));
        assert_eq!(record.context, CallbackContext(42));
        assert!(record.message.contains("disposed"));
    }

    #[test]
    fn test_return_code_from_result() {
        let ok: Result<()> = Ok(());
        let err: Result<()> = Err(Error::Disposed);
        assert_eq!(ReturnCode::from(&ok), ReturnCode::Success);
        assert_eq!(ReturnCode::from(&err), ReturnCode::Error);
    }
}
