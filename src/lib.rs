//! npipe-wire: named-pipe transport for TDS clients
//!
//! This crate provides the transport layer a SQL Server driver uses to talk to
//! a server over a named pipe:
//!
//! * A [`TransportHandle`] that owns the pipe and serializes sends, with a
//!   bypass for out-of-band attention packets
//! * In-band TLS: the handshake is tunnelled through pre-login packets, then
//!   traffic switches to the encrypted stream
//! * Uniform error reporting: every failure is returned as an [`Error`] and
//!   delivered as an [`ErrorRecord`] to the connection's [`ErrorSink`]
//!
//! On Windows pipes are opened with the native named-pipe client; on Unix a
//! pipe is a Unix domain socket.
//!
//! # Example
//!
//! ```ignore
//! use npipe_wire::connection::{CallbackContext, DataSource, Deadline, TransportHandle};
//! use npipe_wire::{Packet, TracingErrorSink};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = DataSource::parse(r"np:\\.\pipe\sql\query")?.to_config().build();
//! let handle = TransportHandle::connect(
//!     config,
//!     Deadline::after(Duration::from_secs(15)),
//!     CallbackContext(0),
//!     Arc::new(TracingErrorSink),
//! )
//! .await;
//!
//! handle.send(&Packet::from_payload(prelogin)).await?;
//! let reply = handle.receive(None).await?;
//! handle.enable_tls(true).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;

pub use connection::{
    CallbackContext, ConnectionId, DataSource, Deadline, PipeConfig, TlsConfig, TlsState,
    TransportHandle,
};
pub use error::{Error, ErrorRecord, ErrorSink, Result, ReturnCode, Status, TracingErrorSink};
pub use protocol::Packet;
