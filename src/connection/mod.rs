//! Connection management
//!
//! This module handles:
//! * Pipe endpoints and the platform pipe stream
//! * The transport handle (send, receive, TLS switching, disposal)
//! * The pre-login TLS tunnel and certificate validation
//! * Configuration (data sources, deadlines, TLS trust)

mod data_source;
mod deadline;
mod handle;
mod pipe;
mod state;
mod tls;
mod tunnel;
mod validator;

pub use data_source::DataSource;
pub use deadline::Deadline;
pub use handle::{
    CallbackContext, ConnectionId, PipeConfig, PipeConfigBuilder, ReceiveCompletion,
    SendCompletion, TransportHandle,
};
pub use pipe::{PipePath, PipeStream, DEFAULT_PIPE_NAME};
pub use state::TlsState;
pub use tls::{parse_server_name, RootSource, TlsConfig, TlsConfigBuilder};
pub use tunnel::TlsTunnel;
pub use validator::CertificateValidator;
