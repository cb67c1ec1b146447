//! Shared fixtures for integration tests
//!
//! A "pipe server" here is a Unix domain socket in the temp directory, which
//! is what the transport opens for a local pipe on Unix.

#![allow(dead_code)]

use npipe_wire::connection::{
    CallbackContext, Deadline, PipeConfig, TlsConfig, TlsTunnel, TransportHandle,
};
use npipe_wire::{ErrorRecord, ErrorSink, Status};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio_rustls::TlsAcceptor;

static NEXT_PIPE: AtomicUsize = AtomicUsize::new(0);

/// Error sink that keeps every record
#[derive(Default)]
pub struct CollectingSink {
    records: Mutex<Vec<ErrorRecord>>,
}

impl ErrorSink for CollectingSink {
    fn report(&self, record: ErrorRecord) {
        self.records.lock().unwrap().push(record);
    }
}

impl CollectingSink {
    pub fn records(&self) -> Vec<ErrorRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

/// Listening end of a test pipe
pub struct PipeServer {
    listener: UnixListener,
    path: PathBuf,
}

impl PipeServer {
    pub fn bind(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "npipe-wire-{}-{}-{}.sock",
            tag,
            std::process::id(),
            NEXT_PIPE.fetch_add(1, Ordering::Relaxed)
        ));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).expect("bind test pipe");
        Self { listener, path }
    }

    pub fn config(&self) -> PipeConfig {
        PipeConfig::builder("localhost")
            .pipe_name(self.path.to_string_lossy())
            .build()
    }

    pub fn config_with_tls(&self, tls: TlsConfig) -> PipeConfig {
        PipeConfig::builder("localhost")
            .pipe_name(self.path.to_string_lossy())
            .tls(tls)
            .build()
    }

    pub async fn accept(&self) -> UnixStream {
        self.listener.accept().await.expect("accept test pipe").0
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connected client handle plus the server end of its pipe
pub struct Connected {
    pub handle: TransportHandle,
    pub server: UnixStream,
    pub sink: Arc<CollectingSink>,
    pub pipe: PipeServer,
}

pub async fn connect(tag: &str) -> Connected {
    let pipe = PipeServer::bind(tag);
    connect_to(pipe.config(), pipe).await
}

pub async fn connect_to(config: PipeConfig, pipe: PipeServer) -> Connected {
    let sink = Arc::new(CollectingSink::default());
    let (handle, server) = tokio::join!(
        TransportHandle::connect(config, Deadline::Infinite, CallbackContext(1), sink.clone()),
        pipe.accept()
    );
    assert_eq!(handle.status(), Status::Success);
    Connected {
        handle,
        server,
        sink,
        pipe,
    }
}

/// Self-signed certificate for `name` with its key
pub fn self_signed(name: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec![name.to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    (cert.der().clone(), key)
}

pub fn server_config(name: &str) -> Arc<ServerConfig> {
    let (cert, key) = self_signed(name);
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    config.send_tls13_tickets = 0;
    Arc::new(config)
}

/// Server side of the pre-login TLS handshake
pub async fn accept_tls(
    stream: UnixStream,
    config: Arc<ServerConfig>,
) -> std::io::Result<tokio_rustls::server::TlsStream<TlsTunnel<UnixStream>>> {
    let acceptor = TlsAcceptor::from(config);
    let mut tls = acceptor.accept(TlsTunnel::new(stream)).await?;
    tls.get_mut().0.finish_handshake();
    Ok(tls)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
