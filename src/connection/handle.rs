//! Transport handle: the connection of record for one pipe
//!
//! A [`TransportHandle`] owns the pipe, the optional TLS stream layered on
//! top of it and the bookkeeping the driver needs around them. All clones of
//! a handle refer to the same connection.
//!
//! Locking: the connection lock (`gate`) guards the TLS state and orders
//! receives, normal sends, TLS changes and disposal. The active stream is
//! split into a read half and a write half, each behind its own mutex; the
//! write-half mutex serializes physical writes. Out-of-band sends try the
//! connection lock and go ahead whether or not they got it. Locks are always
//! taken in the order gate, reader, writer.
//!
//! Teardown: disposal and the diagnostics kill publish on a watch channel
//! before taking the half locks. Every read, write and handshake races that
//! signal, so I/O parked on a silent peer gives its half back and fails
//! instead of holding up the teardown.

use super::deadline::Deadline;
use super::pipe::{PipePath, PipeStream, DEFAULT_PIPE_NAME};
use super::state::TlsState;
use super::tls::{tls_server_name, TlsConfig};
use super::tunnel::TlsTunnel;
use crate::error::{ErrorSink, ReturnCode, Status};
use crate::metrics::labels;
use crate::protocol::constants::DEFAULT_PACKET_SIZE;
use crate::protocol::Packet;
use crate::{Error, Result};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Mutex};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::Instrument;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap a raw identifier
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Raw identifier value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token supplied by the driver and echoed in every error record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CallbackContext(pub u64);

/// Pipe connection configuration
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Server name, also the identity checked during TLS validation
    pub server_name: String,
    /// Pipe name below `\pipe\`
    pub pipe_name: String,
    /// Data capacity of packets allocated for receives
    pub buffer_size: usize,
    /// Trust configuration for TLS (default: system roots, built on first use)
    pub tls: Option<TlsConfig>,
}

impl PipeConfig {
    /// Configuration for the default pipe on `server_name`
    pub fn new(server_name: impl Into<String>) -> Self {
        Self::builder(server_name).build()
    }

    /// Create a builder
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = PipeConfig::builder("db01")
    ///     .pipe_name(r"MSSQL$SQLEXPRESS\sql\query")
    ///     .buffer_size(8000)
    ///     .build();
    /// ```
    pub fn builder(server_name: impl Into<String>) -> PipeConfigBuilder {
        PipeConfigBuilder {
            server_name: server_name.into(),
            pipe_name: DEFAULT_PIPE_NAME.to_string(),
            buffer_size: DEFAULT_PACKET_SIZE,
            tls: None,
        }
    }

    /// Endpoint this configuration connects to
    pub fn pipe_path(&self) -> PipePath {
        PipePath::new(&self.server_name, &self.pipe_name)
    }
}

/// Builder for [`PipeConfig`]
#[derive(Debug, Clone)]
pub struct PipeConfigBuilder {
    server_name: String,
    pipe_name: String,
    buffer_size: usize,
    tls: Option<TlsConfig>,
}

impl PipeConfigBuilder {
    /// Set the pipe name (default: `sql\query`)
    pub fn pipe_name(mut self, name: impl Into<String>) -> Self {
        self.pipe_name = name.into();
        self
    }

    /// Set the receive buffer size (default: 4096)
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Set the TLS trust configuration
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Build the configuration
    pub fn build(self) -> PipeConfig {
        PipeConfig {
            server_name: self.server_name,
            pipe_name: self.pipe_name,
            buffer_size: self.buffer_size.max(1),
            tls: self.tls,
        }
    }
}

/// Completion of a [`TransportHandle::receive_async`]
#[derive(Debug)]
pub struct ReceiveCompletion {
    /// Connection the read ran on
    pub connection_id: ConnectionId,
    /// Received packet, or the error that was reported
    pub result: Result<Packet>,
}

/// Completion of a [`TransportHandle::send_async`]
#[derive(Debug)]
pub struct SendCompletion {
    /// Connection the write ran on
    pub connection_id: ConnectionId,
    /// The packet, unless it was released after the write
    pub packet: Option<Packet>,
    /// Outcome of the write
    pub result: Result<()>,
}

#[derive(Debug, Default)]
struct AsyncCallbacks {
    receive: Option<UnboundedSender<ReceiveCompletion>>,
    send: Option<UnboundedSender<SendCompletion>>,
}

/// State guarded by the connection lock
#[derive(Debug, Default)]
struct SessionState {
    tls: TlsState,
    tls_config: Option<TlsConfig>,
}

impl SessionState {
    fn tls_config(&mut self) -> Result<TlsConfig> {
        if let Some(config) = &self.tls_config {
            return Ok(config.clone());
        }
        let config = TlsConfig::builder().build()?;
        self.tls_config = Some(config.clone());
        Ok(config)
    }
}

/// The stream traffic currently flows over
enum ActiveStream {
    /// Raw pipe; the tunnel is kept so TLS can be enabled without re-wrapping
    Plain(TlsTunnel<PipeStream>),
    /// TLS over the tunnel
    Secure(Box<TlsStream<TlsTunnel<PipeStream>>>),
}

impl AsyncRead for ActiveStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ActiveStream::Plain(tunnel) => Pin::new(tunnel.get_mut()).poll_read(cx, buf),
            ActiveStream::Secure(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ActiveStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ActiveStream::Plain(tunnel) => Pin::new(tunnel.get_mut()).poll_write(cx, buf),
            ActiveStream::Secure(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ActiveStream::Plain(tunnel) => Pin::new(tunnel.get_mut()).poll_flush(cx),
            ActiveStream::Secure(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ActiveStream::Plain(tunnel) => Pin::new(tunnel.get_mut()).poll_shutdown(cx),
            ActiveStream::Secure(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
        }
    }
}

type Reader = Option<ReadHalf<ActiveStream>>;
type Writer = Option<WriteHalf<ActiveStream>>;

/// Reassemble the active stream from its halves
fn take_stream(reader: &mut Reader, writer: &mut Writer) -> Option<ActiveStream> {
    match (reader.take(), writer.take()) {
        (Some(r), Some(w)) => Some(r.unsplit(w)),
        _ => None,
    }
}

fn install_stream(reader: &mut Reader, writer: &mut Writer, stream: ActiveStream) {
    let (r, w) = tokio::io::split(stream);
    *reader = Some(r);
    *writer = Some(w);
}

fn not_connected() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::NotConnected,
        "pipe is not connected",
    ))
}

/// Map a failed handshake to the error taxonomy
fn handshake_error(e: io::Error) -> Error {
    match e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(tls) => Error::TlsAuthentication(tls.to_string()),
        None => Error::Io(e),
    }
}

/// Teardown signal shared by all I/O on a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Open,
    #[cfg_attr(not(any(test, debug_assertions)), allow(dead_code))]
    Killed,
    Disposed,
}

impl Teardown {
    fn error(self) -> Error {
        match self {
            Teardown::Disposed => Error::Disposed,
            Teardown::Open | Teardown::Killed => Error::Io(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection killed",
            )),
        }
    }
}

struct HandleInner {
    id: ConnectionId,
    status: Status,
    path: PipePath,
    context: CallbackContext,
    sink: Arc<dyn ErrorSink>,
    gate: Mutex<SessionState>,
    reader: Mutex<Reader>,
    writer: Mutex<Writer>,
    teardown: watch::Sender<Teardown>,
    disposed: AtomicBool,
    peer_closed: AtomicBool,
    buffer_size: AtomicUsize,
    callbacks: std::sync::Mutex<AsyncCallbacks>,
}

impl HandleInner {
    /// Hand `error` to the sink and give it back for returning
    fn report(&self, error: Error) -> Error {
        report_to(&*self.sink, self.id, self.context, &error);
        error
    }

    fn active<'a, T>(&self, half: &'a mut Option<T>) -> Result<&'a mut T> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        half.as_mut().ok_or_else(not_connected)
    }

    fn callbacks(&self) -> std::sync::MutexGuard<'_, AsyncCallbacks> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolves once the handle is disposed or killed.
    async fn torn_down(&self) -> Error {
        let mut teardown = self.teardown.subscribe();
        match teardown
            .wait_for(|state| *state != Teardown::Open)
            .await
            .map(|state| *state)
        {
            Ok(state) => state.error(),
            Err(_) => Error::Disposed,
        }
    }

    async fn read_packet(&self, timeout: Option<Duration>) -> Result<Packet> {
        tokio::select! {
            biased;
            error = self.torn_down() => Err(error),
            result = self.read_active(timeout) => result,
        }
    }

    async fn read_active(&self, timeout: Option<Duration>) -> Result<Packet> {
        let mut reader = self.reader.lock().await;
        let stream = self.active(&mut *reader)?;

        let mut packet = Packet::allocate(0, self.buffer_size.load(Ordering::Relaxed));
        let read = packet.read_from_stream(stream);
        let n = match timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "receive timed out"))??,
            None => read.await?,
        };

        if n == 0 {
            self.peer_closed.store(true, Ordering::Release);
            tracing::debug!(connection_id = %self.id, "zero-length read");
            return Err(Error::ZeroLengthRead { native_code: 0 });
        }

        crate::metrics::counters::packet_received(n);
        Ok(packet)
    }

    async fn write_packet(&self, packet: &Packet) -> Result<()> {
        tokio::select! {
            biased;
            error = self.torn_down() => Err(error),
            result = self.write_active(packet) => result,
        }
    }

    async fn write_active(&self, packet: &Packet) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stream = self.active(&mut *writer)?;
        packet.write_to_stream(stream).await?;

        let priority = if packet.is_out_of_band() {
            labels::PRIORITY_OUT_OF_BAND
        } else {
            labels::PRIORITY_NORMAL
        };
        crate::metrics::counters::packet_sent(priority, packet.len());
        Ok(())
    }

    async fn upgrade(
        &self,
        session: &mut SessionState,
        reader: &mut Reader,
        writer: &mut Writer,
        validate_certificate: bool,
    ) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        if session.tls != TlsState::Plain {
            return Err(Error::TlsInvalidState {
                expected: TlsState::Plain.to_string(),
                actual: session.tls.to_string(),
            });
        }

        let server_name = tls_server_name(self.path.server())?;
        let tls_config = session.tls_config()?;
        let validator = tls_config.validator(self.path.server(), validate_certificate)?;
        let connector = TlsConnector::from(tls_config.client_config(validator)?);

        let mut tunnel = match take_stream(reader, writer) {
            Some(ActiveStream::Plain(tunnel)) => tunnel,
            Some(other) => {
                install_stream(reader, writer, other);
                return Err(Error::TlsInvalidState {
                    expected: TlsState::Plain.to_string(),
                    actual: TlsState::Secure.to_string(),
                });
            }
            None => return Err(not_connected()),
        };

        session.tls.transition(TlsState::Handshaking)?;
        tunnel.restart_handshake();
        let started = Instant::now();

        let handshake = tokio::select! {
            biased;
            error = self.torn_down() => {
                session.tls.transition(TlsState::Plain)?;
                crate::metrics::counters::tls_handshake(labels::OUTCOME_FAILED);
                tracing::debug!("handshake abandoned, transport torn down");
                return Err(error);
            }
            handshake = connector.connect(server_name, tunnel).into_fallible() => handshake,
        };

        match handshake {
            Ok(mut tls) => {
                tls.get_mut().0.finish_handshake();
                install_stream(reader, writer, ActiveStream::Secure(Box::new(tls)));
                session.tls.transition(TlsState::Secure)?;

                crate::metrics::counters::tls_handshake(labels::OUTCOME_OK);
                crate::metrics::histograms::tls_handshake_duration(started.elapsed());
                tracing::info!("TLS established, active stream swapped");
                Ok(())
            }
            Err((e, mut tunnel)) => {
                tunnel.restart_handshake();
                install_stream(reader, writer, ActiveStream::Plain(tunnel));
                session.tls.transition(TlsState::Plain)?;

                crate::metrics::counters::tls_handshake(labels::OUTCOME_FAILED);
                Err(handshake_error(e))
            }
        }
    }

    fn downgrade(
        &self,
        session: &mut SessionState,
        reader: &mut Reader,
        writer: &mut Writer,
    ) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::Disposed);
        }
        match session.tls {
            TlsState::Plain => {
                tracing::debug!("TLS not enabled, nothing to disable");
                return Ok(());
            }
            TlsState::Handshaking => {
                return Err(Error::TlsInvalidState {
                    expected: TlsState::Secure.to_string(),
                    actual: session.tls.to_string(),
                });
            }
            TlsState::Secure => {}
        }

        let mut tunnel = match take_stream(reader, writer) {
            Some(ActiveStream::Secure(tls)) => (*tls).into_inner().0,
            Some(ActiveStream::Plain(tunnel)) => tunnel,
            None => return Err(not_connected()),
        };
        tunnel.restart_handshake();
        install_stream(reader, writer, ActiveStream::Plain(tunnel));
        session.tls.transition(TlsState::Plain)?;
        tracing::info!("TLS disabled, active stream swapped back to the pipe");
        Ok(())
    }
}

fn report_to(sink: &dyn ErrorSink, id: ConnectionId, context: CallbackContext, error: &Error) {
    crate::metrics::counters::error_reported(error.kind());
    sink.report(error.to_record(id, context));
}

/// Open the pipe within `deadline` and check it is usable
async fn open_pipe(path: &PipePath, deadline: Deadline) -> Result<PipeStream> {
    let connect = PipeStream::connect(path);
    let opened = match deadline.remaining() {
        None => connect.await,
        Some(wait) => match tokio::time::timeout(wait, connect).await {
            Ok(result) => result,
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    pipe: path.to_string(),
                    waited: wait,
                })
            }
        },
    };

    let pipe = opened.map_err(|source| Error::ConnectIo {
        pipe: path.to_string(),
        source,
    })?;

    if !pipe.is_duplex() {
        return Err(Error::ChannelNotReady(path.to_string()));
    }
    Ok(pipe)
}

/// Connection handle over a named pipe
///
/// # Examples
///
/// ```ignore
/// let config = PipeConfig::new(".");
/// let handle = TransportHandle::connect(
///     config,
///     Deadline::after(Duration::from_secs(15)),
///     CallbackContext(0),
///     Arc::new(TracingErrorSink),
/// )
/// .await;
/// if handle.status() == Status::Success {
///     handle.send(&Packet::from_payload(prelogin)).await?;
///     let reply = handle.receive(None).await?;
///     handle.enable_tls(true).await?;
/// }
/// ```
#[derive(Clone)]
pub struct TransportHandle {
    inner: Arc<HandleInner>,
}

impl TransportHandle {
    /// Open the pipe described by `config`.
    ///
    /// Always returns a handle. If the pipe cannot be opened before
    /// `deadline`, or is not usable once opened, the failure is reported to
    /// `sink` and [`status`](Self::status) is [`Status::Error`]; such a handle
    /// fails every I/O operation.
    pub async fn connect(
        config: PipeConfig,
        deadline: Deadline,
        context: CallbackContext,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let id = ConnectionId::next();
        let path = config.pipe_path();
        let span = tracing::info_span!("connect", connection_id = %id, pipe = %path);
        let started = Instant::now();

        let opened = open_pipe(&path, deadline).instrument(span.clone()).await;
        let (status, stream) = match opened {
            Ok(pipe) => {
                crate::metrics::counters::connection_opened();
                crate::metrics::histograms::connect_duration(started.elapsed());
                span.in_scope(|| tracing::info!("pipe connected"));
                (Status::Success, Some(ActiveStream::Plain(TlsTunnel::new(pipe))))
            }
            Err(e) => {
                crate::metrics::counters::connection_failed(e.kind());
                span.in_scope(|| tracing::debug!(error = %e, "pipe connect failed"));
                report_to(&*sink, id, context, &e);
                (Status::Error, None)
            }
        };

        let mut reader = None;
        let mut writer = None;
        if let Some(stream) = stream {
            install_stream(&mut reader, &mut writer, stream);
        }

        Self {
            inner: Arc::new(HandleInner {
                id,
                status,
                path,
                context,
                sink,
                gate: Mutex::new(SessionState {
                    tls: TlsState::Plain,
                    tls_config: config.tls,
                }),
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                teardown: watch::channel(Teardown::Open).0,
                disposed: AtomicBool::new(false),
                peer_closed: AtomicBool::new(false),
                buffer_size: AtomicUsize::new(config.buffer_size.max(1)),
                callbacks: std::sync::Mutex::new(AsyncCallbacks::default()),
            }),
        }
    }

    /// Connection identifier
    pub fn connection_id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Outcome of construction; never changes afterwards
    pub fn status(&self) -> Status {
        self.inner.status
    }

    /// Server name, also used as the TLS identity
    pub fn server_name(&self) -> &str {
        self.inner.path.server()
    }

    /// Pipe endpoint
    pub fn pipe_path(&self) -> &PipePath {
        &self.inner.path
    }

    /// Whether [`dispose`](Self::dispose) has run
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Data capacity of packets allocated by future receives
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size.load(Ordering::Relaxed)
    }

    /// Change the receive buffer size. Affects only later receives.
    pub fn set_buffer_size(&self, size: usize) {
        self.inner.buffer_size.store(size.max(1), Ordering::Relaxed);
    }

    /// Current TLS state. Waits for an in-flight receive or TLS change.
    pub async fn tls_state(&self) -> TlsState {
        self.inner.gate.lock().await.tls
    }

    /// Check the pipe is still usable.
    pub fn check_connection(&self) -> ReturnCode {
        let inner = &self.inner;
        let result = if inner.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed)
        } else if inner.status != Status::Success {
            Err(not_connected())
        } else if inner.peer_closed.load(Ordering::Acquire) {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe closed by peer",
            )))
        } else {
            Ok(())
        };
        let code = ReturnCode::from(&result);
        if let Err(e) = result {
            inner.report(e);
        }
        code
    }

    /// Receive one packet from the active stream.
    ///
    /// The packet is filled by a single read of at most
    /// [`buffer_size`](Self::buffer_size) bytes. A zero-length read is a
    /// failure, never an empty packet. `timeout` bounds the read; `None`
    /// waits indefinitely.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Packet> {
        let inner = &self.inner;
        let _session = inner.gate.lock().await;
        inner
            .read_packet(timeout)
            .await
            .map_err(|e| inner.report(e))
    }

    /// Send one packet on the active stream.
    ///
    /// Normal packets wait for the connection lock. Out-of-band packets only
    /// try it and go ahead regardless, so an attention is never stuck behind
    /// a blocked receive or send; they still wait for a write physically in
    /// progress to finish.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let inner = &self.inner;
        let result = if packet.is_out_of_band() {
            let held = inner.gate.try_lock();
            if held.is_err() {
                crate::metrics::counters::oob_lock_bypassed();
                tracing::debug!(connection_id = %inner.id, "out-of-band send bypassing busy connection lock");
            }
            let result = inner.write_packet(packet).await;
            drop(held);
            result
        } else {
            let _session = inner.gate.lock().await;
            inner.write_packet(packet).await
        };
        result.map_err(|e| inner.report(e))
    }

    /// Register the channels asynchronous completions are delivered on.
    pub fn set_async_callbacks(
        &self,
        receive: Option<UnboundedSender<ReceiveCompletion>>,
        send: Option<UnboundedSender<SendCompletion>>,
    ) {
        let mut callbacks = self.inner.callbacks();
        callbacks.receive = receive;
        callbacks.send = send;
    }

    /// Start a receive in the background.
    ///
    /// Returns [`ReturnCode::IoPending`] once the read is started; the packet
    /// or error arrives on the registered receive channel. Failing to start
    /// is reported and returns [`ReturnCode::Error`].
    pub fn receive_async(&self) -> ReturnCode {
        let callback = self.inner.callbacks().receive.clone();
        let (callback, runtime) = match self.start_async(callback, "receive") {
            Ok(started) => started,
            Err(e) => {
                self.inner.report(e);
                return ReturnCode::Error;
            }
        };

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let result = inner.read_packet(None).await.map_err(|e| inner.report(e));
            if callback
                .send(ReceiveCompletion {
                    connection_id: inner.id,
                    result,
                })
                .is_err()
            {
                tracing::debug!(connection_id = %inner.id, "receive completion dropped, channel closed");
            }
        });
        ReturnCode::IoPending
    }

    /// Start a send in the background.
    ///
    /// Completion goes to `callback`, or the registered send channel when
    /// `None`. With `release` set the packet is dropped after the write;
    /// otherwise it is handed back in the completion. Overlapping
    /// asynchronous sends are not ordered; callers serialize them.
    pub fn send_async(
        &self,
        packet: Packet,
        callback: Option<UnboundedSender<SendCompletion>>,
        release: bool,
    ) -> ReturnCode {
        let callback = callback.or_else(|| self.inner.callbacks().send.clone());
        let (callback, runtime) = match self.start_async(callback, "send") {
            Ok(started) => started,
            Err(e) => {
                self.inner.report(e);
                return ReturnCode::Error;
            }
        };

        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            let result = inner.write_packet(&packet).await.map_err(|e| inner.report(e));
            if callback
                .send(SendCompletion {
                    connection_id: inner.id,
                    packet: (!release).then_some(packet),
                    result,
                })
                .is_err()
            {
                tracing::debug!(connection_id = %inner.id, "send completion dropped, channel closed");
            }
        });
        ReturnCode::IoPending
    }

    fn start_async<T>(
        &self,
        callback: Option<T>,
        direction: &str,
    ) -> Result<(T, tokio::runtime::Handle)> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        let callback = callback.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no {} callback registered", direction),
            ))
        })?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        Ok((callback, runtime))
    }

    /// Run the TLS handshake through the pre-login tunnel and switch traffic
    /// to the encrypted stream.
    ///
    /// With `validate_certificate` unset any server certificate is accepted.
    /// On failure the pipe stays the active stream and the state stays
    /// [`TlsState::Plain`].
    pub async fn enable_tls(&self, validate_certificate: bool) -> Result<()> {
        let inner = &self.inner;
        let span = tracing::info_span!(
            "enable_tls",
            connection_id = %inner.id,
            validate = validate_certificate
        );
        async {
            let mut session = inner.gate.lock().await;
            let mut reader = inner.reader.lock().await;
            let mut writer = inner.writer.lock().await;
            inner
                .upgrade(&mut session, &mut reader, &mut writer, validate_certificate)
                .await
        }
        .instrument(span)
        .await
        .map_err(|e| inner.report(e))
    }

    /// Drop the TLS stream and send traffic over the pipe again.
    ///
    /// A no-op when TLS is not enabled.
    pub async fn disable_tls(&self) -> Result<()> {
        let inner = &self.inner;
        let span = tracing::info_span!("disable_tls", connection_id = %inner.id);
        async {
            let mut session = inner.gate.lock().await;
            let mut reader = inner.reader.lock().await;
            let mut writer = inner.writer.lock().await;
            inner.downgrade(&mut session, &mut reader, &mut writer)
        }
        .instrument(span)
        .await
        .map_err(|e| inner.report(e))
    }

    /// Release the TLS stream and the pipe. Idempotent.
    ///
    /// Waits for in-flight receives and normal sends, which hold the
    /// connection lock. Background receives and sends do not hold it: they
    /// are failed with [`Error::Disposed`] and their completions delivered.
    /// Every later operation fails with [`Error::Disposed`].
    pub async fn dispose(&self) {
        let inner = &self.inner;
        let span = tracing::info_span!("dispose", connection_id = %inner.id);
        async {
            let mut session = inner.gate.lock().await;
            if inner.disposed.swap(true, Ordering::AcqRel) {
                tracing::debug!("already disposed");
                return;
            }
            inner.teardown.send_replace(Teardown::Disposed);
            let mut reader = inner.reader.lock().await;
            let mut writer = inner.writer.lock().await;
            drop(take_stream(&mut reader, &mut writer));
            session.tls = TlsState::Plain;
            tracing::info!("transport disposed");
        }
        .instrument(span)
        .await
    }

    /// Abruptly drop the pipe without a TLS shutdown and without taking the
    /// connection lock. Diagnostics only.
    ///
    /// I/O in flight, including a blocked receive, fails with a
    /// connection-aborted error, as does every later receive or send.
    #[cfg(any(test, debug_assertions))]
    pub async fn kill_connection(&self) {
        let inner = &self.inner;
        inner.teardown.send_if_modified(|state| {
            let open = *state == Teardown::Open;
            if open {
                *state = Teardown::Killed;
            }
            open
        });
        let mut reader = inner.reader.lock().await;
        let mut writer = inner.writer.lock().await;
        drop(take_stream(&mut reader, &mut writer));
        inner.peer_closed.store(true, Ordering::Release);
        tracing::debug!(connection_id = %inner.id, "connection killed");
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("connection_id", &self.inner.id)
            .field("status", &self.inner.status)
            .field("pipe", &self.inner.path)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{codes, ErrorRecord};

    #[derive(Default)]
    struct Collect(std::sync::Mutex<Vec<ErrorRecord>>);

    impl ErrorSink for Collect {
        fn report(&self, record: ErrorRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    impl Collect {
        fn records(&self) -> Vec<ErrorRecord> {
            self.0.lock().unwrap().clone()
        }
    }

    fn missing_pipe() -> PipeConfig {
        PipeConfig::builder(".")
            .pipe_name(
                std::env::temp_dir()
                    .join("npipe-wire-no-such-pipe.sock")
                    .to_string_lossy(),
            )
            .build()
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert_eq!(ConnectionId::from_raw(a.as_u64()), a);
    }

    #[test]
    fn test_config_defaults() {
        let config = PipeConfig::new("db01");
        assert_eq!(config.pipe_name, DEFAULT_PIPE_NAME);
        assert_eq!(config.buffer_size, DEFAULT_PACKET_SIZE);
        assert!(config.tls.is_none());
        assert_eq!(config.pipe_path().unc(), r"\\db01\pipe\sql\query");
    }

    #[test]
    fn test_config_builder_clamps_zero_buffer() {
        let config = PipeConfig::builder("db01").buffer_size(0).build();
        assert_eq!(config.buffer_size, 1);
    }

    #[tokio::test]
    async fn test_failed_connect_reports_and_sets_error_status() {
        let sink = Arc::new(Collect::default());
        let handle = TransportHandle::connect(
            missing_pipe(),
            Deadline::after(Duration::from_millis(50)),
            CallbackContext(9),
            sink.clone(),
        )
        .await;

        assert_eq!(handle.status(), Status::Error);
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            records[0].driver_code,
            codes::CONN_OPEN_FAILED | codes::CONN_TIMEOUT
        ));
        assert_eq!(records[0].context, CallbackContext(9));
        assert_eq!(records[0].connection_id, handle.connection_id());
    }

    #[tokio::test]
    async fn test_io_on_failed_handle_is_reported() {
        let sink = Arc::new(Collect::default());
        let handle = TransportHandle::connect(
            missing_pipe(),
            Deadline::Infinite,
            CallbackContext::default(),
            sink.clone(),
        )
        .await;

        assert!(handle.receive(None).await.is_err());
        assert!(handle.send(&Packet::from_payload(b"x")).await.is_err());
        assert_eq!(handle.check_connection(), ReturnCode::Error);
        assert_eq!(sink.records().len(), 4);
    }

    #[tokio::test]
    async fn test_async_without_callback_fails_synchronously() {
        let sink = Arc::new(Collect::default());
        let handle = TransportHandle::connect(
            missing_pipe(),
            Deadline::Infinite,
            CallbackContext::default(),
            sink.clone(),
        )
        .await;

        assert_eq!(handle.receive_async(), ReturnCode::Error);
        assert_eq!(
            handle.send_async(Packet::from_payload(b"x"), None, true),
            ReturnCode::Error
        );
        assert_eq!(sink.records().len(), 3);
    }

    #[tokio::test]
    async fn test_buffer_size_setting() {
        let handle = TransportHandle::connect(
            missing_pipe(),
            Deadline::Infinite,
            CallbackContext::default(),
            Arc::new(Collect::default()),
        )
        .await;
        assert_eq!(handle.buffer_size(), DEFAULT_PACKET_SIZE);
        handle.set_buffer_size(8000);
        assert_eq!(handle.buffer_size(), 8000);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let sink = Arc::new(Collect::default());
        let handle = TransportHandle::connect(
            missing_pipe(),
            Deadline::Infinite,
            CallbackContext::default(),
            sink.clone(),
        )
        .await;
        handle.dispose().await;
        handle.dispose().await;
        assert!(handle.is_disposed());

        let err = handle.receive(None).await.unwrap_err();
        assert!(matches!(err, Error::Disposed));
        assert_eq!(handle.tls_state().await, TlsState::Plain);
    }

    #[tokio::test]
    async fn test_enable_tls_without_pipe_stays_plain() {
        let tls = TlsConfig::builder().webpki_roots().build().unwrap();
        let config = PipeConfig::builder("localhost")
            .pipe_name("/nonexistent/npipe-wire/query.sock")
            .tls(tls)
            .build();
        let handle = TransportHandle::connect(
            config,
            Deadline::Infinite,
            CallbackContext::default(),
            Arc::new(Collect::default()),
        )
        .await;

        assert!(handle.enable_tls(false).await.is_err());
        assert_eq!(handle.tls_state().await, TlsState::Plain);
        assert!(handle.disable_tls().await.is_ok());
    }

    #[test]
    fn test_handshake_error_mapping() {
        let rustls_err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        );
        assert!(matches!(
            handshake_error(rustls_err),
            Error::TlsAuthentication(_)
        ));
        assert!(matches!(
            handshake_error(io::ErrorKind::UnexpectedEof.into()),
            Error::Io(_)
        ));
    }
}
