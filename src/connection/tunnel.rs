//! TLS-over-pre-login tunnel
//!
//! During pre-login the server expects the TLS handshake to travel inside
//! TDS PRELOGIN packets. [`TlsTunnel`] sits between the raw pipe and the TLS
//! engine and does that wrapping:
//!
//! * **Handshake mode**: every write is split into frames of at most
//!   [`PRELOGIN_PAYLOAD_MAX`] bytes, each prefixed with a PRELOGIN header.
//!   Reads strip headers and only ever return payload bytes of the current
//!   frame, so nothing past a frame boundary is consumed.
//! * **Pass-through mode**: after [`TlsTunnel::finish_handshake`] the bytes
//!   are opaque TLS records and flow unchanged.
//!
//! A TLS engine may keep reading once its handshake is complete. If the bytes
//! at a frame boundary do not start a PRELOGIN frame, the peer has already
//! left the tunnel; the adapter switches to pass-through and hands those bytes
//! on unchanged.
//!
//! The adapter is symmetric; the server side of a pipe can use it too.

use crate::protocol::constants::{packet_type, HEADER_LEN, PRELOGIN_PAYLOAD_MAX};
use crate::protocol::PreloginHeader;
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelMode {
    Handshake,
    PassThrough,
}

/// Stream adapter that frames a TLS handshake in PRELOGIN packets.
#[derive(Debug)]
pub struct TlsTunnel<S> {
    inner: S,
    mode: TunnelMode,
    /// Partially read frame header
    header: [u8; HEADER_LEN],
    header_filled: usize,
    /// Payload bytes left in the frame being read
    frame_remaining: usize,
    /// Framed bytes accepted from the TLS engine but not yet written
    pending: BytesMut,
    /// Unframed bytes read while looking for a header
    carry: BytesMut,
}

impl<S> TlsTunnel<S> {
    /// Wrap `inner`, starting in handshake mode
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            mode: TunnelMode::Handshake,
            header: [0; HEADER_LEN],
            header_filled: 0,
            frame_remaining: 0,
            pending: BytesMut::new(),
            carry: BytesMut::new(),
        }
    }

    /// Stop framing: from now on bytes are opaque application data.
    pub fn finish_handshake(&mut self) {
        debug_assert!(self.pending.is_empty(), "handshake bytes left unflushed");
        self.mode = TunnelMode::PassThrough;
    }

    /// Go back to handshake mode with clean framing state, so a new
    /// handshake can run over the same pipe.
    pub fn restart_handshake(&mut self) {
        self.mode = TunnelMode::Handshake;
        self.header_filled = 0;
        self.frame_remaining = 0;
        self.pending.clear();
        self.carry.clear();
    }

    /// Whether writes are still being wrapped in PRELOGIN frames
    pub fn is_tunnelling(&self) -> bool {
        self.mode == TunnelMode::Handshake
    }

    /// Underlying stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Underlying stream, mutably. Bytes written here bypass framing.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> TlsTunnel<S> {
    /// Write out framed bytes accepted earlier
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TlsTunnel<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if this.mode == TunnelMode::PassThrough {
            if !this.carry.is_empty() {
                let n = this.carry.len().min(buf.remaining());
                buf.put_slice(&this.carry[..n]);
                this.carry.advance(n);
                return Poll::Ready(Ok(()));
            }
            return Pin::new(&mut this.inner).poll_read(cx, buf);
        }

        while this.frame_remaining == 0 {
            while this.header_filled < HEADER_LEN {
                let mut header_buf = ReadBuf::new(&mut this.header[this.header_filled..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut header_buf))?;
                let n = header_buf.filled().len();
                if n == 0 {
                    if this.header_filled == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "pipe closed inside a pre-login frame header",
                    )));
                }
                if this.header_filled == 0 && this.header[0] != packet_type::PRELOGIN {
                    tracing::trace!("unframed bytes at frame boundary, leaving tunnel");
                    let take = n.min(buf.remaining());
                    buf.put_slice(&this.header[..take]);
                    this.carry.extend_from_slice(&this.header[take..n]);
                    this.mode = TunnelMode::PassThrough;
                    return Poll::Ready(Ok(()));
                }
                this.header_filled += n;
            }
            this.header_filled = 0;

            let header = PreloginHeader::decode(&this.header)?;
            tracing::trace!(
                packet_type = header.packet_type,
                len = header.payload_len(),
                "pre-login frame"
            );
            this.frame_remaining = header.payload_len();
        }

        let want = this.frame_remaining.min(buf.remaining());
        let n = {
            let dst = buf.initialize_unfilled_to(want);
            let mut chunk = ReadBuf::new(dst);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))?;
            chunk.filled().len()
        };
        if n == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "pipe closed inside a pre-login frame",
            )));
        }
        buf.advance(n);
        this.frame_remaining -= n;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TlsTunnel<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if this.mode == TunnelMode::PassThrough {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let take = buf.len().min(PRELOGIN_PAYLOAD_MAX);
        let header = PreloginHeader::for_payload(packet_type::PRELOGIN, take, take == buf.len());
        this.pending.reserve(HEADER_LEN + take);
        this.pending.extend_from_slice(&header.encode());
        this.pending.extend_from_slice(&buf[..take]);

        // The frame is accepted either way; a write that would block is
        // finished by the next write or flush.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
