//! Packet buffers exchanged with the pipe
//!
//! A [`Packet`] is a byte buffer with an optional reserved header area in
//! front of its data. Inbound packets are filled by a single read from the
//! active stream; the TDS layer above reassembles messages from them.
//! Releasing a packet is dropping it.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// A unit of I/O on the transport
#[derive(Debug, Clone)]
pub struct Packet {
    /// Reserved header bytes followed by data
    buf: BytesMut,
    header_len: usize,
    data_capacity: usize,
    out_of_band: bool,
}

impl Packet {
    /// Allocate an empty packet with room for `header_size` header bytes and
    /// up to `data_size` data bytes.
    pub fn allocate(header_size: usize, data_size: usize) -> Self {
        let mut buf = BytesMut::with_capacity(header_size + data_size);
        buf.resize(header_size, 0);
        Self {
            buf,
            header_len: header_size,
            data_capacity: data_size,
            out_of_band: false,
        }
    }

    /// Build an outbound packet holding `data` and no reserved header.
    pub fn from_payload(data: impl AsRef<[u8]>) -> Self {
        let data = data.as_ref();
        let mut packet = Self::allocate(0, data.len());
        packet.buf.put_slice(data);
        packet
    }

    /// Mark this packet as out-of-band (an attention packet that may bypass
    /// the send queue).
    pub fn with_out_of_band(mut self, out_of_band: bool) -> Self {
        self.out_of_band = out_of_band;
        self
    }

    /// Whether this packet is out-of-band
    pub fn is_out_of_band(&self) -> bool {
        self.out_of_band
    }

    /// Number of data bytes
    pub fn len(&self) -> usize {
        self.buf.len() - self.header_len
    }

    /// Whether the packet holds no data
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of data bytes a single read may place in this packet
    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }

    /// Data bytes
    pub fn data(&self) -> &[u8] {
        &self.buf[self.header_len..]
    }

    /// Reserved header bytes, for the layer that owns the header format
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.header_len]
    }

    /// Append data bytes to an outbound packet
    pub fn append(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Consume the packet and return its data bytes
    pub fn into_data(mut self) -> Bytes {
        self.buf.split_off(self.header_len).freeze()
    }

    /// Fill the packet with a single read from `stream`.
    ///
    /// Reads at most the remaining data capacity and returns the number of
    /// bytes read; 0 means the peer closed the stream. Cancel safe.
    pub async fn read_from_stream<S>(&mut self, stream: &mut S) -> io::Result<usize>
    where
        S: AsyncRead + Unpin + ?Sized,
    {
        let room = self.data_capacity.saturating_sub(self.len());
        if room == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "packet has no room left for data",
            ));
        }
        let mut limited = (&mut self.buf).limit(room);
        stream.read_buf(&mut limited).await
    }

    /// Write the whole packet (header area included) to `stream` and flush.
    pub async fn write_to_stream<S>(&self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncWrite + Unpin + ?Sized,
    {
        stream.write_all(&self.buf).await?;
        stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_reserves_header() {
        let mut packet = Packet::allocate(16, 4096);
        assert_eq!(packet.len(), 0);
        assert!(packet.is_empty());
        assert_eq!(packet.header_mut().len(), 16);
        assert_eq!(packet.data_capacity(), 4096);
        assert!(!packet.is_out_of_band());
    }

    #[test]
    fn test_from_payload() {
        let packet = Packet::from_payload(b"select 1").with_out_of_band(true);
        assert_eq!(packet.data(), b"select 1");
        assert_eq!(packet.len(), 8);
        assert!(packet.is_out_of_band());
        assert_eq!(&packet.into_data()[..], b"select 1");
    }

    #[tokio::test]
    async fn test_read_is_bounded_by_capacity() {
        let mut stream = tokio_test::io::Builder::new().read(b"abcdefgh").build();
        let mut packet = Packet::allocate(0, 4);
        let n = packet.read_from_stream(&mut stream).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(packet.data(), b"abcd");
    }

    #[tokio::test]
    async fn test_read_reports_eof_as_zero() {
        let mut stream = tokio_test::io::Builder::new().build();
        let mut packet = Packet::allocate(0, 64);
        let n = packet.read_from_stream(&mut stream).await.unwrap();
        assert_eq!(n, 0);
        assert!(packet.is_empty());
    }

    #[tokio::test]
    async fn test_write_includes_header() {
        let mut packet = Packet::allocate(2, 3);
        packet.header_mut().copy_from_slice(&[0xAA, 0xBB]);
        packet.append(b"xyz");
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0xAA, 0xBB, b'x', b'y', b'z'])
            .build();
        packet.write_to_stream(&mut stream).await.unwrap();
    }
}
