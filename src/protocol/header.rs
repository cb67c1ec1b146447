//! Pre-login frame header encoding and decoding

use super::constants::{status, HEADER_LEN, MAX_PACKET_SIZE};
use std::io;

/// Header of a TDS packet.
///
/// Only pre-login frames are built by this crate; the layout is shared with
/// every other TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloginHeader {
    /// Packet type
    pub packet_type: u8,
    /// Status bits
    pub status: u8,
    /// Total frame length, header included
    pub length: u16,
    /// Server process id (0 from the client)
    pub spid: u16,
    /// Sequence number within the message
    pub packet_id: u8,
    /// Unused, always 0
    pub window: u8,
}

impl PreloginHeader {
    /// Header for a frame carrying `payload_len` bytes.
    ///
    /// `last` marks the frame as the end of the message.
    pub fn for_payload(packet_type: u8, payload_len: usize, last: bool) -> Self {
        debug_assert!(payload_len + HEADER_LEN <= MAX_PACKET_SIZE);
        Self {
            packet_type,
            status: if last {
                status::END_OF_MESSAGE
            } else {
                status::NORMAL
            },
            length: (payload_len + HEADER_LEN) as u16,
            spid: 0,
            packet_id: 0,
            window: 0,
        }
    }

    /// Number of payload bytes following the header
    pub fn payload_len(&self) -> usize {
        usize::from(self.length) - HEADER_LEN
    }

    /// Whether this frame ends its message
    pub fn is_end_of_message(&self) -> bool {
        self.status & status::END_OF_MESSAGE != 0
    }

    /// Encode into the 8-byte wire form
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.length.to_be_bytes();
        let spid = self.spid.to_be_bytes();
        [
            self.packet_type,
            self.status,
            len[0],
            len[1],
            spid[0],
            spid[1],
            self.packet_id,
            self.window,
        ]
    }

    /// Decode from the 8-byte wire form
    ///
    /// # Errors
    ///
    /// Returns `InvalidData` if the length field is shorter than the header or
    /// larger than the maximum packet size.
    pub fn decode(data: &[u8; HEADER_LEN]) -> io::Result<Self> {
        let length = u16::from_be_bytes([data[2], data[3]]);
        if usize::from(length) < HEADER_LEN || usize::from(length) > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid pre-login frame length: {}", length),
            ));
        }

        Ok(Self {
            packet_type: data[0],
            status: data[1],
            length,
            spid: u16::from_be_bytes([data[4], data[5]]),
            packet_id: data[6],
            window: data[7],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::constants::packet_type;
    use super::*;

    #[test]
    fn test_encode_layout() {
        let header = PreloginHeader::for_payload(packet_type::PRELOGIN, 300, true);
        assert_eq!(header.encode(), [0x12, 0x01, 0x01, 0x34, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_reads_big_endian_fields() {
        let header = PreloginHeader::decode(&[0x12, 0x00, 0x00, 0x10, 0x00, 0x35, 0x02, 0x00])
            .expect("valid header");
        assert_eq!(header.packet_type, packet_type::PRELOGIN);
        assert!(!header.is_end_of_message());
        assert_eq!(header.length, 16);
        assert_eq!(header.payload_len(), 8);
        assert_eq!(header.spid, 0x35);
        assert_eq!(header.packet_id, 2);
    }

    #[test]
    fn test_decode_rejects_short_length() {
        let err = PreloginHeader::decode(&[0x12, 0x01, 0x00, 0x07, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let err = PreloginHeader::decode(&[0x12, 0x01, 0x80, 0x00, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_empty_payload_frame() {
        let header = PreloginHeader::for_payload(packet_type::PRELOGIN, 0, true);
        let decoded = PreloginHeader::decode(&header.encode()).expect("valid header");
        assert_eq!(decoded.payload_len(), 0);
        assert!(decoded.is_end_of_message());
    }
}
