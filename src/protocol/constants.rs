//! TDS framing constants used by the pipe transport

/// Length of a TDS packet header
pub const HEADER_LEN: usize = 8;

/// Packet size negotiated before login (also the default receive buffer size)
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Largest packet size a server may negotiate
pub const MAX_PACKET_SIZE: usize = 32767;

/// Largest TLS payload carried by a single pre-login frame
pub const PRELOGIN_PAYLOAD_MAX: usize = DEFAULT_PACKET_SIZE - HEADER_LEN;

/// Packet type tags
pub mod packet_type {
    /// Pre-login message (also carries the tunnelled TLS handshake)
    pub const PRELOGIN: u8 = 0x12;

    /// Attention (cancel) request
    pub const ATTENTION: u8 = 0x06;
}

/// Header status bits
pub mod status {
    /// More packets of the same message follow
    pub const NORMAL: u8 = 0x00;

    /// Last packet of the message
    pub const END_OF_MESSAGE: u8 = 0x01;
}
