//! Metric names and label values

/// Connections that finished opening
pub const CONNECTIONS_OPENED: &str = "npipe_wire_connections_opened_total";
/// Connection attempts that failed
pub const CONNECTIONS_FAILED: &str = "npipe_wire_connections_failed_total";
/// Packets written to the pipe
pub const PACKETS_SENT: &str = "npipe_wire_packets_sent_total";
/// Packets read from the pipe
pub const PACKETS_RECEIVED: &str = "npipe_wire_packets_received_total";
/// Payload bytes written
pub const BYTES_SENT: &str = "npipe_wire_bytes_sent_total";
/// Payload bytes read
pub const BYTES_RECEIVED: &str = "npipe_wire_bytes_received_total";
/// TLS handshakes by outcome
pub const TLS_HANDSHAKES: &str = "npipe_wire_tls_handshakes_total";
/// Error records handed to the error sink
pub const ERRORS_REPORTED: &str = "npipe_wire_errors_reported_total";
/// Out-of-band sends that went ahead without the primary lock
pub const OOB_LOCK_BYPASSED: &str = "npipe_wire_oob_lock_bypassed_total";
/// Time spent opening the pipe
pub const CONNECT_DURATION: &str = "npipe_wire_connect_duration_ms";
/// Time spent in the TLS handshake
pub const TLS_HANDSHAKE_DURATION: &str = "npipe_wire_tls_handshake_duration_ms";

/// Normal-priority packet
pub const PRIORITY_NORMAL: &str = "normal";
/// Out-of-band (attention) packet
pub const PRIORITY_OUT_OF_BAND: &str = "out_of_band";

/// Successful outcome
pub const OUTCOME_OK: &str = "ok";
/// Failed outcome
pub const OUTCOME_FAILED: &str = "failed";
