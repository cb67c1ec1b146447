//! Counter metrics

use super::labels;

/// Pipe opened and passed the duplex check
pub fn connection_opened() {
    metrics::counter!(labels::CONNECTIONS_OPENED).increment(1);
}

/// Pipe could not be opened
pub fn connection_failed(reason: &'static str) {
    metrics::counter!(labels::CONNECTIONS_FAILED, "reason" => reason).increment(1);
}

/// One packet written
pub fn packet_sent(priority: &'static str, bytes: usize) {
    metrics::counter!(labels::PACKETS_SENT, "priority" => priority).increment(1);
    metrics::counter!(labels::BYTES_SENT).increment(bytes as u64);
}

/// One packet read
pub fn packet_received(bytes: usize) {
    metrics::counter!(labels::PACKETS_RECEIVED).increment(1);
    metrics::counter!(labels::BYTES_RECEIVED).increment(bytes as u64);
}

/// TLS handshake finished with the given outcome
pub fn tls_handshake(outcome: &'static str) {
    metrics::counter!(labels::TLS_HANDSHAKES, "outcome" => outcome).increment(1);
}

/// Error record reported
pub fn error_reported(kind: &'static str) {
    metrics::counter!(labels::ERRORS_REPORTED, "kind" => kind).increment(1);
}

/// Out-of-band send proceeded without the primary lock
pub fn oob_lock_bypassed() {
    metrics::counter!(labels::OOB_LOCK_BYPASSED).increment(1);
}
