//! Histogram metrics

use super::labels;
use std::time::Duration;

/// Time from connect start to an open, checked pipe
pub fn connect_duration(elapsed: Duration) {
    metrics::histogram!(labels::CONNECT_DURATION).record(elapsed.as_secs_f64() * 1000.0);
}

/// Time spent driving the TLS handshake through the tunnel
pub fn tls_handshake_duration(elapsed: Duration) {
    metrics::histogram!(labels::TLS_HANDSHAKE_DURATION).record(elapsed.as_secs_f64() * 1000.0);
}
