//! TLS state machine

use crate::{Error, Result};

/// Encryption state of a transport handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsState {
    /// Traffic flows over the raw pipe
    #[default]
    Plain,

    /// TLS handshake in progress through the pre-login tunnel
    Handshaking,

    /// Traffic flows over the TLS stream
    Secure,
}

impl TlsState {
    /// Check if transition is valid
    pub fn can_transition_to(&self, next: TlsState) -> bool {
        use TlsState::*;

        matches!(
            (self, next),
            (Plain, Handshaking) | (Handshaking, Secure) | (Handshaking, Plain) | (Secure, Plain)
        )
    }

    /// Transition to new state
    pub fn transition(&mut self, next: TlsState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::TlsInvalidState {
                expected: format!("valid transition from {}", self),
                actual: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for TlsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain => write!(f, "plain"),
            Self::Handshaking => write!(f, "handshaking"),
            Self::Secure => write!(f, "secure"),
        }
    }
}
