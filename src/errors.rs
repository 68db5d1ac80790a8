//! Error types for the SSO authentication procedure
//!
//! Protocol-level outcomes (expired challenge, wrong SMS code, rejected ticket)
//! are typed variants so callers can tell "retry with a new challenge" apart
//! from "abort". Transport faults are wrapped in [`TransportError`] and always
//! keep their original cause.

use std::time::Duration;

use thiserror::Error;

use crate::catalog::MethodKind;
use crate::procedure::ProcedureState;

/// Convenience alias used across the crate
pub type Result<T, E = AuthError> = std::result::Result<T, E>;

/// Errors surfaced by the authentication procedure
#[derive(Debug, Error)]
pub enum AuthError {
    /// The operation is not allowed in the current procedure state
    #[error("`{operation}` is not allowed while the procedure is {state}")]
    InvalidState {
        operation: &'static str,
        state: ProcedureState,
    },

    /// The provider did not return a usable login context or method listing
    #[error("authentication method catalog unavailable: {0}")]
    CatalogUnavailable(String),

    /// The platform registration does not offer the requested method
    #[error("{0} authentication is not offered for this platform")]
    MethodUnavailable(MethodKind),

    /// The QR challenge expired (provider report or local timeout)
    #[error("QR challenge expired before it was confirmed")]
    ChallengeExpired,

    /// The user declined the QR login on their phone
    #[error("QR challenge was rejected on the scanning device")]
    ChallengeRejected,

    /// An SMS was already sent to this number within the resend interval
    #[error("SMS resend requested too early, retry in {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// The submitted SMS code was wrong; more attempts remain
    #[error("incorrect SMS code (attempt {attempts} of {max_attempts})")]
    CodeIncorrect { attempts: u32, max_attempts: u32 },

    /// No attempts remain for the current SMS challenge
    #[error("SMS challenge exhausted after {attempts} attempts, request a new code")]
    CodeExhausted { attempts: u32 },

    /// The provider refused the pass code / verification token
    #[error("ticket rejected by identity provider: {0}")]
    TicketRejected(String),

    /// The token was accepted but the redirect chain never reached the platform
    #[error("authentication succeeded but the platform handshake ended at {final_url}")]
    RedirectIncomplete { final_url: String },

    /// Network or protocol-framing failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The caller cancelled the procedure
    #[error("authentication procedure cancelled")]
    Cancelled,
}

impl AuthError {
    /// Whether the caller can recover by starting a new challenge or code
    /// on the same procedure
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::ChallengeExpired
                | AuthError::ChallengeRejected
                | AuthError::RateLimited { .. }
                | AuthError::CodeIncorrect { .. }
                | AuthError::CodeExhausted { .. }
                | AuthError::MethodUnavailable(_)
        )
    }

    /// Whether this error moves the procedure into the terminal failed state
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthError::CatalogUnavailable(_)
                | AuthError::TicketRejected(_)
                | AuthError::RedirectIncomplete { .. }
                | AuthError::Transport(_)
                | AuthError::Cancelled
        )
    }
}

/// Failures of the HTTP session adapter
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HTTP client could not be constructed
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The HTTP client failed to send the request or read the response
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// A configured or provider-supplied URL could not be parsed
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Low-level I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The provider answered with a body the protocol does not allow
    #[error("unexpected response from {endpoint}: {reason}")]
    UnexpectedResponse { endpoint: String, reason: String },
}

impl TransportError {
    pub(crate) fn unexpected(endpoint: &str, reason: impl Into<String>) -> Self {
        TransportError::UnexpectedResponse {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}

/// Settings loading errors
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: basic_toml::Error,
    },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_and_terminal_are_disjoint() {
        let errors = [
            AuthError::ChallengeExpired,
            AuthError::ChallengeRejected,
            AuthError::RateLimited {
                retry_after: Duration::from_secs(10),
            },
            AuthError::CodeIncorrect {
                attempts: 1,
                max_attempts: 3,
            },
            AuthError::CodeExhausted { attempts: 3 },
            AuthError::TicketRejected("bad".to_string()),
            AuthError::Cancelled,
            AuthError::Transport(TransportError::unexpected("/x", "empty body")),
        ];
        for err in &errors {
            assert!(
                !(err.is_retryable() && err.is_terminal()),
                "{err} is both retryable and terminal"
            );
        }
    }

    #[test]
    fn test_transport_error_keeps_source() {
        use std::error::Error as _;

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = AuthError::from(TransportError::from(io));
        assert!(err.is_terminal());
        assert!(err.to_string().contains("reset by peer"));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_rate_limited_message() {
        let err = AuthError::RateLimited {
            retry_after: Duration::from_secs(42),
        };
        assert_eq!(err.to_string(), "SMS resend requested too early, retry in 42s");
    }
}
