//! Error types for the signal server

use thiserror::Error;

use linkshare_core::{ConfigError, TokenError};

/// Reasons a connection is refused before it enters the protocol
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("rate limited")]
    RateLimited,

    #[error("origin unknown")]
    OriginUnknown,

    #[error("failed to generate token after {attempts} attempts")]
    TokenSpaceExhausted { attempts: usize },

    #[error("token generation failed: {0}")]
    Token(String),
}

impl AdmissionError {
    /// Human-readable close reason sent to the refused client
    pub fn close_reason(&self) -> &'static str {
        match self {
            AdmissionError::RateLimited => "rate limited",
            AdmissionError::OriginUnknown => "origin unknown",
            AdmissionError::TokenSpaceExhausted { .. } | AdmissionError::Token(_) => {
                "failed to generate token"
            }
        }
    }
}

impl From<TokenError> for AdmissionError {
    fn from(e: TokenError) -> Self {
        AdmissionError::Token(e.to_string())
    }
}

/// Outbound delivery failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("outbound queue full")]
    Backpressure,
}

/// Client protocol violations; terminal for the offending connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("missing @type discriminator")]
    MissingType,

    #[error("field `{field}` must be a {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("content sent before pairing")]
    NotPaired,
}

/// Server startup and runtime errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
