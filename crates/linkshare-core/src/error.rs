//! Error types shared across LinkShare crates

use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("no configuration directory available")]
    NoConfigDir,
}

/// Token generation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("system entropy source unavailable: {0}")]
    Entropy(String),

    #[error("unusable token alphabet: {0}")]
    InvalidAlphabet(&'static str),
}

impl From<getrandom::Error> for TokenError {
    fn from(e: getrandom::Error) -> Self {
        TokenError::Entropy(e.to_string())
    }
}
