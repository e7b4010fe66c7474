//! LinkShare Core - Shared configuration, token generation, and error types
//!
//! This crate contains the foundational pieces used by the LinkShare signal
//! server. It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod token;

pub use config::{Config, Environment, LimitsConfig, ServerConfig, SessionConfig};
pub use error::{ConfigError, TokenError};
pub use token::{Token, TokenGenerator};

/// Default length of an issued token in characters
pub const DEFAULT_TOKEN_LENGTH: usize = 5;

/// Default token alphabet (uppercase letters and digits)
pub const DEFAULT_TOKEN_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Number of generation attempts before admission gives up on a unique token
pub const DEFAULT_TOKEN_ATTEMPTS: usize = 10;

/// Default inactivity timeout before a silent connection is closed (5 minutes)
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 300;

/// Default HTTP/WebSocket port
pub const DEFAULT_PORT: u16 = 8000;
