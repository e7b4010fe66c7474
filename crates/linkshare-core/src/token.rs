//! Token generation for LinkShare
//!
//! Tokens are short, human-typeable identifiers a participant shares
//! out-of-band (QR code, link fragment, read aloud) so a peer can find it.
//! The generator only produces random strings; uniqueness against live
//! connections is the caller's job.

use crate::error::TokenError;
use crate::{DEFAULT_TOKEN_ALPHABET, DEFAULT_TOKEN_LENGTH};

/// A public connection identifier
pub type Token = String;

/// Produces random tokens of a fixed length from a fixed alphabet
#[derive(Clone, Debug)]
pub struct TokenGenerator {
    length: usize,
    alphabet: Vec<u8>,
    /// Bytes at or above this value are rejected to keep sampling uniform
    rejection_bound: u16,
}

impl TokenGenerator {
    /// Create a generator.
    ///
    /// The alphabet must be non-empty ASCII with at most 256 symbols.
    pub fn new(length: usize, alphabet: &str) -> Result<Self, TokenError> {
        if alphabet.is_empty() {
            return Err(TokenError::InvalidAlphabet("alphabet is empty"));
        }
        if !alphabet.is_ascii() {
            return Err(TokenError::InvalidAlphabet("alphabet is not ASCII"));
        }
        if alphabet.len() > 256 {
            return Err(TokenError::InvalidAlphabet("alphabet is longer than 256 symbols"));
        }
        Ok(Self::from_symbols(length, alphabet.as_bytes().to_vec()))
    }

    fn from_symbols(length: usize, alphabet: Vec<u8>) -> Self {
        let n = alphabet.len() as u16;
        Self {
            length,
            rejection_bound: 256 - (256 % n),
            alphabet,
        }
    }

    /// Generate a token, drawing every character uniformly and independently
    pub fn generate(&self) -> Result<Token, TokenError> {
        let mut token = String::with_capacity(self.length);
        let mut buf = [0u8; 32];

        while token.len() < self.length {
            getrandom::fill(&mut buf)?;
            for b in buf {
                if u16::from(b) >= self.rejection_bound {
                    continue;
                }
                let idx = usize::from(b) % self.alphabet.len();
                token.push(self.alphabet[idx] as char);
                if token.len() == self.length {
                    break;
                }
            }
        }

        Ok(token)
    }

    /// Check that a string could have been produced by this generator
    pub fn is_well_formed(&self, token: &str) -> bool {
        token.len() == self.length && token.bytes().all(|b| self.alphabet.contains(&b))
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::from_symbols(DEFAULT_TOKEN_LENGTH, DEFAULT_TOKEN_ALPHABET.as_bytes().to_vec())
    }
}

/// Normalize user-typed input (strip whitespace and dashes, uppercase)
pub fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
