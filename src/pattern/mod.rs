//! # Pattern
//!
//! Byte patterns with wildcard positions, used to locate known instruction sequences in an image whose layout is not known ahead of time.
//!
//! Patterns are written the way disassemblers print them: `"48 8B ?? ?? 89 05"`.

use std::fmt::{self, Display};
use std::str::FromStr;

use thiserror::Error;

use crate::error::ErrorKind;

pub mod scan;

pub use scan::{scan, MatchSet, ScanRegion};

/// Errors when parsing a pattern string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// The pattern string had no tokens at all
    #[error("pattern is empty")]
    Empty,
    /// A token was neither two hex digits nor a wildcard
    #[error("invalid pattern token '{token}' at position {index}")]
    InvalidToken {
        /// Zero-based token position
        index: usize,
        /// The offending token
        token: String,
    },
}
impl PatternError {
    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidPattern
    }
}

/// A single pattern position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// Matches only this exact byte
    Byte(u8),
    /// Matches any byte
    Any,
}
impl Token {
    /// Whether this position accepts `byte`
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        match self {
            Token::Byte(b) => b == byte,
            Token::Any => true,
        }
    }
}

/// An immutable, fixed-length byte template.
///
/// Matching is positional: a pattern of length `n` is compared against a window of exactly `n` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BytePattern {
    /// Pattern positions in order
    tokens: Box<[Token]>,
}
impl BytePattern {
    /// Creates a pattern from already-parsed tokens
    pub fn new(tokens: impl Into<Box<[Token]>>) -> Result<Self, PatternError> {
        let tokens = tokens.into();
        if tokens.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self { tokens })
    }

    /// Number of bytes a match spans
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Always false; empty patterns are rejected at construction
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Pattern positions in order
    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Whether `window` matches this pattern exactly (modulo wildcards).
    ///
    /// `window` must be the same length as the pattern; anything else never matches.
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() == self.tokens.len()
            && self
                .tokens
                .iter()
                .zip(window)
                .all(|(token, &byte)| token.matches(byte))
    }
}

impl FromStr for BytePattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = s
            .split_whitespace()
            .enumerate()
            .map(|(index, token)| parse_token(index, token))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(tokens)
    }
}

/// Parses one whitespace-delimited token
fn parse_token(index: usize, token: &str) -> Result<Token, PatternError> {
    if token == "??" || token == "?" {
        return Ok(Token::Any);
    }
    // from_str_radix would also accept "+1"
    if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PatternError::InvalidToken {
            index,
            token: token.to_owned(),
        });
    }
    u8::from_str_radix(token, 16)
        .map(Token::Byte)
        .map_err(|_| PatternError::InvalidToken {
            index,
            token: token.to_owned(),
        })
}

impl Display for BytePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, token) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match token {
                Token::Byte(b) => write!(f, "{b:02X}")?,
                Token::Any => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// Renders bytes in pattern notation, e.g. `"A0 05 00 00"`
pub fn format_bytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}
