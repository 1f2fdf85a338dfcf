//! Phone-style identifiers that key every provisioning workflow.
//!
//! Users type numbers in whatever shape their locale favours
//! (`+55 (11) 99999-8888`, `55.11.99999.8888`). The workflow, the state
//! store, and the provider tags all need one canonical spelling, so input is
//! reduced to its digits and checked against the E.164 length range.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_DIGITS: usize = 8;
const MAX_DIGITS: usize = 15;

/// Errors raised while normalising an identifier.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum IdentifierError {
    /// Raised when the input is empty after trimming.
    #[error("identifier must not be empty")]
    Empty,
    /// Raised when the input contains a character that is neither a digit
    /// nor an accepted separator.
    #[error("identifier contains unsupported character {0:?}")]
    InvalidCharacter(char),
    /// Raised when the digit count falls outside the E.164 range.
    #[error("identifier must contain between 8 and 15 digits, got {0}")]
    Length(usize),
}

/// Normalised identifier containing only ASCII digits.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier(String);

impl Identifier {
    /// Parses and normalises a phone-style identifier.
    ///
    /// Separators (`+`, `-`, `.`, `(`, `)`, and whitespace) are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`IdentifierError`] when the input is empty, contains other
    /// characters, or has an unsupported number of digits.
    pub fn parse(raw: &str) -> Result<Self, IdentifierError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdentifierError::Empty);
        }

        let mut digits = String::with_capacity(trimmed.len());
        for ch in trimmed.chars() {
            match ch {
                '0'..='9' => digits.push(ch),
                '+' | '-' | '.' | '(' | ')' => {}
                other if other.is_whitespace() => {}
                other => return Err(IdentifierError::InvalidCharacter(other)),
            }
        }

        if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
            return Err(IdentifierError::Length(digits.len()));
        }
        Ok(Self(digits))
    }

    /// Returns the canonical digit string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Provider tag that binds an instance to this identifier.
    #[must_use]
    pub fn instance_tag(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.0)
    }

    /// Provider instance name derived from this identifier.
    ///
    /// Names mirror the tag so a relaunch can find the instance either way.
    #[must_use]
    pub fn instance_name(&self, prefix: &str) -> String {
        self.instance_tag(prefix)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl TryFrom<String> for Identifier {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Identifier> for String {
    fn from(value: Identifier) -> Self {
        value.0
    }
}
