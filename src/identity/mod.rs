//! Identity Module - the user id supplied by the authentication layer
//!
//! The core never authenticates anyone. It receives an already validated
//! [`UserId`] and uses its canonical decimal form as the user's directory name.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid user id: {0}")]
    InvalidUserId(String),
}

/// Opaque, already authenticated user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Big-endian bytes, used as a key prefix by the metadata store
    pub fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl From<u64> for UserId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = IdentityError;

    /// Only the canonical decimal form is accepted, so `"007"` or `"+7"` never
    /// alias the directory of user `7`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: u64 = s
            .parse()
            .map_err(|_| IdentityError::InvalidUserId(s.to_string()))?;

        if id.to_string() != s {
            return Err(IdentityError::InvalidUserId(s.to_string()));
        }

        Ok(Self(id))
    }
}
