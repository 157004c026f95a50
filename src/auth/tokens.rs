//! Token types
//!
//! A token is 12 bytes: the low 48 bits of its grant's issuance timestamp (big-endian)
//! followed by a 48-bit random secret. Topics carry tokens as base64url text.

use base64::{engine::general_purpose::URL_SAFE, Engine};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const STAMP_LEN: usize = 6;
pub const SECRET_LEN: usize = 6;
pub const TOKEN_LEN: usize = STAMP_LEN + SECRET_LEN;

/// Batch sizes are multiples of this
pub const BATCH_GRANULARITY: u16 = 16;
pub const MAX_BATCH_MULTIPLIER: u8 = 31;

/// Nanoseconds since the Unix epoch
pub type Timestamp = u64;

const STAMP_MASK: u64 = (1 << 48) - 1;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token length: expected {TOKEN_LEN}, got {0}")]
    InvalidLength(usize),

    #[error("token decode error: {0}")]
    DecodeError(String),
}

/// 48-bit random value paired with a timestamp to form one token
#[derive(Clone, Copy)]
pub struct Secret([u8; SECRET_LEN]);

impl Secret {
    pub fn new(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; SECRET_LEN]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for Secret {}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

/// Low 48 bits of a timestamp, big-endian
pub fn stamp_of(ts: Timestamp) -> [u8; STAMP_LEN] {
    let be = (ts & STAMP_MASK).to_be_bytes();
    let mut out = [0u8; STAMP_LEN];
    out.copy_from_slice(&be[8 - STAMP_LEN..]);
    out
}

pub fn stamp_value(stamp: &[u8; STAMP_LEN]) -> u64 {
    let mut be = [0u8; 8];
    be[8 - STAMP_LEN..].copy_from_slice(stamp);
    u64::from_be_bytes(be)
}

/// A single-use credential presented in place of a topic name
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token {
    stamp: [u8; STAMP_LEN],
    secret: Secret,
}

impl Token {
    pub fn new(issued_at: Timestamp, secret: Secret) -> Self {
        Self {
            stamp: stamp_of(issued_at),
            secret,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() != TOKEN_LEN {
            return Err(TokenError::InvalidLength(bytes.len()));
        }
        let mut stamp = [0u8; STAMP_LEN];
        stamp.copy_from_slice(&bytes[..STAMP_LEN]);
        let mut secret = [0u8; SECRET_LEN];
        secret.copy_from_slice(&bytes[STAMP_LEN..]);
        Ok(Self {
            stamp,
            secret: Secret(secret),
        })
    }

    /// Decode the base64url form carried in a topic field
    pub fn from_base64(text: &[u8]) -> Result<Self, TokenError> {
        let raw = URL_SAFE
            .decode(text)
            .map_err(|e| TokenError::DecodeError(e.to_string()))?;
        Self::from_bytes(&raw)
    }

    pub fn to_bytes(&self) -> [u8; TOKEN_LEN] {
        let mut out = [0u8; TOKEN_LEN];
        out[..STAMP_LEN].copy_from_slice(&self.stamp);
        out[STAMP_LEN..].copy_from_slice(self.secret.as_bytes());
        out
    }

    pub fn to_base64(&self) -> String {
        URL_SAFE.encode(self.to_bytes())
    }

    pub fn stamp(&self) -> &[u8; STAMP_LEN] {
        &self.stamp
    }

    pub fn stamp_value(&self) -> u64 {
        stamp_value(&self.stamp)
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:012x}, [REDACTED])", self.stamp_value())
    }
}

/// Wall clock in nanoseconds
pub fn now_nanos() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Hands out strictly increasing issuance timestamps
#[derive(Debug, Default)]
pub struct IssueClock {
    last: AtomicU64,
}

impl IssueClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Timestamp {
        let now = now_nanos();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}
