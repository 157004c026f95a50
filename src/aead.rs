//! Payload AEAD
//!
//! Publish payloads may be sealed with a per-batch key. The 96-bit nonce is
//! `NONCE_BASE + spice` as a big-endian u64 followed by four zero bytes, where the spice is
//! the token index (client → broker) or the session sequence number (broker → client).

use aes_gcm::aead::{Aead, KeyInit, Nonce};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::TryRngCore;
use std::fmt;
use thiserror::Error;

pub const NONCE_BASE: u64 = 123_456;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum AeadError {
    #[error("unknown AEAD type {0:#04x}")]
    UnknownType(u8),

    #[error("invalid key length for {kind}: {len}")]
    InvalidKey { kind: AeadType, len: usize },

    #[error("AEAD seal failed")]
    Seal,

    #[error("AEAD open failed")]
    Open,

    #[error("random source failure: {0}")]
    Random(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AeadType {
    None = 0x00,
    Aes128Gcm = 0x01,
    Aes256Gcm = 0x02,
    ChaCha20Poly1305 = 0x03,
}

impl AeadType {
    pub fn from_u8(value: u8) -> Result<Self, AeadError> {
        match value {
            0x00 => Ok(AeadType::None),
            0x01 => Ok(AeadType::Aes128Gcm),
            0x02 => Ok(AeadType::Aes256Gcm),
            0x03 => Ok(AeadType::ChaCha20Poly1305),
            other => Err(AeadError::UnknownType(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_enabled(self) -> bool {
        self != AeadType::None
    }

    pub fn key_len(self) -> usize {
        match self {
            AeadType::None => 0,
            AeadType::Aes128Gcm => 16,
            AeadType::Aes256Gcm | AeadType::ChaCha20Poly1305 => 32,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(AeadType::None),
            "aes128gcm" | "aes-128-gcm" => Some(AeadType::Aes128Gcm),
            "aes256gcm" | "aes-256-gcm" => Some(AeadType::Aes256Gcm),
            "chacha20poly1305" | "chacha20-poly1305" => Some(AeadType::ChaCha20Poly1305),
            _ => None,
        }
    }
}

impl fmt::Display for AeadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AeadType::None => "none",
            AeadType::Aes128Gcm => "aes-128-gcm",
            AeadType::Aes256Gcm => "aes-256-gcm",
            AeadType::ChaCha20Poly1305 => "chacha20-poly1305",
        };
        write!(f, "{}", name)
    }
}

/// Key bound to one token batch
#[derive(Clone, PartialEq, Eq)]
pub struct AeadKey {
    pub kind: AeadType,
    bytes: Vec<u8>,
}

impl AeadKey {
    pub fn new(kind: AeadType, bytes: Vec<u8>) -> Result<Self, AeadError> {
        if !kind.is_enabled() || bytes.len() != kind.key_len() {
            return Err(AeadError::InvalidKey {
                kind,
                len: bytes.len(),
            });
        }
        Ok(Self { kind, bytes })
    }

    /// Fresh key from the operating system's CSPRNG
    pub fn generate(kind: AeadType) -> Result<Self, AeadError> {
        let mut bytes = vec![0u8; kind.key_len()];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| AeadError::Random(e.to_string()))?;
        Self::new(kind, bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn seal(&self, plaintext: &[u8], spice: u64) -> Result<Vec<u8>, AeadError> {
        let nonce = nonce_for(spice);
        match self.kind {
            AeadType::Aes128Gcm => seal_with::<Aes128Gcm>(self, &nonce, plaintext),
            AeadType::Aes256Gcm => seal_with::<Aes256Gcm>(self, &nonce, plaintext),
            AeadType::ChaCha20Poly1305 => seal_with::<ChaCha20Poly1305>(self, &nonce, plaintext),
            AeadType::None => Err(AeadError::InvalidKey {
                kind: self.kind,
                len: self.bytes.len(),
            }),
        }
    }

    pub fn open(&self, ciphertext: &[u8], spice: u64) -> Result<Vec<u8>, AeadError> {
        let nonce = nonce_for(spice);
        match self.kind {
            AeadType::Aes128Gcm => open_with::<Aes128Gcm>(self, &nonce, ciphertext),
            AeadType::Aes256Gcm => open_with::<Aes256Gcm>(self, &nonce, ciphertext),
            AeadType::ChaCha20Poly1305 => open_with::<ChaCha20Poly1305>(self, &nonce, ciphertext),
            AeadType::None => Err(AeadError::InvalidKey {
                kind: self.kind,
                len: self.bytes.len(),
            }),
        }
    }
}

impl fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AeadKey({}, [REDACTED])", self.kind)
    }
}

pub fn nonce_for(spice: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&NONCE_BASE.wrapping_add(spice).to_be_bytes());
    nonce
}

fn seal_with<C: Aead + KeyInit>(
    key: &AeadKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = C::new_from_slice(key.as_bytes()).map_err(|_| AeadError::InvalidKey {
        kind: key.kind,
        len: key.bytes.len(),
    })?;
    cipher
        .encrypt(Nonce::<C>::from_slice(nonce), plaintext)
        .map_err(|_| AeadError::Seal)
}

fn open_with<C: Aead + KeyInit>(
    key: &AeadKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = C::new_from_slice(key.as_bytes()).map_err(|_| AeadError::InvalidKey {
        kind: key.kind,
        len: key.bytes.len(),
    })?;
    cipher
        .decrypt(Nonce::<C>::from_slice(nonce), ciphertext)
        .map_err(|_| AeadError::Open)
}
