//! Issuance request/response codec
//!
//! Request:  `flags(1) [aead_type(1)] topic_len(2, BE) topic`
//!           flags: bit7 = publish, bit6 = AEAD requested, bits5-0 = batch size / 16
//! Response: `[key] timestamp(6) secret(6) * batch_size`

use super::{put_prefixed, read_exact_timeout, read_u16_timeout, read_u8_timeout, WireError};
use crate::aead::{AeadKey, AeadType};
use crate::auth::{AccessType, Secret, BATCH_GRANULARITY, MAX_BATCH_MULTIPLIER, SECRET_LEN, STAMP_LEN};
use std::time::Duration;
use tokio::io::AsyncRead;

const FLAG_AEAD: u8 = 0x40;
const BATCH_MASK: u8 = 0x3F;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerRequest {
    pub access: AccessType,
    /// `AeadType::None` when no key was requested
    pub aead: AeadType,
    /// Batch size divided by [`BATCH_GRANULARITY`]. Validated by the issuer, not the codec.
    pub batch_multiplier: u8,
    pub topic: Vec<u8>,
}

impl IssuerRequest {
    pub fn new(
        access: AccessType,
        aead: AeadType,
        batch_size: u16,
        topic: impl Into<Vec<u8>>,
    ) -> Result<Self, WireError> {
        let multiplier = u8::try_from(batch_size / BATCH_GRANULARITY).unwrap_or(u8::MAX);
        if batch_size % BATCH_GRANULARITY != 0 || !valid_multiplier(multiplier) {
            return Err(WireError::InvalidBatch(multiplier));
        }
        Ok(Self {
            access,
            aead,
            batch_multiplier: multiplier,
            topic: topic.into(),
        })
    }

    pub fn batch_size(&self) -> u16 {
        self.batch_multiplier as u16 * BATCH_GRANULARITY
    }

    pub fn has_valid_batch(&self) -> bool {
        valid_multiplier(self.batch_multiplier)
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        if !self.has_valid_batch() {
            return Err(WireError::InvalidBatch(self.batch_multiplier));
        }
        let mut out = Vec::with_capacity(4 + self.topic.len());
        let mut flags = self.access.flag_bit() | self.batch_multiplier;
        if self.aead.is_enabled() {
            flags |= FLAG_AEAD;
        }
        out.push(flags);
        if self.aead.is_enabled() {
            out.push(self.aead.as_u8());
        }
        put_prefixed(&mut out, &self.topic)?;
        Ok(out)
    }

    pub async fn read_from<R>(reader: &mut R, timeout: Duration) -> Result<Self, WireError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let flags = read_u8_timeout(reader, timeout).await?;
        let aead = if flags & FLAG_AEAD != 0 {
            AeadType::from_u8(read_u8_timeout(reader, timeout).await?)?
        } else {
            AeadType::None
        };
        let topic_len = read_u16_timeout(reader, timeout).await? as usize;
        let mut topic = vec![0u8; topic_len];
        read_exact_timeout(reader, &mut topic, timeout).await?;

        Ok(Self {
            access: AccessType::from_flag(flags),
            aead,
            batch_multiplier: flags & BATCH_MASK,
            topic,
        })
    }
}

fn valid_multiplier(m: u8) -> bool {
    (1..=MAX_BATCH_MULTIPLIER).contains(&m)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerResponse {
    pub key: Option<AeadKey>,
    pub timestamp: [u8; STAMP_LEN],
    pub secrets: Vec<Secret>,
}

impl IssuerResponse {
    pub fn encode(&self) -> Vec<u8> {
        let key_len = self.key.as_ref().map_or(0, |k| k.as_bytes().len());
        let mut out = Vec::with_capacity(key_len + STAMP_LEN + self.secrets.len() * SECRET_LEN);
        if let Some(key) = &self.key {
            out.extend_from_slice(key.as_bytes());
        }
        out.extend_from_slice(&self.timestamp);
        for secret in &self.secrets {
            out.extend_from_slice(secret.as_bytes());
        }
        out
    }

    /// Read the response to `request`; its size is fully determined by the request
    pub async fn read_from<R>(
        reader: &mut R,
        request: &IssuerRequest,
        timeout: Duration,
    ) -> Result<Self, WireError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let key_len = request.aead.key_len();
        let count = request.batch_size() as usize;
        let mut buf = vec![0u8; key_len + STAMP_LEN + count * SECRET_LEN];
        read_exact_timeout(reader, &mut buf, timeout).await?;

        let key = if request.aead.is_enabled() {
            Some(AeadKey::new(request.aead, buf[..key_len].to_vec())?)
        } else {
            None
        };
        let mut timestamp = [0u8; STAMP_LEN];
        timestamp.copy_from_slice(&buf[key_len..key_len + STAMP_LEN]);
        let secrets = buf[key_len + STAMP_LEN..]
            .chunks_exact(SECRET_LEN)
            .filter_map(Secret::from_slice)
            .collect();

        Ok(Self {
            key,
            timestamp,
            secrets,
        })
    }
}
