//! Verification request/response codec
//!
//! Request:  `flags(1) token(12)`, flags bit7 = publish
//! Response: `code(1) [index(2) aead_type(1) key] [topic_len(2) topic]`
//!           the key block is present for the "with key" codes, the topic for every success

use super::{put_prefixed, read_exact_timeout, read_u16_timeout, read_u8_timeout, WireError};
use crate::aead::{AeadKey, AeadType};
use crate::auth::{AccessType, Token, TOKEN_LEN};
use std::time::Duration;
use tokio::io::AsyncRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifierRequest {
    pub access: AccessType,
    pub token: Token,
}

impl VerifierRequest {
    pub fn new(access: AccessType, token: Token) -> Self {
        Self { access, token }
    }

    pub fn encode(&self) -> [u8; 1 + TOKEN_LEN] {
        let mut out = [0u8; 1 + TOKEN_LEN];
        out[0] = self.access.flag_bit();
        out[1..].copy_from_slice(&self.token.to_bytes());
        out
    }

    pub async fn read_from<R>(reader: &mut R, timeout: Duration) -> Result<Self, WireError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = [0u8; 1 + TOKEN_LEN];
        read_exact_timeout(reader, &mut buf, timeout).await?;
        let token = Token::from_bytes(&buf[1..]).map_err(|_| WireError::Malformed("token"))?;
        Ok(Self {
            access: AccessType::from_flag(buf[0]),
            token,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0x00,
    SuccessReloadNeeded = 0x01,
    SuccessWithKey = 0x20,
    SuccessWithKeyReloadNeeded = 0x21,
    Fail = 0x80,
    /// Reserved for anomaly signaling; never produced
    Suspicious = 0x81,
}

impl ResultCode {
    pub fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            0x00 => Ok(ResultCode::Success),
            0x01 => Ok(ResultCode::SuccessReloadNeeded),
            0x20 => Ok(ResultCode::SuccessWithKey),
            0x21 => Ok(ResultCode::SuccessWithKeyReloadNeeded),
            0x80 => Ok(ResultCode::Fail),
            0x81 => Ok(ResultCode::Suspicious),
            other => Err(WireError::UnknownResultCode(other)),
        }
    }

    pub fn is_success(self) -> bool {
        (self as u8) & 0x80 == 0
    }

    pub fn has_key(self) -> bool {
        matches!(
            self,
            ResultCode::SuccessWithKey | ResultCode::SuccessWithKeyReloadNeeded
        )
    }

    pub fn reload_needed(self) -> bool {
        matches!(
            self,
            ResultCode::SuccessReloadNeeded | ResultCode::SuccessWithKeyReloadNeeded
        )
    }
}

/// AEAD material for the token that was just verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedKey {
    /// Position of the verified token in its batch
    pub index: u16,
    pub key: AeadKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifierResponse {
    Success {
        reload_needed: bool,
        key: Option<VerifiedKey>,
        topic: Vec<u8>,
    },
    Fail,
    Suspicious,
}

impl VerifierResponse {
    pub fn code(&self) -> ResultCode {
        match self {
            VerifierResponse::Success {
                reload_needed,
                key,
                ..
            } => match (key.is_some(), reload_needed) {
                (false, false) => ResultCode::Success,
                (false, true) => ResultCode::SuccessReloadNeeded,
                (true, false) => ResultCode::SuccessWithKey,
                (true, true) => ResultCode::SuccessWithKeyReloadNeeded,
            },
            VerifierResponse::Fail => ResultCode::Fail,
            VerifierResponse::Suspicious => ResultCode::Suspicious,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, VerifierResponse::Success { .. })
    }

    pub fn topic(&self) -> Option<&[u8]> {
        match self {
            VerifierResponse::Success { topic, .. } => Some(topic),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = vec![self.code() as u8];
        if let VerifierResponse::Success { key, topic, .. } = self {
            if let Some(k) = key {
                out.extend_from_slice(&k.index.to_be_bytes());
                out.push(k.key.kind.as_u8());
                out.extend_from_slice(k.key.as_bytes());
            }
            put_prefixed(&mut out, topic)?;
        }
        Ok(out)
    }

    pub async fn read_from<R>(reader: &mut R, timeout: Duration) -> Result<Self, WireError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let code = ResultCode::from_u8(read_u8_timeout(reader, timeout).await?)?;
        if !code.is_success() {
            return Ok(match code {
                ResultCode::Suspicious => VerifierResponse::Suspicious,
                _ => VerifierResponse::Fail,
            });
        }

        let key = if code.has_key() {
            let index = read_u16_timeout(reader, timeout).await?;
            let kind = AeadType::from_u8(read_u8_timeout(reader, timeout).await?)?;
            if !kind.is_enabled() {
                return Err(WireError::Malformed("key result without AEAD type"));
            }
            let mut bytes = vec![0u8; kind.key_len()];
            read_exact_timeout(reader, &mut bytes, timeout).await?;
            Some(VerifiedKey {
                index,
                key: AeadKey::new(kind, bytes)?,
            })
        } else {
            None
        };

        let topic_len = read_u16_timeout(reader, timeout).await? as usize;
        let mut topic = vec![0u8; topic_len];
        read_exact_timeout(reader, &mut topic, timeout).await?;

        Ok(VerifierResponse::Success {
            reload_needed: code.reload_needed(),
            key,
            topic,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Secret;

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn test_request_layout() {
        let token = Token::new(0x0102_0304_0506, Secret::new([7; 6]));
        let bytes = VerifierRequest::new(AccessType::Publish, token).encode();
        assert_eq!(bytes[0], 0x80);
        assert_eq!(&bytes[1..7], &[1, 2, 3, 4, 5, 6]);
        assert_eq!(&bytes[7..], &[7; 6]);
        let bytes = VerifierRequest::new(AccessType::Subscribe, token).encode();
        assert_eq!(bytes[0], 0x00);
    }

    #[tokio::test]
    async fn test_request_decoding() {
        let token = Token::new(42, Secret::new([1; 6]));
        let bytes = VerifierRequest::new(AccessType::Publish, token).encode();
        let req = VerifierRequest::read_from(&mut &bytes[..], T).await.unwrap();
        assert_eq!(req.access, AccessType::Publish);
        assert_eq!(req.token, token);
    }

    #[test]
    fn test_result_codes() {
        assert!(ResultCode::Success.is_success());
        assert!(ResultCode::SuccessWithKeyReloadNeeded.is_success());
        assert!(!ResultCode::Fail.is_success());
        assert!(!ResultCode::Suspicious.is_success());
        assert!(ResultCode::SuccessWithKey.has_key());
        assert!(!ResultCode::SuccessReloadNeeded.has_key());
        assert!(matches!(
            ResultCode::from_u8(0x02),
            Err(WireError::UnknownResultCode(0x02))
        ));
    }

    #[test]
    fn test_response_layout_with_key() {
        let resp = VerifierResponse::Success {
            reload_needed: true,
            key: Some(VerifiedKey {
                index: 3,
                key: AeadKey::new(AeadType::Aes128Gcm, vec![0x11; 16]).unwrap(),
            }),
            topic: b"ab".to_vec(),
        };
        let bytes = resp.encode().unwrap();
        assert_eq!(bytes[0], 0x21);
        assert_eq!(&bytes[1..3], &[0, 3]);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(&bytes[4..20], &[0x11; 16]);
        assert_eq!(&bytes[20..], &[0, 2, b'a', b'b']);
    }

    #[test]
    fn test_fail_is_one_byte() {
        assert_eq!(VerifierResponse::Fail.encode().unwrap(), vec![0x80]);
    }

    #[tokio::test]
    async fn test_response_decoding() {
        let resp = VerifierResponse::Success {
            reload_needed: false,
            key: None,
            topic: b"sensors/temp".to_vec(),
        };
        let bytes = resp.encode().unwrap();
        assert_eq!(bytes[0], 0x00);
        let parsed = VerifierResponse::read_from(&mut &bytes[..], T).await.unwrap();
        assert_eq!(parsed, resp);
        assert_eq!(parsed.topic(), Some(&b"sensors/temp"[..]));
    }

    #[tokio::test]
    async fn test_response_unknown_code_is_error() {
        let bytes = [0x42u8];
        let err = VerifierResponse::read_from(&mut &bytes[..], T).await.unwrap_err();
        assert!(matches!(err, WireError::UnknownResultCode(0x42)));
    }

    #[tokio::test]
    async fn test_response_key_without_type_is_error() {
        let bytes = [0x20u8, 0x00, 0x00, 0x00, 0x00, 0x00];
        let err = VerifierResponse::read_from(&mut &bytes[..], T).await.unwrap_err();
        assert!(matches!(err, WireError::Malformed(_)));
    }
}
