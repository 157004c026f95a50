//! Byte-level codecs
//!
//! - `issuer`: issuance request/response
//! - `verifier`: verification request/response
//! - `mqtt`: variable byte integers, fixed headers, length-prefixed strings
//!
//! All socket reads and writes go through [`read_exact_timeout`] and [`write_all_timeout`],
//! which fail with [`WireError::Timeout`] when a single attempt exceeds its deadline.

pub mod issuer;
pub mod mqtt;
pub mod verifier;

pub use issuer::{IssuerRequest, IssuerResponse};
pub use verifier::{ResultCode, VerifiedKey, VerifierRequest, VerifierResponse};

use crate::aead::AeadError;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Longest topic a length prefix can describe
pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("connection closed by peer")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("batch multiplier {0} out of range [1, 31]")]
    InvalidBatch(u8),

    #[error("topic of {0} bytes exceeds the length prefix")]
    TopicTooLong(usize),

    #[error("unknown verification result code {0:#04x}")]
    UnknownResultCode(u8),

    #[error(transparent)]
    Aead(#[from] AeadError),

    #[error("variable byte integer did not terminate within 4 bytes")]
    VarIntOverflow,

    #[error("value {0} cannot be encoded as a variable byte integer")]
    VarIntTooLarge(usize),

    #[error("frame body of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl WireError {
    /// Peer went away cleanly between messages
    pub fn is_closed(&self) -> bool {
        matches!(self, WireError::Closed)
    }
}

/// Fill `buf` completely, bounding the whole read by `timeout` (zero means no deadline)
pub async fn read_exact_timeout<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<(), WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let read = reader.read_exact(buf);
    let result = if timeout.is_zero() {
        read.await
    } else {
        tokio::time::timeout(timeout, read)
            .await
            .map_err(|_| WireError::Timeout(timeout))?
    };
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(WireError::Closed),
        Err(e) => Err(WireError::Io(e)),
    }
}

pub async fn read_u8_timeout<R>(reader: &mut R, timeout: Duration) -> Result<u8, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut b = [0u8; 1];
    read_exact_timeout(reader, &mut b, timeout).await?;
    Ok(b[0])
}

pub async fn read_u16_timeout<R>(reader: &mut R, timeout: Duration) -> Result<u16, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut b = [0u8; 2];
    read_exact_timeout(reader, &mut b, timeout).await?;
    Ok(u16::from_be_bytes(b))
}

/// Write and flush `data`, bounding the attempt by `timeout` (zero means no deadline)
pub async fn write_all_timeout<W>(
    writer: &mut W,
    data: &[u8],
    timeout: Duration,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let write = async {
        writer.write_all(data).await?;
        writer.flush().await
    };
    if timeout.is_zero() {
        write.await?;
    } else {
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| WireError::Timeout(timeout))??;
    }
    Ok(())
}

/// Append a u16 length prefix and `bytes`
pub(crate) fn put_prefixed(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), WireError> {
    let len = u16::try_from(bytes.len()).map_err(|_| WireError::TopicTooLong(bytes.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_exact_reports_clean_close() {
        let (mut a, b) = tokio::io::duplex(64);
        drop(b);
        let mut buf = [0u8; 4];
        let err = read_exact_timeout(&mut a, &mut buf, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_read_exact_times_out() {
        let (mut a, _b) = tokio::io::duplex(64);
        let mut buf = [0u8; 4];
        let err = read_exact_timeout(&mut a, &mut buf, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_all_timeout(&mut a, &[0x12, 0x34], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            read_u16_timeout(&mut b, Duration::from_secs(1)).await.unwrap(),
            0x1234
        );
    }

    #[test]
    fn test_put_prefixed_rejects_oversized() {
        let mut out = Vec::new();
        let big = vec![b'a'; MAX_TOPIC_LEN + 1];
        assert!(matches!(
            put_prefixed(&mut out, &big),
            Err(WireError::TopicTooLong(_))
        ));
        put_prefixed(&mut out, b"ab").unwrap();
        assert_eq!(out, vec![0, 2, b'a', b'b']);
    }
}
