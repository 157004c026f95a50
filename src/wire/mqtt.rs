//! MQTT framing primitives
//!
//! A control packet is one type/flags byte, a 1-4 byte variable byte integer holding the
//! remaining length, then that many body bytes.

use super::{read_exact_timeout, read_u8_timeout, WireError};
use std::fmt;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Largest value a 4-byte variable byte integer can hold
pub const MAX_VARINT: usize = 268_435_455;
pub const MAX_VARINT_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Reserved = 0,
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
    Auth = 15,
}

impl PacketType {
    pub fn from_nibble(n: u8) -> Self {
        match n & 0x0F {
            1 => PacketType::Connect,
            2 => PacketType::Connack,
            3 => PacketType::Publish,
            4 => PacketType::Puback,
            5 => PacketType::Pubrec,
            6 => PacketType::Pubrel,
            7 => PacketType::Pubcomp,
            8 => PacketType::Subscribe,
            9 => PacketType::Suback,
            10 => PacketType::Unsubscribe,
            11 => PacketType::Unsuback,
            12 => PacketType::Pingreq,
            13 => PacketType::Pingresp,
            14 => PacketType::Disconnect,
            15 => PacketType::Auth,
            _ => PacketType::Reserved,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format!("{:?}", self).to_uppercase())
    }
}

/// Encode `value` with the minimum number of bytes
pub fn encode_varint(value: usize) -> Result<Vec<u8>, WireError> {
    if value > MAX_VARINT {
        return Err(WireError::VarIntTooLarge(value));
    }
    let mut out = Vec::with_capacity(MAX_VARINT_LEN);
    let mut rest = value;
    loop {
        let mut byte = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if rest == 0 {
            return Ok(out);
        }
    }
}

/// Decode a variable byte integer at the start of `buf`, returning `(value, bytes used)`
pub fn decode_varint(buf: &[u8]) -> Result<(usize, usize), WireError> {
    let mut value = 0usize;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    if buf.len() < MAX_VARINT_LEN {
        Err(WireError::Malformed("truncated variable byte integer"))
    } else {
        Err(WireError::VarIntOverflow)
    }
}

pub async fn read_varint<R>(reader: &mut R, timeout: Duration) -> Result<usize, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut value = 0usize;
    for i in 0..MAX_VARINT_LEN {
        let byte = read_u8_timeout(reader, timeout).await?;
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(WireError::VarIntOverflow)
}

/// One control packet with its body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_type: PacketType,
    pub flags: u8,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn new(packet_type: PacketType, flags: u8, body: Vec<u8>) -> Self {
        Self {
            packet_type,
            flags: flags & 0x0F,
            body,
        }
    }

    pub fn first_byte(&self) -> u8 {
        ((self.packet_type as u8) << 4) | self.flags
    }

    /// PUBLISH quality of service, flag bits 2-1
    pub fn qos(&self) -> u8 {
        (self.flags >> 1) & 0x03
    }

    /// Serialize with a freshly computed remaining length
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let len = encode_varint(self.body.len())?;
        let mut out = Vec::with_capacity(1 + len.len() + self.body.len());
        out.push(self.first_byte());
        out.extend_from_slice(&len);
        out.extend_from_slice(&self.body);
        Ok(out)
    }

    /// Read one frame, rejecting bodies larger than `max_body`. Every read is bounded by
    /// `timeout`.
    pub async fn read_from<R>(
        reader: &mut R,
        max_body: usize,
        timeout: Duration,
    ) -> Result<Self, WireError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        Self::read_after_idle(reader, max_body, timeout, timeout).await
    }

    /// Like [`Frame::read_from`], but the first byte may take up to `idle` to arrive.
    pub async fn read_after_idle<R>(
        reader: &mut R,
        max_body: usize,
        idle: Duration,
        timeout: Duration,
    ) -> Result<Self, WireError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let first = read_u8_timeout(reader, idle).await?;
        let len = read_varint(reader, timeout).await?;
        if len > max_body {
            return Err(WireError::FrameTooLarge { len, max: max_body });
        }
        let mut body = vec![0u8; len];
        read_exact_timeout(reader, &mut body, timeout).await?;
        Ok(Self::new(PacketType::from_nibble(first >> 4), first, body))
    }
}

/// Split a u16-length-prefixed field off the front of `buf`, returning `(field, rest)`
pub fn split_prefixed(buf: &[u8]) -> Result<(&[u8], &[u8]), WireError> {
    if buf.len() < 2 {
        return Err(WireError::Malformed("missing length prefix"));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let rest = &buf[2..];
    if rest.len() < len {
        return Err(WireError::Malformed("length prefix exceeds packet"));
    }
    Ok(rest.split_at(len))
}

/// Protocol level from a CONNECT body (`00 04 "MQTT" level ...`)
pub fn protocol_level(connect_body: &[u8]) -> Result<u8, WireError> {
    if connect_body.len() < 7 {
        return Err(WireError::Malformed("CONNECT too short"));
    }
    if &connect_body[2..6] != b"MQTT" {
        return Err(WireError::Malformed("CONNECT protocol name is not MQTT"));
    }
    Ok(connect_body[6])
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(1);

    #[test]
    fn test_varint_boundaries_use_minimum_length() {
        let cases: [(usize, usize); 8] = [
            (0, 1),
            (127, 1),
            (128, 2),
            (16_383, 2),
            (16_384, 3),
            (2_097_151, 3),
            (2_097_152, 4),
            (MAX_VARINT, 4),
        ];
        for (value, len) in cases {
            let encoded = encode_varint(value).unwrap();
            assert_eq!(encoded.len(), len, "value {}", value);
            assert_eq!(decode_varint(&encoded).unwrap(), (value, len));
        }
    }

    #[test]
    fn test_varint_known_encodings() {
        assert_eq!(encode_varint(321).unwrap(), vec![0xC1, 0x02]);
        assert_eq!(encode_varint(MAX_VARINT).unwrap(), vec![0xFF, 0xFF, 0xFF, 0x7F]);
    }

    #[test]
    fn test_varint_sampled_values() {
        let mut value = 1usize;
        while value <= MAX_VARINT {
            let encoded = encode_varint(value).unwrap();
            assert_eq!(decode_varint(&encoded).unwrap().0, value);
            value = value * 3 + 1;
        }
    }

    #[test]
    fn test_varint_rejects_oversized() {
        assert!(matches!(
            encode_varint(MAX_VARINT + 1),
            Err(WireError::VarIntTooLarge(_))
        ));
        assert!(matches!(
            decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(WireError::VarIntOverflow)
        ));
        assert!(matches!(
            decode_varint(&[0x80]),
            Err(WireError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_read_varint_unterminated() {
        let bytes = [0xFFu8, 0xFF, 0xFF, 0xFF, 0x7F];
        assert!(matches!(
            read_varint(&mut &bytes[..], T).await,
            Err(WireError::VarIntOverflow)
        ));
    }

    #[tokio::test]
    async fn test_frame_read_and_encode() {
        let bytes = [0x32u8, 0x03, 0x00, 0x01, b'a'];
        let frame = Frame::read_from(&mut &bytes[..], 1024, T).await.unwrap();
        assert_eq!(frame.packet_type, PacketType::Publish);
        assert_eq!(frame.flags, 0x02);
        assert_eq!(frame.qos(), 1);
        assert_eq!(frame.body, vec![0x00, 0x01, b'a']);
        assert_eq!(frame.encode().unwrap(), bytes.to_vec());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_before_first_byte() {
        let (mut reader, _writer) = tokio::io::duplex(64);
        let err = Frame::read_after_idle(&mut reader, 1024, Duration::from_millis(20), T)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout(_)));

        let err = Frame::read_from(&mut reader, 1024, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_frame_too_large() {
        let bytes = [0x30u8, 0xC1, 0x02];
        let err = Frame::read_from(&mut &bytes[..], 320, T).await.unwrap_err();
        assert!(matches!(err, WireError::FrameTooLarge { len: 321, max: 320 }));
    }

    #[test]
    fn test_split_prefixed() {
        let (field, rest) = split_prefixed(&[0, 2, b'a', b'b', 9]).unwrap();
        assert_eq!(field, b"ab");
        assert_eq!(rest, &[9]);
        assert!(split_prefixed(&[0, 5, b'a']).is_err());
        assert!(split_prefixed(&[0]).is_err());
    }

    #[test]
    fn test_protocol_level() {
        let body = [0, 4, b'M', b'Q', b'T', b'T', 5, 0x02, 0, 60];
        assert_eq!(protocol_level(&body).unwrap(), 5);
        let bad = [0, 4, b'M', b'Q', b'I', b's', 3];
        assert!(protocol_level(&bad).is_err());
    }
}
