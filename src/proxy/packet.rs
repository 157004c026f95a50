//! PUBLISH and SUBSCRIBE body surgery
//!
//! Bodies are split into the topic field(s) and everything around them, so a topic can be
//! swapped while packet identifiers, properties and subscription options are carried over
//! byte for byte.

use crate::wire::mqtt::{decode_varint, split_prefixed};
use crate::wire::{put_prefixed, WireError};

/// Protocol level from which PUBLISH and SUBSCRIBE carry a properties block
pub const PROPERTIES_LEVEL: u8 = 5;

/// A PUBLISH body split around its topic name
#[derive(Debug, PartialEq, Eq)]
pub struct PublishParts<'a> {
    pub topic: &'a [u8],
    /// Packet identifier (QoS > 0) and properties (level >= 5)
    pub between: &'a [u8],
    pub payload: &'a [u8],
}

pub fn split_publish(body: &[u8], level: u8, qos: u8) -> Result<PublishParts<'_>, WireError> {
    let (topic, rest) = split_prefixed(body)?;
    let mut between_len = if qos > 0 { 2 } else { 0 };
    if rest.len() < between_len {
        return Err(WireError::Malformed("PUBLISH missing packet identifier"));
    }
    if level >= PROPERTIES_LEVEL {
        let (props_len, varint_len) = decode_varint(&rest[between_len..])?;
        between_len += varint_len + props_len;
        if rest.len() < between_len {
            return Err(WireError::Malformed("PUBLISH properties exceed packet"));
        }
    }
    let (between, payload) = rest.split_at(between_len);
    Ok(PublishParts {
        topic,
        between,
        payload,
    })
}

pub fn assemble_publish(topic: &[u8], between: &[u8], payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut body = Vec::with_capacity(2 + topic.len() + between.len() + payload.len());
    put_prefixed(&mut body, topic)?;
    body.extend_from_slice(between);
    body.extend_from_slice(payload);
    Ok(body)
}

/// A SUBSCRIBE body split around its topic filters
#[derive(Debug, PartialEq, Eq)]
pub struct SubscribeParts<'a> {
    /// Packet identifier and properties
    pub before: &'a [u8],
    /// Each filter with its options byte
    pub filters: Vec<(&'a [u8], u8)>,
    /// Trailing bytes that do not form a complete filter
    pub after: &'a [u8],
}

pub fn split_subscribe(body: &[u8], level: u8) -> Result<SubscribeParts<'_>, WireError> {
    if body.len() < 2 {
        return Err(WireError::Malformed("SUBSCRIBE missing packet identifier"));
    }
    let mut offset = 2;
    if level >= PROPERTIES_LEVEL {
        let (props_len, varint_len) = decode_varint(&body[offset..])?;
        offset += varint_len + props_len;
        if body.len() < offset {
            return Err(WireError::Malformed("SUBSCRIBE properties exceed packet"));
        }
    }
    let before = &body[..offset];

    let mut filters = Vec::new();
    while body.len() >= offset + 2 {
        let len = u16::from_be_bytes([body[offset], body[offset + 1]]) as usize;
        let end = offset + 2 + len;
        if end + 1 > body.len() {
            break;
        }
        filters.push((&body[offset + 2..end], body[end]));
        offset = end + 1;
    }

    Ok(SubscribeParts {
        before,
        filters,
        after: &body[offset..],
    })
}

pub fn assemble_subscribe<T: AsRef<[u8]>>(
    before: &[u8],
    filters: &[(T, u8)],
    after: &[u8],
) -> Result<Vec<u8>, WireError> {
    let mut body = before.to_vec();
    for (filter, options) in filters {
        put_prefixed(&mut body, filter.as_ref())?;
        body.push(*options);
    }
    body.extend_from_slice(after);
    Ok(body)
}

/// Whether a topic field looks like a base64url token rather than a plain topic
pub fn is_token_candidate(topic: &[u8]) -> bool {
    !topic.is_empty() && topic.len() % 4 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_publish_qos0_v311() {
        let body = [0, 3, b'a', b'/', b'b', b'h', b'i'];
        let parts = split_publish(&body, 4, 0).unwrap();
        assert_eq!(parts.topic, b"a/b");
        assert!(parts.between.is_empty());
        assert_eq!(parts.payload, b"hi");
    }

    #[test]
    fn test_split_publish_qos1_v5_keeps_id_and_properties() {
        // topic "t", packet id 0x0102, properties len 2 (0x01 0x01), payload "x"
        let body = [0, 1, b't', 0x01, 0x02, 0x02, 0x01, 0x01, b'x'];
        let parts = split_publish(&body, 5, 1).unwrap();
        assert_eq!(parts.topic, b"t");
        assert_eq!(parts.between, &[0x01, 0x02, 0x02, 0x01, 0x01]);
        assert_eq!(parts.payload, b"x");

        let rebuilt = assemble_publish(b"longer/topic", parts.between, parts.payload).unwrap();
        let again = split_publish(&rebuilt, 5, 1).unwrap();
        assert_eq!(again.topic, b"longer/topic");
        assert_eq!(again.between, parts.between);
        assert_eq!(again.payload, b"x");
    }

    #[test]
    fn test_split_publish_rejects_truncation() {
        assert!(split_publish(&[0, 9, b'a'], 4, 0).is_err());
        assert!(split_publish(&[0, 1, b'a', 0x01], 4, 1).is_err());
        assert!(split_publish(&[0, 1, b'a', 0x05, 0x01], 5, 0).is_err());
    }

    #[test]
    fn test_split_subscribe_v311() {
        let body = [
            0x00, 0x0A, // packet id
            0, 1, b'a', 0x01, // "a" qos1
            0, 2, b'b', b'c', 0x00, // "bc" qos0
        ];
        let parts = split_subscribe(&body, 4).unwrap();
        assert_eq!(parts.before, &[0x00, 0x0A]);
        assert_eq!(parts.filters, vec![(&b"a"[..], 0x01), (&b"bc"[..], 0x00)]);
        assert!(parts.after.is_empty());

        let rebuilt = assemble_subscribe(parts.before, &parts.filters, parts.after).unwrap();
        assert_eq!(rebuilt, body.to_vec());
    }

    #[test]
    fn test_split_subscribe_v5_properties_and_trailer() {
        let body = [
            0x00, 0x01, // packet id
            0x02, 0x0B, 0x05, // properties: subscription identifier 5
            0, 1, b'z', 0x2A, // "z" with options
            0, 9, b'q', // truncated filter
        ];
        let parts = split_subscribe(&body, 5).unwrap();
        assert_eq!(parts.before, &[0x00, 0x01, 0x02, 0x0B, 0x05]);
        assert_eq!(parts.filters, vec![(&b"z"[..], 0x2A)]);
        assert_eq!(parts.after, &[0, 9, b'q']);
    }

    #[test]
    fn test_assemble_subscribe_with_owned_filters() {
        let filters = vec![(b"real/topic".to_vec(), 0x01u8)];
        let body = assemble_subscribe(&[0, 7], &filters, &[]).unwrap();
        assert_eq!(&body[..4], &[0, 7, 0, 10]);
        assert_eq!(body.last(), Some(&0x01));
    }

    #[test]
    fn test_token_candidate() {
        assert!(is_token_candidate(b"AAAAAAAAAAAAAAAA"));
        assert!(is_token_candidate(b"abcd"));
        assert!(!is_token_candidate(b"abc"));
        assert!(!is_token_candidate(b"sensors/temp1"));
        assert!(!is_token_candidate(b""));
    }
}
