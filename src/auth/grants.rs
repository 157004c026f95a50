//! Access directions and token grants

use crate::aead::AeadKey;
use crate::auth::tokens::{Secret, Timestamp};
use crate::storage::SecretSource;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Direction a grant (and every token minted for it) may be used in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    /// PUBLISH to the topic
    Publish,
    /// SUBSCRIBE to the topic
    Subscribe,
}

impl AccessType {
    /// Wire flag bit 7 is set for publish
    pub fn from_flag(flag: u8) -> Self {
        if flag & 0x80 != 0 {
            AccessType::Publish
        } else {
            AccessType::Subscribe
        }
    }

    pub fn flag_bit(self) -> u8 {
        match self {
            AccessType::Publish => 0x80,
            AccessType::Subscribe => 0x00,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pub" | "publish" => Some(AccessType::Publish),
            "sub" | "subscribe" => Some(AccessType::Subscribe),
            _ => None,
        }
    }

    /// Short tag used in client-side record names
    pub fn tag(self) -> &'static str {
        match self {
            AccessType::Publish => "PUB",
            AccessType::Subscribe => "SUB",
        }
    }
}

impl fmt::Display for AccessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessType::Publish => write!(f, "pub"),
            AccessType::Subscribe => write!(f, "sub"),
        }
    }
}

/// Directions granted to a client for a topic in the access-control list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMask {
    Pub,
    Sub,
    PubSub,
}

impl AccessMask {
    pub fn allows(self, access: AccessType) -> bool {
        matches!(
            (self, access),
            (AccessMask::Pub | AccessMask::PubSub, AccessType::Publish)
                | (AccessMask::Sub | AccessMask::PubSub, AccessType::Subscribe)
        )
    }
}

impl fmt::Display for AccessMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMask::Pub => write!(f, "Pub"),
            AccessMask::Sub => write!(f, "Sub"),
            AccessMask::PubSub => write!(f, "PubSub"),
        }
    }
}

/// An active authorization: one client, one topic, one direction, one batch of tokens.
///
/// Grants live inside the [`TokenRegistry`](crate::registry::TokenRegistry) and are only
/// handed out by reference while the registry lock is held.
pub struct Grant {
    pub topic: Vec<u8>,
    pub client_identity: Vec<u8>,
    pub access: AccessType,
    /// Full nanosecond wall clock at issuance. Tokens carry its low 48 bits.
    pub issued_at: Timestamp,
    pub token_count: u16,
    /// Index of the next token to be consumed
    pub cursor: u16,
    /// `None` while a file-backed advance is in flight
    pub current_secret: Option<Secret>,
    pub secrets: Arc<dyn SecretSource>,
    pub aead: Option<AeadKey>,
}

impl Grant {
    /// Build a fresh grant positioned at the first token of its batch
    pub fn new(
        client_identity: Vec<u8>,
        topic: Vec<u8>,
        access: AccessType,
        issued_at: Timestamp,
        token_count: u16,
        first_secret: Secret,
        secrets: Arc<dyn SecretSource>,
        aead: Option<AeadKey>,
    ) -> Self {
        Self {
            topic,
            client_identity,
            access,
            issued_at,
            token_count,
            cursor: 0,
            current_secret: Some(first_secret),
            secrets,
            aead,
        }
    }

    /// Whether this grant belongs to `(client, topic, access)`
    pub fn is_for(&self, client_identity: &[u8], topic: &[u8], access: AccessType) -> bool {
        self.access == access && self.topic == topic && self.client_identity == client_identity
    }

    pub fn remaining(&self) -> u16 {
        self.token_count.saturating_sub(self.cursor)
    }
}

impl fmt::Debug for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Grant")
            .field("topic", &String::from_utf8_lossy(&self.topic))
            .field("client", &String::from_utf8_lossy(&self.client_identity))
            .field("access", &self.access)
            .field("issued_at", &self.issued_at)
            .field("cursor", &self.cursor)
            .field("token_count", &self.token_count)
            .field("aead", &self.aead.as_ref().map(|k| k.kind))
            .finish()
    }
}
