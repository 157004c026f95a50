//! MQTT-MTD - moving-target-defense access control for MQTT
//!
//! Clients obtain batches of single-use tokens from an mTLS issuer and publish or subscribe
//! using a token in place of the real topic name. A proxy in front of the broker trades each
//! token for the real topic through a local verifier, and can open or seal payloads with a
//! key bound to the token batch.

pub mod aead;
pub mod auth;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod storage;
pub mod tls;
pub mod wire;

pub use aead::{AeadKey, AeadType};
pub use auth::{AccessControlList, AccessMask, AccessType, Grant, Secret, Token};
pub use proxy::{Proxy, ProxyConfig};
pub use registry::TokenRegistry;
pub use server::{AuthServer, AuthServerConfig};
pub use tls::TlsMaterial;
