//! Authentication and authorization
//!
//! - Tokens: 12-byte single-use credentials (48-bit timestamp + 48-bit secret)
//! - Grants: one client, one topic, one direction, one batch of tokens
//! - ACL: static client → topic → direction mask map
//! - Identity: client name from the mTLS peer certificate

mod acl;
mod grants;
mod identity;
mod tokens;

pub use acl::{AccessControlList, AclError};
pub use grants::{AccessMask, AccessType, Grant};
pub use identity::{identity_from_chain, identity_from_der, IdentityError, IDENTITY_DOMAIN_SUFFIX};
pub use tokens::{
    now_nanos, stamp_of, stamp_value, IssueClock, Secret, Timestamp, Token, TokenError,
    BATCH_GRANULARITY, MAX_BATCH_MULTIPLIER, SECRET_LEN, STAMP_LEN, TOKEN_LEN,
};
