//! Static access-control list
//!
//! Loaded once at startup from YAML of the form:
//!
//! ```yaml
//! client1:
//!   sensors/temp: Pub
//!   sensors/humidity: PubSub
//! ```

use crate::auth::grants::AccessMask;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AclError {
    #[error("failed to read ACL file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid ACL file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct AccessControlList {
    entries: HashMap<String, HashMap<String, AccessMask>>,
}

impl AccessControlList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, AclError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, AclError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Insert or replace one entry
    pub fn allow(&mut self, client: &str, topic: &str, mask: AccessMask) -> &mut Self {
        self.entries
            .entry(client.to_string())
            .or_default()
            .insert(topic.to_string(), mask);
        self
    }

    /// Mask granted to `client` for `topic`, by exact match
    pub fn lookup(&self, client: &[u8], topic: &[u8]) -> Option<AccessMask> {
        let client = std::str::from_utf8(client).ok()?;
        let topic = std::str::from_utf8(topic).ok()?;
        self.entries.get(client)?.get(topic).copied()
    }

    pub fn clients(&self) -> impl Iterator<Item = (&str, &HashMap<String, AccessMask>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
client1:
  sensors/temp: Pub
  sensors/humidity: PubSub
client2:
  sensors/temp: Sub
";

    #[test]
    fn test_acl_parse_and_lookup() {
        let acl = AccessControlList::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(acl.len(), 3);
        assert_eq!(
            acl.lookup(b"client1", b"sensors/temp"),
            Some(AccessMask::Pub)
        );
        assert_eq!(
            acl.lookup(b"client1", b"sensors/humidity"),
            Some(AccessMask::PubSub)
        );
        assert_eq!(
            acl.lookup(b"client2", b"sensors/temp"),
            Some(AccessMask::Sub)
        );
        assert_eq!(acl.lookup(b"client2", b"sensors/humidity"), None);
        assert_eq!(acl.lookup(b"nobody", b"sensors/temp"), None);
    }

    #[test]
    fn test_acl_exact_match_only() {
        let acl = AccessControlList::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(acl.lookup(b"client1", b"sensors/#"), None);
        assert_eq!(acl.lookup(b"client1", b"sensors/temp/"), None);
    }

    #[test]
    fn test_acl_rejects_unknown_access() {
        let result = AccessControlList::from_yaml_str("client1:\n  a: Write\n");
        assert!(matches!(result, Err(AclError::Parse(_))));
    }

    #[test]
    fn test_acl_builder() {
        let mut acl = AccessControlList::new();
        acl.allow("c", "t", AccessMask::Sub).allow("c", "u", AccessMask::Pub);
        assert_eq!(acl.lookup(b"c", b"t"), Some(AccessMask::Sub));
        assert_eq!(acl.lookup(b"c", b"u"), Some(AccessMask::Pub));
    }
}
