//! Token Registry
//!
//! Active grants live in an arena of generation-checked slots threaded onto a doubly linked
//! list in insertion order. Because issuance timestamps only grow, the list is also ordered
//! by `issued_at`, so expiry only ever pops from the head. A secondary index keyed by the
//! 48-bit wire stamp makes token lookup O(1).
//!
//! The registry does no locking itself; it is shared as [`SharedRegistry`] and every call
//! happens with that lock held.

use crate::auth::{stamp_of, stamp_value, AccessType, Grant, Timestamp, Token};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

fn wire_stamp(ts: Timestamp) -> u64 {
    stamp_value(&stamp_of(ts))
}

pub type SharedRegistry = Arc<Mutex<TokenRegistry>>;

/// Grants older than this are expired
pub const DEFAULT_HORIZON: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Broken list invariants. These indicate a bug and are not recoverable.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry head/tail inconsistency: {0}")]
    Inconsistent(&'static str),

    #[error("grant issued at {new} precedes newest grant issued at {newest}")]
    OutOfOrder { new: Timestamp, newest: Timestamp },
}

/// Stable handle to a grant slot. Stale handles never alias a newer grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantId {
    index: usize,
    generation: u64,
}

struct Entry {
    grant: Grant,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    entry: Option<Entry>,
}

/// Result of [`TokenRegistry::lookup_by_token`]
#[derive(Debug, Default)]
pub struct Lookup {
    pub grant: Option<GrantId>,
    /// Grants dropped for age during the lookup; their secret sources should be discarded
    /// once the lock is released
    pub evicted: Vec<Grant>,
}

pub struct TokenRegistry {
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    by_stamp: HashMap<u64, Vec<usize>>,
    len: usize,
    horizon: Duration,
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HORIZON)
    }
}

impl TokenRegistry {
    pub fn new(horizon: Duration) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            by_stamp: HashMap::new(),
            len: 0,
            horizon,
        }
    }

    pub fn shared(horizon: Duration) -> SharedRegistry {
        Arc::new(Mutex::new(Self::new(horizon)))
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add a grant at the newest end
    pub fn append(&mut self, grant: Grant) -> Result<GrantId, RegistryError> {
        match (self.head, self.tail) {
            (None, None) => {}
            (Some(_), Some(tail)) => {
                let newest = self
                    .entry(tail)
                    .ok_or(RegistryError::Inconsistent("tail points at an empty slot"))?;
                if newest.next.is_some() {
                    return Err(RegistryError::Inconsistent("tail has a successor"));
                }
                if grant.issued_at < newest.grant.issued_at {
                    return Err(RegistryError::OutOfOrder {
                        new: grant.issued_at,
                        newest: newest.grant.issued_at,
                    });
                }
            }
            _ => return Err(RegistryError::Inconsistent("exactly one of head/tail is set")),
        }

        let stamp = wire_stamp(grant.issued_at);
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        let slot = &mut self.slots[index];
        slot.entry = Some(Entry {
            grant,
            prev: self.tail,
            next: None,
        });
        let id = GrantId {
            index,
            generation: slot.generation,
        };

        if let Some(tail) = self.tail {
            if let Some(prev) = self.entry_mut(tail) {
                prev.next = Some(index);
            }
        } else {
            self.head = Some(index);
        }
        self.tail = Some(index);
        self.by_stamp.entry(stamp).or_default().push(index);
        self.len += 1;
        Ok(id)
    }

    /// Unlink the live grant for `(client, topic, access)`, if any
    pub fn revoke_matching(
        &mut self,
        client_identity: &[u8],
        topic: &[u8],
        access: AccessType,
    ) -> Option<Grant> {
        let index = self
            .indices()
            .find(|&i| {
                self.entry(i)
                    .is_some_and(|e| e.grant.is_for(client_identity, topic, access))
            })?;
        self.unlink(index)
    }

    /// Find the grant whose current token is `token`.
    ///
    /// Expired grants are evicted first, so an expired grant is never returned. Does not
    /// touch the cursor.
    pub fn lookup_by_token(&mut self, token: &Token, now: Timestamp) -> Lookup {
        let evicted = self.evict_expired(now, self.horizon);
        let grant = self.by_stamp.get(&token.stamp_value()).and_then(|indices| {
            indices.iter().copied().find(|&i| {
                self.entry(i).is_some_and(|e| {
                    e.grant
                        .current_secret
                        .as_ref()
                        .is_some_and(|s| s == token.secret())
                })
            })
        });
        Lookup {
            grant: grant.map(|index| GrantId {
                index,
                generation: self.slots[index].generation,
            }),
            evicted,
        }
    }

    pub fn get(&self, id: GrantId) -> Option<&Grant> {
        self.checked(id).and_then(|i| self.entry(i)).map(|e| &e.grant)
    }

    pub fn get_mut(&mut self, id: GrantId) -> Option<&mut Grant> {
        let i = self.checked(id)?;
        self.entry_mut(i).map(|e| &mut e.grant)
    }

    pub fn remove(&mut self, id: GrantId) -> Option<Grant> {
        let i = self.checked(id)?;
        self.unlink(i)
    }

    /// Pop grants from the oldest end while `now - issued_at > max_age`
    pub fn evict_expired(&mut self, now: Timestamp, max_age: Duration) -> Vec<Grant> {
        let max_age = max_age.as_nanos().min(u64::MAX as u128) as u64;
        let mut evicted = Vec::new();
        while let Some(head) = self.head {
            let expired = self
                .entry(head)
                .is_some_and(|e| now.saturating_sub(e.grant.issued_at) > max_age);
            if !expired {
                break;
            }
            match self.unlink(head) {
                Some(grant) => evicted.push(grant),
                None => break,
            }
        }
        evicted
    }

    /// Grants from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &Grant> + '_ {
        self.indices()
            .filter_map(move |i| self.entry(i).map(|e| &e.grant))
    }

    fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, move |&i| self.entry(i).and_then(|e| e.next))
    }

    fn checked(&self, id: GrantId) -> Option<usize> {
        let slot = self.slots.get(id.index)?;
        (slot.generation == id.generation && slot.entry.is_some()).then_some(id.index)
    }

    fn entry(&self, index: usize) -> Option<&Entry> {
        self.slots.get(index).and_then(|s| s.entry.as_ref())
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut Entry> {
        self.slots.get_mut(index).and_then(|s| s.entry.as_mut())
    }

    fn unlink(&mut self, index: usize) -> Option<Grant> {
        let slot = self.slots.get_mut(index)?;
        let entry = slot.entry.take()?;
        slot.generation += 1;

        match entry.prev {
            Some(p) => {
                if let Some(prev) = self.entry_mut(p) {
                    prev.next = entry.next;
                }
            }
            None => self.head = entry.next,
        }
        match entry.next {
            Some(n) => {
                if let Some(next) = self.entry_mut(n) {
                    next.prev = entry.prev;
                }
            }
            None => self.tail = entry.prev,
        }

        let stamp = wire_stamp(entry.grant.issued_at);
        if let Some(indices) = self.by_stamp.get_mut(&stamp) {
            indices.retain(|&i| i != index);
            if indices.is_empty() {
                self.by_stamp.remove(&stamp);
            }
        }

        self.free.push(index);
        self.len -= 1;
        Some(entry.grant)
    }
}
