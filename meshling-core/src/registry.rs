//! Client registry: fixed-capacity table of known peers and their session state.

use crate::identity::{Keypair, PeerHash, PublicKey, SharedSecret};

/// Default maximum number of client entries.
pub const MAX_CLIENTS: usize = 32;

/// Maximum length of a cached return path in bytes.
pub const MAX_PATH_LEN: usize = 64;

/// What to do when a new peer probes a full table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Fail closed: new peers are dropped until an entry frees up.
    #[default]
    RejectNew,
    /// Evict the entry with the smallest accepted timestamp to admit the
    /// new peer.
    LeastRecentlySeen,
}

/// Source-routed path to a peer, bounded to `MAX_PATH_LEN` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnPath(Vec<u8>);

impl ReturnPath {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Session state for one known peer. Created on first contact; the shared
/// secret is derived exactly once at creation and never recomputed (both
/// sides use static long-term identities).
#[derive(Debug)]
pub struct ClientEntry {
    identity: PublicKey,
    shared_secret: SharedSecret,
    last_timestamp: u32,
    out_path: Option<ReturnPath>,
}

impl ClientEntry {
    pub fn identity(&self) -> &PublicKey {
        &self.identity
    }

    pub fn shared_secret(&self) -> &SharedSecret {
        &self.shared_secret
    }

    /// Highest accepted replay counter from this peer.
    pub fn last_timestamp(&self) -> u32 {
        self.last_timestamp
    }

    /// Learned return path, if any.
    pub fn out_path(&self) -> Option<&ReturnPath> {
        self.out_path.as_ref()
    }
}

/// Stable handle to a registry slot. Invalidated by eviction; resolve fresh
/// per dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(usize);

/// Transient index built by hash resolution and consumed by same-dispatch
/// secret lookup and path learning. Invalidated by any later resolution or
/// registry mutation; never hold one across dispatches.
#[derive(Debug, Default)]
pub struct PeerIndex {
    slots: Vec<Slot>,
}

impl PeerIndex {
    /// Number of peers that matched the hash.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bounds-checked lookup; `None` for any index outside `0..len()`.
    pub fn get(&self, idx: usize) -> Option<Slot> {
        self.slots.get(idx).copied()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client table full")]
    Full,
    #[error("path of {0} bytes exceeds the {MAX_PATH_LEN}-byte limit")]
    PathTooLong(usize),
}

/// Fixed-capacity table mapping peer identity to session state. Linear scan
/// by identity; the table is small and bounded, so O(n) lookups are fine.
pub struct ClientRegistry {
    entries: Vec<ClientEntry>,
    capacity: usize,
    eviction: EvictionPolicy,
}

impl ClientRegistry {
    pub fn new(capacity: usize, eviction: EvictionPolicy) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            eviction,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entry(&self, slot: Slot) -> &ClientEntry {
        &self.entries[slot.0]
    }

    /// Return the slot for `identity`, creating an entry on first contact.
    /// Creation derives the shared secret synchronously via key agreement
    /// with the local identity. A full table either rejects the new peer or
    /// evicts the least recently seen entry, per policy; no partial entry is
    /// ever created.
    pub fn find_or_create(
        &mut self,
        identity: &PublicKey,
        local: &Keypair,
    ) -> Result<Slot, RegistryError> {
        if let Some(i) = self.entries.iter().position(|e| e.identity.matches(identity)) {
            return Ok(Slot(i));
        }
        if self.entries.len() < self.capacity {
            self.entries.push(Self::new_entry(identity, local));
            return Ok(Slot(self.entries.len() - 1));
        }
        match self.eviction {
            EvictionPolicy::RejectNew => Err(RegistryError::Full),
            EvictionPolicy::LeastRecentlySeen => {
                let stalest = self
                    .entries
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.last_timestamp)
                    .map(|(i, _)| i)
                    .ok_or(RegistryError::Full)?;
                tracing::debug!(slot = stalest, "evicting least recently seen client");
                self.entries[stalest] = Self::new_entry(identity, local);
                Ok(Slot(stalest))
            }
        }
    }

    fn new_entry(identity: &PublicKey, local: &Keypair) -> ClientEntry {
        ClientEntry {
            identity: identity.clone(),
            shared_secret: local.shared_secret(identity),
            last_timestamp: 0,
            out_path: None,
        }
    }

    /// Accept `timestamp` for replay protection if it is strictly greater
    /// than the highest one seen from this peer. Returns whether it was
    /// accepted; on rejection the stored counter is untouched.
    pub fn accept_timestamp(&mut self, slot: Slot, timestamp: u32) -> bool {
        let entry = &mut self.entries[slot.0];
        if timestamp <= entry.last_timestamp {
            return false;
        }
        entry.last_timestamp = timestamp;
        true
    }

    /// Replace the cached return path wholesale. Paths longer than
    /// `MAX_PATH_LEN` are rejected outright, never truncated.
    pub fn update_path(&mut self, slot: Slot, path: &[u8]) -> Result<(), RegistryError> {
        if path.len() > MAX_PATH_LEN {
            return Err(RegistryError::PathTooLong(path.len()));
        }
        self.entries[slot.0].out_path = Some(ReturnPath(path.to_vec()));
        Ok(())
    }

    /// All entries whose identity hashes to `hash`, in slot order. The hash
    /// is short, so multiple matches are expected and not an error.
    pub fn resolve_by_hash(&self, hash: PeerHash) -> PeerIndex {
        PeerIndex {
            slots: self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.identity.hash_matches(hash))
                .map(|(i, _)| Slot(i))
                .collect(),
        }
    }
}
