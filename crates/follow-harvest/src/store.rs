//! Keyed stores owned by one harvesting session.
//!
//! `PresenceStore` holds what the DOM showed, `MetadataStore` what network
//! payloads carried, and `VisitedSet` which physical fragments were already
//! read this crawl. All merges are idempotent, so redundant scans are safe.

use std::collections::{HashMap, HashSet};

use crate::types::{FragmentToken, MemberIdentity, MetadataRecord, PresenceRecord};

/// One entry per identity, in first-discovery order.
#[derive(Debug, Default, Clone)]
pub struct PresenceStore {
    records: HashMap<MemberIdentity, PresenceRecord>,
    order: Vec<MemberIdentity>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a fresh extraction in. Existing non-empty name and avatar win;
    /// reciprocity is OR-combined. Returns `true` if the identity is new.
    pub fn absorb(&mut self, incoming: PresenceRecord) -> bool {
        match self.records.get_mut(&incoming.identity) {
            Some(existing) => {
                if existing.display_name.is_empty() {
                    existing.display_name = incoming.display_name;
                }
                if existing.avatar_ref.is_empty() {
                    existing.avatar_ref = incoming.avatar_ref;
                }
                if existing.profile_ref.is_empty() {
                    existing.profile_ref = incoming.profile_ref;
                }
                existing.reciprocal |= incoming.reciprocal;
                false
            }
            None => {
                self.order.push(incoming.identity.clone());
                self.records.insert(incoming.identity.clone(), incoming);
                true
            }
        }
    }

    pub fn get(&self, identity: &MemberIdentity) -> Option<&PresenceRecord> {
        self.records.get(identity)
    }

    pub fn contains(&self, identity: &MemberIdentity) -> bool {
        self.records.contains_key(identity)
    }

    /// Records in first-discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &PresenceRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.order.clear();
    }
}

/// Network-derived metadata; each field is write-once.
#[derive(Debug, Default, Clone)]
pub struct MetadataStore {
    records: HashMap<MemberIdentity, MetadataRecord>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// First non-null value wins per field; nothing is ever overwritten.
    pub fn absorb(&mut self, identity: MemberIdentity, incoming: MetadataRecord) {
        let slot = self.records.entry(identity).or_default();
        if slot.first_seen_at.is_none() {
            slot.first_seen_at = incoming.first_seen_at;
        }
        if slot.last_activity_at.is_none() {
            slot.last_activity_at = incoming.last_activity_at;
        }
        if slot.reciprocal.is_none() {
            slot.reciprocal = incoming.reciprocal;
        }
    }

    /// A DOM "follows you" label outranks the network hint for this field.
    pub fn promote_reciprocal(&mut self, identity: &MemberIdentity) {
        let slot = self.records.entry(identity.clone()).or_default();
        if slot.reciprocal != Some(true) {
            slot.reciprocal = Some(true);
        }
    }

    pub fn get(&self, identity: &MemberIdentity) -> Option<&MetadataRecord> {
        self.records.get(identity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Fragments already harvested during the current crawl.
#[derive(Debug, Default, Clone)]
pub struct VisitedSet {
    tokens: HashSet<FragmentToken>,
}

impl VisitedSet {
    /// Returns `true` the first time a token is seen.
    pub fn mark(&mut self, token: FragmentToken) -> bool {
        self.tokens.insert(token)
    }

    pub fn contains(&self, token: FragmentToken) -> bool {
        self.tokens.contains(&token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}

/// The three stores of one harvesting session.
#[derive(Debug, Default, Clone)]
pub struct HarvestStores {
    pub presence: PresenceStore,
    pub metadata: MetadataStore,
    pub visited: VisitedSet,
}

impl HarvestStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything; used when a load does not resume.
    pub fn reset(&mut self) {
        self.presence.clear();
        self.metadata.clear();
        self.visited.clear();
    }

    /// Start a new crawl over the same stores.
    pub fn begin_crawl(&mut self) {
        self.visited.clear();
    }
}
