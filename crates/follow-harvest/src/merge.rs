//! The single join point between DOM presence and network metadata.

use crate::store::{MetadataStore, PresenceStore};
use crate::types::CanonicalRecord;

/// Combine both stores into one canonical record per present identity.
///
/// Only identities seen in the DOM are emitted. Presentation fields come
/// from the presence record; timestamps from metadata. `reciprocal` takes
/// the metadata value when it is set, else the presence value.
pub fn merge_records(presence: &PresenceStore, metadata: &MetadataStore) -> Vec<CanonicalRecord> {
    presence
        .iter()
        .map(|dom| {
            let extra = metadata.get(&dom.identity);
            CanonicalRecord {
                identity: dom.identity.clone(),
                display_name: dom.display_name.clone(),
                avatar_ref: dom.avatar_ref.clone(),
                profile_ref: dom.profile_ref.clone(),
                reciprocal: extra
                    .and_then(|m| m.reciprocal)
                    .unwrap_or(dom.reciprocal),
                first_seen_at: extra.and_then(|m| m.first_seen_at),
                last_activity_at: extra.and_then(|m| m.last_activity_at),
            }
        })
        .collect()
}
