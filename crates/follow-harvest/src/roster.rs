//! Caller-side roster: the accumulated member list a front end keeps across
//! loads and prunes after batches.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::types::{CanonicalRecord, MemberIdentity};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RosterFilter {
    #[default]
    All,
    NotFollowingBack,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RosterSort {
    /// Order of first discovery.
    #[default]
    Discovery,
    /// Most recently followed first.
    FirstSeenDesc,
    /// Least recently active first.
    LastActivityAsc,
    Identity,
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    records: Vec<CanonicalRecord>,
    known: HashSet<MemberIdentity>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append records whose identity is not yet present. The first copy of
    /// an identity is kept. Returns how many were added.
    pub fn extend(&mut self, records: impl IntoIterator<Item = CanonicalRecord>) -> usize {
        let mut added = 0;
        for record in records {
            if self.known.insert(record.identity.clone()) {
                self.records.push(record);
                added += 1;
            }
        }
        added
    }

    /// Whether a load for `limit` members should extend rather than restart.
    pub fn resume_for(&self, limit: usize) -> bool {
        !self.records.is_empty() && limit > self.records.len()
    }

    pub fn view(&self, filter: RosterFilter, sort: RosterSort) -> Vec<&CanonicalRecord> {
        let mut out: Vec<&CanonicalRecord> = self
            .records
            .iter()
            .filter(|r| match filter {
                RosterFilter::All => true,
                RosterFilter::NotFollowingBack => !r.reciprocal,
            })
            .collect();
        match sort {
            RosterSort::Discovery => {}
            RosterSort::FirstSeenDesc => {
                out.sort_by(|a, b| none_last(a.first_seen_at, b.first_seen_at, |x, y| y.cmp(&x)))
            }
            RosterSort::LastActivityAsc => out.sort_by(|a, b| {
                none_last(a.last_activity_at, b.last_activity_at, |x, y| x.cmp(&y))
            }),
            RosterSort::Identity => out.sort_by(|a, b| {
                a.identity
                    .as_str()
                    .to_lowercase()
                    .cmp(&b.identity.as_str().to_lowercase())
            }),
        }
        out
    }

    /// Drop every listed identity. Returns how many were present.
    pub fn remove(&mut self, identities: &[MemberIdentity]) -> usize {
        let gone: HashSet<&MemberIdentity> = identities.iter().collect();
        let before = self.records.len();
        self.records.retain(|r| !gone.contains(&r.identity));
        for id in identities {
            self.known.remove(id);
        }
        before - self.records.len()
    }

    pub fn records(&self) -> &[CanonicalRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Stable ordering with unknown values after known ones.
fn none_last<T: Copy>(a: Option<T>, b: Option<T>, cmp: impl Fn(T, T) -> Ordering) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => cmp(x, y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn rec(id: &str, reciprocal: bool, first_seen: Option<i64>) -> CanonicalRecord {
        CanonicalRecord {
            identity: MemberIdentity::from(id),
            display_name: id.to_uppercase(),
            avatar_ref: String::new(),
            profile_ref: format!("https://x.com/{id}"),
            reciprocal,
            first_seen_at: first_seen.and_then(|s| Utc.timestamp_opt(s, 0).single()),
            last_activity_at: None,
        }
    }

    #[test]
    fn test_extend_keeps_first_copy() {
        let mut roster = Roster::new();
        assert_eq!(roster.extend([rec("a", false, None), rec("b", true, None)]), 2);
        assert_eq!(roster.extend([rec("a", true, None), rec("c", false, None)]), 1);
        assert_eq!(roster.len(), 3);
        assert!(!roster.records()[0].reciprocal);
    }

    #[test]
    fn test_resume_for() {
        let mut roster = Roster::new();
        assert!(!roster.resume_for(100));
        roster.extend([rec("a", false, None), rec("b", false, None)]);
        assert!(roster.resume_for(3));
        assert!(!roster.resume_for(2));
    }

    #[test]
    fn test_not_following_back_filter() {
        let mut roster = Roster::new();
        roster.extend([rec("a", false, None), rec("b", true, None), rec("c", false, None)]);
        let ids: Vec<_> = roster
            .view(RosterFilter::NotFollowingBack, RosterSort::Discovery)
            .iter()
            .map(|r| r.identity.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_first_seen_desc_puts_unknown_last() {
        let mut roster = Roster::new();
        roster.extend([
            rec("old", false, Some(1_600_000_000)),
            rec("unknown", false, None),
            rec("new", false, Some(1_700_000_000)),
        ]);
        let ids: Vec<_> = roster
            .view(RosterFilter::All, RosterSort::FirstSeenDesc)
            .iter()
            .map(|r| r.identity.as_str())
            .collect();
        assert_eq!(ids, vec!["new", "old", "unknown"]);
    }

    #[test]
    fn test_remove_allows_rediscovery() {
        let mut roster = Roster::new();
        roster.extend([rec("a", false, None), rec("b", false, None)]);
        assert_eq!(roster.remove(&[MemberIdentity::from("a"), MemberIdentity::from("zz")]), 1);
        assert_eq!(roster.len(), 1);
        assert_eq!(roster.extend([rec("a", false, None)]), 1);
    }
}
