//! Payload Correlator: fold intercepted timeline responses into the
//! metadata store.
//!
//! This channel is opportunistic. Anything that does not parse, or does not
//! have the expected shape, is ignored without error.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::store::MetadataStore;
use crate::types::{MemberIdentity, MetadataRecord};

/// Ordering tokens above this are treated as microsecond-scale and divided
/// by 1000 before being read as milliseconds.
pub const MICROS_SCALE_FLOOR: u128 = 10_u128.pow(13);
/// Ordering tokens above this (and not above [`MICROS_SCALE_FLOOR`]) are
/// milliseconds since the epoch.
pub const MILLIS_SCALE_FLOOR: u128 = 10_u128.pow(11);
/// Ordering tokens at or above this (and not above [`MILLIS_SCALE_FLOOR`])
/// are seconds since the epoch. Anything smaller is not a timestamp.
pub const SECONDS_SCALE_FLOOR: u128 = 10_u128.pow(9);

/// Decoded instants outside `[PLAUSIBLE_MIN_MS, PLAUSIBLE_MAX_MS)` are
/// discarded (2001-09-09 .. 2100-01-01).
pub const PLAUSIBLE_MIN_MS: i64 = 1_000_000_000_000;
pub const PLAUSIBLE_MAX_MS: i64 = 4_102_444_800_000;

const TIMELINE_DATE_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

/// Counts from one `ingest` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    /// Entries with a usable handle, folded into the store.
    pub absorbed: usize,
    /// Entries without a handle.
    pub skipped: usize,
}

/// Parses timeline payloads. Stateless; the store is passed in.
#[derive(Debug, Default, Clone, Copy)]
pub struct PayloadCorrelator;

impl PayloadCorrelator {
    pub fn new() -> Self {
        Self
    }

    /// Parse one raw response body and merge every member entry found.
    pub fn ingest(&self, raw: &str, store: &mut MetadataStore) -> IngestReport {
        let mut report = IngestReport::default();
        let json: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("ignoring non-JSON payload ({} bytes): {e}", raw.len());
                return report;
            }
        };

        for entry in timeline_entries(&json) {
            match extract_entry(entry) {
                Some((identity, record)) => {
                    store.absorb(identity, record);
                    report.absorbed += 1;
                }
                None => report.skipped += 1,
            }
        }

        if report.absorbed > 0 {
            tracing::debug!(
                "payload absorbed {} entries ({} skipped)",
                report.absorbed,
                report.skipped
            );
        }
        report
    }
}

/// All timeline entries nested anywhere under the known instruction paths.
fn timeline_entries(json: &Value) -> Vec<&Value> {
    let result = json.pointer("/data/user/result");
    let instructions = result
        .and_then(|r| {
            r.pointer("/timeline/timeline/instructions")
                .or_else(|| r.pointer("/timeline_v2/timeline/instructions"))
        })
        .and_then(Value::as_array);

    let mut out = Vec::new();
    for ins in instructions.into_iter().flatten() {
        if let Some(entries) = ins
            .get("entries")
            .or_else(|| ins.pointer("/addEntries/entries"))
            .and_then(Value::as_array)
        {
            out.extend(entries.iter());
        }
        if let Some(single) = ins.get("entry").filter(|e| e.is_object()) {
            out.push(single);
        }
    }
    out
}

fn extract_entry(entry: &Value) -> Option<(MemberIdentity, MetadataRecord)> {
    let user = entry.pointer("/content/itemContent/user_results/result")?;
    let legacy = user.get("legacy");

    let handle = legacy
        .and_then(|l| l.get("screen_name"))
        .or_else(|| user.pointer("/core/screen_name"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())?;

    let first_seen_at = entry.get("sortIndex").and_then(decode_ordering_token);

    let last_activity_at = legacy
        .and_then(|l| l.pointer("/status/created_at"))
        .and_then(Value::as_str)
        .and_then(parse_activity_time);

    let reciprocal = legacy
        .and_then(|l| l.get("followed_by"))
        .or_else(|| user.pointer("/relationship_perspectives/followed_by"))
        .and_then(Value::as_bool);

    Some((
        MemberIdentity::new(handle),
        MetadataRecord {
            first_seen_at,
            last_activity_at,
            reciprocal,
        },
    ))
}

/// Decode a monotonically-assigned ordering token into an instant.
///
/// Accepts a JSON string of digits or a non-negative integral number.
/// Returns `None` for anything outside the plausible range.
pub fn decode_ordering_token(token: &Value) -> Option<DateTime<Utc>> {
    let n: u128 = match token {
        Value::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
            s.parse().ok()?
        }
        Value::Number(num) => match num.as_u64() {
            Some(u) => u128::from(u),
            None => {
                let f = num.as_f64()?;
                if !f.is_finite() || f < 0.0 || f.fract() != 0.0 || f > u64::MAX as f64 {
                    return None;
                }
                f as u128
            }
        },
        _ => return None,
    };
    decode_ordering_value(n)
}

/// Magnitude-based decoding of a raw ordering value.
pub fn decode_ordering_value(n: u128) -> Option<DateTime<Utc>> {
    let millis = if n > MICROS_SCALE_FLOOR {
        n / 1000
    } else if n > MILLIS_SCALE_FLOOR {
        n
    } else if n >= SECONDS_SCALE_FLOOR {
        n * 1000
    } else {
        return None;
    };

    let millis = i64::try_from(millis).ok()?;
    if !(PLAUSIBLE_MIN_MS..PLAUSIBLE_MAX_MS).contains(&millis) {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

/// Parse a "most recent content" timestamp in any of the formats the
/// timeline API has used.
pub fn parse_activity_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .or_else(|_| DateTime::parse_from_str(s, TIMELINE_DATE_FORMAT))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
