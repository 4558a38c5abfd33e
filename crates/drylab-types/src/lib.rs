#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **drylab-types** – Core types for the drylab event ledger.
//!
//! This crate defines the strongly-named aliases and records shared by every
//! other drylab crate: the content-addressed [`Blob`]/[`Sha256`] pair, the
//! [`SchemaId`] that partitions validation, and the [`EventHeader`]/[`EventRow`]
//! records that make up the ledger's durable log. It has no I/O and no
//! storage opinions of its own.

use chrono::Utc;
use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Core type aliases
//─────────────────────────────

/// An opaque, immutable byte payload. Identity is its content.
pub type Blob = Vec<u8>;

/// The 64-character lowercase hexadecimal SHA-256 digest of a [`Blob`].
pub type Sha256 = String;

/// A textual schema identifier of the form `NAME@VERSION`, e.g. `RMSD_CSV@1`.
///
/// Case-sensitive; treated opaquely everywhere except the registry, which
/// uses it to locate a schema document.
pub type SchemaId = String;

/// Integer milliseconds since the Unix epoch, UTC.
pub type Timestamp = i64;

/// Returns the current wall-clock time as a [`Timestamp`].
pub fn now_ms() -> Timestamp {
    Utc::now().timestamp_millis()
}

//─────────────────────────────
//  Event header / row
//─────────────────────────────

/// Immutable metadata attached to every committed event.
///
/// `id` always equals `sha256(blob)` for the event's associated blob; `ts`
/// is assigned by the ledger at publish time and never supplied by callers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventHeader {
    /// Content hash of the associated blob.
    pub id: Sha256,
    /// Schema that validated the blob.
    pub schema: SchemaId,
    /// Commit timestamp, milliseconds since epoch.
    pub ts: Timestamp,
}

/// A committed event: a header plus its blob, placed in a run at a sequence
/// number.
///
/// `seq` is a per-`run_id` monotonically increasing positive integer, dense
/// and gap-free, starting at 1.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRow {
    /// The event's header.
    pub header: EventHeader,
    /// The event's payload bytes.
    pub blob: Blob,
    /// The run this event belongs to.
    pub run_id: String,
    /// Position of this event within its run.
    pub seq: i64,
}

/// A prospective event submitted for publication.
///
/// The ledger computes `id`, `ts` and `seq` itself; none of those may be
/// supplied here.
#[derive(Clone, Debug)]
pub struct PublishRequest {
    /// The run to publish into.
    pub run_id: String,
    /// The schema the blob will be validated against.
    pub schema: SchemaId,
    /// The payload bytes.
    pub blob: Blob,
}

impl PublishRequest {
    /// Convenience constructor.
    pub fn new(run_id: impl Into<String>, schema: impl Into<String>, blob: impl Into<Blob>) -> Self {
        Self {
            run_id: run_id.into(),
            schema: schema.into(),
            blob: blob.into(),
        }
    }
}

//─────────────────────────────
//  Publish outcomes
//─────────────────────────────

/// The result of a call to `Ledger::publish`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The event was committed as a new row; carries the blob's hash.
    Committed(Sha256),
    /// An event with the same `(run_id, schema, sha)` already existed; no
    /// row was inserted. Callers may treat this as success.
    Duplicate,
    /// The blob failed schema validation; no trace was left in the store.
    Rejected(RejectReason),
}

/// Why a `publish` call was rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RejectReason {
    /// No validator is registered for the requested schema.
    UnknownSchema,
    /// The validator rejected the payload.
    InvalidPayload(String),
}

//─────────────────────────────
//  Reactor header pattern
//─────────────────────────────

/// A header-matching predicate: every populated field must equal the
/// corresponding field on the candidate header for a match.
///
/// All fields are optional and ANDed together; an all-`None` pattern matches
/// every header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderPattern {
    /// Required schema, if any.
    pub schema: Option<SchemaId>,
    /// Required content hash, if any.
    pub id: Option<Sha256>,
    /// Required timestamp, if any.
    pub ts: Option<Timestamp>,
}

impl HeaderPattern {
    /// Build a pattern that matches on `schema` alone — the common case.
    pub fn for_schema(schema: impl Into<SchemaId>) -> Self {
        Self {
            schema: Some(schema.into()),
            ..Default::default()
        }
    }

    /// Returns `true` iff every populated field matches `header`.
    pub fn matches(&self, header: &EventHeader) -> bool {
        if let Some(schema) = &self.schema {
            if schema != &header.schema {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if id != &header.id {
                return false;
            }
        }
        if let Some(ts) = &self.ts {
            if *ts != header.ts {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(schema: &str, id: &str, ts: i64) -> EventHeader {
        EventHeader {
            id: id.to_string(),
            schema: schema.to_string(),
            ts,
        }
    }

    #[test]
    fn empty_pattern_matches_everything() {
        let pattern = HeaderPattern::default();
        assert!(pattern.matches(&header("S@1", "abc", 0)));
    }

    #[test]
    fn schema_pattern_matches_only_that_schema() {
        let pattern = HeaderPattern::for_schema("IN@1");
        assert!(pattern.matches(&header("IN@1", "abc", 0)));
        assert!(!pattern.matches(&header("OUT@1", "abc", 0)));
    }

    #[test]
    fn combined_pattern_ands_all_fields() {
        let pattern = HeaderPattern {
            schema: Some("S@1".to_string()),
            id: Some("deadbeef".to_string()),
            ts: None,
        };
        assert!(pattern.matches(&header("S@1", "deadbeef", 42)));
        assert!(!pattern.matches(&header("S@1", "other", 42)));
    }
}
