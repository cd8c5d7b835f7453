//! Content canonicalization and object hashing.
//!
//! Hash inputs are textual so that hashes computed here agree with hashes
//! already stored by earlier deployments of the same schema:
//!
//! ```text
//! blob_hash   = sha256(canonical content)
//! tree_hash   = sha256("{branch}:{blob_hash}:{ts}")
//! commit_hash = sha256("{tree_hash}:{parent or None}:{message}:{ts}")
//! ```
//!
//! `ts` is RFC 3339 UTC with exactly six fractional digits and a `Z` suffix.

use std::io;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use serde_json::ser::Formatter;
use sha2::{Digest, Sha256};

use crate::error::{MemgitError, Result};
use crate::types::{BlobHash, CommitHash, TreeHash};

/// `strftime` pattern for every stored timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

// ---------------------------------------------------------------------------
// Canonical content
// ---------------------------------------------------------------------------

/// JSON formatter producing `", "` / `": "` separators and ASCII-only output.
struct SpacedAsciiFormatter;

impl Formatter for SpacedAsciiFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        if fragment.is_ascii() {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if ch.is_ascii() {
                writer.write_all(ch.encode_utf8(&mut [0u8; 4]).as_bytes())?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Canonical string form of a memory payload.
///
/// A JSON string is taken verbatim. Anything else is serialized with
/// spaced separators, insertion-ordered keys and `\uXXXX` escapes.
///
/// # Errors
/// `Invalid` for `null`, an empty string, an empty object or an empty array.
pub fn canonicalize(content: &Value) -> Result<String> {
    let empty = match content {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    };
    if empty {
        return Err(MemgitError::Invalid("content is required".into()));
    }
    encode(content)
}

/// Canonical text of any payload, empty ones included.
///
/// # Errors
/// `Serialization` if the value cannot be encoded.
pub fn encode(content: &Value) -> Result<String> {
    match content {
        Value::String(s) => Ok(s.clone()),
        other => {
            let mut out = Vec::with_capacity(128);
            let mut ser = serde_json::Serializer::with_formatter(&mut out, SpacedAsciiFormatter);
            other.serialize(&mut ser)?;
            String::from_utf8(out).map_err(|e| MemgitError::Serialization(e.to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// Hashes
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash of a canonical payload.
#[must_use]
pub fn blob_hash(canonical: &str) -> BlobHash {
    BlobHash(sha256_hex(canonical.as_bytes()))
}

/// Hash of a tree entry.
#[must_use]
pub fn tree_hash(branch: &str, blob: &BlobHash, ts: &str) -> TreeHash {
    TreeHash(sha256_hex(format!("{branch}:{blob}:{ts}").as_bytes()))
}

/// Hash of a commit. A missing parent hashes as the literal `None`.
#[must_use]
pub fn commit_hash(
    tree: &TreeHash,
    parent: Option<&CommitHash>,
    message: &str,
    ts: &str,
) -> CommitHash {
    let parent = parent.map_or("None", CommitHash::as_str);
    CommitHash(sha256_hex(
        format!("{tree}:{parent}:{message}:{ts}").as_bytes(),
    ))
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Render a timestamp in the stored form.
#[must_use]
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp.
///
/// # Errors
/// `IntegrityViolation` if the column does not hold RFC 3339.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MemgitError::IntegrityViolation(format!("bad timestamp `{raw}`: {e}")))
}

/// Timestamp for a new commit whose parent was written at `parent`.
///
/// Truncated to microseconds (the stored precision) and strictly later
/// than the parent, so two commits on one branch never share a tree hash.
#[must_use]
pub fn next_commit_time(now: DateTime<Utc>, parent: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now);
    match parent {
        Some(p) if now <= p => p + TimeDelta::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_content_uses_spaced_separators() {
        assert_eq!(canonicalize(&json!({"x": 1})).expect("canon"), r#"{"x": 1}"#);
        assert_eq!(
            canonicalize(&json!({"a": [1, 2, {"b": null}], "t": true, "f": 1.5})).expect("canon"),
            r#"{"a": [1, 2, {"b": null}], "t": true, "f": 1.5}"#
        );
    }

    #[test]
    fn non_ascii_is_escaped() {
        assert_eq!(
            canonicalize(&json!({"é": "😀\n"})).expect("canon"),
            r#"{"\u00e9": "\ud83d\ude00\n"}"#
        );
    }

    #[test]
    fn strings_are_verbatim() {
        assert_eq!(canonicalize(&json!("plain text é")).expect("canon"), "plain text é");
    }

    #[test]
    fn empty_content_is_invalid() {
        assert!(matches!(canonicalize(&Value::Null), Err(MemgitError::Invalid(_))));
        assert!(matches!(canonicalize(&json!("")), Err(MemgitError::Invalid(_))));
        assert!(matches!(canonicalize(&json!({})), Err(MemgitError::Invalid(_))));
        assert!(matches!(canonicalize(&json!([])), Err(MemgitError::Invalid(_))));
        assert_eq!(canonicalize(&json!([[]])).expect("nested empties are content"), "[[]]");
        assert_eq!(canonicalize(&json!(0)).expect("zero"), "0");
    }

    #[test]
    fn known_digests() {
        assert_eq!(
            blob_hash(r#"{"x": 1}"#).as_str(),
            "613fe5aa65343dbb1b9abe6abac6773f5c91bd60d3f2ffb7e2eae69e1db8b227"
        );
        let ts = "2024-01-02T03:04:05.000006Z";
        assert_eq!(
            tree_hash("b1", &BlobHash::from("abc"), ts).as_str(),
            "fafe460cba9d44c4355c2bce551cbbfefb088aa5594c738cb1dd0360ec876ebc"
        );
        assert_eq!(
            commit_hash(&TreeHash::from("tree"), None, "m1", ts).as_str(),
            "e67b5de659e00a259a01f6beb1968ab5c95f4a5896f5c5fe2f6d101476200bf9"
        );
    }

    #[test]
    fn timestamps_round_trip_at_microsecond_precision() {
        let now = next_commit_time(Utc::now(), None);
        let text = format_ts(now);
        assert!(text.ends_with('Z'));
        assert_eq!(text.len(), "2024-01-02T03:04:05.000006Z".len());
        assert_eq!(parse_ts(&text).expect("parse"), now);
    }

    #[test]
    fn commit_time_is_strictly_after_parent() {
        let parent = Utc::now() + TimeDelta::seconds(5);
        let next = next_commit_time(Utc::now(), Some(parent));
        assert!(next > parent);
    }
}
