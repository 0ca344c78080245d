//! Record fingerprints: a 32-bit checksum over business fields.
//!
//! The fingerprint lets a push detect no-op writes: if the shared row's
//! stored fingerprint equals the fingerprint of the current local row, no
//! business field changed and the entry is skipped. It is an
//! optimistic-concurrency hint, not a collision-safe hash.

use crc32fast::Hasher;

use crate::value::{Record, SOFT_DELETE_AT_COLUMN, SOFT_DELETE_COLUMN};

/// Column on replicated tables holding the row's last pushed fingerprint.
pub const FINGERPRINT_COLUMN: &str = "row_fingerprint";

/// Last-modified bookkeeping column, excluded from the checksum.
pub const MODIFIED_AT_COLUMN: &str = "modified_at";

/// Creation metadata columns, excluded from the checksum.
const CREATED_COLUMNS: &[&str] = &["created_at", "created_by"];

/// Returns `true` if the named column participates in the fingerprint.
///
/// Excluded: the primary key, the fingerprint column itself, the
/// last-modified timestamp, soft-delete markers, and creation metadata.
pub fn is_fingerprint_input(record: &Record, column: &str) -> bool {
    column != record.primary_key
        && column != FINGERPRINT_COLUMN
        && column != MODIFIED_AT_COLUMN
        && column != SOFT_DELETE_COLUMN
        && column != SOFT_DELETE_AT_COLUMN
        && !CREATED_COLUMNS.contains(&column)
}

/// Compute the fingerprint of a record's business fields.
///
/// Fields are folded in ascending column-name order (the `BTreeMap`
/// iteration order), each as `name = canonical value` with an explicit
/// separator, so reordering inserts cannot change the result.
pub fn fingerprint(record: &Record) -> u32 {
    let mut hasher = Hasher::new();
    for (name, value) in &record.fields {
        if !is_fingerprint_input(record, name) {
            continue;
        }
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(value.canonical_text().as_bytes());
        hasher.update(b"\x1f");
    }
    hasher.finalize()
}
