//! Change-log entries: the append-only shadow of local mutations.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TypeError};

/// The kind of a logged mutation.
///
/// `Update` names exactly the columns the originating edit touched. The
/// push path re-reads current row state, so the column list is a hint for
/// diagnostics rather than a payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Delete,
    Update(Vec<String>),
}

impl Operation {
    /// Stable textual encoding stored in the log table:
    /// `INSERT`, `DELETE`, or `UPDATE(col,…)`.
    pub fn encode(&self) -> String {
        match self {
            Operation::Insert => "INSERT".to_string(),
            Operation::Delete => "DELETE".to_string(),
            Operation::Update(cols) => format!("UPDATE({})", cols.join(",")),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for Operation {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "DELETE" => Ok(Operation::Delete),
            other => {
                let inner = other
                    .strip_prefix("UPDATE(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| TypeError::InvalidOperation(other.to_string()))?;
                let cols: Vec<String> = inner
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect();
                if cols.is_empty() {
                    return Err(TypeError::InvalidOperation(other.to_string()));
                }
                Ok(Operation::Update(cols))
            }
        }
    }
}

/// One logged local mutation.
///
/// Created in the same transaction as the mutation it describes; only ever
/// mutated false→true on `synchronized`; deleted only by explicit
/// compaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Monotonic id; ascending id is causal order within a partition.
    pub id: i64,
    pub table_name: String,
    /// Primary-key value of the affected row, rendered as text.
    pub record_id: String,
    pub operation: Operation,
    pub timestamp_utc: DateTime<Utc>,
    pub synchronized: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_and_parses() {
        for op in [
            Operation::Insert,
            Operation::Delete,
            Operation::Update(vec!["amount".into(), "currency".into()]),
        ] {
            let parsed: Operation = op.encode().parse().unwrap();
            assert_eq!(parsed, op);
        }
    }

    #[test]
    fn update_encoding_names_columns() {
        let op = Operation::Update(vec!["amount".into()]);
        assert_eq!(op.encode(), "UPDATE(amount)");
    }

    #[test]
    fn rejects_malformed_encodings() {
        assert!("".parse::<Operation>().is_err());
        assert!("UPSERT".parse::<Operation>().is_err());
        assert!("UPDATE()".parse::<Operation>().is_err());
        assert!("UPDATE(amount".parse::<Operation>().is_err());
    }
}
