//! Partition identifiers.
//!
//! A partition is one isolated replication unit: in the original deployment,
//! an operating-unit country code such as `ES` or `DE`. Each partition owns a
//! local/shared store pair, and nothing in the engine crosses partition
//! boundaries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TypeError};

/// Minimum and maximum length of a partition id.
const MIN_LEN: usize = 2;
const MAX_LEN: usize = 8;

/// Validated identifier of one replication unit.
///
/// Valid partition ids:
/// - Are between 2 and 8 characters long
/// - Contain only uppercase ASCII letters and digits
///
/// The id doubles as a filesystem path component (store file names derive
/// from it), so the character set is deliberately conservative.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    /// Create a partition id, validating the raw string.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_partition_id(&id)?;
        Ok(Self(id))
    }

    /// The raw id string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PartitionId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Validate a partition id, returning `Ok(())` if valid.
pub fn validate_partition_id(id: &str) -> Result<()> {
    if id.len() < MIN_LEN || id.len() > MAX_LEN {
        return Err(TypeError::InvalidPartition {
            id: id.to_string(),
            reason: format!("length must be {MIN_LEN}..={MAX_LEN}"),
        });
    }
    if let Some(ch) = id
        .chars()
        .find(|c| !(c.is_ascii_uppercase() || c.is_ascii_digit()))
    {
        return Err(TypeError::InvalidPartition {
            id: id.to_string(),
            reason: format!("contains forbidden character: {ch:?}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_country_codes() {
        assert!(PartitionId::new("ES").is_ok());
        assert!(PartitionId::new("DE").is_ok());
        assert!(PartitionId::new("LATAM01").is_ok());
    }

    #[test]
    fn rejects_bad_ids() {
        assert!(PartitionId::new("").is_err());
        assert!(PartitionId::new("e").is_err());
        assert!(PartitionId::new("es").is_err());
        assert!(PartitionId::new("E S").is_err());
        assert!(PartitionId::new("../ES").is_err());
        assert!(PartitionId::new("TOOLONGID").is_err());
    }

    #[test]
    fn parses_and_displays() {
        let id: PartitionId = "ES".parse().unwrap();
        assert_eq!(id.to_string(), "ES");
        assert_eq!(id.as_str(), "ES");
    }
}
