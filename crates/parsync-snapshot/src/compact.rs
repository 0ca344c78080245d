//! Optional external compaction collaborator.

use std::path::{Path, PathBuf};

/// Best-effort store compaction before publishing a snapshot.
///
/// Implementations typically shell out to an external tool. The engine
/// must function identically whether or not a compactor is configured:
/// `None` simply means "publish the store as it is".
pub trait Compactor: Send + Sync {
    /// Compact the store at `path`, returning the path of the compacted
    /// copy, or `None` when compaction is unavailable or failed.
    fn compact(&self, path: &Path) -> Option<PathBuf>;
}

/// A compactor that never compacts. Useful in tests.
pub struct NoopCompactor;

impl Compactor for NoopCompactor {
    fn compact(&self, _path: &Path) -> Option<PathBuf> {
        None
    }
}
