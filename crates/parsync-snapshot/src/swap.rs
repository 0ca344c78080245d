//! Atomic replace-with-backup for store files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

fn backup_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    dest.with_file_name(name)
}

/// Swap a fully-written `source` file into place at `dest`.
///
/// `source` must live on the destination volume (use a temp file next to
/// `dest`), so every step is a same-volume rename. The existing
/// destination is first renamed to a `.bak` sibling and restored if the
/// swap fails; when the backup rename itself fails the fallback is
/// delete-then-move. The backup is deleted best-effort on success. At no
/// point can a concurrent reader observe a partially-written destination.
pub fn atomic_swap(source: &Path, dest: &Path) -> io::Result<()> {
    if !dest.exists() {
        return fs::rename(source, dest);
    }

    let backup = backup_path(dest);
    let _ = fs::remove_file(&backup);

    match fs::rename(dest, &backup) {
        Ok(()) => {
            if let Err(e) = fs::rename(source, dest) {
                // Put the old file back; the destination must never be
                // left missing.
                if let Err(restore) = fs::rename(&backup, dest) {
                    warn!(
                        dest = %dest.display(),
                        error = %restore,
                        "failed to restore backup after swap failure"
                    );
                }
                return Err(e);
            }
            if let Err(e) = fs::remove_file(&backup) {
                debug!(backup = %backup.display(), error = %e, "backup cleanup failed");
            }
            Ok(())
        }
        Err(e) => {
            debug!(
                dest = %dest.display(),
                error = %e,
                "backup rename failed, falling back to delete-then-move"
            );
            fs::remove_file(dest)?;
            fs::rename(source, dest)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("store.db");
        let temp = dir.path().join("store.db.tmp");
        fs::write(&dest, b"old").unwrap();
        fs::write(&temp, b"new").unwrap();

        atomic_swap(&temp, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"new");
        assert!(!temp.exists());
        assert!(!backup_path(&dest).exists());
    }

    #[test]
    fn creates_missing_destination() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("store.db");
        let temp = dir.path().join("store.db.tmp");
        fs::write(&temp, b"new").unwrap();

        atomic_swap(&temp, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }

    #[test]
    fn failed_swap_leaves_old_file_intact() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("store.db");
        fs::write(&dest, b"old").unwrap();

        // Source never written: the swap must fail and the destination
        // must still hold the old content.
        let missing = dir.path().join("store.db.tmp");
        assert!(atomic_swap(&missing, &dest).is_err());
        assert_eq!(fs::read(&dest).unwrap(), b"old");
    }

    #[test]
    fn stale_backup_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("store.db");
        let temp = dir.path().join("store.db.tmp");
        fs::write(&dest, b"old").unwrap();
        fs::write(&temp, b"new").unwrap();
        fs::write(backup_path(&dest), b"ancient").unwrap();

        atomic_swap(&temp, &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new");
    }
}
