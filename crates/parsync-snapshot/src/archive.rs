//! Compressed store snapshots with checksummed manifests.
//!
//! A snapshot is a zstd-compressed copy of a store file plus a JSON
//! sidecar manifest recording the source's size and mtime (the cheap
//! change check) and a BLAKE3 checksum of the compressed bytes (the
//! integrity check applied before extraction).

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{SnapshotError, SnapshotResult};
use crate::swap::atomic_swap;

/// Compression level for snapshots. Level 3 is the zstd default sweet
/// spot for large mostly-binary store files.
const ZSTD_LEVEL: i32 = 3;

/// Sidecar metadata describing one compressed snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Size in bytes of the uncompressed source at snapshot time.
    pub source_len: u64,
    /// Source mtime, milliseconds since the UNIX epoch.
    pub source_mtime_ms: i64,
    /// BLAKE3 checksum (hex) of the compressed snapshot file.
    pub checksum: String,
}

impl SnapshotManifest {
    /// Whether a source with the given stamp is unchanged since this
    /// snapshot was taken.
    pub fn matches(&self, stamp: (u64, i64)) -> bool {
        self.source_len == stamp.0 && self.source_mtime_ms == stamp.1
    }
}

/// Path of the manifest sitting next to a snapshot file.
pub fn manifest_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.file_name().unwrap_or_default().to_os_string();
    name.push(".manifest.json");
    snapshot.with_file_name(name)
}

/// Size + mtime stamp of a source file.
pub fn source_stamp(path: &Path) -> SnapshotResult<(u64, i64)> {
    let meta = fs::metadata(path)?;
    let mtime_ms = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok((meta.len(), mtime_ms))
}

/// Read the manifest next to a snapshot, if both exist.
pub fn read_manifest(snapshot: &Path) -> SnapshotResult<Option<SnapshotManifest>> {
    let path = manifest_path(snapshot);
    if !snapshot.exists() || !path.exists() {
        return Ok(None);
    }
    let manifest: SnapshotManifest = serde_json::from_slice(&fs::read(path)?)?;
    Ok(Some(manifest))
}

fn hash_file(path: &Path) -> SnapshotResult<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// Compress `source` into a snapshot at `snapshot`, writing the sidecar
/// manifest alongside. Both files are swapped into place atomically.
pub fn write_snapshot(source: &Path, snapshot: &Path) -> SnapshotResult<SnapshotManifest> {
    if !source.exists() {
        return Err(SnapshotError::SourceMissing(source.to_path_buf()));
    }
    let stamp = source_stamp(source)?;
    let dir = snapshot.parent().ok_or_else(|| {
        SnapshotError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "snapshot path has no parent directory",
        ))
    })?;
    fs::create_dir_all(dir)?;

    let temp = NamedTempFile::new_in(dir)?;
    {
        let mut encoder = zstd::Encoder::new(BufWriter::new(temp.as_file()), ZSTD_LEVEL)?;
        let mut reader = BufReader::new(File::open(source)?);
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?.into_inner().map_err(|e| {
            SnapshotError::Io(io::Error::new(io::ErrorKind::Other, e.to_string()))
        })?;
    }
    let temp_path = temp.into_temp_path();
    let checksum = hash_file(&temp_path)?;

    let manifest = SnapshotManifest {
        source_len: stamp.0,
        source_mtime_ms: stamp.1,
        checksum,
    };

    atomic_swap(&temp_path, snapshot)?;
    temp_path.keep().ok(); // Already renamed away; suppress the delete.

    let manifest_temp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(manifest_temp.as_file(), &manifest)?;
    let manifest_temp = manifest_temp.into_temp_path();
    atomic_swap(&manifest_temp, &manifest_path(snapshot))?;
    manifest_temp.keep().ok();

    debug!(
        source = %source.display(),
        snapshot = %snapshot.display(),
        bytes = stamp.0,
        "snapshot written"
    );
    Ok(manifest)
}

/// Verify a snapshot against its manifest and extract it over `dest`
/// (atomic swap via a temp file in `dest`'s directory).
pub fn extract_snapshot(
    snapshot: &Path,
    manifest: &SnapshotManifest,
    dest: &Path,
) -> SnapshotResult<u64> {
    if !snapshot.exists() {
        return Err(SnapshotError::SourceMissing(snapshot.to_path_buf()));
    }
    if hash_file(snapshot)? != manifest.checksum {
        return Err(SnapshotError::ChecksumMismatch(snapshot.to_path_buf()));
    }

    let dir = dest.parent().ok_or_else(|| {
        SnapshotError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "destination path has no parent directory",
        ))
    })?;
    fs::create_dir_all(dir)?;

    let temp = NamedTempFile::new_in(dir)?;
    {
        let mut decoder = zstd::Decoder::new(BufReader::new(File::open(snapshot)?))?;
        let mut writer = BufWriter::new(temp.as_file());
        io::copy(&mut decoder, &mut writer)?;
        io::Write::flush(&mut writer)?;
    }
    let temp_path = temp.into_temp_path();
    let written = fs::metadata(&temp_path)?.len();
    atomic_swap(&temp_path, dest)?;
    temp_path.keep().ok();
    Ok(written)
}
