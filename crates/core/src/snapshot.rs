use crate::error::PipelineError;
use crate::index::{IndexEntry, VectorIndex};
use crate::models::IndexMetadata;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ENTRIES_FILE: &str = "entries.json";
const FORMAT_VERSION: u32 = 1;
/// Maximum decompressed bytes accepted for one archive member.
const MAX_ARCHIVE_ENTRY_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    metadata: IndexMetadata,
    count: usize,
    entries_sha256: String,
}

/// Writes `index` into `dir`, creating it if needed.
pub fn persist(index: &VectorIndex, dir: &Path) -> Result<(), PipelineError> {
    fs::create_dir_all(dir)?;

    let entries = serde_json::to_vec(index.entries())?;
    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        metadata: index.metadata().clone(),
        count: index.len(),
        entries_sha256: sha256_hex(&entries),
    };

    write_synced(&dir.join(ENTRIES_FILE), &entries)?;
    write_synced(&dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(&manifest)?)?;
    Ok(())
}

/// Restores an index from `dir`. Anything missing or inconsistent is a [`PipelineError::CorruptIndex`].
pub fn load(dir: &Path) -> Result<VectorIndex, PipelineError> {
    let manifest_bytes = read_snapshot_file(&dir.join(MANIFEST_FILE))?;
    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|error| corrupt(dir, format!("malformed manifest: {error}")))?;

    if manifest.format_version != FORMAT_VERSION {
        return Err(corrupt(
            dir,
            format!("unsupported format version {}", manifest.format_version),
        ));
    }

    let entries_bytes = read_snapshot_file(&dir.join(ENTRIES_FILE))?;
    if sha256_hex(&entries_bytes) != manifest.entries_sha256 {
        return Err(corrupt(dir, "entries checksum mismatch"));
    }

    let entries: Vec<IndexEntry> = serde_json::from_slice(&entries_bytes)
        .map_err(|error| corrupt(dir, format!("malformed entries: {error}")))?;
    if entries.len() != manifest.count {
        return Err(corrupt(
            dir,
            format!("manifest lists {} entries, found {}", manifest.count, entries.len()),
        ));
    }

    VectorIndex::from_parts(manifest.metadata, entries).map_err(|error| corrupt(dir, error))
}

fn read_snapshot_file(path: &Path) -> Result<Vec<u8>, PipelineError> {
    fs::read(path).map_err(|error| corrupt(path, error))
}

fn corrupt(path: &Path, details: impl std::fmt::Display) -> PipelineError {
    PipelineError::CorruptIndex(format!("{}: {details}", path.display()))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Bounded exponential backoff for storage operations that may hit a locked file.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

fn is_transient(error: &io::Error) -> bool {
    // EBUSY, ETXTBSY, and the Windows sharing/lock violations.
    const BUSY_CODES: [i32; 4] = [16, 26, 32, 33];

    matches!(
        error.kind(),
        io::ErrorKind::PermissionDenied
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    ) || error
        .raw_os_error()
        .is_some_and(|code| BUSY_CODES.contains(&code))
}

/// Runs `operation`, retrying transient failures until the policy is exhausted.
pub fn retry_transient<T>(
    policy: RetryPolicy,
    what: &str,
    mut operation: impl FnMut() -> io::Result<T>,
) -> Result<T, PipelineError> {
    let mut backoff = policy.initial_backoff;
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) && attempt < attempts => {
                debug!(what, attempt, %error, "storage busy, retrying");
                thread::sleep(backoff);
                backoff = backoff.saturating_mul(2);
            }
            Err(error) if is_transient(&error) => {
                return Err(PipelineError::TransientResourceBusy(format!(
                    "{what} still busy after {attempts} attempts: {error}"
                )));
            }
            Err(error) => return Err(PipelineError::Io(error)),
        }
    }

    Err(PipelineError::TransientResourceBusy(format!(
        "{what} was not attempted"
    )))
}

/// One named collection under a data root: `<root>/<collection>/{manifest.json,entries.json}`.
///
/// Writes go to a staging directory first, which is renamed into place once the old collection
/// is gone.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    collection: String,
    retry: RetryPolicy,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            collection: collection.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn collection_dir(&self) -> PathBuf {
        self.root.join(&self.collection)
    }

    pub fn exists(&self) -> bool {
        self.collection_dir().join(MANIFEST_FILE).is_file()
    }

    pub fn load(&self) -> Result<VectorIndex, PipelineError> {
        load(&self.collection_dir())
    }

    /// Build id recorded in the stored manifest, if a readable one exists.
    pub fn stored_build_id(&self) -> Option<Uuid> {
        let bytes = fs::read(self.collection_dir().join(MANIFEST_FILE)).ok()?;
        serde_json::from_slice::<Manifest>(&bytes)
            .ok()
            .map(|manifest| manifest.metadata.build_id)
    }

    /// Replaces whatever is stored for the collection with `index`.
    pub fn replace(&self, index: &VectorIndex) -> Result<(), PipelineError> {
        let staging = self.staging_dir()?;
        persist(index, staging.path())?;
        self.swap_in(&staging)
    }

    /// Removes the collection directory, retrying while it is locked.
    pub fn remove(&self) -> Result<(), PipelineError> {
        let dir = self.collection_dir();
        retry_transient(self.retry, "collection removal", || {
            match fs::remove_dir_all(&dir) {
                Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        })
    }

    /// Packs the stored collection into a zip archive.
    pub fn export_archive(&self) -> Result<Vec<u8>, PipelineError> {
        // Refuses to archive something that would not load back.
        let index = self.load()?;
        debug!(count = index.len(), "exporting collection");

        let dir = self.collection_dir();
        let mut buffer = Vec::new();
        {
            let mut archive = ZipWriter::new(Cursor::new(&mut buffer));
            for name in [MANIFEST_FILE, ENTRIES_FILE] {
                archive.start_file(name, SimpleFileOptions::default())?;
                archive.write_all(&fs::read(dir.join(name))?)?;
            }
            archive.finish()?;
        }
        Ok(buffer)
    }

    /// Unpacks an archive, validates it and swaps it in as the stored collection.
    pub fn import_archive(&self, bytes: &[u8]) -> Result<VectorIndex, PipelineError> {
        let staging = self.staging_dir()?;
        let mut archive = ZipArchive::new(Cursor::new(bytes))?;

        for position in 0..archive.len() {
            let entry = archive.by_index(position)?;
            if entry.is_dir() {
                continue;
            }

            let name = entry
                .enclosed_name()
                .and_then(|path| path.file_name().map(|name| name.to_owned()))
                .and_then(|name| name.to_str().map(str::to_string))
                .ok_or_else(|| {
                    PipelineError::CorruptIndex(format!("unsafe archive member: {}", entry.name()))
                })?;
            if name != MANIFEST_FILE && name != ENTRIES_FILE {
                debug!(member = %name, "ignoring unknown archive member");
                continue;
            }

            let mut contents = Vec::new();
            entry
                .take(MAX_ARCHIVE_ENTRY_BYTES)
                .read_to_end(&mut contents)?;
            if contents.len() as u64 >= MAX_ARCHIVE_ENTRY_BYTES {
                return Err(PipelineError::CorruptIndex(format!(
                    "archive member {name} exceeds {MAX_ARCHIVE_ENTRY_BYTES} bytes"
                )));
            }
            write_synced(&staging.path().join(&name), &contents)?;
        }

        let index = load(staging.path())?;
        self.swap_in(&staging)?;
        Ok(index)
    }

    fn staging_dir(&self) -> Result<TempDir, PipelineError> {
        fs::create_dir_all(&self.root)?;
        Ok(tempfile::Builder::new()
            .prefix(&format!(".{}.staging-", self.collection))
            .tempdir_in(&self.root)?)
    }

    fn swap_in(&self, staging: &TempDir) -> Result<(), PipelineError> {
        let target = self.collection_dir();
        self.remove()?;
        retry_transient(self.retry, "collection rename", || {
            fs::rename(staging.path(), &target)
        })?;
        info!(collection = %self.collection, path = %target.display(), "collection stored");
        Ok(())
    }
}
