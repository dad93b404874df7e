use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};
use crate::fingerprint::Fingerprint;
use crate::store::{sort_entries, CacheStore};

/// Filesystem-backed cache store with git-style 2-char sharding.
///
/// Layout: `<root>/entries/<first 2 hex chars>/<remaining hex chars>.json`
///
/// Each entry is written once through a temp file and a no-clobber rename, so
/// a concurrent writer of the same fingerprint can never replace it.
pub struct FsCacheStore {
    entries_dir: PathBuf,
}

impl FsCacheStore {
    /// Create a new `FsCacheStore` rooted at `root`. Creates `root/entries/` if needed.
    pub fn new(root: impl AsRef<Path>) -> CacheResult<Self> {
        let entries_dir = root.as_ref().join("entries");
        fs::create_dir_all(&entries_dir)?;
        Ok(Self { entries_dir })
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        let hex = fingerprint.to_hex();
        self.entries_dir
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..]))
    }

    fn read_entry(path: &Path) -> CacheResult<CacheEntry> {
        let bytes = fs::read(path)?;
        let entry: CacheEntry = serde_json::from_slice(&bytes)?;
        if !entry.is_consistent() {
            return Err(CacheError::FingerprintMismatch {
                expected: entry.fingerprint.to_hex(),
                actual: entry.key.fingerprint().to_hex(),
            });
        }
        Ok(entry)
    }
}

impl CacheStore for FsCacheStore {
    fn put(&self, entry: &CacheEntry) -> CacheResult<bool> {
        let path = self.entry_path(&entry.fingerprint);
        if path.exists() {
            return Ok(false);
        }

        let shard_dir = path
            .parent()
            .ok_or_else(|| CacheError::Backend(format!("no parent for {}", path.display())))?;
        fs::create_dir_all(shard_dir)?;

        let mut tmp = NamedTempFile::new_in(shard_dir)?;
        tmp.write_all(&serde_json::to_vec(entry)?)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(CacheError::Io(e.error)),
        }
    }

    fn get(&self, fingerprint: &Fingerprint) -> CacheResult<Option<CacheEntry>> {
        let path = self.entry_path(fingerprint);
        match Self::read_entry(&path) {
            Ok(entry) => Ok(Some(entry)),
            Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn contains(&self, fingerprint: &Fingerprint) -> CacheResult<bool> {
        Ok(self.entry_path(fingerprint).exists())
    }

    fn entries(&self) -> CacheResult<Vec<CacheEntry>> {
        let mut all = Vec::new();
        for shard in fs::read_dir(&self.entries_dir)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for file in fs::read_dir(shard.path())? {
                let path = file?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                all.push(Self::read_entry(&path)?);
            }
        }
        sort_entries(&mut all);
        Ok(all)
    }
}
