//! Backup/Snapshot Store
//!
//! Durable pre-mutation copies of every file a modification will touch,
//! one directory per modification id with a JSON manifest and sha3-256
//! checksums. Created before any file is mutated, consumed only during
//! rollback, never mutated after creation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sha3::{Digest, Sha3_256};
use tracing::{debug, info, warn};

use crate::types::{BackupFileEntry, BackupManifest};

const MANIFEST_FILENAME: &str = "manifest.json";

pub struct BackupStore {
    root: PathBuf,
}

impl BackupStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn backup_dir(&self, modification_id: &str) -> PathBuf {
        self.root.join(modification_id)
    }

    /// Snapshot `files` for a modification. Files that do not exist yet
    /// (pure-insertion targets) are recorded with an empty checksum and
    /// restored by deletion.
    pub fn create(&self, modification_id: &str, files: &[PathBuf]) -> Result<BackupManifest> {
        let dir = self.backup_dir(modification_id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create backup dir: {}", dir.display()))?;

        let mut entries = Vec::new();
        let mut total_bytes = 0u64;
        for (i, original) in files.iter().enumerate() {
            let name = original
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "file".to_string());
            let backup_path = dir.join(format!("{i:03}_{name}"));

            if original.exists() {
                let content = fs::read(original)
                    .with_context(|| format!("failed to read {}", original.display()))?;
                fs::write(&backup_path, &content)
                    .with_context(|| format!("failed to write {}", backup_path.display()))?;
                total_bytes += content.len() as u64;
                entries.push(BackupFileEntry {
                    original_path: original.to_string_lossy().to_string(),
                    backup_path: backup_path.to_string_lossy().to_string(),
                    size_bytes: content.len() as u64,
                    checksum: sha3_hex(&content),
                });
            } else {
                entries.push(BackupFileEntry {
                    original_path: original.to_string_lossy().to_string(),
                    backup_path: String::new(),
                    size_bytes: 0,
                    checksum: String::new(),
                });
            }
        }

        let manifest = BackupManifest {
            modification_id: modification_id.to_string(),
            created_at: Utc::now().to_rfc3339(),
            checksum: set_checksum(&entries),
            total_bytes,
            files: entries,
        };

        let manifest_path = dir.join(MANIFEST_FILENAME);
        fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
            .with_context(|| format!("failed to write {}", manifest_path.display()))?;

        info!(
            "backup created for {modification_id}: {} file(s), {} byte(s)",
            manifest.files.len(),
            manifest.total_bytes
        );
        Ok(manifest)
    }

    pub fn load_manifest(&self, modification_id: &str) -> Result<BackupManifest> {
        let path = self.backup_dir(modification_id).join(MANIFEST_FILENAME);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("no backup manifest at {}", path.display()))?;
        serde_json::from_str(&contents).context("failed to decode backup manifest")
    }

    pub fn exists(&self, modification_id: &str) -> bool {
        self.backup_dir(modification_id)
            .join(MANIFEST_FILENAME)
            .exists()
    }

    /// Verify the stored copies still match their recorded checksums.
    pub fn verify(&self, manifest: &BackupManifest) -> Result<()> {
        for entry in &manifest.files {
            if entry.backup_path.is_empty() {
                continue;
            }
            let content = fs::read(&entry.backup_path)
                .with_context(|| format!("missing backup file {}", entry.backup_path))?;
            if sha3_hex(&content) != entry.checksum {
                bail!("backup checksum mismatch for {}", entry.original_path);
            }
        }
        if set_checksum(&manifest.files) != manifest.checksum {
            bail!("backup set checksum mismatch for {}", manifest.modification_id);
        }
        Ok(())
    }

    /// Restore every file in the manifest to its original path. Entries
    /// recorded without a backup copy (the file did not exist) are
    /// deleted instead.
    pub fn restore(&self, modification_id: &str) -> Result<()> {
        let manifest = self.load_manifest(modification_id)?;
        self.verify(&manifest)?;

        for entry in &manifest.files {
            let original = Path::new(&entry.original_path);
            if entry.backup_path.is_empty() {
                if original.exists() {
                    fs::remove_file(original).with_context(|| {
                        format!("failed to remove created file {}", entry.original_path)
                    })?;
                    debug!("rollback removed created file {}", entry.original_path);
                }
                continue;
            }
            let content = fs::read(&entry.backup_path)
                .with_context(|| format!("failed to read backup {}", entry.backup_path))?;
            if let Some(parent) = original.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(original, &content)
                .with_context(|| format!("failed to restore {}", entry.original_path))?;
            debug!("restored {}", entry.original_path);
        }

        info!(
            "restored {} file(s) for {modification_id}",
            manifest.files.len()
        );
        Ok(())
    }

    /// Delete a modification's backup directory.
    pub fn remove(&self, modification_id: &str) -> Result<()> {
        let dir = self.backup_dir(modification_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("failed to remove backup dir {}", dir.display()))?;
        } else {
            warn!("no backup to remove for {modification_id}");
        }
        Ok(())
    }
}

fn sha3_hex(content: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Checksum over the whole set: sha3 of the concatenated per-file
/// checksums, in manifest order.
fn set_checksum(entries: &[BackupFileEntry]) -> String {
    let mut hasher = Sha3_256::new();
    for entry in entries {
        hasher.update(entry.checksum.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_restore_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.rs");
        fs::write(&file, "fn a() {}\n").unwrap();

        let store = BackupStore::new(tmp.path().join("backups"));
        let manifest = store.create("m-1", &[file.clone()]).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert!(!manifest.checksum.is_empty());

        fs::write(&file, "fn a() { broken\n").unwrap();
        store.restore("m-1").unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "fn a() {}\n");
    }

    #[test]
    fn test_restore_deletes_files_created_after_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("new.rs");

        let store = BackupStore::new(tmp.path().join("backups"));
        store.create("m-2", &[file.clone()]).unwrap();

        fs::write(&file, "fn added() {}\n").unwrap();
        store.restore("m-2").unwrap();
        assert!(!file.exists());
    }

    #[test]
    fn test_verify_detects_corrupted_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.rs");
        fs::write(&file, "fn a() {}\n").unwrap();

        let store = BackupStore::new(tmp.path().join("backups"));
        let manifest = store.create("m-3", &[file]).unwrap();
        fs::write(&manifest.files[0].backup_path, "tampered").unwrap();

        assert!(store.verify(&store.load_manifest("m-3").unwrap()).is_err());
        assert!(store.restore("m-3").is_err());
    }

    #[test]
    fn test_remove_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("a.rs");
        fs::write(&file, "x").unwrap();

        let store = BackupStore::new(tmp.path().join("backups"));
        store.create("m-4", &[file]).unwrap();
        assert!(store.exists("m-4"));
        store.remove("m-4").unwrap();
        assert!(!store.exists("m-4"));
    }
}
