use common::{InstanceRecord, RECORD_FILE};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{ManagerError, Result};

/// Storage for instance records, one record per id.
pub trait InstanceRepository {
    /// Every stored record, re-read on each call.
    fn load_all(&self) -> Result<Vec<InstanceRecord>>;
    /// `None` when no record exists for `id`.
    fn load_one(&self, id: &str) -> Result<Option<InstanceRecord>>;
    fn save(&self, record: &InstanceRecord) -> Result<()>;
    /// Remove the record and everything stored alongside it.
    fn delete(&self, id: &str) -> Result<()>;
}

/// Records stored as `<root>/<id>/instance.json`.
///
/// Subdirectories of the root without a record file are not instances and
/// are skipped. Files are written by the current process, which must be
/// allowed to write into directories owned by each instance's account.
#[derive(Debug, Clone)]
pub struct FsRegistry {
    root: PathBuf,
}

impl FsRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn record_path(&self, id: &str) -> PathBuf {
        self.instance_dir(id).join(RECORD_FILE)
    }

    fn read_record(path: &Path) -> Result<InstanceRecord> {
        let content = fs::read_to_string(path).map_err(|source| io_error(path, source))?;
        serde_json::from_str(&content).map_err(|source| ManagerError::CorruptRecord {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn io_error(path: &Path, source: io::Error) -> ManagerError {
    ManagerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl InstanceRepository for FsRegistry {
    fn load_all(&self) -> Result<Vec<InstanceRecord>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.root, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(&self.root, e))?;
            let path = entry.path().join(RECORD_FILE);
            if !entry.path().is_dir() || !path.is_file() {
                continue;
            }
            records.push(Self::read_record(&path)?);
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        debug!(count = records.len(), root = %self.root.display(), "scanned registry");
        Ok(records)
    }

    fn load_one(&self, id: &str) -> Result<Option<InstanceRecord>> {
        // An id is a single path component; anything else cannot name an instance.
        if id.is_empty() || id.contains(['/', '\\']) || id == "." || id == ".." {
            return Ok(None);
        }
        let path = self.record_path(id);
        if !self.instance_dir(id).is_dir() || !path.is_file() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    fn save(&self, record: &InstanceRecord) -> Result<()> {
        let dir = self.instance_dir(&record.id);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        let content = serde_json::to_string_pretty(record).map_err(|source| ManagerError::CorruptRecord {
            path: self.record_path(&record.id),
            source,
        })?;

        // Write then rename so a crash never leaves a truncated record.
        let path = self.record_path(&record.id);
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content).map_err(|e| io_error(&temp_path, e))?;
        fs::rename(&temp_path, &path).map_err(|e| io_error(&path, e))?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let dir = self.instance_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&dir, e)),
        }
    }
}

/// In-memory repository, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<BTreeMap<String, InstanceRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, InstanceRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InstanceRepository for MemoryRegistry {
    fn load_all(&self) -> Result<Vec<InstanceRecord>> {
        let mut records: Vec<InstanceRecord> = self.records().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    fn load_one(&self, id: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.records().get(id).cloned())
    }

    fn save(&self, record: &InstanceRecord) -> Result<()> {
        self.records().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.records().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn record(offset_secs: i64, http: u16) -> InstanceRecord {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs);
        InstanceRecord::new("17.0", at, http, http + 3)
    }

    #[test]
    fn missing_root_is_an_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path().join("does-not-exist"));
        assert!(registry.load_all().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        let mut rec = record(0, 8069);
        rec.add_dependency("pandas");
        rec.users.push("alice".to_string());

        registry.save(&rec).unwrap();
        assert_eq!(registry.load_one(&rec.id).unwrap(), Some(rec.clone()));
        assert_eq!(registry.load_all().unwrap(), vec![rec.clone()]);
        assert!(!registry.record_path(&rec.id).with_extension("json.tmp").exists());
    }

    #[test]
    fn directories_without_a_record_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        fs::create_dir_all(dir.path().join("lost+found")).unwrap();
        fs::create_dir_all(dir.path().join("half-provisioned/src")).unwrap();
        fs::write(dir.path().join("stray.json"), "{}").unwrap();

        let rec = record(0, 8069);
        registry.save(&rec).unwrap();

        let all = registry.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, rec.id);
        assert_eq!(registry.load_one("half-provisioned").unwrap(), None);
    }

    #[test]
    fn load_all_is_ordered_by_creation() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        let later = record(60, 8169);
        let earlier = record(0, 8069);
        registry.save(&later).unwrap();
        registry.save(&earlier).unwrap();

        let ids: Vec<String> = registry.load_all().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
    }

    #[test]
    fn delete_removes_the_whole_instance_directory() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        let rec = record(0, 8069);
        registry.save(&rec).unwrap();
        fs::create_dir_all(registry.instance_dir(&rec.id).join("logs")).unwrap();

        registry.delete(&rec.id).unwrap();
        assert!(!registry.instance_dir(&rec.id).exists());
        assert_eq!(registry.load_one(&rec.id).unwrap(), None);
        registry.delete(&rec.id).unwrap();
    }

    #[test]
    fn corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        fs::create_dir_all(dir.path().join("broken")).unwrap();
        fs::write(dir.path().join("broken").join(RECORD_FILE), "not json").unwrap();

        assert!(matches!(registry.load_all(), Err(ManagerError::CorruptRecord { .. })));
    }

    #[test]
    fn path_like_ids_are_never_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FsRegistry::new(dir.path());
        assert_eq!(registry.load_one("../etc").unwrap(), None);
        assert_eq!(registry.load_one("").unwrap(), None);
    }

    #[test]
    fn memory_registry_behaves_like_the_filesystem_one() {
        let registry = MemoryRegistry::new();
        let rec = record(0, 8069);
        registry.save(&rec).unwrap();
        assert_eq!(registry.load_all().unwrap().len(), 1);
        registry.delete(&rec.id).unwrap();
        assert_eq!(registry.load_one(&rec.id).unwrap(), None);
    }
}
