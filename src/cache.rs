use crate::errors::AppResult;
use crate::models::StudentRecord;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

/// Modification signature of the backing medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSignature {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl SourceSignature {
    pub fn missing() -> Self {
        Self {
            modified: None,
            len: 0,
        }
    }

    pub fn of_path(path: &Path) -> AppResult<Self> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Self {
                modified: metadata.modified().ok(),
                len: metadata.len(),
            }),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Self::missing()),
            Err(error) => Err(error.into()),
        }
    }
}

/// Materialized copy of the canonical set. Never authoritative: mutations invalidate it.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    snapshot: Option<Arc<Vec<StudentRecord>>>,
    signature: Option<SourceSignature>,
    loads: u64,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self, current: &SourceSignature) -> bool {
        match (&self.snapshot, &self.signature) {
            (Some(_), Some(recorded)) => recorded == current,
            _ => false,
        }
    }

    pub fn get<F>(&mut self, force_refresh: bool, current: SourceSignature, load: F) -> AppResult<Arc<Vec<StudentRecord>>>
    where
        F: FnOnce() -> AppResult<Vec<StudentRecord>>,
    {
        if !force_refresh && self.is_valid(&current) {
            if let Some(snapshot) = &self.snapshot {
                tracing::debug!(records = snapshot.len(), "serving cached snapshot");
                return Ok(Arc::clone(snapshot));
            }
        }

        let records = Arc::new(load()?);
        self.loads += 1;
        tracing::debug!(records = records.len(), forced = force_refresh, "snapshot reloaded");
        self.snapshot = Some(Arc::clone(&records));
        self.signature = Some(current);
        Ok(records)
    }

    pub fn invalidate(&mut self) {
        self.snapshot = None;
        self.signature = None;
    }

    pub fn load_count(&self) -> u64 {
        self.loads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn signature(secs: u64, len: u64) -> SourceSignature {
        SourceSignature {
            modified: Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
            len,
        }
    }

    #[test]
    fn empty_cache_is_never_valid() {
        let cache = SnapshotCache::new();
        assert!(!cache.is_valid(&signature(1, 10)));
    }

    #[test]
    fn reloads_only_when_signature_changes_or_forced() {
        let mut cache = SnapshotCache::new();
        cache.get(false, signature(1, 10), || Ok(Vec::new())).expect("first load");
        cache.get(false, signature(1, 10), || Ok(Vec::new())).expect("cached");
        assert_eq!(cache.load_count(), 1);

        cache.get(false, signature(2, 10), || Ok(Vec::new())).expect("stale reload");
        assert_eq!(cache.load_count(), 2);

        cache.get(true, signature(2, 10), || Ok(Vec::new())).expect("forced reload");
        assert_eq!(cache.load_count(), 3);
    }

    #[test]
    fn invalidate_drops_snapshot() {
        let mut cache = SnapshotCache::new();
        cache.get(false, signature(1, 10), || Ok(Vec::new())).expect("load");
        cache.invalidate();
        assert!(!cache.is_valid(&signature(1, 10)));
    }

    #[test]
    fn failed_load_keeps_cache_invalid() {
        let mut cache = SnapshotCache::new();
        let result = cache.get(false, signature(1, 10), || {
            Err(crate::errors::AppError::StorageUnavailable("gone".to_string()))
        });
        assert!(result.is_err());
        assert!(!cache.is_valid(&signature(1, 10)));
    }

    #[test]
    fn missing_file_has_empty_signature() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signature = SourceSignature::of_path(&dir.path().join("absent.json")).expect("signature");
        assert_eq!(signature, SourceSignature::missing());
    }
}
