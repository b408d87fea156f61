use std::path::{Path, PathBuf};

use edgeflow_domain::{Assignment, Settings, Snapshot};
use tracing::{debug, warn};

use crate::error::StoreError;

/// File name of the assignment record inside the agent working directory.
pub const RECORD_FILE: &str = "flowforge-project.json";

/// Persists the [`Assignment`] next to the device credentials.
///
/// Single writer (the reconciler); readers see a consistent view because
/// every save replaces the file atomically.
#[derive(Debug, Clone)]
pub struct AssignmentStore {
    path: PathBuf,
}

impl AssignmentStore {
    pub fn new(working_dir: &Path) -> Self {
        Self {
            path: working_dir.join(RECORD_FILE),
        }
    }

    /// Load the persisted assignment. `Ok(None)` when no record exists yet.
    ///
    /// Tolerates the legacy schema in which the top-level object *is* the
    /// snapshot (an `id` key at top level) and a nested `device` object
    /// carries the settings.
    pub async fn load(&self) -> Result<Option<Assignment>, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Io {
                    path: self.path.display().to_string(),
                    source: e,
                })
            }
        };

        let value: serde_json::Value = serde_json::from_str(&content)?;
        if value.get("id").is_some() {
            debug!(path = %self.path.display(), "loading legacy assignment record");
            return Ok(Some(from_legacy(value)?));
        }

        Ok(Some(serde_json::from_value(value)?))
    }

    /// Persist the assignment: write `<path>.tmp`, rename over `<path>`.
    /// If the rename fails, fall back to copy-via-`.bak`; the backup lives
    /// only until the replacement has succeeded.
    pub async fn save(&self, assignment: &Assignment) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(assignment)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(|e| StoreError::Io {
            path: tmp.display().to_string(),
            source: e,
        })?;

        if let Err(rename_err) = tokio::fs::rename(&tmp, &self.path).await {
            warn!(
                path = %self.path.display(),
                error = %rename_err,
                "atomic rename failed, falling back to copy with backup"
            );
            let bak = self.path.with_extension("json.bak");
            if tokio::fs::metadata(&self.path).await.is_ok() {
                tokio::fs::copy(&self.path, &bak).await.map_err(|e| StoreError::Io {
                    path: bak.display().to_string(),
                    source: e,
                })?;
            }
            tokio::fs::copy(&tmp, &self.path).await.map_err(|e| StoreError::Io {
                path: self.path.display().to_string(),
                source: e,
            })?;
            let _ = tokio::fs::remove_file(&bak).await;
            let _ = tokio::fs::remove_file(&tmp).await;
        }

        Ok(())
    }
}

/// Interpret a legacy record: the whole object is the snapshot, settings
/// come from the nested `device` object when present. Owner, mode and
/// target state were not recorded in that schema and take their defaults;
/// a missing `licensed` stays unknown.
fn from_legacy(mut value: serde_json::Value) -> Result<Assignment, StoreError> {
    let settings: Option<Settings> = match value
        .as_object_mut()
        .and_then(|obj| obj.remove("device"))
    {
        Some(device) => Some(serde_json::from_value(device)?),
        None => None,
    };
    let snapshot: Snapshot = serde_json::from_value(value)?;

    Ok(Assignment {
        snapshot: Some(snapshot),
        settings,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeflow_domain::{AgentMode, OwnerType, TargetState};

    fn sample() -> Assignment {
        Assignment {
            owner_type: OwnerType::Project,
            project: Some("p1".into()),
            snapshot: Some(Snapshot {
                id: "snap-1".into(),
                ..Default::default()
            }),
            settings: Some(Settings {
                hash: "h1".into(),
                ..Default::default()
            }),
            mode: AgentMode::Autonomous,
            target_state: TargetState::Suspended,
            licensed: Some(true),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssignmentStore::new(dir.path());

        store.save(&sample()).await.unwrap();
        let loaded = store.load().await.unwrap().expect("record present");
        assert_eq!(loaded, sample());
    }

    #[tokio::test]
    async fn load_missing_record_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssignmentStore::new(dir.path());
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn legacy_record_is_interpreted_as_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RECORD_FILE);
        let legacy = serde_json::json!({
            "id": "legacy-snap",
            "flows": [],
            "modules": { "node-red": "3.x" },
            "device": { "hash": "legacy-hash" }
        });
        tokio::fs::write(&path, legacy.to_string()).await.unwrap();

        let store = AssignmentStore::new(dir.path());
        let loaded = store.load().await.unwrap().expect("record present");
        assert_eq!(loaded.snapshot_id(), Some("legacy-snap"));
        assert_eq!(loaded.settings_hash(), Some("legacy-hash"));
        assert_eq!(loaded.owner_type, OwnerType::None);
        // missing licensed key stays tri-state unknown
        assert_eq!(loaded.licensed, None);
    }

    #[tokio::test]
    async fn save_leaves_no_temp_or_backup_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssignmentStore::new(dir.path());
        store.save(&sample()).await.unwrap();
        store.save(&sample()).await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec![RECORD_FILE.to_string()]);
    }

    #[tokio::test]
    async fn missing_licensed_key_loads_as_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RECORD_FILE);
        let record = serde_json::json!({
            "ownerType": "project",
            "project": "p1",
            "snapshot": null,
            "settings": null,
            "application": null,
            "mode": "autonomous",
            "targetState": "running",
            "licensed": null,
            "editorToken": null,
            "editorAffinity": null
        });
        tokio::fs::write(&path, record.to_string()).await.unwrap();

        let store = AssignmentStore::new(dir.path());
        let loaded = store.load().await.unwrap().expect("record present");
        assert_eq!(loaded.licensed, None);
    }
}
