//! Operation store
//!
//! A single JSON document on disk, replaced atomically (write tmp, then
//! rename). The store is owned exclusively by the operation manager. A
//! malformed file is renamed aside and replaced with an empty store; an
//! absent file is simply an empty store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ops::operation::Operation;
use crate::util::unix_secs;

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct StoreDocument {
    pub operations: HashMap<String, Operation>,
    #[serde(rename = "savedAt", default)]
    pub saved_at: String,
}

pub struct OperationStore {
    path: PathBuf,
}

impl OperationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the snapshot. Never errors: corruption is renamed aside with a
    /// warning and treated as an empty store.
    pub fn load(&self) -> StoreDocument {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return StoreDocument::default();
            }
            Err(e) => {
                warn!("[STORE] Failed to read {}: {}", self.path.display(), e);
                return StoreDocument::default();
            }
        };

        match serde_json::from_str::<StoreDocument>(&text) {
            Ok(doc) => {
                info!(
                    "[STORE] Loaded {} operation(s) from {}",
                    doc.operations.len(),
                    self.path.display()
                );
                doc
            }
            Err(e) => {
                let aside = self
                    .path
                    .with_extension(format!("corrupt-{}", unix_secs()));
                warn!(
                    "[STORE] Malformed store {} ({}), renaming aside to {}",
                    self.path.display(),
                    e,
                    aside.display()
                );
                if let Err(rename_err) = fs::rename(&self.path, &aside) {
                    warn!("[STORE] Rename-aside failed: {}", rename_err);
                }
                StoreDocument::default()
            }
        }
    }

    /// Atomically replace the snapshot on disk.
    pub fn save(&self, operations: &HashMap<String, Operation>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let doc = StoreDocument {
            operations: operations.clone(),
            saved_at: Utc::now().to_rfc3339(),
        };
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::operation::{OperationKind, OperationState};
    use serde_json::json;

    fn sample_op(id: &str) -> Operation {
        Operation::new(
            id.to_string(),
            OperationKind::SendMessage,
            json!({"message": "hi"}),
            "peer-1".to_string(),
            Some(3),
            None,
        )
    }

    #[test]
    fn test_absent_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = OperationStore::new(dir.path().join("missing.json"));
        let doc = store.load();
        assert!(doc.operations.is_empty());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = OperationStore::new(dir.path().join("ops.json"));

        let mut ops = HashMap::new();
        ops.insert("op_1".to_string(), sample_op("op_1"));
        store.save(&ops).unwrap();

        let doc = store.load();
        assert_eq!(doc.operations.len(), 1);
        let op = &doc.operations["op_1"];
        assert_eq!(op.kind, OperationKind::SendMessage);
        assert_eq!(op.state, OperationState::Registered);
        assert_eq!(op.tab_id, Some(3));
        assert!(!doc.saved_at.is_empty());
    }

    #[test]
    fn test_malformed_file_is_renamed_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.json");
        fs::write(&path, "{not json at all").unwrap();

        let store = OperationStore::new(&path);
        let doc = store.load();
        assert!(doc.operations.is_empty());
        // original file moved aside, not deleted
        assert!(!path.exists());
        let aside_exists = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains("corrupt"));
        assert!(aside_exists);

        // a subsequent save works again
        store.save(&HashMap::new()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_save_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ops.json");
        let store = OperationStore::new(&path);

        store.save(&HashMap::new()).unwrap();
        let mut ops = HashMap::new();
        ops.insert("op_2".to_string(), sample_op("op_2"));
        store.save(&ops).unwrap();

        // no stray tmp file remains
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(store.load().operations.len(), 1);
    }
}
