//! JSON-file presence store.
//!
//! Snapshots are written to a temp file in the same directory and
//! renamed into place, so a crash mid-write never corrupts the previous
//! snapshot.

use async_trait::async_trait;
use skybus_core::registry::{PresenceSnapshot, PresenceStore, StoreError};
use std::path::PathBuf;
use tracing::debug;

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }
}

#[async_trait]
impl PresenceStore for JsonFileStore {
    async fn load(&self) -> Result<Option<PresenceSnapshot>, StoreError> {
        let path = self.path.clone();
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError(format!("reading {}: {}", path.display(), e))),
        };
        let snapshot: PresenceSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError(format!("parsing {}: {}", path.display(), e)))?;
        debug!(devices = snapshot.devices.len(), "presence snapshot loaded");
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &PresenceSnapshot) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| StoreError(format!("serializing snapshot: {}", e)))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StoreError(format!("creating {}: {}", parent.display(), e)))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| StoreError(format!("writing {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError(format!("renaming into {}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skybus_protocol::DeviceInfo;

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("devices.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshots_round_trip_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("devices.json"));

        let registry = skybus_core::registry::DeviceRegistry::new();
        registry
            .register(DeviceInfo::new("scope-1", "telescope"))
            .await;
        let snapshot = registry.snapshot().await;
        store.save(&snapshot).await.unwrap();

        let restored = store.load().await.unwrap().expect("snapshot present");
        assert!(restored.devices.contains_key("scope-1"));
        assert!(!restored.devices["scope-1"].connected);
    }
}
