//! Device catalog: identity, presence, and cached property state.
//!
//! The registry is the only cross-peer mutable state in the broker.  It
//! emits no events itself; every mutator returns enough change
//! information for the caller (the router) to decide whether a
//! notification must be fanned out.
//!
//! Persistence is a collaborator behind [`PresenceStore`]: on any
//! mutation the registry bumps a dirty counter, and the broker's
//! debounced autosave task snapshots and saves.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skybus_protocol::DeviceInfo;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Everything the broker knows about one device.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub info: DeviceInfo,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    fn new(info: DeviceInfo, connected: bool) -> Self {
        let now = Utc::now();
        DeviceRecord {
            info,
            connected,
            last_seen: now,
            last_connected: connected.then_some(now),
            last_disconnected: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory device catalog.  One record per device id.
pub struct DeviceRegistry {
    inner: RwLock<HashMap<String, DeviceRecord>>,
    dirty_tx: watch::Sender<u64>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (dirty_tx, _) = watch::channel(0);
        DeviceRegistry {
            inner: RwLock::new(HashMap::new()),
            dirty_tx,
        }
    }

    /// Receiver that changes whenever the catalog mutates; the autosave
    /// task debounces on it.
    pub fn subscribe_dirty(&self) -> watch::Receiver<u64> {
        self.dirty_tx.subscribe()
    }

    fn mark_dirty(&self) {
        self.dirty_tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Register a device, marking it connected.
    ///
    /// Rejected (returns false) if a record with this id is currently
    /// connected; otherwise the record is replaced wholesale.  The
    /// "later registration wins only if the earlier session is Closed"
    /// tie-break is the broker's to apply — it calls [`Self::force_register`]
    /// after verifying the earlier session is gone.
    pub async fn register(&self, info: DeviceInfo) -> bool {
        let mut inner = self.inner.write().await;
        if inner.get(&info.id).is_some_and(|r| r.connected) {
            return false;
        }
        let id = info.id.clone();
        inner.insert(id.clone(), DeviceRecord::new(info, true));
        drop(inner);
        info!(device_id = %id, "device registered");
        self.mark_dirty();
        true
    }

    /// Replace the record unconditionally.  Used when the broker has
    /// established that the previously connected session is dead.
    pub async fn force_register(&self, info: DeviceInfo) {
        let id = info.id.clone();
        self.inner
            .write()
            .await
            .insert(id.clone(), DeviceRecord::new(info, true));
        info!(device_id = %id, "device re-registered over a dead session");
        self.mark_dirty();
    }

    /// Remove the record entirely.  Returns false for unknown ids.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.inner.write().await.remove(id).is_some();
        if removed {
            info!(device_id = %id, "device unregistered");
            self.mark_dirty();
        }
        removed
    }

    /// Apply a partial update to the device info.  Returns false for
    /// unknown ids.
    pub async fn update(&self, id: &str, apply: impl FnOnce(&mut DeviceInfo)) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(record) => {
                apply(&mut record.info);
                record.last_seen = Utc::now();
                drop(inner);
                self.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Flip the presence flag, stamping the transition time.  Returns
    /// false for unknown ids.
    pub async fn set_connected(&self, id: &str, connected: bool) -> bool {
        let mut inner = self.inner.write().await;
        match inner.get_mut(id) {
            Some(record) => {
                if record.connected != connected {
                    record.connected = connected;
                    let now = Utc::now();
                    record.last_seen = now;
                    if connected {
                        record.last_connected = Some(now);
                    } else {
                        record.last_disconnected = Some(now);
                    }
                    drop(inner);
                    debug!(device_id = %id, connected, "presence changed");
                    self.mark_dirty();
                }
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<DeviceRecord> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn is_connected(&self, id: &str) -> bool {
        self.inner.read().await.get(id).is_some_and(|r| r.connected)
    }

    /// Snapshot of device infos, optionally filtered by type.  An empty
    /// filter means all types.  Serves Discovery requests.
    pub async fn list(&self, device_types: &[String]) -> BTreeMap<String, DeviceInfo> {
        self.inner
            .read()
            .await
            .values()
            .filter(|r| {
                device_types.is_empty() || device_types.contains(&r.info.device_type)
            })
            .map(|r| (r.info.id.clone(), r.info.clone()))
            .collect()
    }

    /// Store one property value, returning the previous one.
    ///
    /// Atomic with respect to readers; the returned old value lets the
    /// router synthesize exactly one change event per observed
    /// transition.  `Err` for unknown ids.
    pub async fn set_property(
        &self,
        id: &str,
        name: &str,
        value: Value,
    ) -> Result<Option<Value>, UnknownDevice> {
        let mut inner = self.inner.write().await;
        let record = inner.get_mut(id).ok_or(UnknownDevice)?;
        let old = record.info.properties.insert(name.to_owned(), value);
        record.last_seen = Utc::now();
        drop(inner);
        self.mark_dirty();
        Ok(old)
    }

    pub async fn get_property(&self, id: &str, name: &str) -> Option<Value> {
        self.inner
            .read()
            .await
            .get(id)
            .and_then(|r| r.info.properties.get(name).cloned())
    }

    /// Bump `last_seen` without any other change (events from the device).
    pub async fn touch(&self, id: &str) {
        if let Some(record) = self.inner.write().await.get_mut(id) {
            record.last_seen = Utc::now();
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Snapshot for the persistence collaborator.  Devices are recorded
    /// with `connected = false`: presence is a property of live sessions,
    /// not of saved state.
    pub async fn snapshot(&self) -> PresenceSnapshot {
        let devices = self
            .inner
            .read()
            .await
            .values()
            .map(|r| {
                (
                    r.info.id.clone(),
                    PersistedDevice {
                        info: r.info.clone(),
                        connected: false,
                    },
                )
            })
            .collect();
        PresenceSnapshot {
            devices,
            saved_at: Utc::now(),
        }
    }

    /// Restore records from a startup snapshot, all disconnected.
    pub async fn load_snapshot(&self, snapshot: PresenceSnapshot) {
        let mut inner = self.inner.write().await;
        for (id, device) in snapshot.devices {
            let mut record = DeviceRecord::new(device.info, false);
            record.last_connected = None;
            inner.insert(id, record);
        }
        info!(devices = inner.len(), "registry restored from snapshot");
    }
}

/// `set_property`/`get_property` target an id with no record.
#[derive(Debug, PartialEq, Eq)]
pub struct UnknownDevice;

impl std::fmt::Display for UnknownDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown device")
    }
}

impl std::error::Error for UnknownDevice {}

// ---------------------------------------------------------------------------
// Persistence collaborator
// ---------------------------------------------------------------------------

/// One device entry as persisted: the info document plus the (always
/// false) connected flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDevice {
    #[serde(flatten)]
    pub info: DeviceInfo,
    pub connected: bool,
}

/// The persistence document: `{ "devices": {...}, "savedAt": "<iso>" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    pub devices: BTreeMap<String, PersistedDevice>,
    #[serde(rename = "savedAt")]
    pub saved_at: DateTime<Utc>,
}

/// Where snapshots go.  The broker core never touches the disk itself;
/// `services/brokerd` ships a JSON-file implementation.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn load(&self) -> Result<Option<PresenceSnapshot>, StoreError>;
    async fn save(&self, snapshot: &PresenceSnapshot) -> Result<(), StoreError>;
}

#[derive(Debug)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "presence store: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info(id: &str, device_type: &str) -> DeviceInfo {
        DeviceInfo::new(id, device_type)
    }

    #[tokio::test]
    async fn register_rejects_a_connected_duplicate() {
        let registry = DeviceRegistry::new();
        assert!(registry.register(info("scope-1", "telescope")).await);
        assert!(!registry.register(info("scope-1", "telescope")).await);

        // After disconnect the id can be re-registered.
        registry.set_connected("scope-1", false).await;
        assert!(registry.register(info("scope-1", "telescope")).await);
    }

    #[tokio::test]
    async fn set_property_returns_the_previous_value() {
        let registry = DeviceRegistry::new();
        registry.register(info("scope-1", "telescope")).await;

        let old = registry
            .set_property("scope-1", "temperature", json!(10))
            .await
            .unwrap();
        assert_eq!(old, None);

        let old = registry
            .set_property("scope-1", "temperature", json!(11))
            .await
            .unwrap();
        assert_eq!(old, Some(json!(10)));

        assert_eq!(
            registry.get_property("scope-1", "temperature").await,
            Some(json!(11))
        );
    }

    #[tokio::test]
    async fn set_property_on_unknown_device_fails() {
        let registry = DeviceRegistry::new();
        assert_eq!(
            registry.set_property("ghost", "x", json!(1)).await,
            Err(UnknownDevice)
        );
    }

    #[tokio::test]
    async fn update_patches_info_in_place() {
        let registry = DeviceRegistry::new();
        registry.register(info("scope-1", "telescope")).await;

        let updated = registry
            .update("scope-1", |info| {
                info.firmware_version = Some("4.2g".to_owned());
            })
            .await;
        assert!(updated);
        assert_eq!(
            registry.get("scope-1").await.unwrap().info.firmware_version,
            Some("4.2g".to_owned())
        );
        assert!(!registry.update("ghost", |_| {}).await);
    }

    #[tokio::test]
    async fn unregister_removes_the_record() {
        let registry = DeviceRegistry::new();
        registry.register(info("scope-1", "telescope")).await;
        assert!(registry.unregister("scope-1").await);
        assert!(registry.get("scope-1").await.is_none());
        assert!(!registry.unregister("scope-1").await);
    }

    #[tokio::test]
    async fn list_filters_by_type() {
        let registry = DeviceRegistry::new();
        registry.register(info("scope-1", "telescope")).await;
        registry.register(info("cam-1", "camera")).await;

        let all = registry.list(&[]).await;
        assert_eq!(all.len(), 2);

        let scopes = registry.list(&["telescope".to_owned()]).await;
        assert_eq!(scopes.len(), 1);
        assert!(scopes.contains_key("scope-1"));
    }

    #[tokio::test]
    async fn snapshot_round_trips_with_connected_false() {
        let registry = DeviceRegistry::new();
        registry.register(info("scope-1", "telescope")).await;
        registry
            .set_property("scope-1", "parked", json!(true))
            .await
            .unwrap();

        let snapshot = registry.snapshot().await;
        let json_doc = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json_doc["devices"]["scope-1"]["connected"], json!(false));
        assert_eq!(
            json_doc["devices"]["scope-1"]["properties"]["parked"],
            json!(true)
        );
        assert!(json_doc["savedAt"].is_string());

        let restored = DeviceRegistry::new();
        restored
            .load_snapshot(serde_json::from_value(json_doc).unwrap())
            .await;
        let record = restored.get("scope-1").await.unwrap();
        assert!(!record.connected);
        assert_eq!(record.info.properties["parked"], json!(true));
    }

    #[tokio::test]
    async fn mutations_bump_the_dirty_counter() {
        let registry = DeviceRegistry::new();
        let rx = registry.subscribe_dirty();
        let before = *rx.borrow();
        registry.register(info("scope-1", "telescope")).await;
        assert_ne!(*rx.borrow(), before);
    }
}
