//! # Bridge Agent
//!
//! Supervisor for the bridge: composes the clients, store, and engine,
//! runs the startup sequence, and drives the two long-lived loops.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Bridge Agent Lifecycle                           │
//! │                                                                         │
//! │  STARTUP                                                                │
//! │  ───────                                                                │
//! │  1. validate_key      Auth ⇒ fatal exit; Unreachable ⇒ retry with      │
//! │                       backoff (the Device may still be booting)         │
//! │  2. extra-field schema setup on the Inventory                           │
//! │  3. mapping load; empty/corrupt ⇒ rebuild from Inventory extras         │
//! │  4. event listener + event loop start                                   │
//! │  5. initial-sync delay, then one full sync                              │
//! │  6. poller starts                                                        │
//! │                                                                         │
//! │  STEADY STATE                                                           │
//! │  ────────────                                                           │
//! │         ┌────────────┐   sync-now    ┌────────────────┐                 │
//! │         │   Poller   │ ◄──────────── │   Event Loop   │                 │
//! │         │ full sync  │               │ apply events   │                 │
//! │         │ / interval │               │ serially       │                 │
//! │         └─────┬──────┘               └───────▲────────┘                 │
//! │               │      MappingStore           │                           │
//! │               └────────────┬────────────────┘                           │
//! │                            ▼                                            │
//! │                     mapping.toml (atomic)                               │
//! │                                                                         │
//! │  SHUTDOWN                                                               │
//! │  ────────                                                               │
//! │  signal ⇒ stop loops at next suspension point ⇒ 5s grace for           │
//! │  in-flight work ⇒ forced mapping flush ⇒ exit 0                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::BridgeConfig;
use crate::device::{DeviceApi, DeviceClient};
use crate::engine::SyncEngine;
use crate::error::SyncResult;
use crate::events::{EventListener, EventListenerHandle, ListenerConfig};
use crate::inventory::{InventoryApi, InventoryClient};
use crate::mapping::MappingStore;

/// How long in-flight work may run after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Initial backoff while waiting for the Device at startup.
const KEY_RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const KEY_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(60);

// =============================================================================
// Bridge Agent
// =============================================================================

/// Composes and supervises all bridge components.
pub struct BridgeAgent {
    config: Arc<BridgeConfig>,
    device: Arc<dyn DeviceApi>,
    inventory: Arc<dyn InventoryApi>,
    store: Arc<MappingStore>,
    engine: Arc<SyncEngine>,

    listener: Option<EventListenerHandle>,
    poller_shutdown: Option<mpsc::Sender<()>>,
    event_loop_shutdown: Option<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeAgent {
    /// Creates an agent with production clients.
    pub fn new(config: BridgeConfig) -> SyncResult<Self> {
        let device: Arc<dyn DeviceApi> = Arc::new(DeviceClient::new(&config)?);
        let inventory: Arc<dyn InventoryApi> = Arc::new(InventoryClient::new(&config)?);
        let store = Arc::new(MappingStore::new(config.storage.mapping_path.clone()));
        Ok(Self::with_parts(config, device, inventory, store))
    }

    /// Creates an agent over caller-supplied components.
    pub fn with_parts(
        config: BridgeConfig,
        device: Arc<dyn DeviceApi>,
        inventory: Arc<dyn InventoryApi>,
        store: Arc<MappingStore>,
    ) -> Self {
        let config = Arc::new(config);
        let engine = Arc::new(SyncEngine::new(
            device.clone(),
            inventory.clone(),
            store.clone(),
            config.clone(),
        ));
        BridgeAgent {
            config,
            device,
            inventory,
            store,
            engine,
            listener: None,
            poller_shutdown: None,
            event_loop_shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Runs the startup sequence and spawns the steady-state loops.
    ///
    /// Returns an error only for fatal startup failures; the caller should
    /// exit non-zero on [`SyncError::is_fatal_at_startup`] errors.
    pub async fn start(&mut self) -> SyncResult<()> {
        info!("Validating device security key");
        validate_device_key(self.device.as_ref(), KEY_RETRY_INITIAL_BACKOFF).await?;

        info!("Ensuring inventory extra-field schema");
        self.inventory.ensure_extra_field_schema().await?;

        let loaded = self.store.load();
        if loaded == 0 {
            info!("No usable mapping file, attempting rebuild from inventory");
            match self.engine.recover_mappings().await {
                Ok(recovered) => info!(recovered, "Mapping recovery complete"),
                Err(e) => warn!(error = %e, "Mapping recovery failed, continuing empty"),
            }
        }

        // The event loop comes up before the first full sync so nothing
        // slips through the gap between sync and subscribe.
        let (listener_handle, signal_rx) = EventListener::spawn(ListenerConfig {
            url: format!("{}/api/v1/spool", self.config.inventory_ws_url()),
            connect_timeout: self.config.request_timeout(),
            ..Default::default()
        });
        self.listener = Some(listener_handle);

        let (sync_tx, sync_rx) = mpsc::channel(4);
        let (event_shutdown_tx, event_shutdown_rx) = mpsc::channel(1);
        self.event_loop_shutdown = Some(event_shutdown_tx);
        self.tasks.push(tokio::spawn(self.engine.clone().run_event_loop(
            signal_rx,
            sync_tx,
            event_shutdown_rx,
        )));

        let delay = self.config.sync.initial_delay_secs;
        if delay > 0 {
            info!(delay_secs = delay, "Waiting before initial sync");
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        info!("Running initial full sync");
        match self.engine.full_sync().await {
            Ok(report) => info!(
                seen = report.seen,
                created = report.created,
                usage = report.usage_pushed,
                "Initial sync complete"
            ),
            Err(e) => warn!(error = %e, "Initial sync failed, poller will retry"),
        }

        let (poll_shutdown_tx, poll_shutdown_rx) = mpsc::channel(1);
        self.poller_shutdown = Some(poll_shutdown_tx);
        self.tasks.push(tokio::spawn(
            self.engine.clone().run_poller(sync_rx, poll_shutdown_rx),
        ));

        info!("Bridge is running");
        Ok(())
    }

    /// Stops both loops, waits out the grace period, and forces a final
    /// mapping flush.
    pub async fn shutdown(&mut self) {
        info!("Shutting down bridge");

        if let Some(tx) = self.poller_shutdown.take() {
            let _ = tx.send(()).await;
        }
        if let Some(tx) = self.event_loop_shutdown.take() {
            let _ = tx.send(()).await;
        }
        if let Some(listener) = self.listener.take() {
            let _ = listener.shutdown().await;
        }

        let tasks = std::mem::take(&mut self.tasks);
        let drain = futures_util::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(grace = ?SHUTDOWN_GRACE, "Loops did not stop within grace period, abandoning");
        }

        if let Err(e) = self.store.flush() {
            error!(error = %e, "Final mapping flush failed");
        }

        info!("Bridge stopped");
    }
}

// =============================================================================
// Startup Helpers
// =============================================================================

/// Validates the Device key, retrying while the Device is unreachable.
///
/// Auth and config failures propagate immediately; they mean the key is
/// wrong, and no amount of retrying fixes that.
async fn validate_device_key(device: &dyn DeviceApi, initial_backoff: Duration) -> SyncResult<()> {
    let mut backoff = ExponentialBackoff {
        initial_interval: initial_backoff,
        max_interval: KEY_RETRY_MAX_BACKOFF,
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    };

    loop {
        match device.validate_key().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_fatal_at_startup() => {
                error!(error = %e, "Device rejected the security key");
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_backoff().unwrap_or(KEY_RETRY_MAX_BACKOFF);
                warn!(error = %e, retry_in = ?delay, "Device not reachable yet");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::inventory::{FilamentSpec, NewSpool, Spool, SpoolPatch, Vendor};
    use async_trait::async_trait;
    use spoolbridge_core::DeviceRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FlakyDevice {
        failures_before_ok: usize,
        attempts: AtomicUsize,
        auth_error: bool,
        records: Vec<DeviceRecord>,
    }

    #[async_trait]
    impl DeviceApi for FlakyDevice {
        async fn validate_key(&self) -> SyncResult<()> {
            if self.auth_error {
                return Err(SyncError::Auth("bad key".into()));
            }
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures_before_ok {
                Err(SyncError::Unreachable("still booting".into()))
            } else {
                Ok(())
            }
        }

        async fn list_spools(&self) -> SyncResult<Vec<DeviceRecord>> {
            Ok(self.records.clone())
        }

        async fn get_spool(&self, _tag_id: &str) -> SyncResult<Option<DeviceRecord>> {
            Ok(None)
        }
    }

    /// Minimal in-memory inventory that satisfies startup.
    #[derive(Default)]
    struct StubInventory {
        schema_calls: AtomicUsize,
        created: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl InventoryApi for StubInventory {
        async fn ensure_extra_field_schema(&self) -> SyncResult<()> {
            self.schema_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn find_or_create_vendor(&self, name: &str) -> SyncResult<Vendor> {
            Ok(Vendor { id: 1, name: name.to_string() })
        }

        async fn find_or_create_filament(&self, spec: &FilamentSpec) -> SyncResult<crate::inventory::Filament> {
            Ok(crate::inventory::Filament {
                id: 2,
                name: Some(spec.name.clone()),
                material: Some(spec.material.clone()),
                color_hex: spec.color_hex.clone(),
                vendor: None,
                weight: spec.weight,
                spool_weight: spec.spool_weight,
            })
        }

        async fn create_spool(&self, new: &NewSpool) -> SyncResult<Spool> {
            let tag = new
                .extra
                .get(crate::inventory::EXTRA_FIELD_TAG_ID)
                .cloned()
                .unwrap_or_default();
            self.created.lock().unwrap().push(tag);
            Ok(Spool {
                id: 10,
                filament: crate::inventory::Filament {
                    id: new.filament_id,
                    name: None,
                    material: None,
                    color_hex: None,
                    vendor: None,
                    weight: None,
                    spool_weight: None,
                },
                initial_weight: new.initial_weight,
                used_weight: new.used_weight,
                archived: false,
                extra: crate::inventory::encode_extra(&new.extra),
            })
        }

        async fn get_spool(&self, id: i64) -> SyncResult<Spool> {
            Err(SyncError::Inventory { status: 404, body: format!("no spool {id}") })
        }

        async fn list_spools(&self) -> SyncResult<Vec<Spool>> {
            Ok(Vec::new())
        }

        async fn add_usage(&self, _id: i64, _grams: f64) -> SyncResult<Spool> {
            Err(SyncError::Inventory { status: 404, body: "unexpected".into() })
        }

        async fn update_spool(&self, _id: i64, _patch: &SpoolPatch) -> SyncResult<Spool> {
            Err(SyncError::Inventory { status: 404, body: "unexpected".into() })
        }

        async fn delete_spool(&self, _id: i64) -> SyncResult<()> {
            Ok(())
        }
    }

    fn test_config(dir: &tempfile::TempDir) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.device.host = "device.test".to_string();
        config.device.security_key = "abc1234".to_string();
        config.sync.initial_delay_secs = 0;
        config.storage.mapping_path = dir.path().join("mapping.toml");
        config
    }

    fn record(tag: &str) -> DeviceRecord {
        DeviceRecord {
            tag_id: tag.to_string(),
            material: "PLA".to_string(),
            brand: "Bambu".to_string(),
            color_name: "Red".to_string(),
            color_hex: None,
            nominal_weight_g: 1000.0,
            empty_weight_g: 250.0,
            remaining_g: 1000.0,
            device_spool_id: 1,
        }
    }

    #[tokio::test]
    async fn test_key_validation_retries_unreachable_device() {
        let device = FlakyDevice {
            failures_before_ok: 2,
            attempts: AtomicUsize::new(0),
            auth_error: false,
            records: vec![],
        };
        validate_device_key(&device, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(device.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_key_validation_fails_fast_on_auth_error() {
        let device = FlakyDevice {
            failures_before_ok: 0,
            attempts: AtomicUsize::new(0),
            auth_error: true,
            records: vec![],
        };
        let err = validate_device_key(&device, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(err.is_fatal_at_startup());
    }

    #[tokio::test]
    async fn test_startup_runs_schema_setup_and_initial_sync() {
        let dir = tempfile::tempdir().unwrap();
        let device = Arc::new(FlakyDevice {
            failures_before_ok: 0,
            attempts: AtomicUsize::new(0),
            auth_error: false,
            records: vec![record("A1")],
        });
        let inventory = Arc::new(StubInventory::default());
        let store = Arc::new(MappingStore::new(dir.path().join("mapping.toml")));

        let mut agent = BridgeAgent::with_parts(
            test_config(&dir),
            device,
            inventory.clone(),
            store.clone(),
        );
        agent.start().await.unwrap();

        assert_eq!(inventory.schema_calls.load(Ordering::SeqCst), 1);
        assert_eq!(inventory.created.lock().unwrap().as_slice(), ["A1".to_string()]);
        assert_eq!(store.get("A1").unwrap().inventory_spool_id, 10);

        agent.shutdown().await;
        // The final flush persisted the mapping.
        let reloaded = MappingStore::new(dir.path().join("mapping.toml"));
        assert_eq!(reloaded.load(), 1);
    }
}
