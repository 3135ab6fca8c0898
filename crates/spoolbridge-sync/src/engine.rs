//! # Sync Engine
//!
//! The reconciliation core: full sync, incremental polling, and
//! event-driven invalidation.
//!
//! ## Reconciliation Algorithm
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Full Sync Pass                                    │
//! │                                                                         │
//! │  D = device catalog        M = mapping                                  │
//! │                                                                         │
//! │  NEW       tag ∈ D, tag ∉ M                                            │
//! │            vendor → filament → spool created in Inventory,              │
//! │            mapping inserted with baseline = remaining                   │
//! │                                                                         │
//! │  CHANGED   tag ∈ D ∩ M,  Δ = baseline − remaining                      │
//! │            Δ ≥ threshold   → add_usage(Δ), advance baseline            │
//! │            Δ ≤ −threshold  → refill: absolute used_weight write,       │
//! │                              advance baseline (never negative usage)    │
//! │            |Δ| < threshold → nothing; baseline stays put               │
//! │            metadata drift  → repoint spool at the right filament        │
//! │                                                                         │
//! │  VANISHED  tag ∈ M, tag ∉ D                                            │
//! │            keep both the mapping and the Inventory spool (the Device    │
//! │            may have lost the tag temporarily); warn                     │
//! │                                                                         │
//! │  ORDERING                                                               │
//! │  ────────                                                               │
//! │  • Baselines advance only AFTER the Inventory confirms the write        │
//! │  • Per-tag operations are serialized through a tag-lock registry        │
//! │    shared by the poller and the event loop                              │
//! │  • One failing spool never blocks the others (bounded fan-out of 8)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use spoolbridge_core::DeviceRecord;

use crate::config::BridgeConfig;
use crate::device::DeviceApi;
use crate::error::SyncResult;
use crate::events::{ListenerSignal, SpoolEvent};
use crate::inventory::{FilamentSpec, InventoryApi, NewSpool, Spool, SpoolPatch, EXTRA_FIELD_TAG_ID};
use crate::mapping::{MappingEntry, MappingStore};

/// Upper bound on concurrent Inventory operations within one sync pass.
const MAX_SYNC_FAN_OUT: usize = 8;

/// Default filament diameter (mm) for created filaments.
const DEFAULT_DIAMETER_MM: f64 = 1.75;

/// Typical density (g/cm³) per material, used when creating filaments.
fn material_density(material: &str) -> f64 {
    match material.to_ascii_uppercase().as_str() {
        "PETG" => 1.27,
        "ABS" => 1.04,
        "ASA" => 1.07,
        "TPU" => 1.21,
        "PA" => 1.14,
        "PC" => 1.20,
        "PVA" => 1.23,
        "HIPS" => 1.04,
        // PLA and anything unknown.
        _ => 1.24,
    }
}

// =============================================================================
// Sync Report
// =============================================================================

/// Outcome counters for one full sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records in the Device catalog.
    pub seen: usize,
    /// Records without a usable tag.
    pub skipped_tags: usize,
    /// Inventory spools created.
    pub created: usize,
    /// Usage deltas pushed.
    pub usage_pushed: usize,
    /// Refills applied as absolute writes.
    pub refills: usize,
    /// Metadata repoints.
    pub metadata_updates: usize,
    /// Mapped spools with nothing to do.
    pub unchanged: usize,
    /// Spools whose sync failed (retried next pass).
    pub failed: usize,
    /// Mapped tags absent from the catalog.
    pub vanished: usize,
}

impl SyncReport {
    /// True if the pass performed any Inventory writes or hit failures.
    pub fn has_changes(&self) -> bool {
        self.created + self.usage_pushed + self.refills + self.metadata_updates + self.failed > 0
    }
}

/// What one spool's sync pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpoolAction {
    Created,
    UsagePushed,
    RefillApplied,
    MetadataUpdated,
}

// =============================================================================
// Tag Lock Registry
// =============================================================================

/// Per-tag async locks serializing the poller against the event loop.
///
/// Whichever loop acquires a tag's lock first wins; the other observes the
/// updated mapping once it enters.
#[derive(Default)]
struct TagLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TagLocks {
    fn lock_for(&self, tag_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().expect("tag lock registry poisoned");
        locks
            .entry(tag_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Orchestrates reconciliation between the Device catalog and the
/// Inventory, keeping the mapping store coherent.
pub struct SyncEngine {
    device: Arc<dyn DeviceApi>,
    inventory: Arc<dyn InventoryApi>,
    store: Arc<MappingStore>,
    config: Arc<BridgeConfig>,
    tag_locks: TagLocks,
}

impl SyncEngine {
    pub fn new(
        device: Arc<dyn DeviceApi>,
        inventory: Arc<dyn InventoryApi>,
        store: Arc<MappingStore>,
        config: Arc<BridgeConfig>,
    ) -> Self {
        SyncEngine {
            device,
            inventory,
            store,
            config,
            tag_locks: TagLocks::default(),
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Rebuilds the mapping from Inventory extra fields.
    ///
    /// Called when the mapping file is absent or unparseable; any spool
    /// carrying a tag extra field yields a recovered entry whose baseline
    /// is its implied remaining weight.
    pub async fn recover_mappings(&self) -> SyncResult<usize> {
        let spools = self.inventory.list_spools().await?;
        let recovered = self.store.rebuild_from_inventory(&spools);
        if recovered > 0 {
            self.store.save()?;
        }
        Ok(recovered)
    }

    // =========================================================================
    // Full Sync
    // =========================================================================

    /// Runs one full reconciliation pass against the current catalog.
    ///
    /// Fails only when the catalog itself cannot be fetched; per-spool
    /// failures are counted and retried on the next pass.
    pub async fn full_sync(&self) -> SyncResult<SyncReport> {
        let records = self.device.list_spools().await?;

        let mut report = SyncReport {
            seen: records.len(),
            ..Default::default()
        };

        let (stable, unstable): (Vec<_>, Vec<_>) =
            records.into_iter().partition(DeviceRecord::has_stable_tag);
        report.skipped_tags = unstable.len();
        for record in &unstable {
            debug!(
                device_spool_id = record.device_spool_id,
                tag = %record.tag_id,
                "Skipping spool without a usable tag"
            );
        }

        // Mapped tags the Device no longer reports. Policy: the Inventory
        // is the long-term record, so neither side is deleted.
        let snapshot = self.store.snapshot();
        for tag in snapshot.keys() {
            if !stable.iter().any(|r| &r.tag_id == tag) {
                warn!(tag = %tag, "Mapped spool missing from device catalog");
                report.vanished += 1;
            }
        }

        // Bounded fan-out; all network I/O happens outside the store lock.
        let outcomes: Vec<_> = stream::iter(stable)
            .map(|record| async move {
                let tag = record.tag_id.clone();
                let result = self.sync_spool(record).await;
                (tag, result)
            })
            .buffer_unordered(MAX_SYNC_FAN_OUT)
            .collect()
            .await;

        for (tag, result) in outcomes {
            match result {
                Ok(actions) => {
                    if actions.is_empty() {
                        report.unchanged += 1;
                    }
                    for action in actions {
                        match action {
                            SpoolAction::Created => report.created += 1,
                            SpoolAction::UsagePushed => report.usage_pushed += 1,
                            SpoolAction::RefillApplied => report.refills += 1,
                            SpoolAction::MetadataUpdated => report.metadata_updates += 1,
                        }
                    }
                }
                Err(e) => {
                    error!(tag = %tag, error = %e, "Spool sync failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Reconciles one catalog record, holding its tag lock throughout.
    async fn sync_spool(&self, record: DeviceRecord) -> SyncResult<Vec<SpoolAction>> {
        let lock = self.tag_locks.lock_for(&record.tag_id);
        let _guard = lock.lock().await;

        // Re-read under the lock: an event may have dropped the mapping
        // between the snapshot and now.
        match self.store.get(&record.tag_id) {
            None => {
                self.create_inventory_spool(&record).await?;
                Ok(vec![SpoolAction::Created])
            }
            Some(entry) => self.sync_mapped_spool(&record, entry).await,
        }
    }

    /// Creates the vendor → filament → spool chain for a new tag.
    async fn create_inventory_spool(&self, record: &DeviceRecord) -> SyncResult<()> {
        info!(
            tag = %record.tag_id,
            brand = %record.brand,
            material = %record.material,
            color = %record.color_name,
            "New device spool detected"
        );

        let vendor = self.inventory.find_or_create_vendor(&record.brand).await?;
        let filament = self
            .inventory
            .find_or_create_filament(&filament_spec(record, vendor.id))
            .await?;

        let mut extra = HashMap::new();
        extra.insert(EXTRA_FIELD_TAG_ID.to_string(), record.tag_id.clone());

        let spool = self
            .inventory
            .create_spool(&NewSpool {
                filament_id: filament.id,
                initial_weight: positive(record.nominal_weight_g),
                spool_weight: positive(record.empty_weight_g),
                used_weight: record.initial_used_g(),
                extra,
            })
            .await?;

        self.store.upsert(MappingEntry::from_record(record, spool.id));
        info!(
            tag = %record.tag_id,
            spool_id = spool.id,
            "Mapped device spool to inventory"
        );
        Ok(())
    }

    /// Pushes consumption or refill for an already-mapped spool, then
    /// reconciles metadata.
    async fn sync_mapped_spool(
        &self,
        record: &DeviceRecord,
        mut entry: MappingEntry,
    ) -> SyncResult<Vec<SpoolAction>> {
        let mut actions = Vec::new();
        let remaining = record.effective_remaining_g();
        let delta = entry.last_remaining_g - remaining;
        let threshold = self.config.sync.delta_threshold_g;

        if delta >= threshold {
            // Filament consumed since the baseline.
            self.inventory
                .add_usage(entry.inventory_spool_id, delta)
                .await?;
            entry.last_remaining_g = remaining;
            entry.last_synced_at = Utc::now();
            self.store.upsert(entry.clone());
            debug!(
                tag = %record.tag_id,
                delta = format!("{delta:.1}"),
                baseline = format!("{remaining:.1}"),
                "Pushed usage delta"
            );
            actions.push(SpoolAction::UsagePushed);
        } else if delta <= -threshold {
            // The spool gained filament: a refill or swap. Negative usage
            // is never pushed; the absolute level is written instead.
            warn!(
                tag = %record.tag_id,
                old = format!("{:.1}", entry.last_remaining_g),
                new = format!("{remaining:.1}"),
                "Remaining weight increased, treating as refill"
            );
            let used = (record.nominal_weight_g - remaining).max(0.0);
            self.inventory
                .update_spool(
                    entry.inventory_spool_id,
                    &SpoolPatch {
                        used_weight: Some(used),
                        ..Default::default()
                    },
                )
                .await?;
            entry.last_remaining_g = remaining;
            entry.last_synced_at = Utc::now();
            self.store.upsert(entry.clone());
            actions.push(SpoolAction::RefillApplied);
        }

        if !entry.matches_metadata(record) {
            self.update_metadata(record, &mut entry).await?;
            actions.push(SpoolAction::MetadataUpdated);
        }

        Ok(actions)
    }

    /// Repoints the Inventory spool at the filament matching the record's
    /// current metadata. Most-recent wins per field; the Device is the
    /// source of truth for spool metadata.
    async fn update_metadata(
        &self,
        record: &DeviceRecord,
        entry: &mut MappingEntry,
    ) -> SyncResult<()> {
        info!(
            tag = %record.tag_id,
            material = %record.material,
            color = %record.color_name,
            "Device metadata diverged, updating inventory"
        );

        let vendor = self.inventory.find_or_create_vendor(&record.brand).await?;
        let filament = self
            .inventory
            .find_or_create_filament(&filament_spec(record, vendor.id))
            .await?;

        self.inventory
            .update_spool(
                entry.inventory_spool_id,
                &SpoolPatch {
                    filament_id: Some(filament.id),
                    ..Default::default()
                },
            )
            .await?;

        entry.refresh_metadata(record);
        entry.last_synced_at = Utc::now();
        self.store.upsert(entry.clone());
        Ok(())
    }

    // =========================================================================
    // Event Handling
    // =========================================================================

    /// Applies one Inventory event to the mapping. Events are processed
    /// strictly serially by the event loop.
    pub async fn handle_event(&self, event: SpoolEvent) {
        match event {
            SpoolEvent::Deleted(spool) => self.handle_deleted(spool).await,
            SpoolEvent::Updated(spool) => self.handle_updated(spool).await,
            SpoolEvent::Created(spool) => self.handle_created(spool).await,
        }
    }

    async fn handle_deleted(&self, spool: Spool) {
        let Some(tag) = self.store.tag_for_spool(spool.id) else {
            return;
        };
        let lock = self.tag_locks.lock_for(&tag);
        let _guard = lock.lock().await;

        // Only drop the mapping if it still points at the deleted spool;
        // the poller may have re-created it while we waited for the lock.
        if self
            .store
            .get(&tag)
            .is_some_and(|m| m.inventory_spool_id == spool.id)
        {
            self.store.remove(&tag);
            info!(
                tag = %tag,
                spool_id = spool.id,
                "Inventory spool deleted, mapping removed (next poll may recreate it)"
            );
        }
    }

    async fn handle_updated(&self, spool: Spool) {
        let Some(tag) = self.store.tag_for_spool(spool.id) else {
            return;
        };
        // The spool still carries our tag: nothing to reconcile.
        if spool.tag_id().as_deref() == Some(tag.as_str()) {
            return;
        }

        let lock = self.tag_locks.lock_for(&tag);
        let _guard = lock.lock().await;
        if self
            .store
            .get(&tag)
            .is_some_and(|m| m.inventory_spool_id == spool.id)
        {
            self.store.remove(&tag);
            warn!(
                tag = %tag,
                spool_id = spool.id,
                "Tag extra field cleared or changed on inventory side, mapping dropped"
            );
        }
    }

    async fn handle_created(&self, spool: Spool) {
        let Some(tag) = spool.tag_id() else { return };
        let lock = self.tag_locks.lock_for(&tag);
        let _guard = lock.lock().await;

        // Someone created a tagged spool directly in the Inventory; adopt
        // it so the next poll does not create a duplicate.
        if self.store.get(&tag).is_none() {
            self.store
                .upsert(MappingEntry::from_inventory_spool(tag.clone(), &spool));
            info!(
                tag = %tag,
                spool_id = spool.id,
                "Adopted externally created inventory spool"
            );
        }
    }

    // =========================================================================
    // Loops
    // =========================================================================

    /// Incremental polling loop: one full sync per interval, plus
    /// on-demand syncs requested by the event loop. Single writer for full
    /// syncs.
    pub async fn run_poller(
        self: Arc<Self>,
        mut sync_rx: mpsc::Receiver<()>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let poll_interval = Duration::from_secs(self.config.sync.poll_interval_secs);
        info!(interval = ?poll_interval, "Poller starting");

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the startup sequence already
        // ran a full sync, so swallow it.
        interval.tick().await;

        let mut failure_backoff = ExponentialBackoff {
            initial_interval: poll_interval,
            max_interval: poll_interval * 10,
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut next_allowed = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if Instant::now() < next_allowed {
                        debug!("Skipping poll during failure backoff");
                        continue;
                    }
                    self.poll_once(&mut failure_backoff, &mut next_allowed).await;
                }

                Some(()) = sync_rx.recv() => {
                    info!("Running full sync on request");
                    self.poll_once(&mut failure_backoff, &mut next_allowed).await;
                }

                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Poller stopped");
    }

    async fn poll_once(&self, failure_backoff: &mut ExponentialBackoff, next_allowed: &mut Instant) {
        match self.full_sync().await {
            Ok(report) => {
                failure_backoff.reset();
                *next_allowed = Instant::now();
                if !report.has_changes() {
                    debug!(seen = report.seen, "Sync pass: no changes");
                } else {
                    info!(
                        seen = report.seen,
                        created = report.created,
                        usage = report.usage_pushed,
                        refills = report.refills,
                        metadata = report.metadata_updates,
                        failed = report.failed,
                        vanished = report.vanished,
                        "Sync pass complete"
                    );
                }
            }
            Err(e) => {
                let delay = failure_backoff
                    .next_backoff()
                    .unwrap_or(failure_backoff.max_interval);
                *next_allowed = Instant::now() + delay;
                warn!(error = %e, backoff = ?delay, "Sync pass skipped");
            }
        }
    }

    /// Event loop: applies feed events serially and requests a full sync
    /// after every reconnect (events during the gap are lost).
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut signal_rx: mpsc::Receiver<ListenerSignal>,
        sync_tx: mpsc::Sender<()>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        info!("Event loop starting");
        let mut connected_before = false;

        loop {
            tokio::select! {
                Some(signal) = signal_rx.recv() => match signal {
                    ListenerSignal::Connected => {
                        if connected_before {
                            warn!("Event stream reconnected, scheduling full sync");
                            let _ = sync_tx.try_send(());
                        } else {
                            // The startup sequence runs its own first sync.
                            connected_before = true;
                            debug!("Event stream connected");
                        }
                    }
                    ListenerSignal::Event(event) => self.handle_event(event).await,
                },

                _ = shutdown_rx.recv() => break,
            }
        }

        info!("Event loop stopped");
    }
}

/// Filament lookup/creation spec for a record's metadata.
fn filament_spec(record: &DeviceRecord, vendor_id: i64) -> FilamentSpec {
    FilamentSpec {
        vendor_id,
        name: if record.color_name.is_empty() {
            record.material.clone()
        } else {
            record.color_name.clone()
        },
        material: record.material.clone(),
        color_hex: record.color_hex.clone(),
        weight: positive(record.nominal_weight_g),
        spool_weight: positive(record.empty_weight_g),
        density: material_density(&record.material),
        diameter: DEFAULT_DIAMETER_MM,
    }
}

fn positive(value: f64) -> Option<f64> {
    (value > 0.0).then_some(value)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::inventory::{Filament, Vendor};
    use async_trait::async_trait;
    use std::collections::HashSet;

    // =========================================================================
    // Fakes
    // =========================================================================

    struct FakeDevice {
        records: StdMutex<Vec<DeviceRecord>>,
    }

    impl FakeDevice {
        fn new(records: Vec<DeviceRecord>) -> Arc<Self> {
            Arc::new(FakeDevice {
                records: StdMutex::new(records),
            })
        }

        fn set_records(&self, records: Vec<DeviceRecord>) {
            *self.records.lock().unwrap() = records;
        }

        fn set_remaining(&self, tag: &str, remaining: f64) {
            let mut records = self.records.lock().unwrap();
            let record = records.iter_mut().find(|r| r.tag_id == tag).unwrap();
            record.remaining_g = remaining;
        }
    }

    #[async_trait]
    impl DeviceApi for FakeDevice {
        async fn validate_key(&self) -> SyncResult<()> {
            Ok(())
        }

        async fn list_spools(&self) -> SyncResult<Vec<DeviceRecord>> {
            Ok(self.records.lock().unwrap().clone())
        }

        async fn get_spool(&self, tag_id: &str) -> SyncResult<Option<DeviceRecord>> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.tag_id == tag_id)
                .cloned())
        }
    }

    #[derive(Default)]
    struct FakeInventoryState {
        vendors: Vec<Vendor>,
        filaments: Vec<(i64, FilamentSpec)>,
        spools: HashMap<i64, Spool>,
        next_id: i64,
        calls: Vec<String>,
        fail_usage_for: HashSet<i64>,
    }

    #[derive(Default)]
    struct FakeInventory {
        state: StdMutex<FakeInventoryState>,
    }

    impl FakeInventory {
        fn new() -> Arc<Self> {
            let fake = FakeInventory::default();
            fake.state.lock().unwrap().next_id = 1;
            Arc::new(fake)
        }

        fn calls(&self) -> Vec<String> {
            self.state.lock().unwrap().calls.clone()
        }

        fn call_count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }

        fn spool(&self, id: i64) -> Spool {
            self.state.lock().unwrap().spools[&id].clone()
        }

        fn spool_ids(&self) -> Vec<i64> {
            let mut ids: Vec<_> = self.state.lock().unwrap().spools.keys().copied().collect();
            ids.sort();
            ids
        }

        fn fail_usage_for(&self, id: i64) {
            self.state.lock().unwrap().fail_usage_for.insert(id);
        }

        fn clear_failures(&self) {
            self.state.lock().unwrap().fail_usage_for.clear();
        }

        fn seed_spool(&self, spool: Spool) {
            let mut state = self.state.lock().unwrap();
            state.next_id = state.next_id.max(spool.id + 1);
            state.spools.insert(spool.id, spool);
        }
    }

    fn fake_filament(id: i64, spec: &FilamentSpec, vendor: Option<Vendor>) -> Filament {
        Filament {
            id,
            name: Some(spec.name.clone()),
            material: Some(spec.material.clone()),
            color_hex: spec.color_hex.clone(),
            vendor,
            weight: spec.weight,
            spool_weight: spec.spool_weight,
        }
    }

    #[async_trait]
    impl InventoryApi for FakeInventory {
        async fn ensure_extra_field_schema(&self) -> SyncResult<()> {
            self.state.lock().unwrap().calls.push("schema".into());
            Ok(())
        }

        async fn find_or_create_vendor(&self, name: &str) -> SyncResult<Vendor> {
            let name = if name.is_empty() { "Unknown" } else { name };
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("vendor:{name}"));
            if let Some(v) = state.vendors.iter().find(|v| v.name == name) {
                return Ok(v.clone());
            }
            let vendor = Vendor {
                id: state.next_id,
                name: name.to_string(),
            };
            state.next_id += 1;
            state.vendors.push(vendor.clone());
            Ok(vendor)
        }

        async fn find_or_create_filament(&self, spec: &FilamentSpec) -> SyncResult<Filament> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!(
                "filament:{}:{}:{}",
                spec.vendor_id,
                spec.material,
                spec.color_hex.as_deref().unwrap_or("-")
            ));
            if let Some((id, existing)) = state
                .filaments
                .iter()
                .find(|(_, s)| {
                    s.vendor_id == spec.vendor_id
                        && s.material == spec.material
                        && s.color_hex == spec.color_hex
                })
                .map(|(id, s)| (*id, s.clone()))
            {
                let vendor = state.vendors.iter().find(|v| v.id == existing.vendor_id).cloned();
                return Ok(fake_filament(id, &existing, vendor));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.filaments.push((id, spec.clone()));
            let vendor = state.vendors.iter().find(|v| v.id == spec.vendor_id).cloned();
            Ok(fake_filament(id, spec, vendor))
        }

        async fn create_spool(&self, new: &NewSpool) -> SyncResult<Spool> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("create_spool:{}", new.filament_id));
            let id = state.next_id;
            state.next_id += 1;

            let spec = state
                .filaments
                .iter()
                .find(|(fid, _)| *fid == new.filament_id)
                .map(|(_, s)| s.clone());
            let filament = match spec {
                Some(spec) => {
                    let vendor = state.vendors.iter().find(|v| v.id == spec.vendor_id).cloned();
                    fake_filament(new.filament_id, &spec, vendor)
                }
                None => Filament {
                    id: new.filament_id,
                    name: None,
                    material: None,
                    color_hex: None,
                    vendor: None,
                    weight: None,
                    spool_weight: None,
                },
            };

            let spool = Spool {
                id,
                filament,
                initial_weight: new.initial_weight,
                used_weight: new.used_weight,
                archived: false,
                extra: crate::inventory::encode_extra(&new.extra),
            };
            state.spools.insert(id, spool.clone());
            Ok(spool)
        }

        async fn get_spool(&self, id: i64) -> SyncResult<Spool> {
            let state = self.state.lock().unwrap();
            state.spools.get(&id).cloned().ok_or(SyncError::Inventory {
                status: 404,
                body: format!("no spool {id}"),
            })
        }

        async fn list_spools(&self) -> SyncResult<Vec<Spool>> {
            let mut state = self.state.lock().unwrap();
            state.calls.push("list_spools".into());
            Ok(state.spools.values().cloned().collect())
        }

        async fn add_usage(&self, id: i64, grams: f64) -> SyncResult<Spool> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("add_usage:{id}:{grams:.2}"));
            if state.fail_usage_for.contains(&id) {
                return Err(SyncError::Inventory {
                    status: 503,
                    body: "backend down".into(),
                });
            }
            let spool = state.spools.get_mut(&id).ok_or(SyncError::Inventory {
                status: 404,
                body: format!("no spool {id}"),
            })?;
            spool.used_weight += grams;
            Ok(spool.clone())
        }

        async fn update_spool(&self, id: i64, patch: &SpoolPatch) -> SyncResult<Spool> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!(
                "update_spool:{id}:{}",
                serde_json::to_string(patch).unwrap()
            ));
            let spool = state.spools.get_mut(&id).ok_or(SyncError::Inventory {
                status: 404,
                body: format!("no spool {id}"),
            })?;
            if let Some(used) = patch.used_weight {
                spool.used_weight = used;
            }
            if let Some(filament_id) = patch.filament_id {
                spool.filament.id = filament_id;
            }
            Ok(spool.clone())
        }

        async fn delete_spool(&self, id: i64) -> SyncResult<()> {
            let mut state = self.state.lock().unwrap();
            state.calls.push(format!("delete_spool:{id}"));
            state.spools.remove(&id);
            Ok(())
        }
    }

    // =========================================================================
    // Harness
    // =========================================================================

    struct Harness {
        device: Arc<FakeDevice>,
        inventory: Arc<FakeInventory>,
        store: Arc<MappingStore>,
        engine: SyncEngine,
        _dir: tempfile::TempDir,
    }

    fn record(tag: &str) -> DeviceRecord {
        DeviceRecord {
            tag_id: tag.to_string(),
            material: "PLA".to_string(),
            brand: "Bambu".to_string(),
            color_name: "Red".to_string(),
            color_hex: Some("FF0000".to_string()),
            nominal_weight_g: 1000.0,
            empty_weight_g: 250.0,
            remaining_g: 1000.0,
            device_spool_id: 1,
        }
    }

    fn harness(records: Vec<DeviceRecord>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new(records);
        let inventory = FakeInventory::new();
        let store = Arc::new(MappingStore::new(dir.path().join("mapping.toml")));

        let mut config = BridgeConfig::default();
        config.device.host = "device.test".to_string();
        config.device.security_key = "abc1234".to_string();
        config.sync.delta_threshold_g = 0.1;

        let engine = SyncEngine::new(
            device.clone(),
            inventory.clone(),
            store.clone(),
            Arc::new(config),
        );

        Harness {
            device,
            inventory,
            store,
            engine,
            _dir: dir,
        }
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    /// S1: a brand-new device spool creates the vendor → filament → spool
    /// chain and a mapping with baseline = remaining.
    #[tokio::test]
    async fn test_new_spool_creates_inventory_chain() {
        let h = harness(vec![record("A1")]);

        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 0);

        let calls = h.inventory.calls();
        assert!(calls.iter().any(|c| c == "vendor:Bambu"));
        assert!(calls.iter().any(|c| c.starts_with("filament:")));
        assert_eq!(h.inventory.call_count("create_spool"), 1);

        let spool_id = h.inventory.spool_ids()[0];
        let spool = h.inventory.spool(spool_id);
        assert_eq!(spool.initial_weight, Some(1000.0));
        assert_eq!(spool.used_weight, 0.0);
        assert_eq!(spool.tag_id().as_deref(), Some("A1"));

        let mapping = h.store.get("A1").unwrap();
        assert_eq!(mapping.inventory_spool_id, spool_id);
        assert_eq!(mapping.last_remaining_g, 1000.0);
    }

    /// S2: a consumption delta at or above the threshold produces exactly
    /// one add_usage and advances the baseline.
    #[tokio::test]
    async fn test_consumption_pushes_usage_once() {
        let h = harness(vec![record("A1")]);
        h.engine.full_sync().await.unwrap();

        h.device.set_remaining("A1", 975.0);
        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.usage_pushed, 1);

        assert_eq!(h.inventory.call_count("add_usage"), 1);
        assert!(h
            .inventory
            .calls()
            .iter()
            .any(|c| c.starts_with("add_usage:") && c.ends_with(":25.00")));
        assert_eq!(h.store.get("A1").unwrap().last_remaining_g, 975.0);

        // Repeating the identical poll must push nothing further.
        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.usage_pushed, 0);
        assert_eq!(report.unchanged, 1);
        assert_eq!(h.inventory.call_count("add_usage"), 1);
    }

    /// S3: a sub-threshold delta produces no Inventory calls and does NOT
    /// advance the baseline.
    #[tokio::test]
    async fn test_sub_threshold_delta_is_suppressed() {
        let h = harness(vec![record("A1")]);
        h.engine.full_sync().await.unwrap();
        h.device.set_remaining("A1", 975.0);
        h.engine.full_sync().await.unwrap();
        let calls_before = h.inventory.calls().len();

        h.device.set_remaining("A1", 974.95);
        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.usage_pushed, 0);
        assert_eq!(report.unchanged, 1);
        assert_eq!(h.inventory.calls().len(), calls_before);
        assert_eq!(h.store.get("A1").unwrap().last_remaining_g, 975.0);

        // The suppressed fraction still counts once the total crosses the
        // threshold.
        h.device.set_remaining("A1", 974.0);
        h.engine.full_sync().await.unwrap();
        let usage_calls: Vec<_> = h
            .inventory
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("add_usage"))
            .collect();
        assert_eq!(usage_calls.len(), 2);
        assert!(usage_calls[1].ends_with(":1.00"));
    }

    /// S4: an Inventory-side deletion removes the mapping; the next poll
    /// recreates the spool under a fresh id with the current baseline.
    #[tokio::test]
    async fn test_deletion_event_then_poll_recreates_spool() {
        let h = harness(vec![record("A1")]);
        h.engine.full_sync().await.unwrap();
        h.device.set_remaining("A1", 975.0);
        h.engine.full_sync().await.unwrap();

        let old_id = h.store.get("A1").unwrap().inventory_spool_id;
        h.engine
            .handle_event(SpoolEvent::Deleted(h.inventory.spool(old_id)))
            .await;
        assert!(h.store.get("A1").is_none());

        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.created, 1);

        let mapping = h.store.get("A1").unwrap();
        assert_ne!(mapping.inventory_spool_id, old_id);
        assert_eq!(mapping.last_remaining_g, 975.0);
        // The recreated spool reflects consumption to date.
        let spool = h.inventory.spool(mapping.inventory_spool_id);
        assert_eq!(spool.used_weight, 25.0);
    }

    /// S5: a remaining increase is pushed as an absolute update, never as
    /// negative usage, and advances the baseline.
    #[tokio::test]
    async fn test_refill_writes_absolute_level() {
        let h = harness(vec![record("A1")]);
        h.engine.full_sync().await.unwrap();
        h.device.set_remaining("A1", 975.0);
        h.engine.full_sync().await.unwrap();

        h.device.set_remaining("A1", 1000.0);
        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.refills, 1);
        assert_eq!(report.usage_pushed, 0);

        assert_eq!(h.inventory.call_count("add_usage"), 1); // only the earlier one
        let spool_id = h.store.get("A1").unwrap().inventory_spool_id;
        assert_eq!(h.inventory.spool(spool_id).used_weight, 0.0);
        assert_eq!(h.store.get("A1").unwrap().last_remaining_g, 1000.0);
    }

    /// Property 9: one spool failing with a 5xx neither blocks the other
    /// spool nor advances its own baseline; the delta is retried next pass.
    #[tokio::test]
    async fn test_per_spool_isolation_and_retry() {
        let mut x = record("X1");
        x.device_spool_id = 1;
        let mut y = record("Y2");
        y.device_spool_id = 2;
        let h = harness(vec![x, y]);
        h.engine.full_sync().await.unwrap();

        let x_spool = h.store.get("X1").unwrap().inventory_spool_id;
        h.inventory.fail_usage_for(x_spool);

        h.device.set_remaining("X1", 900.0);
        h.device.set_remaining("Y2", 950.0);
        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.usage_pushed, 1);

        // Y advanced, X did not.
        assert_eq!(h.store.get("Y2").unwrap().last_remaining_g, 950.0);
        assert_eq!(h.store.get("X1").unwrap().last_remaining_g, 1000.0);

        // Next cycle retries X's full delta.
        h.inventory.clear_failures();
        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.usage_pushed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.store.get("X1").unwrap().last_remaining_g, 900.0);
        assert_eq!(h.inventory.spool(x_spool).used_weight, 100.0);
    }

    /// Property 4: recovery rebuilds exactly the mappings present as
    /// Inventory extra fields, with baseline = initial − used.
    #[tokio::test]
    async fn test_recovery_from_inventory() {
        let h = harness(vec![record("A1"), record("B2")]);
        h.engine.full_sync().await.unwrap();
        assert_eq!(h.store.len(), 2);
        let a1 = h.store.get("A1").unwrap();

        // Lose the in-memory mapping entirely.
        h.store.remove("A1");
        h.store.remove("B2");
        assert!(h.store.is_empty());

        let recovered = h.engine.recover_mappings().await.unwrap();
        assert_eq!(recovered, 2);
        let rebuilt = h.store.get("A1").unwrap();
        assert_eq!(rebuilt.inventory_spool_id, a1.inventory_spool_id);
        assert_eq!(rebuilt.last_remaining_g, 1000.0);
    }

    /// Vanished spools stay in both systems (the Device may have lost the
    /// tag temporarily).
    #[tokio::test]
    async fn test_vanished_spool_keeps_mapping_and_inventory() {
        let h = harness(vec![record("A1")]);
        h.engine.full_sync().await.unwrap();

        h.device.set_records(vec![]);
        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.vanished, 1);
        assert!(h.store.get("A1").is_some());
        assert_eq!(h.inventory.call_count("delete_spool"), 0);
    }

    /// Records without a usable tag never touch the Inventory.
    #[tokio::test]
    async fn test_unusable_tags_are_skipped() {
        let mut invalidated = record("-A1");
        invalidated.device_spool_id = 2;
        let mut untagged = record("");
        untagged.device_spool_id = 3;
        let h = harness(vec![record("A1"), invalidated, untagged]);

        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.seen, 3);
        assert_eq!(report.skipped_tags, 2);
        assert_eq!(report.created, 1);
        assert_eq!(h.store.len(), 1);
    }

    /// Metadata divergence repoints the spool at the filament matching the
    /// Device's current metadata.
    #[tokio::test]
    async fn test_metadata_divergence_repoints_filament() {
        let h = harness(vec![record("A1")]);
        h.engine.full_sync().await.unwrap();
        let spool_id = h.store.get("A1").unwrap().inventory_spool_id;
        let old_filament = h.inventory.spool(spool_id).filament.id;

        let mut changed = record("A1");
        changed.color_name = "Galaxy Black".to_string();
        changed.color_hex = Some("101010".to_string());
        h.device.set_records(vec![changed.clone()]);

        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.metadata_updates, 1);
        assert_ne!(h.inventory.spool(spool_id).filament.id, old_filament);
        assert!(h.store.get("A1").unwrap().matches_metadata(&changed));

        // Stable metadata afterwards: nothing more to do.
        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.metadata_updates, 0);
        assert_eq!(report.unchanged, 1);
    }

    /// A Created event for an externally tagged spool is adopted, so the
    /// next poll does not create a duplicate.
    #[tokio::test]
    async fn test_created_event_prevents_duplicate_creation() {
        let h = harness(vec![record("A1")]);

        let mut extra = HashMap::new();
        extra.insert(EXTRA_FIELD_TAG_ID.to_string(), "\"A1\"".to_string());
        let external = Spool {
            id: 77,
            filament: Filament {
                id: 5,
                name: Some("Red".into()),
                material: Some("PLA".into()),
                color_hex: Some("FF0000".into()),
                vendor: Some(Vendor { id: 1, name: "Bambu".into() }),
                weight: Some(1000.0),
                spool_weight: None,
            },
            initial_weight: Some(1000.0),
            used_weight: 0.0,
            archived: false,
            extra,
        };
        h.inventory.seed_spool(external.clone());
        h.engine.handle_event(SpoolEvent::Created(external)).await;

        assert_eq!(h.store.get("A1").unwrap().inventory_spool_id, 77);

        let report = h.engine.full_sync().await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(h.inventory.call_count("create_spool"), 0);
    }

    /// An Updated event whose payload no longer carries the mapped tag
    /// drops the mapping.
    #[tokio::test]
    async fn test_updated_event_with_cleared_tag_drops_mapping() {
        let h = harness(vec![record("A1")]);
        h.engine.full_sync().await.unwrap();
        let spool_id = h.store.get("A1").unwrap().inventory_spool_id;

        let mut payload = h.inventory.spool(spool_id);
        payload.extra.clear();
        h.engine.handle_event(SpoolEvent::Updated(payload)).await;
        assert!(h.store.get("A1").is_none());
    }

    /// An Updated event still carrying the mapped tag is a no-op.
    #[tokio::test]
    async fn test_updated_event_with_same_tag_is_noop() {
        let h = harness(vec![record("A1")]);
        h.engine.full_sync().await.unwrap();
        let mapping = h.store.get("A1").unwrap();

        let payload = h.inventory.spool(mapping.inventory_spool_id);
        h.engine.handle_event(SpoolEvent::Updated(payload)).await;
        assert_eq!(h.store.get("A1").unwrap(), mapping);
    }

    /// Deletion events for unmapped spools are ignored.
    #[tokio::test]
    async fn test_deletion_of_unmapped_spool_is_ignored() {
        let h = harness(vec![record("A1")]);
        h.engine.full_sync().await.unwrap();

        let mut unrelated = h.inventory.spool(h.store.get("A1").unwrap().inventory_spool_id);
        unrelated.id = 9999;
        h.engine.handle_event(SpoolEvent::Deleted(unrelated)).await;
        assert!(h.store.get("A1").is_some());
    }

    /// Remaining above nominal is clamped before any math runs.
    #[tokio::test]
    async fn test_remaining_above_nominal_is_clamped() {
        let mut wet = record("A1");
        wet.remaining_g = 1020.0;
        let h = harness(vec![wet]);

        h.engine.full_sync().await.unwrap();
        let mapping = h.store.get("A1").unwrap();
        assert_eq!(mapping.last_remaining_g, 1000.0);

        let spool = h.inventory.spool(mapping.inventory_spool_id);
        assert_eq!(spool.used_weight, 0.0);
    }

    /// S6 plumbing: a reconnect signal after the first connection requests
    /// exactly one full sync from the poller.
    #[tokio::test]
    async fn test_reconnect_signal_requests_full_sync() {
        let h = harness(vec![record("A1")]);
        let engine = Arc::new(h.engine);

        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (sync_tx, mut sync_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let task = tokio::spawn(engine.clone().run_event_loop(signal_rx, sync_tx, shutdown_rx));

        // First connect: the startup sequence owns the first sync.
        signal_tx.send(ListenerSignal::Connected).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sync_rx.try_recv().is_err());

        // Reconnect: a sweep is requested.
        signal_tx.send(ListenerSignal::Connected).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sync_rx.try_recv().is_ok());

        shutdown_tx.send(()).await.unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_material_density_table() {
        assert_eq!(material_density("PLA"), 1.24);
        assert_eq!(material_density("petg"), 1.27);
        assert_eq!(material_density("weird-new-material"), 1.24);
    }
}
