//! # Mapping Store
//!
//! Durable mapping between Device tag ids and Inventory spool ids, with an
//! in-memory cache and crash-safe persistence.
//!
//! ## Persistence Contract
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Atomic Save Protocol                               │
//! │                                                                         │
//! │  1. Serialize state to TOML                                            │
//! │  2. Write to a sibling temp file  mapping.toml.tmp                      │
//! │  3. fsync the temp file                                                 │
//! │  4. rename(tmp, mapping.toml)     ◄── POSIX atomic                      │
//! │                                                                         │
//! │  Readers observe either the old or the new document, never a partial    │
//! │  one. A file that fails to parse (or carries an unknown schema          │
//! │  version) is treated as absent and the recovery path rebuilds the       │
//! │  mapping from Inventory extra fields.                                   │
//! │                                                                         │
//! │  DEBOUNCE                                                               │
//! │  ────────                                                               │
//! │  Mutations mark the state dirty and nudge a saver task; mutations       │
//! │  landing within the 500ms window coalesce into one disk write.          │
//! │  flush() forces a synchronous save at shutdown.                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use spoolbridge_core::DeviceRecord;

use crate::error::{SyncError, SyncResult};
use crate::inventory::Spool;

/// Schema version of the mapping document.
pub const MAPPING_SCHEMA_VERSION: u32 = 1;

/// Coalescing window for debounced saves.
const SAVE_DEBOUNCE: Duration = Duration::from_millis(500);

// =============================================================================
// Mapping Entry
// =============================================================================

/// One tag-to-spool linkage plus the sync baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Device tag id. The stable key.
    pub tag_id: String,

    /// Inventory spool id this tag maps to.
    pub inventory_spool_id: i64,

    /// Device-reported remaining grams at the last successful propagation.
    /// The baseline for the next delta computation.
    pub last_remaining_g: f64,

    /// When the last successful propagation happened.
    pub last_synced_at: DateTime<Utc>,

    /// Device metadata as of the last propagation, used to detect
    /// divergence without refetching the Inventory spool each poll.
    #[serde(default)]
    pub material: String,

    #[serde(default)]
    pub brand: String,

    #[serde(default)]
    pub color_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_hex: Option<String>,
}

impl MappingEntry {
    /// Builds an entry for a freshly created Inventory spool.
    pub fn from_record(record: &DeviceRecord, inventory_spool_id: i64) -> Self {
        MappingEntry {
            tag_id: record.tag_id.clone(),
            inventory_spool_id,
            last_remaining_g: record.effective_remaining_g(),
            last_synced_at: Utc::now(),
            material: record.material.clone(),
            brand: record.brand.clone(),
            color_name: record.color_name.clone(),
            color_hex: record.color_hex.clone(),
        }
    }

    /// Builds an entry recovered from an Inventory spool's extra fields.
    pub fn from_inventory_spool(tag_id: String, spool: &Spool) -> Self {
        MappingEntry {
            tag_id,
            inventory_spool_id: spool.id,
            last_remaining_g: spool.remaining_g(),
            last_synced_at: Utc::now(),
            material: spool.filament.material.clone().unwrap_or_default(),
            brand: spool
                .filament
                .vendor
                .as_ref()
                .map(|v| v.name.clone())
                .unwrap_or_default(),
            color_name: spool.filament.name.clone().unwrap_or_default(),
            color_hex: spool.filament.color_hex.clone(),
        }
    }

    /// Returns true if the record's metadata still matches this snapshot.
    pub fn matches_metadata(&self, record: &DeviceRecord) -> bool {
        self.material == record.material
            && self.brand == record.brand
            && self.color_name == record.color_name
            && self.color_hex == record.color_hex
    }

    /// Copies the record's metadata into the snapshot.
    pub fn refresh_metadata(&mut self, record: &DeviceRecord) {
        self.material = record.material.clone();
        self.brand = record.brand.clone();
        self.color_name = record.color_name.clone();
        self.color_hex = record.color_hex.clone();
    }
}

// =============================================================================
// Persisted Document
// =============================================================================

/// On-disk shape of the mapping file.
#[derive(Debug, Serialize, Deserialize)]
struct MappingDocument {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    spools: BTreeMap<String, MappingEntry>,
}

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
struct StoreState {
    by_tag: HashMap<String, MappingEntry>,
    by_spool: HashMap<i64, String>,
    dirty: bool,
}

impl StoreState {
    fn insert(&mut self, entry: MappingEntry) {
        if let Some(old) = self.by_tag.get(&entry.tag_id) {
            self.by_spool.remove(&old.inventory_spool_id);
        }
        self.by_spool
            .insert(entry.inventory_spool_id, entry.tag_id.clone());
        self.by_tag.insert(entry.tag_id.clone(), entry);
    }

    fn remove_tag(&mut self, tag_id: &str) -> Option<MappingEntry> {
        let entry = self.by_tag.remove(tag_id)?;
        self.by_spool.remove(&entry.inventory_spool_id);
        Some(entry)
    }
}

/// Durable tag → spool mapping with an in-memory cache.
///
/// One internal mutex guards both the forward map and the reverse index,
/// so every read or mutation observes a consistent pair.
pub struct MappingStore {
    path: PathBuf,
    state: Arc<Mutex<StoreState>>,
    save_tx: mpsc::Sender<()>,
}

impl MappingStore {
    /// Creates a store over the given file path and spawns the debounced
    /// saver task. Call [`load`](Self::load) before first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = Arc::new(Mutex::new(StoreState::default()));
        let (save_tx, save_rx) = mpsc::channel(8);

        tokio::spawn(run_saver(path.clone(), state.clone(), save_rx));

        MappingStore {
            path,
            state,
            save_tx,
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Loads the mapping file, returning the number of entries loaded.
    ///
    /// A missing, unparseable, or version-mismatched file is treated as
    /// absent (returns 0) so the caller takes the recovery path.
    pub fn load(&self) -> usize {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No mapping file, starting fresh");
                return 0;
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read mapping file, treating as absent");
                return 0;
            }
        };

        let document: MappingDocument = match toml::from_str(&contents) {
            Ok(d) => d,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Mapping file is corrupt, treating as absent");
                return 0;
            }
        };

        if document.version != MAPPING_SCHEMA_VERSION {
            warn!(
                version = document.version,
                expected = MAPPING_SCHEMA_VERSION,
                "Mapping file has unknown schema version, treating as absent"
            );
            return 0;
        }

        let mut state = self.state.lock().expect("mapping store lock poisoned");
        *state = StoreState::default();
        for (_, entry) in document.spools {
            state.insert(entry);
        }
        state.dirty = false;
        let count = state.by_tag.len();
        info!(count, path = %self.path.display(), "Loaded spool mappings");
        count
    }

    /// Saves immediately, regardless of the debounce window.
    pub fn save(&self) -> SyncResult<()> {
        save_to_disk(&self.path, &self.state)
    }

    /// Final save for shutdown: drains any pending debounce by saving now.
    pub fn flush(&self) -> SyncResult<()> {
        self.save()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Inserts or replaces the entry for its tag.
    pub fn upsert(&self, entry: MappingEntry) {
        {
            let mut state = self.state.lock().expect("mapping store lock poisoned");
            state.insert(entry);
            state.dirty = true;
        }
        self.nudge_saver();
    }

    /// Removes the entry for a tag.
    pub fn remove(&self, tag_id: &str) -> Option<MappingEntry> {
        let removed = {
            let mut state = self.state.lock().expect("mapping store lock poisoned");
            let removed = state.remove_tag(tag_id);
            if removed.is_some() {
                state.dirty = true;
            }
            removed
        };
        if removed.is_some() {
            self.nudge_saver();
        }
        removed
    }

    /// Removes the entry mapped to an Inventory spool id.
    pub fn remove_by_spool_id(&self, spool_id: i64) -> Option<MappingEntry> {
        let tag = self.tag_for_spool(spool_id)?;
        self.remove(&tag)
    }

    /// Rebuilds the mapping from Inventory spools carrying a tag extra
    /// field. Returns the number of recovered entries.
    pub fn rebuild_from_inventory(&self, spools: &[Spool]) -> usize {
        let mut recovered = 0;
        {
            let mut state = self.state.lock().expect("mapping store lock poisoned");
            for spool in spools {
                let Some(tag_id) = spool.tag_id() else { continue };
                state.insert(MappingEntry::from_inventory_spool(tag_id, spool));
                recovered += 1;
            }
            if recovered > 0 {
                state.dirty = true;
            }
        }
        if recovered > 0 {
            info!(recovered, "Rebuilt mappings from inventory extra fields");
            self.nudge_saver();
        }
        recovered
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the entry for a tag.
    pub fn get(&self, tag_id: &str) -> Option<MappingEntry> {
        self.state
            .lock()
            .expect("mapping store lock poisoned")
            .by_tag
            .get(tag_id)
            .cloned()
    }

    /// Reverse lookup: the tag mapped to an Inventory spool id.
    pub fn tag_for_spool(&self, spool_id: i64) -> Option<String> {
        self.state
            .lock()
            .expect("mapping store lock poisoned")
            .by_spool
            .get(&spool_id)
            .cloned()
    }

    /// A point-in-time copy of all entries.
    pub fn snapshot(&self) -> HashMap<String, MappingEntry> {
        self.state
            .lock()
            .expect("mapping store lock poisoned")
            .by_tag
            .clone()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("mapping store lock poisoned")
            .by_tag
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn nudge_saver(&self) {
        // A full channel already has a save pending; the mutation will ride
        // along with it.
        let _ = self.save_tx.try_send(());
    }
}

// =============================================================================
// Saver
// =============================================================================

/// Debounced background saver: waits out the coalescing window after each
/// nudge, then writes once.
async fn run_saver(path: PathBuf, state: Arc<Mutex<StoreState>>, mut rx: mpsc::Receiver<()>) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(SAVE_DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        if let Err(e) = save_to_disk(&path, &state) {
            warn!(error = %e, "Debounced mapping save failed, will retry on next mutation");
        }
    }
    debug!("Mapping saver stopped");
}

fn save_to_disk(path: &Path, state: &Mutex<StoreState>) -> SyncResult<()> {
    // Serialize under the lock, write outside it.
    let document = {
        let mut state = state.lock().expect("mapping store lock poisoned");
        if !state.dirty {
            return Ok(());
        }
        state.dirty = false;
        MappingDocument {
            version: MAPPING_SCHEMA_VERSION,
            updated_at: Utc::now(),
            spools: state
                .by_tag
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    };

    let contents = toml::to_string_pretty(&document)
        .map_err(|e| SyncError::Storage(format!("cannot serialize mapping: {e}")))?;

    if let Err(e) = write_atomic(path, &contents) {
        // Keep the state marked dirty so the next mutation retries.
        state.lock().expect("mapping store lock poisoned").dirty = true;
        return Err(SyncError::Storage(format!(
            "cannot write {}: {e}",
            path.display()
        )));
    }

    debug!(
        count = document.spools.len(),
        path = %path.display(),
        "Saved mapping file"
    );
    Ok(())
}

/// Temp-write + fsync + rename so readers never observe a partial file.
fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_os = path.as_os_str().to_owned();
    tmp_os.push(".tmp");
    let tmp = PathBuf::from(tmp_os);

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)
}
