//! # Inventory Client
//!
//! Typed REST operations against the Inventory's v1 API: extra-field
//! schema setup, vendor/filament catalog, and spool CRUD + usage.
//!
//! ## API Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Inventory REST Surface                             │
//! │                                                                         │
//! │  GET    /api/v1/field/spool           list extra-field schema           │
//! │  POST   /api/v1/field/spool/{key}     declare an extra field            │
//! │  GET    /api/v1/vendor?name=          find vendors (partial match)      │
//! │  POST   /api/v1/vendor                create vendor                     │
//! │  GET    /api/v1/filament?vendor.id=   find filaments by vendor+material │
//! │  POST   /api/v1/filament              create filament                   │
//! │  GET    /api/v1/spool?allow_archived  list all spools                   │
//! │  POST   /api/v1/spool                 create spool                      │
//! │  GET    /api/v1/spool/{id}            fetch one spool                   │
//! │  PATCH  /api/v1/spool/{id}            partial update                    │
//! │  PUT    /api/v1/spool/{id}/use        increment used weight (atomic)    │
//! │  DELETE /api/v1/spool/{id}            delete spool                      │
//! │                                                                         │
//! │  EXTRA FIELD VALUES ARE JSON-ENCODED STRINGS                            │
//! │  The Inventory validates each extra value with a JSON parse, so the     │
//! │  tag "A1" travels as the 4-character string "\"A1\"".                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::error::{SyncError, SyncResult};

/// Key of the spool extra field carrying the Device tag id. Declared at
/// startup and read back during recovery; changing it silently orphans
/// every existing mapping.
pub const EXTRA_FIELD_TAG_ID: &str = "tag_id";

/// Startup attempts for schema setup while the Inventory is still booting.
const SCHEMA_SETUP_ATTEMPTS: u32 = 5;
const SCHEMA_SETUP_DELAY: Duration = Duration::from_secs(3);

// =============================================================================
// Wire Types
// =============================================================================

/// A vendor catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vendor {
    pub id: i64,
    pub name: String,
}

/// A filament catalog entry (shared by many spools).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filament {
    pub id: i64,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub material: Option<String>,

    #[serde(default)]
    pub color_hex: Option<String>,

    #[serde(default)]
    pub vendor: Option<Vendor>,

    /// Grams of filament on a full spool of this product.
    #[serde(default)]
    pub weight: Option<f64>,

    /// Grams of the empty spool core.
    #[serde(default)]
    pub spool_weight: Option<f64>,
}

/// One physical spool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spool {
    pub id: i64,

    pub filament: Filament,

    #[serde(default)]
    pub initial_weight: Option<f64>,

    #[serde(default)]
    pub used_weight: f64,

    #[serde(default)]
    pub archived: bool,

    /// Extra fields; values are JSON-encoded strings (see module docs).
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl Spool {
    /// Returns the Device tag id stored on this spool, if any.
    pub fn tag_id(&self) -> Option<String> {
        decode_extra_str(self.extra.get(EXTRA_FIELD_TAG_ID)?)
    }

    /// Remaining grams implied by initial and used weight, floored at 0.
    pub fn remaining_g(&self) -> f64 {
        let initial = self.initial_weight.or(self.filament.weight).unwrap_or(0.0);
        (initial - self.used_weight).max(0.0)
    }
}

/// Specification for a filament lookup-or-create.
#[derive(Debug, Clone)]
pub struct FilamentSpec {
    pub vendor_id: i64,
    pub name: String,
    pub material: String,
    pub color_hex: Option<String>,
    pub weight: Option<f64>,
    pub spool_weight: Option<f64>,
    pub density: f64,
    pub diameter: f64,
}

/// Creation payload for a spool.
#[derive(Debug, Clone)]
pub struct NewSpool {
    pub filament_id: i64,
    pub initial_weight: Option<f64>,
    pub spool_weight: Option<f64>,
    pub used_weight: f64,
    pub extra: HashMap<String, String>,
}

/// Partial update for a spool. `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SpoolPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filament_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_weight: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<HashMap<String, String>>,
}

/// Extra-field schema entry as listed by the Inventory.
#[derive(Debug, Deserialize)]
struct ExtraFieldDef {
    key: String,
}

// =============================================================================
// Extra-Field Value Encoding
// =============================================================================

/// JSON-encodes extra field values the way the Inventory validates them.
pub fn encode_extra(extra: &HashMap<String, String>) -> HashMap<String, String> {
    extra
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone()).to_string()))
        .collect()
}

/// Decodes an extra field value back to a plain string.
///
/// Values written by this bridge are JSON strings; values written by hand
/// through other tools may be bare text, so both are accepted.
pub fn decode_extra_str(value: &str) -> Option<String> {
    if value.is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(value) {
        Ok(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Ok(serde_json::Value::String(_)) | Ok(serde_json::Value::Null) => None,
        Ok(other) => Some(other.to_string()),
        Err(_) => Some(value.to_string()),
    }
}

// =============================================================================
// Selection Helpers
// =============================================================================

/// Picks the vendor whose name matches exactly (case-insensitive); the
/// server-side `name` filter is a partial match.
fn pick_vendor(vendors: Vec<Vendor>, name: &str) -> Option<Vendor> {
    vendors
        .into_iter()
        .find(|v| v.name.eq_ignore_ascii_case(name))
}

/// Picks a filament preferring an exact color match, falling back to the
/// first material match.
fn pick_filament(filaments: Vec<Filament>, color_hex: Option<&str>) -> Option<Filament> {
    if let Some(color) = color_hex {
        if let Some(exact) = filaments
            .iter()
            .find(|f| {
                f.color_hex
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(color))
            })
            .cloned()
        {
            return Some(exact);
        }
    }
    filaments.into_iter().next()
}

// =============================================================================
// Client Trait
// =============================================================================

/// Operations the sync engine needs from the Inventory.
#[async_trait]
pub trait InventoryApi: Send + Sync {
    /// Idempotently declares the extra fields the bridge writes.
    async fn ensure_extra_field_schema(&self) -> SyncResult<()>;

    /// Finds a vendor by name, creating it if absent.
    async fn find_or_create_vendor(&self, name: &str) -> SyncResult<Vendor>;

    /// Finds a filament matching the spec, creating it if absent.
    async fn find_or_create_filament(&self, spec: &FilamentSpec) -> SyncResult<Filament>;

    /// Creates a new spool.
    async fn create_spool(&self, new: &NewSpool) -> SyncResult<Spool>;

    /// Fetches one spool.
    async fn get_spool(&self, id: i64) -> SyncResult<Spool>;

    /// Lists every spool, archived included.
    async fn list_spools(&self) -> SyncResult<Vec<Spool>>;

    /// Atomically increments the used weight of a spool.
    async fn add_usage(&self, id: i64, grams: f64) -> SyncResult<Spool>;

    /// Applies a partial update to a spool.
    async fn update_spool(&self, id: i64, patch: &SpoolPatch) -> SyncResult<Spool>;

    /// Deletes a spool.
    async fn delete_spool(&self, id: i64) -> SyncResult<()>;
}

// =============================================================================
// Inventory Client
// =============================================================================

/// HTTP client for the Inventory REST API.
pub struct InventoryClient {
    http: reqwest::Client,
    base_url: String,
}

impl InventoryClient {
    /// Creates a client from the bridge configuration.
    pub fn new(config: &BridgeConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(InventoryClient {
            http,
            base_url: format!("{}/api/v1", config.inventory_base_url()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Converts a non-2xx response into [`SyncError::Inventory`], keeping
    /// the body for diagnostics.
    async fn check(resp: reqwest::Response, context: &str) -> SyncResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        error!(context, status = status.as_u16(), body = %body, "Inventory request failed");
        Err(SyncError::Inventory {
            status: status.as_u16(),
            body,
        })
    }

    async fn find_vendor(&self, name: &str) -> SyncResult<Option<Vendor>> {
        let resp = self
            .http
            .get(self.url("/vendor"))
            .query(&[("name", name)])
            .send()
            .await?;
        let resp = Self::check(resp, "find vendor").await?;
        let vendors: Vec<Vendor> = resp.json().await?;
        Ok(pick_vendor(vendors, name))
    }

    async fn create_vendor(&self, name: &str) -> SyncResult<Vendor> {
        let resp = self
            .http
            .post(self.url("/vendor"))
            .json(&json!({ "name": name }))
            .send()
            .await?;
        let resp = Self::check(resp, "create vendor").await?;
        let vendor: Vendor = resp.json().await?;
        info!(name = %vendor.name, id = vendor.id, "Created inventory vendor");
        Ok(vendor)
    }

    async fn find_filament(&self, spec: &FilamentSpec) -> SyncResult<Option<Filament>> {
        let resp = self
            .http
            .get(self.url("/filament"))
            .query(&[
                ("vendor.id", spec.vendor_id.to_string()),
                ("material", spec.material.clone()),
            ])
            .send()
            .await?;
        let resp = Self::check(resp, "find filament").await?;
        let filaments: Vec<Filament> = resp.json().await?;
        Ok(pick_filament(filaments, spec.color_hex.as_deref()))
    }

    async fn create_filament(&self, spec: &FilamentSpec) -> SyncResult<Filament> {
        let mut payload = json!({
            "name": spec.name,
            "vendor_id": spec.vendor_id,
            "material": spec.material,
            "density": spec.density,
            "diameter": spec.diameter,
        });
        if let Some(ref color) = spec.color_hex {
            payload["color_hex"] = json!(color);
        }
        if let Some(weight) = spec.weight {
            payload["weight"] = json!(weight);
        }
        if let Some(spool_weight) = spec.spool_weight {
            payload["spool_weight"] = json!(spool_weight);
        }

        let resp = self
            .http
            .post(self.url("/filament"))
            .json(&payload)
            .send()
            .await?;
        let resp = Self::check(resp, "create filament").await?;
        let filament: Filament = resp.json().await?;
        info!(
            material = %spec.material,
            name = %spec.name,
            id = filament.id,
            "Created inventory filament"
        );
        Ok(filament)
    }
}

#[async_trait]
impl InventoryApi for InventoryClient {
    async fn ensure_extra_field_schema(&self) -> SyncResult<()> {
        let mut last_err = SyncError::Unreachable("schema setup never ran".into());

        for attempt in 1..=SCHEMA_SETUP_ATTEMPTS {
            match self.try_declare_schema().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        attempt,
                        max = SCHEMA_SETUP_ATTEMPTS,
                        error = %e,
                        "Extra-field schema setup failed"
                    );
                    last_err = e;
                }
            }
            if attempt < SCHEMA_SETUP_ATTEMPTS {
                tokio::time::sleep(SCHEMA_SETUP_DELAY).await;
            }
        }
        Err(last_err)
    }

    async fn find_or_create_vendor(&self, name: &str) -> SyncResult<Vendor> {
        let name = if name.is_empty() { "Unknown" } else { name };
        if let Some(vendor) = self.find_vendor(name).await? {
            return Ok(vendor);
        }
        match self.create_vendor(name).await {
            Ok(vendor) => Ok(vendor),
            // Another writer may have created it between find and create;
            // a conflict means the find should now succeed.
            Err(SyncError::Inventory { status: 409, .. }) => self
                .find_vendor(name)
                .await?
                .ok_or_else(|| SyncError::Protocol(format!("vendor '{name}' conflicted but is absent"))),
            Err(e) => Err(e),
        }
    }

    async fn find_or_create_filament(&self, spec: &FilamentSpec) -> SyncResult<Filament> {
        if let Some(filament) = self.find_filament(spec).await? {
            return Ok(filament);
        }
        match self.create_filament(spec).await {
            Ok(filament) => Ok(filament),
            Err(SyncError::Inventory { status: 409, .. }) => {
                self.find_filament(spec).await?.ok_or_else(|| {
                    SyncError::Protocol(format!("filament '{}' conflicted but is absent", spec.name))
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn create_spool(&self, new: &NewSpool) -> SyncResult<Spool> {
        let mut payload = json!({ "filament_id": new.filament_id });
        if let Some(initial) = new.initial_weight {
            payload["initial_weight"] = json!(initial);
        }
        if let Some(spool_weight) = new.spool_weight {
            payload["spool_weight"] = json!(spool_weight);
        }
        if new.used_weight > 0.0 {
            payload["used_weight"] = json!(new.used_weight);
        }
        if !new.extra.is_empty() {
            payload["extra"] = json!(encode_extra(&new.extra));
        }

        let resp = self.http.post(self.url("/spool")).json(&payload).send().await?;
        let resp = Self::check(resp, "create spool").await?;
        let spool: Spool = resp.json().await?;
        info!(id = spool.id, filament_id = new.filament_id, "Created inventory spool");
        Ok(spool)
    }

    async fn get_spool(&self, id: i64) -> SyncResult<Spool> {
        let resp = self.http.get(self.url(&format!("/spool/{id}"))).send().await?;
        let resp = Self::check(resp, "get spool").await?;
        Ok(resp.json().await?)
    }

    async fn list_spools(&self) -> SyncResult<Vec<Spool>> {
        let resp = self
            .http
            .get(self.url("/spool"))
            .query(&[("allow_archived", "true")])
            .send()
            .await?;
        let resp = Self::check(resp, "list spools").await?;
        Ok(resp.json().await?)
    }

    async fn add_usage(&self, id: i64, grams: f64) -> SyncResult<Spool> {
        let resp = self
            .http
            .put(self.url(&format!("/spool/{id}/use")))
            .json(&json!({ "use_weight": grams }))
            .send()
            .await?;
        let resp = Self::check(resp, "add usage").await?;
        let spool: Spool = resp.json().await?;
        info!(
            id,
            grams = format!("{grams:.1}"),
            total_used = format!("{:.1}", spool.used_weight),
            "Reported usage to inventory"
        );
        Ok(spool)
    }

    async fn update_spool(&self, id: i64, patch: &SpoolPatch) -> SyncResult<Spool> {
        let mut patch = patch.clone();
        if let Some(ref extra) = patch.extra {
            patch.extra = Some(encode_extra(extra));
        }
        let resp = self
            .http
            .patch(self.url(&format!("/spool/{id}")))
            .json(&patch)
            .send()
            .await?;
        let resp = Self::check(resp, "update spool").await?;
        debug!(id, "Patched inventory spool");
        Ok(resp.json().await?)
    }

    async fn delete_spool(&self, id: i64) -> SyncResult<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/spool/{id}")))
            .send()
            .await?;
        Self::check(resp, "delete spool").await?;
        info!(id, "Deleted inventory spool");
        Ok(())
    }
}

impl InventoryClient {
    /// One schema-declaration pass: list existing fields, create missing.
    async fn try_declare_schema(&self) -> SyncResult<()> {
        let resp = self.http.get(self.url("/field/spool")).send().await?;
        let resp = Self::check(resp, "list extra fields").await?;
        let existing: Vec<ExtraFieldDef> = resp.json().await?;

        if existing.iter().any(|f| f.key == EXTRA_FIELD_TAG_ID) {
            debug!(key = EXTRA_FIELD_TAG_ID, "Extra field already declared");
            return Ok(());
        }

        let resp = self
            .http
            .post(self.url(&format!("/field/spool/{EXTRA_FIELD_TAG_ID}")))
            .json(&json!({
                "name": "Tag ID",
                "field_type": "text",
                "order": 100,
            }))
            .send()
            .await?;
        Self::check(resp, "declare extra field").await?;
        info!(key = EXTRA_FIELD_TAG_ID, "Declared inventory extra field");
        Ok(())
    }
}
