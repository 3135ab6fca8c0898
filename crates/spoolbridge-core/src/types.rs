//! # Domain Types
//!
//! Core domain types shared by the codec, the clients, and the sync engine.
//!
//! ## Identity Model
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Spool Identity                                   │
//! │                                                                         │
//! │  tag_id           - NFC tag identifier. The ONLY stable identity:      │
//! │                     survives Device restarts and catalog rewrites.     │
//! │                     All mapping and event matching keys off this.      │
//! │                                                                         │
//! │  device_spool_id  - Device-local numeric id. Reused after deletion;    │
//! │                     carried for diagnostics only, never for identity.  │
//! │                                                                         │
//! │  A tag value starting with '-' has been invalidated on the Device      │
//! │  (the physical tag moved to another spool) and is excluded from        │
//! │  reconciliation.                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

// =============================================================================
// Device Record
// =============================================================================

/// One spool as reported by the Device catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// NFC tag identifier (printable ASCII). The stable cross-system key.
    pub tag_id: String,

    /// Material name, e.g. "PLA", "PETG".
    pub material: String,

    /// Manufacturer brand, free text. May be empty.
    pub brand: String,

    /// Color name, free text.
    pub color_name: String,

    /// 6-hex RGB color code, if the Device knows one.
    pub color_hex: Option<String>,

    /// Grams of filament on a full spool.
    pub nominal_weight_g: f64,

    /// Grams of the empty core/spool.
    pub empty_weight_g: f64,

    /// Grams of filament currently remaining.
    pub remaining_g: f64,

    /// Device-local numeric spool id. Ephemeral, see module docs.
    pub device_spool_id: u32,
}

impl DeviceRecord {
    /// Returns true if this record carries a usable stable identity.
    ///
    /// A tag is usable when it is non-empty, printable ASCII, and not
    /// invalidated (leading `-` marks a tag the Device has reassigned).
    pub fn has_stable_tag(&self) -> bool {
        !self.tag_id.is_empty()
            && !self.tag_id.starts_with('-')
            && self
                .tag_id
                .bytes()
                .all(|b| (0x21..=0x7e).contains(&b))
    }

    /// Remaining weight clamped into the valid range `[0, nominal]`.
    ///
    /// The Device occasionally reports a few grams above nominal (wet
    /// filament, scale drift); downstream math treats nominal as the cap.
    pub fn effective_remaining_g(&self) -> f64 {
        self.remaining_g.clamp(0.0, self.nominal_weight_g)
    }

    /// Grams already consumed relative to a full spool.
    pub fn initial_used_g(&self) -> f64 {
        (self.nominal_weight_g - self.effective_remaining_g()).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tag: &str) -> DeviceRecord {
        DeviceRecord {
            tag_id: tag.to_string(),
            material: "PLA".to_string(),
            brand: "Bambu".to_string(),
            color_name: "Red".to_string(),
            color_hex: Some("FF0000".to_string()),
            nominal_weight_g: 1000.0,
            empty_weight_g: 250.0,
            remaining_g: 800.0,
            device_spool_id: 3,
        }
    }

    #[test]
    fn test_stable_tag() {
        assert!(record("04A3B2C1D5E6F7").has_stable_tag());
        assert!(!record("").has_stable_tag());
        assert!(!record("-04A3B2C1D5E6F7").has_stable_tag());
        assert!(!record("tag with space").has_stable_tag());
        assert!(!record("täg").has_stable_tag());
    }

    #[test]
    fn test_effective_remaining_clamps() {
        let mut r = record("A1");
        assert_eq!(r.effective_remaining_g(), 800.0);

        r.remaining_g = 1015.0;
        assert_eq!(r.effective_remaining_g(), 1000.0);
        assert_eq!(r.initial_used_g(), 0.0);

        r.remaining_g = -3.0;
        assert_eq!(r.effective_remaining_g(), 0.0);
        assert_eq!(r.initial_used_g(), 1000.0);
    }
}
