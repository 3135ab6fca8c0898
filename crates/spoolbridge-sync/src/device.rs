//! # Device Client
//!
//! Typed operations against the Device's encrypted REST API.
//!
//! ## Request Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Device Request Pipeline                            │
//! │                                                                         │
//! │  request body ──► DeviceCipher.encrypt ──► HTTP (application/text)     │
//! │                                                                         │
//! │  HTTP response ──► DeviceCipher.decrypt ──► RecordReader ──► records   │
//! │                                                                         │
//! │  ERROR MAPPING                                                          │
//! │  ─────────────                                                          │
//! │  transport failure              → Unreachable (retry with backoff)      │
//! │  tag mismatch on decrypt        → Auth        (key is wrong)            │
//! │  undecodable catalog document   → Protocol    (skip this poll)          │
//! │  single malformed record        → logged and skipped, batch continues   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Endpoint paths are fixed by the Device firmware.

use async_trait::async_trait;
use tracing::{debug, warn};

use spoolbridge_core::{DeviceCipher, DeviceRecord, RecordReader};

use crate::config::BridgeConfig;
use crate::error::{SyncError, SyncResult};

/// Plaintext probe used by key validation. The Device only needs to
/// authenticate the envelope; the content is ignored.
const KEY_PROBE: &str = r#"{"test":"hello"}"#;

/// Content type the Device expects for encrypted bodies.
const BODY_CONTENT_TYPE: &str = "application/text";

// =============================================================================
// Client Trait
// =============================================================================

/// Operations the sync engine needs from the Device.
///
/// The trait exists so the engine can run against an in-memory fake in
/// tests; production code uses [`DeviceClient`].
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Fail-fast check that the configured security key matches the Device.
    async fn validate_key(&self) -> SyncResult<()>;

    /// Fetches and decrypts the full spool catalog.
    ///
    /// Malformed individual records are logged and dropped; the rest of the
    /// batch is returned.
    async fn list_spools(&self) -> SyncResult<Vec<DeviceRecord>>;

    /// Fetches a single spool by tag, for diagnostics.
    async fn get_spool(&self, tag_id: &str) -> SyncResult<Option<DeviceRecord>>;
}

// =============================================================================
// Device Client
// =============================================================================

/// HTTP client for the Device, wrapping the transport cipher and the
/// catalog codec.
pub struct DeviceClient {
    http: reqwest::Client,
    base_url: String,
    cipher: DeviceCipher,
}

impl DeviceClient {
    /// Creates a client from the bridge configuration.
    pub fn new(config: &BridgeConfig) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(DeviceClient {
            http,
            base_url: config.device_base_url(),
            cipher: DeviceCipher::new(&config.device.security_key),
        })
    }

    /// Decrypts a catalog response body and parses its records.
    ///
    /// Split out of [`DeviceApi::list_spools`] so the decode path is
    /// testable without a live Device.
    fn decode_catalog(&self, encrypted_body: &str) -> SyncResult<Vec<DeviceRecord>> {
        let plaintext = self.cipher.decrypt(encrypted_body)?;
        let reader = RecordReader::new(&plaintext)?;

        let mut records = Vec::new();
        for item in reader {
            match item {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping malformed catalog record"),
            }
        }
        Ok(records)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl DeviceApi for DeviceClient {
    async fn validate_key(&self) -> SyncResult<()> {
        let body = self.cipher.encrypt(KEY_PROBE)?;
        let resp = self
            .http
            .post(self.url("/api/test-key"))
            .header(reqwest::header::CONTENT_TYPE, BODY_CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| SyncError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Auth(format!(
                "device rejected key probe with HTTP {status}"
            )));
        }

        // The reply is encrypted with the same key; decrypting it proves
        // the round trip end to end.
        let encrypted = resp.text().await?;
        self.cipher.decrypt(&encrypted)?;
        debug!("Device key validation succeeded");
        Ok(())
    }

    async fn list_spools(&self) -> SyncResult<Vec<DeviceRecord>> {
        let resp = self
            .http
            .get(self.url("/api/spools"))
            .send()
            .await
            .map_err(|e| SyncError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Unreachable(format!(
                "device catalog fetch returned HTTP {status}"
            )));
        }

        let encrypted = resp.text().await?;
        let records = self.decode_catalog(&encrypted)?;
        debug!(count = records.len(), "Fetched device catalog");
        Ok(records)
    }

    async fn get_spool(&self, tag_id: &str) -> SyncResult<Option<DeviceRecord>> {
        let resp = self
            .http
            .get(self.url(&format!("/api/spools/{tag_id}")))
            .send()
            .await
            .map_err(|e| SyncError::Unreachable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Unreachable(format!(
                "device spool fetch returned HTTP {status}"
            )));
        }

        let encrypted = resp.text().await?;
        Ok(self.decode_catalog(&encrypted)?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use spoolbridge_core::write_catalog;

    fn test_client() -> DeviceClient {
        let mut config = BridgeConfig::default();
        config.device.host = "device.test".to_string();
        config.device.security_key = "abc1234".to_string();
        DeviceClient::new(&config).unwrap()
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
            remaining_g: 800.0,
            device_spool_id: 3,
        }
    }

    #[test]
    fn test_decode_catalog_round_trip() {
        let client = test_client();
        let records = vec![record("A1"), record("B2")];
        let encrypted = client.cipher.encrypt(&write_catalog(&records)).unwrap();

        assert_eq!(client.decode_catalog(&encrypted).unwrap(), records);
    }

    #[test]
    fn test_decode_catalog_skips_bad_records() {
        let client = test_client();
        let mut doc = write_catalog(&[record("A1")]);
        doc.push_str("B2,PLA,Bambu,Red,FF0000,bogus,250,800,4\n");
        let encrypted = client.cipher.encrypt(&doc).unwrap();

        let records = client.decode_catalog(&encrypted).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tag_id, "A1");
    }

    #[test]
    fn test_decode_catalog_wrong_key_is_auth_error() {
        let sender = test_client();
        let encrypted = sender.cipher.encrypt("anything").unwrap();

        let mut config = BridgeConfig::default();
        config.device.host = "device.test".to_string();
        config.device.security_key = "zzz9999".to_string();
        let receiver = DeviceClient::new(&config).unwrap();

        assert!(matches!(
            receiver.decode_catalog(&encrypted),
            Err(SyncError::Auth(_))
        ));
    }
}
