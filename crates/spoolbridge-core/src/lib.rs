//! # spoolbridge-core: Pure Protocol Logic for the Spool Bridge
//!
//! The I/O-free half of the bridge: the Device transport cipher, the
//! catalog record codec, and the domain types both sides share.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Spool Bridge Architecture                         │
//! │                                                                         │
//! │   Device (NFC tracker) ◄──encrypted REST──┐                            │
//! │                                           │                             │
//! │  ┌────────────────────────────────────────▼──────────────────────────┐ │
//! │  │                  spoolbridge-sync (I/O layer)                     │ │
//! │  │   DeviceClient · InventoryClient · EventListener · SyncEngine     │ │
//! │  └────────────────────────────────────────┬──────────────────────────┘ │
//! │                                           │                             │
//! │  ┌────────────────────────────────────────▼──────────────────────────┐ │
//! │  │              ★ spoolbridge-core (THIS CRATE) ★                    │ │
//! │  │                                                                   │ │
//! │  │   ┌───────────┐   ┌───────────┐   ┌───────────┐                  │ │
//! │  │   │  cipher   │   │  record   │   │   types   │                  │ │
//! │  │   │ AES-GCM + │   │  catalog  │   │  Device   │                  │ │
//! │  │   │  PBKDF2   │   │   codec   │   │  Record   │                  │ │
//! │  │   └───────────┘   └───────────┘   └───────────┘                  │ │
//! │  │                                                                   │ │
//! │  │   NO I/O • NO ASYNC • DETERMINISTIC • TYPED ERRORS               │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`cipher`] - AES-256-GCM envelope crypto with PBKDF2 key derivation
//! - [`record`] - Delimited catalog codec (escape-aware, header-mapped)
//! - [`types`] - Domain types ([`DeviceRecord`])
//! - [`error`] - Typed errors for the above

pub mod cipher;
pub mod error;
pub mod record;
pub mod types;

pub use cipher::DeviceCipher;
pub use error::{CipherError, CodecError, RecordParseError};
pub use record::{write_catalog, RecordReader};
pub use types::DeviceRecord;
