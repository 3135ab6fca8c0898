//! # spoolbridge-sync: Synchronization Engine for the Spool Bridge
//!
//! This crate keeps an NFC spool tracker ("Device") and a filament
//! inventory service ("Inventory") convergent: new Device spools appear in
//! the Inventory, consumption deltas are propagated, metadata stays
//! coherent, and Inventory-side deletions heal themselves on the next
//! poll.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Bridge Architecture                              │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                    BridgeAgent (Supervisor)                      │  │
//! │  │                                                                  │  │
//! │  │  Startup validation · recovery · loop lifecycle · shutdown       │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │     Poller     │  │   Event Loop   │  │    EventListener       │    │
//! │  │                │  │                │  │                        │    │
//! │  │ full sync per  │  │ applies feed   │  │ WebSocket with         │    │
//! │  │ interval, on-  │  │ events, asks   │  │ auto-reconnect &       │    │
//! │  │ demand sweeps  │  │ for sweeps on  │  │ backoff                │    │
//! │  │                │  │ reconnect      │  │                        │    │
//! │  └───────┬────────┘  └───────┬────────┘  └────────────────────────┘    │
//! │          │                   │                                          │
//! │          ▼                   ▼                                          │
//! │  ┌──────────────────────────────────┐   ┌──────────────────────────┐   │
//! │  │          SyncEngine              │──►│      MappingStore        │   │
//! │  │  delta detection · per-tag locks │   │  tag_id → spool id +     │   │
//! │  │  bounded fan-out · isolation     │   │  baseline; atomic saves  │   │
//! │  └───────┬─────────────────┬────────┘   └──────────────────────────┘   │
//! │          ▼                 ▼                                            │
//! │  ┌──────────────┐   ┌──────────────┐                                   │
//! │  │ DeviceClient │   │ Inventory    │                                   │
//! │  │ encrypted    │   │ Client       │                                   │
//! │  │ REST + codec │   │ REST (v1)    │                                   │
//! │  └──────────────┘   └──────────────┘                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - `BridgeAgent` supervisor
//! - [`config`] - Bridge configuration (TOML file + env overrides)
//! - [`device`] - Encrypted Device REST client
//! - [`engine`] - Reconciliation core and the two loops
//! - [`error`] - Error taxonomy with retry classification
//! - [`events`] - Inventory WebSocket listener with reconnect
//! - [`inventory`] - Inventory REST client
//! - [`mapping`] - Durable tag → spool mapping store
//!
//! ## Usage
//!
//! ```rust,ignore
//! use spoolbridge_sync::{BridgeAgent, BridgeConfig};
//!
//! let config = BridgeConfig::load(None)?;
//! let mut agent = BridgeAgent::new(config)?;
//! agent.start().await?;
//! // ... wait for a shutdown signal ...
//! agent.shutdown().await;
//! ```

pub mod agent;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod inventory;
pub mod mapping;

pub use agent::BridgeAgent;
pub use config::{BridgeConfig, DeviceScheme};
pub use device::{DeviceApi, DeviceClient};
pub use engine::{SyncEngine, SyncReport};
pub use error::{SyncError, SyncResult};
pub use events::{EventListener, EventListenerHandle, ListenerSignal, SpoolEvent};
pub use inventory::{InventoryApi, InventoryClient};
pub use mapping::{MappingEntry, MappingStore};
