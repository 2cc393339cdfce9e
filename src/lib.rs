//! Rust library for synchronizing Harvia sauna heater state with the
//! MyHarvia cloud
//!
//! This library keeps a local, always-consistent picture of every sauna
//! device on an account and pushes state changes back to the cloud. It
//! supports:
//!
//! - Cloud authentication with transparent token renewal
//! - A persistent push channel with automatic reconnection
//! - Periodic full-state polling as a staleness bound
//! - Timestamp-ordered reconciliation of push deltas and poll snapshots
//! - Optimistic command dispatch with confirmation and rollback
//! - Per-device and account-wide state change subscriptions
//!
//! # Quick Start
//!
//! ```no_run
//! use harvia_sauna::{AttributeValue, EngineConfig, SaunaEngine, attr};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine =
//!         SaunaEngine::connect(EngineConfig::default(), "me@example.com", "secret").await?;
//!
//!     for device_id in engine.devices() {
//!         let state = engine.current_state(&device_id).unwrap();
//!         println!("{}: {}", device_id, state.display_name);
//!
//!         // Heat the sauna to 75 degrees
//!         engine
//!             .submit(&device_id, attr::TARGET_TEMP, AttributeValue::Int(75))
//!             .await?;
//!
//!         // Watch it warm up
//!         let mut updates = engine.subscribe(&device_id);
//!         while let Ok(change) = updates.recv().await {
//!             if change.attributes.iter().any(|a| a == attr::TEMPERATURE) {
//!                 let state = engine.current_state(&device_id).unwrap();
//!                 println!("temperature: {:?}", state.value(attr::TEMPERATURE));
//!                 break;
//!             }
//!         }
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The library is organized into several layers:
//!
//! - **Engine**: Top-level handle wiring everything together
//! - **Auth**: Session lifecycle and single-flight token renewal
//! - **Push**: Persistent websocket subscription for state deltas
//! - **Poll**: Scheduled full-state fetches per device
//! - **Reconciler**: Timestamp-ordered merge of all update sources
//! - **Command**: Validated writes with optimistic local updates
//! - **Hub**: Change notification fan-out to subscribers

mod api;
mod auth;
mod command;
mod config;
mod engine;
mod error;
mod hub;
mod poll;
mod protocol;
mod push;
mod reconciler;
mod types;

// Public exports
pub use api::{CloudApiClient, DeviceGateway, StateSnapshot};
pub use auth::{CredentialManager, Session, TokenEndpoint};
pub use command::CommandId;
pub use config::{EngineConfig, DEFAULT_BASE_URL};
pub use engine::SaunaEngine;
pub use error::{HarviaError, Result};
pub use hub::{StateChange, StateReceiver, SubscriptionHub};
pub use push::ConnectionState;
pub use reconciler::StateEvent;
pub use types::{
    attr, writable_descriptor, AttributeDescriptor, AttributeKind, AttributeRecord,
    AttributeValue, DeviceId, DeviceInfo, DeviceState, UpdateSource, WRITABLE_ATTRIBUTES,
};
