//! # AquaPin Engine
//!
//! Offline-first sync and cache consistency for the AquaPin field app.
//!
//! Pond operators record stockings, harvests and mortality in places with
//! patchy connectivity. This crate keeps every screen readable offline, queues
//! writes that cannot reach the server, replays them in order once the
//! network is back, and keeps derived per-pond figures consistent across every
//! cache that holds them.
//!
//! ## Design Principles
//!
//! - **No direct IO**: storage, network and connectivity are traits
//!   ([`KeyValueStore`], [`Remote`], [`Connectivity`]); adapters live in the
//!   client crate
//! - **Offline is normal**: fetch failures and offline state are return
//!   values, never errors
//! - **Ordered replay**: the queue drains strictly in enqueue order
//!
//! ## Core Concepts
//!
//! ### Cache-aside reads
//!
//! [`CacheAside`] is the one place that picks between network and cache:
//! network first when online with write-through, cached copy otherwise.
//!
//! ### Mutation queue
//!
//! [`MutationQueue`] persists writes made offline. Records created offline
//! get a negative placeholder id from [`TempIds`]; later writes may
//! reference it.
//!
//! ### Sync
//!
//! [`SyncEngine`] replays the queue, rewriting placeholder ids to the ids the
//! server assigns during the same pass, and keeps only what failed. Cached
//! records created offline are then renamed to their server ids.
//!
//! ### Aggregates
//!
//! [`AggregateReconciler`] recomputes `total_fish`, `current_fish_type` and
//! `last_stocked_at` for a pond and writes them to every cache holding it.
//!
//! ## Quick Start
//!
//! ```rust
//! use aquapin_engine::{
//!     Engine, ManualConnectivity, MemoryStore, NewStocking, SyncConfig,
//! };
//! # use aquapin_engine::{Remote, RemoteError, Request};
//! # use serde_json::{json, Value};
//! # use std::sync::Arc;
//! # struct Backend;
//! # #[async_trait::async_trait]
//! # impl Remote for Backend {
//! #     async fn execute(&self, _: &Request) -> Result<Value, RemoteError> {
//! #         Ok(json!({"id": 41}))
//! #     }
//! # }
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let connectivity = ManualConnectivity::new_shared(false);
//! let engine = Engine::new(
//!     MemoryStore::new_shared(),
//!     connectivity.clone(),
//!     Arc::new(Backend),
//!     SyncConfig::default(),
//! );
//!
//! // Offline: the stocking is queued with a placeholder id
//! let outcome = engine
//!     .actions()
//!     .record_stocking(NewStocking {
//!         pond_id: 1,
//!         stocking_date: "2024-06-01".into(),
//!         fry_type: "Tilapia".into(),
//!         fry_quantity: 500,
//!     })
//!     .await
//!     .unwrap();
//! assert!(outcome.is_queued());
//!
//! // Back online: replay the queue
//! connectivity.set_online(true);
//! let report = engine.sync().await.unwrap();
//! assert_eq!(report.message, "Synced 1 items, 0 failed");
//! # });
//! ```

pub mod actions;
pub mod aggregate;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod identity;
pub mod invalidate;
pub mod keys;
pub mod paging;
pub mod queue;
pub mod remap;
pub mod remote;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_support;

// Re-export main types at crate root
pub use actions::{
    ActionError, ActionOutcome, FieldActions, NewHarvest, NewMortality, NewPond, NewStocking,
    QueueReason,
};
pub use aggregate::{AggregateReconciler, AggregateSource, PondAggregate, StockBatch};
pub use connectivity::{Connectivity, ManualConnectivity};
pub use engine::Engine;
pub use error::{Error, Result};
pub use fetcher::{CacheAside, FetchOptions, Fetched, Origin};
pub use identity::{ClientIdentity, CLIENT_ID_HEADER};
pub use invalidate::invalidate;
pub use paging::{Page, PagedCache};
pub use queue::{MutationQueue, QueueId, QueuedOperation, TempIds};
pub use remap::apply_resolved_ids;
pub use remote::{Method, Remote, RemoteError, Request};
pub use store::{JsonStore, KeyValueStore, MemoryStore};
pub use sync::{
    Geocoder, IdentifierMap, LocationEnricher, PayloadEnricher, SyncConfig, SyncEngine,
    SyncReport,
};
