//! # Meridian Spatial
//!
//! Server-side interest management for a shared, arbitrarily large 3D world.
//! Each connected view is told only about the cells currently near it, and
//! is told promptly as that set changes.
//!
//! ## Features
//!
//! - **Space grid**: the world is cut into fixed-size spaces indexing live
//!   root cells
//! - **View caches**: per-avatar proximity tracking with reference-counted
//!   roots and hysteresis on movement
//! - **Subtree locking**: one reader/writer lock per connected subtree
//! - **Transactional delivery**: LOAD / UNLOAD / REVALIDATE deltas are
//!   handed to an executor, FIFO per view
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Universe                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Cell registry ── SpatialCell trees (one RootLock each)      │
//! │  SpaceManager  ── Space { live roots, subscribed caches }    │
//! │  Views         ── ViewCache per logged-in avatar             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CacheProcessor (tokio)                                      │
//! │  └── drains each ViewCache on the blocking pool              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TransactionExecutor ──▶ DeliveryTask ──▶ ClientCache        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meridian_spatial::prelude::*;
//!
//! # fn main() -> SpatialResult<()> {
//! let executor = Arc::new(LocalExecutor::new(4096));
//! let directory = Arc::new(MemoryDirectory::new());
//! directory.register(CacheRef::new(1), Arc::new(RecordingClientCache::new()));
//!
//! let universe = Universe::new(SpatialConfig::default(), executor.clone(), directory)?;
//! let tree = universe.create_spatial_cell(CellId::new(1), PersistentRef::new(1), CellKind::Standard)?;
//! universe.add_root_spatial_cell(tree.id(), &Identity::system())?;
//!
//! universe.create_spatial_cell(CellId::new(2), PersistentRef::new(2), CellKind::View)?;
//! universe.view_login(CellId::new(2), CacheRef::new(1), Identity::new("alice"))?;
//!
//! universe.process_pending_updates();
//! executor.run_pending();
//! # Ok(())
//! # }
//! ```

pub mod cell;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod listener;
pub mod math;
pub mod processor;
pub mod space;
pub mod types;
pub mod universe;
pub mod update;
pub mod view_cache;

#[cfg(test)]
mod testing;

// Re-exports
pub use cell::SpatialCell;
pub use client::{CacheDirectory, ClientCache, MemoryDirectory, RecordedDelta, RecordingClientCache};
pub use config::{DeltaOrdering, ExecutorConfig, GridConfig, ProcessorConfig, SpatialConfig, ViewConfig};
pub use error::{SpatialError, SpatialResult};
pub use executor::{
    ExecutorStats, FnTask, LocalExecutor, QueueOwner, TransactionExecutor, TransactionalTask,
};
pub use listener::{TransformChangeListener, ViewUpdateListener};
pub use math::{Bounds, CellTransform};
pub use processor::{CacheProcessor, ProcessorState};
pub use space::{Space, SpaceId, SpaceManager};
pub use types::{CacheRef, CellId, CellKind, Identity, PersistentRef};
pub use universe::Universe;
pub use update::{CacheUpdate, CellDescription, Delta, DeltaKind, UpdateKind};
pub use view_cache::{CacheStats, ViewCache};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{ClientCache, MemoryDirectory, RecordingClientCache};
    pub use crate::config::SpatialConfig;
    pub use crate::error::{SpatialError, SpatialResult};
    pub use crate::executor::{LocalExecutor, TransactionExecutor};
    pub use crate::math::{Bounds, CellTransform};
    pub use crate::types::{CacheRef, CellId, CellKind, Identity, PersistentRef};
    pub use crate::universe::Universe;
}
