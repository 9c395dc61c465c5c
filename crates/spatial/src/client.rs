//! # Client Cache Boundary
//!
//! Each logged-in view reports to a durable client-side cache object,
//! named by a [`CacheRef`]. Deltas reach it inside transactional tasks:
//! the task resolves the reference through a [`CacheDirectory`] at run
//! time and hands over the batch.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::error::{SpatialError, SpatialResult};
use crate::executor::TransactionalTask;
use crate::types::{CacheRef, CellId};
use crate::update::{CellDescription, Delta, DeltaKind};

/// Receiver of a view's deltas.
pub trait ClientCache: Send + Sync {
    /// Materialize these cells on the client. Receivers apply their own
    /// access checks.
    fn generate_load_messages(&self, view: CellId, cells: &[CellDescription]) -> SpatialResult<()>;

    /// Re-sync these cells without a structural change
    fn revalidate_cells(&self, view: CellId, cells: &[CellDescription]) -> SpatialResult<()>;

    /// Drop these cells on the client, unconditionally
    fn send_unload_messages(&self, view: CellId, cells: &[CellDescription]) -> SpatialResult<()>;
}

/// Lookup of client caches by durable reference.
pub trait CacheDirectory: Send + Sync {
    fn resolve(&self, cache: CacheRef) -> Option<Arc<dyn ClientCache>>;
}

/// In-memory [`CacheDirectory`]
#[derive(Default)]
pub struct MemoryDirectory {
    caches: DashMap<CacheRef, Arc<dyn ClientCache>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cache_ref: CacheRef, cache: Arc<dyn ClientCache>) {
        self.caches.insert(cache_ref, cache);
    }

    pub fn unregister(&self, cache_ref: CacheRef) -> bool {
        self.caches.remove(&cache_ref).is_some()
    }

    pub fn len(&self) -> usize {
        self.caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }
}

impl CacheDirectory for MemoryDirectory {
    fn resolve(&self, cache: CacheRef) -> Option<Arc<dyn ClientCache>> {
        self.caches.get(&cache).map(|entry| Arc::clone(entry.value()))
    }
}

/// Delivers one delta to its client cache.
pub(crate) struct DeliveryTask {
    pub(crate) cache_ref: CacheRef,
    pub(crate) directory: Arc<dyn CacheDirectory>,
    pub(crate) delta: Delta,
}

impl TransactionalTask for DeliveryTask {
    fn name(&self) -> &str {
        match self.delta.kind {
            DeltaKind::Load => "load-delta",
            DeltaKind::Unload => "unload-delta",
            DeltaKind::Revalidate => "revalidate-delta",
        }
    }

    fn run(self: Box<Self>) -> SpatialResult<()> {
        let cache = self
            .directory
            .resolve(self.cache_ref)
            .ok_or(SpatialError::UnknownCache(self.cache_ref))?;

        debug!(
            view = %self.delta.view,
            cache = %self.cache_ref,
            kind = %self.delta.kind,
            cells = self.delta.len(),
            "Delivering delta"
        );

        let delta = &self.delta;
        match delta.kind {
            DeltaKind::Load => cache.generate_load_messages(delta.view, &delta.cells),
            DeltaKind::Unload => cache.send_unload_messages(delta.view, &delta.cells),
            DeltaKind::Revalidate => cache.revalidate_cells(delta.view, &delta.cells),
        }
    }
}

// ============================================================================
// Recording Cache
// ============================================================================

/// One delta as seen by a [`RecordingClientCache`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelta {
    pub kind: DeltaKind,
    pub view: CellId,
    pub cells: Vec<CellId>,
    /// Parent of each cell, in the same order
    pub parents: Vec<Option<CellId>>,
}

/// Client cache that remembers every delta it receives.
#[derive(Default)]
pub struct RecordingClientCache {
    deltas: Mutex<Vec<RecordedDelta>>,
}

impl RecordingClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, kind: DeltaKind, view: CellId, cells: &[CellDescription]) {
        self.deltas.lock().push(RecordedDelta {
            kind,
            view,
            cells: cells.iter().map(|c| c.cell_id).collect(),
            parents: cells.iter().map(|c| c.parent_id).collect(),
        });
    }

    pub fn deltas(&self) -> Vec<RecordedDelta> {
        self.deltas.lock().clone()
    }

    pub fn deltas_of(&self, kind: DeltaKind) -> Vec<RecordedDelta> {
        self.deltas
            .lock()
            .iter()
            .filter(|delta| delta.kind == kind)
            .cloned()
            .collect()
    }

    /// How many deltas of `kind` mention `cell`
    pub fn count(&self, kind: DeltaKind, cell: CellId) -> usize {
        self.deltas
            .lock()
            .iter()
            .filter(|delta| delta.kind == kind && delta.cells.contains(&cell))
            .count()
    }

    pub fn clear(&self) {
        self.deltas.lock().clear();
    }
}

impl ClientCache for RecordingClientCache {
    fn generate_load_messages(&self, view: CellId, cells: &[CellDescription]) -> SpatialResult<()> {
        self.record(DeltaKind::Load, view, cells);
        Ok(())
    }

    fn revalidate_cells(&self, view: CellId, cells: &[CellDescription]) -> SpatialResult<()> {
        self.record(DeltaKind::Revalidate, view, cells);
        Ok(())
    }

    fn send_unload_messages(&self, view: CellId, cells: &[CellDescription]) -> SpatialResult<()> {
        self.record(DeltaKind::Unload, view, cells);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{Bounds, CellTransform};
    use crate::update::UpdateKind;

    fn description(id: u64, parent: Option<u64>) -> CellDescription {
        CellDescription {
            cell_id: CellId::new(id),
            class_name: "Cell",
            world_bounds: Bounds::default(),
            parent_id: parent.map(CellId::new),
            local_transform: CellTransform::IDENTITY,
            name: None,
        }
    }

    fn delta(kind: DeltaKind) -> Delta {
        Delta {
            kind,
            view: CellId::new(100),
            cause: UpdateKind::EnterSpace,
            cells: vec![description(1, None), description(2, Some(1))],
        }
    }

    #[test]
    fn test_delivery_routes_by_kind() {
        let directory = Arc::new(MemoryDirectory::new());
        let cache = Arc::new(RecordingClientCache::new());
        directory.register(CacheRef::new(9), cache.clone());

        for kind in [DeltaKind::Load, DeltaKind::Revalidate, DeltaKind::Unload] {
            let task = Box::new(DeliveryTask {
                cache_ref: CacheRef::new(9),
                directory: directory.clone(),
                delta: delta(kind),
            });
            task.run().unwrap();
        }

        let kinds: Vec<_> = cache.deltas().iter().map(|d| d.kind).collect();
        assert_eq!(kinds, vec![DeltaKind::Load, DeltaKind::Revalidate, DeltaKind::Unload]);
        assert_eq!(cache.deltas()[0].parents, vec![None, Some(CellId::new(1))]);
    }

    #[test]
    fn test_unknown_cache() {
        let directory: Arc<dyn CacheDirectory> = Arc::new(MemoryDirectory::new());
        let task = Box::new(DeliveryTask {
            cache_ref: CacheRef::new(1),
            directory,
            delta: delta(DeltaKind::Load),
        });

        let err = task.run().unwrap_err();
        assert!(matches!(err, SpatialError::UnknownCache(_)));
    }
}
