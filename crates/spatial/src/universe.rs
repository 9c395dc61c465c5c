//! # Universe
//!
//! Registry of every spatial cell on a node, owner of the space grid and of
//! the logged-in view caches, and the single place where work crosses into
//! the transactional executor.
//!
//! ## Table of Contents
//! - **Cells**: create, promote/demote roots, attach/detach, remove
//! - **Geometry**: local transform and bounds, locked world accessors
//! - **Views**: login, logout, revalidate
//! - **Transactions**: scheduled, queued, queue deletion
//! - **Listeners**: transform-change and view-update
//! - **Lifecycle**: start, drain, shutdown

use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cell::{SpatialCell, SubtreeWrite};
use crate::client::CacheDirectory;
use crate::config::SpatialConfig;
use crate::error::{SpatialError, SpatialResult};
use crate::executor::{QueueOwner, TransactionExecutor, TransactionalTask};
use crate::listener::{TransformChangeListener, TransformNotice, ViewUpdateListener};
use crate::math::{Bounds, CellTransform};
use crate::processor::CacheProcessor;
use crate::space::{SpaceId, SpaceManager};
use crate::types::{CacheRef, CellId, CellKind, Identity, PersistentRef};
use crate::view_cache::ViewCache;

/// State shared between the universe and its view caches
pub(crate) struct UniverseShared {
    pub(crate) config: SpatialConfig,
    pub(crate) spaces: SpaceManager,
    pub(crate) executor: Arc<dyn TransactionExecutor>,
    pub(crate) directory: Arc<dyn CacheDirectory>,
    update_seq: AtomicU64,
}

impl UniverseShared {
    pub(crate) fn next_update_seq(&self) -> u64 {
        self.update_seq.fetch_add(1, Ordering::Relaxed)
    }
}

/// The spatial world of one node.
pub struct Universe {
    shared: Arc<UniverseShared>,
    cells: RwLock<HashMap<CellId, Arc<SpatialCell>>>,
    views: Arc<DashMap<CellId, Arc<ViewCache>>>,
    processor: CacheProcessor,
}

impl Universe {
    /// Build a universe. Fails on an invalid configuration.
    pub fn new(
        config: SpatialConfig,
        executor: Arc<dyn TransactionExecutor>,
        directory: Arc<dyn CacheDirectory>,
    ) -> SpatialResult<Self> {
        config.validate()?;

        let views = Arc::new(DashMap::new());
        let processor = CacheProcessor::new(Arc::clone(&views), config.processor.interval());
        let shared = Arc::new(UniverseShared {
            spaces: SpaceManager::new(config.grid.space_size, config.grid.max_spaces_per_lookup),
            config,
            executor,
            directory,
            update_seq: AtomicU64::new(0),
        });

        info!(
            space_size = shared.config.grid.space_size,
            proximity_radius = shared.config.view.proximity_radius,
            ordering = ?shared.config.processor.ordering,
            "Universe initialized"
        );

        Ok(Self {
            shared,
            cells: RwLock::new(HashMap::new()),
            views,
            processor,
        })
    }

    pub fn config(&self) -> &SpatialConfig {
        &self.shared.config
    }

    pub fn space_manager(&self) -> &SpaceManager {
        &self.shared.spaces
    }

    pub fn processor(&self) -> &CacheProcessor {
        &self.processor
    }

    fn cell(&self, id: CellId) -> SpatialResult<Arc<SpatialCell>> {
        self.cells
            .read()
            .get(&id)
            .cloned()
            .ok_or(SpatialError::UnknownCell(id))
    }

    pub fn get_cell(&self, id: CellId) -> Option<Arc<SpatialCell>> {
        self.cells.read().get(&id).cloned()
    }

    pub fn cell_count(&self) -> usize {
        self.cells.read().len()
    }

    // ========================================================================
    // Cells
    // ========================================================================

    /// Register a new, detached cell.
    pub fn create_spatial_cell(
        &self,
        id: CellId,
        persistent_ref: PersistentRef,
        kind: CellKind,
    ) -> SpatialResult<Arc<SpatialCell>> {
        match self.cells.write().entry(id) {
            Entry::Occupied(_) => Err(SpatialError::DuplicateCell(id)),
            Entry::Vacant(entry) => {
                let cell = SpatialCell::new(id, persistent_ref, kind);
                entry.insert(Arc::clone(&cell));
                debug!(cell_id = %id, kind = ?kind, "Created spatial cell");
                Ok(cell)
            }
        }
    }

    /// Promote a cell to a live root and index it into the spaces it
    /// overlaps. Subscribed caches hear about it through those spaces.
    pub fn add_root_spatial_cell(&self, id: CellId, identity: &Identity) -> SpatialResult<()> {
        let cell = self.cell(id)?;
        let guard = cell.lock_write();

        if let Some(parent) = cell.parent_id() {
            return Err(SpatialError::hierarchy(format!(
                "{id} is a child of {parent} and cannot be a root"
            )));
        }
        if guard.is_live() {
            debug!(cell_id = %id, "Cell is already a root");
            return Ok(());
        }

        guard.set_live(true);
        self.reindex(&cell, &guard);
        info!(cell_id = %id, %identity, spaces = guard.indexed_spaces().len(), "Added root cell");
        Ok(())
    }

    /// Demote a live root, removing it from every space it was indexed in.
    pub fn remove_root_spatial_cell(&self, id: CellId, identity: &Identity) -> SpatialResult<()> {
        let cell = self.cell(id)?;
        let guard = cell.lock_write();

        if guard.root_id() != id || !guard.is_live() {
            debug!(cell_id = %id, "Cell is not a live root");
            return Ok(());
        }

        for space in guard.indexed_spaces() {
            for cache in space.remove_root(id) {
                cache.root_cell_removed(&cell, space.id());
            }
        }
        guard.set_indexed_spaces(Vec::new());
        guard.set_live(false);
        info!(cell_id = %id, %identity, "Removed root cell");
        Ok(())
    }

    /// Tell every interested cache that a cell's content changed
    pub fn revalidate_cell(&self, id: CellId) -> SpatialResult<()> {
        let cell = self.cell(id)?;
        let guard = cell.lock_read();
        for cache in guard.interested_caches() {
            cache.cell_revalidated(&cell);
        }
        Ok(())
    }

    /// Attach `child` (a detached, non-live subtree top) under `parent`.
    pub fn add_child(&self, parent_id: CellId, child_id: CellId, identity: &Identity) -> SpatialResult<()> {
        if parent_id == child_id {
            return Err(SpatialError::hierarchy(format!("{child_id} cannot be its own parent")));
        }
        let parent = self.cell(parent_id)?;
        let child = self.cell(child_id)?;
        let mut notices = Vec::new();

        {
            let (parent_guard, child_guard) = SpatialCell::lock_write_pair(&parent, &child);

            if let Some(existing) = child.parent_id() {
                return Err(SpatialError::AlreadyParented {
                    child: child_id,
                    parent: existing,
                });
            }
            if parent.has_ancestor_or_self(&child) {
                return Err(SpatialError::hierarchy(format!(
                    "{parent_id} is a descendant of {child_id}"
                )));
            }
            let Some(child_guard) = child_guard else {
                return Err(SpatialError::hierarchy(format!(
                    "{parent_id} and {child_id} already share a subtree"
                )));
            };
            if child_guard.is_live() {
                return Err(SpatialError::hierarchy(format!(
                    "{child_id} is a live root; remove it from the world first"
                )));
            }

            SpatialCell::attach(&parent, &child, &parent_guard);
            drop(child_guard);

            let mut changed = Vec::new();
            child.refresh_subtree(&mut changed);
            parent.refresh_ancestor_bounds();

            if parent_guard.is_live() {
                if let Some(root) = parent_guard.root_cell() {
                    self.reindex(&root, &parent_guard);
                }
                for cache in parent_guard.interested_caches() {
                    cache.child_cell_added(&child, &parent);
                }
            }
            self.collect_moved(&changed, &parent_guard, false, &mut notices);
        }

        self.schedule_notices(notices);
        debug!(parent = %parent_id, child = %child_id, %identity, "Attached child cell");
        Ok(())
    }

    /// Detach `child` from `parent`; the child becomes the top of its own
    /// non-live subtree.
    pub fn remove_child(&self, parent_id: CellId, child_id: CellId) -> SpatialResult<()> {
        let parent = self.cell(parent_id)?;
        let child = self.cell(child_id)?;
        let mut notices = Vec::new();

        {
            let parent_guard = parent.lock_write();
            if child.parent_id() != Some(parent_id) {
                return Err(SpatialError::NotAChild {
                    child: child_id,
                    parent: parent_id,
                });
            }

            let caches = parent_guard.interested_caches();
            let child_guard = SpatialCell::detach(&parent, &child);

            let mut changed = Vec::new();
            child.refresh_subtree(&mut changed);
            parent.refresh_ancestor_bounds();

            if parent_guard.is_live() {
                if let Some(root) = parent_guard.root_cell() {
                    self.reindex(&root, &parent_guard);
                }
            }
            for cache in caches {
                cache.child_cell_removed(&child, &parent);
            }
            self.collect_moved(&changed, &child_guard, false, &mut notices);
        }

        self.schedule_notices(notices);
        debug!(parent = %parent_id, child = %child_id, "Detached child cell");
        Ok(())
    }

    /// Detach, demote and forget a cell. Each child is detached first and
    /// becomes the top of its own non-live subtree.
    pub fn remove_cell(&self, id: CellId) -> SpatialResult<()> {
        let cell = self.cell(id)?;

        for child in cell.children() {
            self.remove_child(id, child.id())?;
        }
        if let Some(parent) = cell.parent() {
            self.remove_child(parent.id(), id)?;
        }
        if cell.root_id() == id && cell.is_live() {
            self.remove_root_spatial_cell(id, &Identity::system())?;
        }
        if cell.kind().is_view() {
            self.view_logout(id);
        }

        self.cells.write().remove(&id);
        debug!(cell_id = %id, "Removed spatial cell");
        Ok(())
    }

    // ========================================================================
    // Geometry
    // ========================================================================

    /// Move a cell relative to its parent. Descendants follow; a live root
    /// whose bounds changed is re-indexed.
    pub fn set_local_transform(&self, id: CellId, transform: CellTransform) -> SpatialResult<()> {
        let cell = self.cell(id)?;
        let mut notices = Vec::new();

        {
            let guard = cell.lock_write();
            cell.set_local_transform_raw(transform);

            let mut changed = Vec::new();
            cell.refresh_subtree(&mut changed);
            if let Some(parent) = cell.parent() {
                parent.refresh_ancestor_bounds();
            }

            if guard.is_live() {
                if let Some(root) = guard.root_cell() {
                    self.reindex(&root, &guard);
                }
            }
            self.collect_moved(&changed, &guard, true, &mut notices);
        }

        self.schedule_notices(notices);
        Ok(())
    }

    /// Replace a cell's local bounds. Rejected once the cell is live.
    pub fn set_local_bounds(&self, id: CellId, bounds: Bounds) -> SpatialResult<()> {
        let cell = self.cell(id)?;
        let guard = cell.lock_write();
        if guard.is_live() {
            return Err(SpatialError::CellIsLive(id));
        }

        cell.set_local_bounds_raw(bounds);
        cell.refresh_ancestor_bounds();
        Ok(())
    }

    pub fn set_cell_name(&self, id: CellId, name: Option<String>) -> SpatialResult<()> {
        self.cell(id)?.set_name(name);
        Ok(())
    }

    /// World transform read under the subtree lock
    pub fn world_transform(&self, id: CellId) -> SpatialResult<CellTransform> {
        let cell = self.cell(id)?;
        let _guard = cell.lock_read();
        Ok(cell.world_transform())
    }

    /// Merged world bounds read under the subtree lock
    pub fn world_bounds(&self, id: CellId) -> SpatialResult<Bounds> {
        let cell = self.cell(id)?;
        let _guard = cell.lock_read();
        Ok(cell.world_bounds())
    }

    /// Bring a live root's space index in line with its world bounds.
    /// New spaces are indexed before old ones are dropped so a cache
    /// subscribed to both never sees the root go away. Roots that cannot be
    /// placed on the grid go to the global space.
    fn reindex(&self, root: &Arc<SpatialCell>, guard: &SubtreeWrite) {
        let current = self.shared.spaces.indexing_spaces(&root.world_bounds());
        let current_ids: HashSet<SpaceId> = current.iter().map(|space| space.id()).collect();
        let previous = guard.indexed_spaces();
        let previous_ids: HashSet<SpaceId> = previous.iter().map(|space| space.id()).collect();

        for space in current.iter().filter(|space| !previous_ids.contains(&space.id())) {
            for cache in space.add_root(root) {
                cache.root_cell_added(root, space.id());
            }
        }
        for space in previous.iter().filter(|space| !current_ids.contains(&space.id())) {
            for cache in space.remove_root(root.id()) {
                cache.root_cell_removed(root, space.id());
            }
        }

        guard.set_indexed_spaces(current);
    }

    /// Queue movement for interested caches and each moved view's own
    /// cache, and collect transform notices to schedule once unlocked.
    ///
    /// `changed` lists the moved cell first. Interested caches hear about
    /// that cell only; its descendants move with it.
    fn collect_moved(
        &self,
        changed: &[Arc<SpatialCell>],
        guard: &SubtreeWrite,
        notify_caches: bool,
        notices: &mut Vec<TransformNotice>,
    ) {
        let caches = if notify_caches {
            guard.interested_caches()
        } else {
            Vec::new()
        };

        for (i, cell) in changed.iter().enumerate() {
            let world = cell.world_transform();
            let is_top = i == 0;
            if is_top {
                for cache in &caches {
                    cache.cell_moved(cell, world);
                }
            }
            if let Some(own) = cell.view_cache() {
                let heard = is_top && caches.iter().any(|cache| Arc::ptr_eq(cache, &own));
                if !heard {
                    own.cell_moved(cell, world);
                }
            }

            let listeners = cell.transform_listeners();
            if !listeners.is_empty() {
                notices.push(TransformNotice {
                    cell: cell.id(),
                    local: cell.local_transform(),
                    world,
                    listeners,
                });
            }
        }
    }

    fn schedule_notices(&self, notices: Vec<TransformNotice>) {
        let identity = Identity::system();
        for notice in notices {
            let cell = notice.cell;
            if let Err(e) = self.shared.executor.schedule(Box::new(notice), &identity) {
                warn!(cell_id = %cell, error = %e, "Transform notice dropped");
            }
        }
    }

    // ========================================================================
    // Views
    // ========================================================================

    /// Open a cache for a view cell and queue its initial relocation.
    /// Unknown views are ignored.
    pub fn view_login(&self, view_id: CellId, cache_ref: CacheRef, identity: Identity) -> SpatialResult<()> {
        let Some(cell) = self.get_cell(view_id) else {
            debug!(view = %view_id, %identity, "Login for unknown view ignored");
            return Ok(());
        };
        if !cell.kind().is_view() {
            return Err(SpatialError::NotAView(view_id));
        }

        let cache = match self.views.entry(view_id) {
            DashEntry::Occupied(_) => {
                warn!(view = %view_id, "View already logged in");
                return Ok(());
            }
            DashEntry::Vacant(entry) => {
                let cache = ViewCache::new(Arc::clone(&self.shared), Arc::clone(&cell), cache_ref, identity);
                entry.insert(Arc::clone(&cache));
                cache
            }
        };

        cell.set_view_cache(Some(&cache));
        cache.login();
        Ok(())
    }

    /// Close a view's cache. Unknown views are ignored; returns whether
    /// the view was logged in here.
    pub fn view_logout(&self, view_id: CellId) -> bool {
        let Some((_, cache)) = self.views.remove(&view_id) else {
            debug!(view = %view_id, "Logout for unknown view ignored");
            return false;
        };

        cache.logout();
        if let Some(cell) = self.get_cell(view_id) {
            cell.set_view_cache(None);
        }
        true
    }

    /// Queue a full revalidation of a view's cache. Unknown views are
    /// ignored; returns whether the view was logged in here.
    pub fn view_revalidate(&self, view_id: CellId) -> bool {
        let Some(cache) = self.view_cache(view_id) else {
            debug!(view = %view_id, "Revalidate for unknown view ignored");
            return false;
        };
        cache.revalidate();
        true
    }

    pub fn view_cache(&self, view_id: CellId) -> Option<Arc<ViewCache>> {
        self.views.get(&view_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn view_caches(&self) -> Vec<Arc<ViewCache>> {
        let mut caches: Vec<_> = self.views.iter().map(|entry| Arc::clone(entry.value())).collect();
        caches.sort_by_key(|cache| cache.view_id());
        caches
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn schedule_transaction(&self, task: Box<dyn TransactionalTask>, identity: &Identity) -> SpatialResult<()> {
        self.shared.executor.schedule(task, identity)
    }

    /// Schedule behind every task already queued under `owner`
    pub fn schedule_queued_transaction(
        &self,
        task: Box<dyn TransactionalTask>,
        identity: &Identity,
        owner: QueueOwner,
    ) -> SpatialResult<()> {
        self.shared.executor.schedule_queued(task, identity, owner)
    }

    pub fn delete_transaction_queue(&self, owner: QueueOwner) {
        self.shared.executor.delete_queue(owner);
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    pub fn add_transform_change_listener(
        &self,
        id: CellId,
        listener: Arc<dyn TransformChangeListener>,
    ) -> SpatialResult<()> {
        self.cell(id)?.add_transform_listener(listener);
        Ok(())
    }

    pub fn remove_transform_change_listener(
        &self,
        id: CellId,
        listener: &Arc<dyn TransformChangeListener>,
    ) -> SpatialResult<bool> {
        Ok(self.cell(id)?.remove_transform_listener(listener))
    }

    /// Register a listener on a cell. Every cache that has the cell loaded,
    /// now or later, calls it when its view moves.
    pub fn add_view_update_listener(&self, id: CellId, listener: Arc<dyn ViewUpdateListener>) -> SpatialResult<()> {
        let cell = self.cell(id)?;
        let guard = cell.lock_write();
        cell.add_view_update_listener(Arc::clone(&listener));

        let root = guard.root_id();
        for cache in self.view_caches() {
            if cache.has_loaded_root(root) {
                cache.attach_listener(id, Arc::clone(&listener));
            }
        }
        Ok(())
    }

    pub fn remove_view_update_listener(
        &self,
        id: CellId,
        listener: &Arc<dyn ViewUpdateListener>,
    ) -> SpatialResult<bool> {
        let cell = self.cell(id)?;
        let _guard = cell.lock_write();
        let removed = cell.remove_view_update_listener(listener);
        for cache in self.view_caches() {
            cache.detach_listener(id, listener);
        }
        Ok(removed)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the background cache processor on the current tokio runtime
    pub fn start(&self) -> SpatialResult<()> {
        self.processor.start()
    }

    /// Drain every view cache once on the calling thread
    pub fn process_pending_updates(&self) -> usize {
        self.processor.drain_all()
    }

    /// Stop the processor and log every view out.
    pub fn shutdown(&self) {
        self.processor.stop();

        let views: Vec<CellId> = self.views.iter().map(|entry| *entry.key()).collect();
        for view in &views {
            self.view_logout(*view);
        }
        let pruned = self.shared.spaces.prune_empty();
        info!(views = views.len(), pruned_spaces = pruned, "Universe shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RecordedDelta;
    use crate::executor::{FnTask, LocalExecutor};
    use crate::processor::ProcessorState;
    use crate::testing::{Fixture, CLIENT};
    use crate::update::DeltaKind;
    use glam::Vec3;
    use parking_lot::Mutex;

    fn deltas_for(f: &Fixture, view: CellId, kind: DeltaKind) -> Vec<RecordedDelta> {
        f.client
            .deltas_of(kind)
            .into_iter()
            .filter(|delta| delta.view == view)
            .collect()
    }

    #[test]
    fn test_login_loads_nearby_subtree() {
        let f = Fixture::new();
        let root = f.root(1, Vec3::ZERO, 5.0);
        let child = f.child(root, 2, Vec3::new(3.0, 0.0, 0.0));
        f.root(3, Vec3::new(400.0, 0.0, 0.0), 5.0);

        let cache = f.view(100, Vec3::new(5.0, 0.0, 0.0));
        f.settle();

        let loads = deltas_for(&f, cache.view_id(), DeltaKind::Load);
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].cells, vec![root, child]);
        assert_eq!(f.universe.view_count(), 1);
    }

    #[test]
    fn test_attach_and_detach_under_loaded_root() {
        let f = Fixture::new();
        let root = f.root(1, Vec3::ZERO, 5.0);
        f.view(100, Vec3::ZERO);
        f.settle();
        f.client.clear();

        let lamp = f.child(root, 2, Vec3::new(2.0, 0.0, 0.0));
        f.settle();
        let loads = f.client.deltas_of(DeltaKind::Load);
        assert_eq!(loads.len(), 1);
        assert_eq!(loads[0].cells, vec![lamp]);
        assert_eq!(loads[0].parents, vec![Some(root)]);

        f.universe.remove_child(root, lamp).unwrap();
        f.settle();
        assert_eq!(f.client.count(DeltaKind::Unload, lamp), 1);
        assert_eq!(f.universe.get_cell(lamp).unwrap().root_id(), lamp);
    }

    #[test]
    fn test_remove_root_unloads_subtree() {
        let f = Fixture::new();
        let root = f.root(1, Vec3::ZERO, 5.0);
        let child = f.child(root, 2, Vec3::ZERO);
        let cache = f.view(100, Vec3::ZERO);
        f.settle();

        f.universe.remove_root_spatial_cell(root, &Identity::system()).unwrap();
        f.settle();

        let unloads = f.client.deltas_of(DeltaKind::Unload);
        assert_eq!(unloads.len(), 1);
        assert_eq!(unloads[0].cells, vec![root, child]);
        assert!(cache.cached_roots().is_empty());
        assert!(!f.universe.get_cell(root).unwrap().is_live());

        // Removing again is a no-op
        f.universe.remove_root_spatial_cell(root, &Identity::system()).unwrap();
    }

    #[test]
    fn test_unknown_view_operations_ignored() {
        let f = Fixture::new();
        assert!(!f.universe.view_logout(CellId::new(42)));
        assert!(!f.universe.view_revalidate(CellId::new(42)));
    }

    #[test]
    fn test_login_requires_view_cell() {
        let f = Fixture::new();
        let plain = f.cell(1, Vec3::ZERO, 1.0);
        let err = f
            .universe
            .view_login(plain, CLIENT, Identity::new("alice"))
            .unwrap_err();
        assert!(matches!(err, SpatialError::NotAView(id) if id == plain));
    }

    #[test]
    fn test_login_for_unknown_view_ignored() {
        let f = Fixture::new();
        f.universe
            .view_login(CellId::new(9), CLIENT, Identity::new("alice"))
            .unwrap();
        assert_eq!(f.universe.view_count(), 0);
        assert!(f.universe.view_cache(CellId::new(9)).is_none());
    }

    #[test]
    fn test_hierarchy_errors() {
        let f = Fixture::new();
        let identity = Identity::system();
        let root = f.cell(1, Vec3::ZERO, 1.0);
        let child = f.child(root, 2, Vec3::ZERO);
        let other = f.cell(3, Vec3::ZERO, 1.0);
        let live = f.root(4, Vec3::ZERO, 1.0);

        assert!(matches!(
            f.universe.add_child(other, child, &identity),
            Err(SpatialError::AlreadyParented { child: c, parent: p }) if c == child && p == root
        ));
        assert!(matches!(
            f.universe.add_child(child, root, &identity),
            Err(SpatialError::InvalidHierarchy(_))
        ));
        assert!(matches!(
            f.universe.add_child(root, root, &identity),
            Err(SpatialError::InvalidHierarchy(_))
        ));
        assert!(matches!(
            f.universe.add_child(root, live, &identity),
            Err(SpatialError::InvalidHierarchy(_))
        ));
        assert!(matches!(
            f.universe.remove_child(other, child),
            Err(SpatialError::NotAChild { .. })
        ));
        assert!(matches!(
            f.universe.add_root_spatial_cell(child, &identity),
            Err(SpatialError::InvalidHierarchy(_))
        ));

        // Failed attaches leave the tree untouched
        assert_eq!(f.universe.get_cell(child).unwrap().parent_id(), Some(root));
        assert_eq!(f.universe.get_cell(root).unwrap().parent_id(), None);
    }

    #[test]
    fn test_bounds_frozen_once_live() {
        let f = Fixture::new();
        let root = f.root(1, Vec3::ZERO, 1.0);
        let err = f
            .universe
            .set_local_bounds(root, Bounds::sphere(Vec3::ZERO, 3.0))
            .unwrap_err();
        assert!(matches!(err, SpatialError::CellIsLive(id) if id == root));
    }

    #[test]
    fn test_world_bounds_merge_children() {
        let f = Fixture::new();
        let root = f.cell(1, Vec3::ZERO, 1.0);
        f.universe
            .set_local_bounds(root, Bounds::aabb(Vec3::ZERO, Vec3::ONE))
            .unwrap();
        f.child(root, 2, Vec3::new(10.0, 0.0, 0.0));

        let bounds = f.universe.world_bounds(root).unwrap();
        assert_eq!(bounds.min(), Vec3::new(-1.0, -1.0, -1.0));
        assert_eq!(bounds.max(), Vec3::new(11.0, 1.0, 1.0));

        f.move_cell(root, Vec3::new(0.0, 5.0, 0.0));
        let child = f.universe.world_transform(CellId::new(2)).unwrap();
        assert_eq!(child.translation, Vec3::new(10.0, 5.0, 0.0));
    }

    #[test]
    fn test_transform_listener_runs_in_transaction() {
        let f = Fixture::new();
        let root = f.cell(1, Vec3::ZERO, 1.0);
        let child = f.child(root, 2, Vec3::new(1.0, 0.0, 0.0));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn TransformChangeListener> =
            Arc::new(move |cell: CellId, _local: &CellTransform, world: &CellTransform| {
                sink.lock().push((cell, world.translation));
            });
        f.universe
            .add_transform_change_listener(child, Arc::clone(&listener))
            .unwrap();

        f.move_cell(root, Vec3::new(0.0, 0.0, 4.0));
        assert!(seen.lock().is_empty());
        assert_eq!(f.executor.run_pending(), 1);
        assert_eq!(seen.lock().as_slice(), [(child, Vec3::new(1.0, 0.0, 4.0))]);

        assert!(f
            .universe
            .remove_transform_change_listener(child, &listener)
            .unwrap());
        f.move_cell(root, Vec3::ZERO);
        assert_eq!(f.executor.run_pending(), 0);
    }

    #[test]
    fn test_root_moving_between_spaces() {
        let f = Fixture::new();
        let west = f.view(100, Vec3::ZERO);
        let east = f.view(101, Vec3::new(200.0, 0.0, 0.0));
        let mover = f.root(1, Vec3::ZERO, 5.0);
        f.settle();
        assert_eq!(west.cached_roots(), vec![mover]);
        assert!(east.cached_roots().is_empty());

        f.move_cell(mover, Vec3::new(200.0, 0.0, 0.0));
        f.settle();

        assert_eq!(deltas_for(&f, west.view_id(), DeltaKind::Unload).len(), 1);
        assert_eq!(deltas_for(&f, east.view_id(), DeltaKind::Load).len(), 1);
        assert!(west.cached_roots().is_empty());
        assert_eq!(east.cached_roots(), vec![mover]);

        let old = f.universe.space_manager().get(SpaceId::new(0, 0, 0)).unwrap();
        assert!(!old.contains_root(mover));
    }

    #[test]
    fn test_view_revalidate_and_cell_revalidate() {
        let f = Fixture::new();
        let root = f.root(1, Vec3::ZERO, 5.0);
        let cache = f.view(100, Vec3::ZERO);
        f.settle();

        assert!(f.universe.view_revalidate(cache.view_id()));
        f.universe.revalidate_cell(root).unwrap();
        f.settle();

        assert_eq!(f.client.count(DeltaKind::Revalidate, root), 2);
    }

    #[test]
    fn test_duplicate_and_removed_cells() {
        let f = Fixture::new();
        let root = f.root(1, Vec3::ZERO, 5.0);
        let child = f.child(root, 2, Vec3::ZERO);
        f.view(100, Vec3::ZERO);
        f.settle();

        let err = f
            .universe
            .create_spatial_cell(root, PersistentRef::new(7), CellKind::Standard)
            .unwrap_err();
        assert!(matches!(err, SpatialError::DuplicateCell(_)));

        let count = f.universe.cell_count();
        f.universe.remove_cell(child).unwrap();
        f.settle();

        assert_eq!(f.universe.cell_count(), count - 1);
        assert!(f.universe.get_cell(child).is_none());
        assert_eq!(f.client.count(DeltaKind::Unload, child), 1);
        assert!(matches!(
            f.universe.remove_cell(child),
            Err(SpatialError::UnknownCell(_))
        ));
    }

    #[test]
    fn test_removed_parent_releases_children() {
        let f = Fixture::new();
        let identity = Identity::system();
        let parent = f.cell(1, Vec3::ZERO, 1.0);
        let child = f.child(parent, 2, Vec3::new(2.0, 0.0, 0.0));
        let grandchild = f.child(child, 3, Vec3::ZERO);

        f.universe.remove_cell(parent).unwrap();

        let cell = f.universe.get_cell(child).unwrap();
        assert_eq!(cell.parent_id(), None);
        assert_eq!(cell.root_id(), child);
        assert_eq!(f.universe.get_cell(grandchild).unwrap().root_id(), child);

        // The orphan is a subtree of its own and can be promoted and demoted
        f.universe.add_root_spatial_cell(child, &identity).unwrap();
        let cache = f.view(100, Vec3::ZERO);
        f.settle();
        assert_eq!(cache.cached_roots(), vec![child]);

        f.universe.remove_root_spatial_cell(child, &identity).unwrap();
        f.settle();
        assert!(cache.cached_roots().is_empty());
        let unloads = f.client.deltas_of(DeltaKind::Unload);
        assert_eq!(unloads.len(), 1);
        assert_eq!(unloads[0].cells, vec![child, grandchild]);
    }

    #[test]
    fn test_removing_live_root_unloads_detached_children() {
        let f = Fixture::new();
        let root = f.root(1, Vec3::ZERO, 5.0);
        let child = f.child(root, 2, Vec3::ZERO);
        let cache = f.view(100, Vec3::ZERO);
        f.settle();
        f.client.clear();

        f.universe.remove_cell(root).unwrap();
        f.settle();

        assert_eq!(f.client.count(DeltaKind::Unload, child), 1);
        assert_eq!(f.client.count(DeltaKind::Unload, root), 1);
        assert!(cache.cached_roots().is_empty());

        let orphan = f.universe.get_cell(child).unwrap();
        assert_eq!(orphan.root_id(), child);
        assert!(!orphan.is_live());
    }

    #[test]
    fn test_remove_view_cell_logs_out() {
        let f = Fixture::new();
        let cache = f.view(100, Vec3::ZERO);
        f.universe.remove_cell(cache.view_id()).unwrap();

        assert!(cache.is_closed());
        assert_eq!(f.universe.view_count(), 0);
    }

    #[test]
    fn test_world_sized_root_seen_by_every_view() {
        let f = Fixture::new();
        let identity = Identity::system();
        let near = f.view(100, Vec3::ZERO);
        let far = f.view(101, Vec3::new(50_000.0, 0.0, 0.0));

        let sky = f.root(1, Vec3::ZERO, 20_000.0);
        let unbounded = f.cell(2, Vec3::ZERO, f32::INFINITY);
        f.universe.add_root_spatial_cell(unbounded, &identity).unwrap();
        f.settle();

        // Neither root was enumerated onto the grid
        let spaces = f.universe.space_manager();
        assert!(spaces.global().contains_root(sky));
        assert!(spaces.global().contains_root(unbounded));
        assert!(spaces.len() <= 2);
        for cache in [&near, &far] {
            assert_eq!(cache.cached_roots(), vec![sky, unbounded]);
            assert_eq!(cache.root_ref_count(sky), 1);
        }

        // Walking never leaves the global space
        f.move_cell(far.view_id(), Vec3::new(-50_000.0, 0.0, 0.0));
        f.settle();
        assert_eq!(far.cached_roots(), vec![sky, unbounded]);

        f.universe.remove_root_spatial_cell(sky, &identity).unwrap();
        f.settle();
        assert_eq!(f.client.count(DeltaKind::Unload, sky), 2);
        assert_eq!(near.cached_roots(), vec![unbounded]);
        assert!(!spaces.global().contains_root(sky));
    }

    #[test]
    fn test_root_growing_past_the_grid_stays_loaded() {
        let f = Fixture::new();
        let root = f.root(1, Vec3::ZERO, 5.0);
        let cache = f.view(100, Vec3::ZERO);
        f.settle();

        // A huge child makes the merged bounds too large for the grid
        let canopy = f.cell(2, Vec3::ZERO, 30_000.0);
        f.universe.add_child(root, canopy, &Identity::system()).unwrap();
        f.settle();

        assert!(f.universe.space_manager().global().contains_root(root));
        let home = f.universe.space_manager().get(SpaceId::new(0, 0, 0)).unwrap();
        assert!(!home.contains_root(root));
        assert_eq!(cache.cached_roots(), vec![root]);
        assert_eq!(f.client.count(DeltaKind::Load, root), 1);
        assert_eq!(f.client.count(DeltaKind::Unload, root), 0);
        assert_eq!(f.client.count(DeltaKind::Load, canopy), 1);
    }

    #[test]
    fn test_moving_subtree_queues_one_update() {
        let f = Fixture::new();
        let root = f.root(1, Vec3::ZERO, 5.0);
        for id in 2..6 {
            f.child(root, id, Vec3::new(id as f32, 0.0, 0.0));
        }
        let cache = f.view(100, Vec3::ZERO);
        f.settle();

        f.move_cell(root, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(cache.stats().pending_updates, 1);
        f.settle();
        assert_eq!(cache.cached_roots(), vec![root]);
    }

    #[test]
    fn test_queued_transactions() {
        let f = Fixture::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let owner = QueueOwner::Custom(1);

        for label in ["first", "second"] {
            let sink = Arc::clone(&log);
            f.universe
                .schedule_queued_transaction(
                    Box::new(FnTask::new(label, move || {
                        sink.lock().push(label);
                        Ok(())
                    })),
                    &Identity::new("tester"),
                    owner,
                )
                .unwrap();
        }
        f.universe.delete_transaction_queue(owner);
        f.universe
            .schedule_transaction(Box::new(FnTask::new("free", || Ok(()))), &Identity::system())
            .unwrap();

        assert_eq!(f.executor.run_pending(), 3);
        assert_eq!(log.lock().as_slice(), ["first", "second"]);
        assert!(!f.executor.has_queue(owner));
    }

    #[test]
    fn test_shutdown_logs_out_views() {
        let f = Fixture::new();
        f.root(1, Vec3::ZERO, 5.0);
        let cache = f.view(100, Vec3::ZERO);
        f.view(101, Vec3::new(500.0, 0.0, 0.0));
        f.settle();
        assert_eq!(f.universe.space_manager().len(), 2);

        f.universe.shutdown();

        assert!(cache.is_closed());
        assert_eq!(f.universe.view_count(), 0);
        assert_eq!(f.universe.processor().state(), ProcessorState::Stopped);
        // The root's space survives; the far view's empty space is pruned
        assert_eq!(f.universe.space_manager().len(), 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let executor = Arc::new(LocalExecutor::new(4));
        let directory = Arc::new(crate::client::MemoryDirectory::new());
        let result = Universe::new(SpatialConfig::default().with_space_size(0.0), executor, directory);
        assert!(matches!(result, Err(SpatialError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_background_processing() {
        let mut config = SpatialConfig::default()
            .with_space_size(100.0)
            .with_proximity_radius(20.0);
        config.processor.interval_ms = 10;
        let f = Fixture::with_config(config, 64);

        f.universe.start().unwrap();
        let runner = f.executor.spawn_runner(f.universe.processor().shutdown_receiver());

        let root = f.root(1, Vec3::ZERO, 5.0);
        f.view(100, Vec3::ZERO);

        for _ in 0..200 {
            if f.client.count(DeltaKind::Load, root) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(f.client.count(DeltaKind::Load, root), 1);

        f.universe.shutdown();
        runner.await.unwrap();
    }
}
