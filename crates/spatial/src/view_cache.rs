//! # View Cache
//!
//! Per-avatar proximity cache. Tracks which spaces and which root subtrees
//! are relevant to one view and turns movement and structural events into
//! LOAD / UNLOAD / REVALIDATE deltas for the view's client cache.
//!
//! ## Flow
//!
//! ```text
//! producers ──enqueue──▶ pending ──swap──▶ drain ──▶ deltas ──▶ executor
//!  (cells, spaces,        (Vec)            (one at a time        (queued per
//!   universe)                               per view)             view/update)
//! ```
//!
//! Producers only take the short `pending` lock. The drain holds the state
//! lock for one batch and takes subtree read locks one at a time while it
//! enumerates cells. Deltas and view-moved notifications go out after the
//! state lock is released.
//!
//! ## Reference counting
//!
//! A root is cached while at least one entered space provides it. The count
//! is kept as the set of entered spaces the root was seen through, so a
//! duplicate add or remove for the same space never skews it. The global
//! space is entered at login and only left at logout.

use glam::Vec3;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

use crate::cell::SpatialCell;
use crate::client::DeliveryTask;
use crate::config::DeltaOrdering;
use crate::executor::QueueOwner;
use crate::listener::ViewUpdateListener;
use crate::math::{Bounds, CellTransform};
use crate::space::{Space, SpaceId};
use crate::types::{CacheRef, CellId, Identity};
use crate::universe::UniverseShared;
use crate::update::{CacheUpdate, CellDescription, Delta, DeltaKind};

struct RootEntry {
    cell: Arc<SpatialCell>,
    spaces: HashSet<SpaceId>,
}

#[derive(Default)]
struct CacheState {
    spaces: HashMap<SpaceId, Arc<Space>>,
    roots: HashMap<CellId, RootEntry>,
    last_revalidation: Option<Vec3>,
    revalidations: u64,
}

/// View-update listeners of the cells this cache has loaded
#[derive(Default)]
struct ListenerIndex {
    roots: HashSet<CellId>,
    by_cell: HashMap<CellId, Vec<Arc<dyn ViewUpdateListener>>>,
}

/// Work the drain performs after releasing the state lock
enum Outgoing {
    Delta(Delta),
    ViewMoved(CellTransform),
}

/// Snapshot of a cache's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entered_spaces: usize,
    pub cached_roots: usize,
    pub pending_updates: usize,
    pub updates_processed: u64,
    pub space_revalidations: u64,
    pub batches_scheduled: u64,
    pub batches_rejected: u64,
}

/// Proximity cache of one logged-in view.
pub struct ViewCache {
    view: Arc<SpatialCell>,
    cache_ref: CacheRef,
    identity: Identity,
    shared: Arc<UniverseShared>,
    self_ref: Weak<ViewCache>,
    pending: Mutex<Vec<CacheUpdate>>,
    state: Mutex<CacheState>,
    listeners: Mutex<ListenerIndex>,
    closed: AtomicBool,
    in_flight: AtomicBool,
    updates_processed: AtomicU64,
    batches_scheduled: AtomicU64,
    batches_rejected: AtomicU64,
}

impl ViewCache {
    pub(crate) fn new(
        shared: Arc<UniverseShared>,
        view: Arc<SpatialCell>,
        cache_ref: CacheRef,
        identity: Identity,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            view,
            cache_ref,
            identity,
            shared,
            self_ref: self_ref.clone(),
            pending: Mutex::new(Vec::new()),
            state: Mutex::new(CacheState::default()),
            listeners: Mutex::new(ListenerIndex::default()),
            closed: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            updates_processed: AtomicU64::new(0),
            batches_scheduled: AtomicU64::new(0),
            batches_rejected: AtomicU64::new(0),
        })
    }

    pub fn view_id(&self) -> CellId {
        self.view.id()
    }

    pub fn cache_ref(&self) -> CacheRef {
        self.cache_ref
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Producers
    // ========================================================================

    fn enqueue(&self, update: CacheUpdate) {
        if self.is_closed() {
            trace!(view = %self.view_id(), ?update, "Dropping update for closed cache");
            return;
        }
        self.pending.lock().push(update);
    }

    /// A cell moved. Movement of the view's own cell drives relocation.
    pub fn cell_moved(&self, cell: &Arc<SpatialCell>, world: CellTransform) {
        if cell.id() == self.view_id() {
            self.enqueue(CacheUpdate::ViewMoved { world });
        } else {
            self.enqueue(CacheUpdate::CellMoved {
                cell: Arc::clone(cell),
                world,
            });
        }
    }

    pub fn cell_revalidated(&self, cell: &Arc<SpatialCell>) {
        self.enqueue(CacheUpdate::CellRevalidated {
            cell: Arc::clone(cell),
        });
    }

    /// Re-send every cached cell tagged REVALIDATE
    pub fn revalidate(&self) {
        self.enqueue(CacheUpdate::CacheRevalidated);
    }

    pub fn child_cell_added(&self, cell: &Arc<SpatialCell>, parent: &Arc<SpatialCell>) {
        self.enqueue(CacheUpdate::CellAdded {
            cell: Arc::clone(cell),
            parent: Some(Arc::clone(parent)),
            space: None,
        });
    }

    pub fn child_cell_removed(&self, cell: &Arc<SpatialCell>, parent: &Arc<SpatialCell>) {
        self.enqueue(CacheUpdate::CellRemoved {
            cell: Arc::clone(cell),
            parent: Some(Arc::clone(parent)),
            space: None,
        });
    }

    pub fn root_cell_added(&self, cell: &Arc<SpatialCell>, space: SpaceId) {
        self.enqueue(CacheUpdate::CellAdded {
            cell: Arc::clone(cell),
            parent: None,
            space: Some(space),
        });
    }

    pub fn root_cell_removed(&self, cell: &Arc<SpatialCell>, space: SpaceId) {
        self.enqueue(CacheUpdate::CellRemoved {
            cell: Arc::clone(cell),
            parent: None,
            space: Some(space),
        });
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Queue entry into the global space and the initial relocation from
    /// the view's current position
    pub(crate) fn login(&self) {
        let world = {
            let _guard = self.view.lock_read();
            self.view.world_transform()
        };
        info!(view = %self.view_id(), cache = %self.cache_ref, identity = %self.identity, "View logged in");
        self.enqueue(CacheUpdate::EnterSpace {
            space: Arc::clone(self.shared.spaces.global()),
        });
        self.enqueue(CacheUpdate::ViewMoved { world });
    }

    /// Close the cache. Waits for an in-progress batch, then unsubscribes
    /// from every space and forgets all state.
    pub(crate) fn logout(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();

        {
            let mut state = self.state.lock();
            for space in state.spaces.values() {
                space.unsubscribe(self.view_id());
            }
            state.spaces.clear();
            state.roots.clear();
            state.last_revalidation = None;
        }
        *self.listeners.lock() = ListenerIndex::default();

        if self.shared.config.processor.ordering == DeltaOrdering::PerView {
            self.shared.executor.delete_queue(QueueOwner::View(self.view_id()));
        }
        info!(view = %self.view_id(), "View logged out");
    }

    // ========================================================================
    // Drain
    // ========================================================================

    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Drain the pending queue once. Returns the number of updates taken.
    ///
    /// At most one drain per cache runs at a time; a concurrent call returns
    /// 0 without waiting.
    pub fn process_pending(&self) -> usize {
        let Some(_claim) = DrainClaim::try_claim(&self.in_flight) else {
            return 0;
        };

        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return 0;
        }
        let taken = batch.len();

        let outgoing = {
            let mut state = self.state.lock();
            if self.is_closed() {
                return 0;
            }

            let mut work: VecDeque<CacheUpdate> = batch.into();
            let mut outgoing = Vec::new();
            while let Some(update) = work.pop_front() {
                self.apply(&mut state, update, &mut work, &mut outgoing);
            }
            outgoing
        };

        self.updates_processed.fetch_add(taken as u64, Ordering::Relaxed);
        for item in outgoing {
            match item {
                Outgoing::Delta(delta) => self.dispatch(delta),
                Outgoing::ViewMoved(world) => self.notify_view_moved(&world),
            }
        }

        // A logout that raced this dispatch deleted the queue before it was refilled
        if self.is_closed() && self.shared.config.processor.ordering == DeltaOrdering::PerView {
            self.shared.executor.delete_queue(QueueOwner::View(self.view_id()));
        }
        taken
    }

    fn apply(
        &self,
        state: &mut CacheState,
        update: CacheUpdate,
        work: &mut VecDeque<CacheUpdate>,
        outgoing: &mut Vec<Outgoing>,
    ) {
        let cause = update.kind();
        let mut cells = Vec::new();
        let kind = match update {
            CacheUpdate::ViewMoved { world } => {
                self.relocate(state, world.translation, work);
                outgoing.push(Outgoing::ViewMoved(world));
                return;
            }
            CacheUpdate::CellMoved { cell, world } => {
                // Hook for per-cell proximity; roots are tracked through spaces
                trace!(view = %self.view_id(), cell_id = %cell.id(), position = ?world.translation, "Cell moved");
                return;
            }
            CacheUpdate::EnterSpace { space } => {
                self.enter_space(state, space, &mut cells);
                DeltaKind::Load
            }
            CacheUpdate::ExitSpace { space } => {
                self.exit_space(state, &space, &mut cells);
                DeltaKind::Unload
            }
            CacheUpdate::CellAdded {
                cell,
                space: Some(space),
                ..
            } => {
                if state.spaces.contains_key(&space) {
                    self.add_root_ref(state, &cell, space, &mut cells);
                } else {
                    trace!(view = %self.view_id(), cell_id = %cell.id(), %space, "Root added to a space no longer entered");
                }
                DeltaKind::Load
            }
            CacheUpdate::CellAdded {
                cell,
                parent: Some(parent),
                space: None,
            } => {
                let guard = cell.lock_read();
                if state.roots.contains_key(&guard.root_id()) {
                    self.load_subtree(&cell, None, &mut cells);
                } else {
                    trace!(view = %self.view_id(), cell_id = %cell.id(), parent = %parent.id(), "Child added outside the cache");
                }
                DeltaKind::Load
            }
            CacheUpdate::CellRemoved {
                cell,
                space: Some(space),
                ..
            } => {
                self.remove_root_ref(state, cell.id(), space, &mut cells);
                DeltaKind::Unload
            }
            CacheUpdate::CellRemoved {
                cell,
                parent: Some(parent),
                space: None,
            } => {
                if state.roots.contains_key(&parent.root_id()) {
                    let _guard = cell.lock_read();
                    self.unload_subtree(&cell, None, &mut cells);
                }
                DeltaKind::Unload
            }
            CacheUpdate::CellAdded { cell, .. } | CacheUpdate::CellRemoved { cell, .. } => {
                warn!(view = %self.view_id(), cell_id = %cell.id(), %cause, "Structural update without parent or space");
                return;
            }
            CacheUpdate::CellRevalidated { cell } => {
                let guard = cell.lock_read();
                if state.roots.contains_key(&guard.root_id()) {
                    cells.push(cell.describe());
                }
                DeltaKind::Revalidate
            }
            CacheUpdate::CacheRevalidated => {
                let mut roots: Vec<_> = state.roots.values().map(|e| Arc::clone(&e.cell)).collect();
                roots.sort_by_key(|cell| cell.id());
                for root in roots {
                    let _guard = root.lock_read();
                    root.visit_subtree(&mut |cell| cells.push(cell.describe()));
                }
                DeltaKind::Revalidate
            }
        };

        if !cells.is_empty() {
            outgoing.push(Outgoing::Delta(Delta {
                kind,
                view: self.view_id(),
                cause,
                cells,
            }));
        }
    }

    /// Recompute entered spaces if the view strayed far enough from the
    /// last revalidation point. Enter/exit follow-ups run next, enters
    /// first so a root shared by an old and a new space is never reloaded.
    fn relocate(&self, state: &mut CacheState, position: Vec3, work: &mut VecDeque<CacheUpdate>) {
        let threshold = self.shared.config.grid.revalidation_distance();
        if let Some(last) = state.last_revalidation {
            if last.distance_squared(position) <= threshold * threshold {
                return;
            }
        }

        let proximity = Bounds::sphere(position, self.shared.config.view.proximity_radius);
        let Some(current) = self.shared.spaces.enclosing_spaces(&proximity) else {
            warn!(view = %self.view_id(), position = ?position, "View position is off the grid, keeping its spaces");
            return;
        };
        let current_ids: HashSet<SpaceId> = current.iter().map(|space| space.id()).collect();

        let mut follow_ups: Vec<CacheUpdate> = current
            .into_iter()
            .filter(|space| !state.spaces.contains_key(&space.id()))
            .map(|space| CacheUpdate::EnterSpace { space })
            .collect();

        let mut leaving: Vec<_> = state
            .spaces
            .values()
            .filter(|space| space.id() != SpaceId::Global && !current_ids.contains(&space.id()))
            .cloned()
            .collect();
        leaving.sort_by_key(|space| space.id());
        follow_ups.extend(leaving.into_iter().map(|space| CacheUpdate::ExitSpace { space }));

        debug!(
            view = %self.view_id(),
            position = ?position,
            spaces = current_ids.len(),
            changes = follow_ups.len(),
            "Revalidated view spaces"
        );

        for update in follow_ups.into_iter().rev() {
            work.push_front(update);
        }
        state.last_revalidation = Some(position);
        state.revalidations += 1;
    }

    fn enter_space(&self, state: &mut CacheState, space: Arc<Space>, cells: &mut Vec<CellDescription>) {
        let id = space.id();
        if state.spaces.contains_key(&id) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };

        let roots = space.subscribe(&this);
        state.spaces.insert(id, space);
        for root in &roots {
            self.add_root_ref(state, root, id, cells);
        }
        debug!(view = %self.view_id(), space = %id, roots = roots.len(), "Entered space");
    }

    fn exit_space(&self, state: &mut CacheState, space: &Arc<Space>, cells: &mut Vec<CellDescription>) {
        let id = space.id();
        if state.spaces.remove(&id).is_none() {
            return;
        }
        space.unsubscribe(self.view_id());

        let mut provided: Vec<CellId> = state
            .roots
            .iter()
            .filter(|(_, entry)| entry.spaces.contains(&id))
            .map(|(root, _)| *root)
            .collect();
        provided.sort();
        for root in provided {
            self.remove_root_ref(state, root, id, cells);
        }
        debug!(view = %self.view_id(), space = %id, "Exited space");
    }

    /// Count `root` as seen through `space`; LOAD on first sight.
    fn add_root_ref(
        &self,
        state: &mut CacheState,
        root: &Arc<SpatialCell>,
        space: SpaceId,
        cells: &mut Vec<CellDescription>,
    ) {
        match state.roots.entry(root.id()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().spaces.insert(space);
            }
            Entry::Vacant(entry) => {
                let _guard = root.lock_read();
                self.load_subtree(root, Some(root.id()), cells);
                entry.insert(RootEntry {
                    cell: Arc::clone(root),
                    spaces: HashSet::from([space]),
                });
            }
        }
    }

    /// Stop counting `root` through `space`; UNLOAD once no space is left.
    fn remove_root_ref(&self, state: &mut CacheState, root: CellId, space: SpaceId, cells: &mut Vec<CellDescription>) {
        let Some(entry) = state.roots.get_mut(&root) else {
            return;
        };
        entry.spaces.remove(&space);
        if !entry.spaces.is_empty() {
            return;
        }

        if let Some(entry) = state.roots.remove(&root) {
            let _guard = entry.cell.lock_read();
            self.unload_subtree(&entry.cell, Some(root), cells);
        }
    }

    /// Describe `top` and its descendants and pick up their listeners.
    /// The caller holds the subtree read lock.
    fn load_subtree(&self, top: &Arc<SpatialCell>, root: Option<CellId>, cells: &mut Vec<CellDescription>) {
        let mut found = Vec::new();
        top.visit_subtree(&mut |cell| {
            cells.push(cell.describe());
            for listener in cell.view_update_listeners() {
                found.push((cell.id(), listener));
            }
        });

        let mut index = self.listeners.lock();
        if let Some(root) = root {
            index.roots.insert(root);
        }
        for (cell, listener) in found {
            let attached = index.by_cell.entry(cell).or_default();
            if !attached.iter().any(|known| Arc::ptr_eq(known, &listener)) {
                attached.push(listener);
            }
        }
    }

    /// Describe `top` and its descendants and drop their listeners.
    /// The caller holds the subtree read lock.
    fn unload_subtree(&self, top: &Arc<SpatialCell>, root: Option<CellId>, cells: &mut Vec<CellDescription>) {
        let mut dropped = Vec::new();
        top.visit_subtree(&mut |cell| {
            cells.push(cell.describe());
            dropped.push(cell.id());
        });

        let mut index = self.listeners.lock();
        if let Some(root) = root {
            index.roots.remove(&root);
        }
        for cell in dropped {
            index.by_cell.remove(&cell);
        }
    }

    fn dispatch(&self, delta: Delta) {
        let owner = match self.shared.config.processor.ordering {
            DeltaOrdering::PerView => QueueOwner::View(self.view_id()),
            DeltaOrdering::PerUpdate => QueueOwner::Update(self.shared.next_update_seq()),
        };
        let kind = delta.kind;
        let cause = delta.cause;
        let count = delta.len();

        let task = Box::new(DeliveryTask {
            cache_ref: self.cache_ref,
            directory: Arc::clone(&self.shared.directory),
            delta,
        });

        match self.shared.executor.schedule_queued(task, &self.identity, owner) {
            Ok(()) => {
                self.batches_scheduled.fetch_add(1, Ordering::Relaxed);
                debug!(view = %self.view_id(), %kind, %cause, cells = count, %owner, "Scheduled delta");
            }
            Err(e) => {
                // Not retried; the next revalidation repairs the client
                self.batches_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(view = %self.view_id(), %kind, %cause, cells = count, error = %e, "Delta dropped");
            }
        }

        if matches!(owner, QueueOwner::Update(_)) {
            self.shared.executor.delete_queue(owner);
        }
    }

    fn notify_view_moved(&self, world: &CellTransform) {
        let listeners: Vec<(CellId, Arc<dyn ViewUpdateListener>)> = {
            let index = self.listeners.lock();
            let mut all: Vec<_> = index
                .by_cell
                .iter()
                .flat_map(|(cell, listeners)| listeners.iter().map(move |l| (*cell, Arc::clone(l))))
                .collect();
            all.sort_by_key(|(cell, _)| *cell);
            all
        };

        for (cell, listener) in listeners {
            listener.view_moved(cell, self.view_id(), world);
        }
    }

    // ========================================================================
    // View-update listener registry (callers hold the cell's subtree lock)
    // ========================================================================

    pub(crate) fn has_loaded_root(&self, root: CellId) -> bool {
        self.listeners.lock().roots.contains(&root)
    }

    pub(crate) fn attach_listener(&self, cell: CellId, listener: Arc<dyn ViewUpdateListener>) {
        let mut index = self.listeners.lock();
        let attached = index.by_cell.entry(cell).or_default();
        if !attached.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            attached.push(listener);
        }
    }

    pub(crate) fn detach_listener(&self, cell: CellId, listener: &Arc<dyn ViewUpdateListener>) {
        let mut index = self.listeners.lock();
        if let Some(attached) = index.by_cell.get_mut(&cell) {
            attached.retain(|known| !Arc::ptr_eq(known, listener));
            if attached.is_empty() {
                index.by_cell.remove(&cell);
            }
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn entered_spaces(&self) -> Vec<SpaceId> {
        let mut spaces: Vec<_> = self.state.lock().spaces.keys().copied().collect();
        spaces.sort();
        spaces
    }

    pub fn cached_roots(&self) -> Vec<CellId> {
        let mut roots: Vec<_> = self.state.lock().roots.keys().copied().collect();
        roots.sort();
        roots
    }

    /// Number of entered spaces through which `root` is cached
    pub fn root_ref_count(&self, root: CellId) -> usize {
        self.state
            .lock()
            .roots
            .get(&root)
            .map(|entry| entry.spaces.len())
            .unwrap_or(0)
    }

    pub fn last_revalidation_point(&self) -> Option<Vec3> {
        self.state.lock().last_revalidation
    }

    pub fn stats(&self) -> CacheStats {
        let pending_updates = self.pending.lock().len();
        let state = self.state.lock();
        CacheStats {
            entered_spaces: state.spaces.len(),
            cached_roots: state.roots.len(),
            pending_updates,
            updates_processed: self.updates_processed.load(Ordering::Relaxed),
            space_revalidations: state.revalidations,
            batches_scheduled: self.batches_scheduled.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for ViewCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewCache")
            .field("view", &self.view_id())
            .field("cache_ref", &self.cache_ref)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Per-view sequencing token: held for the length of one drain.
struct DrainClaim<'a>(&'a AtomicBool);

impl<'a> DrainClaim<'a> {
    fn try_claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
