//! # Spatial Cells
//!
//! Nodes of the authoritative world graph.
//!
//! ## Locking
//!
//! Every connected subtree shares one `RootLock`. Structural mutation of
//! the subtree (attach, detach, transform or bounds changes, promotion to a
//! live root) holds the write side; traversals that must see a consistent
//! subtree (load/unload enumeration, accessor snapshots) hold the read side.
//!
//! The per-cell `RwLock<CellNode>` only protects a single node's fields and
//! is never held while another lock is acquired.

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::listener::{TransformChangeListener, ViewUpdateListener};
use crate::math::{Bounds, CellTransform};
use crate::space::{Space, SpaceId};
use crate::types::{CellId, CellKind, PersistentRef};
use crate::update::CellDescription;
use crate::view_cache::ViewCache;

// ============================================================================
// Root Lock
// ============================================================================

/// Reader/writer lock shared by every cell of one connected subtree, plus
/// the space index of that subtree's root while it is live.
pub(crate) struct RootLock {
    root_id: CellId,
    cell: Weak<SpatialCell>,
    lock: Arc<RwLock<()>>,
    index: Mutex<RootIndex>,
}

#[derive(Default)]
struct RootIndex {
    live: bool,
    spaces: HashMap<SpaceId, Arc<Space>>,
}

impl RootLock {
    fn new(root_id: CellId, cell: Weak<SpatialCell>) -> Arc<Self> {
        Arc::new(Self {
            root_id,
            cell,
            lock: Arc::new(RwLock::new(())),
            index: Mutex::new(RootIndex::default()),
        })
    }

    fn indexed_spaces(&self) -> Vec<Arc<Space>> {
        let mut spaces: Vec<_> = self.index.lock().spaces.values().cloned().collect();
        spaces.sort_by_key(|space| space.id());
        spaces
    }

    /// View caches subscribed to any space the root is indexed in
    fn interested_caches(&self) -> Vec<Arc<ViewCache>> {
        if !self.index.lock().live {
            return Vec::new();
        }
        let mut caches: Vec<Arc<ViewCache>> = Vec::new();
        for space in self.indexed_spaces() {
            for cache in space.view_caches() {
                if !caches.iter().any(|known| Arc::ptr_eq(known, &cache)) {
                    caches.push(cache);
                }
            }
        }
        caches
    }

    /// Total order used when two subtrees are locked together
    fn order_key(self: &Arc<Self>) -> (CellId, usize) {
        (self.root_id, Arc::as_ptr(self) as usize)
    }
}

/// Proof that a subtree's read lock is held
pub(crate) struct SubtreeRead {
    root: Arc<RootLock>,
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl SubtreeRead {
    pub(crate) fn root_id(&self) -> CellId {
        self.root.root_id
    }

    pub(crate) fn is_live(&self) -> bool {
        self.root.index.lock().live
    }

    pub(crate) fn interested_caches(&self) -> Vec<Arc<ViewCache>> {
        self.root.interested_caches()
    }
}

/// Proof that a subtree's write lock is held
pub(crate) struct SubtreeWrite {
    root: Arc<RootLock>,
    _guard: ArcRwLockWriteGuard<RawRwLock, ()>,
}

impl SubtreeWrite {
    pub(crate) fn root_id(&self) -> CellId {
        self.root.root_id
    }

    pub(crate) fn is_live(&self) -> bool {
        self.root.index.lock().live
    }

    pub(crate) fn set_live(&self, live: bool) {
        self.root.index.lock().live = live;
    }

    /// Cell at the top of the locked subtree
    pub(crate) fn root_cell(&self) -> Option<Arc<SpatialCell>> {
        self.root.cell.upgrade()
    }

    /// Spaces the root is indexed in
    pub(crate) fn indexed_spaces(&self) -> Vec<Arc<Space>> {
        self.root.indexed_spaces()
    }

    pub(crate) fn set_indexed_spaces(&self, spaces: Vec<Arc<Space>>) {
        self.root.index.lock().spaces = spaces
            .into_iter()
            .map(|space| (space.id(), space))
            .collect();
    }

    pub(crate) fn interested_caches(&self) -> Vec<Arc<ViewCache>> {
        self.root.interested_caches()
    }
}

// ============================================================================
// Spatial Cell
// ============================================================================

struct CellNode {
    name: Option<String>,
    parent: Option<Weak<SpatialCell>>,
    children: Vec<Arc<SpatialCell>>,
    local_transform: CellTransform,
    world_transform: CellTransform,
    local_bounds: Bounds,
    world_bounds: Bounds,
    root: Arc<RootLock>,
}

/// A node of the world graph.
///
/// Cells are created detached, each as the root of its own one-cell
/// subtree. They become visible to views once their subtree root is
/// promoted with [`Universe::add_root_spatial_cell`](crate::Universe::add_root_spatial_cell).
pub struct SpatialCell {
    id: CellId,
    kind: CellKind,
    persistent_ref: PersistentRef,
    node: RwLock<CellNode>,
    transform_listeners: RwLock<Vec<Arc<dyn TransformChangeListener>>>,
    view_update_listeners: RwLock<Vec<Arc<dyn ViewUpdateListener>>>,
    view_cache: RwLock<Option<Weak<ViewCache>>>,
}

impl SpatialCell {
    pub(crate) fn new(id: CellId, persistent_ref: PersistentRef, kind: CellKind) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            id,
            kind,
            persistent_ref,
            node: RwLock::new(CellNode {
                name: None,
                parent: None,
                children: Vec::new(),
                local_transform: CellTransform::IDENTITY,
                world_transform: CellTransform::IDENTITY,
                local_bounds: Bounds::default(),
                world_bounds: Bounds::default(),
                root: RootLock::new(id, weak.clone()),
            }),
            transform_listeners: RwLock::new(Vec::new()),
            view_update_listeners: RwLock::new(Vec::new()),
            view_cache: RwLock::new(None),
        })
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn kind(&self) -> CellKind {
        self.kind
    }

    pub fn persistent_ref(&self) -> PersistentRef {
        self.persistent_ref
    }

    pub fn name(&self) -> Option<String> {
        self.node.read().name.clone()
    }

    pub(crate) fn set_name(&self, name: Option<String>) {
        self.node.write().name = name;
    }

    pub fn parent(&self) -> Option<Arc<SpatialCell>> {
        self.node.read().parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn parent_id(&self) -> Option<CellId> {
        self.parent().map(|parent| parent.id)
    }

    pub fn children(&self) -> Vec<Arc<SpatialCell>> {
        self.node.read().children.clone()
    }

    /// Id of the cell at the top of this cell's subtree
    pub fn root_id(&self) -> CellId {
        self.node.read().root.root_id
    }

    /// True while the subtree root is promoted into the world
    pub fn is_live(&self) -> bool {
        self.root_lock().index.lock().live
    }

    pub fn local_transform(&self) -> CellTransform {
        self.node.read().local_transform
    }

    pub fn world_transform(&self) -> CellTransform {
        self.node.read().world_transform
    }

    pub fn local_bounds(&self) -> Bounds {
        self.node.read().local_bounds
    }

    /// Own bounds in world space merged with every descendant's
    pub fn world_bounds(&self) -> Bounds {
        self.node.read().world_bounds
    }

    // ========================================================================
    // Subtree locking
    // ========================================================================

    fn root_lock(&self) -> Arc<RootLock> {
        Arc::clone(&self.node.read().root)
    }

    fn still_rooted_at(&self, root: &Arc<RootLock>) -> bool {
        Arc::ptr_eq(&self.node.read().root, root)
    }

    /// Take the read side of this cell's subtree lock.
    ///
    /// Retries if the cell moved to another subtree while waiting.
    pub(crate) fn lock_read(&self) -> SubtreeRead {
        loop {
            let root = self.root_lock();
            let guard = root.lock.read_arc();
            if self.still_rooted_at(&root) {
                return SubtreeRead { root, _guard: guard };
            }
        }
    }

    /// Take the write side of this cell's subtree lock.
    pub(crate) fn lock_write(&self) -> SubtreeWrite {
        loop {
            let root = self.root_lock();
            let guard = root.lock.write_arc();
            if self.still_rooted_at(&root) {
                return SubtreeWrite { root, _guard: guard };
            }
        }
    }

    /// Write-lock the subtrees of two cells. The second guard is `None` when
    /// both cells share a subtree.
    pub(crate) fn lock_write_pair(a: &SpatialCell, b: &SpatialCell) -> (SubtreeWrite, Option<SubtreeWrite>) {
        loop {
            let root_a = a.root_lock();
            let root_b = b.root_lock();

            if Arc::ptr_eq(&root_a, &root_b) {
                let guard = root_a.lock.write_arc();
                if a.still_rooted_at(&root_a) && b.still_rooted_at(&root_a) {
                    return (SubtreeWrite { root: root_a, _guard: guard }, None);
                }
                continue;
            }

            let a_first = root_a.order_key() < root_b.order_key();
            let (first, second) = if a_first { (&root_a, &root_b) } else { (&root_b, &root_a) };
            let first_guard = first.lock.write_arc();
            let second_guard = second.lock.write_arc();
            let (guard_a, guard_b) = if a_first {
                (first_guard, second_guard)
            } else {
                (second_guard, first_guard)
            };

            let guard_a = SubtreeWrite { root: root_a, _guard: guard_a };
            let guard_b = SubtreeWrite { root: root_b, _guard: guard_b };

            if a.still_rooted_at(&guard_a.root) && b.still_rooted_at(&guard_b.root) {
                return (guard_a, Some(guard_b));
            }
        }
    }

    // ========================================================================
    // Structure (callers hold the subtree write lock)
    // ========================================================================

    /// Link `child` under `parent` and move the child's subtree onto the
    /// parent's root lock. The child's old lock must be held.
    pub(crate) fn attach(parent: &Arc<SpatialCell>, child: &Arc<SpatialCell>, guard: &SubtreeWrite) {
        child.node.write().parent = Some(Arc::downgrade(parent));
        parent.node.write().children.push(Arc::clone(child));
        child.set_subtree_root(&guard.root);
    }

    /// Unlink `child` from `parent`, giving it a fresh root lock whose write
    /// side is returned already held.
    pub(crate) fn detach(parent: &SpatialCell, child: &Arc<SpatialCell>) -> SubtreeWrite {
        parent
            .node
            .write()
            .children
            .retain(|candidate| !Arc::ptr_eq(candidate, child));
        child.node.write().parent = None;

        let root = RootLock::new(child.id, Arc::downgrade(child));
        let guard = root.lock.write_arc();
        child.set_subtree_root(&root);
        SubtreeWrite { root, _guard: guard }
    }

    fn set_subtree_root(self: &Arc<Self>, root: &Arc<RootLock>) {
        self.visit_subtree(&mut |cell| {
            cell.node.write().root = Arc::clone(root);
        });
    }

    pub(crate) fn set_local_transform_raw(&self, transform: CellTransform) {
        self.node.write().local_transform = transform;
    }

    pub(crate) fn set_local_bounds_raw(&self, bounds: Bounds) {
        self.node.write().local_bounds = bounds;
    }

    /// Recompute world transforms and bounds below (and including) this
    /// cell. Cells whose world transform changed are appended to `changed`.
    pub(crate) fn refresh_subtree(self: &Arc<Self>, changed: &mut Vec<Arc<SpatialCell>>) {
        let parent_world = self
            .parent()
            .map(|parent| parent.world_transform())
            .unwrap_or(CellTransform::IDENTITY);
        self.refresh_from(&parent_world, changed);
    }

    fn refresh_from(self: &Arc<Self>, parent_world: &CellTransform, changed: &mut Vec<Arc<SpatialCell>>) {
        let (world, children) = {
            let mut node = self.node.write();
            let world = parent_world.mul(&node.local_transform);
            if !world.approx_eq(&node.world_transform) {
                changed.push(Arc::clone(self));
            }
            node.world_transform = world;
            (world, node.children.clone())
        };

        for child in &children {
            child.refresh_from(&world, changed);
        }
        self.refresh_bounds();
    }

    /// Merge own bounds with the children's. Returns true if they changed.
    fn refresh_bounds(&self) -> bool {
        let (own, children) = {
            let node = self.node.read();
            (
                node.local_bounds.transformed(&node.world_transform),
                node.children.clone(),
            )
        };
        let merged = children
            .iter()
            .fold(own, |acc, child| acc.merge(&child.world_bounds()));

        let mut node = self.node.write();
        let changed = node.world_bounds != merged;
        node.world_bounds = merged;
        changed
    }

    /// Re-merge bounds from this cell up to the subtree root
    pub(crate) fn refresh_ancestor_bounds(&self) {
        self.refresh_bounds();
        let mut current = self.parent();
        while let Some(cell) = current {
            cell.refresh_bounds();
            current = cell.parent();
        }
    }

    // ========================================================================
    // Traversal (callers hold the subtree lock)
    // ========================================================================

    /// Visit this cell and its descendants, parents before children.
    pub(crate) fn visit_subtree(self: &Arc<Self>, visit: &mut impl FnMut(&Arc<SpatialCell>)) {
        visit(self);
        for child in self.children() {
            child.visit_subtree(visit);
        }
    }

    /// True if `other` is this cell or one of its ancestors
    pub(crate) fn has_ancestor_or_self(&self, other: &SpatialCell) -> bool {
        if self.id == other.id {
            return true;
        }
        let mut current = self.parent();
        while let Some(cell) = current {
            if cell.id == other.id {
                return true;
            }
            current = cell.parent();
        }
        false
    }

    pub fn describe(&self) -> CellDescription {
        let node = self.node.read();
        CellDescription {
            cell_id: self.id,
            class_name: self.kind.class_name(),
            world_bounds: node.world_bounds,
            parent_id: node.parent.as_ref().and_then(Weak::upgrade).map(|p| p.id),
            local_transform: node.local_transform,
            name: node.name.clone(),
        }
    }

    // ========================================================================
    // Listeners and view ownership
    // ========================================================================

    pub(crate) fn add_transform_listener(&self, listener: Arc<dyn TransformChangeListener>) {
        self.transform_listeners.write().push(listener);
    }

    pub(crate) fn remove_transform_listener(&self, listener: &Arc<dyn TransformChangeListener>) -> bool {
        let mut listeners = self.transform_listeners.write();
        let before = listeners.len();
        listeners.retain(|known| !Arc::ptr_eq(known, listener));
        listeners.len() != before
    }

    pub(crate) fn transform_listeners(&self) -> Vec<Arc<dyn TransformChangeListener>> {
        self.transform_listeners.read().clone()
    }

    pub(crate) fn add_view_update_listener(&self, listener: Arc<dyn ViewUpdateListener>) {
        self.view_update_listeners.write().push(listener);
    }

    pub(crate) fn remove_view_update_listener(&self, listener: &Arc<dyn ViewUpdateListener>) -> bool {
        let mut listeners = self.view_update_listeners.write();
        let before = listeners.len();
        listeners.retain(|known| !Arc::ptr_eq(known, listener));
        listeners.len() != before
    }

    pub(crate) fn view_update_listeners(&self) -> Vec<Arc<dyn ViewUpdateListener>> {
        self.view_update_listeners.read().clone()
    }

    /// Cache owned by this view cell while its avatar is logged in
    pub fn view_cache(&self) -> Option<Arc<ViewCache>> {
        self.view_cache.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_view_cache(&self, cache: Option<&Arc<ViewCache>>) {
        *self.view_cache.write() = cache.map(Arc::downgrade);
    }
}

impl fmt::Debug for SpatialCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpatialCell")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("persistent_ref", &self.persistent_ref)
            .finish_non_exhaustive()
    }
}
