//! # Spaces
//!
//! The world is cut into a grid of cubic spaces. Each space indexes the live
//! root cells whose world bounds touch it and the view caches subscribed to
//! it. [`SpaceManager`] maps a bounding volume onto the spaces it overlaps,
//! creating spaces the first time a grid cell is referenced.
//!
//! Grid cells are centred on multiples of the space size: cell `i` spans
//! `[(i - 0.5) * size, (i + 0.5) * size)` on each axis.
//!
//! A single extra space, [`SpaceId::Global`], holds roots whose bounds are
//! unbounded or span more grid cells than one lookup may enumerate. Every
//! view cache enters it at login and stays subscribed until logout.

use glam::{IVec3, Vec3};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::cell::SpatialCell;
use crate::math::Bounds;
use crate::types::CellId;
use crate::view_cache::ViewCache;

/// Address of a space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceId {
    /// Cube of the world grid
    Grid(IVec3),
    /// Roots too large for the grid
    Global,
}

impl SpaceId {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self::Grid(IVec3::new(x, y, z))
    }

    /// Grid coordinate, `None` for the global space
    pub fn coords(&self) -> Option<IVec3> {
        match self {
            SpaceId::Grid(coords) => Some(*coords),
            SpaceId::Global => None,
        }
    }
}

// glam vectors are not ordered; grid spaces sort by x, then y, then z, and
// the global space sorts last
impl Ord for SpaceId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (SpaceId::Grid(a), SpaceId::Grid(b)) => a.to_array().cmp(&b.to_array()),
            (SpaceId::Grid(_), SpaceId::Global) => std::cmp::Ordering::Less,
            (SpaceId::Global, SpaceId::Grid(_)) => std::cmp::Ordering::Greater,
            (SpaceId::Global, SpaceId::Global) => std::cmp::Ordering::Equal,
        }
    }
}

impl PartialOrd for SpaceId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl From<IVec3> for SpaceId {
    fn from(coords: IVec3) -> Self {
        Self::Grid(coords)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceId::Grid(c) => write!(f, "space({},{},{})", c.x, c.y, c.z),
            SpaceId::Global => f.write_str("space(global)"),
        }
    }
}

// ============================================================================
// Space
// ============================================================================

#[derive(Default)]
struct SpaceState {
    roots: HashMap<CellId, Arc<SpatialCell>>,
    views: HashMap<CellId, Weak<ViewCache>>,
}

/// One cube of the world grid.
pub struct Space {
    id: SpaceId,
    min: Vec3,
    max: Vec3,
    state: Mutex<SpaceState>,
}

impl Space {
    fn new(id: SpaceId, min: Vec3, max: Vec3) -> Self {
        Self {
            id,
            min,
            max,
            state: Mutex::new(SpaceState::default()),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn min(&self) -> Vec3 {
        self.min
    }

    pub fn max(&self) -> Vec3 {
        self.max
    }

    /// Subscribe a view cache and return the roots indexed at that moment.
    ///
    /// Roots indexed after this call are announced to the cache through
    /// [`ViewCache::root_cell_added`], so the snapshot and the stream of
    /// announcements never leave a gap.
    pub fn subscribe(&self, cache: &Arc<ViewCache>) -> Vec<Arc<SpatialCell>> {
        let mut state = self.state.lock();
        state.views.insert(cache.view_id(), Arc::downgrade(cache));
        let mut roots: Vec<_> = state.roots.values().cloned().collect();
        roots.sort_by_key(|cell| cell.id());
        roots
    }

    pub fn unsubscribe(&self, view: CellId) {
        self.state.lock().views.remove(&view);
    }

    /// Index a root. Returns the caches that must hear about it.
    pub fn add_root(&self, cell: &Arc<SpatialCell>) -> Vec<Arc<ViewCache>> {
        let mut state = self.state.lock();
        state.roots.insert(cell.id(), Arc::clone(cell));
        Self::live_views(&mut state)
    }

    /// Drop a root from the index. Returns the caches that must hear about it.
    pub fn remove_root(&self, cell: CellId) -> Vec<Arc<ViewCache>> {
        let mut state = self.state.lock();
        if state.roots.remove(&cell).is_none() {
            return Vec::new();
        }
        Self::live_views(&mut state)
    }

    pub fn root_cells(&self) -> Vec<Arc<SpatialCell>> {
        let mut roots: Vec<_> = self.state.lock().roots.values().cloned().collect();
        roots.sort_by_key(|cell| cell.id());
        roots
    }

    pub fn contains_root(&self, cell: CellId) -> bool {
        self.state.lock().roots.contains_key(&cell)
    }

    pub fn view_caches(&self) -> Vec<Arc<ViewCache>> {
        Self::live_views(&mut self.state.lock())
    }

    fn is_empty(&self) -> bool {
        let state = self.state.lock();
        state.roots.is_empty() && state.views.is_empty()
    }

    fn live_views(state: &mut SpaceState) -> Vec<Arc<ViewCache>> {
        // Subscriptions of caches that were dropped without logging out
        state.views.retain(|_, weak| weak.strong_count() > 0);
        state.views.values().filter_map(Weak::upgrade).collect()
    }
}

impl fmt::Debug for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("id", &self.id)
            .field("min", &self.min)
            .field("max", &self.max)
            .finish()
    }
}

// ============================================================================
// Space Manager
// ============================================================================

/// Grid index from bounding volumes to spaces.
pub struct SpaceManager {
    space_size: f32,
    max_lookup: usize,
    spaces: RwLock<HashMap<SpaceId, Arc<Space>>>,
    global: Arc<Space>,
}

impl SpaceManager {
    /// `max_lookup` caps how many grid cells one lookup may enumerate.
    pub fn new(space_size: f32, max_lookup: usize) -> Self {
        Self {
            space_size,
            max_lookup,
            spaces: RwLock::new(HashMap::new()),
            global: Arc::new(Space::new(SpaceId::Global, Vec3::NEG_INFINITY, Vec3::INFINITY)),
        }
    }

    pub fn space_size(&self) -> f32 {
        self.space_size
    }

    /// The space every view is subscribed to
    pub fn global(&self) -> &Arc<Space> {
        &self.global
    }

    /// Id of the grid space containing a point
    pub fn space_id_for(&self, point: Vec3) -> SpaceId {
        SpaceId::Grid(self.grid_coords(point))
    }

    fn grid_coords(&self, point: Vec3) -> IVec3 {
        (point / self.space_size + Vec3::splat(0.5)).floor().as_ivec3()
    }

    /// Every grid space the volume touches, in x, y, z order.
    ///
    /// Spaces are created on first reference; repeated lookups return the
    /// same instances. Returns `None`, creating nothing, for non-finite
    /// bounds and for bounds that reach past the grid or span more than
    /// `max_lookup` grid cells.
    pub fn enclosing_spaces(&self, bounds: &Bounds) -> Option<Vec<Arc<Space>>> {
        if !bounds.is_finite() {
            return None;
        }

        let lo = self.grid_coords(bounds.min());
        let hi = self.grid_coords(bounds.max());
        // Saturated coordinates lie beyond the addressable grid
        if lo.min_element() == i32::MIN || hi.max_element() == i32::MAX {
            return None;
        }

        let span = |a: i32, b: i32| (i64::from(b) - i64::from(a) + 1) as u64;
        let cells = span(lo.x, hi.x)
            .checked_mul(span(lo.y, hi.y))
            .and_then(|n| n.checked_mul(span(lo.z, hi.z)));
        match cells {
            Some(n) if n <= self.max_lookup as u64 => {}
            _ => {
                debug!(?bounds, limit = self.max_lookup, "Bounds span too many spaces for a grid lookup");
                return None;
            }
        }

        let mut result = Vec::new();
        for x in lo.x..=hi.x {
            for y in lo.y..=hi.y {
                for z in lo.z..=hi.z {
                    let coords = IVec3::new(x, y, z);
                    let (min, max) = self.extent(coords);
                    if bounds.intersects_aabb(min, max) {
                        result.push(self.get_or_create(coords));
                    }
                }
            }
        }
        Some(result)
    }

    /// Grid spaces the volume touches, or the global space when it cannot
    /// be placed on the grid
    pub fn indexing_spaces(&self, bounds: &Bounds) -> Vec<Arc<Space>> {
        self.enclosing_spaces(bounds)
            .unwrap_or_else(|| vec![Arc::clone(&self.global)])
    }

    pub fn get(&self, id: SpaceId) -> Option<Arc<Space>> {
        match id {
            SpaceId::Global => Some(Arc::clone(&self.global)),
            SpaceId::Grid(_) => self.spaces.read().get(&id).cloned(),
        }
    }

    /// Grid spaces created so far
    pub fn len(&self) -> usize {
        self.spaces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.read().is_empty()
    }

    /// Evict spaces with no roots and no subscribers. Returns how many went.
    pub fn prune_empty(&self) -> usize {
        let mut spaces = self.spaces.write();
        let before = spaces.len();
        spaces.retain(|_, space| Arc::strong_count(space) > 1 || !space.is_empty());
        let pruned = before - spaces.len();
        if pruned > 0 {
            debug!(pruned, remaining = spaces.len(), "Pruned empty spaces");
        }
        pruned
    }

    fn extent(&self, coords: IVec3) -> (Vec3, Vec3) {
        let center = coords.as_vec3() * self.space_size;
        let half = Vec3::splat(self.space_size * 0.5);
        (center - half, center + half)
    }

    fn get_or_create(&self, coords: IVec3) -> Arc<Space> {
        let id = SpaceId::Grid(coords);
        if let Some(space) = self.spaces.read().get(&id) {
            return Arc::clone(space);
        }

        let (min, max) = self.extent(coords);
        let mut spaces = self.spaces.write();
        Arc::clone(
            spaces
                .entry(id)
                .or_insert_with(|| Arc::new(Space::new(id, min, max))),
        )
    }
}
