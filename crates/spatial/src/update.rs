//! Cache updates and the deltas they turn into.
//!
//! Producers push [`CacheUpdate`] commands onto a view cache; the drain
//! converts each into at most one [`Delta`] for the client.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::cell::SpatialCell;
use crate::math::{Bounds, CellTransform};
use crate::space::{Space, SpaceId};
use crate::types::CellId;

/// Command queued on a view cache. Consumed exactly once by the drain.
pub enum CacheUpdate {
    /// The view's own cell moved
    ViewMoved { world: CellTransform },
    /// A cell the cache may care about moved
    CellMoved {
        cell: Arc<SpatialCell>,
        world: CellTransform,
    },
    EnterSpace { space: Arc<Space> },
    ExitSpace { space: Arc<Space> },
    /// A root was indexed into `space`, or a subtree was attached under
    /// `parent`
    CellAdded {
        cell: Arc<SpatialCell>,
        parent: Option<Arc<SpatialCell>>,
        space: Option<SpaceId>,
    },
    /// A root left `space`, or a subtree was detached from `parent`
    CellRemoved {
        cell: Arc<SpatialCell>,
        parent: Option<Arc<SpatialCell>>,
        space: Option<SpaceId>,
    },
    CellRevalidated { cell: Arc<SpatialCell> },
    CacheRevalidated,
}

impl CacheUpdate {
    pub fn kind(&self) -> UpdateKind {
        match self {
            CacheUpdate::ViewMoved { .. } => UpdateKind::ViewMoved,
            CacheUpdate::CellMoved { .. } => UpdateKind::CellMoved,
            CacheUpdate::EnterSpace { .. } => UpdateKind::EnterSpace,
            CacheUpdate::ExitSpace { .. } => UpdateKind::ExitSpace,
            CacheUpdate::CellAdded { .. } => UpdateKind::CellAdded,
            CacheUpdate::CellRemoved { .. } => UpdateKind::CellRemoved,
            CacheUpdate::CellRevalidated { .. } => UpdateKind::CellRevalidated,
            CacheUpdate::CacheRevalidated => UpdateKind::CacheRevalidated,
        }
    }
}

impl fmt::Debug for CacheUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheUpdate::ViewMoved { world } => f
                .debug_struct("ViewMoved")
                .field("translation", &world.translation)
                .finish(),
            CacheUpdate::CellMoved { cell, .. } | CacheUpdate::CellRevalidated { cell } => f
                .debug_struct(self.kind().as_str())
                .field("cell", &cell.id())
                .finish(),
            CacheUpdate::EnterSpace { space } | CacheUpdate::ExitSpace { space } => f
                .debug_struct(self.kind().as_str())
                .field("space", &space.id())
                .finish(),
            CacheUpdate::CellAdded { cell, parent, space }
            | CacheUpdate::CellRemoved { cell, parent, space } => f
                .debug_struct(self.kind().as_str())
                .field("cell", &cell.id())
                .field("parent", &parent.as_ref().map(|p| p.id()))
                .field("space", space)
                .finish(),
            CacheUpdate::CacheRevalidated => f.write_str("CacheRevalidated"),
        }
    }
}

/// Tag of a [`CacheUpdate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateKind {
    ViewMoved,
    CellMoved,
    EnterSpace,
    ExitSpace,
    CellAdded,
    CellRemoved,
    CellRevalidated,
    CacheRevalidated,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::ViewMoved => "VIEW_MOVED",
            UpdateKind::CellMoved => "CELL_MOVED",
            UpdateKind::EnterSpace => "ENTER_SPACE",
            UpdateKind::ExitSpace => "EXIT_SPACE",
            UpdateKind::CellAdded => "CELL_ADDED",
            UpdateKind::CellRemoved => "CELL_REMOVED",
            UpdateKind::CellRevalidated => "CELL_REVALIDATED",
            UpdateKind::CacheRevalidated => "CACHE_REVALIDATED",
        }
    }
}

impl fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the client must do with a batch of cells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaKind {
    Load,
    Unload,
    Revalidate,
}

impl fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeltaKind::Load => "LOAD",
            DeltaKind::Unload => "UNLOAD",
            DeltaKind::Revalidate => "REVALIDATE",
        })
    }
}

/// Snapshot of one cell as sent to a client cache.
///
/// Unload and revalidate receivers only need `cell_id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellDescription {
    pub cell_id: CellId,
    pub class_name: &'static str,
    pub world_bounds: Bounds,
    pub parent_id: Option<CellId>,
    pub local_transform: CellTransform,
    pub name: Option<String>,
}

/// Batch produced by a single cache update.
///
/// Cells are listed parents first.
#[derive(Debug, Clone)]
pub struct Delta {
    pub kind: DeltaKind,
    pub view: CellId,
    pub cause: UpdateKind,
    pub cells: Vec<CellDescription>,
}

impl Delta {
    pub fn cell_ids(&self) -> Vec<CellId> {
        self.cells.iter().map(|cell| cell.cell_id).collect()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
