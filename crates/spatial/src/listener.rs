//! Observers of cell movement.

use std::sync::Arc;

use crate::error::SpatialResult;
use crate::executor::TransactionalTask;
use crate::math::CellTransform;
use crate::types::CellId;

/// Notified each time a view that has the listener's cell loaded moves.
///
/// Called on the cache drain, outside every cell and cache lock.
pub trait ViewUpdateListener: Send + Sync {
    fn view_moved(&self, cell: CellId, view: CellId, view_world: &CellTransform);
}

impl<F> ViewUpdateListener for F
where
    F: Fn(CellId, CellId, &CellTransform) + Send + Sync,
{
    fn view_moved(&self, cell: CellId, view: CellId, view_world: &CellTransform) {
        self(cell, view, view_world)
    }
}

/// Notified, inside a scheduled transaction, after a cell's world
/// transform changed.
pub trait TransformChangeListener: Send + Sync {
    fn transform_changed(&self, cell: CellId, local: &CellTransform, world: &CellTransform);
}

impl<F> TransformChangeListener for F
where
    F: Fn(CellId, &CellTransform, &CellTransform) + Send + Sync,
{
    fn transform_changed(&self, cell: CellId, local: &CellTransform, world: &CellTransform) {
        self(cell, local, world)
    }
}

/// Deferred transform notification for one cell
pub(crate) struct TransformNotice {
    pub(crate) cell: CellId,
    pub(crate) local: CellTransform,
    pub(crate) world: CellTransform,
    pub(crate) listeners: Vec<Arc<dyn TransformChangeListener>>,
}

impl TransactionalTask for TransformNotice {
    fn name(&self) -> &str {
        "transform-notice"
    }

    fn run(self: Box<Self>) -> SpatialResult<()> {
        for listener in &self.listeners {
            listener.transform_changed(self.cell, &self.local, &self.world);
        }
        Ok(())
    }
}
