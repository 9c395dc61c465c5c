//! Shared fixtures for unit tests.

use glam::Vec3;
use std::sync::Arc;

use crate::client::{MemoryDirectory, RecordingClientCache};
use crate::config::SpatialConfig;
use crate::executor::LocalExecutor;
use crate::math::{Bounds, CellTransform};
use crate::types::{CacheRef, CellId, CellKind, Identity, PersistentRef};
use crate::universe::Universe;
use crate::view_cache::ViewCache;

pub(crate) const CLIENT: CacheRef = CacheRef::new(1);

/// Universe wired to a deterministic executor and a recording client
pub(crate) struct Fixture {
    pub(crate) universe: Universe,
    pub(crate) executor: Arc<LocalExecutor>,
    pub(crate) client: Arc<RecordingClientCache>,
}

impl Fixture {
    /// Space size 100, proximity radius 20
    pub(crate) fn new() -> Self {
        Self::with_config(
            SpatialConfig::default()
                .with_space_size(100.0)
                .with_proximity_radius(20.0),
            1024,
        )
    }

    pub(crate) fn with_config(config: SpatialConfig, capacity: usize) -> Self {
        let executor = Arc::new(LocalExecutor::new(capacity));
        let client = Arc::new(RecordingClientCache::new());
        let directory = Arc::new(MemoryDirectory::new());
        directory.register(CLIENT, client.clone());

        let universe = Universe::new(config, executor.clone(), directory).unwrap();
        Self {
            universe,
            executor,
            client,
        }
    }

    /// Detached standard cell with sphere bounds at a local position
    pub(crate) fn cell(&self, id: u64, position: Vec3, radius: f32) -> CellId {
        let id = CellId::new(id);
        self.universe
            .create_spatial_cell(id, PersistentRef::new(id.as_u64()), CellKind::Standard)
            .unwrap();
        self.universe
            .set_local_bounds(id, Bounds::sphere(Vec3::ZERO, radius))
            .unwrap();
        self.universe
            .set_local_transform(id, CellTransform::from_translation(position))
            .unwrap();
        id
    }

    /// Live root cell
    pub(crate) fn root(&self, id: u64, position: Vec3, radius: f32) -> CellId {
        let id = self.cell(id, position, radius);
        self.universe.add_root_spatial_cell(id, &Identity::system()).unwrap();
        id
    }

    /// Child cell attached under `parent`
    pub(crate) fn child(&self, parent: CellId, id: u64, offset: Vec3) -> CellId {
        let id = self.cell(id, offset, 1.0);
        self.universe.add_child(parent, id, &Identity::system()).unwrap();
        id
    }

    /// Logged-in view at a position
    pub(crate) fn view(&self, id: u64, position: Vec3) -> Arc<ViewCache> {
        let id = CellId::new(id);
        self.universe
            .create_spatial_cell(id, PersistentRef::new(id.as_u64()), CellKind::View)
            .unwrap();
        self.universe
            .set_local_transform(id, CellTransform::from_translation(position))
            .unwrap();
        self.universe
            .view_login(id, CLIENT, Identity::new(format!("user-{}", id.as_u64())))
            .unwrap();
        self.universe.view_cache(id).unwrap()
    }

    pub(crate) fn move_cell(&self, id: CellId, position: Vec3) {
        self.universe
            .set_local_transform(id, CellTransform::from_translation(position))
            .unwrap();
    }

    /// Drain caches and run tasks until both are quiet
    pub(crate) fn settle(&self) {
        loop {
            let drained = self.universe.process_pending_updates();
            let ran = self.executor.run_pending();
            if drained == 0 && ran == 0 {
                break;
            }
        }
    }
}
