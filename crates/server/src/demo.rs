//! Scripted demo world.
//!
//! Builds a plaza with a few child props and a row of towers along the x
//! axis, logs one avatar in and walks it back and forth so the log shows
//! towers loading and unloading as it passes.

use glam::Vec3;
use meridian_spatial::{
    Bounds, CacheRef, CellDescription, CellId, CellKind, CellTransform, ClientCache, Identity,
    MemoryDirectory, PersistentRef, SpatialResult, TransformChangeListener, Universe,
    ViewUpdateListener,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const DEMO_CACHE: CacheRef = CacheRef::new(1);
const AVATAR: CellId = CellId::new(1_000);
const PLAZA: CellId = CellId::new(1);
const FOUNTAIN: CellId = CellId::new(2);
const TOWER_BASE: u64 = 100;
const TOWER_SPACING: f32 = 60.0;
const WALK_EXTENT: f32 = 300.0;
const WALK_STEP: f32 = 15.0;

/// Client cache that logs every delta it receives
#[derive(Default)]
pub struct LoggingClientCache {
    loads: AtomicU64,
    unloads: AtomicU64,
    revalidations: AtomicU64,
}

impl LoggingClientCache {
    fn ids(cells: &[CellDescription]) -> Vec<String> {
        cells
            .iter()
            .map(|cell| match &cell.name {
                Some(name) => format!("{}({})", cell.cell_id, name),
                None => cell.cell_id.to_string(),
            })
            .collect()
    }

    /// (loads, unloads, revalidations) received so far
    pub fn totals(&self) -> (u64, u64, u64) {
        (
            self.loads.load(Ordering::Relaxed),
            self.unloads.load(Ordering::Relaxed),
            self.revalidations.load(Ordering::Relaxed),
        )
    }
}

impl ClientCache for LoggingClientCache {
    fn generate_load_messages(&self, view: CellId, cells: &[CellDescription]) -> SpatialResult<()> {
        self.loads.fetch_add(cells.len() as u64, Ordering::Relaxed);
        info!(%view, cells = ?Self::ids(cells), "LOAD");
        Ok(())
    }

    fn revalidate_cells(&self, view: CellId, cells: &[CellDescription]) -> SpatialResult<()> {
        self.revalidations.fetch_add(cells.len() as u64, Ordering::Relaxed);
        info!(%view, cells = ?Self::ids(cells), "REVALIDATE");
        Ok(())
    }

    fn send_unload_messages(&self, view: CellId, cells: &[CellDescription]) -> SpatialResult<()> {
        self.unloads.fetch_add(cells.len() as u64, Ordering::Relaxed);
        info!(%view, cells = ?Self::ids(cells), "UNLOAD");
        Ok(())
    }
}

fn create(
    universe: &Universe,
    id: u64,
    kind: CellKind,
    name: &str,
    position: Vec3,
    bounds: Bounds,
) -> SpatialResult<CellId> {
    let id = CellId::new(id);
    universe.create_spatial_cell(id, PersistentRef::new(id.as_u64()), kind)?;
    universe.set_cell_name(id, Some(name.to_string()))?;
    universe.set_local_bounds(id, bounds)?;
    universe.set_local_transform(id, CellTransform::from_translation(position))?;
    Ok(id)
}

/// Populate the world and log the avatar in.
pub fn build_world(universe: &Universe, directory: &MemoryDirectory) -> SpatialResult<Arc<LoggingClientCache>> {
    let system = Identity::system();

    let plaza = create(universe, PLAZA.as_u64(), CellKind::Standard, "plaza", Vec3::ZERO, Bounds::aabb(Vec3::ZERO, Vec3::new(10.0, 1.0, 10.0)))?;
    let fountain = create(universe, FOUNTAIN.as_u64(), CellKind::Standard, "fountain", Vec3::new(0.0, 1.0, 0.0), Bounds::sphere(Vec3::ZERO, 2.0))?;
    let bench = create(universe, 3, CellKind::Standard, "bench", Vec3::new(6.0, 1.0, 0.0), Bounds::aabb(Vec3::ZERO, Vec3::new(1.0, 0.5, 0.3)))?;
    universe.add_child(plaza, fountain, &system)?;
    universe.add_child(plaza, bench, &system)?;
    universe.add_root_spatial_cell(plaza, &system)?;

    let towers = (WALK_EXTENT / TOWER_SPACING) as i32;
    for i in -towers..=towers {
        if i == 0 {
            continue;
        }
        let id = TOWER_BASE + (i + towers) as u64;
        let position = Vec3::new(i as f32 * TOWER_SPACING, 0.0, 25.0);
        let tower = create(universe, id, CellKind::Standard, &format!("tower{i}"), position, Bounds::aabb(Vec3::new(0.0, 10.0, 0.0), Vec3::new(3.0, 10.0, 3.0)))?;
        universe.add_root_spatial_cell(tower, &system)?;
    }

    let fountain_listener: Arc<dyn ViewUpdateListener> =
        Arc::new(|cell: CellId, view: CellId, world: &CellTransform| {
            debug!(%cell, %view, position = ?world.translation, "Fountain sees view move");
        });
    universe.add_view_update_listener(fountain, fountain_listener)?;

    let client = Arc::new(LoggingClientCache::default());
    directory.register(DEMO_CACHE, client.clone());

    create(universe, AVATAR.as_u64(), CellKind::View, "avatar", Vec3::ZERO, Bounds::point(Vec3::ZERO))?;
    let avatar_listener: Arc<dyn TransformChangeListener> =
        Arc::new(|cell: CellId, _local: &CellTransform, world: &CellTransform| {
            debug!(%cell, position = ?world.translation, "Avatar moved");
        });
    universe.add_transform_change_listener(AVATAR, avatar_listener)?;
    universe.view_login(AVATAR, DEMO_CACHE, Identity::new("demo-avatar"))?;

    info!(cells = universe.cell_count(), "Demo world built");
    Ok(client)
}

/// Next avatar x position and walking direction
fn walk(x: f32, direction: f32) -> (f32, f32) {
    let next = x + WALK_STEP * direction;
    if next.abs() > WALK_EXTENT {
        (x - WALK_STEP * direction, -direction)
    } else {
        (next, direction)
    }
}

/// Walk the avatar every `step` until shutdown fires.
pub fn spawn_walker(
    universe: Arc<Universe>,
    step: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(step);
        let (mut x, mut direction) = (0.0_f32, 1.0_f32);
        let mut steps: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    (x, direction) = walk(x, direction);
                    let moved = universe.set_local_transform(
                        AVATAR,
                        CellTransform::from_xyz(x, 0.0, 0.0),
                    );
                    if let Err(e) = moved {
                        info!(error = %e, "Demo avatar is gone, stopping walker");
                        break;
                    }

                    steps += 1;
                    // Periodic full resync, as a reconnecting client would ask for
                    if steps % 40 == 0 {
                        universe.view_revalidate(AVATAR);
                    }
                }
            }
        }
        debug!(steps, "Demo walker stopped");
    })
}
