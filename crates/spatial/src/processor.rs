//! # Cache Processor
//!
//! Background driver for every view cache of a universe.
//!
//! One tokio task ticks at the configured interval. Each tick hands every
//! cache with pending updates to the blocking pool for one drain. A cache
//! drains at most once at a time (its drain claim), so updates of one view
//! are still consumed in order by a single logical worker.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::{SpatialError, SpatialResult};
use crate::types::CellId;
use crate::view_cache::ViewCache;

/// Processor state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    /// Not started
    Idle,
    /// Ticking
    Running,
    /// Stopped; cannot be restarted
    Stopped,
}

/// Drives view-cache drains on a tokio runtime.
pub struct CacheProcessor {
    views: Arc<DashMap<CellId, Arc<ViewCache>>>,
    interval: Duration,
    state: RwLock<ProcessorState>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CacheProcessor {
    pub fn new(views: Arc<DashMap<CellId, Arc<ViewCache>>>, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            views,
            interval,
            state: RwLock::new(ProcessorState::Idle),
            shutdown_tx,
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.read()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the tick loop. Must be called from inside a tokio runtime.
    pub fn start(&self) -> SpatialResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                ProcessorState::Running => {
                    return Err(SpatialError::Runtime("cache processor already running".into()))
                }
                ProcessorState::Stopped => {
                    return Err(SpatialError::Runtime("cache processor was stopped".into()))
                }
                ProcessorState::Idle => {}
            }

            tokio::runtime::Handle::try_current()
                .map_err(|e| SpatialError::Runtime(format!("no tokio runtime: {e}")))?;
            *state = ProcessorState::Running;
        }

        let views = Arc::clone(&self.views);
        let interval = self.interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Cache processor received shutdown");
                        break;
                    }
                    _ = ticker.tick() => {
                        Self::dispatch_drains(&views);
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
        info!(interval_ms = interval.as_millis() as u64, "Cache processor started");
        Ok(())
    }

    fn dispatch_drains(views: &DashMap<CellId, Arc<ViewCache>>) {
        let ready: Vec<Arc<ViewCache>> = views
            .iter()
            .filter(|entry| entry.value().has_pending())
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for cache in ready {
            tokio::task::spawn_blocking(move || {
                let taken = cache.process_pending();
                if taken > 0 {
                    debug!(view = %cache.view_id(), updates = taken, "Drained view cache");
                }
            });
        }
    }

    /// Drain every cache once on the calling thread
    pub fn drain_all(&self) -> usize {
        let caches: Vec<Arc<ViewCache>> = self
            .views
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        caches.iter().map(|cache| cache.process_pending()).sum()
    }

    /// Stop ticking. Drains already handed to the blocking pool finish
    /// their batch.
    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state != ProcessorState::Running {
                *state = ProcessorState::Stopped;
                return;
            }
            *state = ProcessorState::Stopped;
        }

        let _ = self.shutdown_tx.send(());
        // The loop exits on the signal; nothing left to join synchronously
        drop(self.handle.lock().take());
        info!("Cache processor stopped");
    }

    /// Subscribe to the processor's shutdown signal
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor() -> CacheProcessor {
        CacheProcessor::new(Arc::new(DashMap::new()), Duration::from_millis(10))
    }

    #[test]
    fn test_start_requires_runtime() {
        let processor = processor();
        assert!(matches!(processor.start(), Err(SpatialError::Runtime(_))));
        assert_eq!(processor.state(), ProcessorState::Idle);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let processor = processor();
        processor.start().unwrap();
        assert_eq!(processor.state(), ProcessorState::Running);
        assert!(processor.start().is_err());

        processor.stop();
        assert_eq!(processor.state(), ProcessorState::Stopped);
        assert!(processor.start().is_err());
    }

    #[test]
    fn test_drain_all_empty() {
        assert_eq!(processor().drain_all(), 0);
    }
}
