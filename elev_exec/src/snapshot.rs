//! # Snapshot Manager
//!
//! Holds the most recent copy of the map which is shared with every reader. Readers only ever see
//! a complete snapshot, a new one is swapped in atomically under the snapshot lock.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    cell::RefCell,
    sync::{Arc, Mutex, PoisonError},
};

use parking_lot::ReentrantMutex;

use crate::map::{GridMap, MapEngine};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Default)]
pub struct SnapshotManager {
    current: ReentrantMutex<RefCell<Option<Arc<GridMap>>>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("The engine lock is poisoned")]
    PoisonError,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<G> From<PoisonError<G>> for SnapshotError {
    fn from(_: PoisonError<G>) -> Self {
        Self::PoisonError
    }
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the engine's map into a new snapshot.
    ///
    /// The snapshot lock is taken before the engine lock.
    pub fn refresh<E: MapEngine>(
        &self,
        engine: &Mutex<E>,
        frame_id: &str,
    ) -> Result<Arc<GridMap>, SnapshotError> {
        let guard = self.current.lock();

        let snapshot = Arc::new(engine.lock()?.snapshot(frame_id));
        guard.replace(Some(snapshot.clone()));

        Ok(snapshot)
    }

    /// The most recent snapshot, if one has been taken.
    pub fn current(&self) -> Option<Arc<GridMap>> {
        self.current.lock().borrow().clone()
    }

    /// Copy of a single layer of the current snapshot.
    ///
    /// Returns `None` if there is no snapshot yet or it has no layer named `name`.
    pub fn layer_snapshot(&self, name: &str) -> Option<GridMap> {
        let _guard = self.current.lock();

        self.current()
            .filter(|map| map.exists(name))
            .map(|map| map.with_layers(&[name]))
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::map::{BinningEngine, BinningEngineParams, ELEVATION, IS_VALID};

    #[test]
    fn test_snapshot_manager() {
        let manager = SnapshotManager::new();
        let engine = Mutex::new(BinningEngine::new(BinningEngineParams::default()).unwrap());

        assert!(manager.current().is_none());
        assert!(manager.layer_snapshot(ELEVATION).is_none());

        let first = manager.refresh(&engine, "map").unwrap();
        assert_eq!(first.frame_id, "map");
        assert!(Arc::ptr_eq(&first, &manager.current().unwrap()));

        let elev = manager.layer_snapshot(ELEVATION).unwrap();
        assert_eq!(elev.layers(), &[ELEVATION.to_string()]);
        assert_eq!(elev.num_cells(), first.num_cells());
        assert!(manager.layer_snapshot("color").is_none());

        // Old snapshots held by readers are unaffected by a refresh
        let second = manager.refresh(&engine, "odom").unwrap();
        assert_eq!(first.frame_id, "map");
        assert_eq!(second.frame_id, "odom");
        assert!(manager.current().unwrap().exists(IS_VALID));
    }
}
