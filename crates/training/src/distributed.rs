//! Synchronisation between data-parallel workers.
//!
//! Batching, masking and sampling never touch this module; only the
//! evaluation controller and the start-up sharding step do.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::TrainingError;

pub trait SyncPort: Send + Sync {
    fn rank(&self) -> usize;
    fn world_size(&self) -> usize;

    fn is_primary_rank(&self) -> bool {
        self.rank() == 0
    }

    /// Blocks until every rank has called it.
    fn barrier(&self) -> Result<(), TrainingError>;

    /// Every rank returns the primary rank's `value`. Acts as a barrier.
    fn broadcast_flag(&self, value: bool) -> Result<bool, TrainingError>;
}

/// The only worker of a single-process run.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl SyncPort for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        Ok(())
    }

    fn broadcast_flag(&self, value: bool) -> Result<bool, TrainingError> {
        Ok(value)
    }
}

struct GroupShared {
    barrier: Barrier,
    flag: Mutex<bool>,
}

/// One member of an in-process group of workers running on separate threads.
#[derive(Clone)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<GroupShared>,
}

impl ThreadGroup {
    /// Creates the handles for a group of `world_size` ranks, ordered by rank.
    pub fn new(world_size: usize) -> Result<Vec<ThreadGroup>, TrainingError> {
        if world_size == 0 {
            return Err(TrainingError::initialization(
                "a worker group needs at least one rank",
            ));
        }
        let shared = Arc::new(GroupShared {
            barrier: Barrier::new(world_size),
            flag: Mutex::new(false),
        });
        Ok((0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                world_size,
                shared: Arc::clone(&shared),
            })
            .collect())
    }
}

impl SyncPort for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) -> Result<(), TrainingError> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn broadcast_flag(&self, value: bool) -> Result<bool, TrainingError> {
        if self.is_primary_rank() {
            *self
                .shared
                .flag
                .lock()
                .map_err(|_| TrainingError::runtime("worker group flag lock poisoned"))? = value;
        }
        self.shared.barrier.wait();
        let shared = *self
            .shared
            .flag
            .lock()
            .map_err(|_| TrainingError::runtime("worker group flag lock poisoned"))?;
        // Nobody may publish the next value until every rank has read this one.
        self.shared.barrier.wait();
        Ok(shared)
    }
}
