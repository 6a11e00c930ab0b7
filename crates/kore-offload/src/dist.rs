//! Process-group collaborator used by drivers around offload/restore.
//!
//! The engine itself never synchronises; a training loop brackets
//! `offload` and `restore` with [`ProcessGroup::barrier`] so every rank
//! relocates at the same point in the step.

use std::fmt;
use std::sync::{Arc, Barrier};

/// Minimal collective interface for one rank.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Block until every rank of the group reaches the barrier.
    fn barrier(&self);
}

/// In-process group whose ranks are threads.
#[derive(Clone)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    barrier: Arc<Barrier>,
}

impl ThreadGroup {
    /// One handle per rank, all sharing the same barrier.
    pub fn new(world_size: usize) -> Vec<ThreadGroup> {
        let world_size = world_size.max(1);
        let barrier = Arc::new(Barrier::new(world_size));
        (0..world_size)
            .map(|rank| ThreadGroup { rank, world_size, barrier: barrier.clone() })
            .collect()
    }
}

impl fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn barrier(&self) {
        self.barrier.wait();
    }
}
