//! The master's fixed-size, index-stable worker pool.
//!
//! Slot `i` always means "the worker responsible for IPs hashing to `i`".
//! When a worker dies its slot is refilled by a fresh process; the slot
//! count never changes, so the sticky hash keeps pointing at the same slot.

use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::mpsc;

use super::handoff::{self, HandoffChannel};
use super::{ClusterError, HANDOFF_FD_ENV, WORKER_SLOT_ENV};

/// A live worker occupying a slot.
pub struct WorkerSlot {
    /// Bumped on every spawn so exits of replaced workers are recognised.
    pub generation: u64,
    pub pid: Option<u32>,
    pub handoff: Arc<HandoffChannel>,
}

/// Reported when a worker process ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub slot: usize,
    pub generation: u64,
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

pub struct WorkerPool {
    slots: Vec<Option<WorkerSlot>>,
    exits: mpsc::UnboundedSender<WorkerExit>,
    next_generation: u64,
}

impl WorkerPool {
    pub fn new(size: usize, exits: mpsc::UnboundedSender<WorkerExit>) -> Self {
        Self {
            slots: (0..size).map(|_| None).collect(),
            exits,
            next_generation: 1,
        }
    }

    /// Number of slots, live or not. This is the sticky-hash modulus.
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Start a worker process in `slot`, replacing whatever was recorded.
    ///
    /// The child is this same executable with the same arguments; it learns
    /// its role from [`WORKER_SLOT_ENV`] and finds its end of the handoff
    /// socketpair through [`HANDOFF_FD_ENV`].
    pub fn spawn(&mut self, slot: usize) -> Result<(), ClusterError> {
        let spawn_err = |source| ClusterError::Spawn { slot, source };
        let exe = std::env::current_exe().map_err(spawn_err)?;
        let (master_end, worker_end) = handoff::socketpair().map_err(spawn_err)?;
        handoff::set_cloexec(worker_end.as_raw_fd(), false).map_err(spawn_err)?;

        let mut child = Command::new(exe)
            .args(std::env::args_os().skip(1))
            .env(WORKER_SLOT_ENV, slot.to_string())
            .env(HANDOFF_FD_ENV, worker_end.as_raw_fd().to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(spawn_err)?;
        // The child has its own copy now.
        drop(worker_end);

        let handoff = HandoffChannel::new(master_end).map_err(spawn_err)?;
        let generation = self.next_generation;
        self.next_generation += 1;
        let pid = child.id();
        tracing::info!(slot, pid, generation, "Worker spawned");

        let exits = self.exits.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(slot, "Waiting on worker failed: {e}");
                    None
                }
            };
            let _ = exits.send(WorkerExit { slot, generation, code });
        });

        self.install(
            slot,
            WorkerSlot {
                generation,
                pid,
                handoff: Arc::new(handoff),
            },
        );
        Ok(())
    }

    /// Record a worker in `slot`.
    pub fn install(&mut self, slot: usize, worker: WorkerSlot) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(worker);
        }
    }

    /// Clear `slot` if it still holds the worker of `generation`. Returns
    /// false for exits of workers that were already replaced.
    pub fn remove(&mut self, slot: usize, generation: u64) -> bool {
        let Some(entry) = self.slots.get_mut(slot) else {
            return false;
        };
        if entry.as_ref().is_some_and(|w| w.generation == generation) {
            *entry = None;
            true
        } else {
            false
        }
    }

    /// Handoff link of the worker in `slot`, if one is running.
    pub fn handoff_for(&self, slot: usize) -> Option<Arc<HandoffChannel>> {
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .map(|w| w.handoff.clone())
    }

    /// Ask every live worker to terminate.
    pub fn terminate_all(&mut self) {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            let Some(worker) = entry.take() else {
                continue;
            };
            let Some(pid) = worker.pid else {
                continue;
            };
            // SAFETY: kill has no memory-safety preconditions.
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } < 0 {
                tracing::warn!(slot, pid, "Failed to signal worker: {}", std::io::Error::last_os_error());
            } else {
                tracing::info!(slot, pid, "Worker terminated");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_worker(generation: u64) -> WorkerSlot {
        let (a, _b) = handoff::socketpair().unwrap();
        WorkerSlot {
            generation,
            pid: None,
            handoff: Arc::new(HandoffChannel::new(a).unwrap()),
        }
    }

    #[tokio::test]
    async fn size_is_fixed_regardless_of_liveness() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(4, tx);
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.live(), 0);
        pool.install(2, fake_worker(1));
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.live(), 1);
        assert!(pool.handoff_for(2).is_some());
        assert!(pool.handoff_for(0).is_none());
        assert!(pool.handoff_for(9).is_none());
    }

    #[tokio::test]
    async fn stale_exit_does_not_clear_replacement() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(2, tx);
        pool.install(0, fake_worker(1));
        pool.install(0, fake_worker(2));
        assert!(!pool.remove(0, 1));
        assert!(pool.handoff_for(0).is_some());
        assert!(pool.remove(0, 2));
        assert!(pool.handoff_for(0).is_none());
        assert!(!pool.remove(0, 2));
    }

    #[tokio::test]
    async fn install_out_of_range_is_ignored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(1, tx);
        pool.install(5, fake_worker(1));
        assert_eq!(pool.live(), 0);
    }
}
