//! Process topology: one master that owns the listening sockets and a fixed
//! pool of worker processes that own client sessions.
//!
//! The master never speaks the client protocol. It reads just enough of a
//! new connection to learn the client IP, hashes that IP to a worker slot
//! and passes the raw descriptor over that worker's handoff socket. The
//! same client IP therefore always lands on the same worker while the pool
//! size is unchanged.

pub mod handoff;
pub mod master;
pub mod pool;
pub mod sticky;
pub mod worker;

use std::os::fd::RawFd;

/// Exit code a worker uses to report an unrecoverable error. The master
/// stops the whole cluster instead of respawning.
pub const WORKER_FATAL: i32 = 55;

/// Set in a worker's environment to its pool slot.
pub const WORKER_SLOT_ENV: &str = "RELAY_WORKER_SLOT";
/// Set in a worker's environment to its inherited handoff descriptor.
pub const HANDOFF_FD_ENV: &str = "RELAY_HANDOFF_FD";

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("this process is a worker, not the master")]
    NotMaster,
    #[error("invalid worker environment: {0}")]
    BadWorkerEnv(String),
    #[error("failed to spawn worker {slot}: {source}")]
    Spawn {
        slot: usize,
        source: std::io::Error,
    },
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("fatal worker error: {0}")]
    WorkerFatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker { slot: usize, handoff_fd: RawFd },
}

impl Role {
    /// Determine this process's role from its environment.
    pub fn detect() -> Result<Self, ClusterError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ClusterError> {
        let Some(slot) = lookup(WORKER_SLOT_ENV) else {
            return Ok(Self::Master);
        };
        let slot = slot
            .parse()
            .map_err(|_| ClusterError::BadWorkerEnv(format!("{WORKER_SLOT_ENV}={slot}")))?;
        let fd = lookup(HANDOFF_FD_ENV)
            .ok_or_else(|| ClusterError::BadWorkerEnv(format!("{HANDOFF_FD_ENV} is not set")))?;
        let handoff_fd = fd
            .parse()
            .map_err(|_| ClusterError::BadWorkerEnv(format!("{HANDOFF_FD_ENV}={fd}")))?;
        Ok(Self::Worker { slot, handoff_fd })
    }

    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master)
    }
}
