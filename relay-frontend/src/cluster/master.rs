//! Master process: listeners, admission, dispatch and worker supervision.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::pool::{WorkerExit, WorkerPool};
use super::sticky::{forwarded_header, resolve_client_ip, sticky_hash};
use super::{ClusterError, Role, WORKER_FATAL};
use crate::config::FrontendConfig;
use crate::protocol::HandoffMessage;
use crate::store::pool::{PoolEntryHandle, PoolEntryUpdater};

/// Most bytes the master reads from a new connection before handing it off.
pub const FIRST_DATA_LIMIT: usize = 16 * 1024;

pub struct Master {
    config: Arc<FrontendConfig>,
    pool: Arc<Mutex<WorkerPool>>,
    exits: mpsc::UnboundedReceiver<WorkerExit>,
    listeners: Vec<JoinHandle<()>>,
    pool_entries: Vec<PoolEntryHandle>,
}

impl Master {
    pub fn new(config: FrontendConfig) -> Self {
        let (exit_tx, exits) = mpsc::unbounded_channel();
        let pool = WorkerPool::new(config.process_count, exit_tx);
        Self {
            config: Arc::new(config),
            pool: Arc::new(Mutex::new(pool)),
            exits,
            listeners: Vec::new(),
            pool_entries: Vec::new(),
        }
    }

    /// Spawn the workers, then start accepting on every listener.
    pub async fn initialize(&mut self) -> Result<(), ClusterError> {
        if !Role::detect()?.is_master() {
            return Err(ClusterError::NotMaster);
        }

        tracing::info!("Spawning {} workers", self.config.process_count);
        {
            let mut pool = self.pool.lock();
            for slot in 0..pool.size() {
                pool.spawn(slot)?;
            }
        }

        for listener in &self.config.web.listeners {
            let addr = listener.bind_addr();
            let tcp = TcpListener::bind(&addr)
                .await
                .map_err(|source| ClusterError::Bind { addr: addr.clone(), source })?;
            tracing::info!(tls = listener.tls, "Listening on {addr}");
            self.listeners.push(tokio::spawn(accept_loop(
                tcp,
                listener.tls,
                self.config.clone(),
                self.pool.clone(),
            )));
        }

        self.register_in_pool().await;
        Ok(())
    }

    /// Advertise every listener in the frontend pool. Routing does not
    /// depend on this, so a store outage only costs the registration.
    async fn register_in_pool(&mut self) {
        let conn = match crate::store::connect(&self.config.redis.url).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("Frontend pool registration skipped: {e}");
                return;
            }
        };
        let interval = std::time::Duration::from_millis(self.config.pool.update_interval_ms);
        for listener in &self.config.web.listeners {
            let address = listener.advertised_addr();
            let entry_id = format!("{}-{}", self.config.node_name.as_deref().unwrap_or("frontend"), address);
            tracing::info!(pool = %self.config.pool.frontend_pool, %address, "Registering in frontend pool");
            self.pool_entries.push(
                PoolEntryUpdater::new(conn.clone(), &self.config.pool.frontend_pool, entry_id, address, interval)
                    .start(),
            );
        }
    }

    /// Run the master until interrupted or a worker reports a fatal error.
    pub async fn run(mut self) -> Result<()> {
        self.initialize().await.context("Master initialization failed")?;
        let result = loop {
            tokio::select! {
                exit = self.exits.recv() => {
                    let Some(exit) = exit else {
                        break Ok(());
                    };
                    if let Err(e) = self.on_worker_exit(exit) {
                        break Err(e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, shutting down");
                    break Ok(());
                }
            }
        };
        self.shutdown().await;
        result.map_err(anyhow::Error::from)
    }

    fn on_worker_exit(&mut self, exit: WorkerExit) -> Result<(), ClusterError> {
        let WorkerExit { slot, generation, code } = exit;
        if code == Some(WORKER_FATAL) {
            tracing::error!(slot, "Worker reported a fatal error, stopping the cluster");
            return Err(ClusterError::WorkerFatal(format!("worker {slot} exited with code {WORKER_FATAL}")));
        }
        let mut pool = self.pool.lock();
        if !pool.remove(slot, generation) {
            return Ok(());
        }
        tracing::error!(slot, ?code, "Worker exited, respawning");
        if let Err(e) = pool.spawn(slot) {
            tracing::error!(slot, "Respawn failed, slot left empty: {e}");
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        self.pool.lock().terminate_all();
        for entry in self.pool_entries.drain(..) {
            entry.stop().await;
        }
    }
}

async fn accept_loop(listener: TcpListener, tls: bool, config: Arc<FrontendConfig>, pool: Arc<Mutex<WorkerPool>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(admit(stream, peer, tls, config.clone(), pool.clone()));
            }
            Err(e) => tracing::warn!("Accept failed: {e}"),
        }
    }
}

/// Read a new connection's first bytes, pick its worker and hand it off.
pub(crate) async fn admit(
    mut stream: TcpStream,
    peer: SocketAddr,
    tls: bool,
    config: Arc<FrontendConfig>,
    pool: Arc<Mutex<WorkerPool>>,
) {
    let mut initial = vec![0u8; FIRST_DATA_LIMIT];
    let n = match tokio::time::timeout(config.first_data_timeout(), stream.read(&mut initial)).await {
        Ok(Ok(0)) => {
            tracing::debug!(%peer, "Connection closed before sending data");
            return;
        }
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            tracing::debug!(%peer, "First read failed: {e}");
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, "No data before admission timeout, dropping");
            return;
        }
    };
    initial.truncate(n);

    // TLS bytes are opaque here, so only plain connections can carry a
    // forwarded header.
    let forwarded = if tls { None } else { forwarded_header(&initial) };
    let ip = resolve_client_ip(peer.ip(), forwarded.as_deref(), |ip| config.is_trusted_proxy(ip)).to_string();

    let (slot, handoff) = {
        let pool = pool.lock();
        let slot = sticky_hash(&ip, pool.size());
        (slot, pool.handoff_for(slot))
    };
    let Some(handoff) = handoff else {
        tracing::warn!(slot, %ip, "No live worker in slot, closing connection");
        return;
    };

    let stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(%ip, "Could not detach connection: {e}");
            return;
        }
    };
    let message = HandoffMessage::connection(&initial, ip.clone(), tls);
    match handoff.send(&message, &stream).await {
        Ok(()) => tracing::debug!(slot, %ip, "Handed off connection"),
        Err(e) => tracing::warn!(slot, %ip, "Handoff failed: {e}"),
    }
    // Our copy of the descriptor closes here; the worker holds its own.
}
