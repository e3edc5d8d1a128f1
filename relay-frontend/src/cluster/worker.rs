//! Worker process: receives handed-off connections and runs the routing
//! core for the sockets on them.

use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use super::ClusterError;
use super::handoff::{HandoffChannel, HandoffError};
use crate::config::{FrontendConfig, TlsConfig};
use crate::ids;
use crate::protocol::HandoffMessage;
use crate::routing::{FrontendError, FrontendNode, WorkerEvent};
use crate::store;
use crate::store::liveness::{Heartbeat, RedisLiveness};
use crate::store::resolver::ChannelConnectionResolver;
use crate::transport::rewind::Rewind;
use crate::transport::{self, ClientAddr, ClientStream, HandoffListener};

/// Handed-off connections waiting for the HTTP layer.
const ACCEPT_BACKLOG: usize = 1024;

pub struct Worker {
    config: FrontendConfig,
    slot: usize,
    handoff_fd: RawFd,
}

impl Worker {
    pub fn new(config: FrontendConfig, slot: usize, handoff_fd: RawFd) -> Self {
        Self { config, slot, handoff_fd }
    }

    /// Run until a fatal condition. Errors wrapping
    /// [`ClusterError::WorkerFatal`] must end the process with
    /// [`super::WORKER_FATAL`].
    pub async fn run(self) -> Result<()> {
        let tls = match &self.config.tls {
            Some(tls) => Some(build_tls_acceptor(tls).map_err(|e| fatal(format!("{e:#}")))?),
            None => None,
        };

        // SAFETY: the master passed this descriptor to us and nothing else in
        // this process has adopted it.
        let handoff = unsafe { HandoffChannel::from_inherited(self.handoff_fd) }
            .map_err(|e| fatal(format!("cannot adopt handoff descriptor {}: {e}", self.handoff_fd)))?;

        let conn = store::connect(&self.config.redis.url)
            .await
            .context("Failed to connect to the coordination store")?;

        let node_id = ids::node_id(self.config.node_name.as_deref(), self.slot);
        tracing::info!(slot = self.slot, node = %node_id, "Worker started");

        let resolver = Arc::new(ChannelConnectionResolver::new(
            conn.clone(),
            &self.config.routing.ownership_key,
            &self.config.routing.backend_pool,
            self.config.routing.stale_after(),
        ));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let node = FrontendNode::new(
            node_id.clone(),
            resolver,
            event_tx.clone(),
            self.config.routing.fatal_on_no_backend,
        );

        let liveness_tx = event_tx.clone();
        let heartbeat = Heartbeat::new(
            RedisLiveness::new(conn),
            &node_id,
            self.config.liveness.interval(),
            self.config.liveness.ttl(),
        )
        .spawn(move |signal| {
            let _ = liveness_tx.send(WorkerEvent::Liveness(signal));
        });

        let (conn_tx, listener) = HandoffListener::new(ACCEPT_BACKLOG);
        let result = tokio::select! {
            r = node.run(event_rx) => match r {
                Ok(()) => Ok(()),
                Err(FrontendError::Fatal(e)) => Err(fatal(e)),
            },
            r = transport::serve(listener, event_tx) => {
                r.context("Client transport stopped")
            }
            r = receive_handoffs(handoff, tls, conn_tx) => match r {
                Err(HandoffError::Closed) => Err(fatal("handoff channel closed by master".to_string())),
                Err(e) => Err(fatal(format!("handoff channel failed: {e}"))),
                Ok(()) => Ok(()),
            },
        };
        heartbeat.abort();
        result
    }
}

fn fatal(reason: String) -> anyhow::Error {
    ClusterError::WorkerFatal(reason).into()
}

/// Whether `err` must end the worker with the fatal exit code.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<ClusterError>(), Some(ClusterError::WorkerFatal(_)))
}

fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_pem = std::fs::read(&tls.cert)
        .with_context(|| format!("Failed to read TLS cert: {}", tls.cert.display()))?;
    let key_pem = std::fs::read(&tls.key)
        .with_context(|| format!("Failed to read TLS key: {}", tls.key.display()))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificates")?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("Failed to parse TLS private key")?
        .context("No private key found in PEM file")?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS configuration")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept handoffs from the master until its end of the link closes.
async fn receive_handoffs(
    handoff: HandoffChannel,
    tls: Option<TlsAcceptor>,
    conn_tx: mpsc::Sender<(ClientStream, ClientAddr)>,
) -> Result<(), HandoffError> {
    loop {
        let (message, fd) = handoff.recv().await?;
        tokio::spawn(accept_handoff(message, fd, tls.clone(), conn_tx.clone()));
    }
}

/// Rebuild a client stream from a handoff and pass it to the HTTP layer.
async fn accept_handoff(
    message: HandoffMessage,
    fd: OwnedFd,
    tls: Option<TlsAcceptor>,
    conn_tx: mpsc::Sender<(ClientStream, ClientAddr)>,
) {
    let initial = match message.initial_bytes() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Handoff carried undecodable initial data: {e}");
            return;
        }
    };
    let HandoffMessage::Connection { real_ip, tls_connection, .. } = message;

    let std_stream = std::net::TcpStream::from(fd);
    if let Err(e) = std_stream.set_nonblocking(true) {
        tracing::warn!(ip = %real_ip, "Cannot make handed-off connection non-blocking: {e}");
        return;
    }
    let stream = match TcpStream::from_std(std_stream) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(ip = %real_ip, "Cannot register handed-off connection: {e}");
            return;
        }
    };
    let stream = Rewind::new(initial, stream);

    let client_stream = if tls_connection {
        let Some(acceptor) = tls else {
            tracing::warn!(ip = %real_ip, "TLS connection but no TLS context configured, closing");
            return;
        };
        match acceptor.accept(stream).await {
            Ok(tls_stream) => ClientStream::Tls(Box::new(tls_stream)),
            Err(e) => {
                tracing::debug!(ip = %real_ip, "TLS handshake failed: {e}");
                return;
            }
        }
    } else {
        ClientStream::Plain(stream)
    };

    let addr = ClientAddr {
        ip: real_ip,
        tls: tls_connection,
    };
    if conn_tx.send((client_stream, addr)).await.is_err() {
        tracing::warn!("Client transport is gone, dropping handed-off connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn fatal_errors_are_recognised_through_context() {
        let err = fatal("boom".into()).context("while starting");
        assert!(is_fatal(&err));
        assert!(!is_fatal(&anyhow::anyhow!("transient")));
    }

    #[test]
    fn unreadable_tls_material_is_an_error() {
        let tls = TlsConfig {
            cert: PathBuf::from("/nonexistent/cert.pem"),
            key: PathBuf::from("/nonexistent/key.pem"),
        };
        let err = build_tls_acceptor(&tls).err().unwrap();
        assert!(format!("{err:#}").contains("Failed to read TLS cert"));
    }
}
