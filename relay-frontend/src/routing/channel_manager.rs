//! Channels held by this worker and the joins in flight towards them.
//!
//! Resolution is single-flight per channel name: the first join starts one
//! lookup in the background and later joins for the same name just wait on
//! it. The result comes back to the routing core as
//! [`WorkerEvent::ChannelResolved`], where every waiter still connected is
//! bound to the channel in the order it asked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use super::backend::BackendConnectionManager;
use super::channel::{Channel, Membership};
use super::socket_manager::SocketManager;
use super::{FrontendError, WorkerEvent};
use crate::store::resolver::{ChannelResolver, ResolveError};

/// Longest a store call may take before its waiters are released.
pub const STORE_CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ChannelManager {
    node_id: String,
    channels: HashMap<String, Channel>,
    /// Channel name → sockets waiting for its resolution, in request order.
    pending: HashMap<String, Vec<String>>,
    /// Backend address → channels currently routed over it.
    connection_channels: HashMap<String, Vec<String>>,
    backends: BackendConnectionManager,
    resolver: Arc<dyn ChannelResolver>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    fatal_on_no_backend: bool,
}

impl ChannelManager {
    pub fn new(
        node_id: impl Into<String>,
        resolver: Arc<dyn ChannelResolver>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        fatal_on_no_backend: bool,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            channels: HashMap::new(),
            pending: HashMap::new(),
            connection_channels: HashMap::new(),
            backends: BackendConnectionManager::new(events.clone()),
            resolver,
            events,
            fatal_on_no_backend,
        }
    }

    /// Bind a socket to `name`, resolving the channel first if this worker
    /// does not hold it yet.
    pub fn on_socket_join_channel(&mut self, sockets: &mut SocketManager, socket_id: &str, name: &str) {
        if self.channels.contains_key(name) {
            self.bind(sockets, socket_id, name);
            return;
        }
        if let Some(waiters) = self.pending.get_mut(name) {
            waiters.push(socket_id.to_string());
            return;
        }
        self.pending.insert(name.to_string(), vec![socket_id.to_string()]);

        let resolver = self.resolver.clone();
        let events = self.events.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(STORE_CALL_TIMEOUT, resolver.resolve(&name)).await {
                Ok(result) => result,
                Err(_) => Err(ResolveError::TimedOut {
                    channel: name.clone(),
                    after: STORE_CALL_TIMEOUT,
                }),
            };
            let _ = events.send(WorkerEvent::ChannelResolved { name, result });
        });
    }

    /// Complete the single in-flight resolution for `name`.
    pub fn on_channel_resolved(
        &mut self,
        sockets: &mut SocketManager,
        name: &str,
        result: Result<String, ResolveError>,
    ) -> Result<(), FrontendError> {
        let waiters = self.pending.remove(name).unwrap_or_default();
        let address = match result {
            Ok(address) => address,
            Err(e) => {
                // Waiters keep their buffered events and may try again.
                for id in &waiters {
                    if let Some(socket) = sockets.get_mut(id) {
                        socket.pending_join = false;
                    }
                }
                return match e {
                    ResolveError::NoBackendAvailable(_) if self.fatal_on_no_backend => {
                        tracing::error!(channel = %name, "No backend available to own channel");
                        Err(FrontendError::Fatal(e.to_string()))
                    }
                    e => {
                        tracing::warn!(channel = %name, waiters = waiters.len(), "Channel resolution failed: {e}");
                        Ok(())
                    }
                };
            }
        };

        if !self.channels.contains_key(name) {
            self.create_channel(name, &address);
        }
        for id in &waiters {
            self.bind(sockets, id, name);
        }
        // Every waiter may have left while the lookup ran.
        if self.channels.get(name).is_some_and(Channel::is_empty) {
            self.on_channel_empty(name);
        }
        Ok(())
    }

    fn create_channel(&mut self, name: &str, address: &str) {
        let connection = self.backends.connect(address);
        self.connection_channels
            .entry(address.to_string())
            .or_default()
            .push(name.to_string());
        self.channels
            .insert(name.to_string(), Channel::new(name, self.node_id.clone(), connection));
        tracing::info!(channel = %name, backend = %address, "Channel created");
    }

    fn bind(&mut self, sockets: &mut SocketManager, socket_id: &str, name: &str) {
        let Some(socket) = sockets.get_mut(socket_id) else {
            tracing::debug!(socket = %socket_id, channel = %name, "Socket left before its join completed");
            return;
        };
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        socket.pending_join = false;
        socket.channel = Some(name.to_string());
        channel.on_socket_join(socket);
    }

    pub fn on_socket_event(&self, channel: &str, socket_id: &str, event: String, args: Vec<Value>) {
        match self.channels.get(channel) {
            Some(channel) => channel.on_socket_event(socket_id, event, args),
            None => tracing::warn!(%channel, socket = %socket_id, "Event for a channel this worker no longer holds"),
        }
    }

    pub fn on_socket_disconnect(&mut self, channel: &str, socket_id: &str) {
        let Some(held) = self.channels.get_mut(channel) else {
            return;
        };
        if held.on_socket_disconnect(socket_id) == Membership::Empty {
            self.on_channel_empty(channel);
        }
    }

    /// Drop an empty channel, releasing its backend link if nothing else
    /// uses it.
    fn on_channel_empty(&mut self, name: &str) {
        let Some(channel) = self.channels.remove(name) else {
            return;
        };
        let address = channel.connection().address().to_string();
        let last_on_connection = match self.connection_channels.get_mut(&address) {
            Some(names) => {
                names.retain(|n| n != name);
                names.is_empty()
            }
            None => true,
        };
        tracing::info!(channel = %name, backend = %address, "Channel empty, released");
        if last_on_connection {
            self.connection_channels.remove(&address);
            self.backends.disconnect(channel.connection());
        }
    }

    /// A backend link closed underneath us: discard every channel on it and
    /// disconnect their members.
    pub fn on_backend_disconnect(&mut self, sockets: &mut SocketManager, address: &str, connection_id: u64) {
        if !self.backends.forget_closed(address, connection_id) {
            tracing::debug!(backend = %address, conn = connection_id, "Ignoring close of a released link");
            return;
        }
        let names = self.connection_channels.remove(address).unwrap_or_default();
        for name in names {
            if let Some(mut channel) = self.channels.remove(&name) {
                channel.on_backend_disconnect(sockets);
            }
        }
    }

    /// Whether a frame from `address`/`connection_id` comes from a live link.
    pub fn is_current_backend(&self, address: &str, connection_id: u64) -> bool {
        self.backends
            .get(address)
            .is_some_and(|conn| conn.id() == connection_id)
    }

    /// `(channel, backend address)` for every channel held here.
    pub fn owned_routes(&self) -> Vec<(String, String)> {
        self.channels
            .values()
            .map(|c| (c.name().to_string(), c.connection().address().to_string()))
            .collect()
    }

    /// Refresh ownership records of held channels in the background.
    pub fn renew_ownership(&self) {
        let routes = self.owned_routes();
        if routes.is_empty() {
            return;
        }
        let resolver = self.resolver.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(STORE_CALL_TIMEOUT, resolver.renew(&routes)).await {
                Ok(Ok(renewed)) => tracing::debug!(renewed, held = routes.len(), "Renewed channel ownership"),
                Ok(Err(e)) => tracing::warn!("Channel ownership renewal failed: {e}"),
                Err(_) => tracing::warn!(held = routes.len(), "Channel ownership renewal timed out"),
            }
        });
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn channels_on(&self, address: &str) -> &[String] {
        self.connection_channels
            .get(address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_resolving(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }
}
