//! Connection-routing frontend for a realtime channel service.
//!
//! A master process accepts client connections and hands each one to a
//! worker process chosen by a sticky hash of the client IP. Workers speak
//! the client event protocol, resolve which backend owns each channel via a
//! shared store, and relay traffic over one pooled link per backend.

pub mod cluster;
pub mod config;
pub mod ids;
pub mod protocol;
pub mod routing;
pub mod store;
pub mod transport;
