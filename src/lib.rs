//! A federated message-routing gateway coupling cooperating agencies
//! in a privacy-preserving computation network.
//!
//! Each agency runs one [`gateway::Gateway`], which accepts messages
//! from peer gateways (over [`peer::PeerConnector`]) and local
//! computation fronts (via [`gateway::GatewayApi`]), routing each to
//! the correct local front (keyed by task id, through [`task`] and
//! [`front`]) or the correct peer agency (keyed by agency id).
//!
//! Unlike the global-thread-pool/unsafe-init pattern this crate is
//! descended from, lifetime here is explicit: a single
//! [`async_runtime::Runtime`] owns the worker pool, and every
//! long-lived component (`TaskManager`, `FrontNodeManager`,
//! `PeerConnector`, `Gateway`) is constructed from values the caller
//! holds, with no process-global mutable state.

pub mod async_runtime;
pub mod cache;
pub mod collections;
pub mod config;
pub mod error;
pub mod front;
pub mod gateway;
pub mod message;
pub mod peer;
pub mod task;

pub use error::{Error, ErrorKind, Result};
pub use gateway::{Gateway, GatewayApi};
