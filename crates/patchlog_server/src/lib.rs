//! # Patchlog Server
//!
//! The server side of the patch log replication protocol: append-only
//! versioned logs of patches, one per data source, behind a pluggable
//! persistence layer.
//!
//! The pieces, bottom up:
//! - [`storage`] - content-addressed patch bodies (memory, file)
//! - [`index`] - the per-log sequencing authority (memory, file)
//! - [`coord`] / [`coord_index`] - coordination-service-backed variants
//!   for multi-server deployments
//! - [`log`] - one append-only [`log::PatchLog`] combining index + storage
//! - [`store`] - the live log set and the [`store::PatchStoreProvider`] seam
//! - [`server`] - registration-gated operations and an in-process
//!   [`patchlog_protocol::Link`]
//! - [`handler`] - HTTP-shaped request dispatch

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod coord;
pub mod coord_index;
pub mod error;
pub mod handler;
pub mod index;
pub mod lock;
pub mod log;
pub mod registration;
pub mod server;
pub mod storage;
pub mod store;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{HttpHandler, WireResponse};
pub use log::PatchLog;
pub use server::{LocalLink, LocalServer};
pub use store::{CoordProvider, LocalProvider, MemoryProvider, PatchStore};
