//! # Patchlog Client
//!
//! The client side of the patch log replication protocol:
//!
//! - [`http`] - a [`patchlog_protocol::Link`] over HTTP, behind a pluggable
//!   [`http::HttpClient`], with one transparent re-registration on 401
//! - [`switchable`] - failover across several links, switching only on
//!   connection problems
//! - [`state`] - the durable per-dataset sync cursor
//! - [`dataset`] - the [`dataset::PatchApplier`] seam to the local engine
//! - [`connection`] - sync, append and patch transactions over one log

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod dataset;
pub mod error;
pub mod http;
pub mod state;
pub mod switchable;

pub use connection::{Connection, HolePolicy, PatchTxn, SyncMode, SyncPolicy};
pub use dataset::{MemoryDataset, PatchApplier};
pub use error::{ClientError, ClientResult};
pub use http::{HttpClient, HttpLink, HttpResponse, LoopbackClient, LoopbackServer};
pub use state::DataState;
pub use switchable::SwitchableLink;
