//! # Patchlog Protocol
//!
//! Data model and wire types for the patch log replication protocol.
//!
//! This crate defines:
//! - [`Version`] - 1-based monotonic log positions with UNSET/INIT sentinels
//! - [`Id`] / [`RegToken`] - identifiers and registration credentials
//! - [`Patch`] - immutable change units (headers + opaque body)
//! - [`DataSourceDescription`] / [`PatchLogInfo`] - log identity and extent
//! - [`Link`] - the transport-agnostic client operation set
//! - The RPC envelope used for registration, listing and admin calls
//! - [`LinkError`] - the shared error taxonomy for Link operations

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod id;
mod link;
mod patch;
mod rpc;
mod source;
mod version;

pub use error::{LinkError, LinkResult, ProtocolError, ProtocolResult};
pub use id::{Id, RegToken};
pub use link::Link;
pub use patch::{Patch, HEADER_ID, HEADER_PREVIOUS};
pub use rpc::{CreateDataSourceArg, DataSourceArg, DescribeArg, RpcOp, RpcRequest};
pub use source::{is_valid_name, validate_name, DataSourceDescription, PatchLogInfo};
pub use version::Version;
