//! RPC envelope for registration, listing and admin operations.
//!
//! Append and fetch are resource-style HTTP calls; everything else travels
//! through a single endpoint as `{op, client?, token?, arg}` with a JSON
//! result body.

use crate::error::{ProtocolError, ProtocolResult};
use crate::id::{Id, RegToken};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The operation named by an RPC envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RpcOp {
    /// Register a client, returning a token.
    Register,
    /// Invalidate the caller's token.
    Deregister,
    /// Check whether the caller's token is recognized.
    IsRegistered,
    /// List datasource ids.
    ListDatasources,
    /// List datasource descriptions.
    ListDescriptions,
    /// List per-log info snapshots.
    ListPatchLogInfo,
    /// Create a datasource and its log.
    CreateDataSource,
    /// Remove a datasource's log.
    RemoveDataSource,
    /// Describe one datasource by id, name or URI.
    DescribeDataSource,
    /// Describe one log (info snapshot) by datasource id.
    DescribeLog,
    /// Cheap current-version probe.
    Epoch,
}

/// The RPC request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Operation to perform.
    pub op: RpcOp,
    /// Calling client id, where the operation needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<Id>,
    /// Registration token, where the operation needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<RegToken>,
    /// Operation argument, shape depending on `op`.
    #[serde(default)]
    pub arg: Value,
}

impl RpcRequest {
    /// Builds an envelope with a JSON-encodable argument.
    pub fn new<A: Serialize>(op: RpcOp, arg: &A) -> ProtocolResult<Self> {
        Ok(RpcRequest {
            op,
            client: None,
            token: None,
            arg: serde_json::to_value(arg)?,
        })
    }

    /// Attaches the calling client id.
    pub fn with_client(mut self, client: Id) -> Self {
        self.client = Some(client);
        self
    }

    /// Attaches the registration token.
    pub fn with_token(mut self, token: RegToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Decodes the argument as the type the operation expects.
    pub fn arg_as<A: DeserializeOwned>(&self) -> ProtocolResult<A> {
        serde_json::from_value(self.arg.clone())
            .map_err(|e| ProtocolError::BadMessage(format!("bad arg for {:?}: {e}", self.op)))
    }
}

/// Argument for [`RpcOp::CreateDataSource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDataSourceArg {
    /// Datasource name.
    pub name: String,
    /// Datasource URI.
    pub uri: String,
}

/// Argument for [`RpcOp::DescribeDataSource`]: exactly one selector set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescribeArg {
    /// Select by datasource id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
    /// Select by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Select by URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

/// Argument naming a single datasource, used by several ops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceArg {
    /// The datasource id.
    pub datasource: Id,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let req = RpcRequest::new(
            RpcOp::CreateDataSource,
            &CreateDataSourceArg {
                name: "inventory".into(),
                uri: "http://example.org/inventory".into(),
            },
        )
        .unwrap()
        .with_client(Id::parse("client-1"))
        .with_token(RegToken::from_string("tok"));

        let json = serde_json::to_string(&req).unwrap();
        let back: RpcRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(back.op, RpcOp::CreateDataSource);
        assert_eq!(back.client, Some(Id::parse("client-1")));
        let arg: CreateDataSourceArg = back.arg_as().unwrap();
        assert_eq!(arg.name, "inventory");
    }

    #[test]
    fn op_wire_names_are_camel_case() {
        let json = serde_json::to_string(&RpcOp::ListPatchLogInfo).unwrap();
        assert_eq!(json, "\"listPatchLogInfo\"");
        let json = serde_json::to_string(&RpcOp::IsRegistered).unwrap();
        assert_eq!(json, "\"isRegistered\"");
    }

    #[test]
    fn bad_arg_is_reported() {
        let req = RpcRequest {
            op: RpcOp::Epoch,
            client: None,
            token: None,
            arg: serde_json::json!({"unexpected": true}),
        };
        assert!(req.arg_as::<DataSourceArg>().is_err());
    }
}
