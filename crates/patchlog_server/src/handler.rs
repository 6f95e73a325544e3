//! HTTP-shaped request dispatch.
//!
//! Maps request targets onto [`LocalServer`] operations and server errors
//! onto wire statuses. Patch append and fetch are resource-style calls on
//! the log's path; registration, listing and admin travel through a single
//! `/rpc` endpoint as JSON envelopes. The handler is transport-agnostic:
//! embedding it behind a socket listener or calling it in-process for tests
//! is the caller's choice.

use crate::error::{ServerError, ServerResult};
use crate::server::LocalServer;
use patchlog_protocol::{
    CreateDataSourceArg, DataSourceArg, DescribeArg, Id, Patch, RegToken, RpcOp, RpcRequest,
    Version,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// JSON content type for responses with a structured body.
pub const CONTENT_JSON: &str = "application/json";
/// Content type for raw patch bytes.
pub const CONTENT_PATCH: &str = "application/octet-stream";

/// A wire-level response: status, content type and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireResponse {
    /// HTTP status code.
    pub status: u16,
    /// Body content type.
    pub content_type: &'static str,
    /// Response body bytes.
    pub body: Vec<u8>,
}

impl WireResponse {
    fn json(value: Value) -> Self {
        Self {
            status: 200,
            content_type: CONTENT_JSON,
            body: value.to_string().into_bytes(),
        }
    }

    fn patch(bytes: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: CONTENT_PATCH,
            body: bytes,
        }
    }

    fn error(err: &ServerError) -> Self {
        Self {
            status: err.http_status(),
            content_type: CONTENT_JSON,
            body: json!({ "error": err.to_string() }).to_string().into_bytes(),
        }
    }
}

/// Dispatches wire requests onto a [`LocalServer`].
pub struct HttpHandler {
    server: Arc<LocalServer>,
}

impl HttpHandler {
    /// Creates a handler over `server`.
    pub fn new(server: Arc<LocalServer>) -> Self {
        Self { server }
    }

    /// Handles a GET request for `target` (path plus optional query string).
    pub fn handle_get(&self, target: &str) -> WireResponse {
        match self.get(target) {
            Ok(response) => response,
            Err(e) => {
                debug!(target, "GET failed: {e}");
                WireResponse::error(&e)
            }
        }
    }

    /// Handles a POST request for `target` with `body`.
    pub fn handle_post(&self, target: &str, body: &[u8]) -> WireResponse {
        match self.post(target, body) {
            Ok(response) => response,
            Err(e) => {
                debug!(target, "POST failed: {e}");
                WireResponse::error(&e)
            }
        }
    }

    fn get(&self, target: &str) -> ServerResult<WireResponse> {
        let (path, query) = split_target(target);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["ping"] => Ok(WireResponse::json(json!({}))),
            [log] => self.get_patch(log, query),
            [log, "init-data"] => self.get_initial_data(log),
            _ => Err(ServerError::NotFound(format!("no such resource: {path}"))),
        }
    }

    fn get_patch(&self, log: &str, query: &str) -> ServerResult<WireResponse> {
        let datasource = self.resolve(log)?;
        let found = if let Some(version) = query_param(query, "version") {
            let version = version
                .parse::<i64>()
                .map_err(|_| ServerError::BadRequest(format!("bad version: {version}")))?;
            self.server.fetch_version(&datasource, Version::new(version))?
        } else if let Some(patch) = query_param(query, "patch") {
            self.server.fetch_id(&datasource, &Id::parse(patch))?
        } else {
            return Err(ServerError::BadRequest(
                "expected a version or patch query parameter".to_string(),
            ));
        };
        match found {
            Some(patch) => Ok(WireResponse::patch(patch.encode())),
            None => Err(ServerError::NotFound(format!("no such patch in {log}"))),
        }
    }

    fn get_initial_data(&self, log: &str) -> ServerResult<WireResponse> {
        let datasource = self.resolve(log)?;
        match self.server.initial_data(&datasource)? {
            Some(bytes) => Ok(WireResponse::patch(bytes)),
            None => Err(ServerError::NotFound(format!("no initial data for {log}"))),
        }
    }

    fn post(&self, target: &str, body: &[u8]) -> ServerResult<WireResponse> {
        let (path, query) = split_target(target);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["rpc"] => self.dispatch_rpc(body),
            [log] => self.post_patch(log, query, body),
            _ => Err(ServerError::NotFound(format!("no such resource: {path}"))),
        }
    }

    fn post_patch(&self, log: &str, query: &str, body: &[u8]) -> ServerResult<WireResponse> {
        let token = query_param(query, "token")
            .map(RegToken::from_string)
            .ok_or_else(|| ServerError::NotRegistered("missing token".to_string()))?;
        let datasource = self.resolve(log)?;
        let patch = Patch::decode(body)?;
        let version = self.server.append(&token, &datasource, &patch)?;
        Ok(WireResponse::json(json!({
            "version": version,
            "location": format!("/{log}?version={version}"),
        })))
    }

    fn dispatch_rpc(&self, body: &[u8]) -> ServerResult<WireResponse> {
        let request: RpcRequest = serde_json::from_slice(body)
            .map_err(|e| ServerError::BadRequest(format!("bad rpc envelope: {e}")))?;
        let result = self.rpc(&request)?;
        Ok(WireResponse::json(result))
    }

    fn rpc(&self, request: &RpcRequest) -> ServerResult<Value> {
        match request.op {
            RpcOp::Register => {
                let client = request
                    .client
                    .clone()
                    .ok_or_else(|| ServerError::BadRequest("register needs a client id".into()))?;
                let token = self.server.register(&client);
                Ok(json!({ "token": token }))
            }
            RpcOp::Deregister => {
                let token = Self::token_of(request)?;
                self.server.deregister(&token);
                Ok(json!({}))
            }
            RpcOp::IsRegistered => {
                let registered = match &request.token {
                    Some(token) => self.server.is_registered(token),
                    None => false,
                };
                Ok(json!({ "registered": registered }))
            }
            RpcOp::ListDatasources => {
                let ids: Vec<Id> = self
                    .server
                    .list_descriptions()
                    .into_iter()
                    .map(|d| d.id)
                    .collect();
                Ok(json!({ "datasources": ids }))
            }
            RpcOp::ListDescriptions => {
                Ok(json!({ "descriptions": self.server.list_descriptions() }))
            }
            RpcOp::ListPatchLogInfo => Ok(json!({ "infos": self.server.list_log_infos() })),
            RpcOp::CreateDataSource => {
                let token = Self::token_of(request)?;
                let arg: CreateDataSourceArg = request.arg_as()?;
                let source = self.server.create_datasource(&token, &arg.name, &arg.uri)?;
                Ok(serde_json::to_value(source)?)
            }
            RpcOp::RemoveDataSource => {
                let token = Self::token_of(request)?;
                let arg: DataSourceArg = request.arg_as()?;
                self.server.remove_datasource(&token, &arg.datasource)?;
                Ok(json!({}))
            }
            RpcOp::DescribeDataSource => {
                let arg: DescribeArg = request.arg_as()?;
                let found = if let Some(id) = &arg.id {
                    self.server.describe(id)
                } else if let Some(name) = &arg.name {
                    self.server.describe_by_name(name)
                } else if let Some(uri) = &arg.uri {
                    self.server.describe_by_uri(uri)
                } else {
                    return Err(ServerError::BadRequest(
                        "describe needs an id, name or uri".to_string(),
                    ));
                };
                Ok(serde_json::to_value(found)?)
            }
            RpcOp::DescribeLog => {
                let arg: DataSourceArg = request.arg_as()?;
                Ok(serde_json::to_value(self.server.log_info(&arg.datasource))?)
            }
            RpcOp::Epoch => Ok(json!({ "epoch": self.server.epoch() })),
        }
    }

    fn token_of(request: &RpcRequest) -> ServerResult<RegToken> {
        request
            .token
            .clone()
            .ok_or_else(|| ServerError::NotRegistered("missing token".to_string()))
    }

    /// Resolves a path segment naming a log, accepting either the
    /// datasource name or its id.
    fn resolve(&self, segment: &str) -> ServerResult<Id> {
        if let Some(source) = self.server.describe_by_name(segment) {
            return Ok(source.id);
        }
        let id = Id::parse(segment);
        if self.server.describe(&id).is_some() {
            return Ok(id);
        }
        Err(ServerError::NotFound(format!("no such log: {segment}")))
    }
}

fn split_target(target: &str) -> (&str, &str) {
    match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then_some(v)
    })
}
