//! HTTP transport for the [`Link`] operations.
//!
//! The actual HTTP stack is abstracted behind [`HttpClient`] so callers can
//! plug in whichever library they use (or none: [`LoopbackClient`] routes
//! requests straight into an in-process handler, which is how the client
//! and server crates are tested together).

use parking_lot::RwLock;
use patchlog_protocol::{
    CreateDataSourceArg, DataSourceArg, DataSourceDescription, DescribeArg, Id, Link, LinkError,
    LinkResult, Patch, PatchLogInfo, RegToken, RpcOp, RpcRequest, Version,
};
use serde_json::Value;
use tracing::debug;

/// A wire response: status code and body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
///
/// `Err` means the request never reached the server (refused, timeout,
/// DNS); a server that answered, whatever the status, is `Ok`. That split
/// is what failover and tolerant sync key off.
pub trait HttpClient: Send + Sync {
    /// Sends a GET request.
    fn get(&self, url: &str) -> Result<HttpResponse, String>;

    /// Sends a POST request.
    fn post(&self, url: &str, body: Vec<u8>, content_type: &str) -> Result<HttpResponse, String>;
}

/// A server reachable in-process, for loopback use.
pub trait LoopbackServer: Send + Sync {
    /// Handles a GET for `target` (path plus optional query).
    fn get(&self, target: &str) -> HttpResponse;

    /// Handles a POST for `target` with `body`.
    fn post(&self, target: &str, body: &[u8]) -> HttpResponse;
}

/// An [`HttpClient`] that routes requests directly to a [`LoopbackServer`].
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a client over `server`.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    fn get(&self, url: &str) -> Result<HttpResponse, String> {
        Ok(self.server.get(url))
    }

    fn post(&self, url: &str, body: Vec<u8>, _content_type: &str) -> Result<HttpResponse, String> {
        Ok(self.server.post(url, &body))
    }
}

const CONTENT_JSON: &str = "application/json";
const CONTENT_PATCH: &str = "application/octet-stream";

/// A [`Link`] over HTTP.
///
/// Holds the client identity and current registration token. When the
/// server answers 401 on an authenticated call and the client identity is
/// known, the link re-registers once and retries before surfacing the
/// error.
pub struct HttpLink<C: HttpClient> {
    base_url: String,
    client: C,
    client_id: RwLock<Option<Id>>,
    token: RwLock<Option<RegToken>>,
}

impl<C: HttpClient> HttpLink<C> {
    /// Creates an unregistered link. `base_url` has no trailing slash; an
    /// empty base is valid for loopback clients.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            client_id: RwLock::new(None),
            token: RwLock::new(None),
        }
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, target: &str) -> String {
        format!("{}{target}", self.base_url)
    }

    fn get(&self, target: &str) -> LinkResult<HttpResponse> {
        self.client
            .get(&self.url(target))
            .map_err(LinkError::Connection)
    }

    fn post(&self, target: &str, body: Vec<u8>, content_type: &str) -> LinkResult<HttpResponse> {
        self.client
            .post(&self.url(target), body, content_type)
            .map_err(LinkError::Connection)
    }

    fn rpc(&self, request: &RpcRequest) -> LinkResult<Value> {
        let body = serde_json::to_vec(request)
            .map_err(|e| LinkError::BadRequest(format!("cannot encode rpc: {e}")))?;
        let response = self.post("/rpc", body, CONTENT_JSON)?;
        if response.status != 200 {
            return Err(status_error(&response));
        }
        serde_json::from_slice(&response.body)
            .map_err(|e| LinkError::Server(format!("unreadable rpc reply: {e}")))
    }

    fn rpc_with_token(&self, op: RpcOp, arg: &impl serde::Serialize) -> LinkResult<Value> {
        let request = RpcRequest::new(op, arg)?;
        self.with_reauth(|token| self.rpc(&request.clone().with_token(token.clone())))
    }

    fn do_register(&self, client: &Id) -> LinkResult<RegToken> {
        let request = RpcRequest::new(RpcOp::Register, &Value::Null)?.with_client(client.clone());
        let reply = self.rpc(&request)?;
        let token = reply["token"]
            .as_str()
            .map(RegToken::from_string)
            .ok_or_else(|| LinkError::Server("register reply carried no token".to_string()))?;
        *self.token.write() = Some(token.clone());
        Ok(token)
    }

    /// Runs `call` with the current token, re-registering once on a 401.
    fn with_reauth<T>(&self, call: impl Fn(&RegToken) -> LinkResult<T>) -> LinkResult<T> {
        let token = self
            .token
            .read()
            .clone()
            .ok_or_else(|| LinkError::NotRegistered("link is not registered".to_string()))?;
        match call(&token) {
            Err(LinkError::NotRegistered(_)) => {
                let client = self.client_id.read().clone().ok_or_else(|| {
                    LinkError::NotRegistered("no client identity to re-register".to_string())
                })?;
                debug!(%client, "token rejected, re-registering once");
                let fresh = self.do_register(&client)?;
                call(&fresh)
            }
            other => other,
        }
    }

    fn fetch(&self, target: &str) -> LinkResult<Option<Patch>> {
        let response = self.get(target)?;
        match response.status {
            200 => {
                let patch = Patch::decode(&response.body)
                    .map_err(|e| LinkError::Server(format!("unreadable patch: {e}")))?;
                Ok(Some(patch))
            }
            404 => Ok(None),
            _ => Err(status_error(&response)),
        }
    }

    fn decode_value<T: serde::de::DeserializeOwned>(value: Value) -> LinkResult<T> {
        serde_json::from_value(value)
            .map_err(|e| LinkError::Server(format!("unreadable reply: {e}")))
    }
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(String::from))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned())
}

fn status_error(response: &HttpResponse) -> LinkError {
    let message = error_message(&response.body);
    match response.status {
        400 => LinkError::BadRequest(message),
        401 => LinkError::NotRegistered(message),
        404 => LinkError::BadRequest(message),
        _ => LinkError::Server(format!("status {}: {message}", response.status)),
    }
}

impl<C: HttpClient> Link for HttpLink<C> {
    fn register(&self, client: Id) -> LinkResult<RegToken> {
        let token = self.do_register(&client)?;
        *self.client_id.write() = Some(client);
        Ok(token)
    }

    fn deregister(&self) -> LinkResult<()> {
        let token = self.token.write().take();
        if let Some(token) = token {
            let request = RpcRequest::new(RpcOp::Deregister, &Value::Null)?.with_token(token);
            self.rpc(&request)?;
        }
        Ok(())
    }

    fn is_registered(&self) -> LinkResult<bool> {
        let token = self.token.read().clone();
        let Some(token) = token else {
            return Ok(false);
        };
        let request = RpcRequest::new(RpcOp::IsRegistered, &Value::Null)?.with_token(token);
        let reply = self.rpc(&request)?;
        Ok(reply["registered"].as_bool().unwrap_or(false))
    }

    fn ping(&self) -> LinkResult<()> {
        let response = self.get("/ping")?;
        if response.status == 200 {
            Ok(())
        } else {
            Err(status_error(&response))
        }
    }

    fn append(&self, datasource: &Id, patch: &Patch) -> LinkResult<Version> {
        let encoded = patch.encode();
        self.with_reauth(|token| {
            let response = self.post(
                &format!("/{datasource}?token={token}"),
                encoded.clone(),
                CONTENT_PATCH,
            )?;
            if response.status != 200 {
                return Err(status_error(&response));
            }
            let reply: Value = serde_json::from_slice(&response.body)
                .map_err(|e| LinkError::Server(format!("unreadable append reply: {e}")))?;
            reply["version"]
                .as_i64()
                .map(Version::new)
                .ok_or_else(|| LinkError::Server("append reply carried no version".to_string()))
        })
    }

    fn fetch_version(&self, datasource: &Id, version: Version) -> LinkResult<Option<Patch>> {
        self.fetch(&format!("/{datasource}?version={}", version.value()))
    }

    fn fetch_id(&self, datasource: &Id, patch: &Id) -> LinkResult<Option<Patch>> {
        self.fetch(&format!("/{datasource}?patch={patch}"))
    }

    fn new_datasource(&self, name: &str, uri: &str) -> LinkResult<Id> {
        let arg = CreateDataSourceArg {
            name: name.to_string(),
            uri: uri.to_string(),
        };
        let reply = self.rpc_with_token(RpcOp::CreateDataSource, &arg)?;
        let source: DataSourceDescription = Self::decode_value(reply)?;
        Ok(source.id)
    }

    fn remove_datasource(&self, datasource: &Id) -> LinkResult<()> {
        let arg = DataSourceArg {
            datasource: datasource.clone(),
        };
        self.rpc_with_token(RpcOp::RemoveDataSource, &arg)?;
        Ok(())
    }

    fn describe(&self, datasource: &Id) -> LinkResult<Option<DataSourceDescription>> {
        self.describe_with(DescribeArg {
            id: Some(datasource.clone()),
            ..DescribeArg::default()
        })
    }

    fn describe_by_name(&self, name: &str) -> LinkResult<Option<DataSourceDescription>> {
        self.describe_with(DescribeArg {
            name: Some(name.to_string()),
            ..DescribeArg::default()
        })
    }

    fn describe_by_uri(&self, uri: &str) -> LinkResult<Option<DataSourceDescription>> {
        self.describe_with(DescribeArg {
            uri: Some(uri.to_string()),
            ..DescribeArg::default()
        })
    }

    fn list_descriptions(&self) -> LinkResult<Vec<DataSourceDescription>> {
        let request = RpcRequest::new(RpcOp::ListDescriptions, &Value::Null)?;
        let reply = self.rpc(&request)?;
        Self::decode_value(reply["descriptions"].clone())
    }

    fn list_log_info(&self) -> LinkResult<Vec<PatchLogInfo>> {
        let request = RpcRequest::new(RpcOp::ListPatchLogInfo, &Value::Null)?;
        let reply = self.rpc(&request)?;
        Self::decode_value(reply["infos"].clone())
    }

    fn log_info(&self, datasource: &Id) -> LinkResult<Option<PatchLogInfo>> {
        let arg = DataSourceArg {
            datasource: datasource.clone(),
        };
        let request = RpcRequest::new(RpcOp::DescribeLog, &arg)?;
        let reply = self.rpc(&request)?;
        if reply.is_null() {
            return Ok(None);
        }
        Self::decode_value(reply).map(Some)
    }

    fn current_version(&self, datasource: &Id) -> LinkResult<Version> {
        Ok(self
            .log_info(datasource)?
            .map(|info| info.max_version)
            .unwrap_or(Version::UNSET))
    }

    fn initial_data(&self, datasource: &Id) -> LinkResult<Option<Vec<u8>>> {
        let response = self.get(&format!("/{datasource}/init-data"))?;
        match response.status {
            200 => Ok(Some(response.body)),
            404 => Ok(None),
            _ => Err(status_error(&response)),
        }
    }
}

impl<C: HttpClient> HttpLink<C> {
    fn describe_with(&self, arg: DescribeArg) -> LinkResult<Option<DataSourceDescription>> {
        let request = RpcRequest::new(RpcOp::DescribeDataSource, &arg)?;
        let reply = self.rpc(&request)?;
        if reply.is_null() {
            return Ok(None);
        }
        Self::decode_value(reply).map(Some)
    }
}
