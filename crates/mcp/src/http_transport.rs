//! Streamable HTTP transport for remote upstreams.
//!
//! JSON-RPC requests go out as HTTP POSTs; responses come back either as a
//! plain JSON body or as a single-message event stream. The server-issued
//! `Mcp-Session-Id` is echoed on every later request and released with a
//! `DELETE` when the transport is closed.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    reqwest::{Client, StatusCode},
    secrecy::{ExposeSecret, Secret},
    tokio::sync::RwLock,
    tracing::{debug, info, warn},
};

use crate::{
    credentials::SharedCredentialResolver,
    error::{Context, Error, McpTransportError, Result},
    traits::McpTransport,
    types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION},
};

const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";
const STREAMABLE_ACCEPT_HEADER: &str = "application/json, text/event-stream";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP transport for one remote upstream.
pub struct HttpTransport {
    client: Client,
    alias: String,
    url: String,
    /// Static headers from the upstream descriptor, sent on every request.
    headers: BTreeMap<String, String>,
    next_id: AtomicU64,
    credentials: Option<SharedCredentialResolver>,
    session_id: RwLock<Option<String>>,
    closed: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        alias: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        Self::build(alias, url, headers, request_timeout, None)
    }

    pub fn with_credentials(
        alias: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        request_timeout: Duration,
        credentials: SharedCredentialResolver,
    ) -> Result<Arc<Self>> {
        Self::build(alias, url, headers, request_timeout, Some(credentials))
    }

    fn build(
        alias: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        request_timeout: Duration,
        credentials: Option<SharedCredentialResolver>,
    ) -> Result<Arc<Self>> {
        url::Url::parse(url)?;
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client for upstream transport")?;

        Ok(Arc::new(Self {
            client,
            alias: alias.to_string(),
            url: url.to_string(),
            headers,
            next_id: AtomicU64::new(1),
            credentials,
            session_id: RwLock::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    async fn current_token(&self) -> Option<Secret<String>> {
        match &self.credentials {
            Some(resolver) => resolver.resolve_token(&self.alias).await,
            None => None,
        }
    }

    async fn decorate(
        &self,
        mut req: reqwest::RequestBuilder,
        token: Option<&Secret<String>>,
    ) -> reqwest::RequestBuilder {
        req = req.header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(session_id) = self.session_id.read().await.clone() {
            req = req.header(MCP_SESSION_ID_HEADER, session_id);
        }
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }
        req
    }

    async fn post(
        &self,
        method: &str,
        body: &impl serde::Serialize,
        token: Option<&Secret<String>>,
    ) -> Result<reqwest::Response> {
        let req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Accept", STREAMABLE_ACCEPT_HEADER);
        let resp = self
            .decorate(req, token)
            .await
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST to '{}' for '{method}' failed", self.url))?;
        self.store_session_id_from_response(&resp).await;
        Ok(resp)
    }

    async fn store_session_id_from_response(&self, response: &reqwest::Response) {
        let Some(raw) = response.headers().get(MCP_SESSION_ID_HEADER) else {
            return;
        };
        let Ok(session_id) = raw.to_str() else {
            return;
        };
        if session_id.trim().is_empty() {
            return;
        }

        let mut slot = self.session_id.write().await;
        if slot.as_deref() != Some(session_id) {
            debug!(
                alias = %self.alias,
                session_id = %session_id,
                "updated upstream session id"
            );
            *slot = Some(session_id.to_string());
        }
    }

    fn www_authenticate(resp: &reqwest::Response) -> Option<String> {
        resp.headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }

    fn response_is_event_stream(resp: &reqwest::Response) -> bool {
        resp.headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| {
                ct.split(';')
                    .next()
                    .is_some_and(|base| base.trim() == "text/event-stream")
            })
    }

    /// Pull the first JSON-RPC response out of an event-stream body.
    pub(crate) fn parse_event_stream_response(body: &str, method: &str) -> Result<JsonRpcResponse> {
        let mut data = String::new();

        for line in body.lines() {
            let trimmed = line.trim_end();
            if let Some(rest) = trimmed.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
                continue;
            }

            if trimmed.is_empty() && !data.is_empty() {
                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&data) {
                    return Ok(resp);
                }
                data.clear();
            }
        }

        if !data.is_empty()
            && let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&data)
        {
            return Ok(resp);
        }

        Err(Error::message(format!(
            "failed to parse JSON-RPC response from event stream for '{method}'"
        )))
    }

    /// POST once; on 401 invalidate the token, refresh, and retry exactly once.
    async fn send_with_auth_retry(
        &self,
        method: &str,
        body: &impl serde::Serialize,
    ) -> Result<reqwest::Response> {
        let token = self.current_token().await;
        let resp = self.post(method, body, token.as_ref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let www_authenticate = Self::www_authenticate(&resp);
        let Some(resolver) = &self.credentials else {
            return Err(McpTransportError::Unauthorized { www_authenticate }.into());
        };

        info!(
            alias = %self.alias,
            method = %method,
            www_authenticate = ?www_authenticate,
            "upstream rejected credentials, refreshing"
        );
        resolver.mark_invalid(&self.alias).await;
        let Some(fresh) = resolver.refresh(&self.alias).await else {
            return Err(McpTransportError::Unauthorized { www_authenticate }.into());
        };

        let retry = self.post(method, body, Some(&fresh)).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            return Err(McpTransportError::Unauthorized {
                www_authenticate: Self::www_authenticate(&retry),
            }
            .into());
        }
        Ok(retry)
    }
}

#[async_trait::async_trait]
impl McpTransport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpTransportError::Closed {
                reason: "http transport closed".into(),
            }
            .into());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        debug!(alias = %self.alias, method = %method, id = %id, "bundler -> upstream (http)");

        let http_resp = self.send_with_auth_retry(method, &req).await?;

        if !http_resp.status().is_success() {
            let status = http_resp.status().as_u16();
            let body = http_resp.text().await.unwrap_or_default();
            return Err(McpTransportError::HttpStatus {
                method: method.to_string(),
                status,
                body,
            }
            .into());
        }

        let resp: JsonRpcResponse = if Self::response_is_event_stream(&http_resp) {
            let body = http_resp
                .text()
                .await
                .with_context(|| format!("failed to read event stream response for '{method}'"))?;
            Self::parse_event_stream_response(&body, method)?
        } else {
            http_resp
                .json()
                .await
                .with_context(|| format!("failed to parse JSON-RPC response for '{method}'"))?
        };

        if let Some(ref err) = resp.error {
            return Err(McpTransportError::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message.clone(),
            }
            .into());
        }

        Ok(resp)
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        debug!(alias = %self.alias, method = %method, "bundler -> upstream (http notification)");

        let http_resp = self.send_with_auth_retry(method, &notif).await?;
        if !http_resp.status().is_success() {
            warn!(
                alias = %self.alias,
                method = %method,
                status = %http_resp.status(),
                "upstream notification returned non-success"
            );
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let req = self
            .client
            .get(&self.url)
            .timeout(PROBE_TIMEOUT)
            .header("Accept", STREAMABLE_ACCEPT_HEADER);
        let token = self.current_token().await;
        match self.decorate(req, token.as_ref()).await.send().await {
            Ok(resp) => {
                self.store_session_id_from_response(&resp).await;
                true
            },
            Err(_) => false,
        }
    }

    async fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let Some(session_id) = self.session_id.write().await.take() else {
            return;
        };

        let mut req = self
            .client
            .delete(&self.url)
            .timeout(PROBE_TIMEOUT)
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .header(MCP_SESSION_ID_HEADER, session_id);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(token) = self.current_token().await {
            req = req.header("Authorization", format!("Bearer {}", token.expose_secret()));
        }

        if let Err(e) = req.send().await {
            warn!(alias = %self.alias, error = %e, "failed to close upstream session");
        }
    }
}
