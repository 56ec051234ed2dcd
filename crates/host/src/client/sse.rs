//! Remote transport for SSE and streamable HTTP MCP servers.
//!
//! A catalog entry only carries a base URL; servers differ in where they
//! actually mount the MCP endpoint. Connecting probes a fixed candidate
//! ladder: streamable HTTP first (the current protocol), then the legacy
//! SSE endpoints. A URL that explicitly ends in `/sse` skips the ladder.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use rmcp::service::ServiceExt as _;
use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport};
use tracing::{debug, warn};
use url::Url;

use crate::catalog::AuthKind;
use crate::client::auth::{build_http_client, AuthContext};
use crate::client::instance::{ClientHandle, Connector, RmcpHandle};
use crate::types::{CallerContext, ClientError};

/// Endpoint candidates for a configured base URL, in probe order.
///
/// Returns `(streamable_http, sse)`. The base itself is always the first
/// streamable candidate; `/mcp` is appended unless the path already ends
/// there. SSE fallbacks are `<base>/mcp/sse` and `<base>/sse`.
pub fn endpoint_candidates(url: &Url) -> (Vec<Url>, Vec<Url>) {
    let trimmed_path = url.path().trim_end_matches('/');
    if trimmed_path.ends_with("/sse") {
        return (Vec::new(), vec![url.clone()]);
    }

    let mut base = url.clone();
    if let Ok(mut segments) = base.path_segments_mut() {
        segments.pop_if_empty();
    }

    let mut streamable = vec![base.clone()];
    if !trimmed_path.ends_with("/mcp") {
        streamable.push(with_appended_segments(&base, &["mcp"]));
    }
    let sse = vec![
        with_appended_segments(&base, &["mcp", "sse"]),
        with_appended_segments(&base, &["sse"]),
    ];
    (streamable, sse)
}

fn with_appended_segments(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Connects to a plugin's MCP server over HTTP.
pub struct SseConnector {
    plugin_name: String,
    url: String,
    auth: AuthKind,
    auth_context: AuthContext,
    headers: IndexMap<String, String>,
}

impl SseConnector {
    pub fn new(
        plugin_name: impl Into<String>,
        url: impl Into<String>,
        auth: AuthKind,
        auth_context: AuthContext,
        headers: IndexMap<String, String>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            url: url.into(),
            auth,
            auth_context,
            headers,
        }
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(
        &self,
        caller: Option<&CallerContext>,
    ) -> Result<Arc<dyn ClientHandle>, ClientError> {
        if self.url.trim().is_empty() {
            return Err(ClientError::missing_url(&self.plugin_name));
        }
        let url = Url::parse(self.url.trim()).map_err(|err| ClientError::InvalidUrl {
            plugin: self.plugin_name.clone(),
            url: self.url.clone(),
            reason: err.to_string(),
        })?;

        // Auth is resolved once per connect; every candidate reuses the
        // same client with the same headers.
        let http_client = build_http_client(
            &self.plugin_name,
            self.auth,
            &self.auth_context,
            &self.headers,
            caller,
        )
        .await?;

        let (streamable, sse) = endpoint_candidates(&url);
        let mut last_error: Option<String> = None;

        for candidate in &streamable {
            let config = StreamableHttpClientTransportConfig::with_uri(candidate.as_str());
            let transport = StreamableHttpClientTransport::with_client(http_client.clone(), config);
            match ().serve(transport).await {
                Ok(service) => {
                    debug!(
                        plugin = %self.plugin_name,
                        endpoint = %candidate,
                        "connected over streamable HTTP"
                    );
                    return Ok(Arc::new(RmcpHandle::new(&self.plugin_name, service)));
                }
                Err(err) => {
                    warn!(
                        plugin = %self.plugin_name,
                        endpoint = %candidate,
                        error = %err,
                        "streamable HTTP candidate failed"
                    );
                    last_error = Some(err.to_string());
                }
            }
        }

        for candidate in &sse {
            let config = SseClientConfig {
                sse_endpoint: candidate.as_str().into(),
                ..Default::default()
            };
            let transport =
                match SseClientTransport::start_with_client(http_client.clone(), config).await {
                    Ok(transport) => transport,
                    Err(err) => {
                        warn!(
                            plugin = %self.plugin_name,
                            endpoint = %candidate,
                            error = %err,
                            "SSE candidate failed"
                        );
                        last_error = Some(err.to_string());
                        continue;
                    }
                };
            match ().serve(transport).await {
                Ok(service) => {
                    debug!(
                        plugin = %self.plugin_name,
                        endpoint = %candidate,
                        "connected over SSE"
                    );
                    return Ok(Arc::new(RmcpHandle::new(&self.plugin_name, service)));
                }
                Err(err) => {
                    warn!(
                        plugin = %self.plugin_name,
                        endpoint = %candidate,
                        error = %err,
                        "SSE handshake failed"
                    );
                    last_error = Some(err.to_string());
                }
            }
        }

        Err(ClientError::connect_failed(
            &self.plugin_name,
            last_error.unwrap_or_else(|| "no reachable endpoint".to_string()),
        ))
    }
}
