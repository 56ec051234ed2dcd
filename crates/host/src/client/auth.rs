//! Outbound bearer-token resolution for HTTP transports.
//!
//! Resolution is strictly best-effort: every failure is logged and the
//! connection proceeds without an authorization header. Each connect builds
//! a fresh client, so tokens are re-resolved per connection rather than
//! cached for the instance's lifetime.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::catalog::AuthKind;
use crate::types::{AuthError, CallerContext, ClientError};

/// Timeout applied to every request on a transport's HTTP client.
const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A token held for a user identity.
#[derive(Debug, Clone)]
pub struct StoredToken {
    pub access_token: String,
}

/// Acquires service tokens for managed-identity flows.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self, scope: &str) -> Result<String, AuthError>;
}

/// Per-user token lookup. A missing entry is `Ok(None)`, never an error.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get_token(&self, identity: &str) -> Result<Option<StoredToken>, AuthError>;
}

/// Token store backed by the operating system keyring.
pub struct KeyringTokenStore {
    service: String,
}

impl KeyringTokenStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

#[async_trait]
impl TokenStore for KeyringTokenStore {
    async fn get_token(&self, identity: &str) -> Result<Option<StoredToken>, AuthError> {
        let entry = keyring::Entry::new(&self.service, identity).map_err(|err| {
            AuthError::TokenStore {
                reason: err.to_string(),
            }
        })?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(StoredToken {
                access_token: secret,
            })),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(AuthError::TokenStore {
                reason: err.to_string(),
            }),
        }
    }
}

/// Host-level dependencies for token resolution.
#[derive(Clone, Default)]
pub struct AuthContext {
    /// Audience tokens are requested for in managed-identity flows.
    pub audience: Option<String>,
    pub credential_provider: Option<Arc<dyn CredentialProvider>>,
    pub token_store: Option<Arc<dyn TokenStore>>,
}

/// Bare resources become `<resource>/.default`; already-suffixed values
/// pass through regardless of case.
fn normalize_scope(audience: &str) -> String {
    if audience.to_ascii_lowercase().ends_with("/.default") {
        audience.to_string()
    } else {
        format!("{}/.default", audience.trim_end_matches('/'))
    }
}

/// Resolves a bearer token for the configured authentication kind.
///
/// Returns `None` on any failure; the caller proceeds unauthenticated.
pub async fn resolve_bearer(
    plugin: &str,
    kind: AuthKind,
    ctx: &AuthContext,
    caller: Option<&CallerContext>,
) -> Option<String> {
    match kind {
        AuthKind::None => None,
        AuthKind::ManagedIdentity => {
            let Some(provider) = &ctx.credential_provider else {
                warn!(
                    plugin,
                    "managed identity auth configured but no credential provider is available"
                );
                return None;
            };
            let Some(audience) = ctx.audience.as_deref().filter(|a| !a.trim().is_empty()) else {
                warn!(plugin, "managed identity auth configured but no audience is set");
                return None;
            };
            let scope = normalize_scope(audience);
            match provider.bearer_token(&scope).await {
                Ok(token) => Some(token),
                Err(err) => {
                    warn!(plugin, error = %err, "failed to acquire managed identity token");
                    None
                }
            }
        }
        AuthKind::UserBearerToken => {
            let identity = caller.map(|c| c.provider_subject_id.as_str()).unwrap_or("");
            if identity.trim().is_empty() {
                debug!(plugin, "no caller identity on this call, skipping user token");
                return None;
            }
            let Some(store) = &ctx.token_store else {
                warn!(
                    plugin,
                    "user bearer auth configured but no token store is available"
                );
                return None;
            };
            match store.get_token(identity).await {
                Ok(Some(token)) if !token.access_token.trim().is_empty() => {
                    Some(token.access_token)
                }
                Ok(_) => {
                    warn!(plugin, "no stored access token for caller identity");
                    None
                }
                Err(err) => {
                    warn!(plugin, error = %err, "token store lookup failed");
                    None
                }
            }
        }
    }
}

/// Configured headers first; a bearer token is attached only when auth is
/// configured and no explicit authorization header is already present.
async fn effective_headers(
    plugin: &str,
    kind: AuthKind,
    ctx: &AuthContext,
    headers: &IndexMap<String, String>,
    caller: Option<&CallerContext>,
) -> HeaderMap {
    let mut header_map = HeaderMap::new();
    for (key, value) in headers {
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            warn!(plugin, header = %key, "skipping invalid header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            warn!(plugin, header = %key, "skipping invalid header value");
            continue;
        };
        header_map.insert(name, value);
    }

    let has_explicit_auth = headers
        .keys()
        .any(|key| key.eq_ignore_ascii_case("authorization"));
    if !has_explicit_auth
        && let Some(token) = resolve_bearer(plugin, kind, ctx, caller).await
    {
        match HeaderValue::from_str(&format!("Bearer {token}")) {
            Ok(mut value) => {
                value.set_sensitive(true);
                header_map.insert(AUTHORIZATION, value);
            }
            Err(err) => warn!(plugin, error = %err, "failed to attach authorization header"),
        }
    }
    header_map
}

/// Builds the HTTP client one transport connection uses.
pub async fn build_http_client(
    plugin: &str,
    kind: AuthKind,
    ctx: &AuthContext,
    headers: &IndexMap<String, String>,
    caller: Option<&CallerContext>,
) -> Result<reqwest::Client, ClientError> {
    let header_map = effective_headers(plugin, kind, ctx, headers, caller).await;
    reqwest::Client::builder()
        .default_headers(header_map)
        .timeout(HTTP_REQUEST_TIMEOUT)
        .build()
        .map_err(|err| ClientError::connect_failed(plugin, err.to_string()))
}
