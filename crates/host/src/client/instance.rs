//! Plugin client instances and their lifecycle state machine.
//!
//! An [`McpPluginInstance`] owns at most one live client connection to an MCP
//! server. Connections are established through a [`Connector`], which keeps the
//! lifecycle logic independent of the transport (child process, SSE, streamable
//! HTTP). Concurrent starts race to connect and reconcile on commit: the first
//! handle to land under the state lock wins, every other handle is shut down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rmcp::model::CallToolRequestParam;
use rmcp::service::{RoleClient, RunningService};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::catalog::SourceKind;
use crate::types::{
    CallerContext, ClientError, HealthStatus, InstancePhase, PluginVersion, ToolDescriptor,
    WorkflowContext,
};

/// Ceiling for a single tool invocation round-trip.
pub const TOOL_INVOCATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded wait for the state lock during dispose. A stuck transition must
/// not be able to deadlock shutdown.
const DISPOSE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Establishes one client connection to a plugin's MCP server.
///
/// The caller identity travels explicitly so transports that attach
/// per-user credentials never read ambient state.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        caller: Option<&CallerContext>,
    ) -> Result<Arc<dyn ClientHandle>, ClientError>;
}

/// A live client connection.
///
/// `shutdown` must be idempotent; the instance may call it on handles that
/// lost a start race or were displaced by a reconnect.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, ClientError>;

    async fn shutdown(&self) -> Result<(), ClientError>;
}

#[cfg(test)]
impl std::fmt::Debug for dyn ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientHandle")
    }
}

/// Client handle backed by a running `rmcp` service.
pub struct RmcpHandle {
    plugin: String,
    service: Mutex<Option<RunningService<RoleClient, ()>>>,
}

impl RmcpHandle {
    pub fn new(plugin: impl Into<String>, service: RunningService<RoleClient, ()>) -> Self {
        Self {
            plugin: plugin.into(),
            service: Mutex::new(Some(service)),
        }
    }
}

#[async_trait]
impl ClientHandle for RmcpHandle {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, ClientError> {
        let guard = self.service.lock().await;
        let Some(service) = guard.as_ref() else {
            return Err(ClientError::tool_list_failed(
                &self.plugin,
                "client already shut down",
            ));
        };
        let tools = service
            .list_all_tools()
            .await
            .map_err(|err| ClientError::tool_list_failed(&self.plugin, err.to_string()))?;
        Ok(tools.iter().map(ToolDescriptor::from_rmcp).collect())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, ClientError> {
        let guard = self.service.lock().await;
        let Some(service) = guard.as_ref() else {
            return Err(ClientError::tool_call_failed(name, "client already shut down"));
        };

        let call_future = service.call_tool(CallToolRequestParam {
            name: name.to_string().into(),
            arguments,
        });

        let result = match timeout(TOOL_INVOCATION_TIMEOUT, call_future).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => return Err(ClientError::tool_call_failed(name, err.to_string())),
            Err(_) => {
                return Err(ClientError::Timeout {
                    operation: format!("tool '{name}' invocation"),
                    seconds: TOOL_INVOCATION_TIMEOUT.as_secs(),
                });
            }
        };

        serde_json::to_value(result)
            .map_err(|err| ClientError::tool_call_failed(name, err.to_string()))
    }

    async fn shutdown(&self) -> Result<(), ClientError> {
        let service = self.service.lock().await.take();
        if let Some(service) = service {
            service
                .cancel()
                .await
                .map_err(|err| ClientError::connect_failed(&self.plugin, err.to_string()))?;
        }
        Ok(())
    }
}

/// An invocable tool bound to the client that listed it.
///
/// The client is held weakly so a stopped or disposed instance invalidates
/// its tool functions instead of keeping the connection alive through them.
#[derive(Clone)]
pub struct ToolFunction {
    pub descriptor: ToolDescriptor,
    client: Weak<dyn ClientHandle>,
}

impl ToolFunction {
    pub fn new(descriptor: ToolDescriptor, client: &Arc<dyn ClientHandle>) -> Self {
        Self {
            descriptor,
            client: Arc::downgrade(client),
        }
    }

    /// Name the host exposes, sanitized for downstream tool registries.
    pub fn name(&self) -> &str {
        &self.descriptor.sanitized_name
    }

    /// Invokes the tool under its original wire name.
    pub async fn invoke(
        &self,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, ClientError> {
        let Some(client) = self.client.upgrade() else {
            return Err(ClientError::tool_call_failed(
                &self.descriptor.sanitized_name,
                "client connection is gone",
            ));
        };
        client.call_tool(&self.descriptor.name, arguments).await
    }
}

/// Mutable instance state guarded by one async lock.
struct InstanceState {
    phase: InstancePhase,
    client: Option<Arc<dyn ClientHandle>>,
    /// Workflow the instance was last initialized for.
    context_id: Option<String>,
    health: HealthStatus,
}

/// One managed MCP plugin client at a specific version.
///
/// Shared across workflows through the server container; all lifecycle
/// methods take `&self` and are safe to call concurrently.
pub struct McpPluginInstance {
    name: String,
    description: String,
    version: PluginVersion,
    source: SourceKind,
    connector: Arc<dyn Connector>,
    disposed: AtomicBool,
    started: AtomicBool,
    initialized: AtomicBool,
    state: Mutex<InstanceState>,
}

impl McpPluginInstance {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        version: PluginVersion,
        source: SourceKind,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version,
            source,
            connector,
            disposed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            state: Mutex::new(InstanceState {
                phase: InstancePhase::Uninitialized,
                client: None,
                context_id: None,
                health: HealthStatus::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn version(&self) -> &PluginVersion {
        &self.version
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub async fn phase(&self) -> InstancePhase {
        self.state.lock().await.phase
    }

    pub async fn health(&self) -> HealthStatus {
        self.state.lock().await.health.clone()
    }

    /// Connects the client if it is not already connected.
    ///
    /// Concurrent callers may each open a connection; only the first to
    /// commit under the state lock keeps it, the rest shut theirs down and
    /// return success. Connect failures leave the instance stopped.
    pub async fn start(&self, caller: Option<&CallerContext>) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::disposed(&self.name));
        }
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            if self.disposed.load(Ordering::SeqCst) {
                return Err(ClientError::disposed(&self.name));
            }
            if state.client.is_some() {
                return Ok(());
            }
            state.phase = InstancePhase::Starting;
        }

        let connect_started = Instant::now();
        let connected = self.connector.connect(caller).await;

        let mut state = self.state.lock().await;
        match connected {
            Ok(client) => {
                if self.disposed.load(Ordering::SeqCst) {
                    drop(state);
                    shutdown_quietly(&self.name, client.as_ref()).await;
                    return Err(ClientError::disposed(&self.name));
                }
                if state.client.is_some() {
                    drop(state);
                    debug!(
                        plugin = %self.name,
                        "concurrent start already connected, dropping duplicate client"
                    );
                    shutdown_quietly(&self.name, client.as_ref()).await;
                    return Ok(());
                }
                state.health.mark_healthy(connect_started.elapsed().as_millis() as u64);
                state.client = Some(client);
                state.phase = InstancePhase::Started;
                self.started.store(true, Ordering::SeqCst);
                info!(plugin = %self.name, version = %self.version, "plugin client started");
                Ok(())
            }
            Err(err) => {
                state.client = None;
                state.phase = InstancePhase::Stopped;
                state.health.mark_unhealthy();
                Err(err)
            }
        }
    }

    /// Binds the instance to a workflow, starting the client if needed.
    ///
    /// Calling again with the same workflow is a no-op; a different workflow
    /// rebinds the context on the shared connection.
    pub async fn initialize(&self, workflow: &WorkflowContext) -> Result<(), ClientError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ClientError::disposed(&self.name));
        }
        if self.initialized.load(Ordering::SeqCst) {
            let state = self.state.lock().await;
            if state.context_id.as_deref() == Some(workflow.workflow_id.as_str()) {
                return Ok(());
            }
        }

        self.start(workflow.caller.as_ref()).await?;

        let mut state = self.state.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            drop(state);
            self.stop().await;
            return Err(ClientError::disposed(&self.name));
        }
        state.phase = InstancePhase::Initializing;
        state.context_id = Some(workflow.workflow_id.clone());
        state.phase = InstancePhase::Initialized;
        self.initialized.store(true, Ordering::SeqCst);
        debug!(
            plugin = %self.name,
            workflow = %workflow.workflow_id,
            "plugin initialized for workflow"
        );
        Ok(())
    }

    /// Lists the plugin's tools as invocable functions.
    ///
    /// A listing failure tears the connection down and retries once on a
    /// fresh client; a second failure degrades to an empty list so one bad
    /// plugin cannot take down tool discovery for a whole workflow.
    pub async fn list_tools(&self, workflow: &WorkflowContext) -> Vec<ToolFunction> {
        if let Err(err) = self.initialize(workflow).await {
            warn!(
                plugin = %self.name,
                error = %err,
                "cannot initialize plugin for tool listing"
            );
            return Vec::new();
        }

        let first = match self.try_list_tools().await {
            Ok(functions) => return functions,
            Err(err) => err,
        };
        warn!(
            plugin = %self.name,
            error = %first,
            "tool listing failed, restarting client for one retry"
        );

        self.stop().await;
        if let Err(err) = self.start(workflow.caller.as_ref()).await {
            warn!(plugin = %self.name, error = %err, "client restart failed");
            return Vec::new();
        }

        match self.try_list_tools().await {
            Ok(functions) => functions,
            Err(err) => {
                warn!(
                    plugin = %self.name,
                    error = %err,
                    "tool listing failed after restart, exposing no tools"
                );
                Vec::new()
            }
        }
    }

    async fn try_list_tools(&self) -> Result<Vec<ToolFunction>, ClientError> {
        let client = {
            let state = self.state.lock().await;
            state.client.clone()
        };
        let Some(client) = client else {
            return Err(ClientError::tool_list_failed(&self.name, "no active client"));
        };
        let descriptors = client.list_tools().await?;
        Ok(descriptors
            .into_iter()
            .map(|descriptor| ToolFunction::new(descriptor, &client))
            .collect())
    }

    /// Disconnects the client, keeping the instance restartable.
    ///
    /// The handle is captured and cleared under the lock, then shut down
    /// outside it; shutdown errors are logged and swallowed.
    pub async fn stop(&self) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let captured = {
            let mut state = self.state.lock().await;
            state.phase = InstancePhase::Stopping;
            self.started.store(false, Ordering::SeqCst);
            self.initialized.store(false, Ordering::SeqCst);
            state.context_id = None;
            let client = state.client.take();
            state.phase = InstancePhase::Stopped;
            client
        };
        if let Some(client) = captured {
            shutdown_quietly(&self.name, client.as_ref()).await;
            info!(plugin = %self.name, "plugin client stopped");
        }
    }

    /// Permanently retires the instance. Idempotent.
    ///
    /// The disposed flag is set before anything else, so a start that is
    /// mid-connect will observe it on commit and shut its fresh client down.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let captured = match timeout(DISPOSE_LOCK_TIMEOUT, self.state.lock()).await {
            Ok(mut state) => {
                self.started.store(false, Ordering::SeqCst);
                self.initialized.store(false, Ordering::SeqCst);
                state.context_id = None;
                state.phase = InstancePhase::Disposed;
                state.client.take()
            }
            Err(_) => {
                warn!(
                    plugin = %self.name,
                    seconds = DISPOSE_LOCK_TIMEOUT.as_secs(),
                    "state lock still held after bounded wait, disposing without it"
                );
                None
            }
        };

        if let Some(client) = captured {
            shutdown_quietly(&self.name, client.as_ref()).await;
        }
        info!(plugin = %self.name, version = %self.version, "plugin instance disposed");
    }
}

async fn shutdown_quietly(plugin: &str, client: &dyn ClientHandle) {
    if let Err(err) = client.shutdown().await {
        warn!(plugin, error = %err, "client shutdown reported an error");
    }
}
