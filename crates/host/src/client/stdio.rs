//! Child-process transport for stdio MCP servers.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use rmcp::service::ServiceExt as _;
use rmcp::transport::TokioChildProcess;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::client::instance::{ClientHandle, Connector, RmcpHandle};
use crate::logging::LogManager;
use crate::types::{CallerContext, ClientError, LogEntry};

/// Runtime launchers that must be resolved through `PATH` at spawn time.
///
/// Manifests routinely name these directly ("npx", "python") and expect the
/// machine's installation to be found; joining them onto the plugin
/// directory would break every such package.
const COMMON_LAUNCHERS: &[&str] = &[
    "npx",
    "node",
    "npm",
    "dotnet",
    "python",
    "python3",
    "pwsh",
    "powershell",
];

/// Decides what actually gets executed for a manifest command.
///
/// Absolute paths, known launchers, and commands present on `PATH` pass
/// through unchanged; anything else is assumed to ship inside the staged
/// package and is joined onto `working_dir`.
pub fn resolve_command_path(command: &str, working_dir: &Path) -> PathBuf {
    let candidate = Path::new(command);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    if COMMON_LAUNCHERS
        .iter()
        .any(|launcher| command.eq_ignore_ascii_case(launcher))
    {
        return candidate.to_path_buf();
    }
    if found_on_path(command) {
        return candidate.to_path_buf();
    }
    working_dir.join(command)
}

fn found_on_path(command: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(command).is_file())
}

/// Connects to a plugin by spawning its server as a child process.
pub struct StdioConnector {
    plugin_name: String,
    command: String,
    args: Vec<String>,
    env: IndexMap<String, String>,
    working_dir: PathBuf,
    log_manager: Arc<LogManager>,
}

impl StdioConnector {
    pub fn new(
        plugin_name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: IndexMap<String, String>,
        working_dir: PathBuf,
        log_manager: Arc<LogManager>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            command: command.into(),
            args,
            env,
            working_dir,
            log_manager,
        }
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(
        &self,
        _caller: Option<&CallerContext>,
    ) -> Result<Arc<dyn ClientHandle>, ClientError> {
        if self.command.trim().is_empty() {
            return Err(ClientError::missing_command(&self.plugin_name));
        }

        let program = resolve_command_path(&self.command, &self.working_dir);
        debug!(
            plugin = %self.plugin_name,
            program = %program.display(),
            "spawning stdio MCP server"
        );

        let mut cmd = Command::new(&program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.working_dir);

        // Capture stderr so server diagnostics land in the plugin's log
        // buffer instead of the host's terminal.
        let (transport, stderr) = TokioChildProcess::builder(cmd)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| ClientError::connect_failed(&self.plugin_name, err.to_string()))?;

        if let Some(stderr) = stderr {
            spawn_stderr_forwarder(
                self.plugin_name.clone(),
                Arc::clone(&self.log_manager),
                stderr,
            );
        }

        let service = ()
            .serve(transport)
            .await
            .map_err(|err| ClientError::connect_failed(&self.plugin_name, err.to_string()))?;
        Ok(Arc::new(RmcpHandle::new(&self.plugin_name, service)))
    }
}

/// Forwards the child's stderr lines to the log manager until EOF.
fn spawn_stderr_forwarder(
    plugin_name: String,
    log_manager: Arc<LogManager>,
    stderr: tokio::process::ChildStderr,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log_manager
                .add_log(&plugin_name, LogEntry::from_stderr_line(line))
                .await;
        }
    });
}
