//! Local Jupyter kernels over ZeroMQ, via `runtimelib`.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use jupyter_protocol::{
    ConnectionInfo, ExecuteRequest as JupyterExecuteRequest, ExecutionState, JupyterMessage,
    JupyterMessageContent, KernelInfoRequest, ShutdownRequest,
};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::backend::{ExecuteRequest, Inbound, KernelBackend, KernelConnection};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::message::{WireHeader, WireMessage, IOPUB_CHANNEL, SHELL_CHANNEL};
use crate::spec::{KernelSpec, KernelSpecs};

fn launch_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::LaunchFailure(e.to_string())
}

fn transport_error(e: impl std::fmt::Display) -> SessionError {
    SessionError::TransportError(e.to_string())
}

/// Content of the IOPub/shell messages the router understands, in Jupyter
/// wire form. Other message types carry no content.
fn wire_content(content: &JupyterMessageContent) -> Value {
    match content {
        JupyterMessageContent::StreamContent(stream) => {
            let name = match stream.name {
                jupyter_protocol::Stdio::Stdout => "stdout",
                jupyter_protocol::Stdio::Stderr => "stderr",
            };
            json!({ "name": name, "text": stream.text })
        }
        JupyterMessageContent::ErrorOutput(error) => json!({
            "ename": error.ename,
            "evalue": error.evalue,
            "traceback": error.traceback
        }),
        JupyterMessageContent::ExecuteResult(result) => json!({
            "data": result.data,
            "metadata": result.metadata,
            "execution_count": result.execution_count.0
        }),
        JupyterMessageContent::DisplayData(data) => json!({
            "data": data.data,
            "metadata": data.metadata
        }),
        JupyterMessageContent::ExecuteInput(input) => json!({
            "code": input.code,
            "execution_count": input.execution_count.0
        }),
        JupyterMessageContent::Status(status) => {
            let state = match status.execution_state {
                ExecutionState::Busy => "busy",
                ExecutionState::Idle => "idle",
                ExecutionState::Starting => "starting",
                ExecutionState::Restarting => "restarting",
                ExecutionState::Terminating | ExecutionState::Dead => "shutdown",
                _ => "unknown",
            };
            json!({ "execution_state": state })
        }
        _ => Value::Null,
    }
}

/// Convert a `JupyterMessage` read from a socket into the router's form.
pub fn to_wire(message: &JupyterMessage, channel: &str) -> WireMessage {
    WireMessage {
        channel: Some(channel.to_string()),
        header: Some(WireHeader {
            msg_id: Some(message.header.msg_id.clone()),
            msg_type: Some(message.header.msg_type.clone()),
        }),
        parent_header: message.parent_header.as_ref().map(|h| WireHeader {
            msg_id: Some(h.msg_id.clone()),
            msg_type: Some(h.msg_type.clone()),
        }),
        content: wire_content(&message.content),
    }
}

/// Discovers kernelspecs and launches kernels as local processes.
#[derive(Debug, Clone, Default)]
pub struct JupyterBackend {
    config: SessionConfig,
}

impl JupyterBackend {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl KernelBackend for JupyterBackend {
    type Connection = JupyterConnection;

    async fn list_specs(&self) -> Result<KernelSpecs> {
        let specs = runtimelib::list_kernelspecs()
            .await
            .into_iter()
            .map(|s| KernelSpec {
                name: s.kernel_name,
                display_name: s.kernelspec.display_name,
                language: Some(s.kernelspec.language).filter(|l| !l.is_empty()),
                argv: s.kernelspec.argv,
            });

        KernelSpecs::from_specs(specs, self.config.default_kernel.as_deref()).ok_or_else(|| {
            SessionError::SpecUnavailable("No Jupyter kernelspecs found".to_string())
        })
    }

    async fn start(&self, name: &str) -> Result<(JupyterConnection, Inbound)> {
        let kernelspec = runtimelib::find_kernelspec(name).await.map_err(launch_error)?;

        // Reserve ports
        let ip = std::net::IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let ports = runtimelib::peek_ports(ip, 5).await.map_err(launch_error)?;

        let connection_info = ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: ip.to_string(),
            stdin_port: ports[0],
            control_port: ports[1],
            hb_port: ports[2],
            shell_port: ports[3],
            iopub_port: ports[4],
            signature_scheme: "hmac-sha256".to_string(),
            key: Uuid::new_v4().to_string(),
            kernel_name: Some(name.to_string()),
        };

        let runtime_dir = self.config.runtime_dir();
        tokio::fs::create_dir_all(&runtime_dir)
            .await
            .map_err(launch_error)?;

        let kernel_id: String =
            petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let connection_file = runtime_dir.join(format!("runt-kernel-{}.json", kernel_id));

        let contents = serde_json::to_string_pretty(&connection_info).map_err(launch_error)?;
        tokio::fs::write(&connection_file, contents)
            .await
            .map_err(launch_error)?;

        info!("[jupyter] Starting kernel {} at {:?}", name, connection_file);

        let process = spawn_kernel(kernelspec, &connection_file).await?;

        // From here on, dropping `connection` kills the process and removes the file
        let mut connection = JupyterConnection {
            kernel_id,
            session_id: Uuid::new_v4().to_string(),
            connection_info,
            connection_file: Some(connection_file),
            shell_writer: None,
            process: Some(process),
            iopub_task: None,
            shell_reader_task: None,
            shutdown_timeout: self.config.shutdown_timeout,
        };

        // Small delay to let the kernel bind its sockets
        tokio::time::sleep(self.config.startup_delay).await;

        let inbound = connection
            .connect(self.config.kernel_info_timeout, self.config.inbound_capacity)
            .await?;

        info!("[jupyter] Kernel started: {}", connection.kernel_id);
        Ok((connection, inbound))
    }
}

/// Spawn the kernel process, removing the connection file if it cannot start.
async fn spawn_kernel(
    kernelspec: runtimelib::KernelspecDir,
    connection_file: &Path,
) -> Result<tokio::process::Child> {
    let spawned = kernelspec
        .command(connection_file, Some(Stdio::null()), Some(Stdio::null()))
        .map_err(launch_error)
        .and_then(|mut command| command.kill_on_drop(true).spawn().map_err(launch_error));

    if spawned.is_err() {
        if let Err(e) = tokio::fs::remove_file(connection_file).await {
            warn!(
                "[jupyter] Failed to remove connection file {:?}: {}",
                connection_file, e
            );
        }
    }
    spawned
}

/// A running local kernel process and its sockets.
pub struct JupyterConnection {
    kernel_id: String,
    session_id: String,
    connection_info: ConnectionInfo,
    connection_file: Option<PathBuf>,
    shell_writer: Option<runtimelib::DealerSendConnection>,
    process: Option<tokio::process::Child>,
    iopub_task: Option<tokio::task::JoinHandle<()>>,
    shell_reader_task: Option<tokio::task::JoinHandle<()>>,
    shutdown_timeout: std::time::Duration,
}

impl JupyterConnection {
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection_info
    }

    pub fn connection_file(&self) -> Option<&PathBuf> {
        self.connection_file.as_ref()
    }

    /// Open IOPub and shell, verify the kernel answers `kernel_info`, and
    /// start forwarding both channels into the returned queue.
    async fn connect(
        &mut self,
        kernel_info_timeout: std::time::Duration,
        capacity: usize,
    ) -> Result<Inbound> {
        let (tx, inbound) = mpsc::channel(capacity);

        let mut iopub =
            runtimelib::create_client_iopub_connection(&self.connection_info, "", &self.session_id)
                .await
                .map_err(launch_error)?;

        let iopub_tx = tx.clone();
        self.iopub_task = Some(tokio::spawn(async move {
            loop {
                match iopub.read().await {
                    Ok(message) => {
                        debug!(
                            "[jupyter] iopub: type={} parent_msg_id={:?}",
                            message.header.msg_type,
                            message.parent_header.as_ref().map(|h| &h.msg_id)
                        );
                        if iopub_tx.send(to_wire(&message, IOPUB_CHANNEL)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[jupyter] iopub read error: {}", e);
                        break;
                    }
                }
            }
        }));

        let identity =
            runtimelib::peer_identity_for_session(&self.session_id).map_err(launch_error)?;
        let mut shell = runtimelib::create_client_shell_connection_with_identity(
            &self.connection_info,
            &self.session_id,
            identity,
        )
        .await
        .map_err(launch_error)?;

        // Verify kernel is alive with kernel_info handshake
        let request: JupyterMessage = KernelInfoRequest::default().into();
        shell.send(request).await.map_err(launch_error)?;

        match tokio::time::timeout(kernel_info_timeout, shell.read()).await {
            Ok(Ok(msg)) => {
                info!("[jupyter] Kernel alive: got {} reply", msg.header.msg_type);
            }
            Ok(Err(e)) => {
                return Err(SessionError::LaunchFailure(format!(
                    "Kernel did not respond: {}",
                    e
                )));
            }
            Err(_) => {
                return Err(SessionError::LaunchFailure(format!(
                    "Kernel did not respond within {:?}",
                    kernel_info_timeout
                )));
            }
        }

        let (shell_writer, mut shell_reader) = shell.split();
        self.shell_reader_task = Some(tokio::spawn(async move {
            loop {
                match shell_reader.read().await {
                    Ok(message) => {
                        debug!("[jupyter] shell reply: type={}", message.header.msg_type);
                        if tx.send(to_wire(&message, SHELL_CHANNEL)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("[jupyter] shell read error: {}", e);
                        break;
                    }
                }
            }
        }));
        self.shell_writer = Some(shell_writer);

        Ok(inbound)
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.iopub_task.take() {
            task.abort();
        }
        if let Some(task) = self.shell_reader_task.take() {
            task.abort();
        }
    }

    fn remove_connection_file(&mut self) {
        if let Some(path) = self.connection_file.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl KernelConnection for JupyterConnection {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    async fn send_execute(&mut self, request: &ExecuteRequest) -> Result<()> {
        let shell = self
            .shell_writer
            .as_mut()
            .ok_or_else(|| SessionError::TransportError("No kernel running".to_string()))?;

        let mut execute = JupyterExecuteRequest::new(request.code.clone());
        execute.silent = request.silent;
        execute.store_history = request.store_history;
        execute.stop_on_error = request.stop_on_error;

        let mut message: JupyterMessage = execute.into();
        message.header.msg_id = request.msg_id.clone();

        shell.send(message).await.map_err(transport_error)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.abort_tasks();
        self.shell_writer = None;

        let mut control =
            runtimelib::create_client_control_connection(&self.connection_info, &self.session_id)
                .await
                .map_err(|e| SessionError::TeardownFailure(e.to_string()))?;

        let request: JupyterMessage = ShutdownRequest { restart: false }.into();
        control
            .send(request)
            .await
            .map_err(|e| SessionError::TeardownFailure(e.to_string()))?;

        match tokio::time::timeout(self.shutdown_timeout, control.read()).await {
            Ok(Ok(reply)) => {
                info!("[jupyter] Kernel {} acknowledged shutdown", self.kernel_id);
                debug!("[jupyter] shutdown reply: type={}", reply.header.msg_type);
            }
            Ok(Err(e)) => warn!("[jupyter] Error reading shutdown_reply: {}", e),
            Err(_) => warn!(
                "[jupyter] No shutdown_reply from {} within {:?}, killing process",
                self.kernel_id, self.shutdown_timeout
            ),
        }

        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.kill().await {
                debug!("[jupyter] Kernel process already gone: {}", e);
            }
        }
        self.remove_connection_file();

        Ok(())
    }
}

impl Drop for JupyterConnection {
    fn drop(&mut self) {
        self.abort_tasks();
        self.remove_connection_file();
    }
}
