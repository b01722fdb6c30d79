//! Kernel sessions: launch, execute, shutdown.

use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{ExecuteRequest, KernelBackend, KernelConnection};
use crate::error::{Result, SessionError};
use crate::execution::{ExecutionFuture, ExecutionResult};
use crate::router::{lock, new_shared, ActiveExecution, OutputRouter, Shared};

/// Lifecycle of a [`Session`].
///
/// `Connecting -> Ready -> {Executing <-> Ready} -> Closing -> Closed`, with
/// `Closing -> Unknown` when the backend refuses to shut down or the caller
/// abandons the shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Ready,
    Executing,
    Closing,
    Closed,
    /// Shutdown failed; the kernel may still be running.
    Unknown,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Closed | SessionStatus::Unknown)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Executing => write!(f, "executing"),
            SessionStatus::Closing => write!(f, "closing"),
            SessionStatus::Closed => write!(f, "closed"),
            SessionStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOptions {
    /// Kernel spec name, e.g. `python3`.
    pub name: String,
}

impl LaunchOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// An execute request as a host hands it over.
///
/// `code` is optional so a request deserialized from the host with
/// `"code": null` (or no code at all) can be rejected explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    pub code: Option<String>,
    pub silent: bool,
    pub store_history: bool,
    pub stop_on_error: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            code: None,
            silent: false,
            store_history: true,
            stop_on_error: true,
        }
    }
}

impl ExecuteOptions {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Default::default()
        }
    }
}

/// Starts sessions on a backend.
pub struct SessionLauncher<'a, B> {
    backend: &'a B,
}

impl<'a, B: KernelBackend> SessionLauncher<'a, B> {
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Launch a kernel and return a connected, `Ready` session.
    ///
    /// The kernel may still be initializing when this returns.
    pub async fn start(&self, options: &LaunchOptions) -> Result<Session<B::Connection>> {
        if options.name.trim().is_empty() {
            return Err(SessionError::LaunchFailure(
                "No kernel name given".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let shared = new_shared(SessionStatus::Connecting);

        info!("[session] Starting {} kernel for session {}", options.name, id);
        let (connection, inbound) = self.backend.start(&options.name).await?;
        let router_task = OutputRouter::new(id.clone(), inbound, shared.clone()).spawn();

        lock(&shared).status = SessionStatus::Ready;
        info!(
            "[session] Session {} ready (kernel {})",
            id,
            connection.kernel_id()
        );

        Ok(Session {
            id,
            kernel_name: options.name.clone(),
            connection: Some(connection),
            shared,
            router_task: Some(router_task),
        })
    }
}

/// A live connection to one kernel, owned by the caller.
pub struct Session<C: KernelConnection> {
    id: String,
    kernel_name: String,
    /// `None` once the kernel has been shut down.
    connection: Option<C>,
    shared: Shared,
    router_task: Option<JoinHandle<()>>,
}

impl<C: KernelConnection> Session<C> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn kernel_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.kernel_id())
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.shared).status
    }

    /// Message id of the execution in flight, if any.
    pub fn executing(&self) -> Option<String> {
        lock(&self.shared).active.as_ref().map(|a| a.msg_id.clone())
    }

    fn closed_error(&self) -> SessionError {
        SessionError::SessionClosed {
            id: self.id.clone(),
        }
    }

    /// Submit `code` with default options.
    pub async fn execute(&mut self, code: &str) -> Result<ExecutionFuture> {
        self.submit(ExecuteOptions::new(code)).await
    }

    /// Submit `code` and wait for all of its output.
    pub async fn run(&mut self, code: &str) -> Result<ExecutionResult> {
        self.execute(code).await?.wait().await
    }

    /// Send one execute request and return a handle to its outputs.
    ///
    /// Only one execution may be in flight; a second submission before the
    /// first reaches its terminal message fails with `SessionBusy`.
    pub async fn submit(&mut self, options: ExecuteOptions) -> Result<ExecutionFuture> {
        let Some(code) = options.code else {
            return Err(SessionError::InvalidArgument(
                "code must not be null".to_string(),
            ));
        };

        let msg_id = Uuid::new_v4().to_string();

        // Register msg_id before sending so the router can attribute replies
        let rx = {
            let mut shared = lock(&self.shared);
            match shared.status {
                SessionStatus::Ready => {}
                SessionStatus::Connecting | SessionStatus::Executing => {
                    return Err(SessionError::SessionBusy {
                        id: self.id.clone(),
                    })
                }
                SessionStatus::Closing | SessionStatus::Closed | SessionStatus::Unknown => {
                    return Err(self.closed_error())
                }
            }
            if shared.inbound_closed {
                return Err(SessionError::TransportError(
                    "Kernel connection closed".to_string(),
                ));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            shared.active = Some(ActiveExecution {
                msg_id: msg_id.clone(),
                tx,
                execution_count: None,
            });
            shared.status = SessionStatus::Executing;
            rx
        };

        let request = ExecuteRequest {
            msg_id: msg_id.clone(),
            code,
            silent: options.silent,
            store_history: options.store_history,
            stop_on_error: options.stop_on_error,
        };

        // Rolled back if the send fails or the caller drops this future
        let pending = PendingExecution {
            shared: self.shared.clone(),
            msg_id: msg_id.clone(),
            armed: true,
        };

        let sent = match self.connection.as_mut() {
            Some(connection) => connection.send_execute(&request).await,
            None => Err(self.closed_error()),
        };

        if let Err(e) = sent {
            return Err(match e {
                SessionError::TransportError(_) | SessionError::SessionClosed { .. } => e,
                other => SessionError::TransportError(other.to_string()),
            });
        }
        pending.disarm();

        info!(
            "[session] Sent execute_request: session={} msg_id={}",
            self.id, msg_id
        );
        Ok(ExecutionFuture::new(msg_id, self.id.clone(), rx))
    }

    /// Shut the kernel down.
    ///
    /// Shutting down a `Closed` session again succeeds without doing
    /// anything. If the backend refuses, or this future is dropped before
    /// the backend answers, the session becomes `Unknown` and the kernel must
    /// be considered leaked.
    pub async fn shutdown(&mut self) -> Result<()> {
        {
            let mut shared = lock(&self.shared);
            match shared.status {
                SessionStatus::Closed => {
                    debug!("[session] Session {} already closed", self.id);
                    return Ok(());
                }
                SessionStatus::Unknown => return Err(self.closed_error()),
                _ => {}
            }

            shared.status = SessionStatus::Closing;
            if let Some(active) = shared.active.take() {
                let _ = active.tx.send(Err(self.closed_error()));
            }
        }

        info!("[session] Shutting down session {}", self.id);

        if let Some(task) = self.router_task.take() {
            task.abort();
        }

        let pending = PendingShutdown {
            shared: self.shared.clone(),
            session_id: self.id.clone(),
            armed: true,
        };
        let result = match self.connection.as_mut() {
            Some(connection) => connection.shutdown().await,
            None => Ok(()),
        };
        pending.disarm();

        match result {
            Ok(()) => {
                self.connection = None;
                lock(&self.shared).status = SessionStatus::Closed;
                info!("[session] Session {} closed", self.id);
                Ok(())
            }
            Err(e) => {
                lock(&self.shared).status = SessionStatus::Unknown;
                error!(
                    "[session] Shutdown of session {} failed, kernel leaked: {}",
                    self.id, e
                );
                Err(match e {
                    SessionError::TeardownFailure(_) => e,
                    other => SessionError::TeardownFailure(other.to_string()),
                })
            }
        }
    }
}

/// An execution registered on the session whose request has not been sent
/// yet. Dropping it frees the session again.
struct PendingExecution {
    shared: Shared,
    msg_id: String,
    armed: bool,
}

impl PendingExecution {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingExecution {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut shared = lock(&self.shared);
        if !shared.active.as_ref().is_some_and(|a| a.msg_id == self.msg_id) {
            return;
        }
        shared.active = None;
        if shared.status == SessionStatus::Executing {
            shared.status = SessionStatus::Ready;
        }
        debug!("[session] Execute request {} was not sent", self.msg_id);
    }
}

/// A shutdown waiting on the backend. Dropping it means the kernel's fate
/// is unknown.
struct PendingShutdown {
    shared: Shared,
    session_id: String,
    armed: bool,
}

impl PendingShutdown {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingShutdown {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        lock(&self.shared).status = SessionStatus::Unknown;
        error!(
            "[session] Shutdown of session {} was abandoned, kernel leaked",
            self.session_id
        );
    }
}

impl<C: KernelConnection> Drop for Session<C> {
    fn drop(&mut self) {
        if let Some(task) = self.router_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_status_display() {
        assert_eq!(SessionStatus::Connecting.to_string(), "connecting");
        assert_eq!(SessionStatus::Ready.to_string(), "ready");
        assert_eq!(SessionStatus::Executing.to_string(), "executing");
        assert_eq!(SessionStatus::Closing.to_string(), "closing");
        assert_eq!(SessionStatus::Closed.to_string(), "closed");
        assert_eq!(SessionStatus::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_session_status_serialize() {
        let json = serde_json::to_string(&SessionStatus::Executing).unwrap();
        assert_eq!(json, "\"executing\"");
        assert!(SessionStatus::Unknown.is_terminal());
        assert!(!SessionStatus::Closing.is_terminal());
    }

    #[test]
    fn test_execute_options_from_host_json() {
        let options: ExecuteOptions = serde_json::from_str(r#"{"code": "1 + 1"}"#).unwrap();
        assert_eq!(options, ExecuteOptions::new("1 + 1"));
        assert!(options.store_history);

        let null: ExecuteOptions =
            serde_json::from_str(r#"{"code": null, "silent": true}"#).unwrap();
        assert!(null.code.is_none());
        assert!(null.silent);
    }
}
