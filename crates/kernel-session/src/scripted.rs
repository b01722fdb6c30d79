//! An in-process backend that answers execute requests from a script.
//!
//! Useful for hosts that want the session flow without a Jupyter install,
//! and for tests. Replies are framed like a real kernel's IOPub traffic:
//! `busy`, `execute_input`, the scripted outputs, then `idle`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use log::debug;
use tokio::sync::mpsc;

use crate::backend::{ExecuteRequest, Inbound, KernelBackend, KernelConnection};
use crate::error::{Result, SessionError};
use crate::message::WireMessage;
use crate::spec::{KernelSpec, KernelSpecs};

#[derive(Default)]
struct ScriptState {
    specs: BTreeMap<String, KernelSpec>,
    default_name: Option<String>,
    unreachable: bool,
    replies: HashMap<String, Vec<WireMessage>>,
    hold_replies: bool,
    hang_shutdown: bool,
    held: Vec<(mpsc::Sender<WireMessage>, Vec<WireMessage>)>,
    reject_shutdown: bool,
    sent: Vec<ExecuteRequest>,
    shutdowns: usize,
    launched: usize,
    execution_count: u32,
}

/// Scripted kernel backend. Clones share the same script and records.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<StdMutex<ScriptState>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with a single `python3` spec.
    pub fn python() -> Self {
        Self::new().with_spec(KernelSpec::new("python3", "Python 3", Some("python")))
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_spec(self, spec: KernelSpec) -> Self {
        self.state().specs.insert(spec.name.clone(), spec);
        self
    }

    /// Report `name` as the default even if it is not listed.
    pub fn with_default(self, name: &str) -> Self {
        self.state().default_name = Some(name.to_string());
        self
    }

    /// Outputs sent (between `execute_input` and `idle`) when `code` runs.
    pub fn reply(self, code: &str, outputs: Vec<WireMessage>) -> Self {
        self.state().replies.insert(code.to_string(), outputs);
        self
    }

    /// Make spec listing fail as if the backend could not be reached.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    /// Refuse shutdown requests.
    pub fn set_reject_shutdown(&self, reject: bool) {
        self.state().reject_shutdown = reject;
    }

    /// Make shutdown wait forever, like a kernel that never answers
    /// `shutdown_request`.
    pub fn set_hang_shutdown(&self, hang: bool) {
        self.state().hang_shutdown = hang;
    }

    /// Queue replies instead of sending them until [`release_held`](Self::release_held).
    pub fn set_hold_replies(&self, hold: bool) {
        self.state().hold_replies = hold;
    }

    /// Send every held reply, in submission order.
    pub async fn release_held(&self) {
        let held = std::mem::take(&mut self.state().held);
        for (tx, messages) in held {
            for message in messages {
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        }
    }

    /// Execute requests received so far.
    pub fn sent(&self) -> Vec<ExecuteRequest> {
        self.state().sent.clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.state().shutdowns
    }

    pub fn launched(&self) -> usize {
        self.state().launched
    }
}

impl KernelBackend for ScriptedBackend {
    type Connection = ScriptedConnection;

    async fn list_specs(&self) -> Result<KernelSpecs> {
        let state = self.state();
        if state.unreachable {
            return Err(SessionError::SpecUnavailable(
                "Scripted backend unreachable".to_string(),
            ));
        }
        let specs = state.specs.values().cloned();
        let mut listing = KernelSpecs::from_specs(specs, state.default_name.as_deref())
            .ok_or_else(|| SessionError::SpecUnavailable("No kernel specs installed".to_string()))?;
        if let Some(default_name) = &state.default_name {
            listing.default_name = default_name.clone();
        }
        Ok(listing)
    }

    async fn start(&self, name: &str) -> Result<(ScriptedConnection, Inbound)> {
        let mut state = self.state();
        if !state.specs.contains_key(name) {
            return Err(SessionError::LaunchFailure(format!(
                "No such kernel: {}",
                name
            )));
        }
        state.launched += 1;
        let kernel_id = format!("scripted-{}-{}", name, state.launched);
        debug!("[scripted] Started {}", kernel_id);

        let (tx, inbound) = mpsc::channel(64);
        let connection = ScriptedConnection {
            kernel_id,
            tx: Some(tx),
            state: self.state.clone(),
        };
        Ok((connection, inbound))
    }
}

pub struct ScriptedConnection {
    kernel_id: String,
    tx: Option<mpsc::Sender<WireMessage>>,
    state: Arc<StdMutex<ScriptState>>,
}

impl ScriptedConnection {
    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KernelConnection for ScriptedConnection {
    fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    async fn send_execute(&mut self, request: &ExecuteRequest) -> Result<()> {
        let tx = self
            .tx
            .clone()
            .ok_or_else(|| SessionError::TransportError("Kernel connection closed".to_string()))?;

        let (messages, hold) = {
            let mut state = self.state();
            state.sent.push(request.clone());
            state.execution_count += 1;

            let mut messages = vec![
                WireMessage::status("busy"),
                WireMessage::execute_input(&request.code, state.execution_count),
            ];
            if let Some(outputs) = state.replies.get(&request.code) {
                messages.extend(outputs.iter().cloned());
            }
            messages.push(WireMessage::status("idle"));

            let messages: Vec<WireMessage> = messages
                .into_iter()
                .map(|m| {
                    if m.parent_header.is_some() {
                        m
                    } else {
                        m.with_parent(&request.msg_id)
                    }
                })
                .collect();

            if state.hold_replies {
                state.held.push((tx.clone(), messages));
                (Vec::new(), true)
            } else {
                (messages, false)
            }
        };

        if !hold {
            for message in messages {
                tx.send(message).await.map_err(|_| {
                    SessionError::TransportError("Router stopped receiving".to_string())
                })?;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        let hang = {
            let state = self.state();
            if state.reject_shutdown {
                return Err(SessionError::TeardownFailure(format!(
                    "{} refused to shut down",
                    self.kernel_id
                )));
            }
            state.hang_shutdown
        };
        if hang {
            futures::future::pending::<()>().await;
        }

        self.state().shutdowns += 1;
        self.tx = None;
        Ok(())
    }
}
