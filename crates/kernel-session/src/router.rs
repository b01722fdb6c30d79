//! Routes inbound kernel messages to the execution waiting on them.
//!
//! Each session runs one router task. The task owns the session's inbound
//! queue and shares a small piece of state with the session: its status and
//! the currently active execution (msg_id → output sender).

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::Inbound;
use crate::error::{Result, SessionError};
use crate::execution::ExecutionFuture;
use crate::message::{decode, Decoded, OutputMessage, WireMessage};
use crate::session::SessionStatus;

pub(crate) type OutputSender = mpsc::UnboundedSender<Result<OutputMessage>>;

/// The request currently in flight on a session.
pub(crate) struct ActiveExecution {
    pub msg_id: String,
    pub tx: OutputSender,
    /// Taken from `execute_input`, reported with the terminal message.
    pub execution_count: Option<u32>,
}

pub(crate) struct SharedState {
    pub status: SessionStatus,
    pub active: Option<ActiveExecution>,
    /// The transport stopped delivering messages.
    pub inbound_closed: bool,
}

pub(crate) type Shared = Arc<StdMutex<SharedState>>;

pub(crate) fn new_shared(status: SessionStatus) -> Shared {
    Arc::new(StdMutex::new(SharedState {
        status,
        active: None,
        inbound_closed: false,
    }))
}

pub(crate) fn lock(shared: &Shared) -> MutexGuard<'_, SharedState> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SharedState {
    /// Deliver a terminal item and free the session for the next request.
    fn finish(&mut self, item: Result<OutputMessage>) {
        if let Some(active) = self.active.take() {
            if active.tx.send(item).is_err() {
                debug!("[router] Subscriber for {} already gone", active.msg_id);
            }
        }
        if self.status == SessionStatus::Executing {
            self.status = SessionStatus::Ready;
        }
    }
}

/// Dispatch loop for one session's inbound messages.
pub struct OutputRouter {
    session_id: String,
    inbound: Inbound,
    shared: Shared,
}

impl OutputRouter {
    pub(crate) fn new(session_id: String, inbound: Inbound, shared: Shared) -> Self {
        Self {
            session_id,
            inbound,
            shared,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(message) = self.inbound.recv().await {
            self.route(message);
        }

        debug!("[router] Inbound closed for session {}", self.session_id);
        let mut shared = lock(&self.shared);
        shared.inbound_closed = true;
        if shared.active.is_some() {
            shared.finish(Err(SessionError::TransportError(
                "Kernel connection closed during execution".to_string(),
            )));
        }
    }

    fn route(&self, message: WireMessage) {
        if !message.is_iopub() {
            debug!(
                "[router] Ignoring {:?} on channel {:?}",
                message.msg_type(),
                message.channel
            );
            return;
        }

        let mut shared = lock(&self.shared);
        let Some(active) = shared.active.as_mut() else {
            debug!(
                "[router] No execution in flight, dropping {:?}",
                message.msg_type()
            );
            return;
        };

        if let Some(parent) = message.parent_msg_id() {
            if parent != active.msg_id {
                debug!(
                    "[router] Dropping {:?} for stale request {}",
                    message.msg_type(),
                    parent
                );
                return;
            }
        }

        debug!(
            "[router] iopub: type={:?} msg_id={}",
            message.msg_type(),
            active.msg_id
        );

        match decode(&message) {
            Ok(Decoded::Output(output)) if output.is_terminal() => shared.finish(Ok(output)),
            Ok(Decoded::Output(output)) => {
                if active.tx.send(Ok(output)).is_err() {
                    debug!("[router] Subscriber for {} unsubscribed", active.msg_id);
                }
            }
            Ok(Decoded::ExecuteInput { execution_count }) => {
                if execution_count.is_some() {
                    active.execution_count = execution_count;
                }
            }
            Ok(Decoded::Idle) => {
                let execution_count = active.execution_count;
                shared.finish(Ok(OutputMessage::ExecutionComplete { execution_count }));
            }
            Ok(Decoded::Ignored) => {}
            Err(e) => warn!("[router] Dropping malformed message: {}", e),
        }
    }

    /// Deliver each item of `future` to `handler` on a spawned task.
    ///
    /// Delivery stops after the terminal item or when the subscription is
    /// cancelled with [`Subscription::unsubscribe`].
    pub fn subscribe<F>(future: ExecutionFuture, mut handler: F) -> Subscription
    where
        F: FnMut(Result<OutputMessage>) + Send + 'static,
    {
        let msg_id = future.msg_id().to_string();
        let task = tokio::spawn(async move {
            let mut future = future;
            while let Some(item) = future.next().await {
                handler(item);
            }
        });
        Subscription { msg_id, task }
    }
}

/// Handle to an active [`OutputRouter::subscribe`] delivery task.
pub struct Subscription {
    msg_id: String,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    /// True once the terminal item was handled or the subscription cancelled.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop delivering to the handler. The kernel keeps running the code.
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    /// Wait until the handler has seen the terminal item.
    pub async fn finished(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("[router] Handler for {} panicked", self.msg_id);
            }
        }
    }
}
