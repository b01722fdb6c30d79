//! In-flight executions and their collected results.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Result, SessionError};
use crate::message::{OutputMessage, StreamName};
use crate::router::{OutputRouter, Subscription};

/// One submitted piece of code.
///
/// Yields outputs in kernel order. The last item is either a terminal
/// [`OutputMessage`] or an error; after it the stream is exhausted.
pub struct ExecutionFuture {
    msg_id: String,
    session_id: String,
    rx: mpsc::UnboundedReceiver<Result<OutputMessage>>,
    finished: bool,
}

impl ExecutionFuture {
    pub(crate) fn new(
        msg_id: String,
        session_id: String,
        rx: mpsc::UnboundedReceiver<Result<OutputMessage>>,
    ) -> Self {
        Self {
            msg_id,
            session_id,
            rx,
            finished: false,
        }
    }

    /// The `execute_request` message id.
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Hand the remaining outputs to `handler` on a spawned task.
    pub fn subscribe<F>(self, handler: F) -> Subscription
    where
        F: FnMut(Result<OutputMessage>) + Send + 'static,
    {
        OutputRouter::subscribe(self, handler)
    }

    /// Collect every output until the execution resolves.
    pub async fn wait(mut self) -> Result<ExecutionResult> {
        let mut outputs = Vec::new();
        while let Some(item) = self.next().await {
            outputs.push(item?);
        }
        Ok(ExecutionResult::new(self.msg_id, outputs))
    }
}

impl Stream for ExecutionFuture {
    type Item = Result<OutputMessage>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Ok(output))) => {
                if output.is_terminal() {
                    this.finished = true;
                    this.rx.close();
                }
                Poll::Ready(Some(Ok(output)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                this.rx.close();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(Some(Err(SessionError::TransportError(format!(
                    "Execution {} ended without a terminal message",
                    this.msg_id
                )))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Outputs of a finished execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub msg_id: String,
    /// Every output including the terminal one.
    pub outputs: Vec<OutputMessage>,
    /// No error output was produced.
    pub success: bool,
    pub execution_count: Option<u32>,
}

impl ExecutionResult {
    fn new(msg_id: String, outputs: Vec<OutputMessage>) -> Self {
        let success = !outputs
            .iter()
            .any(|o| matches!(o, OutputMessage::Error { .. }));
        let execution_count = outputs.iter().rev().find_map(|o| match o {
            OutputMessage::ExecutionComplete { execution_count }
            | OutputMessage::Display {
                execution_count, ..
            } => *execution_count,
            _ => None,
        });
        Self {
            msg_id,
            outputs,
            success,
            execution_count,
        }
    }

    fn stream_text(&self, stream: StreamName) -> String {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                OutputMessage::Stream { name, text } if *name == stream => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Combined stdout text.
    pub fn stdout(&self) -> String {
        self.stream_text(StreamName::Stdout)
    }

    /// Combined stderr text.
    pub fn stderr(&self) -> String {
        self.stream_text(StreamName::Stderr)
    }

    /// The error output, if the code raised.
    pub fn error(&self) -> Option<&OutputMessage> {
        self.outputs
            .iter()
            .find(|o| matches!(o, OutputMessage::Error { .. }))
    }
}
