//! The seam between sessions and whatever actually runs kernels.

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::WireMessage;
use crate::spec::KernelSpecs;

/// Inbound messages from one kernel, in transport order.
pub type Inbound = mpsc::Receiver<WireMessage>;

/// Parameters of a single `execute_request`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    /// Message id the kernel will echo back in `parent_header.msg_id`.
    pub msg_id: String,
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub stop_on_error: bool,
}

/// Kernel discovery and launch.
pub trait KernelBackend: Send + Sync {
    type Connection: KernelConnection;

    /// List installed kernel specs and the default name.
    fn list_specs(&self) -> impl Future<Output = Result<KernelSpecs>> + Send;

    /// Launch the named kernel and connect to it.
    fn start(&self, name: &str) -> impl Future<Output = Result<(Self::Connection, Inbound)>> + Send;
}

/// An established connection to one running kernel.
pub trait KernelConnection: Send + 'static {
    /// Identity of the kernel this connection talks to.
    fn kernel_id(&self) -> &str;

    /// Send one execute request on the shell channel.
    fn send_execute(&mut self, request: &ExecuteRequest) -> impl Future<Output = Result<()>> + Send;

    /// Ask the kernel to shut down and release local resources.
    fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send;
}
