//! kernel-session - run code against a live kernel from any host.
//!
//! The flow mirrors what an editor's "run" action does:
//!
//! 1. [`SpecResolver`] lists installed kernel specs and the default one.
//! 2. [`SessionLauncher`] starts a kernel and returns a [`Session`].
//! 3. [`Session::execute`] sends one execute request and returns an
//!    [`ExecutionFuture`].
//! 4. The session's [`OutputRouter`] task streams IOPub output to that
//!    future, or to a handler registered with [`OutputRouter::subscribe`].
//! 5. [`Session::shutdown`] releases the kernel.
//!
//! A session runs one execution at a time and is reused across executions.
//! Kernels are provided by a [`KernelBackend`]: [`JupyterBackend`] for
//! local Jupyter kernels, [`ScriptedBackend`] for in-process scripted ones.
//!
//! ```no_run
//! use kernel_session::{JupyterBackend, LaunchOptions, SessionConfig, SessionLauncher, SpecResolver};
//!
//! # async fn demo() -> kernel_session::Result<()> {
//! let backend = JupyterBackend::new(SessionConfig::from_env());
//! let specs = SpecResolver::new(&backend).list_specs().await?;
//! let mut session = SessionLauncher::new(&backend)
//!     .start(&LaunchOptions::new(specs.default_name))
//!     .await?;
//! let result = session.run("print(1)").await?;
//! assert_eq!(result.stdout(), "1\n");
//! session.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod execution;
pub mod jupyter;
pub mod message;
pub mod router;
pub mod scripted;
pub mod session;
pub mod spec;

pub use backend::{ExecuteRequest, Inbound, KernelBackend, KernelConnection};
pub use config::SessionConfig;
pub use error::{Result, SessionError};
pub use execution::{ExecutionFuture, ExecutionResult};
pub use jupyter::{JupyterBackend, JupyterConnection};
pub use message::{OutputMessage, StreamName, WireHeader, WireMessage};
pub use router::{OutputRouter, Subscription};
pub use scripted::{ScriptedBackend, ScriptedConnection};
pub use session::{ExecuteOptions, LaunchOptions, Session, SessionLauncher, SessionStatus};
pub use spec::{KernelSpec, KernelSpecs, SpecResolver};
