//! Code-execution backends (spec §4.1). An [`Executor`] owns one isolated,
//! long-lived interpreter process; `execute` pushes one in-band code
//! submission through it and reports back an ordered event stream that
//! always ends in exactly one terminator.

mod pty;

use async_trait::async_trait;
use engine_protocol::Event;
use engine_protocol::KernelStatus;
use engine_protocol::Language;
use tokio::sync::mpsc;

use crate::error::Result;

pub use pty::PtyExecutor;

#[async_trait]
pub trait Executor: Send + Sync {
    async fn start(&self) -> Result<()>;

    /// Runs `code` to completion, returning a channel of events ending in
    /// exactly one terminator. Rejects with [`crate::error::EngineError::Conflict`]
    /// if another `execute` is already in flight on this executor.
    async fn execute(&self, code: String) -> Result<mpsc::Receiver<Event>>;

    /// Cancels the in-flight execution, if any. A no-op returning success
    /// when the executor is idle.
    async fn interrupt(&self) -> Result<()>;

    fn status(&self) -> KernelStatus;

    async fn shutdown(&self) -> Result<()>;
}

/// Builds the concrete executor for a language. Both Python and JavaScript
/// (and TypeScript, run under the same Node REPL via `ts-node`-free plain
/// evaluation) are driven by the same PTY/REPL machinery; only the spawn
/// command and the in-band sentinel differ.
pub fn spawn_executor(language: Language) -> Box<dyn Executor> {
    Box::new(PtyExecutor::new(language))
}
