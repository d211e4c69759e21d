//! worker-kernel - a Jupyter-style kernel whose interpreter runs on a
//! dedicated worker thread.
//!
//! The control side is async and never blocks. The interpreter side is
//! synchronous and may block for as long as it likes, including while it
//! waits for a line of stdin. The two talk over three paths:
//!
//! - an ordered call queue from [`RemoteInterpreter`] to the worker
//! - one ordered outbound queue carrying both replies and notifications
//! - a [`SharedChannel`] the worker parks on while waiting for input
//!
//! [`KernelEngine`] adds the protocol on top: startup gating, one execution
//! at a time, output accumulation and an event broadcast. [`CodeRunner`]
//! reduces a whole execution to a single MIME map.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod comm;
pub mod engine;
pub mod error;
pub mod execution;
pub mod interpreter;
pub mod logger;
pub mod options;
pub mod protocol;
pub mod proxy;
pub mod ready;
pub mod rhai_backend;
pub mod runner;
pub mod worker;

pub use shared_channel::{ChannelError, SharedChannel};

pub use comm::{CommMessage, CommRegistry, CommRouter, CommSnapshot};
pub use engine::{EngineHooks, KernelEngine, KernelEvent, KernelStatus};
pub use error::KernelError;
pub use execution::ExecutionOutcome;
pub use interpreter::{Interpreter, WorkerIo};
pub use logger::{FacadeLogSink, LogSink};
pub use options::KernelOptions;
pub use proxy::{NotificationHandler, RemoteInterpreter};
pub use rhai_backend::RhaiInterpreter;
pub use runner::{CodeRunner, ExecutionError, RunOutput};

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
