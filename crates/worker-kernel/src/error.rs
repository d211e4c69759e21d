use shared_channel::ChannelError;

/// Errors surfaced by the kernel engine and the worker proxy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("Worker is gone")]
    WorkerGone,

    #[error("Kernel has been disposed")]
    Disposed,

    #[error("Kernel failed to start: {0}")]
    StartupFailed(String),

    #[error("Worker rejected {method}: {message}")]
    Remote { method: String, message: String },

    #[error("Malformed worker reply to {method}: {message}")]
    Protocol { method: String, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No input request is pending")]
    NoPendingInput,

    #[error("Notification callback is already registered")]
    CallbackAlreadyRegistered,

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
