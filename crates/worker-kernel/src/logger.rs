/// Log target used for messages an interpreter reports through its sink.
pub const INTERPRETER_LOG_TARGET: &str = "worker_kernel::interpreter";

/// Where interpreter-side log lines go.
pub trait LogSink: Send + Sync {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct FacadeLogSink;

impl LogSink for FacadeLogSink {
    fn info(&self, message: &str) {
        log::info!(target: INTERPRETER_LOG_TARGET, "{}", message);
    }

    fn error(&self, message: &str) {
        log::error!(target: INTERPRETER_LOG_TARGET, "{}", message);
    }
}
