//! The seam between the worker host and an embedded interpreter.
//!
//! An [`Interpreter`] runs entirely on the worker thread and may block. It
//! talks back to the control side only through [`WorkerIo`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use jupyter_protocol::{
    ClearOutput, CommClose, CommInfoReply, CommInfoRequest, CommMsg, CommOpen, CompleteReply,
    CompleteRequest, DisplayData, ErrorOutput, ExecuteResult, ExecutionCount, InputReply,
    InputRequest, InspectReply, InspectRequest, IsCompleteReply, IsCompleteRequest, Media, Stdio,
    StreamContent, UpdateDisplayData,
};
use log::{debug, warn};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use shared_channel::SharedChannel;

use crate::logger::LogSink;
use crate::options::KernelOptions;
use crate::protocol::{KernelInfo, ParentContext, RawNotification, WorkerNotification};
use crate::worker::Outbound;

pub trait Interpreter {
    /// One-time setup before any other call.
    fn initialize(&mut self, options: &KernelOptions) -> Result<()>;

    fn kernel_info(&self) -> KernelInfo;

    /// Run `code`. `Ok(Some(data))` becomes an `execute_result`.
    fn execute(&mut self, code: &str, execution_count: ExecutionCount) -> Result<Option<Media>, ErrorOutput>;

    fn complete(&mut self, request: &CompleteRequest) -> CompleteReply;

    fn inspect(&mut self, request: &InspectRequest) -> InspectReply;

    fn is_complete(&mut self, request: &IsCompleteRequest) -> IsCompleteReply;

    fn comm_info(&self, _request: &CommInfoRequest) -> CommInfoReply {
        CommInfoReply::default()
    }

    fn comm_open(&mut self, _content: &CommOpen) -> Result<()> {
        Ok(())
    }

    fn comm_msg(&mut self, _content: &CommMsg) -> Result<()> {
        Ok(())
    }

    fn comm_close(&mut self, _content: &CommClose) -> Result<()> {
        Ok(())
    }

    /// Bookkeeping after a value was delivered through the stdin channel.
    fn input_reply(&mut self, _reply: &InputReply) {}
}

#[derive(Debug, Default)]
struct CallScope {
    parent: Option<ParentContext>,
    allow_stdin: bool,
}

/// The interpreter's handle for emitting notifications and reading stdin.
#[derive(Clone)]
pub struct WorkerIo {
    outbound: mpsc::UnboundedSender<Outbound>,
    channel: SharedChannel,
    terminated: Arc<AtomicBool>,
    logger: Arc<dyn LogSink>,
    scope: Arc<Mutex<CallScope>>,
}

impl WorkerIo {
    pub(crate) fn new(
        outbound: mpsc::UnboundedSender<Outbound>,
        channel: SharedChannel,
        terminated: Arc<AtomicBool>,
        logger: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            outbound,
            channel,
            terminated,
            logger,
            scope: Arc::new(Mutex::new(CallScope::default())),
        }
    }

    /// Attribute subsequent notifications to `parent`.
    pub(crate) fn enter(&self, parent: Option<ParentContext>, allow_stdin: bool) {
        let mut scope = crate::lock(&self.scope);
        scope.parent = parent;
        scope.allow_stdin = allow_stdin;
    }

    pub(crate) fn leave(&self) {
        *crate::lock(&self.scope) = CallScope::default();
    }

    fn parent(&self) -> Option<ParentContext> {
        crate::lock(&self.scope).parent.clone()
    }

    pub fn publish(&self, notification: WorkerNotification) {
        let raw = match RawNotification::encode(&notification, self.parent()) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("[worker] Failed to encode {}: {}", notification.msg_type(), e);
                return;
            }
        };
        if self.outbound.send(Outbound::Notification(raw)).is_err() {
            debug!(
                "[worker] Control side is gone; dropping {}",
                notification.msg_type()
            );
        }
    }

    pub fn stream(&self, name: Stdio, text: &str) {
        if text.is_empty() {
            return;
        }
        self.publish(WorkerNotification::Stream(StreamContent {
            name,
            text: text.to_string(),
        }));
    }

    pub fn display(&self, display: DisplayData) {
        self.publish(WorkerNotification::DisplayData(display));
    }

    pub fn update_display(&self, display: UpdateDisplayData) {
        self.publish(WorkerNotification::UpdateDisplayData(display));
    }

    pub fn clear_output(&self, wait: bool) {
        self.publish(WorkerNotification::ClearOutput(ClearOutput { wait }));
    }

    pub fn execute_result(&self, execution_count: ExecutionCount, data: Media) {
        self.publish(WorkerNotification::ExecuteResult(ExecuteResult::new(
            execution_count,
            data,
        )));
    }

    pub fn comm_open(&self, comm_id: &str, target_name: &str, data: Map<String, Value>) {
        self.publish(WorkerNotification::CommOpen(CommOpen {
            comm_id: comm_id.to_string().into(),
            target_name: target_name.to_string(),
            data,
            target_module: None,
        }));
    }

    pub fn comm_msg(&self, comm_id: &str, data: Map<String, Value>) {
        self.publish(WorkerNotification::CommMsg(CommMsg {
            comm_id: comm_id.to_string().into(),
            data,
        }));
    }

    pub fn comm_close(&self, comm_id: &str) {
        self.publish(WorkerNotification::CommClose(CommClose {
            comm_id: comm_id.to_string().into(),
            data: Map::new(),
        }));
    }

    /// Ask the frontend for a line of input and park until it arrives.
    pub fn read_line(&self, prompt: &str, password: bool) -> Result<String> {
        if !crate::lock(&self.scope).allow_stdin {
            bail!("stdin is not available for this request");
        }
        if self.is_terminated() {
            bail!("kernel is shutting down");
        }
        self.publish(WorkerNotification::InputRequest(InputRequest {
            prompt: prompt.to_string(),
            password,
        }));
        Ok(self.channel.recv_str()?)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Shared flag for progress hooks that need to poll termination.
    pub fn terminated_flag(&self) -> Arc<AtomicBool> {
        self.terminated.clone()
    }

    pub fn logger(&self) -> &dyn LogSink {
        self.logger.as_ref()
    }
}
