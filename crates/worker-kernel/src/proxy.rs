//! Control-side proxy for the interpreter living on the worker thread.
//!
//! Every method enqueues one call and awaits its reply. A pump task drains
//! the worker's outbound queue in order: notifications go to the registered
//! [`NotificationHandler`], replies resolve the matching pending call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use jupyter_protocol::{
    CommClose, CommInfoReply, CommInfoRequest, CommMsg, CommOpen, CompleteReply, CompleteRequest,
    ExecuteReply, ExecuteRequest, InputReply, InspectReply, InspectRequest, IsCompleteReply,
    IsCompleteRequest,
};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::KernelError;
use crate::lock;
use crate::options::KernelOptions;
use crate::protocol::{KernelInfo, ParentContext, WorkerNotification, WorkerRequest};
use crate::worker::{Inbound, Outbound};

/// Receives every notification the worker emits, in emission order.
pub trait NotificationHandler: Send + Sync {
    fn handle(&self, parent: Option<ParentContext>, notification: WorkerNotification);
}

type ReplySender = oneshot::Sender<Result<Value, String>>;

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<u64, ReplySender>,
    closed: bool,
}

impl PendingCalls {
    /// Stop accepting calls and drop every waiter, which rejects them.
    fn close(&mut self) {
        self.closed = true;
        self.calls.clear();
    }
}

/// A call that has been enqueued but not yet answered.
pub(crate) struct PendingReply {
    method: &'static str,
    rx: oneshot::Receiver<Result<Value, String>>,
}

impl PendingReply {
    pub(crate) async fn value(self) -> Result<Value, KernelError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(KernelError::Remote {
                method: self.method.to_string(),
                message,
            }),
            Err(_) => Err(KernelError::WorkerGone),
        }
    }

    pub(crate) async fn decode<T: DeserializeOwned>(self) -> Result<T, KernelError> {
        let method = self.method;
        let value = self.value().await?;
        serde_json::from_value(value).map_err(|e| KernelError::Protocol {
            method: method.to_string(),
            message: e.to_string(),
        })
    }
}

pub struct RemoteInterpreter {
    inbox: mpsc::UnboundedSender<Inbound>,
    pending: Arc<Mutex<PendingCalls>>,
    handler: Arc<OnceLock<Arc<dyn NotificationHandler>>>,
    next_id: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteInterpreter {
    /// Must be called from within a Tokio runtime; the pump is a task.
    pub(crate) fn new(
        inbox: mpsc::UnboundedSender<Inbound>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        let pending = Arc::new(Mutex::new(PendingCalls::default()));
        let handler = Arc::new(OnceLock::new());
        let pump = tokio::spawn(pump(outbound, pending.clone(), handler.clone()));
        Self {
            inbox,
            pending,
            handler,
            next_id: AtomicU64::new(1),
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Enqueue a call without waiting for its reply.
    pub(crate) fn send(&self, request: WorkerRequest) -> Result<PendingReply, KernelError> {
        let method = request.method();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(KernelError::WorkerGone);
            }
            pending.calls.insert(id, tx);
        }
        if self.inbox.send(Inbound::Call { id, request }).is_err() {
            lock(&self.pending).calls.remove(&id);
            return Err(KernelError::WorkerGone);
        }
        Ok(PendingReply { method, rx })
    }

    pub async fn initialize(&self, options: KernelOptions) -> Result<(), KernelError> {
        self.send(WorkerRequest::Initialize(options))?
            .value()
            .await
            .map(drop)
    }

    /// Install the notification handler. Only the first registration wins.
    pub async fn register_callback(
        &self,
        handler: Arc<dyn NotificationHandler>,
    ) -> Result<(), KernelError> {
        self.handler
            .set(handler)
            .map_err(|_| KernelError::CallbackAlreadyRegistered)?;
        self.send(WorkerRequest::RegisterCallback)?
            .value()
            .await
            .map(drop)
    }

    pub async fn kernel_info(&self) -> Result<KernelInfo, KernelError> {
        self.send(WorkerRequest::KernelInfo)?.decode().await
    }

    pub async fn execute(
        &self,
        request: ExecuteRequest,
        parent: ParentContext,
    ) -> Result<ExecuteReply, KernelError> {
        self.send(WorkerRequest::Execute { request, parent })?
            .decode()
            .await
    }

    pub async fn complete(
        &self,
        request: CompleteRequest,
        parent: ParentContext,
    ) -> Result<CompleteReply, KernelError> {
        self.send(WorkerRequest::Complete { request, parent })?
            .decode()
            .await
    }

    pub async fn inspect(
        &self,
        request: InspectRequest,
        parent: ParentContext,
    ) -> Result<InspectReply, KernelError> {
        self.send(WorkerRequest::Inspect { request, parent })?
            .decode()
            .await
    }

    pub async fn is_complete(
        &self,
        request: IsCompleteRequest,
        parent: ParentContext,
    ) -> Result<IsCompleteReply, KernelError> {
        self.send(WorkerRequest::IsComplete { request, parent })?
            .decode()
            .await
    }

    pub async fn comm_info(
        &self,
        request: CommInfoRequest,
        parent: ParentContext,
    ) -> Result<CommInfoReply, KernelError> {
        self.send(WorkerRequest::CommInfo { request, parent })?
            .decode()
            .await
    }

    pub async fn comm_open(&self, content: CommOpen, parent: ParentContext) -> Result<(), KernelError> {
        self.send(WorkerRequest::CommOpen { content, parent })?
            .value()
            .await
            .map(drop)
    }

    pub async fn comm_msg(&self, content: CommMsg, parent: ParentContext) -> Result<(), KernelError> {
        self.send(WorkerRequest::CommMsg { content, parent })?
            .value()
            .await
            .map(drop)
    }

    pub async fn comm_close(&self, content: CommClose, parent: ParentContext) -> Result<(), KernelError> {
        self.send(WorkerRequest::CommClose { content, parent })?
            .value()
            .await
            .map(drop)
    }

    pub async fn input_reply(&self, reply: InputReply, parent: ParentContext) -> Result<(), KernelError> {
        self.send(WorkerRequest::InputReply { reply, parent })?
            .value()
            .await
            .map(drop)
    }

    /// Reject every outstanding and future call and stop the pump.
    pub fn shutdown(&self) {
        lock(&self.pending).close();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.pending).closed
    }
}

impl Drop for RemoteInterpreter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pump(
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    pending: Arc<Mutex<PendingCalls>>,
    handler: Arc<OnceLock<Arc<dyn NotificationHandler>>>,
) {
    while let Some(message) = outbound.recv().await {
        match message {
            Outbound::Notification(raw) => {
                let msg_type = raw.msg_type.clone();
                match raw.decode() {
                    Ok((parent, notification)) => match handler.get() {
                        Some(handler) => handler.handle(parent, notification),
                        None => warn!("[proxy] Dropping {}: no callback registered", msg_type),
                    },
                    Err(e) => warn!("[proxy] Malformed {} notification: {}", msg_type, e),
                }
            }
            Outbound::Reply { id, result } => {
                let waiter = lock(&pending).calls.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("[proxy] Reply for abandoned call {}", id),
                }
            }
        }
    }
    debug!("[proxy] Worker outbound queue closed; rejecting outstanding calls");
    lock(&pending).close();
}
