//! Kernel protocol engine.
//!
//! Owns one worker thread and its proxy, gates every request on startup,
//! keeps exactly one execution in flight and turns the worker's
//! notification stream into per-execution output plus a broadcast of
//! [`KernelEvent`]s for anyone else listening.

use std::sync::{Arc, Mutex};

use jupyter_protocol::{
    CommClose, CommInfoReply, CommInfoRequest, CommMsg, CommOpen, CompleteReply, CompleteRequest,
    ExecuteRequest, InputReply, InspectReply, InspectRequest, IsCompleteReply, IsCompleteRequest,
    ReplyStatus,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use shared_channel::SharedChannel;

use crate::comm::{CommMessage, CommRegistry, CommRouter};
use crate::error::KernelError;
use crate::execution::{ExecutionOutcome, PendingExecution};
use crate::interpreter::{Interpreter, WorkerIo};
use crate::lock;
use crate::logger::{FacadeLogSink, LogSink};
use crate::options::KernelOptions;
use crate::protocol::{
    display_id, media_bundle, KernelInfo, ParentContext, WorkerNotification, WorkerRequest,
};
use crate::proxy::{NotificationHandler, RemoteInterpreter};
use crate::ready::ReadyGate;
use crate::worker::WorkerHandle;

/// Capacity of the event broadcast; slow subscribers lag rather than block.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelStatus {
    /// Worker spawned, initialization not finished
    Starting,
    /// Idle and accepting requests
    Ready,
    /// An execute_request is in flight
    Executing,
    /// Initialization failed or the worker died; terminal
    Failed,
    /// Torn down; terminal
    Disposed,
}

impl std::fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelStatus::Starting => write!(f, "starting"),
            KernelStatus::Ready => write!(f, "ready"),
            KernelStatus::Executing => write!(f, "executing"),
            KernelStatus::Failed => write!(f, "failed"),
            KernelStatus::Disposed => write!(f, "disposed"),
        }
    }
}

impl KernelStatus {
    fn is_terminal(self) -> bool {
        matches!(self, KernelStatus::Failed | KernelStatus::Disposed)
    }
}

#[derive(Debug, Clone)]
pub enum KernelEvent {
    Status(KernelStatus),
    Notification {
        parent: Option<ParentContext>,
        notification: WorkerNotification,
    },
}

/// Collaborators injected at construction.
#[derive(Clone)]
pub struct EngineHooks {
    pub logger: Arc<dyn LogSink>,
    pub comm_router: Arc<dyn CommRouter>,
}

impl Default for EngineHooks {
    fn default() -> Self {
        Self {
            logger: Arc::new(FacadeLogSink),
            comm_router: Arc::new(CommRegistry::new()),
        }
    }
}

#[derive(Debug)]
struct EngineState {
    status: KernelStatus,
    pending: Option<PendingExecution>,
    /// Parent of the input_request the worker is parked on.
    awaiting_input: Option<ParentContext>,
}

/// Applies worker notifications to engine state. Runs on the proxy's pump.
struct Dispatcher {
    state: Arc<Mutex<EngineState>>,
    events: broadcast::Sender<KernelEvent>,
    comm_router: Arc<dyn CommRouter>,
}

impl Dispatcher {
    fn route_comm(&self, notification: &WorkerNotification) {
        let message = match notification {
            WorkerNotification::CommOpen(open) => CommMessage::Open(open.clone()),
            WorkerNotification::CommMsg(msg) => CommMessage::Msg(msg.clone()),
            WorkerNotification::CommClose(close) => CommMessage::Close(close.clone()),
            _ => return,
        };
        self.comm_router.route(message);
    }
}

impl NotificationHandler for Dispatcher {
    fn handle(&self, parent: Option<ParentContext>, notification: WorkerNotification) {
        if let WorkerNotification::Unknown { msg_type, .. } = &notification {
            debug!("[kernel-engine] Ignoring unknown notification {}", msg_type);
            return;
        }

        {
            let mut state = lock(&self.state);
            let state = &mut *state;
            let current = state
                .pending
                .as_mut()
                .filter(|pending| pending.owns(parent.as_ref()));

            match &notification {
                WorkerNotification::Stream(stream) => {
                    if let Some(pending) = current {
                        pending.push_stream(&stream.text);
                    }
                }
                WorkerNotification::DisplayData(display) => {
                    if let Some(pending) = current {
                        pending.push(
                            media_bundle(&display.data),
                            display_id(display).map(str::to_string),
                        );
                    }
                }
                WorkerNotification::ExecuteResult(result) => {
                    if let Some(pending) = current {
                        pending.push(media_bundle(&result.data), None);
                    }
                }
                WorkerNotification::UpdateDisplayData(update) => match &update.transient.display_id {
                    Some(id) => {
                        if let Some(pending) = current {
                            if !pending.update_display(id, &media_bundle(&update.data)) {
                                debug!("[kernel-engine] No output shown under {}", id);
                            }
                        }
                    }
                    None => warn!("[kernel-engine] update_display_data without a display_id"),
                },
                WorkerNotification::ClearOutput(clear) => {
                    if let Some(pending) = current {
                        pending.clear(clear.wait);
                    }
                }
                WorkerNotification::ExecuteError(error) => {
                    if let Some(pending) = current {
                        pending.fail(error.clone());
                    }
                }
                WorkerNotification::InputRequest(_) => {
                    let owner = parent
                        .clone()
                        .or_else(|| current.map(|pending| pending.parent().clone()));
                    state.awaiting_input = Some(owner.unwrap_or_else(|| {
                        ParentContext::new("", "execute_request")
                    }));
                }
                WorkerNotification::CommOpen(_)
                | WorkerNotification::CommMsg(_)
                | WorkerNotification::CommClose(_)
                | WorkerNotification::Unknown { .. } => {}
            }
        }

        self.route_comm(&notification);
        let _ = self.events.send(KernelEvent::Notification {
            parent,
            notification,
        });
    }
}

/// One kernel instance: a worker thread plus the protocol state around it.
pub struct KernelEngine {
    id: String,
    session: String,
    state: Arc<Mutex<EngineState>>,
    proxy: Arc<RemoteInterpreter>,
    worker: Mutex<Option<WorkerHandle>>,
    channel: SharedChannel,
    gate: Arc<ReadyGate>,
    /// Held for the whole of an execution; queues a second caller.
    execution: tokio::sync::Mutex<()>,
    events: broadcast::Sender<KernelEvent>,
    startup: Mutex<Option<JoinHandle<()>>>,
    runtime: Handle,
}

fn set_status(
    state: &Mutex<EngineState>,
    events: &broadcast::Sender<KernelEvent>,
    next: KernelStatus,
) -> bool {
    let mut state = lock(state);
    if state.status == next || state.status.is_terminal() {
        return false;
    }
    state.status = next;
    drop(state);
    let _ = events.send(KernelEvent::Status(next));
    true
}

/// The engine's side of one running execution.
///
/// Dropping it, whether after the reply or because the caller abandoned
/// the `execute` future, discards the accumulator and any pending input
/// request and moves a live engine back to `Ready`.
struct ExecutionTurn<'a> {
    state: &'a Mutex<EngineState>,
    events: &'a broadcast::Sender<KernelEvent>,
    finished: bool,
}

impl ExecutionTurn<'_> {
    fn reset(&self) -> Option<PendingExecution> {
        let pending = {
            let mut state = lock(self.state);
            state.awaiting_input = None;
            state.pending.take()
        };
        set_status(self.state, self.events, KernelStatus::Ready);
        pending
    }

    fn finish(mut self) -> Option<PendingExecution> {
        self.finished = true;
        self.reset()
    }
}

impl Drop for ExecutionTurn<'_> {
    fn drop(&mut self) {
        if !self.finished && self.reset().is_some() {
            debug!("[kernel-engine] Execution abandoned before its reply");
        }
    }
}

impl KernelEngine {
    /// Spawn the worker and start initialization in the background.
    ///
    /// Returns immediately in [`KernelStatus::Starting`]. Must be called
    /// from within a Tokio runtime.
    pub fn spawn<F, I>(options: KernelOptions, hooks: EngineHooks, factory: F) -> Result<Self, KernelError>
    where
        F: FnOnce(WorkerIo) -> I + Send + 'static,
        I: Interpreter + 'static,
    {
        options.validate().map_err(KernelError::InvalidRequest)?;
        let runtime = Handle::try_current()
            .map_err(|e| KernelError::Spawn(format!("no Tokio runtime: {e}")))?;

        let id = petname::petname(2, "-").unwrap_or_else(|| Uuid::new_v4().to_string());
        let channel = SharedChannel::new(options.stdin_capacity);
        let (worker, outbound) =
            WorkerHandle::spawn(&id, channel.clone(), hooks.logger.clone(), factory)?;
        let proxy = Arc::new(RemoteInterpreter::new(worker.inbox(), outbound));

        let state = Arc::new(Mutex::new(EngineState {
            status: KernelStatus::Starting,
            pending: None,
            awaiting_input: None,
        }));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let gate = Arc::new(ReadyGate::new());

        let dispatcher = Arc::new(Dispatcher {
            state: state.clone(),
            events: events.clone(),
            comm_router: hooks.comm_router,
        });

        info!("[kernel-engine] Starting kernel {}", id);
        let startup = runtime.spawn(start(
            id.clone(),
            proxy.clone(),
            dispatcher,
            options,
            gate.clone(),
            state.clone(),
            events.clone(),
        ));

        Ok(Self {
            id,
            session: Uuid::new_v4().to_string(),
            state,
            proxy,
            worker: Mutex::new(Some(worker)),
            channel,
            gate,
            execution: tokio::sync::Mutex::new(()),
            events,
            startup: Mutex::new(Some(startup)),
            runtime,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn status(&self) -> KernelStatus {
        lock(&self.state).status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KernelEvent> {
        self.events.subscribe()
    }

    fn ensure_live(&self) -> Result<(), KernelError> {
        if lock(&self.state).status == KernelStatus::Disposed {
            return Err(KernelError::Disposed);
        }
        Ok(())
    }

    /// Resolve once initialization succeeded.
    pub async fn wait_ready(&self) -> Result<(), KernelError> {
        self.ensure_live()?;
        self.gate.wait().await
    }

    fn parent(&self, msg_type: &str) -> ParentContext {
        ParentContext::new(&self.session, msg_type)
    }

    /// Errors caused by teardown read as `Disposed` rather than `WorkerGone`.
    /// Losing the worker any other way leaves the engine `Failed`.
    fn settle<T>(&self, result: Result<T, KernelError>) -> Result<T, KernelError> {
        match result {
            Err(KernelError::WorkerGone) if self.status() == KernelStatus::Disposed => {
                Err(KernelError::Disposed)
            }
            Err(KernelError::WorkerGone) => {
                if set_status(&self.state, &self.events, KernelStatus::Failed) {
                    error!("[kernel-engine] Worker for kernel {} is gone", self.id);
                }
                Err(KernelError::WorkerGone)
            }
            other => other,
        }
    }

    pub async fn kernel_info(&self) -> Result<KernelInfo, KernelError> {
        self.wait_ready().await?;
        let result = self.proxy.kernel_info().await;
        self.settle(result)
    }

    /// Run one execute_request to completion.
    ///
    /// A second caller waits until the first execution's reply has been
    /// processed.
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecutionOutcome, KernelError> {
        self.wait_ready().await?;
        let _turn = self.execution.lock().await;

        let parent = self.parent("execute_request");
        {
            let mut state = lock(&self.state);
            match state.status {
                KernelStatus::Disposed => return Err(KernelError::Disposed),
                KernelStatus::Failed => return Err(KernelError::WorkerGone),
                _ => {}
            }
            state.pending = Some(PendingExecution::new(parent.clone()));
        }
        set_status(&self.state, &self.events, KernelStatus::Executing);
        let turn = ExecutionTurn {
            state: &self.state,
            events: &self.events,
            finished: false,
        };
        debug!("[kernel-engine] Executing {}", parent.msg_id);

        let result = self.proxy.execute(request, parent).await;
        let result = self.settle(result);
        let pending = turn.finish();

        let reply = result?;
        let pending = pending.ok_or(KernelError::Disposed)?;
        Ok(pending.finish(reply))
    }

    pub async fn complete(&self, request: CompleteRequest) -> Result<CompleteReply, KernelError> {
        let length = request.code.chars().count();
        if request.cursor_pos > length {
            return Err(KernelError::InvalidRequest(format!(
                "cursor_pos {} is past the end of {} characters",
                request.cursor_pos, length
            )));
        }
        self.wait_ready().await?;
        let result = self
            .proxy
            .complete(request, self.parent("complete_request"))
            .await;
        self.settle(result)
    }

    pub async fn inspect(&self, request: InspectRequest) -> Result<InspectReply, KernelError> {
        let length = request.code.chars().count();
        if request.cursor_pos > length {
            return Err(KernelError::InvalidRequest(format!(
                "cursor_pos {} is past the end of {} characters",
                request.cursor_pos, length
            )));
        }
        self.wait_ready().await?;
        let result = self
            .proxy
            .inspect(request, self.parent("inspect_request"))
            .await;
        self.settle(result)
    }

    pub async fn is_complete(&self, request: IsCompleteRequest) -> Result<IsCompleteReply, KernelError> {
        self.wait_ready().await?;
        let result = self
            .proxy
            .is_complete(request, self.parent("is_complete_request"))
            .await;
        self.settle(result)
    }

    pub async fn comm_info(&self, request: CommInfoRequest) -> Result<CommInfoReply, KernelError> {
        self.wait_ready().await?;
        let result = self
            .proxy
            .comm_info(request, self.parent("comm_info_request"))
            .await;
        self.settle(result)
    }

    fn check_comm_id(comm_id: &str) -> Result<(), KernelError> {
        if comm_id.trim().is_empty() {
            return Err(KernelError::InvalidRequest("comm_id must not be empty".to_string()));
        }
        Ok(())
    }

    pub async fn comm_open(
        &self,
        comm_id: &str,
        target_name: &str,
        data: Map<String, Value>,
    ) -> Result<(), KernelError> {
        Self::check_comm_id(comm_id)?;
        if target_name.is_empty() {
            return Err(KernelError::InvalidRequest("target_name must not be empty".to_string()));
        }
        self.wait_ready().await?;
        let content = CommOpen {
            comm_id: comm_id.to_string().into(),
            target_name: target_name.to_string(),
            data,
            target_module: None,
        };
        let result = self.proxy.comm_open(content, self.parent("comm_open")).await;
        self.settle(result)
    }

    pub async fn comm_msg(&self, comm_id: &str, data: Map<String, Value>) -> Result<(), KernelError> {
        Self::check_comm_id(comm_id)?;
        self.wait_ready().await?;
        let content = CommMsg {
            comm_id: comm_id.to_string().into(),
            data,
        };
        let result = self.proxy.comm_msg(content, self.parent("comm_msg")).await;
        self.settle(result)
    }

    pub async fn comm_close(&self, comm_id: &str, data: Map<String, Value>) -> Result<(), KernelError> {
        Self::check_comm_id(comm_id)?;
        self.wait_ready().await?;
        let content = CommClose {
            comm_id: comm_id.to_string().into(),
            data,
        };
        let result = self.proxy.comm_close(content, self.parent("comm_close")).await;
        self.settle(result)
    }

    /// Answer the input_request the worker is parked on.
    ///
    /// The value goes through the shared stdin channel first, which is what
    /// unblocks the interpreter. The `input_reply` call is queued behind the
    /// running execution and its result is only logged. A value that does
    /// not fit the channel is rejected before anything is written, and the
    /// worker stays parked.
    pub fn input_reply(&self, value: &str) -> Result<(), KernelError> {
        let parent = {
            let mut state = lock(&self.state);
            if state.status == KernelStatus::Disposed {
                return Err(KernelError::Disposed);
            }
            let parent = state
                .awaiting_input
                .clone()
                .ok_or(KernelError::NoPendingInput)?;
            let length = self.channel.write_value(value)?;
            self.channel.signal(length)?;
            state.awaiting_input = None;
            parent
        };

        let reply = InputReply {
            value: value.to_string(),
            status: ReplyStatus::Ok,
            error: None,
        };
        let pending = self.proxy.send(WorkerRequest::InputReply { reply, parent })?;
        self.runtime.spawn(async move {
            if let Err(e) = pending.value().await {
                debug!("[kernel-engine] input_reply not acknowledged: {}", e);
            }
        });
        Ok(())
    }

    /// Tear the kernel down. Idempotent.
    ///
    /// Terminates the worker without waiting for it, wakes everything
    /// blocked on readiness and makes every later call fail with
    /// [`KernelError::Disposed`].
    pub fn dispose(&self) {
        {
            let mut state = lock(&self.state);
            if state.status == KernelStatus::Disposed {
                return;
            }
            state.status = KernelStatus::Disposed;
            state.pending = None;
            state.awaiting_input = None;
        }
        let _ = self.events.send(KernelEvent::Status(KernelStatus::Disposed));

        self.gate.close();
        if let Some(mut worker) = lock(&self.worker).take() {
            worker.terminate();
        }
        self.proxy.shutdown();
        if let Some(startup) = lock(&self.startup).take() {
            startup.abort();
        }
        info!("[kernel-engine] Disposed kernel {}", self.id);
    }
}

impl Drop for KernelEngine {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn start(
    id: String,
    proxy: Arc<RemoteInterpreter>,
    dispatcher: Arc<Dispatcher>,
    options: KernelOptions,
    gate: Arc<ReadyGate>,
    state: Arc<Mutex<EngineState>>,
    events: broadcast::Sender<KernelEvent>,
) {
    let result: Result<(), KernelError> = async {
        proxy.register_callback(dispatcher).await?;
        proxy.initialize(options).await
    }
    .await;

    match result {
        Ok(()) => {
            if set_status(&state, &events, KernelStatus::Ready) {
                info!("[kernel-engine] Kernel {} is ready", id);
            }
            gate.open();
        }
        Err(e) => {
            error!("[kernel-engine] Kernel {} failed to start: {}", id, e);
            set_status(&state, &events, KernelStatus::Failed);
            gate.fail(e.to_string());
        }
    }
}
