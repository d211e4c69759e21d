//! The dedicated worker thread that hosts an interpreter.
//!
//! The thread owns the interpreter and serves calls strictly in arrival
//! order. Replies and notifications leave through a single outbound queue,
//! so a reply can never overtake the notifications its call produced.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use jupyter_protocol::ExecutionCount;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use shared_channel::SharedChannel;

use crate::error::KernelError;
use crate::interpreter::{Interpreter, WorkerIo};
use crate::logger::LogSink;
use crate::protocol::{
    execute_failed, execute_ok, RawNotification, WorkerNotification, WorkerRequest,
};

/// Messages into the worker.
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Always the first message. Hands over the stdin channel.
    Bootstrap(SharedChannel),
    Call { id: u64, request: WorkerRequest },
    /// Wakes an idle worker so it can observe termination.
    Terminate,
}

/// Messages out of the worker, in emission order.
#[derive(Debug)]
pub(crate) enum Outbound {
    Notification(RawNotification),
    Reply {
        id: u64,
        result: Result<Value, String>,
    },
}

/// Owner's view of a running worker thread.
pub struct WorkerHandle {
    name: String,
    inbox: mpsc::UnboundedSender<Inbound>,
    channel: SharedChannel,
    terminated: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn the worker thread and send it the bootstrap message.
    ///
    /// `factory` runs on the new thread after bootstrap, so the interpreter
    /// itself never has to be `Send`.
    pub(crate) fn spawn<F, I>(
        name: &str,
        channel: SharedChannel,
        logger: Arc<dyn LogSink>,
        factory: F,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Outbound>), KernelError>
    where
        F: FnOnce(WorkerIo) -> I + Send + 'static,
        I: Interpreter + 'static,
    {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));

        let thread_name = format!("worker-{name}");
        let thread_terminated = terminated.clone();
        let thread = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    serve(inbox_rx, outbound_tx, thread_terminated, logger, factory)
                }));
                if outcome.is_err() {
                    error!("[worker] {} panicked; its interpreter is gone", thread_name);
                }
            })
            .map_err(|e| KernelError::Spawn(e.to_string()))?;

        inbox
            .send(Inbound::Bootstrap(channel.clone()))
            .map_err(|_| KernelError::WorkerGone)?;

        info!("[worker] Spawned worker-{}", name);
        Ok((
            Self {
                name: name.to_string(),
                inbox,
                channel,
                terminated,
                thread: Some(thread),
            },
            outbound_rx,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn inbox(&self) -> mpsc::UnboundedSender<Inbound> {
        self.inbox.clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Hard stop.
    ///
    /// Raises the termination flag, closes the stdin channel so a parked
    /// `read_line` returns, and wakes an idle worker. The thread is then
    /// detached. An interpreter that never checks the flag keeps running
    /// until its current call ends, but nothing it produces is delivered.
    pub fn terminate(&mut self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.close();
        let _ = self.inbox.send(Inbound::Terminate);
        if let Some(thread) = self.thread.take() {
            if thread.is_finished() {
                let _ = thread.join();
            }
        }
        info!("[worker] Terminated worker-{}", self.name);
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn serve<F, I>(
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<Outbound>,
    terminated: Arc<AtomicBool>,
    logger: Arc<dyn LogSink>,
    factory: F,
) where
    F: FnOnce(WorkerIo) -> I,
    I: Interpreter,
{
    let channel = match inbox.blocking_recv() {
        Some(Inbound::Bootstrap(channel)) => channel,
        Some(other) => {
            error!("[worker] Expected bootstrap, got {:?}; exiting", other);
            return;
        }
        None => return,
    };

    let io = WorkerIo::new(outbound.clone(), channel, terminated.clone(), logger);
    let mut host = Host::new(factory(io.clone()), io);

    while let Some(message) = inbox.blocking_recv() {
        if terminated.load(Ordering::Acquire) {
            break;
        }
        match message {
            Inbound::Bootstrap(_) => warn!("[worker] Ignoring repeated bootstrap"),
            Inbound::Terminate => break,
            Inbound::Call { id, request } => {
                let method = request.method();
                let result = host.handle(request);
                if let Err(message) = &result {
                    debug!("[worker] {} failed: {}", method, message);
                }
                if outbound.send(Outbound::Reply { id, result }).is_err() {
                    debug!("[worker] Control side is gone");
                    break;
                }
            }
        }
    }
    debug!("[worker] Exiting");
}

/// Per-thread state wrapped around the interpreter.
struct Host<I> {
    interpreter: I,
    io: WorkerIo,
    initialized: bool,
    callback_registered: bool,
    execution_count: ExecutionCount,
}

fn to_reply<T: Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|e| e.to_string())
}

impl<I: Interpreter> Host<I> {
    fn new(interpreter: I, io: WorkerIo) -> Self {
        Self {
            interpreter,
            io,
            initialized: false,
            callback_registered: false,
            execution_count: ExecutionCount::new(0),
        }
    }

    fn handle(&mut self, request: WorkerRequest) -> Result<Value, String> {
        match request {
            WorkerRequest::RegisterCallback => {
                if self.callback_registered {
                    return Err("notification callback is already registered".to_string());
                }
                self.callback_registered = true;
                Ok(Value::Null)
            }
            WorkerRequest::Initialize(options) => {
                if self.initialized {
                    return Err("already initialized".to_string());
                }
                self.interpreter
                    .initialize(&options)
                    .map_err(|e| format!("{e:#}"))?;
                self.initialized = true;
                Ok(Value::Null)
            }
            request => {
                if !self.initialized {
                    return Err(format!("{} before initialize", request.method()));
                }
                if request.emits_notifications() && !self.callback_registered {
                    return Err(format!(
                        "{} before a notification callback was registered",
                        request.method()
                    ));
                }
                let parent = request.parent().cloned();
                self.io.enter(parent, false);
                let result = self.dispatch(request);
                self.io.leave();
                result
            }
        }
    }

    fn dispatch(&mut self, request: WorkerRequest) -> Result<Value, String> {
        match request {
            WorkerRequest::KernelInfo => to_reply(&self.interpreter.kernel_info()),
            WorkerRequest::Execute { request, parent } => {
                if request.store_history && !request.silent {
                    self.execution_count.increment();
                }
                let count = self.execution_count;
                self.io.enter(Some(parent), request.allow_stdin);

                let reply = match self.interpreter.execute(&request.code, count) {
                    Ok(Some(data)) => {
                        if !request.silent {
                            self.io.execute_result(count, data);
                        }
                        execute_ok(count)
                    }
                    Ok(None) => execute_ok(count),
                    Err(error) => {
                        let reply = execute_failed(count, &error);
                        self.io.publish(WorkerNotification::ExecuteError(error));
                        reply
                    }
                };
                to_reply(&reply)
            }
            WorkerRequest::Complete { request, .. } => {
                to_reply(&self.interpreter.complete(&request))
            }
            WorkerRequest::Inspect { request, .. } => to_reply(&self.interpreter.inspect(&request)),
            WorkerRequest::IsComplete { request, .. } => {
                to_reply(&self.interpreter.is_complete(&request))
            }
            WorkerRequest::CommInfo { request, .. } => {
                to_reply(&self.interpreter.comm_info(&request))
            }
            WorkerRequest::CommOpen { content, .. } => {
                self.interpreter
                    .comm_open(&content)
                    .map_err(|e| format!("{e:#}"))?;
                Ok(Value::Null)
            }
            WorkerRequest::CommMsg { content, .. } => {
                self.interpreter
                    .comm_msg(&content)
                    .map_err(|e| format!("{e:#}"))?;
                Ok(Value::Null)
            }
            WorkerRequest::CommClose { content, .. } => {
                self.interpreter
                    .comm_close(&content)
                    .map_err(|e| format!("{e:#}"))?;
                Ok(Value::Null)
            }
            WorkerRequest::InputReply { reply, .. } => {
                self.interpreter.input_reply(&reply);
                Ok(Value::Null)
            }
            WorkerRequest::Initialize(_) | WorkerRequest::RegisterCallback => {
                Err("unexpected lifecycle call".to_string())
            }
        }
    }
}
