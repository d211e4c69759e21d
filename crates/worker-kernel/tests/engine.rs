//! End-to-end tests driving a real worker thread through the engine.
//!
//! Most tests use a line-oriented scripted interpreter so every kind of
//! notification can be produced on demand. The last few run the Rhai
//! backend.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use futures::FutureExt;
use jupyter_protocol::{
    CompleteReply, CompleteRequest, DisplayData, ErrorOutput, ExecuteRequest, ExecutionCount,
    InspectReply, InspectRequest, IsCompleteReply, IsCompleteReplyStatus, IsCompleteRequest, Media,
    MediaType, Stdio, UpdateDisplayData,
};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::time::timeout;

use worker_kernel::protocol::{
    language_info, tagged_display, text_media, KernelInfo, MimeBundle, WorkerNotification,
};
use worker_kernel::{
    ChannelError, CodeRunner, CommRegistry, EngineHooks, FacadeLogSink, Interpreter, KernelEngine,
    KernelError, KernelEvent, KernelOptions, KernelStatus, RunOutput, WorkerIo,
};

const STEP: Duration = Duration::from_secs(5);

/// Runs one command per line:
///
/// `print <text>`, `html <markup>`, `png <base64>`, `result <text>`,
/// `display <id> <text>`, `update <id> <text>`, `clear`, `clear_wait`,
/// `error <name> <message>`, `input <prompt>`, `emit_unknown`,
/// `comm_open <id> <json>`, `comm_msg <id> <json>`, `comm_close <id>`,
/// `sleep <ms>`, `panic`.
struct Scripted {
    io: WorkerIo,
}

fn object(json: &str) -> Map<String, Value> {
    serde_json::from_str(json).unwrap_or_default()
}

fn failure(ename: &str, evalue: &str) -> ErrorOutput {
    ErrorOutput {
        ename: ename.to_string(),
        evalue: evalue.to_string(),
        traceback: vec![
            format!("\x1b[0;31m{ename}\x1b[0m: {evalue}"),
            "\x1b[1m  at line 1\x1b[0m".to_string(),
        ],
    }
}

impl Interpreter for Scripted {
    fn initialize(&mut self, options: &KernelOptions) -> anyhow::Result<()> {
        if options.packages.iter().any(|package| package == "broken") {
            bail!("package broken is not installed");
        }
        Ok(())
    }

    fn kernel_info(&self) -> KernelInfo {
        KernelInfo::new("scripted", "0", language_info("script", "0"))
    }

    fn execute(
        &mut self,
        code: &str,
        _execution_count: ExecutionCount,
    ) -> Result<Option<Media>, ErrorOutput> {
        let mut result = None;
        for line in code.lines() {
            let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
            match command {
                "print" => self.io.stream(Stdio::Stdout, rest),
                "html" => self
                    .io
                    .display(DisplayData::new(MediaType::Html(rest.to_string()).into())),
                "png" => self
                    .io
                    .display(DisplayData::new(MediaType::Png(rest.to_string()).into())),
                "result" => result = Some(text_media(rest)),
                "display" => {
                    let (display_id, text) = rest.split_once(' ').unwrap_or((rest, ""));
                    self.io.display(tagged_display(text_media(text), display_id));
                }
                "update" => {
                    let (display_id, text) = rest.split_once(' ').unwrap_or((rest, ""));
                    self.io
                        .update_display(UpdateDisplayData::new(text_media(text), display_id));
                }
                "clear" => self.io.clear_output(false),
                "clear_wait" => self.io.clear_output(true),
                "error" => {
                    let (name, message) = rest.split_once(' ').unwrap_or((rest, ""));
                    return Err(failure(name, message));
                }
                "input" => match self.io.read_line(rest, false) {
                    Ok(value) => self.io.stream(Stdio::Stdout, &format!("got:{value}")),
                    Err(e) => return Err(failure("StdinError", &e.to_string())),
                },
                "emit_unknown" => self.io.publish(WorkerNotification::Unknown {
                    msg_type: "status".to_string(),
                    content: json!({"execution_state": "busy"}),
                }),
                "comm_open" => {
                    let (comm_id, data) = rest.split_once(' ').unwrap_or((rest, "{}"));
                    self.io.comm_open(comm_id, "test.target", object(data));
                }
                "comm_msg" => {
                    let (comm_id, data) = rest.split_once(' ').unwrap_or((rest, "{}"));
                    self.io.comm_msg(comm_id, object(data));
                }
                "comm_close" => self.io.comm_close(rest),
                "sleep" => thread::sleep(Duration::from_millis(rest.parse().unwrap_or(10))),
                "panic" => panic!("scripted crash"),
                "" => {}
                other => return Err(failure("UnknownCommand", other)),
            }
        }
        Ok(result)
    }

    fn complete(&mut self, request: &CompleteRequest) -> CompleteReply {
        CompleteReply {
            matches: vec!["print".to_string()],
            cursor_start: 0,
            cursor_end: request.cursor_pos,
            ..Default::default()
        }
    }

    fn inspect(&mut self, _request: &InspectRequest) -> InspectReply {
        InspectReply::default()
    }

    fn is_complete(&mut self, _request: &IsCompleteRequest) -> IsCompleteReply {
        IsCompleteReply::complete()
    }
}

fn spawn_with(options: KernelOptions, hooks: EngineHooks) -> Arc<KernelEngine> {
    Arc::new(KernelEngine::spawn(options, hooks, |io| Scripted { io }).unwrap())
}

fn spawn() -> Arc<KernelEngine> {
    spawn_with(KernelOptions::default(), EngineHooks::default())
}

fn request(code: &str) -> ExecuteRequest {
    let mut request = ExecuteRequest::new(code.to_string());
    request.allow_stdin = true;
    request
}

async fn run(engine: &Arc<KernelEngine>, code: &str) -> RunOutput {
    timeout(STEP, CodeRunner::new(engine.clone()).run(code))
        .await
        .expect("run timed out")
        .unwrap()
}

fn texts(outputs: &[MimeBundle]) -> Vec<&str> {
    outputs
        .iter()
        .map(|bundle| bundle["text/plain"].as_str().unwrap())
        .collect()
}

/// Wait for the next input_request and return its prompt.
async fn next_input_request(events: &mut broadcast::Receiver<KernelEvent>) -> String {
    loop {
        let event = timeout(STEP, events.recv())
            .await
            .expect("no input_request")
            .unwrap();
        if let KernelEvent::Notification {
            notification: WorkerNotification::InputRequest(request),
            ..
        } = event
        {
            return request.prompt;
        }
    }
}

#[tokio::test]
async fn test_startup_reaches_ready() {
    let engine = spawn();
    timeout(STEP, engine.wait_ready()).await.unwrap().unwrap();
    assert_eq!(engine.status(), KernelStatus::Ready);
    assert!(!engine.id().is_empty());

    let info = engine.kernel_info().await.unwrap();
    assert_eq!(info.reply.language_info.name, "script");
}

#[tokio::test]
async fn test_stream_fragments_concatenate() {
    let engine = spawn();
    let output = run(&engine, "print x\nprint y").await;
    assert_eq!(output.text(), Some("xy"));
}

#[tokio::test]
async fn test_execute_result_joins_stream_text() {
    let engine = spawn();
    let output = run(&engine, "print 4\nresult 2").await;
    assert_eq!(output.text(), Some("42"));
}

#[tokio::test]
async fn test_image_replaces_html() {
    let engine = spawn();
    let output = run(&engine, "html <table/>\npng aGk=").await;
    let json = output.to_json();
    assert_eq!(json["image/png"], "aGk=");
    assert!(json.get("text/html").is_none());
}

#[tokio::test]
async fn test_runs_do_not_share_outputs() {
    let engine = spawn();
    run(&engine, "print first").await;
    let output = run(&engine, "print second").await;
    assert_eq!(output.text(), Some("second"));
}

#[tokio::test]
async fn test_error_becomes_run_error() {
    let engine = spawn();
    let output = run(&engine, "print partial\nerror ValueError bad input").await;
    match output {
        RunOutput::Error(error) => {
            assert_eq!(error.name, "ValueError");
            assert_eq!(error.message, "bad input");
            assert_eq!(error.stack, "ValueError: bad input\n  at line 1");
        }
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_execute_outcome_tracks_counts_and_errors() {
    let engine = spawn();
    let ok = engine.execute(request("print a")).await.unwrap();
    assert!(ok.is_ok());
    assert_eq!(ok.reply.execution_count.value(), 1);

    let failed = engine.execute(request("error E v")).await.unwrap();
    assert!(!failed.is_ok());
    assert_eq!(failed.reply.execution_count.value(), 2);
    assert_eq!(failed.error.unwrap().ename, "E");
}

#[tokio::test]
async fn test_clear_and_update_display() {
    let engine = spawn();

    let outcome = engine
        .execute(request("print gone\nclear\nprint kept"))
        .await
        .unwrap();
    assert_eq!(texts(&outcome.outputs), vec!["kept"]);

    let outcome = engine
        .execute(request("print old\nclear_wait\nprint new"))
        .await
        .unwrap();
    assert_eq!(texts(&outcome.outputs), vec!["new"]);

    let outcome = engine
        .execute(request("display bar 0%\nprint log\nupdate bar 100%"))
        .await
        .unwrap();
    assert_eq!(texts(&outcome.outputs), vec!["100%", "log"]);
}

#[tokio::test]
async fn test_second_execute_waits_for_first() {
    let engine = spawn();
    engine.wait_ready().await.unwrap();

    let (first, second) = tokio::join!(
        engine.execute(request("sleep 100\nprint first")),
        engine.execute(request("print second")),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(texts(&first.outputs), vec!["first"]);
    assert_eq!(texts(&second.outputs), vec!["second"]);
    assert_eq!(first.reply.execution_count.value(), 1);
    assert_eq!(second.reply.execution_count.value(), 2);
    assert_eq!(engine.status(), KernelStatus::Ready);
}

#[tokio::test]
async fn test_cancelled_execute_returns_to_ready() {
    let engine = spawn();
    engine.wait_ready().await.unwrap();

    let cancelled = timeout(
        Duration::from_millis(50),
        engine.execute(request("sleep 200\nprint abandoned")),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(engine.status(), KernelStatus::Ready);
    assert_eq!(engine.input_reply("x"), Err(KernelError::NoPendingInput));

    // Output from the abandoned run lands after it was dropped.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(engine.status(), KernelStatus::Ready);

    let outcome = timeout(STEP, engine.execute(request("print next")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(texts(&outcome.outputs), vec!["next"]);
    assert_eq!(engine.status(), KernelStatus::Ready);
}

#[tokio::test]
async fn test_status_events() {
    let engine = spawn();
    engine.wait_ready().await.unwrap();
    let mut events = engine.subscribe();

    engine.execute(request("print a")).await.unwrap();

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let KernelEvent::Status(status) = event {
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![KernelStatus::Executing, KernelStatus::Ready]);
}

#[tokio::test]
async fn test_unknown_notifications_are_ignored() {
    let engine = spawn();
    engine.wait_ready().await.unwrap();
    let mut events = engine.subscribe();

    let outcome = engine
        .execute(request("emit_unknown\nprint a"))
        .await
        .unwrap();
    assert_eq!(texts(&outcome.outputs), vec!["a"]);

    while let Ok(event) = events.try_recv() {
        if let KernelEvent::Notification { notification, .. } = event {
            assert_ne!(notification.msg_type(), "status");
        }
    }
}

#[tokio::test]
async fn test_startup_failure_is_terminal() {
    let options = KernelOptions {
        packages: vec!["broken".to_string()],
        ..Default::default()
    };
    let engine = spawn_with(options, EngineHooks::default());

    let err = timeout(STEP, engine.wait_ready()).await.unwrap().unwrap_err();
    match err {
        KernelError::StartupFailed(reason) => assert!(reason.contains("broken")),
        other => panic!("expected StartupFailed, got {other:?}"),
    }
    assert_eq!(engine.status(), KernelStatus::Failed);
    assert!(matches!(
        engine.execute(request("print a")).await,
        Err(KernelError::StartupFailed(_))
    ));
}

#[tokio::test]
async fn test_invalid_options_are_rejected() {
    let options = KernelOptions {
        stdin_capacity: 1,
        ..Default::default()
    };
    let result = KernelEngine::spawn(options, EngineHooks::default(), |io| Scripted { io });
    assert!(matches!(result, Err(KernelError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_worker_crash_rejects_calls() {
    let engine = spawn();
    let err = timeout(STEP, engine.execute(request("panic")))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err, KernelError::WorkerGone);
    assert_eq!(engine.status(), KernelStatus::Failed);
    assert_eq!(
        engine.execute(request("print a")).await.unwrap_err(),
        KernelError::WorkerGone
    );
    assert_eq!(engine.status(), KernelStatus::Failed);
}

#[tokio::test]
async fn test_dispose_is_final_and_idempotent() {
    let engine = spawn();
    engine.wait_ready().await.unwrap();

    engine.dispose();
    engine.dispose();
    assert_eq!(engine.status(), KernelStatus::Disposed);

    let execute = engine.execute(request("print a"));
    assert!(matches!(
        execute.now_or_never().expect("should fail without waiting"),
        Err(KernelError::Disposed)
    ));
    assert!(matches!(
        engine.kernel_info().now_or_never(),
        Some(Err(KernelError::Disposed))
    ));
    let complete = engine.complete(CompleteRequest {
        code: "pri".to_string(),
        cursor_pos: 3,
    });
    assert!(matches!(complete.now_or_never(), Some(Err(KernelError::Disposed))));
    assert!(matches!(
        engine.comm_open("c1", "t", Map::new()).now_or_never(),
        Some(Err(KernelError::Disposed))
    ));
    assert_eq!(engine.wait_ready().await, Err(KernelError::Disposed));
    assert_eq!(engine.input_reply("x"), Err(KernelError::Disposed));
}

#[tokio::test]
async fn test_dispose_during_startup_wakes_waiters() {
    let engine = spawn();
    engine.dispose();
    let result = timeout(STEP, engine.wait_ready()).await.unwrap();
    assert_eq!(result, Err(KernelError::Disposed));
}

#[tokio::test]
async fn test_dispose_rejects_running_execution() {
    let engine = spawn();
    engine.wait_ready().await.unwrap();

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.execute(request("sleep 300\nprint late")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.dispose();

    let result = timeout(STEP, running).await.unwrap().unwrap();
    assert!(matches!(result, Err(KernelError::Disposed)));
}

#[tokio::test]
async fn test_input_round_trip() {
    let engine = spawn();
    engine.wait_ready().await.unwrap();
    let mut events = engine.subscribe();

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { CodeRunner::new(engine).run("input name?").await })
    };

    assert_eq!(next_input_request(&mut events).await, "name?");
    engine.input_reply("Ada").unwrap();

    let output = timeout(STEP, running).await.unwrap().unwrap().unwrap();
    assert_eq!(output.text(), Some("got:Ada"));
}

#[tokio::test]
async fn test_oversized_input_leaves_worker_parked() {
    let options = KernelOptions {
        stdin_capacity: 8,
        ..Default::default()
    };
    let engine = spawn_with(options, EngineHooks::default());
    engine.wait_ready().await.unwrap();
    let mut events = engine.subscribe();

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move { CodeRunner::new(engine).run("input ?").await })
    };
    next_input_request(&mut events).await;

    let err = engine.input_reply("far too long").unwrap_err();
    assert!(matches!(
        err,
        KernelError::Channel(ChannelError::CapacityExceeded { .. })
    ));

    engine.input_reply("short").unwrap();
    let output = timeout(STEP, running).await.unwrap().unwrap().unwrap();
    assert_eq!(output.text(), Some("got:short"));
}

#[tokio::test]
async fn test_input_reply_without_request() {
    let engine = spawn();
    engine.wait_ready().await.unwrap();
    assert_eq!(engine.input_reply("x"), Err(KernelError::NoPendingInput));
}

#[tokio::test]
async fn test_input_without_stdin_fails_the_execution() {
    let engine = spawn();
    let mut request = ExecuteRequest::new("input name?".to_string());
    request.allow_stdin = false;
    let outcome = engine.execute(request).await.unwrap();
    assert_eq!(outcome.error.unwrap().ename, "StdinError");
}

#[tokio::test]
async fn test_worker_comms_reach_the_router() {
    let registry = Arc::new(CommRegistry::new());
    let hooks = EngineHooks {
        logger: Arc::new(FacadeLogSink),
        comm_router: registry.clone(),
    };
    let engine = spawn_with(KernelOptions::default(), hooks);

    run(
        &engine,
        "comm_open w1 {\"state\":{\"value\":1}}\ncomm_msg w1 {\"method\":\"update\",\"state\":{\"value\":5}}\ncomm_open w2",
    )
    .await;
    assert_eq!(registry.get("w1").unwrap().state["value"], 5);
    assert_eq!(registry.len(), 2);

    run(&engine, "comm_close w2").await;
    assert!(registry.get("w2").is_none());
}

#[tokio::test]
async fn test_request_validation() {
    let engine = spawn();
    let err = engine
        .complete(CompleteRequest {
            code: "pri".to_string(),
            cursor_pos: 4,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidRequest(_)));

    let reply = engine
        .complete(CompleteRequest {
            code: "pri".to_string(),
            cursor_pos: 3,
        })
        .await
        .unwrap();
    assert_eq!(reply.matches, vec!["print"]);

    let err = engine.comm_msg("", Map::new()).await.unwrap_err();
    assert!(matches!(err, KernelError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_rhai_state_persists() {
    let engine = Arc::new(KernelEngine::rhai(KernelOptions::default(), EngineHooks::default()).unwrap());
    run(&engine, "let x = 20; fn twice(n) { n * 2 }").await;
    let output = run(&engine, r#"print("sum"); twice(x) + 2"#).await;
    assert_eq!(output.text(), Some("sum\n42"));
}

#[tokio::test]
async fn test_rhai_errors() {
    let engine = Arc::new(KernelEngine::rhai(KernelOptions::default(), EngineHooks::default()).unwrap());
    match run(&engine, "undefined_name").await {
        RunOutput::Error(error) => {
            assert_eq!(error.name, "NameError");
            assert!(!error.stack.contains('\x1b'));
        }
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rhai_input() {
    let engine = Arc::new(KernelEngine::rhai(KernelOptions::default(), EngineHooks::default()).unwrap());
    engine.wait_ready().await.unwrap();
    let mut events = engine.subscribe();

    let running = {
        let engine = engine.clone();
        tokio::spawn(async move {
            CodeRunner::new(engine)
                .run(r#"let name = input("who? "); "hi " + name"#)
                .await
        })
    };
    assert_eq!(next_input_request(&mut events).await, "who? ");
    engine.input_reply("Ada").unwrap();

    let output = timeout(STEP, running).await.unwrap().unwrap().unwrap();
    assert_eq!(output.text(), Some("hi Ada"));
}

#[tokio::test]
async fn test_rhai_is_complete() {
    let engine = KernelEngine::rhai(KernelOptions::default(), EngineHooks::default()).unwrap();
    let reply = engine
        .is_complete(IsCompleteRequest {
            code: "if true {".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(reply.status, IsCompleteReplyStatus::Incomplete);
}
