//! wkernel - drive a worker-thread Rhai kernel from the terminal.
//!
//! `wkernel` (or `wkernel console`) opens an interactive console.
//! `wkernel exec` runs one snippet and prints the consolidated output.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jupyter_protocol::{ExecuteRequest, IsCompleteReplyStatus, IsCompleteRequest, Media, Stdio};
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};

use worker_kernel::protocol::{media_bundle, WorkerNotification};
use worker_kernel::{
    CodeRunner, EngineHooks, KernelEngine, KernelError, KernelEvent, KernelOptions, RunOutput,
};

#[derive(Parser, Debug)]
#[command(name = "wkernel")]
#[command(author, version, about = "Rhai kernel running on a dedicated worker thread")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Options file (default: <config dir>/worker-kernel/options.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Working directory inside the interpreter
    #[arg(long, global = true)]
    location: Option<String>,

    /// Load packages from the host directory given by --location
    #[arg(long, global = true)]
    mount_drive: bool,

    /// Package to preload (repeatable)
    #[arg(long = "package", short = 'p', global = true)]
    packages: Vec<String>,

    /// Size in bytes of the stdin channel
    #[arg(long, global = true)]
    stdin_capacity: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Interactive console (default if no command specified)
    Console,

    /// Run code once and print the consolidated output
    Exec {
        /// The code to execute (reads from stdin if not provided)
        code: Option<String>,

        /// Print the output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print kernel_info as JSON
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let options = kernel_options(&cli)?;
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async_main(cli.command, options));
    // A task may still be parked on terminal input
    rt.shutdown_background();

    if !result? {
        std::process::exit(1);
    }
    Ok(())
}

fn kernel_options(cli: &Cli) -> Result<KernelOptions> {
    let mut options = match &cli.config {
        Some(path) => KernelOptions::load(path)?,
        None => KernelOptions::load_or_default(),
    };
    if let Some(location) = &cli.location {
        options.location = location.clone();
    }
    if cli.mount_drive {
        options.mount_drive = true;
    }
    if !cli.packages.is_empty() {
        options.packages = cli.packages.clone();
    }
    if let Some(capacity) = cli.stdin_capacity {
        options.stdin_capacity = capacity;
    }
    Ok(options)
}

/// Returns whether the command succeeded.
async fn async_main(command: Option<Commands>, options: KernelOptions) -> Result<bool> {
    let engine = Arc::new(KernelEngine::rhai(options, EngineHooks::default())?);

    let result = match command {
        None | Some(Commands::Console) => console(&engine).await.map(|()| true),
        Some(Commands::Exec { code, json }) => exec(&engine, code, json).await,
        Some(Commands::Info) => info(&engine).await.map(|()| true),
    };

    engine.dispose();
    result
}

async fn info(engine: &Arc<KernelEngine>) -> Result<()> {
    let info = engine.kernel_info().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

/// `text/plain` if there is one, otherwise a placeholder naming the data.
fn plain_text(data: &Media) -> String {
    let data = media_bundle(data);
    if let Some(text) = data.get("text/plain").and_then(Value::as_str) {
        return text.to_string();
    }
    data.keys()
        .next()
        .map(|mime| format!("<{mime}>"))
        .unwrap_or_default()
}

fn render(notification: &WorkerNotification) {
    match notification {
        WorkerNotification::Stream(stream) => {
            match stream.name {
                Stdio::Stdout => print!("{}", stream.text),
                Stdio::Stderr => eprint!("{}", stream.text),
            }
            let _ = io::stdout().flush();
        }
        WorkerNotification::ExecuteResult(result) => {
            println!("Out[{}]: {}", result.execution_count, plain_text(&result.data));
        }
        WorkerNotification::DisplayData(display) => println!("{}", plain_text(&display.data)),
        WorkerNotification::UpdateDisplayData(update) => println!("{}", plain_text(&update.data)),
        WorkerNotification::ExecuteError(error) => {
            if error.traceback.is_empty() {
                eprintln!("{}: {}", error.ename, error.evalue);
            }
            for line in &error.traceback {
                eprintln!("{}", line);
            }
        }
        _ => {}
    }
}

fn read_input(prompt: &str, password: bool) -> Result<String> {
    eprint!("{}", prompt);
    io::stderr().flush()?;
    if password {
        return Ok(rpassword::read_password()?);
    }
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim_end_matches(['\r', '\n']).to_string())
}

/// Prompt until the engine accepts a value. An oversized value leaves the
/// interpreter waiting, so ask again.
fn answer_input(
    engine: &KernelEngine,
    prompt: &str,
    password: bool,
    mut read: impl FnMut(&str, bool) -> Result<String>,
) -> Result<()> {
    loop {
        let value = read(prompt, password)?;
        match engine.input_reply(&value) {
            Ok(()) => return Ok(()),
            Err(KernelError::Channel(e)) => eprintln!("{e}; try a shorter value"),
            Err(e) => {
                eprintln!("Input was not delivered: {e}");
                return Ok(());
            }
        }
    }
}

/// Run [`answer_input`] on the blocking pool so the runtime keeps serving
/// kernel events while the terminal waits.
async fn answer_input_blocking<F>(
    engine: Arc<KernelEngine>,
    prompt: String,
    password: bool,
    read: F,
) -> Result<()>
where
    F: FnMut(&str, bool) -> Result<String> + Send + 'static,
{
    tokio::task::spawn_blocking(move || answer_input(&engine, &prompt, password, read)).await?
}

/// Read one cell, asking for more lines while the kernel says it is
/// incomplete. `None` at end of input.
async fn read_cell(engine: &KernelEngine, count: usize) -> Result<Option<String>> {
    let first = format!("In [{count}]: ");
    let continuation = format!("{:>width$}: ", "...", width = first.len() - 2);
    let mut prompt = first;
    let mut code = String::new();

    loop {
        print!("{}", prompt);
        io::stdout().flush()?;

        // No persistent StdinLock, so input_request can read stdin too
        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            return Ok((!code.is_empty()).then_some(code));
        }
        code.push_str(&line);
        if code.trim().is_empty() {
            return Ok(Some(code));
        }

        let reply = engine
            .is_complete(IsCompleteRequest { code: code.clone() })
            .await?;
        if reply.status != IsCompleteReplyStatus::Incomplete {
            return Ok(Some(code));
        }
        prompt = continuation.clone();
    }
}

async fn console(engine: &Arc<KernelEngine>) -> Result<()> {
    engine.wait_ready().await?;
    let info = engine.kernel_info().await?;
    println!("{} console ({})", info.reply.language_info.name, engine.id());
    if !info.reply.banner.is_empty() {
        println!("{}", info.reply.banner);
    }
    println!("Use Ctrl+D to exit.\n");

    let mut events = engine.subscribe();
    let mut next_count: usize = 1;

    while let Some(code) = read_cell(engine, next_count).await? {
        if code.trim().is_empty() {
            continue;
        }

        let mut request = ExecuteRequest::new(code);
        request.allow_stdin = true;
        let execution = engine.execute(request);
        tokio::pin!(execution);

        // Notifications are broadcast before the reply resolves, so draining
        // events first prints everything before the next prompt.
        let outcome = loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(KernelEvent::Notification {
                        notification: WorkerNotification::InputRequest(request),
                        ..
                    }) => {
                        answer_input_blocking(
                            engine.clone(),
                            request.prompt,
                            request.password,
                            read_input,
                        )
                        .await?
                    }
                    Ok(KernelEvent::Notification { notification, .. }) => render(&notification),
                    Ok(KernelEvent::Status(status)) => debug!("[console] Kernel is {}", status),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[console] Missed {} kernel events", skipped)
                    }
                    Err(RecvError::Closed) => break (&mut execution).await,
                },
                outcome = &mut execution => break outcome,
            }
        };

        match outcome {
            Ok(outcome) => next_count = outcome.reply.execution_count.value() + 1,
            Err(e @ (KernelError::WorkerGone | KernelError::Disposed)) => {
                eprintln!("Kernel stopped: {e}");
                break;
            }
            Err(e) => eprintln!("Error: {e}"),
        }
        // Blank line between output and the next prompt
        println!();
    }

    println!("\nShutting down kernel...");
    Ok(())
}

/// Answer input requests from the terminal until the engine goes away.
fn spawn_input_responder(engine: Arc<KernelEngine>) -> tokio::task::JoinHandle<()> {
    let mut events: broadcast::Receiver<KernelEvent> = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(KernelEvent::Notification {
                    notification: WorkerNotification::InputRequest(request),
                    ..
                }) => {
                    let answered = answer_input_blocking(
                        engine.clone(),
                        request.prompt,
                        request.password,
                        read_input,
                    )
                    .await;
                    if let Err(e) = answered {
                        warn!("[console] Failed to read input: {:#}", e);
                    }
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn exec(engine: &Arc<KernelEngine>, code: Option<String>, json: bool) -> Result<bool> {
    let code = match code {
        Some(code) => code,
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };

    let responder = spawn_input_responder(engine.clone());
    let output = CodeRunner::new(engine.clone()).run(&code).await;
    responder.abort();
    let output = output?;

    if json {
        println!("{}", serde_json::to_string_pretty(&output.to_json())?);
        return Ok(!output.is_error());
    }

    match &output {
        RunOutput::Data(data) => {
            if let Some(text) = output.text() {
                println!("{}", text);
            }
            for mime in data.keys().filter(|mime| mime.as_str() != "text/plain") {
                println!("<{}>", mime);
            }
        }
        RunOutput::Error(error) => {
            eprintln!("{}", error);
            if !error.stack.is_empty() {
                eprintln!("{}", error.stack);
            }
        }
    }
    Ok(!output.is_error())
}
