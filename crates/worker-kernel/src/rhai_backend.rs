//! Default [`Interpreter`] backed by the Rhai scripting engine.
//!
//! State persists across executions: top-level variables live in one
//! [`Scope`] and script functions accumulate in a function-only [`AST`]
//! that is merged in front of every new cell.
//!
//! Scripts reach the frontend through host functions:
//! - `print(x)` / `debug(x)`: stdout / stderr stream
//! - `input()`, `input(prompt)`, `getpass(prompt)`: block for a line of stdin
//! - `display_html(s)`, `display_markdown(s)`, `display_png(base64)`
//! - `display(id, html)` / `update_display(id, html)`
//! - `clear_output()`, `clear_output(wait)`
//! - `comm_send(comm_id, json)`, `comm_data(comm_id)`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use jupyter_protocol::{
    CommClose, CommId, CommInfo, CommInfoReply, CommInfoRequest, CommMsg, CommOpen, CompleteReply,
    CompleteRequest, DisplayData, ErrorOutput, ExecutionCount, InspectReply, InspectRequest,
    IsCompleteReply, IsCompleteRequest, Media, MediaType, Stdio, UpdateDisplayData,
};
use rhai::{Dynamic, Engine, EvalAltResult, ParseError, ParseErrorType, Position, Scope, AST};
use serde_json::{Map, Value};

use crate::engine::{EngineHooks, KernelEngine};
use crate::error::KernelError;
use crate::interpreter::{Interpreter, WorkerIo};
use crate::lock;
use crate::options::KernelOptions;
use crate::protocol::{language_info, tagged_display, text_media, KernelInfo};

const HOST_FUNCTIONS: &[&str] = &[
    "print",
    "debug",
    "input",
    "getpass",
    "display_html",
    "display_markdown",
    "display_png",
    "display",
    "update_display",
    "clear_output",
    "comm_send",
    "comm_data",
];

const KEYWORDS: &[&str] = &[
    "let", "const", "fn", "if", "else", "switch", "while", "loop", "do", "until", "for", "in",
    "break", "continue", "return", "throw", "try", "catch", "true", "false", "import", "export",
    "as", "private", "this",
];

#[derive(Debug, Default)]
struct CommRecord {
    target_name: String,
    last_data: Map<String, Value>,
}

type Comms = Arc<Mutex<BTreeMap<String, CommRecord>>>;

pub struct RhaiInterpreter {
    engine: Engine,
    scope: Scope<'static>,
    library: AST,
    io: WorkerIo,
    comms: Comms,
}


fn script_error(message: String) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message),
        Position::NONE,
    ))
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Character range of the identifier touching `cursor`, plus its text.
fn word_at(code: &str, cursor: usize, extend_right: bool) -> (usize, usize, String) {
    let chars: Vec<char> = code.chars().collect();
    let cursor = cursor.min(chars.len());
    let mut start = cursor;
    while start > 0 && is_ident(chars[start - 1]) {
        start -= 1;
    }
    let mut end = cursor;
    if extend_right {
        while end < chars.len() && is_ident(chars[end]) {
            end += 1;
        }
    }
    (start, end, chars[start..end].iter().collect())
}

fn traceback(ename: &str, evalue: &str, position: Position) -> Vec<String> {
    let mut lines = vec![format!("\x1b[0;31m{ename}\x1b[0m: {evalue}")];
    if !position.is_none() {
        lines.push(format!("  at {position}"));
    }
    lines
}

fn syntax_error(err: &ParseError) -> ErrorOutput {
    let evalue = err.to_string();
    ErrorOutput {
        ename: "SyntaxError".to_string(),
        traceback: traceback("SyntaxError", &evalue, err.position()),
        evalue,
    }
}

fn eval_error(err: &EvalAltResult) -> ErrorOutput {
    let ename = match err {
        EvalAltResult::ErrorParsing(..) => "SyntaxError",
        EvalAltResult::ErrorVariableNotFound(..) | EvalAltResult::ErrorFunctionNotFound(..) => {
            "NameError"
        }
        EvalAltResult::ErrorArithmetic(..) => "ArithmeticError",
        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            "TypeError"
        }
        EvalAltResult::ErrorArrayBounds(..) | EvalAltResult::ErrorIndexingType(..) => "IndexError",
        EvalAltResult::ErrorTerminated(..) => "KeyboardInterrupt",
        EvalAltResult::ErrorRuntime(..) => "RuntimeError",
        _ => "EvalError",
    };
    let evalue = match err {
        EvalAltResult::ErrorRuntime(value, _) => value.to_string(),
        other => other.to_string(),
    };
    ErrorOutput {
        ename: ename.to_string(),
        traceback: traceback(ename, &evalue, err.position()),
        evalue,
    }
}

impl RhaiInterpreter {
    pub fn new(io: WorkerIo) -> Self {
        let mut engine = Engine::new();
        engine.set_max_expr_depths(64, 64);

        let comms: Comms = Arc::new(Mutex::new(BTreeMap::new()));
        Self::register_streams(&mut engine, &io);
        Self::register_input(&mut engine, &io);
        Self::register_display(&mut engine, &io);
        Self::register_comms(&mut engine, &io, &comms);

        Self {
            engine,
            scope: Scope::new(),
            library: AST::empty(),
            io,
            comms,
        }
    }

    fn register_streams(engine: &mut Engine, io: &WorkerIo) {
        let out = io.clone();
        engine.on_print(move |text| out.stream(Stdio::Stdout, &format!("{text}\n")));

        let err = io.clone();
        engine.on_debug(move |text, _source, _position| {
            err.stream(Stdio::Stderr, &format!("{text}\n"))
        });

        // Lets a hard stop abort a running script
        let terminated = io.terminated_flag();
        engine.on_progress(move |_operations| {
            if terminated.load(Ordering::Acquire) {
                Some(Dynamic::from("kernel terminated".to_string()))
            } else {
                None
            }
        });
    }

    fn register_input(engine: &mut Engine, io: &WorkerIo) {
        let bare = io.clone();
        engine.register_fn("input", move || -> Result<String, Box<EvalAltResult>> {
            bare.read_line("", false)
                .map_err(|e| script_error(format!("input failed: {e:#}")))
        });

        let prompted = io.clone();
        engine.register_fn(
            "input",
            move |prompt: String| -> Result<String, Box<EvalAltResult>> {
                prompted
                    .read_line(&prompt, false)
                    .map_err(|e| script_error(format!("input failed: {e:#}")))
            },
        );

        let password = io.clone();
        engine.register_fn(
            "getpass",
            move |prompt: String| -> Result<String, Box<EvalAltResult>> {
                password
                    .read_line(&prompt, true)
                    .map_err(|e| script_error(format!("getpass failed: {e:#}")))
            },
        );
    }

    fn register_display(engine: &mut Engine, io: &WorkerIo) {
        let html = io.clone();
        engine.register_fn("display_html", move |content: String| {
            html.display(DisplayData::new(MediaType::Html(content).into()));
        });

        let markdown = io.clone();
        engine.register_fn("display_markdown", move |content: String| {
            markdown.display(DisplayData::new(MediaType::Markdown(content).into()));
        });

        let png = io.clone();
        engine.register_fn("display_png", move |base64: String| {
            png.display(DisplayData::new(MediaType::Png(base64).into()));
        });

        let tagged = io.clone();
        engine.register_fn("display", move |display_id: String, content: String| {
            tagged.display(tagged_display(MediaType::Html(content).into(), &display_id));
        });

        let update = io.clone();
        engine.register_fn("update_display", move |display_id: String, content: String| {
            update.update_display(UpdateDisplayData::new(
                MediaType::Html(content).into(),
                &display_id,
            ));
        });

        let clear = io.clone();
        engine.register_fn("clear_output", move || clear.clear_output(false));

        let clear_wait = io.clone();
        engine.register_fn("clear_output", move |wait: bool| clear_wait.clear_output(wait));
    }

    fn register_comms(engine: &mut Engine, io: &WorkerIo, comms: &Comms) {
        let sender = io.clone();
        let open = comms.clone();
        engine.register_fn(
            "comm_send",
            move |comm_id: String, json: String| -> Result<(), Box<EvalAltResult>> {
                if !lock(&open).contains_key(&comm_id) {
                    return Err(script_error(format!("comm {comm_id} is not open")));
                }
                let data: Map<String, Value> = serde_json::from_str(&json)
                    .map_err(|e| script_error(format!("comm_send expects a JSON object: {e}")))?;
                sender.comm_msg(&comm_id, data);
                Ok(())
            },
        );

        let known = comms.clone();
        engine.register_fn("comm_data", move |comm_id: String| -> String {
            lock(&known)
                .get(&comm_id)
                .map(|record| Value::Object(record.last_data.clone()).to_string())
                .unwrap_or_else(|| "{}".to_string())
        });
    }

    /// Evaluate `ast` with the accumulated functions in front of it, then
    /// keep whatever functions it defined.
    fn run(&mut self, ast: AST) -> Result<Dynamic, Box<EvalAltResult>> {
        let program = self.library.merge(&ast);
        let result = self
            .engine
            .eval_ast_with_scope::<Dynamic>(&mut self.scope, &program);

        let mut functions = ast;
        functions.clear_statements();
        self.library.combine(functions);
        result
    }

    fn load_package(&mut self, location: &Path, name: &str) -> Result<()> {
        let path = location.join(format!("{name}.rhai"));
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read package {}", path.display()))?;
        let ast = self
            .engine
            .compile(&source)
            .map_err(|e| anyhow!("Failed to compile package {name}: {e}"))?;
        self.run(ast)
            .map(drop)
            .map_err(|e| anyhow!("Failed to load package {name}: {e}"))
    }

    fn script_functions(&self) -> Vec<String> {
        self.library
            .iter_functions()
            .map(|function| function.name.to_string())
            .collect()
    }
}

impl Interpreter for RhaiInterpreter {
    fn initialize(&mut self, options: &KernelOptions) -> Result<()> {
        self.scope.push_constant("CWD", options.location.clone());
        self.io
            .logger()
            .info(&format!("Rhai kernel starting in {}", options.location));

        if options.packages.is_empty() {
            return Ok(());
        }
        if !options.mount_drive {
            bail!(
                "Cannot preload {}: the host drive is not mounted",
                options.packages.join(", ")
            );
        }
        let location = Path::new(&options.location);
        for package in &options.packages {
            if let Err(e) = self.load_package(location, package) {
                self.io.logger().error(&format!("{e:#}"));
                return Err(e);
            }
            self.io.logger().info(&format!("Loaded package {package}"));
        }
        Ok(())
    }

    fn kernel_info(&self) -> KernelInfo {
        let mut language = language_info("rhai", "1");
        language.mimetype = Some("text/x-rhai".to_string());
        language.file_extension = Some(".rhai".to_string());

        let mut info = KernelInfo::new("worker-kernel-rhai", env!("CARGO_PKG_VERSION"), language);
        info.reply.banner = "Rhai on a worker thread".to_string();
        info.supported_mimetypes = ["text/plain", "text/html", "text/markdown", "image/png"]
            .iter()
            .map(|mime| mime.to_string())
            .collect();
        info
    }

    fn execute(
        &mut self,
        code: &str,
        _execution_count: ExecutionCount,
    ) -> Result<Option<Media>, ErrorOutput> {
        let ast = self.engine.compile(code).map_err(|e| syntax_error(&e))?;
        let value = self.run(ast).map_err(|e| eval_error(&e))?;
        if value.is_unit() {
            return Ok(None);
        }
        Ok(Some(text_media(value.to_string())))
    }

    fn complete(&mut self, request: &CompleteRequest) -> CompleteReply {
        let (start, end, prefix) = word_at(&request.code, request.cursor_pos, false);
        let mut matches = Vec::new();
        if !prefix.is_empty() {
            let variables = self.scope.iter().map(|(name, _, _)| name.to_string());
            let candidates = variables
                .chain(self.script_functions())
                .chain(HOST_FUNCTIONS.iter().map(|name| name.to_string()))
                .chain(KEYWORDS.iter().map(|name| name.to_string()));
            matches = candidates
                .filter(|candidate| candidate.starts_with(&prefix))
                .collect();
            matches.sort();
            matches.dedup();
        }
        CompleteReply {
            matches,
            cursor_start: start,
            cursor_end: end,
            ..Default::default()
        }
    }

    fn inspect(&mut self, request: &InspectRequest) -> InspectReply {
        let (_, _, name) = word_at(&request.code, request.cursor_pos, true);
        if name.is_empty() {
            return InspectReply::default();
        }
        let text = if let Some(value) = self.scope.get_value::<Dynamic>(&name) {
            format!("{name}: {} = {value}", value.type_name())
        } else if HOST_FUNCTIONS.contains(&name.as_str()) || self.script_functions().contains(&name) {
            format!("{name}: function")
        } else {
            return InspectReply::default();
        };
        InspectReply {
            found: true,
            data: text_media(text),
            ..Default::default()
        }
    }

    fn is_complete(&mut self, request: &IsCompleteRequest) -> IsCompleteReply {
        if request.code.trim().is_empty() {
            return IsCompleteReply::complete();
        }
        match self.engine.compile(&request.code) {
            Ok(_) => IsCompleteReply::complete(),
            Err(err) => match err.err_type() {
                ParseErrorType::UnexpectedEOF | ParseErrorType::MissingToken(..) => {
                    IsCompleteReply::incomplete("    ".to_string())
                }
                _ => IsCompleteReply::invalid(),
            },
        }
    }

    fn comm_info(&self, request: &CommInfoRequest) -> CommInfoReply {
        let comms = lock(&self.comms);
        let comms = comms
            .iter()
            .filter(|(_, record)| {
                request
                    .target_name
                    .as_deref()
                    .map_or(true, |target| target == record.target_name)
            })
            .map(|(comm_id, record)| {
                (
                    CommId(comm_id.clone()),
                    CommInfo {
                        target_name: record.target_name.clone(),
                    },
                )
            })
            .collect();
        CommInfoReply {
            comms,
            ..Default::default()
        }
    }

    fn comm_open(&mut self, content: &CommOpen) -> Result<()> {
        lock(&self.comms).insert(
            content.comm_id.0.clone(),
            CommRecord {
                target_name: content.target_name.clone(),
                last_data: content.data.clone(),
            },
        );
        Ok(())
    }

    fn comm_msg(&mut self, content: &CommMsg) -> Result<()> {
        let mut comms = lock(&self.comms);
        let Some(record) = comms.get_mut(&content.comm_id.0) else {
            bail!("comm {} is not open", content.comm_id.0);
        };
        record.last_data = content.data.clone();
        Ok(())
    }

    fn comm_close(&mut self, content: &CommClose) -> Result<()> {
        lock(&self.comms).remove(&content.comm_id.0);
        Ok(())
    }
}

impl KernelEngine {
    /// Spawn a kernel running [`RhaiInterpreter`].
    pub fn rhai(options: KernelOptions, hooks: EngineHooks) -> Result<Self, KernelError> {
        Self::spawn(options, hooks, RhaiInterpreter::new)
    }
}
