//! Messages exchanged between the control side and the worker thread.
//!
//! Calls travel to the worker as [`WorkerRequest`] values. Replies come back
//! as JSON and are decoded into the `jupyter_protocol` reply types. Notifications
//! come back as [`RawNotification`] and are decoded once, at the proxy, into
//! the closed [`WorkerNotification`] enum. A `msg_type` the engine does not
//! know decodes to [`WorkerNotification::Unknown`] instead of failing.
//!
//! Output data stays a typed [`Media`] until the engine accumulates it; from
//! there on it is a plain [`MimeBundle`] keyed by MIME string.

use jupyter_protocol::{
    ClearOutput, CommClose, CommInfoRequest, CommMsg, CommOpen, CompleteRequest, DisplayData,
    ErrorOutput, ExecuteReply, ExecuteRequest, ExecuteResult, ExecutionCount, InputReply,
    InputRequest, InspectRequest, IsCompleteRequest, KernelInfoReply, LanguageInfo, Media,
    MediaType, ReplyError, ReplyStatus, StreamContent, Transient, UpdateDisplayData,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::options::KernelOptions;

/// Jupyter messaging protocol version the replies follow.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Output data keyed by MIME type.
pub type MimeBundle = Map<String, Value>;

/// Build a bundle holding a single `text/plain` entry.
pub fn text_bundle(text: impl Into<String>) -> MimeBundle {
    let mut bundle = MimeBundle::new();
    bundle.insert("text/plain".to_string(), Value::String(text.into()));
    bundle
}

pub fn text_media(text: impl Into<String>) -> Media {
    Media::from(MediaType::Plain(text.into()))
}

/// Flatten a [`Media`] into the MIME map outputs are accumulated in.
pub fn media_bundle(media: &Media) -> MimeBundle {
    match serde_json::to_value(media) {
        Ok(Value::Object(bundle)) => bundle,
        _ => MimeBundle::new(),
    }
}

/// A `display_data` that later `update_display_data` messages can target.
pub fn tagged_display(data: Media, display_id: &str) -> DisplayData {
    DisplayData {
        transient: Some(Transient {
            display_id: Some(display_id.to_string()),
        }),
        ..DisplayData::new(data)
    }
}

pub fn display_id(display: &DisplayData) -> Option<&str> {
    display.transient.as_ref()?.display_id.as_deref()
}

pub fn execute_ok(execution_count: ExecutionCount) -> ExecuteReply {
    ExecuteReply {
        execution_count,
        ..Default::default()
    }
}

pub fn execute_failed(execution_count: ExecutionCount, error: &ErrorOutput) -> ExecuteReply {
    ExecuteReply {
        status: ReplyStatus::Error,
        execution_count,
        error: Some(Box::new(ReplyError {
            ename: error.ename.clone(),
            evalue: error.evalue.clone(),
            traceback: error.traceback.clone(),
        })),
        ..Default::default()
    }
}

/// The error carried by a failed reply, if any.
pub fn reply_error(reply: &ExecuteReply) -> Option<ErrorOutput> {
    if reply.status == ReplyStatus::Ok {
        return None;
    }
    let error = reply.error.as_deref().cloned().unwrap_or_default();
    Some(ErrorOutput {
        ename: error.ename,
        evalue: error.evalue,
        traceback: error.traceback,
    })
}

/// `kernel_info_reply` plus the MIME types the interpreter can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelInfo {
    #[serde(flatten)]
    pub reply: KernelInfoReply,
    #[serde(default)]
    pub supported_mimetypes: Vec<String>,
}

impl KernelInfo {
    pub fn new(implementation: &str, implementation_version: &str, language_info: LanguageInfo) -> Self {
        Self {
            reply: KernelInfoReply {
                status: ReplyStatus::Ok,
                protocol_version: PROTOCOL_VERSION.to_string(),
                implementation: implementation.to_string(),
                implementation_version: implementation_version.to_string(),
                language_info,
                banner: String::new(),
                help_links: vec![],
                debugger: false,
                error: None,
            },
            supported_mimetypes: vec![],
        }
    }
}

/// `language_info` with only a name and version.
pub fn language_info(name: &str, version: &str) -> LanguageInfo {
    LanguageInfo {
        name: name.to_string(),
        version: version.to_string(),
        mimetype: None,
        file_extension: None,
        pygments_lexer: None,
        codemirror_mode: None,
        nbconvert_exporter: None,
    }
}

/// Identifies the request a notification belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentContext {
    pub msg_id: String,
    pub session: String,
    pub msg_type: String,
}

impl ParentContext {
    pub fn new(session: &str, msg_type: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.to_string(),
            msg_type: msg_type.to_string(),
        }
    }
}

/// Everything the worker can emit outside of a reply.
#[derive(Debug, Clone)]
pub enum WorkerNotification {
    Stream(StreamContent),
    DisplayData(DisplayData),
    UpdateDisplayData(UpdateDisplayData),
    ClearOutput(ClearOutput),
    ExecuteResult(ExecuteResult),
    ExecuteError(ErrorOutput),
    InputRequest(InputRequest),
    CommOpen(CommOpen),
    CommMsg(CommMsg),
    CommClose(CommClose),
    Unknown { msg_type: String, content: Value },
}

impl WorkerNotification {
    pub fn msg_type(&self) -> &str {
        match self {
            Self::Stream(_) => "stream",
            Self::DisplayData(_) => "display_data",
            Self::UpdateDisplayData(_) => "update_display_data",
            Self::ClearOutput(_) => "clear_output",
            Self::ExecuteResult(_) => "execute_result",
            Self::ExecuteError(_) => "execute_error",
            Self::InputRequest(_) => "input_request",
            Self::CommOpen(_) => "comm_open",
            Self::CommMsg(_) => "comm_msg",
            Self::CommClose(_) => "comm_close",
            Self::Unknown { msg_type, .. } => msg_type,
        }
    }

    pub fn from_type_and_content(msg_type: &str, content: Value) -> serde_json::Result<Self> {
        Ok(match msg_type {
            "stream" => Self::Stream(serde_json::from_value(content)?),
            "display_data" => Self::DisplayData(serde_json::from_value(content)?),
            "update_display_data" => Self::UpdateDisplayData(serde_json::from_value(content)?),
            "clear_output" => Self::ClearOutput(serde_json::from_value(content)?),
            "execute_result" => Self::ExecuteResult(serde_json::from_value(content)?),
            // Jupyter calls this one "error" on iopub
            "execute_error" | "error" => Self::ExecuteError(serde_json::from_value(content)?),
            "input_request" => Self::InputRequest(serde_json::from_value(content)?),
            "comm_open" => Self::CommOpen(serde_json::from_value(content)?),
            "comm_msg" => Self::CommMsg(serde_json::from_value(content)?),
            "comm_close" => Self::CommClose(serde_json::from_value(content)?),
            _ => Self::Unknown {
                msg_type: msg_type.to_string(),
                content,
            },
        })
    }

    pub fn content(&self) -> serde_json::Result<Value> {
        match self {
            Self::Stream(c) => serde_json::to_value(c),
            Self::DisplayData(c) => serde_json::to_value(c),
            Self::UpdateDisplayData(c) => serde_json::to_value(c),
            Self::ClearOutput(c) => serde_json::to_value(c),
            Self::ExecuteResult(c) => serde_json::to_value(c),
            Self::ExecuteError(c) => serde_json::to_value(c),
            Self::InputRequest(c) => serde_json::to_value(c),
            Self::CommOpen(c) => serde_json::to_value(c),
            Self::CommMsg(c) => serde_json::to_value(c),
            Self::CommClose(c) => serde_json::to_value(c),
            Self::Unknown { content, .. } => Ok(content.clone()),
        }
    }
}

/// A notification as it crosses the thread boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawNotification {
    pub msg_type: String,
    pub content: Value,
    #[serde(default)]
    pub parent: Option<ParentContext>,
}

impl RawNotification {
    pub fn encode(
        notification: &WorkerNotification,
        parent: Option<ParentContext>,
    ) -> serde_json::Result<Self> {
        Ok(Self {
            msg_type: notification.msg_type().to_string(),
            content: notification.content()?,
            parent,
        })
    }

    pub fn decode(self) -> serde_json::Result<(Option<ParentContext>, WorkerNotification)> {
        let notification = WorkerNotification::from_type_and_content(&self.msg_type, self.content)?;
        Ok((self.parent, notification))
    }
}

/// A call served by the worker thread, paired with its originating context.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    Initialize(KernelOptions),
    RegisterCallback,
    KernelInfo,
    Execute {
        request: ExecuteRequest,
        parent: ParentContext,
    },
    Complete {
        request: CompleteRequest,
        parent: ParentContext,
    },
    Inspect {
        request: InspectRequest,
        parent: ParentContext,
    },
    IsComplete {
        request: IsCompleteRequest,
        parent: ParentContext,
    },
    CommInfo {
        request: CommInfoRequest,
        parent: ParentContext,
    },
    CommOpen {
        content: CommOpen,
        parent: ParentContext,
    },
    CommMsg {
        content: CommMsg,
        parent: ParentContext,
    },
    CommClose {
        content: CommClose,
        parent: ParentContext,
    },
    InputReply {
        reply: InputReply,
        parent: ParentContext,
    },
}

impl WorkerRequest {
    pub fn method(&self) -> &'static str {
        match self {
            Self::Initialize(_) => "initialize",
            Self::RegisterCallback => "register_callback",
            Self::KernelInfo => "kernel_info_request",
            Self::Execute { .. } => "execute_request",
            Self::Complete { .. } => "complete_request",
            Self::Inspect { .. } => "inspect_request",
            Self::IsComplete { .. } => "is_complete_request",
            Self::CommInfo { .. } => "comm_info_request",
            Self::CommOpen { .. } => "comm_open",
            Self::CommMsg { .. } => "comm_msg",
            Self::CommClose { .. } => "comm_close",
            Self::InputReply { .. } => "input_reply",
        }
    }

    /// Calls during which the interpreter may emit notifications.
    pub fn emits_notifications(&self) -> bool {
        matches!(
            self,
            Self::Execute { .. } | Self::CommOpen { .. } | Self::CommMsg { .. } | Self::CommClose { .. }
        )
    }

    pub fn parent(&self) -> Option<&ParentContext> {
        match self {
            Self::Initialize(_) | Self::RegisterCallback | Self::KernelInfo => None,
            Self::Execute { parent, .. }
            | Self::Complete { parent, .. }
            | Self::Inspect { parent, .. }
            | Self::IsComplete { parent, .. }
            | Self::CommInfo { parent, .. }
            | Self::CommOpen { parent, .. }
            | Self::CommMsg { parent, .. }
            | Self::CommClose { parent, .. }
            | Self::InputReply { parent, .. } => Some(parent),
        }
    }
}
