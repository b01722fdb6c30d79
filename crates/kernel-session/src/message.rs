//! Kernel message shapes.
//!
//! [`WireMessage`] is the permissive form messages take on their way in from
//! a transport: every field is optional and unknown fields are ignored.
//! [`OutputMessage`] is what subscribers see.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Result, SessionError};

pub const IOPUB_CHANNEL: &str = "iopub";
pub const SHELL_CHANNEL: &str = "shell";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
}

/// A message as received from the kernel transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<WireHeader>,

    /// `{}`, `null` and a missing field all mean "no parent".
    #[serde(
        default,
        deserialize_with = "deserialize_parent_header",
        skip_serializing_if = "Option::is_none"
    )]
    pub parent_header: Option<WireHeader>,

    #[serde(default)]
    pub content: Value,
}

fn deserialize_parent_header<'de, D>(deserializer: D) -> std::result::Result<Option<WireHeader>, D::Error>
where
    D: Deserializer<'de>,
{
    let header: Option<WireHeader> = Option::deserialize(deserializer)?;
    Ok(header.filter(|h| h.msg_id.is_some() || h.msg_type.is_some()))
}

impl WireMessage {
    pub fn new(channel: &str, msg_type: &str, content: Value) -> Self {
        Self {
            channel: Some(channel.to_string()),
            header: Some(WireHeader {
                msg_id: Some(uuid::Uuid::new_v4().to_string()),
                msg_type: Some(msg_type.to_string()),
            }),
            parent_header: None,
            content,
        }
    }

    pub fn stream(name: StreamName, text: &str) -> Self {
        Self::new(
            IOPUB_CHANNEL,
            "stream",
            json!({ "name": name.as_str(), "text": text }),
        )
    }

    pub fn status(execution_state: &str) -> Self {
        Self::new(
            IOPUB_CHANNEL,
            "status",
            json!({ "execution_state": execution_state }),
        )
    }

    pub fn execute_input(code: &str, execution_count: u32) -> Self {
        Self::new(
            IOPUB_CHANNEL,
            "execute_input",
            json!({ "code": code, "execution_count": execution_count }),
        )
    }

    pub fn execute_result(data: Value, execution_count: u32) -> Self {
        Self::new(
            IOPUB_CHANNEL,
            "execute_result",
            json!({ "data": data, "metadata": {}, "execution_count": execution_count }),
        )
    }

    pub fn error(ename: &str, evalue: &str, traceback: Vec<String>) -> Self {
        Self::new(
            IOPUB_CHANNEL,
            "error",
            json!({ "ename": ename, "evalue": evalue, "traceback": traceback }),
        )
    }

    /// Attribute this message to the request with the given id.
    pub fn with_parent(mut self, msg_id: &str) -> Self {
        self.parent_header = Some(WireHeader {
            msg_id: Some(msg_id.to_string()),
            msg_type: None,
        });
        self
    }

    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.as_ref()?.msg_id.as_deref()
    }

    /// Messages without a channel are treated as IOPub.
    pub fn is_iopub(&self) -> bool {
        self.channel.as_deref().map_or(true, |c| c == IOPUB_CHANNEL)
    }

    /// The header's `msg_type`, or one inferred from the content's shape.
    pub fn msg_type(&self) -> Option<&str> {
        if let Some(msg_type) = self.header.as_ref().and_then(|h| h.msg_type.as_deref()) {
            return Some(msg_type);
        }
        let content = self.content.as_object()?;
        if content.contains_key("ename") {
            Some("error")
        } else if content.contains_key("execution_state") {
            Some("status")
        } else if content.contains_key("text") && content.contains_key("name") {
            Some("stream")
        } else if content.contains_key("data") {
            Some("display_data")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamName::Stdout => "stdout",
            StreamName::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output delivered to execution subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputMessage {
    /// Text written to stdout or stderr.
    Stream { name: StreamName, text: String },
    /// Rich output: `execute_result` (with a count) or `display_data`.
    Display {
        data: Map<String, Value>,
        execution_count: Option<u32>,
    },
    /// The code raised. Terminal.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    /// The kernel went idle for this request. Terminal.
    ExecutionComplete { execution_count: Option<u32> },
}

impl OutputMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutputMessage::Error { .. } | OutputMessage::ExecutionComplete { .. }
        )
    }

    /// Plain-text rendering of a display output, if it has one.
    pub fn plain_text(&self) -> Option<&str> {
        match self {
            OutputMessage::Display { data, .. } => data.get("text/plain")?.as_str(),
            _ => None,
        }
    }
}

/// What the router should do with one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decoded {
    Output(OutputMessage),
    ExecuteInput { execution_count: Option<u32> },
    Idle,
    Ignored,
}

#[derive(Deserialize)]
struct StreamContent {
    name: StreamName,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ErrorContent {
    ename: String,
    #[serde(default)]
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Deserialize)]
struct DisplayContent {
    data: Map<String, Value>,
    #[serde(default)]
    execution_count: Option<u32>,
}

#[derive(Deserialize)]
struct InputContent {
    #[serde(default)]
    execution_count: Option<u32>,
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: String,
}

fn parse<T: serde::de::DeserializeOwned>(msg_type: &str, content: &Value) -> Result<T> {
    T::deserialize(content).map_err(|e| {
        SessionError::TransportError(format!("Malformed {} content: {}", msg_type, e))
    })
}

/// Decode an IOPub message into a router action.
///
/// Unknown message types are `Ignored`; known types whose content does not
/// parse are a `TransportError`.
pub(crate) fn decode(message: &WireMessage) -> Result<Decoded> {
    let Some(msg_type) = message.msg_type() else {
        return Ok(Decoded::Ignored);
    };
    let content = &message.content;

    let decoded = match msg_type {
        "stream" => {
            let stream: StreamContent = parse(msg_type, content)?;
            Decoded::Output(OutputMessage::Stream {
                name: stream.name,
                text: stream.text,
            })
        }
        "error" => {
            let error: ErrorContent = parse(msg_type, content)?;
            Decoded::Output(OutputMessage::Error {
                ename: error.ename,
                evalue: error.evalue,
                traceback: error.traceback,
            })
        }
        "execute_result" | "display_data" => {
            let display: DisplayContent = parse(msg_type, content)?;
            Decoded::Output(OutputMessage::Display {
                data: display.data,
                execution_count: display.execution_count,
            })
        }
        "execute_input" => {
            let input: InputContent = parse(msg_type, content)?;
            Decoded::ExecuteInput {
                execution_count: input.execution_count,
            }
        }
        "status" => {
            let status: StatusContent = parse(msg_type, content)?;
            if status.execution_state == "idle" {
                Decoded::Idle
            } else {
                Decoded::Ignored
            }
        }
        _ => Decoded::Ignored,
    };

    Ok(decoded)
}
