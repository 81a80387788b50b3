use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fence info string that marks a tool-call block.
pub const TOOL_CALL_INFO: &str = "tool_call";

/// A model-issued request to run one tool on one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub server: String,
    #[serde(default, alias = "toolName")]
    pub name: String,
    #[serde(default)]
    pub input: Map<String, Value>,
}

impl ToolCallRequest {
    pub fn new(server: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
            input: match input {
                Value::Object(map) => map,
                _ => Map::new(),
            },
        }
    }

    pub fn input_value(&self) -> Value {
        Value::Object(self.input.clone())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    tool_call: ToolCallRequest,
}

/// What a scan of assistant output found.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallScan {
    Absent,
    Found(ToolCallRequest),
    /// Something that looked like a tool call but is not exactly one
    /// well-formed block. Treated as absent by callers.
    Malformed(String),
}

impl ToolCallScan {
    pub fn request(&self) -> Option<&ToolCallRequest> {
        match self {
            Self::Found(request) => Some(request),
            _ => None,
        }
    }
}

struct Fence<'a> {
    info: &'a str,
    body: String,
}

/// Finds the single tool-call block in `text`.
///
/// A fenced block is a candidate when its info string is `tool_call` or its
/// body mentions a `"tool_call"` key. Zero candidates is `Absent`; more than
/// one, or a candidate whose body is not exactly
/// `{"tool_call": {"server", "name", "input"}}`, is `Malformed`.
pub fn scan_tool_call(text: &str) -> ToolCallScan {
    let candidates: Vec<Fence<'_>> = fenced_blocks(text)
        .into_iter()
        .filter(|fence| fence.info == TOOL_CALL_INFO || fence.body.contains("\"tool_call\""))
        .collect();

    match candidates.as_slice() {
        [] => ToolCallScan::Absent,
        [only] => match serde_json::from_str::<Envelope>(only.body.trim()) {
            Ok(envelope) => ToolCallScan::Found(envelope.tool_call),
            Err(err) => ToolCallScan::Malformed(format!("invalid tool-call JSON: {err}")),
        },
        many => ToolCallScan::Malformed(format!(
            "{} tool-call blocks in one response",
            many.len()
        )),
    }
}

fn fenced_blocks(text: &str) -> Vec<Fence<'_>> {
    let mut blocks = Vec::new();
    let mut open: Option<(&str, Vec<&str>)> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        match open.take() {
            None => {
                if let Some(info) = trimmed.strip_prefix("```") {
                    open = Some((info.trim(), Vec::new()));
                }
            }
            Some((info, mut body)) => {
                if trimmed == "```" {
                    blocks.push(Fence {
                        info,
                        body: body.join("\n"),
                    });
                } else {
                    body.push(line);
                    open = Some((info, body));
                }
            }
        }
    }
    // An unterminated fence is not a block.
    blocks
}
