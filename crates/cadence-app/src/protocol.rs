//! Newline-delimited JSON host protocol.
//!
//! Each stdin line is one [`Request`]. Each stdout line is one [`Output`]:
//! a response to a request, an engine event, or a dispatch instruction for a
//! class served by the stdout sender.

use cadence_core::types::ExecutionId;
use cadence_dispatch::{
    Action, CompletionResult, DispatchEvent, DispatchInstruction, Engine, EngineError, Execution,
    PatternRequest,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Enqueue {
        #[serde(default)]
        id: Option<String>,
        action: Action,
    },
    Execute {
        #[serde(default)]
        id: Option<String>,
        #[serde(flatten)]
        request: PatternRequest,
    },
    Cancel {
        #[serde(default)]
        id: Option<String>,
        execution_id: ExecutionId,
    },
    Complete {
        #[serde(default)]
        id: Option<String>,
        item_id: Uuid,
        #[serde(default = "default_success")]
        success: bool,
        #[serde(default)]
        message: Option<String>,
    },
    Status {
        #[serde(default)]
        id: Option<String>,
        execution_id: ExecutionId,
    },
}

fn default_success() -> bool {
    true
}

impl Request {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Request::Enqueue { id, .. }
            | Request::Execute { id, .. }
            | Request::Cancel { id, .. }
            | Request::Complete { id, .. }
            | Request::Status { id, .. } => id.as_deref(),
        }
    }
}

/// Reply to one request line.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<Execution>,
}

impl Response {
    fn ok(request_id: Option<&str>) -> Self {
        Self {
            request_id: request_id.map(str::to_string),
            ok: true,
            ..Self::default()
        }
    }

    fn rejected(request_id: Option<&str>, reason: &str, message: String) -> Self {
        Self {
            request_id: request_id.map(str::to_string),
            ok: false,
            reason: Some(reason.to_string()),
            message: Some(message),
            ..Self::default()
        }
    }

    fn from_error(request_id: Option<&str>, error: &EngineError) -> Self {
        Self {
            remaining_ms: error.remaining_ms(),
            ..Self::rejected(request_id, error.reason(), error.to_string())
        }
    }

    /// Reply to a line that could not be parsed.
    pub fn malformed(error: &serde_json::Error) -> Self {
        Self::rejected(None, "MalformedRequest", error.to_string())
    }
}

/// One stdout line.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "channel", content = "data", rename_all = "snake_case")]
pub enum Output {
    Response(Response),
    Event(DispatchEvent),
    Instruction(DispatchInstruction),
}

impl Output {
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Parse one stdin line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Option<Result<Request, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Apply a request to the engine.
pub fn handle(engine: &Engine, request: Request) -> Response {
    let request_id = request.request_id().map(str::to_string);
    let rid = request_id.as_deref();

    match request {
        Request::Enqueue { action, .. } => match engine.enqueue_action(action) {
            Ok(item) => Response {
                item_id: Some(item.id()),
                ..Response::ok(rid)
            },
            Err(e) => Response::from_error(rid, &e),
        },
        Request::Execute { request, .. } => match engine.execute_pattern(request) {
            Ok(execution_id) => Response {
                execution_id: Some(execution_id),
                ..Response::ok(rid)
            },
            Err(e) => Response::from_error(rid, &e),
        },
        Request::Cancel { execution_id, .. } => match engine.cancel_execution(execution_id) {
            Ok(execution) => Response {
                execution_id: Some(execution_id),
                execution: Some(execution),
                ..Response::ok(rid)
            },
            Err(e) => Response::from_error(rid, &e),
        },
        Request::Complete {
            item_id,
            success,
            message,
            ..
        } => {
            let result = if success {
                CompletionResult {
                    success: true,
                    message,
                }
            } else {
                CompletionResult::failed(message.unwrap_or_else(|| "Reported failure".to_string()))
            };
            if engine.report_completion(item_id, result) {
                Response {
                    item_id: Some(item_id),
                    ..Response::ok(rid)
                }
            } else {
                Response {
                    item_id: Some(item_id),
                    ..Response::rejected(rid, "UnknownItem", format!("No dispatch waiting on {}", item_id))
                }
            }
        }
        Request::Status { execution_id, .. } => match engine.execution(execution_id) {
            Some(execution) => Response {
                execution_id: Some(execution_id),
                execution: Some(execution),
                ..Response::ok(rid)
            },
            None => Response {
                execution_id: Some(execution_id),
                ..Response::rejected(
                    rid,
                    "ExecutionNotFound",
                    format!("Execution not found: {}", execution_id),
                )
            },
        },
    }
}
