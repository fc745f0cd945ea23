// Run events published on the event bus
//
// RunEvent is the envelope the session monitor stamps with the run id and
// input echo. The payload is a tagged union (one variant per event kind) so
// consumers match on it exhaustively.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric identifier assigned to a run when it is created
pub type RunId = u64;

/// Category of the tool a session is executing
///
/// Only `None` is a top-level, client-visible run. Every other category is a
/// nested sub-execution whose run start/finish are not published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    #[default]
    #[serde(rename = "")]
    None,
    Credential,
    Provider,
    Context,
    Input,
    Output,
}

impl ToolCategory {
    pub fn is_none(&self) -> bool {
        matches!(self, ToolCategory::None)
    }

    /// Whether a session in this category is a top-level run
    pub fn is_top_level(&self) -> bool {
        self.is_none()
    }
}

/// Loaded program reference, opaque to the tracking layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Program {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "entryToolID", default)]
    pub entry_tool_id: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub tool_set: Value,
}

/// Identity and metadata of one call in the execution tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallContext {
    #[serde(default)]
    pub id: String,
    /// Empty for the root call of a run
    #[serde(rename = "parentID", default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub tool: Value,
    #[serde(default, skip_serializing_if = "ToolCategory::is_none")]
    pub tool_category: ToolCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
}

impl CallContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }

    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = tool_name.into();
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty()
    }
}

/// A child call as announced by its parent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubCall {
    #[serde(rename = "toolID", default)]
    pub tool_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,
}

/// Token accounting reported by model calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }
}

/// Request for input from the user, surfaced outside of the call tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Tag of an event, also recorded on the call it last touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    #[default]
    RunStart,
    RunFinish,
    CallStart,
    CallContinue,
    CallSubCalls,
    CallProgress,
    CallChat,
    CallConfirm,
    CallFinish,
    Prompt,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::RunStart => "runStart",
            EventType::RunFinish => "runFinish",
            EventType::CallStart => "callStart",
            EventType::CallContinue => "callContinue",
            EventType::CallSubCalls => "callSubCalls",
            EventType::CallProgress => "callProgress",
            EventType::CallChat => "callChat",
            EventType::CallConfirm => "callConfirm",
            EventType::CallFinish => "callFinish",
            EventType::Prompt => "prompt",
        };
        f.write_str(name)
    }
}

/// Payload of a run event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventKind {
    /// Top-level run started
    RunStart { program: Program },

    /// Top-level run finished; the terminal event of a run
    RunFinish {
        #[serde(default)]
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        err: Option<String>,
        #[serde(default)]
        done: bool,
    },

    /// Call started with its input
    CallStart {
        call_context: CallContext,
        #[serde(default)]
        content: String,
    },

    /// Call resumed after waiting on sub-calls
    CallContinue {
        call_context: CallContext,
        #[serde(default)]
        content: String,
    },

    /// Call announced the sub-calls it is waiting on
    CallSubCalls {
        call_context: CallContext,
        #[serde(default)]
        tool_sub_calls: BTreeMap<String, SubCall>,
    },

    /// Call produced more text output
    CallProgress {
        call_context: CallContext,
        #[serde(default)]
        content: String,
    },

    /// Raw model request and/or response of an LLM-invoking call
    CallChat {
        call_context: CallContext,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_request: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_response: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// Call is waiting for the user to confirm it
    CallConfirm {
        call_context: CallContext,
        #[serde(default)]
        content: String,
    },

    /// Call finished with its closing content
    CallFinish {
        call_context: CallContext,
        #[serde(default)]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },

    /// Execution is waiting for input from the user
    Prompt { prompt: Prompt },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::RunStart { .. } => EventType::RunStart,
            EventKind::RunFinish { .. } => EventType::RunFinish,
            EventKind::CallStart { .. } => EventType::CallStart,
            EventKind::CallContinue { .. } => EventType::CallContinue,
            EventKind::CallSubCalls { .. } => EventType::CallSubCalls,
            EventKind::CallProgress { .. } => EventType::CallProgress,
            EventKind::CallChat { .. } => EventType::CallChat,
            EventKind::CallConfirm { .. } => EventType::CallConfirm,
            EventKind::CallFinish { .. } => EventType::CallFinish,
            EventKind::Prompt { .. } => EventType::Prompt,
        }
    }

    /// Call context carried by call-scoped events
    pub fn call_context(&self) -> Option<&CallContext> {
        match self {
            EventKind::CallStart { call_context, .. }
            | EventKind::CallContinue { call_context, .. }
            | EventKind::CallSubCalls { call_context, .. }
            | EventKind::CallProgress { call_context, .. }
            | EventKind::CallChat { call_context, .. }
            | EventKind::CallConfirm { call_context, .. }
            | EventKind::CallFinish { call_context, .. } => Some(call_context),
            EventKind::RunStart { .. } | EventKind::RunFinish { .. } | EventKind::Prompt { .. } => {
                None
            }
        }
    }

    pub fn call_start(call_context: CallContext, input: impl Into<String>) -> Self {
        EventKind::CallStart {
            call_context,
            content: input.into(),
        }
    }

    pub fn call_progress(call_context: CallContext, content: impl Into<String>) -> Self {
        EventKind::CallProgress {
            call_context,
            content: content.into(),
        }
    }

    pub fn call_sub_calls(
        call_context: CallContext,
        tool_sub_calls: BTreeMap<String, SubCall>,
    ) -> Self {
        EventKind::CallSubCalls {
            call_context,
            tool_sub_calls,
        }
    }

    pub fn call_finish(call_context: CallContext, content: impl Into<String>) -> Self {
        EventKind::CallFinish {
            call_context,
            content: content.into(),
            usage: None,
        }
    }

    pub fn chat_request(call_context: CallContext, request: Value) -> Self {
        EventKind::CallChat {
            call_context,
            chat_request: Some(request),
            chat_response: None,
            usage: None,
        }
    }

    pub fn chat_response(call_context: CallContext, response: Value, usage: Usage) -> Self {
        EventKind::CallChat {
            call_context,
            chat_request: None,
            chat_response: Some(response),
            usage: Some(usage),
        }
    }

    pub fn prompt(prompt: Prompt) -> Self {
        EventKind::Prompt { prompt }
    }
}

/// Event envelope published on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub time: DateTime<Utc>,
    #[serde(rename = "runID", default)]
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub input: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl RunEvent {
    /// Create an event timestamped now; the session stamps the run id
    pub fn new(kind: EventKind) -> Self {
        Self {
            time: Utc::now(),
            run_id: 0,
            input: String::new(),
            kind,
        }
    }

    /// Create an event for a run at an explicit time
    pub fn at(run_id: RunId, time: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            time,
            run_id,
            input: String::new(),
            kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    pub fn call_context(&self) -> Option<&CallContext> {
        self.kind.call_context()
    }

    /// Whether this event ends the run's event sequence
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::RunFinish { .. })
    }
}

impl From<EventKind> for RunEvent {
    fn from(kind: EventKind) -> Self {
        RunEvent::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_event_serialization() {
        let event = RunEvent::at(
            7,
            Utc::now(),
            EventKind::call_progress(CallContext::new("call_1").with_parent("root"), "hi"),
        );

        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "callProgress");
        assert_eq!(json["runID"], 7);
        assert_eq!(json["callContext"]["id"], "call_1");
        assert_eq!(json["callContext"]["parentID"], "root");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn test_run_event_deserialization() {
        let raw = json!({
            "time": "2024-05-01T10:00:00Z",
            "runID": 3,
            "type": "runFinish",
            "output": "bye",
            "err": "boom",
            "done": true
        });

        let event: RunEvent = serde_json::from_value(raw).unwrap();

        assert_eq!(event.run_id, 3);
        assert!(event.is_terminal());
        assert_eq!(
            event.kind,
            EventKind::RunFinish {
                output: "bye".to_string(),
                err: Some("boom".to_string()),
                done: true,
            }
        );
    }

    #[test]
    fn test_tool_category_wire_names() {
        assert_eq!(serde_json::to_value(ToolCategory::None).unwrap(), json!(""));
        assert_eq!(
            serde_json::to_value(ToolCategory::Credential).unwrap(),
            json!("credential")
        );
        assert!(ToolCategory::None.is_top_level());
        assert!(!ToolCategory::Provider.is_top_level());
    }

    #[test]
    fn test_call_context_accessor() {
        let event = RunEvent::new(EventKind::prompt(Prompt::default()));
        assert!(event.call_context().is_none());

        let event = RunEvent::new(EventKind::call_start(CallContext::new("c"), "in"));
        assert_eq!(event.call_context().map(|c| c.id.as_str()), Some("c"));
        assert_eq!(event.event_type(), EventType::CallStart);
    }
}
