// Run and call snapshots
//
// RunInfo is the folded view of one run: lifecycle, result and the call tree.
// The call map is kept out of the serialized RunInfo because it is stored and
// returned separately from the run snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::ChatResponse;
use crate::event::{CallContext, EventType, Program, Prompt, RunId, SubCall, Usage};

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Creating,
    Running,
    Continue,
    Finished,
    Error,
}

impl RunState {
    /// Whether the run has reached an outcome
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Continue | RunState::Finished | RunState::Error
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Creating => write!(f, "creating"),
            RunState::Running => write!(f, "running"),
            RunState::Continue => write!(f, "continue"),
            RunState::Finished => write!(f, "finished"),
            RunState::Error => write!(f, "error"),
        }
    }
}

/// One chunk of a call's output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Output {
    /// Text produced by the call
    Content(String),
    /// Child calls the call was waiting on at that point
    SubCalls(BTreeMap<String, SubCall>),
}

/// A node of the call tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    #[serde(flatten)]
    pub context: CallContext,
    /// Kind of the last event folded into this call
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: Vec<Output>,
    #[serde(default, skip_serializing_if = "Usage::is_zero")]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_request: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_response: Option<Value>,
}

impl Call {
    /// Append text, extending the last chunk when it is text
    ///
    /// After a sub-call chunk, or on an empty output, a new text chunk is
    /// started even for empty content.
    pub(crate) fn push_content(&mut self, content: &str) {
        match self.output.last_mut() {
            Some(Output::Content(last)) => last.push_str(content),
            _ => self.output.push(Output::Content(content.to_string())),
        }
    }

    /// Concatenated text output of the call
    pub fn text(&self) -> String {
        self.output
            .iter()
            .filter_map(|chunk| match chunk {
                Output::Content(text) => Some(text.as_str()),
                Output::SubCalls(_) => None,
            })
            .collect()
    }
}

/// Folded view of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunInfo {
    pub id: RunId,
    #[serde(rename = "threadID", default)]
    pub thread_id: u64,
    #[serde(default)]
    pub program: Program,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<ChatResponse>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_state: Option<Value>,
    #[serde(skip)]
    pub calls: BTreeMap<String, Call>,
}

impl RunInfo {
    /// Fresh run in the creating state with an empty call tree
    pub fn new(id: RunId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Snapshot of the run as streamed to clients
    pub fn frame(&self, event_type: EventType) -> RunFrame {
        RunFrame {
            info: self.clone(),
            event_type,
        }
    }

    /// Id of the root call, the earliest call without a parent
    pub fn root_call_id(&self) -> Option<&str> {
        self.calls
            .values()
            .filter(|call| call.context.is_root())
            .min_by(|a, b| a.start.cmp(&b.start).then(a.context.id.cmp(&b.context.id)))
            .map(|call| call.context.id.as_str())
    }
}

/// Run snapshot tagged with the event that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFrame {
    #[serde(flatten)]
    pub info: RunInfo,
    #[serde(rename = "type")]
    pub event_type: EventType,
}

/// Prompt surfaced to the client outside of the call tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFrame {
    #[serde(rename = "runID")]
    pub run_id: RunId,
    pub time: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_context: Option<CallContext>,
    #[serde(flatten)]
    pub prompt: Prompt,
}

/// Message produced for the client by each fold step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMessage {
    Run(RunFrame),
    Call(Call),
    Prompt(PromptFrame),
    Stdout(ChatResponse),
    Stderr(String),
}
