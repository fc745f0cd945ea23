// Execution engine contract
//
// The engine loads programs and runs them, reporting progress through the
// session monitor handed to it in the execution context. What a tool call
// actually does is entirely up to the engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::event::{Program, RunId};
use crate::monitor::MonitorFactory;

/// Where to load a program from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSource {
    /// Inline program text
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    /// Path or reference to a program file
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    /// Tool to use as the entry point instead of the default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_tool: String,
}

impl ProgramSource {
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.file.is_empty()
    }
}

/// Terminal result of an execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    /// False when the run suspended and can be continued
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "toolID", default, skip_serializing_if = "String::is_empty")]
    pub tool_id: String,
    /// Continuation token to resume from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

/// Per-execution handles passed to the engine
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub monitor: Arc<dyn MonitorFactory>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Program loader and executor
#[async_trait]
pub trait Engine: Send + Sync {
    /// Load a program from its source
    async fn load(&self, source: &ProgramSource) -> Result<Program>;

    /// Run a program until it finishes or suspends
    ///
    /// `chat_state` is the continuation token of the previous run, if any.
    async fn chat(
        &self,
        ctx: ExecutionContext,
        chat_state: Option<Value>,
        program: Program,
        env: Vec<String>,
        input: String,
    ) -> Result<ChatResponse>;
}
