// In-memory engine implementations for standalone use and testing
//
// EchoEngine lets the server run without an external engine. ScriptedEngine
// replays a fixed list of monitor actions, which is what the dispatcher tests
// drive their scenarios with.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify};

use crate::engine::{ChatResponse, Engine, ExecutionContext, ProgramSource};
use crate::error::{ExecutionError, Result};
use crate::event::{CallContext, EventKind, Program, RunEvent, ToolCategory};

// ============================================================================
// EchoEngine - Answers every run with its input
// ============================================================================

/// Engine that echoes the input back through a single root call
#[derive(Debug, Default, Clone)]
pub struct EchoEngine;

impl EchoEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Engine for EchoEngine {
    async fn load(&self, source: &ProgramSource) -> Result<Program> {
        if source.is_empty() {
            return Err(ExecutionError::load("program has no content or file"));
        }

        let name = if source.file.is_empty() {
            "inline".to_string()
        } else {
            source.file.clone()
        };
        let entry_tool_id = if source.sub_tool.is_empty() {
            "main".to_string()
        } else {
            source.sub_tool.clone()
        };

        Ok(Program {
            name,
            entry_tool_id,
            tool_set: json!({ "content": source.content }),
        })
    }

    async fn chat(
        &self,
        ctx: ExecutionContext,
        _chat_state: Option<Value>,
        program: Program,
        env: Vec<String>,
        input: String,
    ) -> Result<ChatResponse> {
        let monitor = ctx
            .monitor
            .start(ctx.run_id, ToolCategory::None, &program, &env, &input)
            .await?;

        let call = CallContext::new(format!("{}.1", ctx.run_id))
            .with_tool_name(program.entry_tool_id.clone());
        monitor
            .event(RunEvent::new(EventKind::call_start(call.clone(), &input)))
            .await?;
        monitor
            .event(RunEvent::new(EventKind::call_progress(call.clone(), &input)))
            .await?;
        monitor
            .event(RunEvent::new(EventKind::call_finish(call, "")))
            .await?;
        monitor.stop(&input, true, None).await?;

        Ok(ChatResponse {
            done: true,
            content: input,
            tool_id: program.entry_tool_id,
            state: None,
        })
    }
}

// ============================================================================
// ScriptedEngine - Replays a fixed script of monitor actions
// ============================================================================

/// One action of a scripted execution
#[derive(Debug, Clone)]
pub enum Step {
    /// Publish an event through the session
    Emit(EventKind),
    /// Wait until the notify is signalled
    Wait(Arc<Notify>),
    /// Stop the session
    Stop {
        output: String,
        done: bool,
        err: Option<String>,
    },
}

/// Engine that replays a script and then returns a configured outcome
#[derive(Debug, Clone)]
pub struct ScriptedEngine {
    steps: Vec<Step>,
    category: ToolCategory,
    outcome: std::result::Result<ChatResponse, String>,
    load_error: Option<String>,
    chat_states: Arc<Mutex<Vec<Option<Value>>>>,
    completions: Arc<AtomicUsize>,
}

impl ScriptedEngine {
    /// Create an engine that runs `steps` and finishes with an empty result
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            category: ToolCategory::None,
            outcome: Ok(ChatResponse {
                done: true,
                ..Default::default()
            }),
            load_error: None,
            chat_states: Arc::new(Mutex::new(Vec::new())),
            completions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Return this result once the script is done
    pub fn with_result(mut self, result: ChatResponse) -> Self {
        self.outcome = Ok(result);
        self
    }

    /// Fail with this message once the script is done
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.outcome = Err(message.into());
        self
    }

    /// Fail program loading with this message
    pub fn with_load_error(mut self, message: impl Into<String>) -> Self {
        self.load_error = Some(message.into());
        self
    }

    /// Run the session under this tool category
    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }

    /// Continuation tokens received by each chat call, in order
    pub async fn chat_states(&self) -> Vec<Option<Value>> {
        self.chat_states.lock().await.clone()
    }

    /// Number of chat calls that ran to completion
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    async fn load(&self, source: &ProgramSource) -> Result<Program> {
        if let Some(message) = &self.load_error {
            return Err(ExecutionError::load(message.clone()));
        }
        Ok(Program {
            name: if source.file.is_empty() {
                "script".to_string()
            } else {
                source.file.clone()
            },
            entry_tool_id: source.sub_tool.clone(),
            tool_set: Value::Null,
        })
    }

    async fn chat(
        &self,
        ctx: ExecutionContext,
        chat_state: Option<Value>,
        program: Program,
        env: Vec<String>,
        input: String,
    ) -> Result<ChatResponse> {
        self.chat_states.lock().await.push(chat_state);

        let monitor = ctx
            .monitor
            .start(ctx.run_id, self.category, &program, &env, &input)
            .await?;

        for step in &self.steps {
            match step {
                Step::Emit(kind) => monitor.event(RunEvent::new(kind.clone())).await?,
                Step::Wait(notify) => notify.notified().await,
                Step::Stop { output, done, err } => {
                    monitor.stop(output, *done, err.clone()).await?
                }
            }
        }

        self.completions.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone().map_err(ExecutionError::execution)
    }
}
