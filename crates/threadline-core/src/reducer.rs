// Run state reducer
//
// Folds the ordered events of one run into its RunInfo snapshot. Replaying
// the same sequence from RunInfo::new always yields the same snapshot.

use chrono::{DateTime, Utc};

use crate::engine::ChatResponse;
use crate::event::{EventKind, Prompt, RunEvent};
use crate::run::{Output, PromptFrame, RunInfo, RunMessage, RunState};

impl RunInfo {
    /// Fold one event into the snapshot and return the client message for it
    pub fn apply(&mut self, event: &RunEvent) -> RunMessage {
        let event_type = event.event_type();

        match &event.kind {
            EventKind::RunStart { program } => {
                self.start = Some(event.time);
                self.program = program.clone();
                if self.input.is_empty() {
                    self.input = event.input.clone();
                }
                self.state = RunState::Running;
                return RunMessage::Run(self.frame(event_type));
            }
            EventKind::RunFinish { output, err, done } => {
                self.end = Some(event.time);
                self.output = output.clone();
                let err = err.as_deref().unwrap_or_default();
                if !err.is_empty() {
                    self.error = err.to_string();
                }
                if !self.state.is_terminal() {
                    self.state = if !err.is_empty() {
                        RunState::Error
                    } else if !done {
                        RunState::Continue
                    } else {
                        RunState::Finished
                    };
                }
                return RunMessage::Run(self.frame(event_type));
            }
            EventKind::Prompt { prompt } => {
                return RunMessage::Prompt(PromptFrame {
                    run_id: self.id,
                    time: event.time,
                    event_type,
                    call_context: None,
                    prompt: prompt.clone(),
                });
            }
            EventKind::CallConfirm {
                call_context,
                content,
            } => {
                return RunMessage::Prompt(PromptFrame {
                    run_id: self.id,
                    time: event.time,
                    event_type,
                    call_context: Some(call_context.clone()),
                    prompt: Prompt {
                        message: content.clone(),
                        ..Default::default()
                    },
                });
            }
            _ => {}
        }

        let Some(context) = event.call_context().filter(|c| !c.id.is_empty()) else {
            return RunMessage::Run(self.frame(event_type));
        };

        let mut call = self.calls.remove(&context.id).unwrap_or_default();
        call.context = context.clone();
        call.event_type = event_type;

        match &event.kind {
            EventKind::CallStart { content, .. } => {
                call.start = Some(event.time);
                call.input = content.clone();
            }
            EventKind::CallProgress { content, .. } => call.push_content(content),
            EventKind::CallSubCalls { tool_sub_calls, .. } => {
                call.output.push(Output::SubCalls(tool_sub_calls.clone()));
            }
            EventKind::CallFinish { content, usage, .. } => {
                finish_call(&mut call.end, call.start, event.time);
                call.push_content(content);
                if let Some(usage) = usage.filter(|u| !u.is_zero()) {
                    call.usage = usage;
                }
            }
            EventKind::CallChat {
                chat_request,
                chat_response,
                usage,
                ..
            } => {
                if let Some(request) = chat_request {
                    call.llm_request = Some(request.clone());
                }
                if let Some(response) = chat_response {
                    call.llm_response = Some(response.clone());
                }
                if let Some(usage) = usage.filter(|u| !u.is_zero()) {
                    call.usage = usage;
                }
            }
            // Run-level kinds and prompts returned above
            EventKind::CallContinue { .. }
            | EventKind::RunStart { .. }
            | EventKind::RunFinish { .. }
            | EventKind::Prompt { .. }
            | EventKind::CallConfirm { .. } => {}
        }

        self.calls.insert(context.id.clone(), call.clone());
        RunMessage::Call(call)
    }

    /// Record the execution result
    ///
    /// The lifecycle state only moves when no terminal state was reached yet;
    /// the continuation token and raw output are always recorded.
    pub fn apply_result(&mut self, result: &ChatResponse) -> RunMessage {
        self.raw_output = Some(result.clone());
        self.chat_state = result.state.clone();
        self.output = result.content.clone();
        if !self.state.is_terminal() {
            self.state = if result.done {
                RunState::Finished
            } else {
                RunState::Continue
            };
        }
        if self.end.is_none() {
            self.end = Some(Utc::now());
        }
        RunMessage::Stdout(result.clone())
    }

    /// Record an execution failure
    pub fn apply_error(&mut self, message: &str) -> RunMessage {
        self.error = message.to_string();
        if !self.state.is_terminal() {
            self.state = RunState::Error;
        }
        if self.end.is_none() {
            self.end = Some(Utc::now());
        }
        RunMessage::Stderr(message.to_string())
    }

    /// Rebuild a snapshot by folding events from scratch
    pub fn replay<'a>(id: u64, events: impl IntoIterator<Item = &'a RunEvent>) -> Self {
        let mut run = RunInfo::new(id);
        for event in events {
            run.apply(event);
        }
        run
    }
}

fn finish_call(end: &mut Option<DateTime<Utc>>, start: Option<DateTime<Utc>>, at: DateTime<Utc>) {
    if end.is_some() {
        return;
    }
    if start.is_some_and(|start| at < start) {
        return;
    }
    *end = Some(at);
}
