// Run execution and event streaming
//
// POST /v1/run starts a program and streams its run as SSE frames. The
// dispatcher subscribes to the event bus before the execution starts, then a
// merge task folds this run's events into a RunInfo, persists them and
// forwards each snapshot. The run ends with the held-back runFinish snapshot,
// `data: [DONE]`, and finalization in the store.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::post,
    Json, Router,
};
use futures::{future::BoxFuture, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use threadline_core::{
    ChatResponse, CreateRun, Engine, EventBus, EventType, ExecutionContext, ExecutionError,
    ProgramSource, RunEvent, RunId, RunInfo, RunMessage, RunState, SessionFactory, Subscription,
};
use threadline_storage::{Database, RunDisposition, StoreError};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use utoipa::ToSchema;

use crate::common::{store_error, ApiError};
use crate::AppState;

/// Payload of the final SSE frame of a run
pub const DONE: &str = "[DONE]";

const FRAME_BUFFER: usize = 64;

type Outcome = threadline_core::Result<ChatResponse>;

/// Request to run a program
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Inline program text
    #[serde(default)]
    pub content: String,
    /// Program file to load
    #[serde(default)]
    pub file: String,
    /// Tool to start from instead of the program's entry tool
    #[serde(default)]
    pub sub_tool: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub env: Vec<String>,
    /// Thread to attach the run to
    #[serde(rename = "threadID", default)]
    pub thread_id: u64,
    /// Run this one continues; its thread wins over `threadID`
    #[serde(rename = "previousRunID", default)]
    pub previous_run_id: RunId,
    /// Continuation token returned by the previous run
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub chat_state: Option<Value>,
}

/// Create run routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/run", post(run))
        .with_state(state)
}

/// POST /v1/run - Run a program and stream its events
#[utoipa::path(
    post,
    path = "/v1/run",
    request_body = RunRequest,
    responses(
        (status = 200, description = "Run event stream", content_type = "text/event-stream"),
        (status = 400, description = "Invalid request", body = ApiError),
        (status = 404, description = "Thread or previous run not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "runs"
)]
pub async fn run(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let frames = state.dispatcher.start(request).await?;
    let stream = ReceiverStream::new(frames).map(|data| Ok(SseEvent::default().data(data)));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Starts runs and streams them
pub struct Dispatcher {
    engine: Arc<dyn Engine>,
    bus: EventBus,
    store: Option<Arc<Database>>,
    next_run_id: AtomicU64,
    quiet_store_errors: bool,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn Engine>, bus: EventBus, store: Option<Arc<Database>>) -> Self {
        Self {
            engine,
            bus,
            store,
            next_run_id: AtomicU64::new(1),
            quiet_store_errors: false,
        }
    }

    /// Log persistence failures at debug level
    pub fn with_quiet_store_errors(mut self, quiet: bool) -> Self {
        self.quiet_store_errors = quiet;
        self
    }

    /// Start a run and return the receiver of its SSE frame payloads
    ///
    /// Everything that can fail with an HTTP status happens before the
    /// execution starts. The receiver closes after `[DONE]` once the run is
    /// finalized; dropping it early cancels the stream but not the execution.
    pub async fn start(&self, request: RunRequest) -> Result<mpsc::Receiver<String>, ApiError> {
        let RunRequest {
            content,
            file,
            sub_tool,
            input,
            env,
            thread_id,
            previous_run_id,
            chat_state,
        } = request;

        let source = ProgramSource {
            content,
            file,
            sub_tool,
        };
        if source.is_empty() {
            return Err(ApiError::bad_request("content or file is required"));
        }

        let program = self.engine.load(&source).await.map_err(|e| {
            tracing::error!("Failed to load program: {}", e);
            ApiError::internal(e.to_string())
        })?;

        // Subscribe first, so a dead bus fails the request before a run row exists
        let events = self.bus.subscribe().await.map_err(|e| {
            tracing::error!("Failed to subscribe to events: {}", e);
            ApiError::internal(e.to_string())
        })?;

        let (run_id, thread_id) = match &self.store {
            Some(store) => {
                let created = store
                    .create_run(CreateRun {
                        thread_id,
                        previous_run_id,
                        input: input.clone(),
                        run: RunInfo::new(0),
                    })
                    .await
                    .map_err(store_error("create run"))?;
                (created.id, created.thread_id)
            }
            None => (self.next_run_id.fetch_add(1, Ordering::SeqCst), thread_id),
        };

        tracing::info!(run_id, thread_id, program = %program.name, "Starting run");

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let engine = self.engine.clone();
        let ctx = ExecutionContext {
            run_id,
            monitor: Arc::new(SessionFactory::new(self.bus.clone())),
        };
        let chat_input = input.clone();
        tokio::spawn(async move {
            let outcome = engine.chat(ctx, chat_state, program, env, chat_input).await;
            if outcome_tx.send(outcome).is_err() {
                tracing::debug!(run_id, "Run stream finished before the execution");
            }
        });

        let mut run = RunInfo::new(run_id);
        run.thread_id = thread_id;
        run.input = input;

        let (frames, rx) = mpsc::channel(FRAME_BUFFER);
        let stream = RunStream {
            run,
            bus: self.bus.clone(),
            store: self.store.clone(),
            frames,
            quiet_store_errors: self.quiet_store_errors,
            finished: false,
            client_gone: false,
        };
        tokio::spawn(stream.merge(events, outcome_rx));

        Ok(rx)
    }
}

/// Merge task state for one run
struct RunStream {
    run: RunInfo,
    bus: EventBus,
    store: Option<Arc<Database>>,
    frames: mpsc::Sender<String>,
    quiet_store_errors: bool,
    /// runFinish was folded; its frame is held back
    finished: bool,
    client_gone: bool,
}

impl RunStream {
    async fn merge(mut self, mut events: Subscription, mut outcome: oneshot::Receiver<Outcome>) {
        let run_id = self.run.id;
        let mut result: Option<Outcome> = None;
        let mut flush: BoxFuture<'static, threadline_core::Result<()>> =
            Box::pin(futures::future::pending());
        let mut flushing = false;

        // Events until runFinish. If the execution returns first, wait for the
        // bus to hand over everything it published before returning.
        while !self.finished && !self.client_gone {
            tokio::select! {
                biased;
                _ = self.frames.closed() => self.client_gone = true,
                _ = &mut flush, if flushing => {
                    while let Some(event) = events.try_recv() {
                        self.on_event(event).await;
                        if self.finished {
                            break;
                        }
                    }
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break,
                },
                received = &mut outcome, if result.is_none() => {
                    result = Some(received.unwrap_or(Err(ExecutionError::Abandoned)));
                    let bus = self.bus.clone();
                    flush = Box::pin(async move { bus.flush().await });
                    flushing = true;
                }
            }
        }

        // The continuation token only arrives with the execution result
        if result.is_none() && !self.client_gone {
            loop {
                tokio::select! {
                    biased;
                    _ = self.frames.closed() => {
                        self.client_gone = true;
                        break;
                    }
                    received = &mut outcome => {
                        result = Some(received.unwrap_or(Err(ExecutionError::Abandoned)));
                        break;
                    }
                    Some(event) = events.recv() => {
                        if event.run_id == run_id {
                            tracing::debug!(run_id, event_type = %event.event_type(), "Ignoring event after run finished");
                        }
                    }
                }
            }
        }

        let result = match result {
            Some(result) => {
                events.close();
                result
            }
            None => {
                tracing::debug!(run_id, "Client went away, draining events");
                tokio::spawn(drain(events, outcome))
                    .await
                    .unwrap_or_else(|_| Err(ExecutionError::Abandoned))
            }
        };

        let message = match result {
            Ok(response) => self.run.apply_result(&response),
            Err(e) => {
                tracing::warn!(run_id, "Run failed: {}", e);
                self.run.apply_error(&e.to_string())
            }
        };
        self.send(&message).await;

        self.finish().await;
    }

    /// Persist, fold and forward one event of this run
    async fn on_event(&mut self, event: RunEvent) {
        if event.run_id != self.run.id || self.finished {
            return;
        }

        if let Some(store) = &self.store {
            if let Err(e) = store.create_event(self.run.id, &event).await {
                self.report("store event", &e);
            }
        }

        let message = self.run.apply(&event);
        if event.is_terminal() {
            self.finished = true;
            return;
        }
        self.send(&message).await;
    }

    /// Attach a thread if needed, close the stream and finalize the run
    async fn finish(mut self) {
        let run_id = self.run.id;

        if self.run.thread_id == 0 && self.run.state == RunState::Continue {
            if let Some(store) = &self.store {
                match store.create_thread(run_id).await {
                    Ok(thread) => self.run.thread_id = thread.id,
                    Err(e) => self.report("create thread", &e),
                }
            }
        }

        if self.finished {
            let frame = RunMessage::Run(self.run.frame(EventType::RunFinish));
            self.send(&frame).await;
        }
        self.send_raw(DONE.to_string()).await;

        let Some(store) = self.store.clone() else {
            return;
        };
        match store.finish_run(self.run.thread_id, run_id, &self.run).await {
            Ok(RunDisposition::Persisted { thread_id }) => {
                tracing::debug!(run_id, thread_id, state = %self.run.state, "Run persisted");
            }
            Ok(RunDisposition::Discarded) => {
                tracing::debug!(run_id, state = %self.run.state, "Run discarded");
            }
            Err(e) => self.report("finish run", &e),
        }
    }

    async fn send(&mut self, message: &RunMessage) {
        match serde_json::to_string(message) {
            Ok(data) => self.send_raw(data).await,
            Err(e) => tracing::warn!(run_id = self.run.id, "Failed to encode frame: {}", e),
        }
    }

    async fn send_raw(&mut self, data: String) {
        if self.client_gone {
            return;
        }
        if self.frames.send(data).await.is_err() {
            self.client_gone = true;
        }
    }

    fn report(&self, action: &str, err: &StoreError) {
        if self.quiet_store_errors {
            tracing::debug!(run_id = self.run.id, "Failed to {}: {}", action, err);
        } else {
            tracing::warn!(run_id = self.run.id, "Failed to {}: {}", action, err);
        }
    }
}

/// Consume a subscription nobody reads anymore until the execution completes
async fn drain(mut events: Subscription, mut outcome: oneshot::Receiver<Outcome>) -> Outcome {
    let result = loop {
        tokio::select! {
            received = &mut outcome => break received.unwrap_or(Err(ExecutionError::Abandoned)),
            Some(_) = events.recv() => {}
        }
    };
    events.close();
    result
}
