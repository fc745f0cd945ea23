// Run tracking core
//
// This crate turns a live execution into ordered run events and folds them
// into run/call-tree snapshots. It has no storage or HTTP dependencies.
//
// Key design decisions:
// - Events are a tagged union (EventKind) so the reducer is an exhaustive match
// - The event bus is a single fan-out task; all subscribers see one publish order
// - Sessions carry their run id and tool category explicitly
// - A session mutex serializes emitters and backs pause/resume
// - The first terminal signal of a run decides its lifecycle state

pub mod bus;
pub mod engine;
pub mod error;
pub mod event;
pub mod history;
pub mod monitor;
pub mod reducer;
pub mod run;

// In-memory implementations for standalone use and testing
pub mod memory;

// Re-exports for convenience
pub use bus::{EventBus, Subscription};
pub use engine::{ChatResponse, Engine, ExecutionContext, ProgramSource};
pub use error::{ExecutionError, Result};
pub use event::{
    CallContext, EventKind, EventType, Program, Prompt, RunEvent, RunId, SubCall, ToolCategory,
    Usage,
};
pub use history::{CreateRun, Event, Run, Thread};
pub use memory::{EchoEngine, ScriptedEngine, Step};
pub use monitor::{Monitor, MonitorFactory, Resume, Session, SessionFactory};
pub use run::{Call, Output, PromptFrame, RunFrame, RunInfo, RunMessage, RunState};
