// Session monitor
//
// The engine reports progress through a Monitor obtained from the factory in
// its ExecutionContext. Each Session is bound to one run id and serializes its
// emitters behind a mutex that pause() can hold across engine work.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::bus::EventBus;
use crate::error::Result;
use crate::event::{EventKind, Program, RunEvent, RunId, ToolCategory};

/// Creates per-run monitors
#[async_trait]
pub trait MonitorFactory: Send + Sync {
    /// Start monitoring a run
    async fn start(
        &self,
        run_id: RunId,
        category: ToolCategory,
        program: &Program,
        env: &[String],
        input: &str,
    ) -> Result<Box<dyn Monitor>>;

    /// Pause all monitoring owned by the factory
    async fn pause(&self) -> Resume;
}

/// Progress reporting for one run
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Publish an event on behalf of the run
    async fn event(&self, event: RunEvent) -> Result<()>;

    /// Report the end of the run
    async fn stop(&self, output: &str, done: bool, err: Option<String>) -> Result<()>;

    /// Block emission until the returned handle is resumed or dropped
    async fn pause(&self) -> Resume;
}

/// Handle returned by pause; releases the pause when resumed or dropped
#[derive(Debug, Default)]
#[must_use = "the pause ends as soon as the handle is dropped"]
pub struct Resume {
    _guard: Option<OwnedMutexGuard<()>>,
}

impl Resume {
    /// Handle that holds nothing
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn resume(self) {}
}

/// Factory of sessions publishing onto an event bus
#[derive(Debug, Clone)]
pub struct SessionFactory {
    bus: EventBus,
}

impl SessionFactory {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Create a session without publishing anything
    pub fn session(&self, run_id: RunId, category: ToolCategory, input: &str) -> Session {
        Session {
            run_id,
            category,
            input: input.to_string(),
            bus: self.bus.clone(),
            run_lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl MonitorFactory for SessionFactory {
    async fn start(
        &self,
        run_id: RunId,
        category: ToolCategory,
        program: &Program,
        _env: &[String],
        input: &str,
    ) -> Result<Box<dyn Monitor>> {
        let session = self.session(run_id, category, input);
        if category.is_top_level() {
            session
                .event(RunEvent::new(EventKind::RunStart {
                    program: program.clone(),
                }))
                .await?;
        }
        Ok(Box::new(session))
    }

    async fn pause(&self) -> Resume {
        Resume::noop()
    }
}

/// Monitor bound to one run
#[derive(Debug)]
pub struct Session {
    run_id: RunId,
    category: ToolCategory,
    input: String,
    bus: EventBus,
    run_lock: Arc<Mutex<()>>,
}

#[async_trait]
impl Monitor for Session {
    async fn event(&self, mut event: RunEvent) -> Result<()> {
        let _lock = self.run_lock.lock().await;
        event.run_id = self.run_id;
        event.input = self.input.clone();
        self.bus.publish(event).await
    }

    async fn stop(&self, output: &str, done: bool, err: Option<String>) -> Result<()> {
        if !self.category.is_top_level() {
            return Ok(());
        }
        self.event(RunEvent::new(EventKind::RunFinish {
            output: output.to_string(),
            err,
            done,
        }))
        .await
    }

    async fn pause(&self) -> Resume {
        Resume {
            _guard: Some(self.run_lock.clone().lock_owned().await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CallContext;
    use std::time::Duration;

    fn program() -> Program {
        Program {
            name: "demo".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_top_level_session_publishes_run_events() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe().await.unwrap();
        let factory = SessionFactory::new(bus);

        let session = factory
            .start(9, ToolCategory::None, &program(), &[], "hi")
            .await
            .unwrap();
        session
            .event(RunEvent::new(EventKind::call_start(CallContext::new("c"), "x")))
            .await
            .unwrap();
        session
            .stop("bye", true, Some("bad".to_string()))
            .await
            .unwrap();

        let start = sub.recv().await.unwrap();
        assert_eq!(start.run_id, 9);
        assert_eq!(start.input, "hi");
        assert!(matches!(start.kind, EventKind::RunStart { ref program } if program.name == "demo"));

        let call = sub.recv().await.unwrap();
        assert_eq!(call.run_id, 9);
        assert_eq!(call.input, "hi");

        let finish = sub.recv().await.unwrap();
        assert_eq!(
            finish.kind,
            EventKind::RunFinish {
                output: "bye".to_string(),
                err: Some("bad".to_string()),
                done: true,
            }
        );
    }

    #[tokio::test]
    async fn test_nested_session_suppresses_run_events() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe().await.unwrap();
        let factory = SessionFactory::new(bus);

        let session = factory
            .start(3, ToolCategory::Credential, &program(), &[], "")
            .await
            .unwrap();
        session
            .event(RunEvent::new(EventKind::call_progress(CallContext::new("c"), "x")))
            .await
            .unwrap();
        session.stop("ignored", true, None).await.unwrap();

        let only = sub.recv().await.unwrap();
        assert!(matches!(only.kind, EventKind::CallProgress { .. }));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_pause_holds_emitters() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe().await.unwrap();
        let session: Arc<dyn Monitor> = Arc::new(SessionFactory::new(bus).session(1, ToolCategory::None, ""));

        let resume = session.pause().await;

        let emitter = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .event(RunEvent::new(EventKind::call_progress(
                        CallContext::new("c"),
                        "late",
                    )))
                    .await
            })
        };

        assert!(
            tokio::time::timeout(Duration::from_millis(50), sub.recv())
                .await
                .is_err()
        );

        resume.resume();
        emitter.await.unwrap().unwrap();
        let event = sub.recv().await.unwrap();
        assert_eq!(event.run_id, 1);
    }

    #[tokio::test]
    async fn test_factory_pause_is_noop() {
        let factory = SessionFactory::new(EventBus::default());
        factory.pause().await.resume();
    }
}
