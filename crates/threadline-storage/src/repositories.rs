// Repository layer for thread/run/event history

use std::time::Duration;

use chrono::Utc;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use sqlx::migrate::Migrator;
use threadline_core::{CreateRun, Event, Run, RunEvent, RunId, RunInfo, Thread};
use tracing::{debug, instrument};

use crate::error::{Result, StoreError};
use crate::models::*;

static SQLITE_MIGRATOR: Migrator = sqlx::migrate!("./migrations/sqlite");
static POSTGRES_MIGRATOR: Migrator = sqlx::migrate!("./migrations/postgres");

const THREAD_COLUMNS: &str = "id, name, created_at, updated_at, first_run_id";
const RUN_COLUMNS: &str = "id, previous_run_id, thread_id, started_at, finished_at, input, output, chat_state_after, run, calls";
const EVENT_COLUMNS: &str = "id, run_id, created_at, event";

/// Database backend selected by the DSN scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    /// Parse the backend from a DSN and return the URL sqlx should connect to
    pub fn from_dsn(dsn: &str) -> Result<(Self, String)> {
        if dsn.starts_with("sqlite::memory:") {
            return Ok((Backend::Sqlite, dsn.to_string()));
        }
        if dsn.starts_with("sqlite://") {
            // Create the database file on first use
            let url = if dsn.contains('?') {
                dsn.to_string()
            } else {
                format!("{}?mode=rwc", dsn)
            };
            return Ok((Backend::Sqlite, url));
        }
        if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
            return Ok((Backend::Postgres, dsn.to_string()));
        }

        let scheme = dsn.split("://").next().unwrap_or(dsn);
        Err(StoreError::UnsupportedDsn(scheme.to_string()))
    }

    fn migrator(&self) -> &'static Migrator {
        match self {
            Backend::Sqlite => &SQLITE_MIGRATOR,
            Backend::Postgres => &POSTGRES_MIGRATOR,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    backend: Backend,
}

impl Database {
    /// Connect to the database named by the DSN
    ///
    /// SQLite gets a single long-lived connection (one writer, and an
    /// in-memory database lives only as long as its connection). PostgreSQL
    /// gets a pool of five with a three minute connection lifetime.
    pub async fn connect(dsn: &str) -> Result<Self> {
        sqlx::any::install_default_drivers();

        let (backend, url) = Backend::from_dsn(dsn)?;
        let options = match backend {
            Backend::Sqlite => AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
            Backend::Postgres => AnyPoolOptions::new()
                .max_connections(5)
                .max_lifetime(Duration::from_secs(3 * 60)),
        };
        let pool = options.connect(&url).await?;

        debug!(?backend, "Connected to history database");
        Ok(Self { pool, backend })
    }

    /// Connect and bring the schema up to date
    pub async fn connect_and_migrate(dsn: &str) -> Result<Self> {
        let db = Self::connect(dsn).await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Apply all pending migrations
    pub async fn migrate(&self) -> Result<()> {
        self.backend.migrator().run(&self.pool).await?;
        Ok(())
    }

    /// Revert applied migrations down to (excluding) `target`
    pub async fn revert(&self, target: i64) -> Result<()> {
        self.backend.migrator().undo(&self.pool, target).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============================================
    // Threads
    // ============================================

    #[instrument(skip(self))]
    pub async fn create_thread(&self, first_run_id: RunId) -> Result<Thread> {
        let now = encode_time(Utc::now());
        let row = sqlx::query_as::<_, ThreadRow>(&format!(
            r#"
            INSERT INTO threads (name, created_at, updated_at, first_run_id)
            VALUES (NULL, $1, $2, $3)
            RETURNING {THREAD_COLUMNS}
            "#
        ))
        .bind(&now)
        .bind(&now)
        .bind(to_db_id(first_run_id)?)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    #[instrument(skip(self))]
    pub async fn name_thread(&self, id: u64, name: Option<String>) -> Result<Thread> {
        let row = sqlx::query_as::<_, ThreadRow>(&format!(
            r#"
            UPDATE threads
            SET name = $1, updated_at = $2
            WHERE id = $3
            RETURNING {THREAD_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(encode_time(Utc::now()))
        .bind(to_db_id(id)?)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("thread {}", id)))?;

        row.try_into()
    }

    /// Delete a thread with its runs and their events in one transaction
    #[instrument(skip(self))]
    pub async fn delete_thread(&self, id: u64) -> Result<()> {
        let id = to_db_id(id)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM events
            WHERE run_id IN (SELECT id FROM runs WHERE thread_id = $1)
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let runs = sqlx::query("DELETE FROM runs WHERE thread_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let deleted = sqlx::query("DELETE FROM threads WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            tx.rollback().await?;
            return Err(StoreError::not_found(format!("thread {}", id)));
        }

        tx.commit().await?;
        debug!(thread_id = id, runs, "Deleted thread");
        Ok(())
    }

    pub async fn list_threads(&self) -> Result<Vec<Thread>> {
        let rows = sqlx::query_as::<_, ThreadRow>(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Thread::try_from).collect()
    }

    pub async fn get_thread(&self, id: u64) -> Result<Thread> {
        let row = sqlx::query_as::<_, ThreadRow>(&format!(
            "SELECT {THREAD_COLUMNS} FROM threads WHERE id = $1"
        ))
        .bind(to_db_id(id)?)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("thread {}", id)))?;

        row.try_into()
    }

    // ============================================
    // Runs
    // ============================================

    /// Insert a run row
    ///
    /// A run continuing `previous_run_id` joins that run's thread; otherwise an
    /// explicit `thread_id` must name an existing thread.
    #[instrument(skip(self, input), fields(thread_id = input.thread_id, previous_run_id = input.previous_run_id))]
    pub async fn create_run(&self, input: CreateRun) -> Result<Run> {
        let mut tx = self.pool.begin().await?;

        let thread_id = if input.previous_run_id != 0 {
            let previous: Option<(i64,)> =
                sqlx::query_as("SELECT thread_id FROM runs WHERE id = $1")
                    .bind(to_db_id(input.previous_run_id)?)
                    .fetch_optional(&mut *tx)
                    .await?;
            let (thread_id,) = previous.ok_or_else(|| {
                StoreError::not_found(format!("run {}", input.previous_run_id))
            })?;
            thread_id
        } else if input.thread_id != 0 {
            let thread_id = to_db_id(input.thread_id)?;
            let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM threads WHERE id = $1")
                .bind(thread_id)
                .fetch_optional(&mut *tx)
                .await?;
            if exists.is_none() {
                return Err(StoreError::not_found(format!("thread {}", input.thread_id)));
            }
            thread_id
        } else {
            0
        };

        let started_at = input.run.start.unwrap_or_else(Utc::now);
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO runs (previous_run_id, thread_id, started_at, input, output, run, calls)
            VALUES ($1, $2, $3, $4, '', '{}', '{}')
            RETURNING id
            "#,
        )
        .bind(to_db_id(input.previous_run_id)?)
        .bind(thread_id)
        .bind(encode_time(started_at))
        .bind(&input.input)
        .fetch_one(&mut *tx)
        .await?;

        let mut info = input.run;
        info.id = to_id(id);
        info.thread_id = to_id(thread_id);
        if info.input.is_empty() {
            info.input = input.input.clone();
        }

        let row = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            UPDATE runs
            SET run = $1, calls = $2
            WHERE id = $3
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(serde_json::to_string(&info)?)
        .bind(serde_json::to_string(&info.calls)?)
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    /// Finalize a run: keep it under its thread, or discard it when it has none
    ///
    /// A thread id already stored on the run wins over `thread_id`.
    #[instrument(skip(self, run), fields(state = %run.state))]
    pub async fn finish_run(&self, thread_id: u64, id: RunId, run: &RunInfo) -> Result<RunDisposition> {
        let db_id = to_db_id(id)?;
        let mut tx = self.pool.begin().await?;

        let stored: Option<(i64,)> = sqlx::query_as("SELECT thread_id FROM runs WHERE id = $1")
            .bind(db_id)
            .fetch_optional(&mut *tx)
            .await?;
        let (stored,) = stored.ok_or_else(|| StoreError::not_found(format!("run {}", id)))?;
        let thread_id = if stored != 0 { to_id(stored) } else { thread_id };

        if thread_id == 0 {
            sqlx::query("DELETE FROM events WHERE run_id = $1")
                .bind(db_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM runs WHERE id = $1")
                .bind(db_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!(run_id = id, "Discarded run without thread");
            return Ok(RunDisposition::Discarded);
        }

        let mut info = run.clone();
        info.id = id;
        info.thread_id = thread_id;
        let chat_state = info
            .chat_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let now = encode_time(Utc::now());
        let finished_at = info.end.map(encode_time).unwrap_or_else(|| now.clone());
        let db_thread_id = to_db_id(thread_id)?;

        let updated = sqlx::query(
            r#"
            UPDATE runs
            SET thread_id = $1, finished_at = $2, output = $3, chat_state_after = $4, run = $5, calls = $6
            WHERE id = $7
            "#,
        )
        .bind(db_thread_id)
        .bind(finished_at)
        .bind(&info.output)
        .bind(chat_state)
        .bind(serde_json::to_string(&info)?)
        .bind(serde_json::to_string(&info.calls)?)
        .bind(db_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Err(StoreError::not_found(format!("run {}", id)));
        }

        // Only the first run attached is recorded; the thread is otherwise untouched
        sqlx::query("UPDATE threads SET first_run_id = $1 WHERE id = $2 AND first_run_id = 0")
            .bind(db_id)
            .bind(db_thread_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(RunDisposition::Persisted { thread_id })
    }

    pub async fn list_runs(&self, thread_id: u64) -> Result<Vec<Run>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE thread_id = $1 ORDER BY id ASC"
        ))
        .bind(to_db_id(thread_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Run::try_from).collect()
    }

    pub async fn get_run(&self, thread_id: u64, id: RunId) -> Result<Run> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE thread_id = $1 AND id = $2"
        ))
        .bind(to_db_id(thread_id)?)
        .bind(to_db_id(id)?)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("run {}", id)))?;

        row.try_into()
    }

    // ============================================
    // Events
    // ============================================

    pub async fn create_event(&self, run_id: RunId, event: &RunEvent) -> Result<Event> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            INSERT INTO events (run_id, created_at, event)
            VALUES ($1, $2, $3)
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(to_db_id(run_id)?)
        .bind(encode_time(Utc::now()))
        .bind(serde_json::to_string(event)?)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    pub async fn list_events(&self, run_id: RunId) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE run_id = $1 ORDER BY id ASC"
        ))
        .bind(to_db_id(run_id)?)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Event::try_from).collect()
    }

    pub async fn get_event(&self, run_id: RunId, id: u64) -> Result<Event> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE run_id = $1 AND id = $2"
        ))
        .bind(to_db_id(run_id)?)
        .bind(to_db_id(id)?)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("event {}", id)))?;

        row.try_into()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use threadline_core::{Call, CallContext, EventKind, RunState};

    async fn test_db() -> Database {
        Database::connect_and_migrate("sqlite::memory:").await.unwrap()
    }

    fn progress(run_id: u64, content: &str) -> RunEvent {
        let mut event = RunEvent::new(EventKind::call_progress(CallContext::new("c1"), content));
        event.run_id = run_id;
        event
    }

    async fn create_run(db: &Database, thread_id: u64, previous_run_id: u64) -> Result<Run> {
        db.create_run(CreateRun {
            thread_id,
            previous_run_id,
            input: "hello".to_string(),
            run: RunInfo::new(0),
        })
        .await
    }

    fn finished(run: &Run) -> RunInfo {
        let mut info = run.run_info();
        info.state = RunState::Continue;
        info.output = "world".to_string();
        info.chat_state = Some(json!({"turn": 1}));
        info.calls.insert(
            "c1".to_string(),
            Call {
                context: CallContext::new("c1"),
                input: "hello".to_string(),
                ..Default::default()
            },
        );
        info
    }

    #[test]
    fn test_backend_from_dsn() {
        assert_eq!(
            Backend::from_dsn("sqlite:///tmp/threads.db").unwrap(),
            (Backend::Sqlite, "sqlite:///tmp/threads.db?mode=rwc".to_string())
        );
        assert_eq!(
            Backend::from_dsn("sqlite::memory:").unwrap().0,
            Backend::Sqlite
        );
        assert_eq!(
            Backend::from_dsn("postgresql://localhost/db").unwrap().0,
            Backend::Postgres
        );
        assert!(matches!(
            Backend::from_dsn("mysql://localhost/db"),
            Err(StoreError::UnsupportedDsn(ref s)) if s == "mysql"
        ));
    }

    #[tokio::test]
    async fn test_thread_crud() {
        let db = test_db().await;

        let thread = db.create_thread(0).await.unwrap();
        assert_eq!(thread.name, None);

        let named = db
            .name_thread(thread.id, Some("research".to_string()))
            .await
            .unwrap();
        assert_eq!(named.name.as_deref(), Some("research"));

        let threads = db.list_threads().await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(db.get_thread(thread.id).await.unwrap().name, named.name);

        assert!(db.get_thread(999).await.unwrap_err().is_not_found());
        assert!(db.name_thread(999, None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_run_inherits_previous_thread() {
        let db = test_db().await;
        let thread = db.create_thread(0).await.unwrap();

        let first = create_run(&db, thread.id, 0).await.unwrap();
        assert_eq!(first.thread_id, thread.id);
        assert_eq!(first.run.id, first.id);
        assert_eq!(first.run.input, "hello");

        let second = create_run(&db, 0, first.id).await.unwrap();
        assert_eq!(second.thread_id, thread.id);
        assert_eq!(second.previous_run_id, first.id);

        let anonymous = create_run(&db, 0, 0).await.unwrap();
        assert_eq!(anonymous.thread_id, 0);
    }

    #[tokio::test]
    async fn test_create_run_not_found() {
        let db = test_db().await;

        assert!(create_run(&db, 0, 42).await.unwrap_err().is_not_found());
        assert!(create_run(&db, 42, 0).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_finish_run_without_thread_discards() {
        let db = test_db().await;
        let run = create_run(&db, 0, 0).await.unwrap();
        db.create_event(run.id, &progress(run.id, "a")).await.unwrap();
        db.create_event(run.id, &progress(run.id, "b")).await.unwrap();

        let disposition = db.finish_run(0, run.id, &finished(&run)).await.unwrap();

        assert_eq!(disposition, RunDisposition::Discarded);
        assert!(db.list_events(run.id).await.unwrap().is_empty());
        let (runs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runs")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(runs, 0);
    }

    #[tokio::test]
    async fn test_finish_run_with_thread_persists() {
        let db = test_db().await;
        let run = create_run(&db, 0, 0).await.unwrap();
        db.create_event(run.id, &progress(run.id, "a")).await.unwrap();
        let thread = db.create_thread(run.id).await.unwrap();

        let disposition = db
            .finish_run(thread.id, run.id, &finished(&run))
            .await
            .unwrap();
        assert_eq!(
            disposition,
            RunDisposition::Persisted {
                thread_id: thread.id
            }
        );

        let stored = db.get_run(thread.id, run.id).await.unwrap();
        assert_eq!(stored.output, "world");
        assert_eq!(stored.chat_state_after, Some(json!({"turn": 1})));
        assert_eq!(stored.run.thread_id, thread.id);
        assert_eq!(stored.run.state, RunState::Continue);
        assert!(stored.calls.contains_key("c1"));
        assert!(stored.finished_at.is_some());
        assert_eq!(db.list_events(run.id).await.unwrap().len(), 1);
        assert_eq!(db.get_thread(thread.id).await.unwrap().first_run_id, run.id);
    }

    #[tokio::test]
    async fn test_finish_run_keeps_stored_thread() {
        let db = test_db().await;
        let thread = db.create_thread(0).await.unwrap();
        let run = create_run(&db, thread.id, 0).await.unwrap();

        let disposition = db.finish_run(0, run.id, &finished(&run)).await.unwrap();

        assert_eq!(
            disposition,
            RunDisposition::Persisted {
                thread_id: thread.id
            }
        );
        assert_eq!(db.list_runs(thread.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finish_run_only_records_first_run_on_thread() {
        let db = test_db().await;
        let thread = db.create_thread(0).await.unwrap();
        let first = create_run(&db, thread.id, 0).await.unwrap();
        let second = create_run(&db, thread.id, first.id).await.unwrap();

        db.finish_run(0, first.id, &finished(&first)).await.unwrap();
        db.finish_run(0, second.id, &finished(&second)).await.unwrap();

        let stored = db.get_thread(thread.id).await.unwrap();
        assert_eq!(stored.first_run_id, first.id);
        assert_eq!(stored.updated_at, thread.updated_at);
        assert_eq!(stored.name, thread.name);
    }

    #[tokio::test]
    async fn test_delete_thread_cascades() {
        let db = test_db().await;
        let thread = db.create_thread(0).await.unwrap();
        let first = create_run(&db, thread.id, 0).await.unwrap();
        let second = create_run(&db, 0, first.id).await.unwrap();
        db.create_event(first.id, &progress(first.id, "a")).await.unwrap();
        db.create_event(second.id, &progress(second.id, "b")).await.unwrap();

        let other = db.create_thread(0).await.unwrap();
        let kept = create_run(&db, other.id, 0).await.unwrap();
        db.create_event(kept.id, &progress(kept.id, "c")).await.unwrap();

        db.delete_thread(thread.id).await.unwrap();

        assert!(db.get_thread(thread.id).await.unwrap_err().is_not_found());
        assert!(db.list_runs(thread.id).await.unwrap().is_empty());
        assert!(db.list_events(first.id).await.unwrap().is_empty());
        assert!(db.list_events(second.id).await.unwrap().is_empty());
        assert_eq!(db.list_events(kept.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_missing_thread_changes_nothing() {
        let db = test_db().await;
        let orphan = create_run(&db, 0, 0).await.unwrap();
        db.create_event(orphan.id, &progress(orphan.id, "a")).await.unwrap();

        // Runs with thread id 0 must survive a delete of a thread that does not exist
        assert!(db.delete_thread(0).await.unwrap_err().is_not_found());
        assert_eq!(db.list_runs(0).await.unwrap().len(), 1);
        assert_eq!(db.list_events(orphan.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_events_round_trip() {
        let db = test_db().await;
        let run = create_run(&db, 0, 0).await.unwrap();

        let event = progress(run.id, "x");
        let created = db.create_event(run.id, &event).await.unwrap();
        let fetched = db.get_event(run.id, created.id).await.unwrap();

        assert_eq!(fetched.event, event);
        assert_eq!(fetched.run_id, run.id);
        assert!(db.get_event(run.id, created.id + 1).await.unwrap_err().is_not_found());
    }
}
