// Database models (internal, converted to the core history types on read)

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::FromRow;
use threadline_core::{Call, Event, Run, RunEvent, RunInfo, Thread};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, FromRow)]
pub struct ThreadRow {
    pub id: i64,
    pub name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub first_run_id: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub id: i64,
    pub previous_run_id: i64,
    pub thread_id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub input: String,
    pub output: String,
    pub chat_state_after: Option<String>,
    pub run: String,
    pub calls: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub id: i64,
    pub run_id: i64,
    pub created_at: String,
    pub event: String,
}

/// Outcome of finalizing a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDisposition {
    /// Run row was updated under a thread
    Persisted { thread_id: u64 },
    /// Run had no thread; the row and its events were deleted
    Discarded,
}

pub(crate) fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("invalid timestamp {:?}: {}", value, e)))
}

/// Ids are BIGINT columns; values outside u64 never come from this store
pub(crate) fn to_id(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

pub(crate) fn to_db_id(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::Decode(format!("id {} out of range", value)))
}

impl TryFrom<ThreadRow> for Thread {
    type Error = StoreError;

    fn try_from(row: ThreadRow) -> Result<Self> {
        Ok(Thread {
            id: to_id(row.id),
            name: row.name,
            created_at: decode_time(&row.created_at)?,
            updated_at: decode_time(&row.updated_at)?,
            first_run_id: to_id(row.first_run_id),
        })
    }
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self> {
        let run: RunInfo = serde_json::from_str(&row.run)?;
        let calls: BTreeMap<String, Call> = serde_json::from_str(&row.calls)?;
        let chat_state_after = row
            .chat_state_after
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Run {
            id: to_id(row.id),
            previous_run_id: to_id(row.previous_run_id),
            thread_id: to_id(row.thread_id),
            started_at: decode_time(&row.started_at)?,
            finished_at: row.finished_at.as_deref().map(decode_time).transpose()?,
            input: row.input,
            output: row.output,
            chat_state_after,
            run,
            calls,
        })
    }
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self> {
        let event: RunEvent = serde_json::from_str(&row.event)?;
        Ok(Event {
            id: to_id(row.id),
            run_id: to_id(row.run_id),
            created_at: decode_time(&row.created_at)?,
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_encoding_sorts_lexically() {
        let earlier = DateTime::from_timestamp(1_700_000_000, 5_000).unwrap();
        let later = DateTime::from_timestamp(1_700_000_001, 0).unwrap();

        let (a, b) = (encode_time(earlier), encode_time(later));

        assert!(a < b);
        assert_eq!(decode_time(&a).unwrap(), earlier);
    }

    #[test]
    fn test_decode_time_rejects_garbage() {
        assert!(matches!(decode_time("yesterday"), Err(StoreError::Decode(_))));
    }
}
