// Persisted history types
//
// Threads, runs and events as stored and returned by the API.
// Used by both storage and API crates.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::event::{RunEvent, RunId};
use crate::run::{Call, RunInfo};

/// Conversation grouping a chain of runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "firstRunID")]
    pub first_run_id: RunId,
}

/// Stored run with its snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: RunId,
    #[serde(rename = "previousRunID")]
    pub previous_run_id: RunId,
    #[serde(rename = "threadID")]
    pub thread_id: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub input: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub chat_state_after: Option<Value>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub run: RunInfo,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub calls: BTreeMap<String, Call>,
}

impl Run {
    /// RunInfo with its call tree attached
    pub fn run_info(&self) -> RunInfo {
        let mut info = self.run.clone();
        info.calls = self.calls.clone();
        info
    }
}

/// Stored event of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: u64,
    #[serde(rename = "runID")]
    pub run_id: RunId,
    pub created_at: DateTime<Utc>,
    #[cfg_attr(feature = "openapi", schema(value_type = Object))]
    pub event: RunEvent,
}

/// Parameters for creating a run row
#[derive(Debug, Clone)]
pub struct CreateRun {
    /// Thread to attach to, 0 for none
    pub thread_id: u64,
    /// Run this one continues, 0 for none; its thread wins over `thread_id`
    pub previous_run_id: RunId,
    pub input: String,
    pub run: RunInfo,
}
