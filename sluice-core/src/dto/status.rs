//! Pipeline status DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::state::RunningState;

/// Point-in-time view of one pipeline's context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub id: Uuid,
    pub name: String,
    pub state: RunningState,
    pub steps: u64,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_error: Option<String>,
    pub process_errors: Vec<String>,
    pub process_history: Vec<String>,
    pub paused: bool,
    pub labels: HashMap<String, JsonValue>,
}

impl PipelineStatus {
    /// Last error recorded for the run, if any
    pub fn last_error(&self) -> Option<&str> {
        self.exit_error
            .as_deref()
            .or_else(|| self.process_errors.last().map(String::as_str))
    }
}
