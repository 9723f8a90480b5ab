//! Journal entry for one practice session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{scores::Scores, session::SessionMode};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Running,
    /// Final report received.
    Completed,
    /// User ended the session before any final report.
    Ended,
    /// Left running by a previous process.
    Interrupted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "Running",
            SessionStatus::Completed => "Completed",
            SessionStatus::Ended => "Ended",
            SessionStatus::Interrupted => "Interrupted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub mode: SessionMode,
    pub user_id: Option<String>,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub duration_secs: u64,
    pub scores: Option<Scores>,
    /// Whether the remote score store accepted the payload.
    pub submitted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn running(id: String, mode: SessionMode, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            mode,
            user_id: None,
            status: SessionStatus::Running,
            started_at,
            stopped_at: None,
            duration_secs: 0,
            scores: None,
            submitted: false,
            created_at: started_at,
            updated_at: started_at,
        }
    }
}
