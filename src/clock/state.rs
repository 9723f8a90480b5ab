use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum ClockStatus {
    #[default]
    Idle,
    Running,
    Stopped,
}

/// Authoritative clock state. Every mutation happens under the controller's
/// lock, so a tick and a stop can never interleave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockState {
    pub status: ClockStatus,
    pub elapsed_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl ClockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.status == ClockStatus::Running
    }

    pub fn begin(&mut self, start_at: DateTime<Utc>) {
        *self = Self {
            status: ClockStatus::Running,
            elapsed_secs: 0,
            started_at: Some(start_at),
            stopped_at: None,
        };
    }

    /// Advance by one second. Returns the new value, or `None` once stopped.
    pub fn tick(&mut self) -> Option<u64> {
        if !self.is_running() {
            return None;
        }
        self.elapsed_secs = self.elapsed_secs.saturating_add(1);
        Some(self.elapsed_secs)
    }

    /// Freeze the counter. Idempotent; the elapsed value is kept, not reset.
    pub fn stop(&mut self, stopped_at: DateTime<Utc>) -> u64 {
        if self.is_running() {
            self.status = ClockStatus::Stopped;
            self.stopped_at = Some(stopped_at);
        }
        self.elapsed_secs
    }
}

/// Render seconds as `MM:SS`; minutes keep growing past 99.
pub fn format_elapsed(seconds: u64) -> String {
    let mins = seconds / 60;
    let secs = seconds % 60;
    format!("{mins:02}:{secs:02}")
}
