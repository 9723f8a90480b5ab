use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{scores::Scores, telemetry::ChannelState};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Structured mock interview.
    #[default]
    Interview,
    /// Free-form practice conversation.
    Informal,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Interview => "interview",
            SessionMode::Informal => "informal",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a live session for display and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub mode: SessionMode,
    /// Authoritative elapsed seconds.
    pub elapsed_secs: u64,
    /// `MM:SS` rendering of `elapsed_secs`.
    pub duration_label: String,
    pub camera_enabled: bool,
    pub mic_enabled: bool,
    pub channel_state: ChannelState,
    pub scores: Scores,
    pub finalized: bool,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub protocol_errors: u64,
    pub score_updates: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_values_match_wire_names() {
        for mode in SessionMode::value_variants() {
            let value = mode.to_possible_value().unwrap();
            assert_eq!(value.get_name(), mode.as_str());
        }
        assert_eq!(
            SessionMode::from_str("Interview", true),
            Ok(SessionMode::Interview)
        );
        assert!(SessionMode::from_str("panel", true).is_err());
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SessionMode::Informal).unwrap(),
            "\"informal\""
        );
        assert_eq!(SessionMode::default().to_string(), "interview");
    }
}
