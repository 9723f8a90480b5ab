use serde::Serialize;

use crate::{finalizer::FinalizeOutcome, scores::Scores, telemetry::ChannelState};

use super::SessionSnapshot;

/// Notifications published to the display layer while a session runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// Display projection of the clock advanced.
    ClockTick { elapsed_secs: u64 },
    ScoresUpdated { scores: Scores },
    ChannelStateChanged { state: ChannelState },
    CameraChanged { enabled: bool },
    Finalized { outcome: FinalizeOutcome },
    Ended { snapshot: SessionSnapshot },
}
