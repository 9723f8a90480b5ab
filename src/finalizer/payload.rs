use serde::{Deserialize, Serialize};

use crate::scores::Scores;

/// Body of the single persistence request made per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistencePayload {
    pub user_id: String,
    /// Whole seconds from the authoritative clock.
    pub duration: u64,
    pub scores: Scores,
}
