use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::watch;

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 100.0;

/// The four live metrics published by the scoring service, each in [0, 100].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    #[serde(default, deserialize_with = "lenient_score")]
    pub attention: f64,
    #[serde(default, deserialize_with = "lenient_score")]
    pub stability: f64,
    #[serde(default, deserialize_with = "lenient_score")]
    pub smoothness: f64,
    #[serde(default, deserialize_with = "lenient_score")]
    pub confidence: f64,
}

impl Scores {
    pub fn new(attention: f64, stability: f64, smoothness: f64, confidence: f64) -> Self {
        Self {
            attention,
            stability,
            smoothness,
            confidence,
        }
    }

    /// Clamp every metric into the published range; non-finite values become 0.
    pub fn sanitized(self) -> Self {
        Self {
            attention: clamp_score(self.attention),
            stability: clamp_score(self.stability),
            smoothness: clamp_score(self.smoothness),
            confidence: clamp_score(self.confidence),
        }
    }
}

fn clamp_score(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(SCORE_MIN, SCORE_MAX)
    } else {
        SCORE_MIN
    }
}

// The scorer is a Python service; nulls and numeric strings both show up.
fn lenient_score<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(number) => number.as_f64().unwrap_or(SCORE_MIN),
        Value::String(text) => text.trim().parse().unwrap_or(SCORE_MIN),
        _ => SCORE_MIN,
    })
}

/// Latest realtime metrics, overwritten wholesale by every update.
pub struct ScoreBoard {
    latest: watch::Sender<Scores>,
    frozen: AtomicBool,
    updates: AtomicU64,
}

impl ScoreBoard {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(Scores::default());
        Self {
            latest,
            frozen: AtomicBool::new(false),
            updates: AtomicU64::new(0),
        }
    }

    /// Replace the current metrics. Returns `false` once the board is frozen.
    pub fn apply_realtime(&self, scores: Scores) -> bool {
        if self.frozen.load(Ordering::SeqCst) {
            return false;
        }
        self.latest.send_replace(scores.sanitized());
        self.updates.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Stop accepting realtime updates; the terminal report owns the final numbers.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn latest(&self) -> Scores {
        *self.latest.borrow()
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> watch::Receiver<Scores> {
        self.latest.subscribe()
    }
}

impl Default for ScoreBoard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_update_wins_without_accumulating() {
        let board = ScoreBoard::new();
        board.apply_realtime(Scores::new(10.0, 20.0, 30.0, 40.0));
        board.apply_realtime(Scores::new(90.0, 0.0, 55.5, 1.0));
        board.apply_realtime(Scores::new(42.0, 43.0, 44.0, 45.0));

        assert_eq!(board.latest(), Scores::new(42.0, 43.0, 44.0, 45.0));
        assert_eq!(board.update_count(), 3);
    }

    #[test]
    fn frozen_board_ignores_updates() {
        let board = ScoreBoard::new();
        board.apply_realtime(Scores::new(50.0, 50.0, 50.0, 50.0));
        board.freeze();

        assert!(!board.apply_realtime(Scores::new(1.0, 1.0, 1.0, 1.0)));
        assert_eq!(board.latest(), Scores::new(50.0, 50.0, 50.0, 50.0));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let scores = Scores::new(-5.0, 140.0, f64::NAN, 99.9).sanitized();
        assert_eq!(scores, Scores::new(0.0, 100.0, 0.0, 99.9));
    }

    #[test]
    fn missing_and_odd_fields_default_to_zero() {
        let scores: Scores =
            serde_json::from_str(r#"{"attention": 71.5, "stability": null, "smoothness": "63"}"#)
                .unwrap();
        assert_eq!(scores, Scores::new(71.5, 0.0, 63.0, 0.0));
    }
}
