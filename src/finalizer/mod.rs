pub mod controller;
pub mod payload;
pub mod store;

pub use controller::{FinalizeOutcome, PendingSubmission, SessionFinalizer};
pub use payload::PersistencePayload;
pub use store::{HttpScoreStore, ScoreStore};
