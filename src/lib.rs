#[macro_use]
pub mod utils;

pub mod clock;
pub mod db;
pub mod finalizer;
pub mod identity;
pub mod sampler;
pub mod scores;
pub mod session;
pub mod settings;
pub mod telemetry;

mod cli;

pub use cli::{run, Args};
pub use db::Database;
pub use finalizer::{FinalizeOutcome, HttpScoreStore, PersistencePayload, ScoreStore};
pub use identity::{CredentialProvider, Identity, IdentityResolver};
pub use sampler::{CaptureDevice, CaptureStream, DirectoryDevice, SamplerConfig};
pub use scores::Scores;
pub use session::{LiveSession, SessionDeps, SessionEvent, SessionMode, SessionOptions, SessionSnapshot};
pub use settings::{SessionSettings, SettingsStore};
pub use telemetry::{ChannelState, TelemetryConnector, TelemetryLink, WebSocketConnector};
