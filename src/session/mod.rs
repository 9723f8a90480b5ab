pub mod controller;
pub mod events;
pub mod state;

pub use controller::{LiveSession, SessionDeps, SessionOptions};
pub use events::SessionEvent;
pub use state::{SessionMode, SessionSnapshot};
