pub mod controller;
pub mod state;

pub use controller::SessionClock;
pub use state::{format_elapsed, ClockState, ClockStatus};
