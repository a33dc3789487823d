//! Turn orchestration: the per-session controller and its events.

mod controller;
mod events;

pub use controller::{SettingsUpdate, TurnController, TurnHandle};
pub use events::{ErrorCode, Telemetry, TurnEvent, TurnRecord};
