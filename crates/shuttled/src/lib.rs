//! Mission control and process wiring for the Shuttle gateway daemon.

pub mod mission;

pub use mission::{MissionControl, MissionOptions};
