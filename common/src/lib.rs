//! Records shared between `detect_server` and its HTTP clients.
pub mod records;

pub use records::{Detection, Settings, SettingsPatch};
