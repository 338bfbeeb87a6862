/// Layered client settings and their persistence.
pub mod state;

pub use state::{ClientSettings, SettingsError, SettingsStore};
