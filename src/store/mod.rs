pub mod favorites;
pub mod history;
pub mod settings;

pub use favorites::{Favorite, FavoritesStore};
pub use history::{HistoryRecord, HistoryStore};
pub use settings::{Settings, SettingsStore};

use std::path::PathBuf;

/// Default per-user config directory for the engine's stores
pub fn default_config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("io", "beamdrop", "beamdrop")
        .map(|dirs| dirs.config_dir().to_path_buf())
}
