/// Session settings that can live in a RON file next to a story.
///
/// ```ron
/// (
///     persist: true,
///     story_id: Some("cellar-door"),
///     seed: 42,
///     storage_file: Some("saves/cellar-door.json"),
/// )
/// ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub persist: bool,
    /// Overrides the story's own id as the persistence key.
    #[serde(default)]
    pub story_id: Option<String>,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_true")]
    pub default_plugins: bool,
    /// JSON file used as the storage backend when persisting.
    #[serde(default)]
    pub storage_file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist: false,
            story_id: None,
            seed: 0,
            default_plugins: true,
            storage_file: None,
        }
    }
}

impl SessionConfig {
    pub fn load_from_ron(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    pub fn parse_ron(input: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(input)?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}
