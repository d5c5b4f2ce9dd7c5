use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// On-disk layout under one state directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatePaths {
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub logs_dir: PathBuf,
    pub subagents_dir: PathBuf,
    pub transcripts_dir: PathBuf,
}

impl StatePaths {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let state_dir = state_dir.as_ref().to_path_buf();
        Self {
            config_path: state_dir.join("config.json"),
            logs_dir: state_dir.join("logs"),
            subagents_dir: state_dir.join("subagents"),
            transcripts_dir: state_dir.join("transcripts"),
            state_dir,
        }
    }
}

/// Picks the state directory: explicit flag, then `TETHER_STATE_DIR`, then the
/// platform data dir, then `.tether` in the working directory.
pub fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    resolve_state_dir_from(flag, std::env::var("TETHER_STATE_DIR").ok())
}

fn resolve_state_dir_from(flag: Option<String>, env: Option<String>) -> PathBuf {
    if let Some(dir) = flag.or(env).filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir.trim());
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("tether");
    }
    PathBuf::from(".tether")
}
