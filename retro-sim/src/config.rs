/// Configuration for the simulator.
/// Reads sim.json from ~/.config/retro/sim.json (or platform equivalent).
use std::fs;
use std::path::{Path, PathBuf};

use retro_core::{BoardTemplate, EngineConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimConfig {
    pub engine: EngineConfig,
    pub board_title: String,
    pub template: BoardTemplate,
    /// Display names, one client each. The first one hosts.
    pub participants: Vec<String>,
    pub timer_seconds: u32,
    /// Pause between steps so background tasks can catch up.
    pub settle_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            board_title: "Sprint Retro".to_string(),
            template: BoardTemplate::WentWellDidntAction,
            participants: vec!["Ada".to_string(), "Grace".to_string(), "Linus".to_string()],
            timer_seconds: 300,
            settle_ms: 50,
        }
    }
}

/// Default config path: ~/.config/retro/sim.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("retro")
        .join("sim.json")
}

/// Load config from path. Returns default if the file doesn't exist or is invalid.
pub fn load_config(path: &Path) -> SimConfig {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("Failed to parse config {}: {}", path.display(), e);
            SimConfig::default()
        }),
        Err(_) => {
            log::info!("No config at {}, using defaults", path.display());
            SimConfig::default()
        }
    }
}
