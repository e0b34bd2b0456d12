use std::path::Path;

use log::info;
use serde::Deserialize;

use crate::admin_cli::AdminCli;
use crate::errors::*;
use crate::placement::PlacementGenerator;

pub const ENV_CONFIG_PATH: &str = "CHAINCTL_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/chainctl/config.yaml";

/// Operator-level settings: where the admin CLI and placement tool live and
/// how to reach the management service. Everything has a default so the
/// operator starts with no config file at all.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub admin_cli_path: String,
    pub admin_cli_config_path: String,
    pub mgmtd_addresses: String,
    pub mgmtd_config_path: String,
    pub token: String,
    pub output_dir: String,
    pub placement_dir: String,
    pub python_path: String,
    pub storage_start_node_id: u32,
    pub requeue_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            admin_cli_path: "/admin_cli".to_string(),
            admin_cli_config_path: "/etc/chainctl/admin_cli.toml".to_string(),
            mgmtd_addresses: String::new(),
            mgmtd_config_path: "/etc/chainctl/mgmtd_main.toml".to_string(),
            token: String::new(),
            output_dir: "/output".to_string(),
            placement_dir: "/opt/data_placement".to_string(),
            python_path: "python3".to_string(),
            storage_start_node_id: 10_000,
            requeue_seconds: 30,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .chain_err(|| format!("can't read config {}", path.display()))?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// Reads the path from the environment; a missing file falls back to
    /// defaults so local runs need no setup.
    pub fn load() -> Result<Config> {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = Path::new(&path);
        if !path.exists() {
            info!("config {} not found, using defaults", path.display());
            return Ok(Config::default());
        }
        Config::from_file(path)
    }

    pub fn admin_cli(&self) -> AdminCli {
        AdminCli::new(
            self.admin_cli_path.clone(),
            self.admin_cli_config_path.clone(),
            self.mgmtd_addresses.clone(),
        )
    }

    pub fn placement(&self) -> PlacementGenerator {
        PlacementGenerator::new(
            self.python_path.clone(),
            self.placement_dir.clone(),
            self.output_dir.clone(),
        )
    }
}
