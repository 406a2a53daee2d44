//! gridd.toml configuration.
//!
//! The file is optional. Every key mirrors a `gridd manager` flag; a flag
//! given on the command line wins over the file, and a key missing from
//! both falls back to the built-in default.
//!
//! ```toml
//! [manager]
//! host = "0.0.0.0"
//! port = 8080
//! data_dir = "/var/lib/swarmgrid"
//! docker_socket = "/var/run/docker.sock"
//! reconcile = true
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DATA_DIR: &str = "/var/lib/swarmgrid";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GriddConfig {
    #[serde(default)]
    pub manager: ManagerSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub docker_socket: Option<PathBuf>,
    pub reconcile: Option<bool>,
}

impl GriddConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GriddConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Manager flags as given on the command line; `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct ManagerOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
    pub docker_socket: Option<PathBuf>,
    pub no_reconcile: bool,
}

/// Fully resolved manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub docker_socket: PathBuf,
    pub reconcile: bool,
}

impl ManagerConfig {
    pub fn resolve(cli: ManagerOverrides, file: ManagerSection) -> Self {
        Self {
            host: cli
                .host
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            data_dir: cli
                .data_dir
                .or(file.data_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            docker_socket: cli
                .docker_socket
                .or(file.docker_socket)
                .unwrap_or_else(|| PathBuf::from(swarmgrid_cluster::docker::DEFAULT_SOCKET)),
            reconcile: !cli.no_reconcile && file.reconcile.unwrap_or(true),
        }
    }

    /// Location of the registry database.
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("registry.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file_or_flags() {
        let config = ManagerConfig::resolve(ManagerOverrides::default(), ManagerSection::default());
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/swarmgrid"));
        assert_eq!(config.docker_socket, PathBuf::from("/var/run/docker.sock"));
        assert!(config.reconcile);
        assert_eq!(
            config.registry_path(),
            PathBuf::from("/var/lib/swarmgrid/registry.redb")
        );
    }

    #[test]
    fn flags_override_file() {
        let file: GriddConfig = toml::from_str(
            r#"
[manager]
host = "10.0.0.1"
port = 9000
reconcile = true
"#,
        )
        .unwrap();
        let cli = ManagerOverrides {
            port: Some(7000),
            no_reconcile: true,
            ..Default::default()
        };
        let config = ManagerConfig::resolve(cli, file.manager);
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 7000);
        assert!(!config.reconcile);
    }

    #[test]
    fn file_can_disable_reconcile() {
        let file: GriddConfig = toml::from_str("[manager]\nreconcile = false\n").unwrap();
        let config = ManagerConfig::resolve(ManagerOverrides::default(), file.manager);
        assert!(!config.reconcile);
    }

    #[test]
    fn empty_file_is_valid() {
        let file: GriddConfig = toml::from_str("").unwrap();
        assert!(file.manager.port.is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<GriddConfig>("[manager]\nprot = 1\n").is_err());
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gridd.toml");
        std::fs::write(&path, "[manager]\ndata_dir = \"/srv/grid\"\n").unwrap();
        let file = GriddConfig::from_file(&path).unwrap();
        assert_eq!(file.manager.data_dir, Some(PathBuf::from("/srv/grid")));
    }
}
