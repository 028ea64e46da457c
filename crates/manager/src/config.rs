use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ManagerError, Result};

/// Host paths and defaults. Every field can be set in the JSON config file;
/// anything left out keeps its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub install_root: PathBuf,
    pub templates_dir: Option<PathBuf>,
    pub systemd_dir: PathBuf,
    pub nginx_available_dir: PathBuf,
    pub nginx_enabled_dir: PathBuf,
    pub postgres_config_dir: PathBuf,
    pub sshd_config: PathBuf,
    pub unzip_bin: PathBuf,
    pub wkhtmltopdf_bin: PathBuf,
    pub supported_versions: Vec<String>,
    pub nightly_base_url: String,
    pub probe_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("/opt/odoo"),
            templates_dir: None,
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            nginx_available_dir: PathBuf::from("/etc/nginx/sites-available"),
            nginx_enabled_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            postgres_config_dir: PathBuf::from("/etc/postgresql"),
            sshd_config: PathBuf::from("/etc/ssh/sshd_config"),
            unzip_bin: PathBuf::from("/usr/bin/unzip"),
            wkhtmltopdf_bin: PathBuf::from("/usr/local/bin/wkhtmltopdf"),
            supported_versions: vec!["16.0".to_string(), "17.0".to_string()],
            nightly_base_url: "https://nightly.odoo.com".to_string(),
            probe_timeout_ms: 500,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `path`
    /// is `None`. A missing default file is not an error; a missing explicit
    /// one is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "reading settings");
        let content = fs::read_to_string(path).map_err(|source| ManagerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content)
            .map_err(|e| ManagerError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.install_root.join(id)
    }
}

/// Get the default config path (~/.config/odoo-manager/config.json)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("odoo-manager").join("config.json"))
}
