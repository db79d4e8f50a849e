//! Daemon configuration: file, environment overrides, validation.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::device::SecurityLevel;

const DEFAULT_SYSFS_BASE: &str = "/sys/bus/thunderbolt/devices";
const DEFAULT_DB_PATH: &str = "/var/lib/tbauth/devices.db";
const DEFAULT_KEY_DIR: &str = "/var/lib/tbauth/keys";
const DEFAULT_SECURITY: SecurityLevel = SecurityLevel::Secure;

#[derive(Debug, Deserialize, Default)]
struct TbauthConfigFile {
    sysfs_base: Option<PathBuf>,
    db_path: Option<PathBuf>,
    key_dir: Option<PathBuf>,
    security: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TbauthConfig {
    /// Where connected devices expose their attribute directories.
    pub sysfs_base: PathBuf,
    /// Device registry database.
    pub db_path: PathBuf,
    /// Directory holding per-device key files.
    pub key_dir: PathBuf,
    /// Daemon-wide security floor, assumed when a device directory does
    /// not report a `security` attribute.
    pub security_floor: SecurityLevel,
}

impl TbauthConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("TBAUTH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: TbauthConfigFile) -> Result<Self> {
        let security_floor = match file.security {
            Some(level) => parse_security(&level)?,
            None => DEFAULT_SECURITY,
        };
        Ok(Self {
            sysfs_base: file
                .sysfs_base
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SYSFS_BASE)),
            db_path: file.db_path.unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            key_dir: file.key_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_DIR)),
            security_floor,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(base) = std::env::var("TBAUTH_SYSFS_BASE") {
            if !base.trim().is_empty() {
                self.sysfs_base = PathBuf::from(base);
            }
        }
        if let Ok(path) = std::env::var("TBAUTH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = PathBuf::from(path);
            }
        }
        if let Ok(dir) = std::env::var("TBAUTH_KEY_DIR") {
            if !dir.trim().is_empty() {
                self.key_dir = PathBuf::from(dir);
            }
        }
        if let Ok(level) = std::env::var("TBAUTH_SECURITY") {
            if !level.trim().is_empty() {
                self.security_floor = parse_security(&level)?;
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.sysfs_base.as_os_str().is_empty() {
            return Err(anyhow!("sysfs_base must not be empty"));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if self.key_dir.as_os_str().is_empty() {
            return Err(anyhow!("key_dir must not be empty"));
        }
        Ok(())
    }
}

fn parse_security(level: &str) -> Result<SecurityLevel> {
    level
        .trim()
        .to_lowercase()
        .parse::<SecurityLevel>()
        .map_err(|e| anyhow!("invalid security level: {e}"))
}

fn read_config_file(path: &Path) -> Result<TbauthConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
