use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::DeviceCommands;
use crate::model::{CompressionKind, DataType};
use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

/// Per-data-type source directory roots on the device. A package's slot source
/// is `<dir>/<package_name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLayout {
    pub apk_dir: PathBuf,
    pub user_dir: PathBuf,
    pub user_de_dir: PathBuf,
    pub data_dir: PathBuf,
    pub obb_dir: PathBuf,
    pub media_dir: PathBuf,
}

impl Default for DeviceLayout {
    fn default() -> Self {
        Self {
            apk_dir: PathBuf::from("/data/app"),
            user_dir: PathBuf::from("/data/user/0"),
            user_de_dir: PathBuf::from("/data/user_de/0"),
            data_dir: PathBuf::from("/storage/emulated/0/Android/data"),
            obb_dir: PathBuf::from("/storage/emulated/0/Android/obb"),
            media_dir: PathBuf::from("/storage/emulated/0/Android/media"),
        }
    }
}

impl DeviceLayout {
    pub fn source_dir(&self, data_type: DataType) -> &Path {
        match data_type {
            DataType::Apk => &self.apk_dir,
            DataType::User => &self.user_dir,
            DataType::UserDe => &self.user_de_dir,
            DataType::Data => &self.data_dir,
            DataType::Obb => &self.obb_dir,
            DataType::Media => &self.media_dir,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    pub endpoint: String,
    #[serde(default)]
    pub remote_dir: String,
    pub staging_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub version: u32,
    pub compression: CompressionKind,
    pub backup_root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudSettings>,
    pub layout: DeviceLayout,
    /// Argv prefix for privileged helper invocations, e.g. `["sudo", "-n"]`.
    pub runner_prefix: Vec<String>,
    pub reset_selection_on_finish: bool,
    pub device_commands: DeviceCommands,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            compression: CompressionKind::Zstd,
            backup_root: PathBuf::from("backups"),
            cloud: None,
            layout: DeviceLayout::default(),
            runner_prefix: Vec::new(),
            reset_selection_on_finish: false,
            device_commands: DeviceCommands::default(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(text).map_err(|e| Error::InvalidConfig {
            message: format!("invalid settings toml: {e}"),
        })?;
        if settings.version != SETTINGS_SCHEMA_VERSION {
            return Err(Error::InvalidConfig {
                message: format!("unsupported settings version: {}", settings.version),
            });
        }
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig {
            message: format!("serialize settings failed: {e}"),
        })
    }
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let text = std::fs::read_to_string(path)?;
    Settings::from_toml_str(&text)
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, settings.to_toml_string()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_toml() {
        let settings = Settings::default();
        let text = settings.to_toml_string().unwrap();
        let back = Settings::from_toml_str(&text).unwrap();
        assert_eq!(back.version, SETTINGS_SCHEMA_VERSION);
        assert_eq!(back.compression, CompressionKind::Zstd);
        assert!(back.cloud.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            compression = "tar"
            backup_root = "/mnt/vault"
            runner_prefix = ["sudo", "-n"]
            "#,
        )
        .unwrap();
        assert_eq!(settings.compression, CompressionKind::Tar);
        assert_eq!(settings.backup_root, PathBuf::from("/mnt/vault"));
        assert_eq!(settings.runner_prefix, vec!["sudo", "-n"]);
        assert_eq!(settings.layout.user_dir, PathBuf::from("/data/user/0"));
    }
}
