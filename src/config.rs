//! Configuration management for unionfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of unmount attempts before giving up on a busy target
pub const DEFAULT_UNMOUNT_RETRIES: u32 = 50;

/// Default pause between unmount attempts
pub const DEFAULT_UNMOUNT_INTERVAL_MS: u64 = 100;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Layer stack and mount point
    pub overlay: OverlayConfig,

    /// Native mount configuration
    #[serde(default)]
    pub mount: MountConfig,
}

/// Union (overlay) configuration
///
/// `lower` is ordered from lowest to highest priority. An absent or empty
/// `upper` makes the union read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverlayConfig {
    /// Mount point, only used by the native backends
    #[serde(default)]
    pub target: Option<PathBuf>,

    /// Writable layer
    #[serde(default)]
    pub upper: Option<PathBuf>,

    /// Read-only layers, lowest priority first
    #[serde(default)]
    pub lower: Vec<PathBuf>,

    /// Kernel scratch directory, required by the kernel backend when `upper` is set
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

/// Which native backend binds the union to `target`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Kernel overlay on Linux, FUSE on other unix systems
    #[default]
    Auto,
    /// Kernel overlay mount (Linux only)
    Kernel,
    /// User-space FUSE driver
    Fuse,
    /// No native backend
    None,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Backend selection
    pub backend: BackendKind,

    /// Filesystem name reported to the OS by the FUSE backend
    pub fs_name: String,

    /// Allow other users to access a FUSE mount
    pub allow_other: bool,

    /// Unmount attempts while the target reports busy
    pub unmount_retries: u32,

    /// Pause between unmount attempts (ms)
    pub unmount_interval_ms: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            backend: BackendKind::Auto,
            fs_name: "unionfs".to_string(),
            allow_other: false,
            unmount_retries: DEFAULT_UNMOUNT_RETRIES,
            unmount_interval_ms: DEFAULT_UNMOUNT_INTERVAL_MS,
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "kernel" | "overlay" => Ok(BackendKind::Kernel),
            "fuse" => Ok(BackendKind::Fuse),
            "none" => Ok(BackendKind::None),
            other => Err(Error::InvalidConfig(format!("unknown backend '{}'", other))),
        }
    }
}

impl OverlayConfig {
    /// Build a configuration from layer paths
    pub fn new(upper: Option<PathBuf>, lower: Vec<PathBuf>) -> Self {
        OverlayConfig {
            target: None,
            upper,
            lower,
            workdir: None,
        }
    }

    /// The writable layer, treating an empty path as absent
    pub fn upper_dir(&self) -> Option<&Path> {
        self.upper
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Whether the union rejects all mutations
    pub fn is_read_only(&self) -> bool {
        self.upper_dir().is_none()
    }

    /// Builder-style mount point
    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Builder-style work directory
    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

impl Config {
    /// Load configuration from a file, with environment variable overrides
    ///
    /// `.yaml` / `.yml` files are parsed as YAML, anything else as JSON.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = if is_yaml(path) {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?
        };

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Some(upper) = std::env::var_os("UNIONFS_UPPER") {
            self.overlay.upper = Some(PathBuf::from(upper));
        }

        if let Some(lower) = std::env::var_os("UNIONFS_LOWER") {
            let layers: Vec<PathBuf> = std::env::split_paths(&lower)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !layers.is_empty() {
                self.overlay.lower = layers;
            }
        }

        if let Some(workdir) = std::env::var_os("UNIONFS_WORKDIR") {
            self.overlay.workdir = Some(PathBuf::from(workdir));
        }

        if let Some(target) = std::env::var_os("UNIONFS_TARGET") {
            self.overlay.target = Some(PathBuf::from(target));
        }

        if let Ok(backend) = std::env::var("UNIONFS_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.mount.backend = kind,
                Err(e) => tracing::warn!("Ignoring UNIONFS_BACKEND: {}", e),
            }
        }
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml(path) {
            serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let overlay = &self.overlay;

        if overlay.lower.is_empty() && overlay.upper_dir().is_none() {
            return Err(Error::InvalidConfig(
                "At least one upper or lower layer is required".to_string(),
            ));
        }

        if let Some(upper) = overlay.upper_dir() {
            if overlay.lower.iter().any(|l| l == upper) {
                return Err(Error::InvalidConfig(format!(
                    "Upper layer {:?} is also listed as a lower layer",
                    upper
                )));
            }
        }

        if self.mount.unmount_retries == 0 {
            return Err(Error::InvalidConfig(
                "unmount_retries must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("unionfs")
            .join("config.json")
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Config {
        Config {
            overlay: OverlayConfig::new(
                Some(PathBuf::from("/srv/instance-1/upper")),
                vec![PathBuf::from("/srv/base/1.20")],
            )
            .with_target("/srv/instance-1/merged")
            .with_workdir("/srv/instance-1/work"),
            mount: MountConfig::default(),
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = sample();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.overlay, config.overlay);
        assert_eq!(loaded.mount.backend, BackendKind::Auto);
    }

    #[test]
    fn test_yaml_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "overlay:\n  lower: [/srv/base]\n  upper: ''\nmount:\n  backend: fuse\n  fs_name: game\n",
        )
        .unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.overlay.is_read_only());
        assert_eq!(loaded.mount.backend, BackendKind::Fuse);
        assert_eq!(loaded.mount.fs_name, "game");
    }

    #[test]
    fn test_validate_requires_layers() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_upper_as_lower() {
        let mut config = sample();
        config.overlay.lower.push(PathBuf::from("/srv/instance-1/upper"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("Kernel".parse::<BackendKind>().unwrap(), BackendKind::Kernel);
        assert_eq!("fuse".parse::<BackendKind>().unwrap(), BackendKind::Fuse);
        assert!("winfsp".parse::<BackendKind>().is_err());
    }
}
