//! Instance configuration for hookvfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum length in bytes of the instance and segment names.
/// Over-long names are truncated, never rejected.
pub const NAME_LIMIT: usize = 64;

/// Size of the configuration segment
pub const CONFIG_SEGMENT_SIZE: usize = 8192;

/// Initial size of the virtual and inverse tree segments
pub const TREE_SEGMENT_SIZE: usize = 65536;

/// Environment variable carrying the serialized instance configuration
/// into a child process
pub const PARAMS_ENV: &str = "HOOKVFS_PARAMS";

/// Extra bytes a rebuilt tree segment name may carry beyond the name
/// limit (an underscore and a generation counter)
pub(crate) const GENERATION_HEADROOM: usize = 12;

/// Log level shared across all attached processes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn to_tracing(self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warning,
            _ => LogLevel::Error,
        }
    }

    pub(crate) fn to_raw(self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warning => 2,
            LogLevel::Error => 3,
        }
    }
}

/// Crash dump policy for attached processes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CrashDumpsType {
    None,
    Mini,
    Full,
}

impl CrashDumpsType {
    pub(crate) fn from_raw(raw: u8) -> Self {
        match raw {
            1 => CrashDumpsType::Mini,
            2 => CrashDumpsType::Full,
            _ => CrashDumpsType::None,
        }
    }

    pub(crate) fn to_raw(self) -> u8 {
        match self {
            CrashDumpsType::None => 0,
            CrashDumpsType::Mini => 1,
            CrashDumpsType::Full => 2,
        }
    }
}

/// Seed configuration passed across the library boundary at attach.
///
/// The first process to attach an instance seeds the shared parameters
/// from this record; later processes adopt whatever is already published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Globally unique instance name; names the configuration segment
    pub instance_name: String,

    /// Name of the virtual tree segment
    pub current_shm_name: String,

    /// Name of the inverse tree segment
    pub current_inverse_shm_name: String,

    /// Extra diagnostics in every attached process
    pub debug_mode: bool,

    /// Shared log level
    pub log_level: LogLevel,

    /// Crash dump policy
    pub crash_dumps_type: CrashDumpsType,

    /// Directory crash dumps are written to
    pub crash_dumps_path: String,

    /// Writable root for copy-on-write materialization. Write-class
    /// redirections fail until one is configured.
    pub overlay_root: Option<PathBuf>,

    /// Path of the hook library preloaded into child processes
    pub hook_library: Option<PathBuf>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        InstanceConfig::new("hookvfs")
    }
}

impl InstanceConfig {
    /// Create a configuration for a named instance, deriving the tree
    /// segment names from the instance name
    pub fn new(instance_name: &str) -> Self {
        let instance_name = truncate_name(instance_name);
        // Leave room for the longest derived suffix so the two tree
        // names stay distinct after clamping.
        let base = truncate_to(&instance_name, NAME_LIMIT - 8);
        let current_shm_name = format!("{}_tree", base);
        let current_inverse_shm_name = format!("{}_inverse", base);

        InstanceConfig {
            instance_name,
            current_shm_name,
            current_inverse_shm_name,
            debug_mode: false,
            log_level: LogLevel::Info,
            crash_dumps_type: CrashDumpsType::None,
            crash_dumps_path: String::new(),
            overlay_root: None,
            hook_library: None,
        }
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let mut config: InstanceConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config file: {}", e)))?;

        config.apply_env_overrides();
        config.truncate_names();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("HOOKVFS_INSTANCE") {
            let name = name.trim().to_string();
            if !name.is_empty() {
                self.instance_name = name;
            }
        }

        if let Ok(root) = std::env::var("HOOKVFS_OVERLAY_ROOT") {
            let root = root.trim().to_string();
            if !root.is_empty() {
                self.overlay_root = Some(PathBuf::from(root));
            }
        }

        if let Ok(library) = std::env::var("HOOKVFS_LIBRARY") {
            let library = library.trim().to_string();
            if !library.is_empty() {
                self.hook_library = Some(PathBuf::from(library));
            }
        }

        if let Ok(debug) = std::env::var("HOOKVFS_DEBUG") {
            self.debug_mode = matches!(debug.trim(), "1" | "true" | "yes");
        }
    }

    /// Recover the configuration a parent process serialized into the
    /// child's environment, if any
    pub fn from_env() -> Result<Option<Self>> {
        let raw = match std::env::var(PARAMS_ENV) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };

        let mut config: InstanceConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("bad {} payload: {}", PARAMS_ENV, e)))?;
        config.truncate_names();
        config.validate()?;
        Ok(Some(config))
    }

    /// Serialize for handing to a child process environment
    pub fn to_env_payload(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Clamp all instance strings to the name limit. Segment names get
    /// headroom for the generation suffix a tree rebuild appends.
    pub fn truncate_names(&mut self) {
        self.instance_name = truncate_name(&self.instance_name);
        self.current_shm_name = truncate_to(&self.current_shm_name, NAME_LIMIT + GENERATION_HEADROOM);
        self.current_inverse_shm_name =
            truncate_to(&self.current_inverse_shm_name, NAME_LIMIT + GENERATION_HEADROOM);
        self.crash_dumps_path = truncate_to(&self.crash_dumps_path, 4 * NAME_LIMIT);
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.instance_name.is_empty() {
            return Err(Error::Config("instance name must not be empty".to_string()));
        }

        if self.current_shm_name.is_empty() || self.current_inverse_shm_name.is_empty() {
            return Err(Error::Config(
                "tree segment names must not be empty".to_string(),
            ));
        }

        if self.current_shm_name == self.current_inverse_shm_name {
            return Err(Error::Config(
                "virtual and inverse tree segments must be distinct".to_string(),
            ));
        }

        Ok(())
    }

    /// Default location for the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hookvfs")
            .join("config.json")
    }
}

/// Truncate a name to the shared name limit, never splitting a character
pub fn truncate_name(name: &str) -> String {
    truncate_to(name, NAME_LIMIT)
}

pub(crate) fn truncate_to(value: &str, limit: usize) -> String {
    if value.len() <= limit {
        return value.to_string();
    }

    let mut end = limit;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_names() {
        let config = InstanceConfig::new("uvfs-x");
        assert_eq!(config.instance_name, "uvfs-x");
        assert_eq!(config.current_shm_name, "uvfs-x_tree");
        assert_eq!(config.current_inverse_shm_name, "uvfs-x_inverse");
        config.validate().unwrap();
    }

    #[test]
    fn test_overlong_names_truncated() {
        let long = "x".repeat(NAME_LIMIT + 30);
        let config = InstanceConfig::new(&long);
        assert_eq!(config.instance_name.len(), NAME_LIMIT);
        assert!(config.current_shm_name.len() <= NAME_LIMIT);
        assert_ne!(config.current_shm_name, config.current_inverse_shm_name);
        config.validate().unwrap();
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let name = format!("{}é", "x".repeat(NAME_LIMIT - 1));
        let truncated = truncate_name(&name);
        assert!(truncated.len() <= NAME_LIMIT);
        assert!(truncated.is_char_boundary(truncated.len()));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = InstanceConfig::new("roundtrip");
        config.overlay_root = Some(PathBuf::from("/tmp/overlay"));
        config.log_level = LogLevel::Warning;
        config.save(&path).unwrap();

        let loaded = InstanceConfig::load(&path).unwrap();
        assert_eq!(loaded.instance_name, "roundtrip");
        assert_eq!(loaded.log_level, LogLevel::Warning);
        assert_eq!(loaded.overlay_root, Some(PathBuf::from("/tmp/overlay")));
    }

    #[test]
    fn test_env_payload_roundtrip() {
        let config = InstanceConfig::new("payload");
        let payload = config.to_env_payload().unwrap();
        let parsed: InstanceConfig = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.instance_name, "payload");
    }
}
