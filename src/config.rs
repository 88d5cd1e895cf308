use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::{warn, LevelFilter};
use serde::{Deserialize, Serialize};

pub const MESH_MEMORY_CONFIG_FILENAME: &str = "mesh_memory.ron";

/// 16 MiB, same as the renderer's vertex memory default.
pub const DEFAULT_NEW_BUFFER_SIZE: u64 = 16 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Could not read mesh memory config file, i/o error: {0:?}")]
    CouldntOpenConfig(#[from] std::io::Error),
    #[error("Could not parse mesh memory config file due to: {0}")]
    CouldntParseConfig(#[from] ron::error::SpannedError),
    #[error("Could not serialize mesh memory config: {0}")]
    CouldntWriteConfig(#[from] ron::Error),
    #[error("new_buffer_size must be greater than zero")]
    ZeroBufferSize,
    #[error("new_buffer_size ({new_buffer_size}) must be a multiple of the backing's size granularity ({granularity})")]
    UnalignedBufferSize { new_buffer_size: u64, granularity: u64 },
    #[error("max_total_allocation ({max_total_allocation}) must be a multiple of new_buffer_size ({new_buffer_size})")]
    UnevenTotalAllocation { max_total_allocation: u64, new_buffer_size: u64 },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Also write the log to this file, if set.
    pub log_file: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshMemoryConfig {
    /// Capacity in bytes of every arena the pool creates.
    pub new_buffer_size: u64,
    /// Upper bound on the summed capacity of all arenas. `None` means unbounded.
    pub max_total_allocation: Option<u64>,
    /// Give requests bigger than `new_buffer_size` an arena of their own instead of failing them.
    pub allow_oversized_arenas: bool,
    /// Queue family that draws from mesh memory.
    pub graphics_queue_family: u32,
    /// Queue family that uploads into mesh memory.
    pub copy_queue_family: u32,
    pub logging: LoggingConfig,
}

impl Default for MeshMemoryConfig {
    fn default() -> Self {
        MeshMemoryConfig {
            new_buffer_size: DEFAULT_NEW_BUFFER_SIZE,
            max_total_allocation: None,
            allow_oversized_arenas: true,
            graphics_queue_family: 0,
            copy_queue_family: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl MeshMemoryConfig {
    /// Reads a config from a RON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path.as_ref())?;
        let mut buf_reader = BufReader::new(file);
        let mut contents = String::new();
        buf_reader.read_to_string(&mut contents)?;
        let config: MeshMemoryConfig = ron::from_str(contents.as_str())?;
        config.validate(1)?;
        Ok(config)
    }

    /// Like [MeshMemoryConfig::load], but falls back to defaults (with a warning) if the file is
    /// missing or broken.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                warn!("Couldn't open mesh memory config {}, using defaults. Error was: {:?}", path.as_ref().display(), e);
                MeshMemoryConfig::default()
            }
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let cfg_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        std::fs::write(path, cfg_string)?;
        Ok(())
    }

    /// Checks the sizes against each other and against the backing's size granularity.
    pub fn validate(&self, granularity: u64) -> Result<(), ConfigError> {
        if self.new_buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if granularity > 1 && self.new_buffer_size % granularity != 0 {
            return Err(ConfigError::UnalignedBufferSize {
                new_buffer_size: self.new_buffer_size,
                granularity,
            });
        }
        if let Some(max_total_allocation) = self.max_total_allocation {
            if max_total_allocation % self.new_buffer_size != 0 {
                return Err(ConfigError::UnevenTotalAllocation {
                    max_total_allocation,
                    new_buffer_size: self.new_buffer_size,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MeshMemoryConfig::default();
        assert_eq!(config.new_buffer_size, DEFAULT_NEW_BUFFER_SIZE);
        assert!(config.allow_oversized_arenas);
        config.validate(4).unwrap();
    }

    #[test]
    fn validation_rejects_bad_sizes() {
        let config = MeshMemoryConfig { new_buffer_size: 0, ..Default::default() };
        assert!(matches!(config.validate(1), Err(ConfigError::ZeroBufferSize)));

        let config = MeshMemoryConfig { new_buffer_size: 1001, ..Default::default() };
        assert!(matches!(config.validate(4), Err(ConfigError::UnalignedBufferSize { .. })));
        config.validate(1).unwrap();

        let config = MeshMemoryConfig {
            new_buffer_size: 1000,
            max_total_allocation: Some(2500),
            ..Default::default()
        };
        assert!(matches!(config.validate(1), Err(ConfigError::UnevenTotalAllocation { .. })));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MESH_MEMORY_CONFIG_FILENAME);
        let config = MeshMemoryConfig {
            new_buffer_size: 4096,
            max_total_allocation: Some(4096 * 4),
            allow_oversized_arenas: false,
            graphics_queue_family: 1,
            copy_queue_family: 3,
            logging: LoggingConfig {
                level: LogLevel::Trace,
                log_file: Some(PathBuf::from("mesh_memory.log")),
            },
        };
        config.save(&path).unwrap();
        assert_eq!(MeshMemoryConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MESH_MEMORY_CONFIG_FILENAME);
        std::fs::write(&path, "(new_buffer_size: 2048, copy_queue_family: 2)").unwrap();
        let config = MeshMemoryConfig::load(&path).unwrap();
        assert_eq!(config.new_buffer_size, 2048);
        assert_eq!(config.copy_queue_family, 2);
        assert_eq!(config.max_total_allocation, None);
        assert!(config.allow_oversized_arenas);
    }

    #[test]
    fn missing_or_broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.ron");
        assert!(matches!(MeshMemoryConfig::load(&missing), Err(ConfigError::CouldntOpenConfig(_))));
        assert_eq!(MeshMemoryConfig::load_or_default(&missing), MeshMemoryConfig::default());

        let broken = dir.path().join("broken.ron");
        std::fs::write(&broken, "(new_buffer_size: \"lots\")").unwrap();
        assert!(matches!(MeshMemoryConfig::load(&broken), Err(ConfigError::CouldntParseConfig(_))));
        assert_eq!(MeshMemoryConfig::load_or_default(&broken), MeshMemoryConfig::default());

        let invalid = dir.path().join("invalid.ron");
        std::fs::write(&invalid, "(new_buffer_size: 0)").unwrap();
        assert!(matches!(MeshMemoryConfig::load(&invalid), Err(ConfigError::ZeroBufferSize)));
    }
}
