pub mod capture;
pub mod console;
pub mod display;
pub mod pipeline;
pub mod review;
pub mod session;
pub mod supervisor;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capture::backoff::BackoffConfig;
pub use capture::{Frame, SourceId};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub sources: Vec<SourceConfig>,
    pub history: HistoryConfig,
    pub display: DisplayConfig,
    pub capture: CaptureConfig,
    pub backoff: BackoffConfig,
    pub annotation: AnnotationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    /// Handed to the frame source untouched, e.g. `rtsp://...` or `pattern://640x480`
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub capacity: usize,
    pub stride: usize,
    pub grid_columns: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Placeholder publish interval while paused
    pub pause_interval_ms: u64,
    /// Transport read timeout passed to frame sources that support one
    pub read_timeout_ms: u64,
    /// Undelivered previews kept per source before the oldest is dropped
    pub handoff_depth: usize,
    pub max_sources: usize,
    /// How long shutdown waits for a worker stuck in a read
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationConfig {
    pub marker_radius: u32,
    pub marker_width: u32,
    pub marker_color: [u8; 3],
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub jpeg_quality: u8,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 50,
            stride: 5,
            grid_columns: 4,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pause_interval_ms: 100,
            read_timeout_ms: 2000,
            handoff_depth: 2,
            max_sources: 64,
            shutdown_grace_ms: 1500,
        }
    }
}

impl CaptureConfig {
    pub fn pause_interval(&self) -> Duration {
        Duration::from_millis(self.pause_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            marker_radius: 15,
            marker_width: 2,
            marker_color: [255, 0, 0],
            output_dir: PathBuf::from("captures"),
            format: OutputFormat::Jpeg,
            jpeg_quality: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Defaults, then the optional TOML file, then `FRAMEPICK__*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::layered(path.map(config::File::from))
    }

    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::layered(Some(config::File::from_str(toml, config::FileFormat::Toml)))
    }

    fn layered<S>(file: Option<S>) -> Result<Self, ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        let config: Config = builder
            .add_source(config::Environment::with_prefix("FRAMEPICK").separator("__"))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.history.capacity == 0 {
            return invalid("history.capacity must be non-zero");
        }
        if self.history.stride == 0 {
            return invalid("history.stride must be non-zero");
        }
        if self.history.grid_columns == 0 {
            return invalid("history.grid_columns must be non-zero");
        }
        if self.display.width == 0 || self.display.height == 0 {
            return invalid("display dimensions must be non-zero");
        }
        if self.capture.handoff_depth == 0 {
            return invalid("capture.handoff_depth must be non-zero");
        }
        if self.annotation.jpeg_quality == 0 || self.annotation.jpeg_quality > 100 {
            return invalid("annotation.jpeg_quality must be within 1..=100");
        }
        if self.sources.len() > self.capture.max_sources {
            return invalid("more sources than capture.max_sources");
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.is_empty() {
                return invalid("source ids must not be empty");
            }
            if !seen.insert(source.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source id {}",
                    source.id
                )));
            }
        }
        Ok(())
    }
}
