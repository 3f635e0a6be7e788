//! Configuration loading using Figment
//!
//! Configuration is layered:
//! 1. `config/mda.toml` (or the file given with `--config`)
//! 2. Environment variables prefixed with `MDA_`, with `__` separating
//!    sections from keys, e.g. `MDA_APPLICATION__LOG_LEVEL=debug`
//!
//! Every field has a default, so a missing file yields a usable setup.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use mda_core::error::AcqResult;
use mda_core::error_recovery::RetryPolicy;
use mda_core::pipeline::stages::{ChannelSplitter, FrameAverager, PassThrough, TagAnnotator};
use mda_core::pipeline::{ImageProcessor, Pipeline};
use mda_core::plan::{FirmwareVersion, SequencePlan};
use mda_driver_mock::{MockMicroscope, TimingConfig};
use mda_experiment::EngineSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/mda.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Circular buffer settings
    pub buffer: BufferConfig,
    /// Execution engine settings
    pub engine: EngineConfig,
    /// Processing pipeline settings
    pub pipeline: PipelineConfig,
    /// Simulated microscope settings
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "mda-acq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Circular buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Memory reserved for image slots
    pub memory_mb: usize,
    /// Drain poll interval in milliseconds
    pub drain_poll_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            memory_mb: 256,
            drain_poll_ms: 20,
        }
    }
}

/// Execution engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Device wait timeout in milliseconds
    pub device_timeout_ms: u64,
    /// Retries per hardware command
    pub hardware_retries: u32,
    /// Delay between retries in milliseconds
    pub retry_delay_ms: u64,
    /// Focus drive label
    pub z_stage: Option<String>,
    /// XY stage label
    pub xy_stage: Option<String>,
    /// Other device labels plans may reference, e.g. an autofocus drive
    pub devices: Vec<String>,
    /// Oldest trigger firmware accepted for hardware channel modes
    pub min_trigger_firmware: FirmwareVersion,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_timeout_ms: 10_000,
            hardware_retries: 6,
            retry_delay_ms: 5,
            z_stage: Some("Z".to_string()),
            xy_stage: Some("XY".to_string()),
            devices: Vec::new(),
            min_trigger_firmware: FirmwareVersion::MIN_HARDWARE_SEQUENCING,
        }
    }
}

/// Processing pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capacity of each inter-stage queue
    pub queue_depth: usize,
    /// Stages in processing order
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_depth: mda_core::pipeline::DEFAULT_QUEUE_DEPTH,
            stages: Vec::new(),
        }
    }
}

/// One built-in processing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    /// Forwards images unchanged
    PassThrough {
        /// Stage name
        name: String,
    },
    /// Sets a tag on every image
    TagAnnotator {
        /// Tag key
        key: String,
        /// Tag value
        value: String,
    },
    /// Splits each frame into left and right channels
    ChannelSplitter,
    /// Averages groups of frames
    FrameAverager {
        /// Frames per group
        count: usize,
    },
}

impl StageConfig {
    fn build(&self) -> Box<dyn ImageProcessor> {
        match self {
            StageConfig::PassThrough { name } => Box::new(PassThrough::new(name.clone())),
            StageConfig::TagAnnotator { key, value } => {
                Box::new(TagAnnotator::new(key.clone(), value.clone()))
            }
            StageConfig::ChannelSplitter => Box::new(ChannelSplitter::new()),
            StageConfig::FrameAverager { count } => Box::new(FrameAverager::new(*count)),
        }
    }
}

/// Simulated microscope configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Camera width in pixels
    pub width: u32,
    /// Camera height in pixels
    pub height: u32,
    /// Device delays
    pub timing: TimingConfig,
    /// Firmware of the simulated trigger controller; no controller when unset
    pub trigger_firmware: Option<FirmwareVersion>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            timing: TimingConfig::default(),
            trigger_firmware: None,
        }
    }
}

impl SimulationConfig {
    /// Builds the simulated microscope.
    pub fn microscope(&self) -> MockMicroscope {
        let scope = MockMicroscope::with_timing(self.width, self.height, self.timing);
        match self.trigger_firmware {
            Some(firmware) => scope.with_trigger(firmware),
            None => scope,
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/mda.toml` and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MDA_").split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.buffer.memory_mb == 0 {
            return Err("buffer.memory_mb must be at least 1".to_string());
        }
        if self.engine.device_timeout_ms == 0 {
            return Err("engine.device_timeout_ms must be at least 1".to_string());
        }
        if self.pipeline.queue_depth == 0 {
            return Err("pipeline.queue_depth must be at least 1".to_string());
        }
        if self.simulation.width == 0 || self.simulation.height == 0 {
            return Err(format!(
                "Invalid camera size {}x{}",
                self.simulation.width, self.simulation.height
            ));
        }

        let mut names = HashSet::new();
        for stage in &self.pipeline.stages {
            match stage {
                StageConfig::PassThrough { name } if !names.insert(name.as_str()) => {
                    return Err(format!("Duplicate pass-through stage name: {name}"));
                }
                StageConfig::FrameAverager { count: 0 } => {
                    return Err("frame_averager count must be at least 1".to_string());
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Engine settings derived from the `[engine]` and `[buffer]` sections.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            device_timeout_ms: self.engine.device_timeout_ms,
            retry: RetryPolicy::new(self.engine.hardware_retries, self.engine.retry_delay_ms),
            z_stage: self.engine.z_stage.clone(),
            xy_stage: self.engine.xy_stage.clone(),
            devices: self.engine.devices.clone(),
            buffer_memory_mb: self.buffer.memory_mb,
            drain_poll_ms: self.buffer.drain_poll_ms,
            min_trigger_firmware: self.engine.min_trigger_firmware,
        }
    }

    /// Pipeline with the configured stages, in order.
    pub fn build_pipeline(&self) -> AcqResult<Pipeline> {
        let mut pipeline = Pipeline::new(self.pipeline.queue_depth);
        for stage in &self.pipeline.stages {
            pipeline.add_stage(stage.build())?;
        }
        Ok(pipeline)
    }
}

/// Reads a plan from TOML, or from JSON when the extension is `.json`.
pub fn load_plan(path: &Path) -> Result<SequencePlan> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let plan: SequencePlan = if is_json {
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid JSON plan {}", path.display()))?
    } else {
        toml::from_str(&text).with_context(|| format!("Invalid TOML plan {}", path.display()))?
    };
    Ok(plan)
}
