//! Engine configuration.
//!
//! [`EngineConfig`] is everything the host application hands to
//! [`crate::engine::StereoEngine::init`]: maximum image geometry, ring depth,
//! which stages are compiled into the pipeline, where parameter files and
//! logs live, and the camera model tag. Configurations are plain `serde`
//! structs and can be loaded from a TOML file (with environment overrides)
//! through the `config` crate.
//!
//! Validation happens once at init; anything out of range is a
//! `Configuration` error and fatal (see the error taxonomy in
//! [`crate::error`]).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{StereoError, StereoResult};

/// Upper bound for the matcher search depth and ring payload sizing.
pub const MAX_MATCHING_DEPTH: usize = 512;

/// Maximum number of slots either frame ring will accept.
pub const MAX_BUFFER_COUNT: usize = 16;

/// Camera model tag.
///
/// The model selects the contrast offset used by the matcher and the suffix
/// of the per-stage parameter files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraModel {
    /// 752 x 480 sensor.
    Vm,
    /// 1280 x 720 sensor.
    Xc,
    /// 4K-class sensor.
    K4,
    /// 4K-class sensor, variant A.
    K4a,
    /// 4K-class sensor, variant J.
    K4j,
}

impl CameraModel {
    /// Native sensor width in pixels.
    pub fn sensor_width(self) -> usize {
        match self {
            CameraModel::Vm => 752,
            CameraModel::Xc => 1280,
            CameraModel::K4 | CameraModel::K4a | CameraModel::K4j => 3840,
        }
    }

    /// Suffix used in parameter file names, e.g. `StereoMatchingParameter_XC.ini`.
    pub fn file_suffix(self) -> &'static str {
        match self {
            CameraModel::Vm => "VM",
            CameraModel::Xc => "XC",
            CameraModel::K4 => "4K",
            CameraModel::K4a => "4KA",
            CameraModel::K4j => "4KJ",
        }
    }
}

/// Which stage implementations the engine instantiates at init.
///
/// This is the static counterpart of [`crate::engine::StartMode`]: a stage
/// disabled here cannot be enabled at start time.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EnabledStages {
    /// Block-matching stage (§ stereo matcher).
    pub stereo_matching: bool,
    /// External frame-decoder stage.
    pub frame_decoder: bool,
    /// Disparity filter stage.
    pub disparity_filter: bool,
}

impl EnabledStages {
    /// True when at least one stage is enabled.
    pub fn any(self) -> bool {
        self.stereo_matching || self.frame_decoder || self.disparity_filter
    }
}

/// Log verbosity, mapped onto a `tracing` filter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Errors and warnings.
    Warn,
    /// Lifecycle events.
    #[default]
    Info,
    /// Per-frame events.
    Debug,
    /// Everything.
    Trace,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Initialisation parameters for the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum image width the pipeline must accommodate. Ring payloads and
    /// stage scratch are sized from this once at init.
    pub max_image_width: usize,
    /// Maximum image height.
    pub max_image_height: usize,
    /// Depth of the ingress and egress frame rings.
    pub max_buffer_count: usize,
    /// Stage set instantiated at init.
    pub enabled_stages: EnabledStages,
    /// Directory containing the per-stage parameter files.
    pub configuration_path: PathBuf,
    /// Log destination. `None` logs to stderr.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    /// Log verbosity.
    #[serde(default)]
    pub log_level: LogLevel,
    /// Camera model tag.
    pub camera_model: CameraModel,
}

impl EngineConfig {
    /// Load a configuration from a TOML file, allowing `STEREO_*` environment
    /// variables to override individual keys.
    pub fn from_file(path: &Path) -> StereoResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("STEREO").separator("__"))
            .build()?;

        let cfg: EngineConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic validation beyond what deserialisation enforces.
    pub fn validate(&self) -> StereoResult<()> {
        if self.max_image_width == 0 || self.max_image_height == 0 {
            return Err(StereoError::Configuration(format!(
                "invalid maximum image size {}x{}",
                self.max_image_width, self.max_image_height
            )));
        }
        if self.max_image_width % 4 != 0 {
            return Err(StereoError::Configuration(format!(
                "maximum image width {} is not a multiple of the block width",
                self.max_image_width
            )));
        }
        if self.max_buffer_count == 0 || self.max_buffer_count > MAX_BUFFER_COUNT {
            return Err(StereoError::Configuration(format!(
                "buffer count {} outside 1..={}",
                self.max_buffer_count, MAX_BUFFER_COUNT
            )));
        }
        if !self.enabled_stages.any() {
            return Err(StereoError::Configuration(
                "no data processing stage enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Install a global `tracing` subscriber according to the configured
    /// verbosity and log destination. Safe to call more than once; later
    /// calls are ignored.
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.log_level.as_filter()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);

        let result = match &self.log_path {
            Some(path) => match std::fs::File::create(path) {
                Ok(file) => builder
                    .with_ansi(false)
                    .with_writer(std::sync::Arc::new(file))
                    .try_init(),
                Err(_) => builder.try_init(),
            },
            None => builder.try_init(),
        };

        if result.is_ok() {
            tracing::info!(
                camera_model = ?self.camera_model,
                max_size = format!("{}x{}", self.max_image_width, self.max_image_height),
                "tracing initialised"
            );
        }
    }
}
