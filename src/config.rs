//! Configuration for the capture backend and the tuner.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traits::FourCC;
use crate::transform::InputTransformMode;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is outside its accepted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Complete configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Capture device settings.
    pub camera: CameraSettings,
    /// Automatic tuning settings.
    pub tuning: TuningSection,
}

impl Settings {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Loads configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.camera.validate()?;
        self.tuning.tuner.validate()
    }
}

/// Requested capture codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureCodec {
    /// Motion JPEG; enables compressed passthrough.
    #[default]
    Mjpg,
    /// Packed YUV 4:2:2.
    Yuyv,
}

impl CaptureCodec {
    /// The pixel format requested from the driver.
    #[must_use]
    pub const fn fourcc(self) -> FourCC {
        match self {
            Self::Mjpg => FourCC::MJPG,
            Self::Yuyv => FourCC::YUYV,
        }
    }
}

/// Capture device settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// Index `N` of `/dev/videoN`.
    pub device_index: u32,
    /// Requested frame width; the driver may grant another.
    pub width: u32,
    /// Requested frame height; the driver may grant another.
    pub height: u32,
    /// Requested frames per second.
    pub fps: u32,
    /// Requested pixel format.
    pub codec: CaptureCodec,
    /// Number of mmap'd capture buffers.
    pub buffer_count: u32,
    /// Turn auto exposure and auto white balance on at open time.
    pub auto_lock: bool,
    /// Orientation fixup for produced frames.
    pub input_transform_mode: InputTransformMode,
    /// Log every control read and write.
    pub log_verbose_controls: bool,
    /// Hardware units per exposure increase/decrease.
    pub exposure_step: i64,
    /// Hardware units (Kelvin) per white-balance increase/decrease.
    pub white_balance_step: i64,
    /// Hardware units per gain increase/decrease.
    pub gain_step: i64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: 1280,
            height: 720,
            fps: 30,
            codec: CaptureCodec::default(),
            buffer_count: 4,
            auto_lock: true,
            input_transform_mode: InputTransformMode::None,
            log_verbose_controls: false,
            exposure_step: 50,
            white_balance_step: 100,
            gain_step: 10,
        }
    }
}

impl CameraSettings {
    /// Device node path derived from the index.
    #[must_use]
    pub fn device_path(&self) -> String {
        format!("/dev/video{}", self.device_index)
    }

    /// Validates the camera section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::Invalid(format!(
                "capture size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(ConfigError::Invalid("fps must be positive".to_owned()));
        }
        if self.buffer_count < 2 {
            return Err(ConfigError::Invalid(format!(
                "buffer_count must be at least 2, got {}",
                self.buffer_count
            )));
        }
        if self.exposure_step <= 0 || self.white_balance_step <= 0 || self.gain_step <= 0 {
            return Err(ConfigError::Invalid(
                "hardware control steps must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Whether to tune, and how.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningSection {
    /// Run the tuner before normal capture.
    pub enabled: bool,
    /// Tuning parameters.
    pub tuner: TunerSettings,
}

/// Parameters of the tuning process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerSettings {
    /// Frames to let auto white balance run before locking it.
    pub auto_wb_frame_count: u32,

    /// Reduce exposure until the measured framerate reaches this (FPS).
    pub min_acceptable_framerate: f64,
    /// Normalized exposure decrement per decision.
    pub exposure_step: f64,
    /// Normalized exposure floor.
    pub min_exposure: f64,
    /// Frames to wait after an exposure change.
    pub exposure_settle_frames: u32,
    /// Maximum exposure changes before giving up.
    pub max_exposure_iterations: u32,

    /// Normalized gain change per decision.
    pub gain_step: f64,
    /// Normalized gain ceiling.
    pub max_acceptable_gain: f64,
    /// Frames to wait after a gain change.
    pub gain_settle_frames: u32,
    /// Maximum gain changes before giving up.
    pub max_gain_iterations: u32,

    /// Normalized exposure applied when the exposure search begins.
    pub initial_exposure: f64,
    /// Normalized gain applied when the exposure search begins.
    pub initial_gain: f64,

    /// Draw the calibration overlay on display frames while tuning.
    pub render_calibrating_overlay: bool,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            auto_wb_frame_count: 30,
            min_acceptable_framerate: 26.0,
            exposure_step: 0.02,
            min_exposure: 0.0,
            exposure_settle_frames: 3,
            max_exposure_iterations: 50,
            gain_step: 0.05,
            max_acceptable_gain: 0.8,
            gain_settle_frames: 3,
            max_gain_iterations: 20,
            initial_exposure: 1.0,
            initial_gain: 0.0,
            render_calibrating_overlay: false,
        }
    }
}

impl TunerSettings {
    /// Validates the range constraints the tuning algorithm depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("min_acceptable_framerate", self.min_acceptable_framerate)?;
        positive("exposure_step", self.exposure_step)?;
        positive("gain_step", self.gain_step)?;
        normalized("min_exposure", self.min_exposure)?;
        normalized("max_acceptable_gain", self.max_acceptable_gain)?;
        normalized("initial_exposure", self.initial_exposure)?;
        normalized("initial_gain", self.initial_gain)?;

        if self.min_exposure > self.initial_exposure {
            return Err(ConfigError::Invalid(format!(
                "min_exposure {} exceeds initial_exposure {}",
                self.min_exposure, self.initial_exposure
            )));
        }
        if self.initial_gain > self.max_acceptable_gain {
            return Err(ConfigError::Invalid(format!(
                "initial_gain {} exceeds max_acceptable_gain {}",
                self.initial_gain, self.max_acceptable_gain
            )));
        }
        if self.max_exposure_iterations == 0 || self.max_gain_iterations == 0 {
            return Err(ConfigError::Invalid(
                "iteration limits must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")))
    }
}

fn normalized(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{name} must be within [0.0, 1.0], got {value}"
        )))
    }
}
