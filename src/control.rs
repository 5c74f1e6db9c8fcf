//! V4L2 control identifiers and normalized value mapping.
//!
//! Normalized values in [0.0, 1.0] map linearly onto each control's
//! hardware range `[min, max]`, discovered once per device session.

use crate::traits::{CameraError, Result};

const V4L2_CTRL_CLASS_USER: u32 = 0x0098_0000;
const V4L2_CTRL_CLASS_CAMERA: u32 = 0x009a_0000;
const V4L2_CTRL_CLASS_IMAGE_SOURCE: u32 = 0x009e_0000;

const V4L2_CID_BASE: u32 = V4L2_CTRL_CLASS_USER | 0x900;
const V4L2_CID_CAMERA_CLASS_BASE: u32 = V4L2_CTRL_CLASS_CAMERA | 0x900;
const V4L2_CID_IMAGE_SOURCE_CLASS_BASE: u32 = V4L2_CTRL_CLASS_IMAGE_SOURCE | 0x900;

/// Brightness control.
pub const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
/// Automatic white balance (boolean).
pub const V4L2_CID_AUTO_WHITE_BALANCE: u32 = V4L2_CID_BASE + 12;
/// Exposure in sensor lines. Exposed by CSI sensor drivers.
pub const V4L2_CID_EXPOSURE: u32 = V4L2_CID_BASE + 17;
/// Gain.
pub const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;
/// White balance temperature in Kelvin.
pub const V4L2_CID_WHITE_BALANCE_TEMPERATURE: u32 = V4L2_CID_BASE + 26;
/// Exposure mode menu: auto, manual, shutter priority, aperture priority.
pub const V4L2_CID_EXPOSURE_AUTO: u32 = V4L2_CID_CAMERA_CLASS_BASE + 1;
/// Absolute exposure time in 100µs units.
pub const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = V4L2_CID_CAMERA_CLASS_BASE + 2;

/// Analogue sensor gain. Exposed by CSI sensor drivers.
pub const V4L2_CID_ANALOGUE_GAIN: u32 = V4L2_CID_IMAGE_SOURCE_CLASS_BASE + 3;

/// Exposure controls in order of preference: UVC, then CSI sensors.
pub const EXPOSURE_CONTROLS: [u32; 2] = [V4L2_CID_EXPOSURE_ABSOLUTE, V4L2_CID_EXPOSURE];
/// Gain controls in order of preference.
pub const GAIN_CONTROLS: [u32; 2] = [V4L2_CID_GAIN, V4L2_CID_ANALOGUE_GAIN];

/// Manual exposure time and iris.
pub const V4L2_EXPOSURE_MANUAL: i64 = 1;
/// Auto exposure time, manual iris. The auto mode most UVC cameras accept.
pub const V4L2_EXPOSURE_APERTURE_PRIORITY: i64 = 3;

/// Human-readable name for the controls this crate touches.
#[must_use]
pub fn control_name(id: u32) -> &'static str {
    match id {
        V4L2_CID_BRIGHTNESS => "brightness",
        V4L2_CID_AUTO_WHITE_BALANCE => "white_balance_automatic",
        V4L2_CID_GAIN => "gain",
        V4L2_CID_WHITE_BALANCE_TEMPERATURE => "white_balance_temperature",
        V4L2_CID_EXPOSURE_AUTO => "auto_exposure",
        V4L2_CID_EXPOSURE_ABSOLUTE => "exposure_time_absolute",
        V4L2_CID_EXPOSURE => "exposure",
        V4L2_CID_ANALOGUE_GAIN => "analogue_gain",
        _ => "unknown",
    }
}

/// How a control's value is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Plain integer.
    Integer,
    /// On/off.
    Boolean,
    /// Menu index.
    Menu,
}

/// Inclusive hardware range of one control.
///
/// A zero-width range (`min == max`) is valid: every normalized value maps
/// to `min`, and `min` normalizes to 0.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRange {
    /// Smallest accepted hardware value.
    pub min: i64,
    /// Largest accepted hardware value.
    pub max: i64,
}

impl ControlRange {
    /// Create a range, swapping the bounds if the driver reported them reversed.
    #[must_use]
    pub const fn new(min: i64, max: i64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Width of the range in hardware units.
    #[must_use]
    pub const fn span(&self) -> i64 {
        self.max - self.min
    }

    /// Whether a hardware value lies inside the range.
    #[must_use]
    pub const fn contains(&self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Clamp a hardware value into the range.
    #[must_use]
    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min, self.max)
    }

    /// Map a normalized value onto the hardware range:
    /// `min + round(normalized * (max - min))`.
    pub fn denormalize(&self, normalized: f64) -> Result<i64> {
        if !normalized.is_finite() || !(0.0..=1.0).contains(&normalized) {
            return Err(CameraError::InvalidControlValue(normalized));
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
        let offset = (normalized * self.span() as f64).round() as i64;
        Ok(self.clamp(self.min + offset))
    }

    /// Map a hardware value back to [0.0, 1.0], clamping out-of-range input.
    #[must_use]
    pub fn normalize(&self, value: i64) -> f64 {
        if self.span() == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let normalized = (self.clamp(value) - self.min) as f64 / self.span() as f64;
        normalized.clamp(0.0, 1.0)
    }

    /// Size of one hardware step in normalized units (1.0 for zero-width ranges).
    #[must_use]
    pub fn quantum(&self) -> f64 {
        if self.span() == 0 {
            1.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let span = self.span() as f64;
            1.0 / span
        }
    }
}

/// A control discovered on the device: its range and value representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlInfo {
    /// Hardware range.
    pub range: ControlRange,
    /// Value representation.
    pub kind: ControlKind,
}
