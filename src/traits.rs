//! Core traits and types for the video source abstraction.
//!
//! Every backend implements [`VideoSource`]. Only frame production is
//! required; each control operation has a default body that reports
//! [`CameraError::Unsupported`], so callers can always invoke an operation
//! and get a defined answer even without checking `supports_*` first.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use crate::transform::InputTransformMode;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed, luma first).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed, chroma first).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// GREY pixel format (8-bit luma).
    pub const GREY: Self = Self::new(b"GREY");

    /// Whether frames in this format are already an encoded bitstream.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        self == Self::MJPG
    }

    /// Bytes per pixel for packed raw formats, `None` for compressed ones.
    #[must_use]
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match &self.0 {
            b"YUYV" | b"UYVY" => Some(2),
            b"RGB3" | b"BGR3" => Some(3),
            b"GREY" => Some(1),
            _ => None,
        }
    }
}

impl std::fmt::Display for FourCC {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Video format specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride), zero for compressed formats.
    pub stride: u32,
    /// Total frame size in bytes (upper bound for compressed formats).
    pub size: u32,
}

impl Format {
    /// Create a new format specification.
    #[must_use]
    pub fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let stride = fourcc.bytes_per_pixel().map_or(0, |bpp| width * bpp);
        let size = if stride == 0 {
            width * height * 3
        } else {
            stride * height
        };
        Self {
            width,
            height,
            fourcc,
            stride,
            size,
        }
    }
}

impl From<v4l::Format> for Format {
    fn from(fmt: v4l::Format) -> Self {
        Self {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        }
    }
}

/// Device capability flags.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming.
    pub can_stream: bool,
}

/// A decoded video frame: `width * height * 3` bytes, interleaved B, G, R.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Interleaved BGR pixel data, row-major with no padding.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Capture timestamp in microseconds since the Unix epoch.
    pub timestamp_us: i64,
    /// Frame sequence number as reported by the source.
    pub sequence: u32,
}

impl Frame {
    /// Create a black frame of the given size.
    #[must_use]
    pub fn black(width: u32, height: u32) -> Self {
        Self {
            data: vec![0; (width * height * 3) as usize],
            width,
            height,
            timestamp_us: 0,
            sequence: 0,
        }
    }

    /// Get the `(r, g, b)` values for a pixel, or `None` if out of bounds.
    #[must_use]
    pub fn pixel_at(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y * self.width + x) * 3) as usize;
        let b = *self.data.get(offset)?;
        let g = *self.data.get(offset + 1)?;
        let r = *self.data.get(offset + 2)?;
        Some((r, g, b))
    }

    /// Mean Rec. 601 luma over the whole frame, 0.0 for empty frames.
    #[must_use]
    pub fn mean_luma(&self) -> f64 {
        let pixels = self.data.chunks_exact(3);
        let count = pixels.len();
        if count == 0 {
            return 0.0;
        }
        let sum: f64 = pixels
            .map(|px| match px {
                [b, g, r] => 0.114f64.mul_add(
                    f64::from(*b),
                    0.587f64.mul_add(f64::from(*g), 0.299 * f64::from(*r)),
                ),
                _ => 0.0,
            })
            .sum();
        #[allow(clippy::cast_precision_loss)]
        let count = count as f64;
        sum / count
    }
}

/// An encoded frame handed back without decoding (e.g., one MJPEG image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedFrame {
    /// Encoded payload exactly as the device produced it.
    pub data: Vec<u8>,
    /// Capture timestamp in microseconds since the Unix epoch.
    pub timestamp_us: i64,
}

/// Optional capabilities a video source may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Manual exposure control.
    Exposure,
    /// Automatic exposure toggle.
    AutoExposure,
    /// Manual white-balance temperature control.
    WhiteBalance,
    /// Automatic white-balance toggle.
    AutoWhiteBalance,
    /// Gain control.
    Gain,
    /// Exact per-frame capture timestamps.
    FrameTimestamp,
    /// Already-encoded frame output.
    CompressedOutput,
    /// Frame interval renegotiation.
    FrameInterval,
    /// Full stop/reconfigure/start cycle.
    Restart,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Exposure => "exposure",
            Self::AutoExposure => "auto exposure",
            Self::WhiteBalance => "white balance",
            Self::AutoWhiteBalance => "auto white balance",
            Self::Gain => "gain",
            Self::FrameTimestamp => "frame timestamp",
            Self::CompressedOutput => "compressed output",
            Self::FrameInterval => "frame interval",
            Self::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// Error type for camera operations.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The source does not implement the requested operation.
    #[error("{0} is not supported by this video source")]
    Unsupported(Capability),

    /// A normalized control value outside [0.0, 1.0] (or not finite).
    #[error("normalized control value {0} is outside [0.0, 1.0]")]
    InvalidControlValue(f64),

    /// No device node exists for the given index.
    #[error("no such device: {path}")]
    DeviceNotFound {
        /// Device node path.
        path: String,
    },

    /// The device node exists but cannot be opened by this user.
    #[error("permission denied opening {path}")]
    PermissionDenied {
        /// Device node path.
        path: String,
    },

    /// The device node is not a video capture device.
    #[error("{path} is not a video capture device")]
    NotCaptureDevice {
        /// Device node path.
        path: String,
    },

    /// The device cannot do streaming I/O.
    #[error("{path} does not support streaming I/O")]
    StreamingNotSupported {
        /// Device node path.
        path: String,
    },

    /// Failed to open device for any other reason.
    #[error("failed to open {path}: {source}")]
    DeviceOpenFailed {
        /// Device node path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// Format negotiation failed.
    #[error("format negotiation failed: {0}")]
    Format(#[source] std::io::Error),

    /// Frame interval could not be applied.
    #[error("frame interval update failed: {0}")]
    FrameInterval(#[source] std::io::Error),

    /// Buffer allocation or mapping failed.
    #[error("buffer request failed: {0}")]
    BufferRequest(#[source] std::io::Error),

    /// Requeueing the previous buffer or dequeueing a filled one failed.
    #[error("dequeueing buffer failed: {0}")]
    BufferDequeue(#[source] std::io::Error),

    /// Starting or stopping the stream failed.
    #[error("stream {action} failed: {source}")]
    Stream {
        /// `"on"` or `"off"`.
        action: &'static str,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A capture was requested while the device is not streaming.
    #[error("device is not streaming")]
    NotStreaming,

    /// The driver rejected the control ID.
    #[error("control {id:#010x} is not supported")]
    ControlNotSupported {
        /// V4L2 control ID.
        id: u32,
    },

    /// The value is outside the control's hardware range.
    #[error("value {value} out of range for control {id:#010x}")]
    ControlOutOfRange {
        /// V4L2 control ID.
        id: u32,
        /// Rejected hardware value.
        value: i64,
    },

    /// The device refused the control access because it is busy.
    #[error("device busy while accessing control {id:#010x}")]
    DeviceBusy {
        /// V4L2 control ID.
        id: u32,
    },

    /// Any other control ioctl failure.
    #[error("control {id:#010x} access failed: {source}")]
    Control {
        /// V4L2 control ID.
        id: u32,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A device pixel format the converter does not understand.
    #[error("unsupported pixel format {0}")]
    UnsupportedPixelFormat(FourCC),

    /// A raw frame shorter than its format demands.
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Required byte count.
        expected: usize,
        /// Received byte count.
        actual: usize,
    },

    /// A compressed frame could not be decoded.
    #[error("failed to decode compressed frame: {0}")]
    Decode(#[from] image::ImageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for camera operations.
pub type Result<T> = std::result::Result<T, CameraError>;

/// A video source shared between the capture loop and the tuner.
///
/// Single-threaded; only one party mutates controls at a time.
pub type SharedSource = Rc<RefCell<dyn VideoSource>>;

/// Wrap a concrete source for shared use.
pub fn share<S: VideoSource + 'static>(source: S) -> SharedSource {
    Rc::new(RefCell::new(source))
}

/// Abstraction over a camera or other frame source with optional controls.
///
/// Normalized control values are in [0.0, 1.0]; backends map them onto
/// their hardware ranges.
pub trait VideoSource {
    /// Block until the next frame is available, before any input transform.
    fn produce_pre_transform_frame(&mut self) -> Result<Frame>;

    /// Source-specific pixel fixup applied before the generic transform.
    fn pre_transform_fixup(&mut self, _frame: &mut Frame) {}

    /// Transform applied to every frame returned by [`VideoSource::next_frame`].
    fn input_transform_mode(&self) -> InputTransformMode {
        InputTransformMode::None
    }

    /// Pull the next frame: produce, fix up, then apply the input transform.
    fn next_frame(&mut self) -> Result<Frame> {
        let mut frame = self.produce_pre_transform_frame()?;
        self.pre_transform_fixup(&mut frame);
        Ok(self.input_transform_mode().apply(frame))
    }

    /// Frame `(width, height)` before the input transform, if known.
    fn dimensions(&self) -> Option<(u32, u32)> {
        None
    }

    /// Whether [`VideoSource::dimensions`] reports a usable size.
    fn has_frame_dimensions(&self) -> bool {
        self.dimensions().is_some_and(|(w, h)| w > 0 && h > 0)
    }

    // == timestamps

    /// Whether frames carry exact capture timestamps.
    fn supports_exact_frame_timestamp(&self) -> bool {
        false
    }

    /// Timestamp (µs since epoch) of the most recently produced frame.
    fn frame_timestamp(&self) -> Result<i64> {
        Err(CameraError::Unsupported(Capability::FrameTimestamp))
    }

    // == exposure

    /// Whether manual exposure control is available.
    fn supports_exposure_controls(&self) -> bool {
        false
    }

    /// Enable automatic exposure.
    fn turn_on_auto_exposure(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::AutoExposure))
    }

    /// Disable automatic exposure (manual mode).
    fn turn_off_auto_exposure(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::AutoExposure))
    }

    /// Flip the automatic exposure mode.
    fn toggle_auto_exposure(&mut self) -> Result<()> {
        if self.is_auto_exposure_on()? {
            self.turn_off_auto_exposure()
        } else {
            self.turn_on_auto_exposure()
        }
    }

    /// Whether automatic exposure is on.
    fn is_auto_exposure_on(&mut self) -> Result<bool> {
        Err(CameraError::Unsupported(Capability::AutoExposure))
    }

    /// Raise exposure by one hardware-specific step.
    fn increase_exposure(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::Exposure))
    }

    /// Lower exposure by one hardware-specific step.
    fn decrease_exposure(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::Exposure))
    }

    /// Set exposure to a normalized value.
    fn set_exposure(&mut self, _value: f64) -> Result<()> {
        Err(CameraError::Unsupported(Capability::Exposure))
    }

    /// Current exposure as a normalized value.
    fn exposure(&mut self) -> Result<f64> {
        Err(CameraError::Unsupported(Capability::Exposure))
    }

    // == white balance

    /// Whether white-balance controls are available.
    fn supports_white_balance_controls(&self) -> bool {
        false
    }

    /// Enable automatic white balance.
    fn turn_on_auto_white_balance(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::AutoWhiteBalance))
    }

    /// Disable automatic white balance.
    fn turn_off_auto_white_balance(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::AutoWhiteBalance))
    }

    /// Flip the automatic white-balance mode.
    fn toggle_auto_white_balance(&mut self) -> Result<()> {
        if self.is_auto_white_balance_on()? {
            self.turn_off_auto_white_balance()
        } else {
            self.turn_on_auto_white_balance()
        }
    }

    /// Whether automatic white balance is on.
    fn is_auto_white_balance_on(&mut self) -> Result<bool> {
        Err(CameraError::Unsupported(Capability::AutoWhiteBalance))
    }

    /// Raise white-balance temperature by one hardware-specific step.
    fn increase_white_balance(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::WhiteBalance))
    }

    /// Lower white-balance temperature by one hardware-specific step.
    fn decrease_white_balance(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::WhiteBalance))
    }

    /// Set white balance to a normalized value (0.0 coolest, 1.0 warmest).
    fn set_white_balance(&mut self, _value: f64) -> Result<()> {
        Err(CameraError::Unsupported(Capability::WhiteBalance))
    }

    /// Current white balance as a normalized value.
    fn white_balance(&mut self) -> Result<f64> {
        Err(CameraError::Unsupported(Capability::WhiteBalance))
    }

    // == gain

    /// Whether gain control is available.
    fn supports_gain_control(&self) -> bool {
        false
    }

    /// Raise gain by one hardware-specific step.
    fn increase_gain(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::Gain))
    }

    /// Lower gain by one hardware-specific step.
    fn decrease_gain(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::Gain))
    }

    /// Set gain to a normalized value.
    fn set_gain(&mut self, _value: f64) -> Result<()> {
        Err(CameraError::Unsupported(Capability::Gain))
    }

    /// Current gain as a normalized value.
    fn gain(&mut self) -> Result<f64> {
        Err(CameraError::Unsupported(Capability::Gain))
    }

    // == compressed output

    /// Whether [`VideoSource::produce_compressed_frame`] can be used.
    fn supports_compressed_output(&self) -> bool {
        false
    }

    /// Return the next frame as its encoded payload, skipping decode.
    fn produce_compressed_frame(&mut self) -> Result<CompressedFrame> {
        Err(CameraError::Unsupported(Capability::CompressedOutput))
    }

    // == framerate recovery

    /// Re-apply the configured frame interval.
    fn reset_frame_interval(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::FrameInterval))
    }

    /// Stop, reconfigure and restart the source.
    fn restart(&mut self) -> Result<()> {
        Err(CameraError::Unsupported(Capability::Restart))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A source that only produces frames and relies on every default.
    struct BareSource;

    impl VideoSource for BareSource {
        fn produce_pre_transform_frame(&mut self) -> Result<Frame> {
            Ok(Frame::black(4, 2))
        }
    }

    #[test]
    fn test_defaults_report_unsupported() {
        let mut source = BareSource;
        assert!(!source.supports_exposure_controls());
        assert!(!source.supports_gain_control());
        assert!(!source.supports_white_balance_controls());
        assert!(!source.supports_compressed_output());
        assert!(!source.has_frame_dimensions());

        assert!(matches!(
            source.set_exposure(0.5),
            Err(CameraError::Unsupported(Capability::Exposure))
        ));
        assert!(matches!(
            source.gain(),
            Err(CameraError::Unsupported(Capability::Gain))
        ));
        assert!(matches!(
            source.toggle_auto_white_balance(),
            Err(CameraError::Unsupported(Capability::AutoWhiteBalance))
        ));
        assert!(matches!(
            source.produce_compressed_frame(),
            Err(CameraError::Unsupported(Capability::CompressedOutput))
        ));
        assert!(matches!(
            source.restart(),
            Err(CameraError::Unsupported(Capability::Restart))
        ));
    }

    #[test]
    fn test_next_frame_uses_producer() {
        let mut source = BareSource;
        let frame = source.next_frame().expect("next_frame should succeed");
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.data.len(), 4 * 2 * 3);
    }

    #[test]
    fn test_pixel_at_reads_bgr_as_rgb() {
        let mut frame = Frame::black(2, 1);
        frame.data = vec![1, 2, 3, 10, 20, 30];
        assert_eq!(frame.pixel_at(0, 0), Some((3, 2, 1)));
        assert_eq!(frame.pixel_at(1, 0), Some((30, 20, 10)));
        assert_eq!(frame.pixel_at(2, 0), None);
    }

    #[test]
    fn test_mean_luma() {
        let mut frame = Frame::black(2, 1);
        assert!(frame.mean_luma().abs() < f64::EPSILON);
        frame.data = vec![255; 6];
        assert!((frame.mean_luma() - 255.0).abs() < 1e-9);
    }

    #[test]
    fn test_format_stride() {
        let yuyv = Format::new(640, 480, FourCC::YUYV);
        assert_eq!(yuyv.stride, 1280);
        assert_eq!(yuyv.size, 1280 * 480);

        let mjpg = Format::new(640, 480, FourCC::MJPG);
        assert_eq!(mjpg.stride, 0);
        assert!(FourCC::MJPG.is_compressed());
        assert!(!FourCC::YUYV.is_compressed());
    }

    #[test]
    fn test_fourcc_display() {
        assert_eq!(FourCC::YUYV.to_string(), "YUYV");
    }
}
