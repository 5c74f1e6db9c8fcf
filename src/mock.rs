//! Mock video source for testing without hardware.

use std::io::{self, Cursor};

use image::{ImageFormat, RgbImage};

use crate::convert::convert_frame_to_bgr;
use crate::traits::{
    CameraError, Capability, CompressedFrame, FourCC, Frame, Result, VideoSource,
};
use crate::transform::InputTransformMode;

/// Test pattern types for mock frame generation.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// SMPTE color bars pattern.
    ColorBars,
    /// Horizontal gradient from dark to light.
    Gradient,
    /// Solid color with specified Y, U, V values.
    Solid(u8, u8, u8),
    /// Neutral grey whose luma scales with the current gain.
    LitScene(u8),
}

/// How far apart consecutive mock frames are stamped.
#[derive(Debug, Clone, Copy)]
pub enum FrameTiming {
    /// Constant interval in microseconds.
    Fixed(i64),
    /// Interval grows linearly with exposure, like a sensor whose frame
    /// time is bounded by its integration time.
    ExposureBound {
        /// Interval at exposure 0.0.
        min_interval_us: i64,
        /// Interval at exposure 1.0.
        max_interval_us: i64,
    },
}

/// One control mutation, recorded with the index of the next frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlWrite {
    /// `set_exposure` or a step.
    Exposure(f64),
    /// `set_gain` or a step.
    Gain(f64),
    /// `set_white_balance` or a step.
    WhiteBalance(f64),
    /// Auto exposure toggled.
    AutoExposure(bool),
    /// Auto white balance toggled.
    AutoWhiteBalance(bool),
}

/// A [`ControlWrite`] and when it happened.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoggedWrite {
    /// Frames produced before this write.
    pub frame: u64,
    /// What was written.
    pub write: ControlWrite,
}

const MOCK_STEP: f64 = 0.01;
const EPOCH_START_US: i64 = 1_700_000_000_000_000;

/// Scriptable in-memory video source.
pub struct MockSource {
    width: u32,
    height: u32,
    pattern: TestPattern,
    timing: FrameTiming,
    transform: InputTransformMode,

    has_exposure: bool,
    has_auto_exposure: bool,
    has_gain: bool,
    has_white_balance: bool,
    fail_on: Option<Capability>,

    exposure: f64,
    gain: f64,
    white_balance: f64,
    auto_exposure: bool,
    auto_white_balance: bool,

    frames_produced: u64,
    timestamp_us: i64,
    last_timestamp_us: Option<i64>,
    interval_resets: u32,
    writes: Vec<LoggedWrite>,
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSource {
    /// 64x48 color bars at 30 FPS with every control available.
    #[must_use]
    pub fn new() -> Self {
        Self {
            width: 64,
            height: 48,
            pattern: TestPattern::ColorBars,
            timing: FrameTiming::Fixed(33_333),
            transform: InputTransformMode::None,
            has_exposure: true,
            has_auto_exposure: true,
            has_gain: true,
            has_white_balance: true,
            fail_on: None,
            exposure: 0.5,
            gain: 0.0,
            white_balance: 0.6,
            auto_exposure: true,
            auto_white_balance: false,
            frames_produced: 0,
            timestamp_us: EPOCH_START_US,
            last_timestamp_us: None,
            interval_resets: 0,
            writes: Vec::new(),
        }
    }

    /// Set the frame size. Width is rounded down to an even number.
    #[must_use]
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width & !1;
        self.height = height;
        self
    }

    /// Set the test pattern for frame generation.
    #[must_use]
    pub fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// Set frame timing.
    #[must_use]
    pub fn with_timing(mut self, timing: FrameTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Constant frame rate.
    #[must_use]
    pub fn with_fps(self, fps: f64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let interval = (1_000_000.0 / fps).round() as i64;
        self.with_timing(FrameTiming::Fixed(interval))
    }

    /// Set the input transform.
    #[must_use]
    pub fn with_transform(mut self, transform: InputTransformMode) -> Self {
        self.transform = transform;
        self
    }

    /// Remove exposure controls.
    #[must_use]
    pub fn without_exposure(mut self) -> Self {
        self.has_exposure = false;
        self
    }

    /// Keep manual exposure but drop the auto-exposure menu, like a CSI
    /// sensor driver.
    #[must_use]
    pub fn without_auto_exposure(mut self) -> Self {
        self.has_auto_exposure = false;
        self
    }

    /// Remove gain control.
    #[must_use]
    pub fn without_gain(mut self) -> Self {
        self.has_gain = false;
        self
    }

    /// Remove white-balance controls.
    #[must_use]
    pub fn without_white_balance(mut self) -> Self {
        self.has_white_balance = false;
        self
    }

    /// Make every write to this control fail. `Capability::FrameInterval`
    /// makes `reset_frame_interval` fail the way a driver without S_PARM
    /// support does.
    #[must_use]
    pub fn failing(mut self, capability: Capability) -> Self {
        self.fail_on = Some(capability);
        self
    }

    /// Starting white balance reported while auto white balance runs.
    #[must_use]
    pub fn with_white_balance(mut self, value: f64) -> Self {
        self.white_balance = value;
        self
    }

    /// Change which control fails, at any point in a test.
    pub fn set_failing(&mut self, capability: Option<Capability>) {
        self.fail_on = capability;
    }

    /// Every control mutation so far.
    #[must_use]
    pub fn writes(&self) -> &[LoggedWrite] {
        &self.writes
    }

    /// Current normalized exposure, bypassing capability checks.
    #[must_use]
    pub const fn current_exposure(&self) -> f64 {
        self.exposure
    }

    /// Current normalized gain, bypassing capability checks.
    #[must_use]
    pub const fn current_gain(&self) -> f64 {
        self.gain
    }

    /// Current normalized white balance, bypassing capability checks.
    #[must_use]
    pub const fn current_white_balance(&self) -> f64 {
        self.white_balance
    }

    /// Whether auto white balance is on.
    #[must_use]
    pub const fn auto_white_balance_enabled(&self) -> bool {
        self.auto_white_balance
    }

    /// Whether auto exposure is on.
    #[must_use]
    pub const fn auto_exposure_enabled(&self) -> bool {
        self.auto_exposure
    }

    /// How often `reset_frame_interval` was called.
    #[must_use]
    pub const fn interval_resets(&self) -> u32 {
        self.interval_resets
    }

    /// Frames produced so far.
    #[must_use]
    pub const fn frames_produced(&self) -> u64 {
        self.frames_produced
    }

    fn frame_interval_us(&self) -> i64 {
        match self.timing {
            FrameTiming::Fixed(interval) => interval,
            FrameTiming::ExposureBound {
                min_interval_us,
                max_interval_us,
            } => {
                #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
                let extra = ((max_interval_us - min_interval_us) as f64 * self.exposure).round()
                    as i64;
                min_interval_us + extra
            }
        }
    }

    fn write(&mut self, capability: Capability, write: ControlWrite) -> Result<()> {
        if self.fail_on == Some(capability) {
            return Err(CameraError::Io(io::Error::other("injected control failure")));
        }
        self.writes.push(LoggedWrite {
            frame: self.frames_produced,
            write,
        });
        Ok(())
    }

    fn set_level(&mut self, capability: Capability, value: f64) -> Result<()> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(CameraError::InvalidControlValue(value));
        }
        let write = match capability {
            Capability::Exposure => ControlWrite::Exposure(value),
            Capability::Gain => ControlWrite::Gain(value),
            _ => ControlWrite::WhiteBalance(value),
        };
        self.write(capability, write)?;
        match capability {
            Capability::Exposure => self.exposure = value,
            Capability::Gain => self.gain = value,
            _ => self.white_balance = value,
        }
        Ok(())
    }

    fn require(&self, capability: Capability) -> Result<()> {
        let available = match capability {
            Capability::Exposure => self.has_exposure,
            Capability::AutoExposure => self.has_exposure && self.has_auto_exposure,
            Capability::Gain => self.has_gain,
            Capability::WhiteBalance | Capability::AutoWhiteBalance => self.has_white_balance,
            _ => true,
        };
        if available {
            Ok(())
        } else {
            Err(CameraError::Unsupported(capability))
        }
    }

    fn raw_frame(&self) -> Vec<u8> {
        let mut data = vec![0u8; (self.width * self.height * 2) as usize];
        match self.pattern {
            TestPattern::ColorBars => generate_color_bars(&mut data, self.width),
            TestPattern::Gradient => generate_gradient(&mut data, self.width),
            TestPattern::Solid(y, u, v) => generate_solid(&mut data, y, u, v),
            TestPattern::LitScene(base) => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let luma = (f64::from(base) * 3.0f64.mul_add(self.gain, 1.0))
                    .round()
                    .clamp(0.0, 255.0) as u8;
                generate_solid(&mut data, luma, 128, 128);
            }
        }
        data
    }
}

impl VideoSource for MockSource {
    fn produce_pre_transform_frame(&mut self) -> Result<Frame> {
        let raw = self.raw_frame();
        let mut frame = convert_frame_to_bgr(&raw, self.width, self.height, FourCC::YUYV)?;

        if self.last_timestamp_us.is_some() {
            self.timestamp_us += self.frame_interval_us();
        }
        frame.timestamp_us = self.timestamp_us;
        frame.sequence = u32::try_from(self.frames_produced).unwrap_or(u32::MAX);

        self.last_timestamp_us = Some(self.timestamp_us);
        self.frames_produced += 1;
        Ok(frame)
    }

    fn input_transform_mode(&self) -> InputTransformMode {
        self.transform
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }

    fn supports_exact_frame_timestamp(&self) -> bool {
        true
    }

    fn frame_timestamp(&self) -> Result<i64> {
        self.last_timestamp_us.ok_or(CameraError::NotStreaming)
    }

    fn supports_exposure_controls(&self) -> bool {
        self.has_exposure
    }

    fn turn_on_auto_exposure(&mut self) -> Result<()> {
        self.require(Capability::AutoExposure)?;
        self.write(Capability::AutoExposure, ControlWrite::AutoExposure(true))?;
        self.auto_exposure = true;
        Ok(())
    }

    fn turn_off_auto_exposure(&mut self) -> Result<()> {
        self.require(Capability::AutoExposure)?;
        self.write(Capability::AutoExposure, ControlWrite::AutoExposure(false))?;
        self.auto_exposure = false;
        Ok(())
    }

    fn is_auto_exposure_on(&mut self) -> Result<bool> {
        self.require(Capability::AutoExposure)?;
        Ok(self.auto_exposure)
    }

    fn increase_exposure(&mut self) -> Result<()> {
        self.require(Capability::Exposure)?;
        self.set_level(Capability::Exposure, (self.exposure + MOCK_STEP).min(1.0))
    }

    fn decrease_exposure(&mut self) -> Result<()> {
        self.require(Capability::Exposure)?;
        self.set_level(Capability::Exposure, (self.exposure - MOCK_STEP).max(0.0))
    }

    fn set_exposure(&mut self, value: f64) -> Result<()> {
        self.require(Capability::Exposure)?;
        self.set_level(Capability::Exposure, value)
    }

    fn exposure(&mut self) -> Result<f64> {
        self.require(Capability::Exposure)?;
        Ok(self.exposure)
    }

    fn supports_white_balance_controls(&self) -> bool {
        self.has_white_balance
    }

    fn turn_on_auto_white_balance(&mut self) -> Result<()> {
        self.require(Capability::AutoWhiteBalance)?;
        self.write(Capability::AutoWhiteBalance, ControlWrite::AutoWhiteBalance(true))?;
        self.auto_white_balance = true;
        Ok(())
    }

    fn turn_off_auto_white_balance(&mut self) -> Result<()> {
        self.require(Capability::AutoWhiteBalance)?;
        self.write(Capability::AutoWhiteBalance, ControlWrite::AutoWhiteBalance(false))?;
        self.auto_white_balance = false;
        Ok(())
    }

    fn is_auto_white_balance_on(&mut self) -> Result<bool> {
        self.require(Capability::AutoWhiteBalance)?;
        Ok(self.auto_white_balance)
    }

    fn increase_white_balance(&mut self) -> Result<()> {
        self.require(Capability::WhiteBalance)?;
        self.set_level(Capability::WhiteBalance, (self.white_balance + MOCK_STEP).min(1.0))
    }

    fn decrease_white_balance(&mut self) -> Result<()> {
        self.require(Capability::WhiteBalance)?;
        self.set_level(Capability::WhiteBalance, (self.white_balance - MOCK_STEP).max(0.0))
    }

    fn set_white_balance(&mut self, value: f64) -> Result<()> {
        self.require(Capability::WhiteBalance)?;
        self.set_level(Capability::WhiteBalance, value)
    }

    fn white_balance(&mut self) -> Result<f64> {
        self.require(Capability::WhiteBalance)?;
        Ok(self.white_balance)
    }

    fn supports_gain_control(&self) -> bool {
        self.has_gain
    }

    fn increase_gain(&mut self) -> Result<()> {
        self.require(Capability::Gain)?;
        self.set_level(Capability::Gain, (self.gain + MOCK_STEP).min(1.0))
    }

    fn decrease_gain(&mut self) -> Result<()> {
        self.require(Capability::Gain)?;
        self.set_level(Capability::Gain, (self.gain - MOCK_STEP).max(0.0))
    }

    fn set_gain(&mut self, value: f64) -> Result<()> {
        self.require(Capability::Gain)?;
        self.set_level(Capability::Gain, value)
    }

    fn gain(&mut self) -> Result<f64> {
        self.require(Capability::Gain)?;
        Ok(self.gain)
    }

    fn supports_compressed_output(&self) -> bool {
        true
    }

    /// JPEG-encodes the next frame, like an MJPG camera would.
    fn produce_compressed_frame(&mut self) -> Result<CompressedFrame> {
        let frame = self.produce_pre_transform_frame()?;
        let mut rgb = frame.data;
        for px in rgb.chunks_exact_mut(3) {
            px.swap(0, 2);
        }
        let image = RgbImage::from_raw(frame.width, frame.height, rgb)
            .ok_or_else(|| CameraError::Io(io::Error::other("frame size mismatch")))?;
        let mut jpeg = Cursor::new(Vec::new());
        image.write_to(&mut jpeg, ImageFormat::Jpeg)?;
        Ok(CompressedFrame {
            data: jpeg.into_inner(),
            timestamp_us: frame.timestamp_us,
        })
    }

    fn reset_frame_interval(&mut self) -> Result<()> {
        self.interval_resets += 1;
        if self.fail_on == Some(Capability::FrameInterval) {
            return Err(CameraError::FrameInterval(io::Error::from_raw_os_error(
                libc::ENOTTY,
            )));
        }
        Ok(())
    }
}

/// Generate YUYV color bars pattern.
fn generate_color_bars(data: &mut [u8], width: u32) {
    // 8 color bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
    let bars: [(u8, u8, u8); 8] = [
        (235, 128, 128), // White
        (210, 16, 146),  // Yellow
        (170, 166, 16),  // Cyan
        (145, 54, 34),   // Green
        (106, 202, 222), // Magenta
        (81, 90, 240),   // Red
        (41, 240, 110),  // Blue
        (16, 128, 128),  // Black
    ];
    let bar_width = (width / 8).max(1);
    let row_bytes = (width * 2) as usize;

    for row in data.chunks_exact_mut(row_bytes) {
        for (pair, macro_px) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let x = pair as u32 * 2;
            let bar_idx = (x / bar_width).min(7) as usize;
            if let (Some(&(y, u, v)), [y0, u0, y1, v0]) = (bars.get(bar_idx), macro_px) {
                (*y0, *u0, *y1, *v0) = (y, u, y, v);
            }
        }
    }
}

/// Generate YUYV horizontal gradient pattern.
fn generate_gradient(data: &mut [u8], width: u32) {
    let row_bytes = (width * 2) as usize;
    for row in data.chunks_exact_mut(row_bytes) {
        for (pair, macro_px) in row.chunks_exact_mut(4).enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let x = pair as u32 * 2;
            #[allow(clippy::cast_possible_truncation)]
            let y = ((x * 255) / width) as u8;
            if let [y0, u, y1, v] = macro_px {
                (*y0, *u, *y1, *v) = (y, 128, y, 128);
            }
        }
    }
}

/// Generate solid color YUYV frame.
fn generate_solid(data: &mut [u8], y: u8, u: u8, v: u8) {
    for macro_px in data.chunks_exact_mut(4) {
        if let [y0, u0, y1, v0] = macro_px {
            (*y0, *u0, *y1, *v0) = (y, u, y, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_frames_are_stamped() {
        let mut source = MockSource::new().with_fps(20.0);
        let first = source.next_frame().expect("next_frame should succeed");
        let second = source.next_frame().expect("next_frame should succeed");

        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.timestamp_us - first.timestamp_us, 50_000);
        assert_eq!(
            source.frame_timestamp().expect("timestamp known"),
            second.timestamp_us
        );
        assert_eq!(first.data.len(), 64 * 48 * 3);
    }

    #[test]
    fn test_exposure_bound_timing() {
        let mut source = MockSource::new().with_timing(FrameTiming::ExposureBound {
            min_interval_us: 10_000,
            max_interval_us: 50_000,
        });
        source.set_exposure(1.0).expect("set exposure");
        let a = source.next_frame().expect("frame");
        let b = source.next_frame().expect("frame");
        assert_eq!(b.timestamp_us - a.timestamp_us, 50_000);

        source.set_exposure(0.0).expect("set exposure");
        let c = source.next_frame().expect("frame");
        assert_eq!(c.timestamp_us - b.timestamp_us, 10_000);
    }

    #[test]
    fn test_write_log_records_frame_index() {
        let mut source = MockSource::new();
        source.set_gain(0.25).expect("set gain");
        source.next_frame().expect("frame");
        source.next_frame().expect("frame");
        source.set_exposure(0.75).expect("set exposure");

        assert_eq!(
            source.writes(),
            &[
                LoggedWrite {
                    frame: 0,
                    write: ControlWrite::Gain(0.25)
                },
                LoggedWrite {
                    frame: 2,
                    write: ControlWrite::Exposure(0.75)
                },
            ]
        );
    }

    #[test]
    fn test_missing_capabilities() {
        let mut source = MockSource::new().without_gain().without_white_balance();
        assert!(!source.supports_gain_control());
        assert!(matches!(
            source.set_gain(0.5),
            Err(CameraError::Unsupported(Capability::Gain))
        ));
        assert!(matches!(
            source.turn_on_auto_white_balance(),
            Err(CameraError::Unsupported(Capability::AutoWhiteBalance))
        ));
        assert!(source.writes().is_empty());
    }

    #[test]
    fn test_injected_failure_leaves_value() {
        let mut source = MockSource::new().failing(Capability::Exposure);
        assert!(source.set_exposure(0.1).is_err());
        assert!((source.current_exposure() - 0.5).abs() < f64::EPSILON);
        assert!(source.set_gain(0.1).is_ok());
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        let mut source = MockSource::new();
        assert!(matches!(
            source.set_exposure(1.2),
            Err(CameraError::InvalidControlValue(_))
        ));
    }

    #[test]
    fn test_lit_scene_brightens_with_gain() {
        let mut source = MockSource::new().with_pattern(TestPattern::LitScene(40));
        let dark = source.next_frame().expect("frame").mean_luma();
        source.set_gain(0.5).expect("set gain");
        let bright = source.next_frame().expect("frame").mean_luma();
        assert!(bright > dark * 2.0, "{bright} vs {dark}");
    }

    #[test]
    fn test_transform_is_applied() {
        let mut source = MockSource::new()
            .with_size(16, 8)
            .with_pattern(TestPattern::Gradient)
            .with_transform(InputTransformMode::Clockwise90);
        let frame = source.next_frame().expect("frame");
        assert_eq!((frame.width, frame.height), (8, 16));
    }

    #[test]
    fn test_solid_pattern() {
        let mut source = MockSource::new().with_pattern(TestPattern::Solid(128, 128, 128));
        let frame = source.next_frame().expect("frame");
        assert_eq!(frame.pixel_at(0, 0), Some((128, 128, 128)));
        assert_eq!(frame.pixel_at(63, 47), Some((128, 128, 128)));
    }

    #[test]
    fn test_compressed_frame_is_jpeg() {
        let mut source = MockSource::new().with_pattern(TestPattern::Solid(128, 128, 128));
        let compressed = source.produce_compressed_frame().expect("compressed frame");
        assert_eq!(compressed.data.get(..2), Some(&[0xFF, 0xD8][..]));

        let decoded = convert_frame_to_bgr(&compressed.data, 0, 0, FourCC::MJPG).expect("decode");
        assert_eq!((decoded.width, decoded.height), (64, 48));
        let (b, g, r) = decoded.pixel_at(32, 24).expect("pixel");
        assert!([b, g, r].iter().all(|c| c.abs_diff(128) < 8), "({b}, {g}, {r})");
    }

    #[test]
    fn test_frame_interval_failure_injection() {
        let mut source = MockSource::new().failing(Capability::FrameInterval);
        let result = source.reset_frame_interval();
        assert!(matches!(
            result,
            Err(CameraError::FrameInterval(ref err)) if err.raw_os_error() == Some(libc::ENOTTY)
        ));
        assert_eq!(source.interval_resets(), 1);
    }
}
