//! V4L2 camera backend.
//!
//! Format negotiation, control I/O and mmap streaming all go through the
//! v4l crate. [`BufferRing`] hands each dequeued buffer back to the driver
//! on the following capture, including after conversion failures.

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, info, warn};
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Description, Type as ControlType, Value};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::Device;

use crate::buffers::{BufferRing, Dequeued};
use crate::clock::TimestampCorrelator;
use crate::config::CameraSettings;
use crate::control::{
    control_name, ControlInfo, ControlKind, ControlRange, EXPOSURE_CONTROLS, GAIN_CONTROLS,
    V4L2_CID_AUTO_WHITE_BALANCE, V4L2_CID_EXPOSURE_AUTO, V4L2_CID_WHITE_BALANCE_TEMPERATURE,
    V4L2_EXPOSURE_APERTURE_PRIORITY, V4L2_EXPOSURE_MANUAL,
};
use crate::convert::convert_frame_to_bgr;
use crate::traits::{
    CameraError, Capability, CompressedFrame, DeviceCapabilities, Format, Frame, Result,
    VideoSource,
};
use crate::transform::InputTransformMode;

/// A V4L2 capture device with mmap streaming and control access.
pub struct V4l2CameraSource {
    // Declared before `device` so buffers are released while the fd is open.
    ring: Option<BufferRing>,
    device: Device,
    path: String,
    settings: CameraSettings,
    capabilities: DeviceCapabilities,
    format: Format,
    controls: HashMap<u32, ControlInfo>,
    exposure_id: Option<u32>,
    gain_id: Option<u32>,
    clock: TimestampCorrelator,
    last_timestamp_us: Option<i64>,
    compressed: Option<CompressedFrame>,
}

impl V4l2CameraSource {
    /// Open `/dev/video{settings.device_index}`, negotiate the format,
    /// discover control ranges and start streaming.
    pub fn open(settings: &CameraSettings) -> Result<Self> {
        let mut source = Self::open_stopped(settings)?;
        if settings.auto_lock {
            source.enable_auto_modes();
        }
        source.start_streaming()?;
        Ok(source)
    }

    /// Open and configure the device without starting the stream.
    pub fn open_stopped(settings: &CameraSettings) -> Result<Self> {
        let path = settings.device_path();
        let device = Device::new(settings.device_index as usize)
            .map_err(|err| open_error(&path, err))?;

        let caps = device.query_caps().map_err(|err| open_error(&path, err))?;
        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(CapFlags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(CapFlags::STREAMING),
        };
        if !capabilities.can_capture {
            return Err(CameraError::NotCaptureDevice { path });
        }
        if !capabilities.can_stream {
            return Err(CameraError::StreamingNotSupported { path });
        }

        let format = negotiate_format(&device, settings)?;
        info!(
            path = %path,
            card = %capabilities.card,
            width = format.width,
            height = format.height,
            fourcc = %format.fourcc,
            "camera opened"
        );

        let mut source = Self {
            ring: None,
            device,
            path,
            settings: settings.clone(),
            capabilities,
            format,
            controls: HashMap::new(),
            exposure_id: None,
            gain_id: None,
            clock: TimestampCorrelator::new(),
            last_timestamp_us: None,
            compressed: None,
        };
        if let Err(err) = source.apply_frame_interval() {
            warn!(error = %err, fps = settings.fps, "driver rejected frame interval");
        }
        source.controls = discover_controls(&source.device);
        source.exposure_id = first_available(&source.controls, &EXPOSURE_CONTROLS);
        source.gain_id = first_available(&source.controls, &GAIN_CONTROLS);
        debug!(
            count = source.controls.len(),
            exposure = source.exposure_id.map(control_name),
            gain = source.gain_id.map(control_name),
            "control ranges loaded"
        );
        Ok(source)
    }

    /// Device node path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Capabilities reported by the driver.
    #[must_use]
    pub const fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// The format the driver actually granted.
    #[must_use]
    pub const fn format(&self) -> &Format {
        &self.format
    }

    /// Whether capture buffers are allocated and frames can be dequeued.
    #[must_use]
    pub const fn is_streaming(&self) -> bool {
        self.ring.is_some()
    }

    /// Allocate and map capture buffers. The driver turns the stream on
    /// with the first capture. A no-op while already streaming.
    pub fn start_streaming(&mut self) -> Result<()> {
        if self.is_streaming() {
            return Ok(());
        }
        self.ring = Some(BufferRing::request(&self.device, self.settings.buffer_count)?);
        debug!(buffers = self.settings.buffer_count, "streaming started");
        Ok(())
    }

    /// Turn the stream off and release every buffer. Idempotent.
    pub fn stop_streaming(&mut self) -> Result<()> {
        self.compressed = None;
        if let Some(mut ring) = self.ring.take() {
            ring.stop()?;
            debug!("streaming stopped");
        }
        Ok(())
    }

    /// Stop, re-apply format and frame interval, then start again.
    pub fn restart_device(&mut self) -> Result<()> {
        info!(path = %self.path, "restarting device");
        self.stop_streaming()?;
        self.format = negotiate_format(&self.device, &self.settings)?;
        if let Err(err) = self.apply_frame_interval() {
            warn!(error = %err, "driver rejected frame interval after restart");
        }
        self.start_streaming()
    }

    fn apply_frame_interval(&self) -> Result<()> {
        let params = Parameters::with_fps(self.settings.fps);
        let granted = self
            .device
            .set_params(&params)
            .map_err(CameraError::FrameInterval)?;
        debug!(
            numerator = granted.interval.numerator,
            denominator = granted.interval.denominator,
            "frame interval applied"
        );
        Ok(())
    }

    fn enable_auto_modes(&mut self) {
        if self.has_control(V4L2_CID_EXPOSURE_AUTO) {
            if let Err(err) = self.turn_on_auto_exposure() {
                warn!(error = %err, "could not enable auto exposure");
            }
        }
        if self.has_control(V4L2_CID_AUTO_WHITE_BALANCE) {
            if let Err(err) = self.turn_on_auto_white_balance() {
                warn!(error = %err, "could not enable auto white balance");
            }
        }
    }

    /// Dequeue one buffer and turn it into a BGR frame.
    ///
    /// With `decode == false` on a compressed format, the payload is only
    /// cached for [`VideoSource::produce_compressed_frame`] and an empty
    /// frame of the negotiated size is returned. The cached payload is
    /// replaced or cleared by every capture, and the buffer goes back to
    /// the driver on the next capture even if conversion fails.
    pub fn capture_frame(&mut self, decode: bool) -> Result<Frame> {
        self.compressed = None;
        let ring = self.ring.as_mut().ok_or(CameraError::NotStreaming)?;
        let (bytes, dequeued) = ring.dequeue()?;
        let decoded = decode_buffer(bytes, &self.format, decode);

        let timestamp_us = self.clock.to_epoch(dequeued.timestamp_us);
        self.last_timestamp_us = Some(timestamp_us);
        finish_capture(decoded, &dequeued, timestamp_us, &mut self.compressed)
    }

    // == raw control access

    /// Whether the driver advertised this control.
    #[must_use]
    pub fn has_control(&self, id: u32) -> bool {
        self.controls.contains_key(&id)
    }

    /// Hardware range of a control, as discovered at open time.
    pub fn v4l2_control_range(&self, id: u32) -> Result<ControlRange> {
        self.controls
            .get(&id)
            .map(|info| info.range)
            .ok_or(CameraError::ControlNotSupported { id })
    }

    /// Human-readable name for a control ID.
    #[must_use]
    pub fn v4l2_control_name(&self, id: u32) -> &'static str {
        control_name(id)
    }

    /// Read a raw hardware control value.
    pub fn v4l2_control(&self, id: u32) -> Result<i64> {
        let control = self.device.control(id).map_err(|err| control_error(id, err))?;
        let value = match control.value {
            Value::Integer(v) => v,
            Value::Boolean(b) => i64::from(b),
            _ => return Err(CameraError::ControlNotSupported { id }),
        };
        if self.settings.log_verbose_controls {
            info!(control = control_name(id), id, value, "read control");
        }
        Ok(value)
    }

    /// Write a raw hardware control value after checking it against the
    /// discovered range.
    pub fn set_v4l2_control(&mut self, id: u32, value: i64) -> Result<()> {
        let info = *self
            .controls
            .get(&id)
            .ok_or(CameraError::ControlNotSupported { id })?;
        if !info.range.contains(value) {
            return Err(CameraError::ControlOutOfRange { id, value });
        }
        let value_repr = match info.kind {
            ControlKind::Boolean => Value::Boolean(value != 0),
            ControlKind::Integer | ControlKind::Menu => Value::Integer(value),
        };
        self.device
            .set_control(Control {
                id,
                value: value_repr,
            })
            .map_err(|err| write_error(id, value, err))?;
        if self.settings.log_verbose_controls {
            info!(control = control_name(id), id, value, "wrote control");
        }
        Ok(())
    }

    fn set_normalized(&mut self, id: u32, normalized: f64) -> Result<()> {
        let hw = self.v4l2_control_range(id)?.denormalize(normalized)?;
        self.set_v4l2_control(id, hw)
    }

    fn normalized(&self, id: u32) -> Result<f64> {
        let range = self.v4l2_control_range(id)?;
        Ok(range.normalize(self.v4l2_control(id)?))
    }

    fn exposure_control(&self) -> Result<u32> {
        self.exposure_id
            .ok_or(CameraError::Unsupported(Capability::Exposure))
    }

    fn gain_control(&self) -> Result<u32> {
        self.gain_id.ok_or(CameraError::Unsupported(Capability::Gain))
    }

    fn auto_exposure_control(&self) -> Result<u32> {
        if self.has_control(V4L2_CID_EXPOSURE_AUTO) {
            Ok(V4L2_CID_EXPOSURE_AUTO)
        } else {
            Err(CameraError::Unsupported(Capability::AutoExposure))
        }
    }

    fn step_control(&mut self, id: u32, delta: i64) -> Result<()> {
        let range = self.v4l2_control_range(id)?;
        let current = self.v4l2_control(id)?;
        self.set_v4l2_control(id, range.clamp(current.saturating_add(delta)))
    }
}

impl Drop for V4l2CameraSource {
    fn drop(&mut self) {
        if let Err(err) = self.stop_streaming() {
            warn!(error = %err, path = %self.path, "failed to stop stream on close");
        }
    }
}

impl VideoSource for V4l2CameraSource {
    fn produce_pre_transform_frame(&mut self) -> Result<Frame> {
        self.capture_frame(true)
    }

    fn input_transform_mode(&self) -> InputTransformMode {
        self.settings.input_transform_mode
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        Some((self.format.width, self.format.height))
    }

    fn supports_exact_frame_timestamp(&self) -> bool {
        true
    }

    fn frame_timestamp(&self) -> Result<i64> {
        self.last_timestamp_us.ok_or(CameraError::NotStreaming)
    }

    /// Manual exposure is enough; CSI sensors have no auto-exposure menu.
    fn supports_exposure_controls(&self) -> bool {
        self.exposure_id.is_some()
    }

    fn turn_on_auto_exposure(&mut self) -> Result<()> {
        let id = self.auto_exposure_control()?;
        self.set_v4l2_control(id, V4L2_EXPOSURE_APERTURE_PRIORITY)
    }

    fn turn_off_auto_exposure(&mut self) -> Result<()> {
        let id = self.auto_exposure_control()?;
        self.set_v4l2_control(id, V4L2_EXPOSURE_MANUAL)
    }

    fn is_auto_exposure_on(&mut self) -> Result<bool> {
        let id = self.auto_exposure_control()?;
        Ok(self.v4l2_control(id)? != V4L2_EXPOSURE_MANUAL)
    }

    fn increase_exposure(&mut self) -> Result<()> {
        let id = self.exposure_control()?;
        self.step_control(id, self.settings.exposure_step)
    }

    fn decrease_exposure(&mut self) -> Result<()> {
        let id = self.exposure_control()?;
        self.step_control(id, -self.settings.exposure_step)
    }

    fn set_exposure(&mut self, value: f64) -> Result<()> {
        let id = self.exposure_control()?;
        self.set_normalized(id, value)
    }

    fn exposure(&mut self) -> Result<f64> {
        let id = self.exposure_control()?;
        self.normalized(id)
    }

    fn supports_white_balance_controls(&self) -> bool {
        self.has_control(V4L2_CID_WHITE_BALANCE_TEMPERATURE)
            && self.has_control(V4L2_CID_AUTO_WHITE_BALANCE)
    }

    fn turn_on_auto_white_balance(&mut self) -> Result<()> {
        self.set_v4l2_control(V4L2_CID_AUTO_WHITE_BALANCE, 1)
    }

    fn turn_off_auto_white_balance(&mut self) -> Result<()> {
        self.set_v4l2_control(V4L2_CID_AUTO_WHITE_BALANCE, 0)
    }

    fn is_auto_white_balance_on(&mut self) -> Result<bool> {
        Ok(self.v4l2_control(V4L2_CID_AUTO_WHITE_BALANCE)? != 0)
    }

    fn increase_white_balance(&mut self) -> Result<()> {
        self.step_control(
            V4L2_CID_WHITE_BALANCE_TEMPERATURE,
            self.settings.white_balance_step,
        )
    }

    fn decrease_white_balance(&mut self) -> Result<()> {
        self.step_control(
            V4L2_CID_WHITE_BALANCE_TEMPERATURE,
            -self.settings.white_balance_step,
        )
    }

    fn set_white_balance(&mut self, value: f64) -> Result<()> {
        self.set_normalized(V4L2_CID_WHITE_BALANCE_TEMPERATURE, value)
    }

    fn white_balance(&mut self) -> Result<f64> {
        self.normalized(V4L2_CID_WHITE_BALANCE_TEMPERATURE)
    }

    fn supports_gain_control(&self) -> bool {
        self.gain_id.is_some()
    }

    fn increase_gain(&mut self) -> Result<()> {
        let id = self.gain_control()?;
        self.step_control(id, self.settings.gain_step)
    }

    fn decrease_gain(&mut self) -> Result<()> {
        let id = self.gain_control()?;
        self.step_control(id, -self.settings.gain_step)
    }

    fn set_gain(&mut self, value: f64) -> Result<()> {
        let id = self.gain_control()?;
        self.set_normalized(id, value)
    }

    fn gain(&mut self) -> Result<f64> {
        let id = self.gain_control()?;
        self.normalized(id)
    }

    fn supports_compressed_output(&self) -> bool {
        self.format.fourcc.is_compressed()
    }

    fn produce_compressed_frame(&mut self) -> Result<CompressedFrame> {
        if !self.supports_compressed_output() {
            return Err(CameraError::Unsupported(Capability::CompressedOutput));
        }
        if let Some(cached) = self.compressed.take() {
            return Ok(cached);
        }
        self.capture_frame(false)?;
        self.compressed
            .take()
            .ok_or_else(|| CameraError::Io(io::Error::other("no compressed payload captured")))
    }

    /// Re-apply the configured frame interval, restarting the device if
    /// the driver refuses while streaming.
    fn reset_frame_interval(&mut self) -> Result<()> {
        match self.apply_frame_interval() {
            Err(CameraError::FrameInterval(err)) if err.raw_os_error() == Some(libc::EBUSY) => {
                debug!("frame interval busy while streaming, restarting");
                self.restart_device()
            }
            other => other,
        }
    }

    fn restart(&mut self) -> Result<()> {
        self.restart_device()
    }
}

fn open_error(path: &str, err: io::Error) -> CameraError {
    let path = path.to_owned();
    match err.kind() {
        io::ErrorKind::NotFound => CameraError::DeviceNotFound { path },
        io::ErrorKind::PermissionDenied => CameraError::PermissionDenied { path },
        _ => CameraError::DeviceOpenFailed { path, source: err },
    }
}

fn control_error(id: u32, err: io::Error) -> CameraError {
    match err.raw_os_error() {
        Some(libc::EINVAL | libc::ENOTTY) => CameraError::ControlNotSupported { id },
        Some(libc::EBUSY) => CameraError::DeviceBusy { id },
        _ => CameraError::Control { id, source: err },
    }
}

fn write_error(id: u32, value: i64, err: io::Error) -> CameraError {
    if err.raw_os_error() == Some(libc::ERANGE) {
        CameraError::ControlOutOfRange { id, value }
    } else {
        control_error(id, err)
    }
}

fn first_available(controls: &HashMap<u32, ControlInfo>, candidates: &[u32]) -> Option<u32> {
    candidates.iter().copied().find(|id| controls.contains_key(id))
}

/// A dequeued buffer after conversion, before it is stamped.
struct Decoded {
    frame: Result<Frame>,
    payload: Option<Vec<u8>>,
}

/// Convert raw buffer bytes. Compressed formats also keep a copy of the
/// payload, even when decoding fails.
fn decode_buffer(bytes: &[u8], format: &Format, decode: bool) -> Decoded {
    let compressed = format.fourcc.is_compressed();
    let payload = compressed.then(|| bytes.to_vec());
    let frame = if decode || !compressed {
        convert_frame_to_bgr(bytes, format.width, format.height, format.fourcc)
    } else {
        Ok(Frame {
            data: Vec::new(),
            width: format.width,
            height: format.height,
            timestamp_us: 0,
            sequence: 0,
        })
    };
    Decoded { frame, payload }
}

/// Refresh the compressed cache from this capture, then stamp the frame or
/// surface its conversion error.
fn finish_capture(
    decoded: Decoded,
    dequeued: &Dequeued,
    timestamp_us: i64,
    cache: &mut Option<CompressedFrame>,
) -> Result<Frame> {
    *cache = decoded
        .payload
        .map(|data| CompressedFrame { data, timestamp_us });
    let mut frame = decoded.frame?;
    frame.timestamp_us = timestamp_us;
    frame.sequence = dequeued.sequence;
    Ok(frame)
}

/// Request the configured size and codec and read back what was granted.
fn negotiate_format(device: &Device, settings: &CameraSettings) -> Result<Format> {
    let mut fmt = device.format().map_err(CameraError::Format)?;
    fmt.width = settings.width;
    fmt.height = settings.height;
    fmt.fourcc = settings.codec.fourcc().into();

    let granted = Format::from(device.set_format(&fmt).map_err(CameraError::Format)?);
    if granted.fourcc != settings.codec.fourcc() {
        warn!(
            requested = %settings.codec.fourcc(),
            granted = %granted.fourcc,
            "driver substituted pixel format"
        );
    }
    if (granted.width, granted.height) != (settings.width, settings.height) {
        info!(
            requested_width = settings.width,
            requested_height = settings.height,
            width = granted.width,
            height = granted.height,
            "driver adjusted frame size"
        );
    }
    Ok(granted)
}

fn discover_controls(device: &Device) -> HashMap<u32, ControlInfo> {
    // The v4l crate panics on control types it does not know.
    let descriptions = match panic::catch_unwind(AssertUnwindSafe(|| device.query_controls())) {
        Ok(Ok(descriptions)) => descriptions,
        Ok(Err(err)) => {
            warn!(error = %err, "control query failed");
            return HashMap::new();
        }
        Err(_) => {
            warn!("control query hit an unknown control type");
            return HashMap::new();
        }
    };
    descriptions.iter().filter_map(control_info).collect()
}

fn control_info(desc: &Description) -> Option<(u32, ControlInfo)> {
    let kind = match desc.typ {
        ControlType::Integer => ControlKind::Integer,
        ControlType::Boolean => ControlKind::Boolean,
        ControlType::Menu | ControlType::IntegerMenu => ControlKind::Menu,
        _ => return None,
    };
    let range = ControlRange::new(desc.minimum, desc.maximum);
    Some((desc.id, ControlInfo { range, kind }))
}
