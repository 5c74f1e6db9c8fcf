//! Automatic camera tuning.
//!
//! [`CameraTuner`] drives a shared [`VideoSource`] through a fixed sequence
//! of stages, one [`CameraTuner::process_frame`] call per captured frame:
//!
//! 1. `AutoWhiteBalance` (only when the source has white-balance controls):
//!    let the camera's auto white balance run for a number of frames, then
//!    lock the value it settled on.
//! 2. `ExposureSearch`: starting from a long exposure, step exposure down
//!    until the measured framerate reaches the target or the floor is hit.
//! 3. `GainSearch`: step gain up or down following the brightness verdict of
//!    an external classifier until it reports OK or a bound is hit.
//!
//! Each search stage is a fixed-step walk bounded by an iteration cap, not
//! a bisection. Every control change restarts a settle window during which
//! no further decision is made.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, TunerSettings};
use crate::feedback::StatusCode;
use crate::traits::{CameraError, Capability, Frame, SharedSource, VideoSource};

/// Values closer than this to a bound are treated as on the bound.
const BOUND_EPSILON: f64 = 1e-9;

/// Stage of the tuning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TuningStage {
    /// Tuning has not been started.
    NotStarted,
    /// Letting auto white balance settle before locking it.
    AutoWhiteBalance,
    /// Reducing exposure until the framerate target is met.
    ExposureSearch,
    /// Adjusting gain from classifier feedback.
    GainSearch,
    /// Tuning finished; tuned values are authoritative.
    Complete,
    /// A safety bound was exceeded or a control write failed.
    Failed,
}

impl TuningStage {
    /// Whether frames still need to be fed to the tuner.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::AutoWhiteBalance | Self::ExposureSearch | Self::GainSearch
        )
    }
}

/// Errors raised by the tuner.
#[derive(Debug, Error)]
pub enum TunerError {
    /// The video source lacks a control the tuner requires.
    #[error("video source does not support {0} control")]
    MissingCapability(Capability),

    /// Settings failed validation.
    #[error("invalid tuner settings: {0}")]
    InvalidSettings(#[from] ConfigError),

    /// No video source has been set.
    #[error("no video source set")]
    NoVideoSource,

    /// The operation is not allowed in the current stage.
    #[error("cannot {action} while in stage {stage:?}")]
    InvalidStage {
        /// What was attempted.
        action: &'static str,
        /// Stage at the time.
        stage: TuningStage,
    },

    /// A tuned value was requested before its stage converged.
    #[error("tuned {0} is not available")]
    NotAvailable(&'static str),

    /// Frame timestamps went backwards.
    #[error("frame timestamp {timestamp_us} precedes previous {previous_us}")]
    NonMonotonicTimestamp {
        /// Rejected timestamp.
        timestamp_us: i64,
        /// Last accepted timestamp.
        previous_us: i64,
    },

    /// The video source is borrowed elsewhere.
    #[error("video source is already borrowed")]
    SourceBorrowed,

    /// A control operation on the source failed.
    #[error("video source error: {0}")]
    Source(#[from] CameraError),
}

/// Result type for tuner operations.
pub type Result<T> = std::result::Result<T, TunerError>;

/// Drives exposure, gain and white balance of a video source to usable values.
pub struct CameraTuner {
    settings: TunerSettings,
    source: Option<SharedSource>,
    stage: TuningStage,
    supports_white_balance: bool,

    wb_frame_count: u32,
    locked_white_balance: Option<f64>,

    current_exposure: f64,
    exposure_iterations: u32,
    exposure_settle_count: u32,
    last_frame_timestamp: Option<i64>,
    current_framerate: Option<f64>,

    current_gain: f64,
    gain_iterations: u32,
    gain_settle_count: u32,
}

impl CameraTuner {
    /// Create a tuner after validating its settings.
    pub fn new(settings: TunerSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            current_exposure: settings.initial_exposure,
            current_gain: settings.initial_gain,
            settings,
            source: None,
            stage: TuningStage::NotStarted,
            supports_white_balance: false,
            wb_frame_count: 0,
            locked_white_balance: None,
            exposure_iterations: 0,
            exposure_settle_count: 0,
            last_frame_timestamp: None,
            current_framerate: None,
            gain_iterations: 0,
            gain_settle_count: 0,
        })
    }

    /// Attach the source to tune.
    ///
    /// The source must support exposure and gain; white balance is
    /// optional. A rejected source leaves the tuner unchanged.
    pub fn set_video_source(&mut self, source: SharedSource) -> Result<()> {
        if self.is_tuning() {
            return Err(TunerError::InvalidStage {
                action: "replace the video source",
                stage: self.stage,
            });
        }
        let supports_white_balance = {
            let borrowed = source.try_borrow().map_err(|_| TunerError::SourceBorrowed)?;
            if !borrowed.supports_exposure_controls() {
                return Err(TunerError::MissingCapability(Capability::Exposure));
            }
            if !borrowed.supports_gain_control() {
                return Err(TunerError::MissingCapability(Capability::Gain));
            }
            borrowed.supports_white_balance_controls()
        };

        self.reset_progress();
        self.source = Some(source);
        self.supports_white_balance = supports_white_balance;
        self.stage = TuningStage::NotStarted;
        debug!(supports_white_balance, "video source attached");
        Ok(())
    }

    /// The attached source, for frame capture while tuning runs.
    #[must_use]
    pub fn video_source(&self) -> Option<SharedSource> {
        self.source.clone()
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &TunerSettings {
        &self.settings
    }

    /// Begin tuning from scratch. Allowed in any stage.
    pub fn start_tuning(&mut self) -> Result<()> {
        if self.source.is_none() {
            return Err(TunerError::NoVideoSource);
        }
        self.reset_progress();
        info!(
            white_balance = self.supports_white_balance,
            "camera tuning started"
        );

        let entered = if self.supports_white_balance {
            self.enter_auto_white_balance()
        } else {
            self.enter_exposure_search()
        };
        entered.map_err(|err| self.fail(err))
    }

    /// Whether tuning is in progress.
    #[must_use]
    pub const fn is_tuning(&self) -> bool {
        self.stage.is_active()
    }

    /// Current stage.
    #[must_use]
    pub const fn current_stage(&self) -> TuningStage {
        self.stage
    }

    /// Advance the state machine by one frame.
    ///
    /// `status` is the classifier verdict for the frame and `timestamp_us`
    /// its capture time. Outside an active stage this is a no-op. A control
    /// failure moves the tuner to [`TuningStage::Failed`] and is returned.
    pub fn process_frame(&mut self, status: StatusCode, timestamp_us: i64) -> Result<()> {
        if !self.is_tuning() {
            return Ok(());
        }

        let framerate = self.measure_framerate(timestamp_us)?;
        let result = match self.stage {
            TuningStage::AutoWhiteBalance => self.step_auto_white_balance(),
            TuningStage::ExposureSearch => self.step_exposure_search(framerate),
            TuningStage::GainSearch => self.step_gain_search(status),
            TuningStage::NotStarted | TuningStage::Complete | TuningStage::Failed => Ok(()),
        };
        result.map_err(|err| self.fail(err))
    }

    /// Tuned exposure, once the exposure search has converged.
    pub fn tuned_exposure(&self) -> Result<f64> {
        match self.stage {
            TuningStage::GainSearch | TuningStage::Complete => Ok(self.current_exposure),
            _ => Err(TunerError::NotAvailable("exposure")),
        }
    }

    /// Tuned gain, once tuning has completed.
    pub fn tuned_gain(&self) -> Result<f64> {
        match self.stage {
            TuningStage::Complete => Ok(self.current_gain),
            _ => Err(TunerError::NotAvailable("gain")),
        }
    }

    /// Locked white balance, once auto white balance has been locked.
    pub fn tuned_white_balance(&self) -> Result<f64> {
        match (self.stage, self.locked_white_balance) {
            (TuningStage::Failed, _) | (_, None) => Err(TunerError::NotAvailable("white balance")),
            (_, Some(value)) => Ok(value),
        }
    }

    /// The white balance captured at the end of the auto stage, if any,
    /// regardless of later failures.
    #[must_use]
    pub const fn locked_white_balance(&self) -> Option<f64> {
        self.locked_white_balance
    }

    /// Most recent framerate sample in frames per second.
    #[must_use]
    pub const fn current_framerate(&self) -> Option<f64> {
        self.current_framerate
    }

    /// Exposure changes made so far.
    #[must_use]
    pub const fn exposure_iterations(&self) -> u32 {
        self.exposure_iterations
    }

    /// Gain changes made so far.
    #[must_use]
    pub const fn gain_iterations(&self) -> u32 {
        self.gain_iterations
    }

    /// Overall progress in [0.0, 1.0], for display.
    #[must_use]
    pub fn progress(&self) -> f64 {
        fn fraction(done: u32, total: u32) -> f64 {
            if total == 0 {
                1.0
            } else {
                (f64::from(done) / f64::from(total)).min(1.0)
            }
        }
        let third = 1.0 / 3.0;
        match self.stage {
            TuningStage::NotStarted => 0.0,
            TuningStage::AutoWhiteBalance => {
                third * fraction(self.wb_frame_count, self.settings.auto_wb_frame_count)
            }
            TuningStage::ExposureSearch => third.mul_add(
                fraction(self.exposure_iterations, self.settings.max_exposure_iterations),
                third,
            ),
            TuningStage::GainSearch => third.mul_add(
                fraction(self.gain_iterations, self.settings.max_gain_iterations),
                2.0 * third,
            ),
            TuningStage::Complete | TuningStage::Failed => 1.0,
        }
    }

    /// Return a copy of `frame` with a calibration overlay while tuning.
    ///
    /// Only draws when tuning is active and `render_calibrating_overlay` is
    /// set; otherwise the copy is untouched. Never changes tuner state.
    #[must_use]
    pub fn process_frame_for_display(&self, frame: &Frame) -> Frame {
        let mut out = frame.clone();
        if !self.is_tuning() || !self.settings.render_calibrating_overlay {
            return out;
        }
        render_overlay(&mut out, self.progress());
        out
    }

    // == stage transitions

    fn reset_progress(&mut self) {
        self.wb_frame_count = 0;
        self.locked_white_balance = None;
        self.current_exposure = self.settings.initial_exposure;
        self.exposure_iterations = 0;
        self.exposure_settle_count = 0;
        self.last_frame_timestamp = None;
        self.current_framerate = None;
        self.current_gain = self.settings.initial_gain;
        self.gain_iterations = 0;
        self.gain_settle_count = 0;
    }

    fn transition(&mut self, stage: TuningStage) {
        info!(from = ?self.stage, to = ?stage, "tuning stage changed");
        self.stage = stage;
    }

    fn fail(&mut self, err: TunerError) -> TunerError {
        warn!(stage = ?self.stage, error = %err, "camera tuning failed");
        self.stage = TuningStage::Failed;
        err
    }

    fn give_up(&mut self, reason: &'static str) {
        warn!(stage = ?self.stage, reason, "camera tuning gave up");
        self.stage = TuningStage::Failed;
    }

    fn enter_auto_white_balance(&mut self) -> Result<()> {
        self.with_source(|source| {
            ignore_unsupported(source.turn_on_auto_exposure())?;
            source.turn_on_auto_white_balance()
        })?;
        self.wb_frame_count = 0;
        self.transition(TuningStage::AutoWhiteBalance);
        Ok(())
    }

    fn enter_exposure_search(&mut self) -> Result<()> {
        let exposure = self.settings.initial_exposure;
        let gain = self.settings.initial_gain;
        self.with_source(|source| {
            ignore_unsupported(source.turn_off_auto_exposure())?;
            source.set_exposure(exposure)?;
            source.set_gain(gain)?;
            best_effort_interval(source.reset_frame_interval())
        })?;
        self.current_exposure = exposure;
        self.current_gain = gain;
        self.exposure_settle_count = 0;
        self.transition(TuningStage::ExposureSearch);
        Ok(())
    }

    fn enter_gain_search(&mut self) {
        self.gain_settle_count = 0;
        self.transition(TuningStage::GainSearch);
    }

    // == per-frame steps

    /// Record the timestamp and return the instantaneous framerate, if any.
    fn measure_framerate(&mut self, timestamp_us: i64) -> Result<Option<f64>> {
        let sample = match self.last_frame_timestamp {
            Some(previous_us) if timestamp_us < previous_us => {
                return Err(TunerError::NonMonotonicTimestamp {
                    timestamp_us,
                    previous_us,
                });
            }
            Some(previous_us) if timestamp_us > previous_us => {
                #[allow(clippy::cast_precision_loss)]
                let dt = (timestamp_us - previous_us) as f64;
                Some(1_000_000.0 / dt)
            }
            _ => None,
        };
        self.last_frame_timestamp = Some(timestamp_us);
        if sample.is_some() {
            self.current_framerate = sample;
        }
        Ok(sample)
    }

    fn step_auto_white_balance(&mut self) -> Result<()> {
        self.wb_frame_count += 1;
        if self.wb_frame_count < self.settings.auto_wb_frame_count {
            return Ok(());
        }

        let locked = self.with_source(|source| {
            let value = source.white_balance()?;
            source.turn_off_auto_white_balance()?;
            source.set_white_balance(value)?;
            Ok(value)
        })?;
        info!(white_balance = locked, frames = self.wb_frame_count, "white balance locked");
        self.locked_white_balance = Some(locked);
        self.enter_exposure_search()
    }

    fn step_exposure_search(&mut self, framerate: Option<f64>) -> Result<()> {
        if self.exposure_settle_count < self.settings.exposure_settle_frames {
            self.exposure_settle_count += 1;
            return Ok(());
        }
        let Some(fps) = framerate else {
            return Ok(());
        };

        let min_exposure = self.settings.min_exposure;
        if fps >= self.settings.min_acceptable_framerate {
            info!(exposure = self.current_exposure, fps, "exposure converged on framerate");
            self.enter_gain_search();
            return Ok(());
        }
        if self.current_exposure <= min_exposure + BOUND_EPSILON {
            info!(exposure = self.current_exposure, fps, "exposure already at floor");
            self.enter_gain_search();
            return Ok(());
        }
        if self.exposure_iterations >= self.settings.max_exposure_iterations {
            self.give_up("exposure iteration limit reached");
            return Ok(());
        }

        let mut next = (self.current_exposure - self.settings.exposure_step).max(min_exposure);
        if next - min_exposure < BOUND_EPSILON {
            next = min_exposure;
        }
        self.with_source(|source| source.set_exposure(next))?;
        self.current_exposure = next;
        self.exposure_iterations += 1;
        self.exposure_settle_count = 0;
        debug!(
            exposure = next,
            fps,
            iteration = self.exposure_iterations,
            "exposure reduced"
        );

        if next <= min_exposure {
            info!(exposure = next, "exposure reached floor");
            self.enter_gain_search();
        }
        Ok(())
    }

    fn step_gain_search(&mut self, status: StatusCode) -> Result<()> {
        if self.gain_settle_count < self.settings.gain_settle_frames {
            self.gain_settle_count += 1;
            return Ok(());
        }

        let max_gain = self.settings.max_acceptable_gain;
        let target = match status {
            StatusCode::Ok => {
                info!(gain = self.current_gain, "gain converged");
                self.transition(TuningStage::Complete);
                return Ok(());
            }
            StatusCode::ImageTooDark => {
                if self.current_gain >= max_gain - BOUND_EPSILON {
                    info!(gain = self.current_gain, "gain at ceiling");
                    self.transition(TuningStage::Complete);
                    return Ok(());
                }
                let next = (self.current_gain + self.settings.gain_step).min(max_gain);
                if max_gain - next < BOUND_EPSILON {
                    max_gain
                } else {
                    next
                }
            }
            StatusCode::ImageTooBright => {
                if self.current_gain <= BOUND_EPSILON {
                    info!(gain = self.current_gain, "gain at floor");
                    self.transition(TuningStage::Complete);
                    return Ok(());
                }
                let next = (self.current_gain - self.settings.gain_step).max(0.0);
                if next < BOUND_EPSILON {
                    0.0
                } else {
                    next
                }
            }
            StatusCode::NoFaceFound | StatusCode::ProcessingNotStarted | StatusCode::Other(_) => {
                return Ok(());
            }
        };

        if self.gain_iterations >= self.settings.max_gain_iterations {
            self.give_up("gain iteration limit reached");
            return Ok(());
        }

        self.with_source(|source| source.set_gain(target))?;
        self.current_gain = target;
        self.gain_iterations += 1;
        self.gain_settle_count = 0;
        debug!(
            gain = target,
            %status,
            iteration = self.gain_iterations,
            "gain adjusted"
        );

        if target >= max_gain || target <= 0.0 {
            info!(gain = target, "gain reached bound");
            self.transition(TuningStage::Complete);
        }
        Ok(())
    }

    fn with_source<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut dyn VideoSource) -> crate::traits::Result<T>,
    {
        let source = self.source.as_ref().ok_or(TunerError::NoVideoSource)?;
        let mut source = source
            .try_borrow_mut()
            .map_err(|_| TunerError::SourceBorrowed)?;
        Ok(op(&mut *source)?)
    }
}

fn ignore_unsupported(result: crate::traits::Result<()>) -> crate::traits::Result<()> {
    match result {
        Err(CameraError::Unsupported(capability)) => {
            debug!(%capability, "optional control not supported");
            Ok(())
        }
        other => other,
    }
}

/// Frame interval renegotiation failures are logged and skipped; the
/// search runs at whatever rate the driver keeps.
fn best_effort_interval(result: crate::traits::Result<()>) -> crate::traits::Result<()> {
    match result {
        Err(CameraError::FrameInterval(err)) => {
            warn!(error = %err, "frame interval reset failed, continuing");
            Ok(())
        }
        other => ignore_unsupported(other),
    }
}

/// Dim the middle third of the frame and draw a progress bar along its
/// lower edge.
fn render_overlay(frame: &mut Frame, progress: f64) {
    let (width, height) = (frame.width as usize, frame.height as usize);
    if width == 0 || height == 0 {
        return;
    }
    let band_top = height / 3;
    let band_bottom = (height * 2 / 3).max(band_top + 1).min(height);
    let bar_height = (height / 40).max(2).min(band_bottom - band_top);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    let bar_width = (progress.clamp(0.0, 1.0) * width as f64).round() as usize;
    let row_bytes = width * 3;

    for (y, row) in frame
        .data
        .chunks_exact_mut(row_bytes)
        .enumerate()
        .take(band_bottom)
        .skip(band_top)
    {
        let in_bar = y >= band_bottom - bar_height;
        for (x, px) in row.chunks_exact_mut(3).enumerate() {
            if in_bar && x < bar_width {
                px.fill(255);
            } else {
                for channel in px.iter_mut() {
                    *channel /= 2;
                }
            }
        }
    }
}
