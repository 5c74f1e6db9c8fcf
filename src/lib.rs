//! Pi-Cam-Tuner: V4L2 camera capture with automatic exposure, gain and
//! white-balance tuning.
//!
//! Every frame source implements [`VideoSource`], a capability-queryable
//! control surface. [`V4l2CameraSource`] is the hardware backend;
//! [`CameraTuner`] drives any capable source to usable settings using
//! measured framerate and classifier feedback.

pub mod buffers;
pub mod clock;
pub mod config;
pub mod control;
pub mod convert;
pub mod device;
pub mod feedback;
pub mod traits;
pub mod transform;
pub mod tuner;
pub mod validation;

#[cfg(test)]
pub mod mock;

pub use config::{CameraSettings, CaptureCodec, ConfigError, Settings, TunerSettings};
pub use device::V4l2CameraSource;
pub use feedback::StatusCode;
pub use traits::{
    share, CameraError, Capability, CompressedFrame, DeviceCapabilities, Format, FourCC, Frame,
    SharedSource, VideoSource,
};
pub use transform::InputTransformMode;
pub use tuner::{CameraTuner, TunerError, TuningStage};
