//! Pi-cam-tuner binary: capture from a V4L2 camera and optionally auto-tune it.

use std::path::PathBuf;
use std::rc::Rc;

use clap::{Parser, ValueEnum};
use pi_cam_tuner::{
    share, CameraTuner, CaptureCodec, Settings, SharedSource, StatusCode, V4l2CameraSource,
    VideoSource,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Mean luma below which a frame is reported as too dark.
const DARK_LUMA: f64 = 90.0;
/// Mean luma above which a frame is reported as too bright.
const BRIGHT_LUMA: f64 = 170.0;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CodecArg {
    Mjpg,
    Yuyv,
}

impl From<CodecArg> for CaptureCodec {
    fn from(codec: CodecArg) -> Self {
        match codec {
            CodecArg::Mjpg => Self::Mjpg,
            CodecArg::Yuyv => Self::Yuyv,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "pi-cam-tuner")]
#[command(about = "V4L2 camera capture with automatic exposure, gain and white-balance tuning")]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera index (/dev/videoN)
    #[arg(short, long)]
    device: Option<u32>,

    /// Requested frame width
    #[arg(long)]
    width: Option<u32>,

    /// Requested frame height
    #[arg(long)]
    height: Option<u32>,

    /// Requested framerate
    #[arg(long)]
    fps: Option<u32>,

    /// Capture pixel format
    #[arg(long, value_enum)]
    codec: Option<CodecArg>,

    /// Number of frames to capture (0 = until interrupted)
    #[arg(short = 'n', long, default_value_t = 0)]
    frames: u64,

    /// Run the auto-tuner on the captured stream
    #[arg(short, long)]
    tune: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    if let Err(err) = run(&cli) {
        error!(error = %err, "pi-cam-tuner failed");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut settings = match &cli.config {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            Settings::load(path)?
        }
        None => Settings::default(),
    };
    apply_overrides(&mut settings, cli);
    settings.validate()?;

    let device = V4l2CameraSource::open(&settings.camera)?;
    let caps = device.capabilities().clone();
    let format = device.format().clone();
    info!(
        path = %device.path(),
        card = %caps.card,
        driver = %caps.driver,
        width = format.width,
        height = format.height,
        fourcc = %format.fourcc,
        "Camera opened"
    );

    let source = share(device);
    let tuner = if cli.tune || settings.tuning.enabled {
        let mut tuner = CameraTuner::new(settings.tuning.tuner.clone())?;
        tuner.set_video_source(Rc::clone(&source))?;
        tuner.start_tuning()?;
        info!(stage = ?tuner.current_stage(), "Tuning started");
        Some(tuner)
    } else {
        None
    };

    capture_loop(&source, tuner, cli.frames)
}

fn apply_overrides(settings: &mut Settings, cli: &Cli) {
    let camera = &mut settings.camera;
    if let Some(index) = cli.device {
        camera.device_index = index;
    }
    if let Some(width) = cli.width {
        camera.width = width;
    }
    if let Some(height) = cli.height {
        camera.height = height;
    }
    if let Some(fps) = cli.fps {
        camera.fps = fps;
    }
    if let Some(codec) = cli.codec {
        camera.codec = codec.into();
    }
    if cli.verbose {
        camera.log_verbose_controls = true;
    }
}

fn capture_loop(
    source: &SharedSource,
    mut tuner: Option<CameraTuner>,
    frame_limit: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut captured = 0u64;
    loop {
        if frame_limit > 0 && captured >= frame_limit {
            break;
        }

        let (frame, timestamp_us) = {
            let mut source = source.try_borrow_mut()?;
            let frame = source.next_frame()?;
            let timestamp_us = source.frame_timestamp().unwrap_or(frame.timestamp_us);
            (frame, timestamp_us)
        };
        captured += 1;

        let status = classify(frame.mean_luma());
        debug!(
            sequence = frame.sequence,
            timestamp_us,
            luma = frame.mean_luma(),
            status = %status,
            "Frame captured"
        );

        let finished = match tuner.as_mut() {
            Some(tuner) => {
                tuner.process_frame(status, timestamp_us)?;
                !tuner.is_tuning()
            }
            None => false,
        };
        if finished {
            if let Some(tuner) = tuner.take() {
                report(&tuner);
            }
        }
    }

    info!(frames = captured, "Capture finished");
    Ok(())
}

/// Stand-in for the downstream classifier: judges brightness by mean luma.
fn classify(luma: f64) -> StatusCode {
    if luma < DARK_LUMA {
        StatusCode::ImageTooDark
    } else if luma > BRIGHT_LUMA {
        StatusCode::ImageTooBright
    } else {
        StatusCode::Ok
    }
}

fn report(tuner: &CameraTuner) {
    match (tuner.tuned_exposure(), tuner.tuned_gain()) {
        (Ok(exposure), Ok(gain)) => info!(
            exposure,
            gain,
            white_balance = ?tuner.locked_white_balance(),
            framerate = ?tuner.current_framerate(),
            "Tuning complete"
        ),
        _ => warn!(
            stage = ?tuner.current_stage(),
            exposure_iterations = tuner.exposure_iterations(),
            gain_iterations = tuner.gain_iterations(),
            "Tuning did not converge"
        ),
    }
}
