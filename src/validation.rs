//! Frame validation utilities for test pattern verification.
//!
//! These checks work on decoded BGR frames and are used both against the
//! mock source and against virtual cameras in integration tests.

use thiserror::Error;

use crate::traits::Frame;

/// Expected RGB values for SMPTE color bars (8 bars).
///
/// These are the RGB values resulting from converting the YUV values
/// used by the test pattern generators.
///
/// Colors in order: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black
const SMPTE_COLOR_BARS: [(u8, u8, u8); 8] = [
    (235, 235, 235), // White
    (235, 235, 11),  // Yellow
    (12, 236, 237),  // Cyan
    (13, 237, 13),   // Green
    (237, 13, 237),  // Magenta
    (238, 14, 13),   // Red
    (15, 15, 239),   // Blue
    (16, 16, 16),    // Black
];

/// Tolerance for RGB color matching (accounts for YUV->RGB conversion errors).
const COLOR_TOLERANCE: u32 = 15;

/// Minimum left-to-right luminance rise for a frame to count as a gradient.
const MIN_GRADIENT_RISE: f64 = 50.0;

/// Why a frame or frame sequence failed validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A sample position lies outside the frame.
    #[error("pixel ({x}, {y}) is outside the frame")]
    PixelOutOfBounds {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },

    /// A color bar has the wrong color.
    #[error("color bar {bar} mismatch at ({x}, {y}): expected RGB{expected:?}, got RGB{actual:?}")]
    ColorMismatch {
        /// Bar index, left to right.
        bar: usize,
        /// Sampled column.
        x: u32,
        /// Sampled row.
        y: u32,
        /// Expected `(r, g, b)`.
        expected: (u8, u8, u8),
        /// Observed `(r, g, b)`.
        actual: (u8, u8, u8),
    },

    /// Luminance fell while moving right.
    #[error("gradient not monotonically increasing at x={x}: luminance {luminance} < previous {previous}")]
    GradientReversal {
        /// Column where the drop was seen.
        x: u32,
        /// Luminance there.
        luminance: f64,
        /// Luminance at the previous sample.
        previous: f64,
    },

    /// Luminance barely changed across the frame.
    #[error("insufficient luminance change for gradient: {0} (expected at least 50)")]
    FlatGradient(f64),

    /// No frames were given.
    #[error("cannot validate an empty frame sequence")]
    EmptySequence,

    /// Sequence numbers skipped or repeated.
    #[error("frame sequence gap at index {index}: expected {expected}, got {actual}")]
    SequenceGap {
        /// Position in the slice.
        index: usize,
        /// Expected sequence number.
        expected: u32,
        /// Observed sequence number.
        actual: u32,
    },

    /// Timestamps went backwards or stood still.
    #[error("timestamp at index {index} is {actual}, not after previous {previous}")]
    TimestampNotIncreasing {
        /// Position in the slice.
        index: usize,
        /// Previous timestamp in microseconds.
        previous: i64,
        /// Offending timestamp in microseconds.
        actual: i64,
    },
}

/// Result type for validation checks.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Validates that a frame contains the SMPTE color bar pattern.
///
/// This function checks 8 vertical stripes at their center positions,
/// verifying that each stripe contains the expected color with a tolerance
/// for YUV-to-RGB conversion inaccuracies.
///
/// # Errors
///
/// Returns an error if any color bar doesn't match the expected color
/// within tolerance.
pub fn validate_color_bars(frame: &Frame) -> Result<()> {
    let bar_width = frame.width / 8;
    let center_y = frame.height / 2;

    for (bar, expected) in SMPTE_COLOR_BARS.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let x = (bar as u32 * bar_width) + (bar_width / 2);
        let actual = sample(frame, x, center_y)?;

        if !colors_match(actual, *expected, COLOR_TOLERANCE) {
            return Err(ValidationError::ColorMismatch {
                bar,
                x,
                y: center_y,
                expected: *expected,
                actual,
            });
        }
    }

    Ok(())
}

/// Validates that a frame contains a horizontal gradient pattern.
///
/// Samples the center row every 10 pixels and checks that luminance never
/// drops by more than rounding noise and rises by a meaningful amount
/// overall.
///
/// # Errors
///
/// Returns an error if the luminance decreases or the total change is too
/// small (solid color).
pub fn validate_gradient(frame: &Frame) -> Result<()> {
    let center_y = frame.height / 2;
    let mut first: Option<f64> = None;
    let mut previous: Option<f64> = None;

    for x in (0..frame.width).step_by(10) {
        let luminance = luma(sample(frame, x, center_y)?);
        first.get_or_insert(luminance);

        if let Some(previous) = previous {
            // Allow small decreases due to rounding
            if luminance < previous - 1.0 {
                return Err(ValidationError::GradientReversal {
                    x,
                    luminance,
                    previous,
                });
            }
        }
        previous = Some(luminance);
    }

    if let (Some(first), Some(last)) = (first, previous) {
        let change = last - first;
        if change < MIN_GRADIENT_RISE {
            return Err(ValidationError::FlatGradient(change));
        }
    }

    Ok(())
}

/// Validates that frame sequence numbers increment by exactly one.
///
/// # Errors
///
/// Returns an error for an empty slice or any gap.
pub fn validate_frame_sequence(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() {
        return Err(ValidationError::EmptySequence);
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.sequence.wrapping_add(1);
            if curr.sequence != expected {
                return Err(ValidationError::SequenceGap {
                    index: index + 1,
                    expected,
                    actual: curr.sequence,
                });
            }
        }
    }

    Ok(())
}

/// Validates that frame timestamps strictly increase.
///
/// # Errors
///
/// Returns an error for an empty slice or a timestamp not after its
/// predecessor.
pub fn validate_frame_timestamps(frames: &[Frame]) -> Result<()> {
    if frames.is_empty() {
        return Err(ValidationError::EmptySequence);
    }

    for (index, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            if curr.timestamp_us <= prev.timestamp_us {
                return Err(ValidationError::TimestampNotIncreasing {
                    index: index + 1,
                    previous: prev.timestamp_us,
                    actual: curr.timestamp_us,
                });
            }
        }
    }

    Ok(())
}

/// Average framerate over a run of frames, from first to last timestamp.
#[must_use]
pub fn measured_framerate(frames: &[Frame]) -> Option<f64> {
    let (first, last) = (frames.first()?, frames.last()?);
    let span = last.timestamp_us - first.timestamp_us;
    if span <= 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let fps = (frames.len() - 1) as f64 * 1_000_000.0 / span as f64;
    Some(fps)
}

fn sample(frame: &Frame, x: u32, y: u32) -> Result<(u8, u8, u8)> {
    frame
        .pixel_at(x, y)
        .ok_or(ValidationError::PixelOutOfBounds { x, y })
}

/// Rec. 601 luma of an RGB triple.
fn luma((r, g, b): (u8, u8, u8)) -> f64 {
    0.114f64.mul_add(
        f64::from(b),
        0.587f64.mul_add(f64::from(g), 0.299 * f64::from(r)),
    )
}

/// Helper function to check if two RGB colors match within a tolerance.
fn colors_match(actual: (u8, u8, u8), expected: (u8, u8, u8), tolerance: u32) -> bool {
    let (ar, ag, ab) = actual;
    let (er, eg, eb) = expected;

    u32::from(ar.abs_diff(er)) <= tolerance
        && u32::from(ag.abs_diff(eg)) <= tolerance
        && u32::from(ab.abs_diff(eb)) <= tolerance
}
