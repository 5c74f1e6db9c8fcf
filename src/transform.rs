//! Generic input transform applied after a source produces a frame.

use serde::{Deserialize, Serialize};

use crate::traits::Frame;

/// Orientation fixup applied to every frame a source hands out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputTransformMode {
    /// Pass frames through untouched.
    #[default]
    None,
    /// Rotate 90 degrees clockwise.
    Clockwise90,
    /// Rotate 90 degrees counterclockwise.
    Counterclockwise90,
    /// Rotate 180 degrees.
    Rotate180,
    /// Mirror left-right.
    MirrorHorizontal,
    /// Mirror top-bottom.
    MirrorVertical,
}

impl InputTransformMode {
    /// Apply the transform, consuming the frame.
    #[must_use]
    pub fn apply(self, frame: Frame) -> Frame {
        if self == Self::None {
            return frame;
        }

        let (w, h) = (frame.width, frame.height);
        let (out_w, out_h) = match self {
            Self::Clockwise90 | Self::Counterclockwise90 => (h, w),
            _ => (w, h),
        };

        let mut data = vec![0u8; frame.data.len()];
        for y in 0..h {
            for x in 0..w {
                let (dx, dy) = match self {
                    Self::None => (x, y),
                    Self::Clockwise90 => (h - 1 - y, x),
                    Self::Counterclockwise90 => (y, w - 1 - x),
                    Self::Rotate180 => (w - 1 - x, h - 1 - y),
                    Self::MirrorHorizontal => (w - 1 - x, y),
                    Self::MirrorVertical => (x, h - 1 - y),
                };
                let src = ((y * w + x) * 3) as usize;
                let dst = ((dy * out_w + dx) * 3) as usize;
                if let (Some(from), Some(to)) =
                    (frame.data.get(src..src + 3), data.get_mut(dst..dst + 3))
                {
                    to.copy_from_slice(from);
                }
            }
        }

        Frame {
            data,
            width: out_w,
            height: out_h,
            ..frame
        }
    }
}
