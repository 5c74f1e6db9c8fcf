//! Status codes produced by the downstream image-quality classifier.

/// Classifier verdict for one frame.
///
/// The tuner acts on [`StatusCode::ImageTooDark`], [`StatusCode::ImageTooBright`]
/// and [`StatusCode::Ok`]; every other code means "no action this frame".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Brightness is acceptable.
    Ok,
    /// The image is underexposed.
    ImageTooDark,
    /// The image is overexposed.
    ImageTooBright,
    /// The classifier found nothing to judge.
    NoFaceFound,
    /// The classifier has not run yet.
    ProcessingNotStarted,
    /// Any other classifier code.
    Other(u32),
}

impl StatusCode {
    /// Raw classifier code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::ImageTooDark => 1,
            Self::ImageTooBright => 2,
            Self::NoFaceFound => 3,
            Self::ProcessingNotStarted => 4,
            Self::Other(code) => code,
        }
    }
}

impl From<u32> for StatusCode {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::ImageTooDark,
            2 => Self::ImageTooBright,
            3 => Self::NoFaceFound,
            4 => Self::ProcessingNotStarted,
            other => Self::Other(other),
        }
    }
}

impl From<StatusCode> for u32 {
    fn from(status: StatusCode) -> Self {
        status.code()
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::ImageTooDark => f.write_str("IMAGE_TOO_DARK"),
            Self::ImageTooBright => f.write_str("IMAGE_TOO_BRIGHT"),
            Self::NoFaceFound => f.write_str("NO_FACE_FOUND"),
            Self::ProcessingNotStarted => f.write_str("PROCESSING_NOT_STARTED"),
            Self::Other(code) => write!(f, "STATUS_{code}"),
        }
    }
}
