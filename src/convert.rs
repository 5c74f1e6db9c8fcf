//! Pixel format conversion to interleaved BGR.

use image::ImageFormat;

use crate::traits::{CameraError, FourCC, Frame, Result};

/// Convert one captured buffer to a BGR [`Frame`].
///
/// The returned frame carries zero timestamp and sequence; the caller
/// stamps it. Formats outside the known set fail with
/// [`CameraError::UnsupportedPixelFormat`].
pub fn convert_frame_to_bgr(data: &[u8], width: u32, height: u32, fourcc: FourCC) -> Result<Frame> {
    let pixels = (width as usize) * (height as usize);
    let (data, width, height) = match &fourcc.0 {
        b"YUYV" => (packed_422_to_bgr(require(data, pixels * 2)?, Order::Yuyv), width, height),
        b"UYVY" => (packed_422_to_bgr(require(data, pixels * 2)?, Order::Uyvy), width, height),
        b"RGB3" => {
            let rgb = require(data, pixels * 3)?;
            let mut out = Vec::with_capacity(rgb.len());
            for px in rgb.chunks_exact(3) {
                if let [r, g, b] = px {
                    out.extend_from_slice(&[*b, *g, *r]);
                }
            }
            (out, width, height)
        }
        b"BGR3" => (require(data, pixels * 3)?.to_vec(), width, height),
        b"GREY" => {
            let grey = require(data, pixels)?;
            let mut out = Vec::with_capacity(grey.len() * 3);
            for &y in grey {
                out.extend_from_slice(&[y, y, y]);
            }
            (out, width, height)
        }
        b"MJPG" => decode_jpeg(data)?,
        _ => return Err(CameraError::UnsupportedPixelFormat(fourcc)),
    };

    Ok(Frame {
        data,
        width,
        height,
        timestamp_us: 0,
        sequence: 0,
    })
}

/// Slice off exactly `expected` bytes, failing on short payloads.
fn require(data: &[u8], expected: usize) -> Result<&[u8]> {
    data.get(..expected).ok_or(CameraError::FrameTooShort {
        expected,
        actual: data.len(),
    })
}

#[derive(Clone, Copy)]
enum Order {
    Yuyv,
    Uyvy,
}

/// Two pixels per 4-byte macropixel, sharing one U/V pair.
fn packed_422_to_bgr(data: &[u8], order: Order) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2 * 3);
    for macro_px in data.chunks_exact(4) {
        let (y0, u, y1, v) = match (order, macro_px) {
            (Order::Yuyv, [y0, u, y1, v]) | (Order::Uyvy, [u, y0, v, y1]) => (*y0, *u, *y1, *v),
            _ => continue,
        };
        let (r, g, b) = yuv_to_rgb(y0, u, v);
        out.extend_from_slice(&[b, g, r]);
        let (r, g, b) = yuv_to_rgb(y1, u, v);
        out.extend_from_slice(&[b, g, r]);
    }
    out
}

fn decode_jpeg(data: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let rgb = image::load_from_memory_with_format(data, ImageFormat::Jpeg)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut bgr = rgb.into_raw();
    for px in bgr.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
    Ok((bgr, width, height))
}

/// Convert YUV values to RGB.
///
/// Uses the ITU-R BT.601 conversion formula.
///
/// # Returns
///
/// RGB tuple with values clamped to 0-255 range.
#[must_use]
#[allow(clippy::many_single_char_names)]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    // ITU-R BT.601 conversion
    let y_f = f32::from(y);
    let u_f = f32::from(u) - 128.0;
    let v_f = f32::from(v) - 128.0;

    let r = 1.402f32.mul_add(v_f, y_f);
    let g = 0.714_14f32.mul_add(-v_f, 0.344_14f32.mul_add(-u_f, y_f));
    let b = 1.772f32.mul_add(u_f, y_f);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let clamp = |val: f32| -> u8 { val.round().clamp(0.0, 255.0) as u8 };

    (clamp(r), clamp(g), clamp(b))
}
