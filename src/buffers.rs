//! Capture buffer ring on top of the v4l mmap stream.
//!
//! The driver owns every buffer except the one most recently dequeued.
//! That buffer goes back to the driver at the start of the next dequeue,
//! whatever the caller did with its bytes, so a failed conversion never
//! leaks a slot. The stream holds a reference-counted device handle and
//! dropping it turns streaming off, unmaps and frees the buffers.

use tracing::{debug, warn};
use v4l::buffer::{Metadata, Type};
use v4l::io::mmap::Stream;
use v4l::io::traits::{CaptureStream, Stream as _};
use v4l::Device;

use crate::traits::{CameraError, Result};

/// Metadata of a buffer the driver just filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    /// Bytes of valid payload.
    pub bytes_used: usize,
    /// Driver frame sequence number.
    pub sequence: u32,
    /// Driver timestamp in microseconds (`CLOCK_MONOTONIC` domain).
    pub timestamp_us: i64,
    /// Raw `V4L2_BUF_FLAG_*` bits.
    pub flags: u32,
}

impl Dequeued {
    /// Read driver metadata for a buffer mapped with `mapped_len` bytes.
    ///
    /// Drivers that leave `bytesused` at zero filled the whole buffer.
    #[must_use]
    pub fn from_metadata(meta: &Metadata, mapped_len: usize) -> Self {
        let bytes_used = match meta.bytesused as usize {
            0 => mapped_len,
            n => n.min(mapped_len),
        };
        #[allow(clippy::unnecessary_cast)]
        let timestamp_us = meta.timestamp.sec as i64 * 1_000_000 + meta.timestamp.usec as i64;
        Self {
            bytes_used,
            sequence: meta.sequence,
            timestamp_us,
            flags: meta.flags.into(),
        }
    }
}

/// Mmap'd capture buffers bound to one device.
pub struct BufferRing {
    stream: Stream<'static>,
    active: bool,
}

impl BufferRing {
    /// Allocate and map `count` driver buffers. The driver may grant fewer.
    ///
    /// The stream is turned on by the first [`BufferRing::dequeue`], which
    /// queues every buffer beforehand.
    pub fn request(device: &Device, count: u32) -> Result<Self> {
        let stream = Stream::with_buffers(device, Type::VideoCapture, count)
            .map_err(CameraError::BufferRequest)?;
        debug!(requested = count, "capture buffers mapped");
        Ok(Self {
            stream,
            active: false,
        })
    }

    /// Whether the driver has the stream on.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Hand the previous buffer back and block until the next one is filled.
    ///
    /// The returned bytes stay valid until the next call.
    pub fn dequeue(&mut self) -> Result<(&[u8], Dequeued)> {
        let (bytes, meta) =
            CaptureStream::next(&mut self.stream).map_err(CameraError::BufferDequeue)?;
        self.active = true;
        let dequeued = Dequeued::from_metadata(meta, bytes.len());
        let payload = bytes.get(..dequeued.bytes_used).unwrap_or(bytes);
        Ok((payload, dequeued))
    }

    /// Turn the stream off. Every buffer returns to userspace and the next
    /// dequeue queues them all again. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.stream
            .stop()
            .map_err(|source| CameraError::Stream { action: "off", source })?;
        self.active = false;
        Ok(())
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to stop stream while releasing buffers");
        }
        debug!("capture buffers released");
    }
}
