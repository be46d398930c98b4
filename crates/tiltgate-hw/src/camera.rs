//! V4L2 camera capture via the `v4l` crate.
//!
//! [`Camera::open`] negotiates the device; [`Camera::into_stream`] moves it
//! onto a capture thread so the pipeline can poll for frames without ever
//! blocking on the driver.

use crate::frame::{self, Frame};
use crate::source::{CaptureConstraints, FrameSource, SourceProvider};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Frames buffered between the capture thread and the consumer.
const FRAME_QUEUE_DEPTH: usize = 2;
const MMAP_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("frame stream closed")]
    SourceClosed,
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
    /// Motion JPEG, decoded per frame.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            b"MJPG" => Some(Self::Mjpeg),
            _ => None,
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device and negotiate a capture format at `width`×`height`.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV; drivers that only do GREY/Y16/MJPG answer with their own.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, Y16 or MJPG)"
            ))
        })?;

        if negotiated.width != width || negotiated.height != height {
            tracing::warn!(
                requested_width = width,
                requested_height = height,
                width = negotiated.width,
                height = negotiated.height,
                "driver adjusted capture size"
            );
        }
        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start streaming on a dedicated capture thread.
    ///
    /// Returns once the driver has accepted the stream, so a device that
    /// opens but refuses to stream fails here rather than on the first poll.
    pub fn into_stream(self) -> Result<CameraStream, CameraError> {
        let (frame_tx, frame_rx) = mpsc::sync_channel(FRAME_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let device_path = self.device_path.clone();

        let worker = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("tiltgate-capture".into())
                .spawn(move || capture_loop(self, frame_tx, ready_tx, stop))
                .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?
        };

        let mut stream = CameraStream::from_parts(frame_rx, stop, worker, device_path);
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => {
                stream.release();
                Err(e)
            }
            Err(_) => {
                stream.release();
                Err(CameraError::CaptureFailed("capture thread exited during startup".into()))
            }
        }
    }

    /// Convert one dequeued buffer to a grayscale frame.
    fn to_frame(&self, buf: &[u8], bytes_used: usize, sequence: u32) -> Result<Frame, CameraError> {
        let pixels = (self.width * self.height) as usize;
        let conversion = |e: frame::FrameError| CameraError::CaptureFailed(e.to_string());

        let (gray, width, height) = match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                (buf[..pixels].to_vec(), self.width, self.height)
            }
            PixelFormat::Y16 => (
                frame::y16_to_grayscale(buf, self.width, self.height).map_err(conversion)?,
                self.width,
                self.height,
            ),
            PixelFormat::Yuyv => (
                frame::yuyv_to_grayscale(buf, self.width, self.height).map_err(conversion)?,
                self.width,
                self.height,
            ),
            PixelFormat::Mjpeg => {
                let used = bytes_used.min(buf.len());
                frame::mjpeg_to_grayscale(&buf[..used]).map_err(conversion)?
            }
        };

        Ok(Frame::new(gray, width, height, sequence))
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

fn open_error(device_path: &str, e: io::Error) -> CameraError {
    if e.kind() == io::ErrorKind::PermissionDenied {
        CameraError::PermissionDenied(device_path.to_string())
    } else if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
        CameraError::DeviceBusy
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}

/// Body of the capture thread. Owns the camera; dropping it here stops the
/// stream and closes the device.
fn capture_loop(
    camera: Camera,
    frames: SyncSender<Frame>,
    ready: mpsc::Sender<Result<(), CameraError>>,
    stop: Arc<AtomicBool>,
) {
    let mut stream = match MmapStream::with_buffers(&camera.device, BufType::VideoCapture, MMAP_BUFFERS) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(CameraError::CaptureFailed(format!(
                "failed to create mmap stream: {e}"
            ))));
            return;
        }
    };
    let _ = ready.send(Ok(()));
    tracing::debug!(device = %camera.device_path, "capture thread started");

    while !stop.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(device = %camera.device_path, error = %e, "dequeue failed; closing stream");
                break;
            }
        };

        let frame = match camera.to_frame(buf, meta.bytesused as usize, meta.sequence) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(seq = meta.sequence, error = %e, "dropping unreadable frame");
                continue;
            }
        };

        match frames.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::trace!(seq = dropped.sequence, "consumer behind; dropping frame");
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    drop(stream);
    tracing::debug!(device = %camera.device_path, "capture thread exiting");
}

/// Non-blocking frame stream backed by a capture thread.
pub struct CameraStream {
    frames: Receiver<Frame>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    device_path: String,
}

impl CameraStream {
    fn from_parts(
        frames: Receiver<Frame>,
        stop: Arc<AtomicBool>,
        worker: JoinHandle<()>,
        device_path: String,
    ) -> Self {
        Self {
            frames,
            stop,
            worker: Some(worker),
            device_path,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Block up to `timeout` for the next frame. For diagnostics; the
    /// pipeline uses [`FrameSource::next_frame`].
    pub fn wait_frame(&mut self, timeout: Duration) -> Result<Option<Frame>, CameraError> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(CameraError::SourceClosed),
        }
    }

    pub fn is_released(&self) -> bool {
        self.worker.is_none()
    }
}

impl FrameSource for CameraStream {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.worker.is_none() {
            return Err(CameraError::SourceClosed);
        }
        match self.frames.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(CameraError::SourceClosed),
        }
    }

    fn release(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        // The thread notices the flag after at most one more dequeue.
        if worker.join().is_err() {
            tracing::warn!(device = %self.device_path, "capture thread panicked");
        }
        tracing::info!(device = %self.device_path, "camera released");
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens the configured V4L2 device for each pipeline session.
pub struct V4lProvider {
    device_path: String,
}

impl V4lProvider {
    pub fn new(device_path: impl Into<String>) -> Self {
        Self {
            device_path: device_path.into(),
        }
    }
}

impl SourceProvider for V4lProvider {
    fn acquire(&self, constraints: &CaptureConstraints) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open(&self.device_path, constraints.width, constraints.height)?;
        Ok(Box::new(camera.into_stream()?))
    }
}
