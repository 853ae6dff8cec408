//! V4L2 camera stack behind the [`CameraHal`] boundary

use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::framesize::FrameSizeEnum;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{rgb_to_rgba, yuyv_to_rgba, ColorFrame, FrameMetadata, PixelFormat, PreviewFeed};
use crate::capture::hal::{CameraHal, EventSender};
use crate::capture::session::{CameraSession, CaptureEvent, CaptureRequest, SurfaceRole};
use crate::depth::DEPTH16_FOURCC;
use crate::{CameraConfig, Error, Resolution, Result};

/// How long a dequeue may block before the capture thread rechecks its stop flag
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Consecutive dequeue failures after which the device is reported broken
const MAX_CONSECUTIVE_FAILURES: u32 = 30;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);
const ENODEV: i32 = 19;
const EIO: i32 = 5;

/// What the capture thread does with a failed dequeue
#[derive(Debug, PartialEq, Eq)]
enum ReadFailure {
    /// No frame within the poll timeout
    Idle,
    Disconnected,
    /// Report the failed capture and retry after a backoff
    Retry(String),
    /// Too many failures in a row
    Broken(i32),
}

fn classify_read_error(e: &io::Error, consecutive: u32) -> ReadFailure {
    if e.kind() == ErrorKind::TimedOut {
        return ReadFailure::Idle;
    }
    match e.raw_os_error() {
        Some(ENODEV) => ReadFailure::Disconnected,
        code if consecutive >= MAX_CONSECUTIVE_FAILURES => ReadFailure::Broken(code.unwrap_or(EIO)),
        _ => ReadFailure::Retry(e.to_string()),
    }
}

struct Streamer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct HalState {
    device: Option<Device>,
    events: Option<EventSender>,
    stream: Option<MmapStream<'static>>,
    streamer: Option<Streamer>,
}

/// Camera device driven through V4L2 memory-mapped streaming
pub struct V4l2Camera {
    config: CameraConfig,
    depth_node: Option<String>,
    preview: Arc<PreviewFeed>,
    state: Mutex<HalState>,
}

fn unavailable(context: &str, e: std::io::Error) -> Error {
    Error::DeviceUnavailable(format!("{}: {}", context, e))
}

impl V4l2Camera {
    pub fn new(config: CameraConfig, depth_node: Option<String>, preview: Arc<PreviewFeed>) -> Self {
        Self {
            config,
            depth_node,
            preview,
            state: Mutex::new(HalState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fourcc(&self) -> Result<FourCC> {
        match self.config.device.format {
            PixelFormat::Mjpeg => Ok(FourCC::new(b"MJPG")),
            PixelFormat::Yuyv4 => Ok(FourCC::new(b"YUYV")),
            PixelFormat::Rgb24 => Ok(FourCC::new(b"RGB3")),
            other => Err(Error::DeviceUnavailable(format!(
                "unsupported pixel format {:?}",
                other
            ))),
        }
    }

    fn stop_streaming(state: &mut HalState) {
        if let Some(streamer) = state.streamer.take() {
            streamer.stop.store(true, Ordering::Release);
            if streamer.handle.join().is_err() {
                error!("V4L2 capture thread panicked");
            }
        }
        state.stream = None;
    }

    fn send(events: &EventSender, event: CaptureEvent) {
        if events.send(event).is_err() {
            debug!("Capture event dropped, callback thread stopped");
        }
    }
}

impl CameraHal for V4l2Camera {
    fn has_permission(&self) -> bool {
        std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.device.path)
            .is_ok()
    }

    #[instrument(skip(self, events))]
    fn open(&self, device_id: &str, events: EventSender) -> Result<()> {
        let mut state = self.lock();
        if state.device.is_some() {
            return Err(Error::DeviceUnavailable(format!("{} already open", device_id)));
        }

        let device = Device::with_path(device_id).map_err(|e| unavailable(device_id, e))?;

        let caps = device.query_caps().map_err(|e| unavailable("query caps", e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(Error::DeviceUnavailable(format!(
                "{} doesn't support video capture",
                device_id
            )));
        }

        state.device = Some(device);
        state.events = Some(events.clone());
        Self::send(&events, CaptureEvent::DeviceOpened);
        Ok(())
    }

    #[instrument(skip_all, fields(device = session.device_id()))]
    fn create_session(&self, session: &CameraSession) -> Result<()> {
        let fourcc = self.fourcc()?;
        let mut state = self.lock();
        let device = state
            .device
            .as_ref()
            .ok_or_else(|| Error::DeviceUnavailable("device not open".into()))?;

        for target in session.targets() {
            if target.role != SurfaceRole::TrackingPreview && target.role != SurfaceRole::Preview {
                debug!("Surface {} ({:?}) is fed outside this device", target.id, target.role);
            }
        }

        let mut fmt = device.format().map_err(|e| unavailable("get format", e))?;
        fmt.width = self.config.width;
        fmt.height = self.config.height;
        fmt.fourcc = fourcc;
        let fmt = device.set_format(&fmt).map_err(|e| unavailable("set format", e))?;
        if fmt.width != self.config.width || fmt.height != self.config.height {
            warn!(
                "Driver adjusted preview to {}x{} (requested {}x{})",
                fmt.width, fmt.height, self.config.width, self.config.height
            );
        }

        let mut stream = MmapStream::with_buffers(device, Type::VideoCapture, self.config.buffer_count)
            .map_err(|e| unavailable("request buffers", e))?;
        stream.set_timeout(POLL_TIMEOUT);
        info!("Capture session ready with {} buffers", self.config.buffer_count);

        state.stream = Some(stream);
        if let Some(events) = &state.events {
            Self::send(events, CaptureEvent::SessionConfigured);
        }
        Ok(())
    }

    fn submit_repeating(&self, request: &CaptureRequest) -> Result<()> {
        let mut state = self.lock();
        if state.streamer.is_some() {
            // Already streaming; V4L2 has no per-request templates to swap
            debug!(template = ?request.template, "Repeating request already running");
            return Ok(());
        }

        let mut stream = state
            .stream
            .take()
            .ok_or_else(|| Error::ConfigurationRace("no configured stream".into()))?;
        let events = state
            .events
            .clone()
            .ok_or_else(|| Error::ConfigurationRace("device not open".into()))?;

        let stop = Arc::new(AtomicBool::new(false));
        let preview = self.preview.clone();
        let (width, height, format) = (self.config.width, self.config.height, self.config.device.format);

        let handle = thread::Builder::new()
            .name("v4l2-capture".into())
            .spawn({
                let stop = stop.clone();
                move || {
                    let mut sequence = 0u64;
                    let mut failures = 0u32;
                    while !stop.load(Ordering::Acquire) {
                        let timestamp = Instant::now();
                        let (buf, meta) = match stream.next() {
                            Ok(next) => next,
                            Err(e) => {
                                let failure = classify_read_error(&e, failures + 1);
                                if failure != ReadFailure::Idle {
                                    failures += 1;
                                }
                                match failure {
                                    ReadFailure::Idle => {}
                                    ReadFailure::Disconnected => {
                                        Self::send(&events, CaptureEvent::DeviceDisconnected);
                                        break;
                                    }
                                    ReadFailure::Broken(code) => {
                                        error!("Capture failed {} times in a row: {}", failures, e);
                                        Self::send(&events, CaptureEvent::DeviceError(code));
                                        break;
                                    }
                                    ReadFailure::Retry(reason) => {
                                        Self::send(
                                            &events,
                                            CaptureEvent::CaptureFailed {
                                                frame_number: sequence,
                                                reason,
                                            },
                                        );
                                        thread::sleep(RETRY_BACKOFF);
                                    }
                                }
                                continue;
                            }
                        };
                        failures = 0;

                        let used = (meta.bytesused as usize).min(buf.len());
                        let rgba = match decode_preview(&buf[..used], format, width, height) {
                            Ok(decoded) => decoded,
                            Err(reason) => {
                                Self::send(
                                    &events,
                                    CaptureEvent::CaptureFailed {
                                        frame_number: meta.sequence as u64,
                                        reason,
                                    },
                                );
                                continue;
                            }
                        };

                        sequence += 1;
                        preview.publish(ColorFrame {
                            data: Bytes::from(rgba.pixels),
                            meta: Arc::new(FrameMetadata {
                                sequence,
                                width: rgba.width,
                                height: rgba.height,
                                stride: rgba.width * 4,
                                format: PixelFormat::Rgba8,
                                device_timestamp: Some(
                                    Duration::from_secs(meta.timestamp.sec as u64)
                                        + Duration::from_micros(meta.timestamp.usec as u64),
                                ),
                            }),
                            timestamp,
                        });
                        Self::send(
                            &events,
                            CaptureEvent::CaptureCompleted {
                                frame_number: meta.sequence as u64,
                            },
                        );
                    }
                    debug!("V4L2 capture thread exiting after {} frames", sequence);
                }
            })
            .map_err(|e| unavailable("spawn capture thread", e))?;

        state.streamer = Some(Streamer { stop, handle });
        info!("Repeating capture started");
        Ok(())
    }

    fn close_session(&self) {
        let mut state = self.lock();
        Self::stop_streaming(&mut state);
    }

    fn close_device(&self) {
        let mut state = self.lock();
        Self::stop_streaming(&mut state);
        if state.device.take().is_some() {
            info!("V4L2 device released");
        }
        state.events = None;
        self.preview.clear();
    }

    fn depth_resolutions(&self, _device_id: &str) -> Vec<Resolution> {
        let Some(node) = &self.depth_node else {
            return Vec::new();
        };
        let device = match Device::with_path(node) {
            Ok(device) => device,
            Err(e) => {
                debug!("Depth node {} unavailable: {}", node, e);
                return Vec::new();
            }
        };

        match device.enum_framesizes(FourCC::new(DEPTH16_FOURCC)) {
            Ok(sizes) => sizes
                .into_iter()
                .map(|size| match size.size {
                    FrameSizeEnum::Discrete(d) => Resolution::new(d.width, d.height),
                    FrameSizeEnum::Stepwise(s) => Resolution::new(s.max_width, s.max_height),
                })
                .collect(),
            Err(e) => {
                debug!("Depth node {} lists no 16-bit depth sizes: {}", node, e);
                Vec::new()
            }
        }
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.close_device();
    }
}

struct Decoded {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
}

fn decode_preview(data: &[u8], format: PixelFormat, width: u32, height: u32) -> Result<Decoded, String> {
    match format {
        PixelFormat::Mjpeg => {
            // Use zune-jpeg for fastest JPEG decoding
            let mut decoder = zune_jpeg::JpegDecoder::new(data);
            let rgb = decoder.decode().map_err(|e| e.to_string())?;
            let (w, h) = decoder
                .dimensions()
                .map(|(w, h)| (w as u32, h as u32))
                .unwrap_or((width, height));
            Ok(Decoded {
                pixels: rgb_to_rgba(&rgb),
                width: w,
                height: h,
            })
        }
        PixelFormat::Yuyv4 => Ok(Decoded {
            pixels: yuyv_to_rgba(data),
            width,
            height,
        }),
        PixelFormat::Rgb24 => Ok(Decoded {
            pixels: rgb_to_rgba(data),
            width,
            height,
        }),
        PixelFormat::Rgba8 => Ok(Decoded {
            pixels: data.to_vec(),
            width,
            height,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_formats_decode_to_rgba() {
        let out = decode_preview(&[10, 20, 30, 40, 50, 60], PixelFormat::Rgb24, 2, 1).unwrap();
        assert_eq!(out.pixels, vec![10, 20, 30, 255, 40, 50, 60, 255]);
        assert_eq!((out.width, out.height), (2, 1));
    }

    #[test]
    fn dequeue_timeout_is_idle_not_a_failure() {
        let timeout = io::Error::new(ErrorKind::TimedOut, "VIDIOC_DQBUF timed out");
        assert_eq!(classify_read_error(&timeout, MAX_CONSECUTIVE_FAILURES + 5), ReadFailure::Idle);
    }

    #[test]
    fn repeated_read_errors_end_streaming() {
        let eio = io::Error::from_raw_os_error(EIO);
        assert!(matches!(classify_read_error(&eio, 1), ReadFailure::Retry(_)));
        assert!(matches!(
            classify_read_error(&eio, MAX_CONSECUTIVE_FAILURES - 1),
            ReadFailure::Retry(_)
        ));
        assert_eq!(
            classify_read_error(&eio, MAX_CONSECUTIVE_FAILURES),
            ReadFailure::Broken(EIO)
        );
    }

    #[test]
    fn unplugged_device_is_a_disconnect() {
        let enodev = io::Error::from_raw_os_error(ENODEV);
        assert_eq!(classify_read_error(&enodev, 1), ReadFailure::Disconnected);
    }

    #[test]
    fn garbage_jpeg_is_a_capture_failure_not_a_panic() {
        assert!(decode_preview(&[0, 1, 2, 3], PixelFormat::Mjpeg, 4, 4).is_err());
    }
}
