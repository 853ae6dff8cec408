//! Time-of-flight sensors exposed as a V4L2 node streaming 16-bit samples

use std::io::ErrorKind;
use std::time::Duration;

use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::session::{SurfaceRole, SurfaceTarget};
use crate::depth::source::DepthSensor;
use crate::depth::DEPTH16_FOURCC;
use crate::{DepthConfig, Error, Resolution, Result};

/// How long one `next_frame` call may wait before yielding `None`
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct V4l2DepthSensor {
    path: String,
    resolution: Resolution,
    buffer_count: u32,
    surface: SurfaceTarget,
    device: Option<Device>,
    stream: Option<MmapStream<'static>>,
}

impl V4l2DepthSensor {
    pub fn new(path: impl Into<String>, config: &DepthConfig, surface_id: u32) -> Self {
        Self {
            path: path.into(),
            resolution: config.resolution(),
            buffer_count: config.buffer_count,
            surface: SurfaceTarget::new(surface_id, SurfaceRole::Depth),
            device: None,
            stream: None,
        }
    }
}

fn io_err(context: &str, e: std::io::Error) -> Error {
    Error::DeviceUnavailable(format!("depth {}: {}", context, e))
}

/// Little-endian sample bytes to host-order u16
pub fn samples_from_le(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect()
}

impl DepthSensor for V4l2DepthSensor {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn surface(&self) -> SurfaceTarget {
        self.surface.clone()
    }

    fn start(&mut self) -> Result<()> {
        let device = Device::with_path(&self.path).map_err(|e| io_err("open", e))?;

        let mut fmt = device.format().map_err(|e| io_err("get format", e))?;
        fmt.width = self.resolution.width;
        fmt.height = self.resolution.height;
        fmt.fourcc = FourCC::new(DEPTH16_FOURCC);
        let fmt = device.set_format(&fmt).map_err(|e| io_err("set format", e))?;

        if fmt.fourcc != FourCC::new(DEPTH16_FOURCC)
            || fmt.width != self.resolution.width
            || fmt.height != self.resolution.height
        {
            return Err(Error::DeviceUnavailable(format!(
                "{} refused {}x{} Y16 (got {}x{} {})",
                self.path,
                self.resolution.width,
                self.resolution.height,
                fmt.width,
                fmt.height,
                fmt.fourcc
            )));
        }

        let mut stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| io_err("request buffers", e))?;
        stream.set_timeout(POLL_TIMEOUT);

        info!("Depth sensor {} streaming {}x{}", self.path, fmt.width, fmt.height);
        self.stream = Some(stream);
        self.device = Some(device);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u16>>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::DeviceUnavailable("depth stream not started".into()))?;

        match stream.next() {
            Ok((buf, meta)) => {
                let used = (meta.bytesused as usize).min(buf.len());
                Ok(Some(samples_from_le(&buf[..used])))
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(io_err("dequeue", e)),
        }
    }

    fn release(&mut self) {
        self.stream = None;
        if self.device.take().is_some() {
            debug!("Depth sensor {} released", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_samples() {
        assert_eq!(samples_from_le(&[0x34, 0x12, 0xFF, 0x00, 0x01]), vec![0x1234, 0x00FF]);
    }

    #[test]
    fn next_frame_before_start_is_an_error() {
        let config = crate::Config::default().depth;
        let mut sensor = V4l2DepthSensor::new("/dev/null-depth", &config, 2);
        assert!(sensor.next_frame().is_err());
        assert_eq!(sensor.resolution(), Resolution::new(240, 180));
        sensor.release();
    }
}
