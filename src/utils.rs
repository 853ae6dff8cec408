use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device, FourCC};

use crate::capture::frame::PixelFormat;
use crate::depth::DEPTH16_FOURCC;
use crate::{Error, Result};

/// Highest `/dev/videoN` index probed
const MAX_VIDEO_NODES: u32 = 10;

// Detected capture device info
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundDevice {
    pub path: String,
    pub format: PixelFormat,
}

impl FoundDevice {
    pub fn new(path: String, format: PixelFormat) -> Self {
        Self { path, format }
    }
}

fn capture_nodes() -> impl Iterator<Item = (String, Device)> {
    (0..MAX_VIDEO_NODES)
        .map(|i| format!("/dev/video{}", i))
        .filter(|path| Path::new(path).exists())
        .filter_map(|path| {
            let dev = Device::with_path(&path).ok()?;
            let caps = dev.query_caps().ok()?;
            caps.capabilities
                .contains(Flags::VIDEO_CAPTURE)
                .then_some((path, dev))
        })
}

/// Auto-detect best color capture device, preferring MJPEG over YUYV
pub async fn auto_detect_device() -> Result<FoundDevice> {
    info!("Auto-detecting capture devices...");

    tokio::task::spawn_blocking(|| {
        for (path, dev) in capture_nodes() {
            let Ok(formats) = dev.enum_formats() else {
                continue;
            };
            for fmt in formats {
                if fmt.fourcc == FourCC::new(b"MJPG") {
                    info!("Found MJPEG device: {}", path);
                    return Ok(FoundDevice::new(path, PixelFormat::Mjpeg));
                } else if fmt.fourcc == FourCC::new(b"YUYV") {
                    info!("Found YUYV device: {}", path);
                    return Ok(FoundDevice::new(path, PixelFormat::Yuyv4));
                }
            }
        }
        Err(Error::DeviceUnavailable("no suitable capture device found".into()))
    })
    .await
    .map_err(|e| Error::DeviceUnavailable(format!("device probe failed: {}", e)))?
}

/// Find a node streaming 16-bit depth, skipping the color device
pub async fn detect_depth_node(exclude: String) -> Option<String> {
    tokio::task::spawn_blocking(move || {
        capture_nodes()
            .filter(|(path, _)| *path != exclude)
            .find(|(_, dev)| {
                dev.enum_formats()
                    .map(|formats| formats.iter().any(|f| f.fourcc == FourCC::new(DEPTH16_FOURCC)))
                    .unwrap_or(false)
            })
            .map(|(path, _)| {
                info!("Found depth node: {}", path);
                path
            })
    })
    .await
    .unwrap_or_else(|e| {
        debug!("Depth probe failed: {}", e);
        None
    })
}
