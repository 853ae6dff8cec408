use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

use crate::Resolution;

/// Decoded color preview image, RGBA8
#[derive(Clone)]
pub struct ColorFrame {
    /// Immutable pixel data - can be shared across threads without copying
    pub data: Bytes,

    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

impl ColorFrame {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.meta.width, self.meta.height)
    }
}

/// Pixel formats the preview path understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    Rgba8,
    Rgb24,
    Yuyv4,
    Mjpeg,
}

/// The producer side of the external color texture.
///
/// Whatever owns the camera stream publishes decoded preview images here; the
/// GPU backend latches the newest one when it binds the color texture. The
/// render pipeline itself never uploads color data.
#[derive(Default)]
pub struct PreviewFeed {
    latest: ArcSwapOption<ColorFrame>,
    published: AtomicU64,
}

impl PreviewFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, frame: ColorFrame) {
        self.latest.store(Some(Arc::new(frame)));
        self.published.fetch_add(1, Ordering::Release);
    }

    pub fn latest(&self) -> Option<Arc<ColorFrame>> {
        self.latest.load_full()
    }

    /// Number of images published so far, zero until the camera produced one
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.latest.store(None);
    }
}

/// Expand packed RGB24 into RGBA8
pub fn rgb_to_rgba(rgb: &[u8]) -> Vec<u8> {
    let mut rgba = Vec::with_capacity(rgb.len() / 3 * 4);
    for chunk in rgb.chunks_exact(3) {
        rgba.extend_from_slice(chunk);
        rgba.push(255);
    }
    rgba
}

/// Convert packed YUYV 4:2:2 into RGBA8 (BT.601, studio swing)
pub fn yuyv_to_rgba(yuyv: &[u8]) -> Vec<u8> {
    fn clamp(v: i32) -> u8 {
        v.clamp(0, 255) as u8
    }

    let mut rgba = Vec::with_capacity(yuyv.len() * 2);
    for px in yuyv.chunks_exact(4) {
        let (y0, u, y1, v) = (px[0] as i32, px[1] as i32 - 128, px[2] as i32, px[3] as i32 - 128);
        for y in [y0, y1] {
            let c = 298 * (y - 16);
            rgba.push(clamp((c + 409 * v + 128) >> 8));
            rgba.push(clamp((c - 100 * u - 208 * v + 128) >> 8));
            rgba.push(clamp((c + 516 * u + 128) >> 8));
            rgba.push(255);
        }
    }
    rgba
}
