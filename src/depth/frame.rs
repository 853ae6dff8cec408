use std::time::Instant;

use crate::Resolution;

const RANGE_MASK: u16 = 0x1FFF;
const CONFIDENCE_SHIFT: u16 = 13;

/// One low-resolution depth sample buffer.
///
/// Samples use the DEPTH16 layout: the low 13 bits hold range in millimetres,
/// the high 3 bits a confidence code where 0 means fully confident and
/// `c > 0` means `(c - 1) / 7`.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthFrame {
    resolution: Resolution,
    samples: Vec<u16>,
    sequence: u64,
    captured_at: Instant,
}

impl DepthFrame {
    /// Returns `None` when the sample count does not match the resolution
    pub fn new(resolution: Resolution, samples: Vec<u16>, sequence: u64) -> Option<Self> {
        (samples.len() == resolution.pixel_count()).then(|| Self {
            resolution,
            samples,
            sequence,
            captured_at: Instant::now(),
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    pub fn samples(&self) -> &[u16] {
        &self.samples
    }

    /// Raw sample bytes in native endianness, ready for an `R16Uint` upload
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.samples)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    fn sample(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.resolution.width || y >= self.resolution.height {
            return None;
        }
        self.samples
            .get(y as usize * self.resolution.width as usize + x as usize)
            .copied()
    }

    pub fn range_mm(&self, x: u32, y: u32) -> Option<u16> {
        self.sample(x, y).map(|s| s & RANGE_MASK)
    }

    pub fn confidence(&self, x: u32, y: u32) -> Option<f32> {
        self.sample(x, y).map(|s| match s >> CONFIDENCE_SHIFT {
            0 => 1.0,
            c => (c - 1) as f32 / 7.0,
        })
    }
}
