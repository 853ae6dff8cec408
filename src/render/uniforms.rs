use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tracing::debug;

use crate::Resolution;

/// Visualization modes implemented by `composite.wgsl`
pub const VIZ_MODE_COUNT: u32 = 8;

pub const MAX_DEPTH_THRESHOLD: u32 = 100;

/// User-facing controls, written from the UI thread and read every tick
#[derive(Debug)]
pub struct RenderControls {
    viz_mode: AtomicU32,
    max_viz_mode: u32,
    threshold: AtomicU32,
}

impl RenderControls {
    pub fn new(max_viz_mode: u32, threshold: u32) -> Arc<Self> {
        let controls = Self {
            viz_mode: AtomicU32::new(0),
            max_viz_mode: max_viz_mode.min(VIZ_MODE_COUNT - 1),
            threshold: AtomicU32::new(1),
        };
        controls.set_threshold(threshold);
        Arc::new(controls)
    }

    pub fn viz_mode(&self) -> u32 {
        self.viz_mode.load(Ordering::Relaxed)
    }

    pub fn max_viz_mode(&self) -> u32 {
        self.max_viz_mode
    }

    /// Step forward, saturating at the configured maximum
    pub fn next_viz_mode(&self) -> u32 {
        let max = self.max_viz_mode;
        self.step_viz_mode(move |m| (m < max).then_some(m + 1))
    }

    /// Step back, saturating at 0
    pub fn prev_viz_mode(&self) -> u32 {
        self.step_viz_mode(|m| m.checked_sub(1))
    }

    fn step_viz_mode(&self, f: impl Fn(u32) -> Option<u32> + Copy) -> u32 {
        let mode = match self.viz_mode.fetch_update(Ordering::Relaxed, Ordering::Relaxed, f) {
            Ok(prev) => f(prev).unwrap_or(prev),
            Err(unchanged) => unchanged,
        };
        debug!("View mode: {}", mode);
        mode
    }

    pub fn threshold(&self) -> u32 {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Store a 0-100 threshold; 0 is stored as 1
    pub fn set_threshold(&self, value: u32) -> u32 {
        let value = value.clamp(1, MAX_DEPTH_THRESHOLD);
        self.threshold.store(value, Ordering::Relaxed);
        value
    }

    /// Threshold as the shader sees it
    pub fn threshold_uniform(&self) -> f32 {
        self.threshold() as f32 / 100.0
    }
}

/// Crop and scale mapping screen pixels onto the depth image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthViewport {
    pub y_offset: f32,
    pub x_scale: f32,
    pub y_scale: f32,
}

impl DepthViewport {
    /// Keep the full depth width and crop its height to the screen's aspect ratio
    pub fn compute(depth: Resolution, screen: Resolution) -> Self {
        let aspect = screen.height as f32 / screen.width as f32;
        let new_width = depth.width as f32;
        let new_height = aspect * new_width;
        Self {
            y_offset: (depth.height as f32 - new_height) / 2.0,
            x_scale: new_width / screen.width as f32,
            y_scale: new_height / screen.height as f32,
        }
    }
}

/// Uniform block of the composite shader, laid out to match `composite.wgsl`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Uniforms {
    pub screen_resolution: [f32; 2],
    pub depth_resolution: [f32; 2],
    pub depth_y_offset: f32,
    pub depth_x_scale: f32,
    pub depth_y_scale: f32,
    pub depth_threshold: f32,
    pub viz_mode: u32,
    pub has_depth: u32,
    pub _pad: [u32; 2],
}

impl Uniforms {
    pub fn new(
        screen: Resolution,
        depth: Option<Resolution>,
        viz_mode: u32,
        depth_threshold: f32,
    ) -> Self {
        let viewport = depth.map(|d| DepthViewport::compute(d, screen));
        let depth_res = depth.unwrap_or(Resolution::new(0, 0));
        Self {
            screen_resolution: [screen.width as f32, screen.height as f32],
            depth_resolution: [depth_res.width as f32, depth_res.height as f32],
            depth_y_offset: viewport.map_or(0.0, |v| v.y_offset),
            depth_x_scale: viewport.map_or(0.0, |v| v.x_scale),
            depth_y_scale: viewport.map_or(0.0, |v| v.y_scale),
            depth_threshold,
            viz_mode,
            has_depth: depth.is_some() as u32,
            _pad: [0; 2],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
