//! Tracking engine for hosts without pose estimation.
//!
//! Reports the camera as never tracking, so the background still renders but
//! nothing pose-dependent runs. Frame timestamps come from the color preview
//! feed and stay 0 until the camera has produced an image.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::capture::frame::PreviewFeed;
use crate::capture::session::{SurfaceRole, SurfaceTarget};
use crate::render::gpu::TextureId;
use crate::tracking::frame::{Camera, DisplayRotation, Frame, Intrinsics, QuadCoords, TrackingState, IDENTITY};
use crate::tracking::{TrackingEngine, TrackingOptions};
use crate::{Error, Resolution, Result};

/// Nominal field of view used for the reported intrinsics
const HORIZONTAL_FOV_DEG: f32 = 60.0;

pub struct PassthroughEngine {
    feed: Arc<PreviewFeed>,
    image: Resolution,
    surface_id: u32,
    options: TrackingOptions,
    running: bool,
    epoch: Instant,
    rotation: DisplayRotation,
    display: Resolution,
    geometry_changed: bool,
    texture: Option<TextureId>,
}

impl PassthroughEngine {
    pub fn new(feed: Arc<PreviewFeed>, image: Resolution, surface_id: u32) -> Self {
        Self {
            feed,
            image,
            surface_id,
            options: TrackingOptions::default(),
            running: false,
            epoch: Instant::now(),
            rotation: DisplayRotation::default(),
            display: image,
            geometry_changed: false,
            texture: None,
        }
    }

    pub fn preview_texture(&self) -> Option<TextureId> {
        self.texture
    }

    pub fn options(&self) -> &TrackingOptions {
        &self.options
    }

    pub fn display(&self) -> (DisplayRotation, Resolution) {
        (self.rotation, self.display)
    }

    fn latest_timestamp_ns(&self) -> i64 {
        match self.feed.latest() {
            Some(frame) => match frame.meta.device_timestamp {
                Some(ts) => ts.as_nanos() as i64,
                // never 0 once an image exists
                None => frame.timestamp.saturating_duration_since(self.epoch).as_nanos() as i64 + 1,
            },
            None => 0,
        }
    }
}

impl TrackingEngine for PassthroughEngine {
    fn configure(&mut self, options: &TrackingOptions) -> Result<()> {
        debug!("Passthrough engine ignores tracking options {:?}", options);
        self.options = *options;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.running = true;
        info!("Passthrough tracking resumed, no pose estimation");
        Ok(())
    }

    fn pause(&mut self) {
        self.running = false;
    }

    fn update(&mut self) -> Result<Frame> {
        if !self.running {
            return Err(Error::TrackingUnavailable("passthrough engine paused".into()));
        }
        Ok(Frame {
            timestamp_ns: self.latest_timestamp_ns(),
            display_geometry_changed: std::mem::take(&mut self.geometry_changed),
            camera: Camera {
                tracking_state: TrackingState::Paused,
                view: IDENTITY,
                intrinsics: Intrinsics::from_fov(self.image.width, self.image.height, HORIZONTAL_FOV_DEG),
            },
        })
    }

    fn shared_surface_targets(&self) -> Vec<SurfaceTarget> {
        vec![SurfaceTarget::new(self.surface_id, SurfaceRole::TrackingPreview)]
    }

    fn set_preview_texture(&mut self, texture: TextureId) {
        self.texture = Some(texture);
    }

    fn set_display_geometry(&mut self, rotation: DisplayRotation, width: u32, height: u32) {
        self.rotation = rotation;
        self.display = Resolution::new(width, height);
        self.geometry_changed = true;
    }

    fn transform_display_uv(&self, _frame: &Frame, ndc: &QuadCoords) -> QuadCoords {
        let mut uv = [0.0; 8];
        for (out, xy) in uv.chunks_exact_mut(2).zip(ndc.chunks_exact(2)) {
            let (mut u, mut v) = ((xy[0] + 1.0) / 2.0, (1.0 - xy[1]) / 2.0);
            for _ in 0..self.rotation.quarter_turns() {
                (u, v) = (1.0 - v, u);
            }
            out[0] = u;
            out[1] = v;
        }
        uv
    }
}
