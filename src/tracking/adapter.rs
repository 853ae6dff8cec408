use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::capture::frame_ready::FrameReady;
use crate::capture::session::SurfaceTarget;
use crate::render::gpu::TextureId;
use crate::tracking::frame::{DisplayRotation, Frame, Pose, QuadCoords, TrackingState, QUAD_NDC};
use crate::tracking::{TrackingEngine, TrackingOptions};
use crate::{Error, Result};

/// Owns the tracking session for the resumed lifetime and hands out frames
pub struct TrackingSessionAdapter {
    engine: Option<Box<dyn TrackingEngine>>,
    options: TrackingOptions,
    configured: bool,
    resumed: bool,
    frame_ready: Arc<FrameReady>,
    uv: Option<QuadCoords>,
    transform_count: u64,
    near: f32,
    far: f32,
}

impl TrackingSessionAdapter {
    pub fn new(engine: Option<Box<dyn TrackingEngine>>, frame_ready: Arc<FrameReady>) -> Self {
        Self {
            engine,
            options: TrackingOptions::default(),
            configured: false,
            resumed: false,
            frame_ready,
            uv: None,
            transform_count: 0,
            near: 0.01,
            far: 100.0,
        }
    }

    pub fn with_clip_planes(mut self, near: f32, far: f32) -> Self {
        self.near = near;
        self.far = far;
        self
    }

    pub fn has_session(&self) -> bool {
        self.engine.is_some()
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn options(&self) -> &TrackingOptions {
        &self.options
    }

    fn engine(&mut self) -> Result<&mut Box<dyn TrackingEngine>> {
        self.engine
            .as_mut()
            .ok_or_else(|| Error::TrackingUnavailable("no tracking session".into()))
    }

    /// Apply `options`; only valid while the session is paused
    #[instrument(skip(self))]
    pub fn configure(&mut self, options: TrackingOptions) -> Result<()> {
        if self.resumed {
            return Err(Error::ConfigurationRace(
                "tracking session must be paused to reconfigure".into(),
            ));
        }
        self.engine()?.configure(&options)?;
        self.options = options;
        self.configured = true;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn resume(&mut self) -> Result<()> {
        if self.resumed {
            return Ok(());
        }
        if !self.configured {
            self.configure(self.options)?;
        }
        self.engine()?
            .resume()
            .map_err(|e| Error::TrackingUnavailable(e.to_string()))?;
        self.resumed = true;
        info!("Tracking session resumed");
        Ok(())
    }

    /// Pausing drops any pending frame so nothing stale is drawn after resume
    #[instrument(skip(self))]
    pub fn pause(&mut self) {
        self.frame_ready.clear();
        if !self.resumed {
            return;
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.pause();
        }
        self.resumed = false;
        info!("Tracking session paused");
    }

    /// One engine update per render tick; failures mean "skip this tick"
    pub fn update(&mut self) -> Result<Frame> {
        if !self.resumed {
            return Err(Error::TrackingUnavailable("tracking session paused".into()));
        }
        self.engine()?.update().map_err(|e| match e {
            Error::TrackingUnavailable(_) => e,
            other => Error::TrackingUnavailable(other.to_string()),
        })
    }

    /// Texture coordinates for the full-screen quad, recomputed only on the
    /// first frame and when the display geometry changed
    pub fn display_uv(&mut self, frame: &Frame) -> QuadCoords {
        match (self.uv, self.engine.as_ref()) {
            (Some(uv), _) if !frame.display_geometry_changed => uv,
            (_, Some(engine)) => {
                let uv = engine.transform_display_uv(frame, &QUAD_NDC);
                self.transform_count += 1;
                debug!(count = self.transform_count, "Display transform recomputed");
                self.uv = Some(uv);
                uv
            }
            (cached, None) => cached.unwrap_or(QUAD_NDC),
        }
    }

    /// Times the display transform has been computed
    pub fn transform_count(&self) -> u64 {
        self.transform_count
    }

    /// Pose of a tracked frame; `None` while tracking is paused or stopped
    pub fn pose(&self, frame: &Frame) -> Option<Pose> {
        match frame.camera.tracking_state {
            TrackingState::Tracking => Some(Pose {
                timestamp_ns: frame.timestamp_ns,
                view: frame.camera.view_matrix(),
                projection: frame.camera.projection_matrix(self.near, self.far),
            }),
            _ => None,
        }
    }

    pub fn shared_surface_targets(&self) -> Vec<SurfaceTarget> {
        self.engine
            .as_ref()
            .map(|e| e.shared_surface_targets())
            .unwrap_or_default()
    }

    pub fn set_preview_texture(&mut self, texture: TextureId) {
        match self.engine.as_mut() {
            Some(engine) => engine.set_preview_texture(texture),
            None => warn!("No tracking session to receive preview texture {:?}", texture),
        }
    }

    pub fn set_display_geometry(&mut self, rotation: DisplayRotation, width: u32, height: u32) {
        if let Some(engine) = self.engine.as_mut() {
            engine.set_display_geometry(rotation, width, height);
        }
    }
}
