//! Per-tick background compositing.
//!
//! Each tick runs `WaitForFrameReady -> UploadTextures -> Draw -> Idle`. Only
//! a capture completion lets a tick go past the first step, so an idle camera
//! never causes redundant draws.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, error, info, instrument, trace};

use crate::capture::frame_ready::FrameReady;
use crate::depth::{DepthFrame, DepthSlot};
use crate::render::gpu::{DrawCall, GpuBackend, ProgramId, TextureId, Topology};
use crate::render::uniforms::{RenderControls, Uniforms};
use crate::tracking::frame::{DisplayRotation, Pose, QUAD_NDC};
use crate::tracking::TrackingSessionAdapter;
use crate::{Error, Resolution, Result};

pub const COMPOSITE_SHADER: &str = include_str!("composite.wgsl");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `on_context_created` has not run yet
    NoContext,
    /// A depth sensor exists but has not delivered its first sample
    DepthNotReady,
    /// No capture completed since the last draw
    NoNewFrame,
    TrackingUnavailable,
    /// The tracking engine has not seen a camera image yet
    NoCameraImage,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NoContext => "no_context",
            SkipReason::DepthNotReady => "depth_not_ready",
            SkipReason::NoNewFrame => "no_new_frame",
            SkipReason::TrackingUnavailable => "tracking_unavailable",
            SkipReason::NoCameraImage => "no_camera_image",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Drawn,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub ticks: u64,
    pub draws: u64,
    pub depth_uploads: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy)]
struct GpuResources {
    program: ProgramId,
    color: TextureId,
    depth: TextureId,
    depth_resolution: Resolution,
}

pub struct RenderPipeline<G: GpuBackend> {
    gpu: G,
    tracking: Arc<Mutex<TrackingSessionAdapter>>,
    frame_ready: Arc<FrameReady>,
    depth: Arc<DepthSlot>,
    depth_resolution: Resolution,
    controls: Arc<RenderControls>,
    resources: Option<GpuResources>,
    screen: Resolution,
    rotation: DisplayRotation,
    uploaded_sequence: Option<u64>,
    pose: Option<Pose>,
    aborted: Option<Error>,
    stats: RenderStats,
}

impl<G: GpuBackend> RenderPipeline<G> {
    pub fn new(
        gpu: G,
        tracking: Arc<Mutex<TrackingSessionAdapter>>,
        frame_ready: Arc<FrameReady>,
        depth: Arc<DepthSlot>,
        depth_resolution: Resolution,
        controls: Arc<RenderControls>,
        screen: Resolution,
    ) -> Self {
        Self {
            gpu,
            tracking,
            frame_ready,
            depth,
            depth_resolution,
            controls,
            resources: None,
            screen,
            rotation: DisplayRotation::default(),
            uploaded_sequence: None,
            pose: None,
            aborted: None,
            stats: RenderStats::default(),
        }
    }

    pub fn gpu(&self) -> &G {
        &self.gpu
    }

    pub fn gpu_mut(&mut self) -> &mut G {
        &mut self.gpu
    }

    pub fn controls(&self) -> &Arc<RenderControls> {
        &self.controls
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn screen(&self) -> Resolution {
        self.screen
    }

    /// Pose of the last drawn frame, `None` while tracking is not established
    pub fn pose(&self) -> Option<Pose> {
        self.pose
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn color_texture(&self) -> Option<TextureId> {
        self.resources.map(|r| r.color)
    }

    fn tracking(&self) -> std::sync::MutexGuard<'_, TrackingSessionAdapter> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a graphics failure; the pipeline stays aborted until the next context
    fn abort(&mut self, error: Error) -> Error {
        error!("Render pipeline aborted: {}", error);
        self.aborted = Some(error.clone());
        error
    }

    fn check<T>(&mut self, stage: &'static str, result: Result<T>) -> Result<T> {
        let result = match result {
            Ok(value) => match self.gpu.poll_error() {
                None => return Ok(value),
                Some(message) => Error::graphics(stage, message),
            },
            Err(Error::GraphicsError { stage, message }) => Error::graphics(stage, message),
            Err(e) => Error::graphics(stage, e.to_string()),
        };
        Err(self.abort(result))
    }

    /// Allocate textures and the shader program on the render thread
    #[instrument(skip(self))]
    pub fn on_context_created(&mut self) -> Result<()> {
        self.aborted = None;
        self.uploaded_sequence = None;

        let color = self.gpu.create_external_texture();
        let color = self.check("external texture creation", color)?;
        let depth = self.gpu.create_depth_texture(self.depth_resolution);
        let depth = self.check("depth texture creation", depth)?;
        let program = self.gpu.create_program(COMPOSITE_SHADER);
        let program = self.check("program creation", program)?;

        self.resources = Some(GpuResources {
            program,
            color,
            depth,
            depth_resolution: self.depth_resolution,
        });
        self.tracking().set_preview_texture(color);
        info!(
            "Render context ready: color {:?}, depth {:?} at {}x{}",
            color, depth, self.depth_resolution.width, self.depth_resolution.height
        );
        Ok(())
    }

    pub fn set_display_rotation(&mut self, rotation: DisplayRotation) {
        self.rotation = rotation;
        self.tracking()
            .set_display_geometry(rotation, self.screen.width, self.screen.height);
    }

    #[instrument(skip(self))]
    pub fn on_surface_resized(&mut self, width: u32, height: u32) {
        self.screen = Resolution::new(width, height);
        self.gpu.set_viewport(width, height);
        let rotation = self.rotation;
        self.tracking().set_display_geometry(rotation, width, height);
    }

    fn skip(&mut self, reason: SkipReason) -> Result<TickOutcome> {
        self.stats.skipped += 1;
        metrics::counter!("render_ticks_skipped", "reason" => reason.as_str()).increment(1);
        trace!("Tick skipped: {:?}", reason);
        Ok(TickOutcome::Skipped(reason))
    }

    pub fn on_tick(&mut self) -> Result<TickOutcome> {
        if let Some(e) = &self.aborted {
            return Err(e.clone());
        }
        self.stats.ticks += 1;
        let Some(resources) = self.resources else {
            return self.skip(SkipReason::NoContext);
        };

        let depth = self.depth.latest();
        if self.depth.is_capable() && depth.is_none() {
            return self.skip(SkipReason::DepthNotReady);
        }

        if !self.frame_ready.take() {
            return self.skip(SkipReason::NoNewFrame);
        }

        let started = Instant::now();
        let (frame, uvs, pose) = {
            let mut tracking = self.tracking();
            let frame = match tracking.update() {
                Ok(frame) => frame,
                Err(e) => {
                    drop(tracking);
                    debug!("Tracking update failed: {}", e);
                    return self.skip(SkipReason::TrackingUnavailable);
                }
            };
            let uvs = tracking.display_uv(&frame);
            let pose = tracking.pose(&frame);
            (frame, uvs, pose)
        };
        self.pose = pose;

        if !frame.has_camera_image() {
            return self.skip(SkipReason::NoCameraImage);
        }

        let resources = match depth.as_deref() {
            Some(depth) => self.upload_depth(resources, depth)?,
            None => resources,
        };

        let uniforms = Uniforms::new(
            self.screen,
            depth.as_ref().map(|d| d.resolution()),
            self.controls.viz_mode(),
            self.controls.threshold_uniform(),
        );
        let call = DrawCall {
            program: resources.program,
            color: resources.color,
            depth: resources.depth,
            uniforms: &uniforms,
            positions: &QUAD_NDC,
            uvs: &uvs,
            topology: Topology::TriangleStrip,
            vertex_count: 4,
        };
        let drawn = self.gpu.draw_quad(&call);
        self.check("draw", drawn)?;

        self.stats.draws += 1;
        metrics::histogram!("render_time_us").record(started.elapsed().as_micros() as f64);
        Ok(TickOutcome::Drawn)
    }

    /// Upload `depth` unless it is the frame already on the GPU
    fn upload_depth(&mut self, mut resources: GpuResources, depth: &DepthFrame) -> Result<GpuResources> {
        if self.uploaded_sequence == Some(depth.sequence()) {
            return Ok(resources);
        }

        if depth.resolution() != resources.depth_resolution {
            debug!(
                "Depth resolution changed to {}x{}, reallocating texture",
                depth.width(),
                depth.height()
            );
            let texture = self.gpu.create_depth_texture(depth.resolution());
            resources.depth = self.check("depth texture creation", texture)?;
            resources.depth_resolution = depth.resolution();
            self.resources = Some(resources);
        }

        let uploaded = self.gpu.upload_depth(resources.depth, depth);
        self.check("depth upload", uploaded)?;
        self.uploaded_sequence = Some(depth.sequence());
        self.stats.depth_uploads += 1;
        Ok(resources)
    }
}
