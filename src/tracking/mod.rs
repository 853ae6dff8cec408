//! Boundary to the pose-tracking engine sharing the camera

pub mod adapter;
pub mod frame;
pub mod passthrough;

use serde::{Deserialize, Serialize};

pub use adapter::TrackingSessionAdapter;
pub use frame::{Camera, DisplayRotation, Frame, Pose, QuadCoords, TrackingState, QUAD_NDC};
pub use passthrough::PassthroughEngine;

use crate::capture::session::SurfaceTarget;
use crate::render::gpu::TextureId;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusMode {
    Auto,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// `update` returns immediately with the newest camera image
    LatestCameraImage,
    /// `update` waits for the next camera image
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaneFindingMode {
    Off,
    Horizontal,
    HorizontalAndVertical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingOptions {
    pub focus: FocusMode,
    pub update: UpdateMode,
    pub plane_finding: PlaneFindingMode,
    pub light_estimation: bool,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            focus: FocusMode::Auto,
            update: UpdateMode::LatestCameraImage,
            plane_finding: PlaneFindingMode::HorizontalAndVertical,
            light_estimation: false,
        }
    }
}

/// A pose-estimation engine that shares the camera device with manual capture
pub trait TrackingEngine: Send {
    fn configure(&mut self, options: &TrackingOptions) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    fn pause(&mut self);

    fn update(&mut self) -> Result<Frame>;

    /// Surfaces the engine needs in every capture session
    fn shared_surface_targets(&self) -> Vec<SurfaceTarget>;

    /// The external texture the engine fills with the camera image
    fn set_preview_texture(&mut self, texture: TextureId);

    fn set_display_geometry(&mut self, rotation: DisplayRotation, width: u32, height: u32);

    /// Map normalized device coordinates to camera-image texture coordinates
    fn transform_display_uv(&self, frame: &Frame, ndc: &QuadCoords) -> QuadCoords;
}
