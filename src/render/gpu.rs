//! The graphics boundary of the render pipeline.
//!
//! The pipeline only speaks in handles; a backend owns the actual GPU objects.
//! Errors are sticky: a backend records the first failure and reports it from
//! [`GpuBackend::poll_error`], mirroring how GL-style APIs surface errors.

use crate::depth::DepthFrame;
use crate::render::uniforms::Uniforms;
use crate::tracking::frame::QuadCoords;
use crate::{Resolution, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    TriangleStrip,
}

/// Everything one background draw needs
#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    /// Externally filled camera-image texture
    pub color: TextureId,
    pub depth: TextureId,
    pub uniforms: &'a Uniforms,
    pub positions: &'a QuadCoords,
    pub uvs: &'a QuadCoords,
    pub topology: Topology,
    pub vertex_count: u32,
}

pub trait GpuBackend {
    /// A texture whose contents are produced outside the pipeline (the camera image)
    fn create_external_texture(&mut self) -> Result<TextureId>;

    /// A single-channel unsigned 16-bit texture
    fn create_depth_texture(&mut self, resolution: Resolution) -> Result<TextureId>;

    fn create_program(&mut self, source: &str) -> Result<ProgramId>;

    fn set_viewport(&mut self, width: u32, height: u32);

    /// Upload raw depth samples without conversion
    fn upload_depth(&mut self, texture: TextureId, frame: &DepthFrame) -> Result<()>;

    /// Draw the background quad. Backend state touched by the draw (vertex
    /// attributes, depth test) must be restored before returning.
    fn draw_quad(&mut self, call: &DrawCall<'_>) -> Result<()>;

    /// First recorded error since the last poll
    fn poll_error(&mut self) -> Option<String>;
}
