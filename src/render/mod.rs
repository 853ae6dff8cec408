pub mod gpu;
pub mod pipeline;
pub mod uniforms;
pub mod wgpu_backend;

pub use gpu::{DrawCall, GpuBackend, ProgramId, TextureId, Topology};
pub use pipeline::{RenderPipeline, RenderStats, SkipReason, TickOutcome};
pub use uniforms::{DepthViewport, RenderControls, Uniforms, VIZ_MODE_COUNT};
pub use wgpu_backend::WgpuBackend;
