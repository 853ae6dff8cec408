pub mod capture;
pub mod depth;
pub mod error;
pub mod orchestrator;
pub mod render;
pub mod tracking;
pub mod utils;

use std::path::Path;
use std::time::Duration;

use arc_swap::ArcSwap;
use capture::frame::PixelFormat;
use capture::session::RequestTemplate;
use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use tracking::TrackingOptions;

use crate::utils::FoundDevice;

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Width and height of an image, a texture or a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub depth: DepthConfig,
    pub tracking: TrackingOptions,
    pub render: RenderConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub device: FoundDevice,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub buffer_count: u32,
    pub template: RequestTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthConfig {
    pub enabled: bool,
    /// V4L2 node of the time-of-flight sensor. Probed when absent.
    pub device: Option<String>,
    pub width: u32,
    pub height: u32,
    pub buffer_count: u32,
}

impl DepthConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
    /// Highest visualization mode the composite shader implements
    pub max_viz_mode: u32,
    /// Initial depth threshold, 0-100
    pub depth_threshold: u32,
    pub near_plane: f32,
    pub far_plane: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on waiting for an in-flight session configuration
    pub gate_timeout_ms: u64,
    pub callback_poll_ms: u64,
    pub enable_profiling: bool,
}

impl PipelineConfig {
    pub fn gate_timeout(&self) -> Duration {
        Duration::from_millis(self.gate_timeout_ms)
    }

    pub fn callback_poll(&self) -> Duration {
        Duration::from_millis(self.callback_poll_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                device: FoundDevice::new("/dev/video0".into(), PixelFormat::Mjpeg),
                width: 1280,
                height: 720,
                fps: 30,
                buffer_count: 4,
                template: RequestTemplate::Record,
            },
            depth: DepthConfig {
                enabled: true,
                device: None,
                width: depth::DEPTH_WIDTH,
                height: depth::DEPTH_HEIGHT,
                buffer_count: 2,
            },
            tracking: TrackingOptions::default(),
            render: RenderConfig {
                width: 1080,
                height: 2220,
                vsync: true,
                max_viz_mode: render::uniforms::VIZ_MODE_COUNT - 1,
                depth_threshold: 50,
                near_plane: 0.01,
                far_plane: 100.0,
            },
            pipeline: PipelineConfig {
                gate_timeout_ms: 5_000,
                callback_poll_ms: 20,
                enable_profiling: false,
            },
        }
    }
}

impl Config {
    /// Layer defaults, an optional TOML file and `SHAREDCAM__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("SHAREDCAM").separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
