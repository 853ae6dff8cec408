//! sharedcam host: V4L2 camera plus optional depth node, composited with wgpu

use std::path::PathBuf;
use std::sync::Arc;

use color_eyre::Result;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use winit::application::ApplicationHandler;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{Key, NamedKey};
use winit::window::WindowId;

use sharedcam::capture::{PreviewFeed, V4l2Camera};
use sharedcam::depth::{DepthFrameSource, V4l2DepthSensor};
use sharedcam::render::{RenderPipeline, TickOutcome, WgpuBackend};
use sharedcam::tracking::PassthroughEngine;
use sharedcam::{utils, Config, Error, Orchestrator, Resolution};

const TRACKING_SURFACE_ID: u32 = 1;
const DEPTH_SURFACE_ID: u32 = 2;
const THRESHOLD_STEP: u32 = 5;

struct App {
    orchestrator: Orchestrator,
    preview: Arc<PreviewFeed>,
    pipeline: Option<RenderPipeline<WgpuBackend>>,
    quit: flume::Receiver<()>,
    error: Option<Error>,
}

impl App {
    fn fail(&mut self, event_loop: &ActiveEventLoop, e: Error) {
        error!("Fatal: {}", e);
        self.error.get_or_insert(e);
        event_loop.exit();
    }

    /// Lifecycle errors other than fatal ones leave the app running so the user can retry
    fn lifecycle(&mut self, event_loop: &ActiveEventLoop, result: sharedcam::Result<()>) {
        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => self.fail(event_loop, e),
            Err(e) => warn!("{}", e),
        }
    }

    fn handle_key(&self, key: &Key) {
        let controls = self.orchestrator.controls();
        match key {
            Key::Named(NamedKey::ArrowRight) => {
                controls.next_viz_mode();
            }
            Key::Named(NamedKey::ArrowLeft) => {
                controls.prev_viz_mode();
            }
            Key::Named(NamedKey::ArrowUp) => {
                let t = controls.set_threshold(controls.threshold() + THRESHOLD_STEP);
                debug!("Depth threshold: {}", t);
            }
            Key::Named(NamedKey::ArrowDown) => {
                let t = controls.set_threshold(controls.threshold().saturating_sub(THRESHOLD_STEP));
                debug!("Depth threshold: {}", t);
            }
            _ => {}
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.pipeline.is_none() {
            let config = self.orchestrator.config().render.clone();
            let gpu = match WgpuBackend::new(event_loop, &config, self.preview.clone()) {
                Ok(gpu) => gpu,
                Err(e) => return self.fail(event_loop, e),
            };
            let mut pipeline = self.orchestrator.render_pipeline(gpu, Resolution::new(config.width, config.height));
            let size = pipeline.gpu().surface_size();
            if let Err(e) = pipeline.on_context_created() {
                return self.fail(event_loop, e);
            }
            pipeline.on_surface_resized(size.width, size.height);
            self.pipeline = Some(pipeline);
        }

        let resumed = self.orchestrator.resume();
        self.lifecycle(event_loop, resumed);
        let opened = self.orchestrator.on_surface_created();
        self.lifecycle(event_loop, opened);
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        let paused = self.orchestrator.pause();
        self.lifecycle(event_loop, paused);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Window close requested");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(pipeline) = self.pipeline.as_mut() {
                    pipeline.on_surface_resized(size.width, size.height);
                }
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        logical_key,
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => self.handle_key(&logical_key),
            WindowEvent::RedrawRequested => {
                let Some(pipeline) = self.pipeline.as_mut() else {
                    return;
                };
                match pipeline.on_tick() {
                    Ok(TickOutcome::Drawn) | Ok(TickOutcome::Skipped(_)) => {}
                    Err(e) => self.fail(event_loop, e),
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.quit.try_recv().is_ok() {
            event_loop.exit();
            return;
        }
        if let Some(e) = self.orchestrator.poll_fatal() {
            return self.fail(event_loop, e);
        }
        if let Some(pipeline) = &self.pipeline {
            pipeline.gpu().window.request_redraw();
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sharedcam=debug"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    info!("sharedcam launching...");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let mut config = Config::load(config_path.as_deref())?;
    if config.pipeline.enable_profiling && cfg!(not(feature = "profiling")) {
        warn!("Profiling requested but built without the `profiling` feature");
    }

    // Auto-detect capture device if needed
    if config.camera.device.path.is_empty() {
        config.camera.device = utils::auto_detect_device().await?;
    }
    info!("Using capture device: {:?}", config.camera.device);

    let depth_node = match (&config.depth.device, config.depth.enabled) {
        (_, false) => None,
        (Some(node), true) => Some(node.clone()),
        (None, true) => utils::detect_depth_node(config.camera.device.path.clone()).await,
    };
    sharedcam::CONFIG.store(Arc::new(config.clone()));

    let preview = PreviewFeed::new();
    let hal = Arc::new(V4l2Camera::new(config.camera.clone(), depth_node.clone(), preview.clone()));
    let depth = match &depth_node {
        Some(node) => DepthFrameSource::new(Box::new(V4l2DepthSensor::new(
            node.clone(),
            &config.depth,
            DEPTH_SURFACE_ID,
        ))),
        None => {
            info!("No depth sensor, color-only mode");
            DepthFrameSource::unavailable()
        }
    };
    let engine = PassthroughEngine::new(
        preview.clone(),
        Resolution::new(config.camera.width, config.camera.height),
        TRACKING_SURFACE_ID,
    );
    let orchestrator = Orchestrator::new(config, hal, Some(Box::new(engine)), depth)?;

    let (quit_tx, quit) = flume::bounded(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            let _ = quit_tx.send(());
        }
    });

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App {
        orchestrator,
        preview,
        pipeline: None,
        quit,
        error: None,
    };
    event_loop.run_app(&mut app)?;

    app.orchestrator.shutdown();
    if let Some(pipeline) = &app.pipeline {
        let stats = pipeline.stats();
        info!(
            "Rendered {} frames, {} depth uploads, {} ticks skipped",
            stats.draws, stats.depth_uploads, stats.skipped
        );
    }
    info!("sharedcam shutting down");

    match app.error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
