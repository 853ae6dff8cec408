//! Lifecycle owner wiring capture, depth, tracking and rendering together.
//!
//! Pause order: wait for the changes-possible gate, pause tracking, close the
//! camera, stop depth acquisition, stop the callback thread. Resume runs the
//! reverse: threads first, then the camera, then tracking once the capture
//! session is active.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{error, info, instrument, warn};

use crate::capture::controller::{CallbackThread, CaptureSessionController};
use crate::capture::frame_ready::FrameReady;
use crate::capture::gate::ChangesGate;
use crate::capture::hal::CameraHal;
use crate::capture::session::{CaptureEvent, SessionState, SurfaceTarget};
use crate::depth::{DepthFrameSource, DepthSlot};
use crate::render::gpu::GpuBackend;
use crate::render::pipeline::RenderPipeline;
use crate::render::uniforms::RenderControls;
use crate::tracking::{TrackingEngine, TrackingSessionAdapter};
use crate::{Config, Error, Resolution, Result};

pub struct Orchestrator {
    config: Config,
    device_id: String,
    hal: Arc<dyn CameraHal>,
    controller: Arc<CaptureSessionController>,
    events: flume::Receiver<CaptureEvent>,
    callbacks: Option<CallbackThread>,
    tracking: Arc<Mutex<TrackingSessionAdapter>>,
    depth: DepthFrameSource,
    frame_ready: Arc<FrameReady>,
    controls: Arc<RenderControls>,
    fatal: flume::Receiver<Error>,
    surface_created: bool,
    resumed: bool,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        hal: Arc<dyn CameraHal>,
        engine: Option<Box<dyn TrackingEngine>>,
        depth: DepthFrameSource,
    ) -> Result<Self> {
        let frame_ready = FrameReady::new();
        let (events_tx, events) = flume::unbounded();
        let (fatal_tx, fatal) = flume::unbounded();

        let controller = Arc::new(CaptureSessionController::new(
            hal.clone(),
            frame_ready.clone(),
            ChangesGate::new(),
            events_tx,
            fatal_tx,
            config.camera.template,
            config.pipeline.gate_timeout(),
        ));

        let mut adapter = TrackingSessionAdapter::new(engine, frame_ready.clone())
            .with_clip_planes(config.render.near_plane, config.render.far_plane);
        if adapter.has_session() {
            adapter.configure(config.tracking)?;
        } else {
            warn!("No tracking engine, rendering will wait for one");
        }

        let controls = RenderControls::new(config.render.max_viz_mode, config.render.depth_threshold);

        Ok(Self {
            device_id: config.camera.device.path.clone(),
            config,
            hal,
            controller,
            events,
            callbacks: None,
            tracking: Arc::new(Mutex::new(adapter)),
            depth,
            frame_ready,
            controls,
            fatal,
            surface_created: false,
            resumed: false,
        })
    }

    pub fn controller(&self) -> &Arc<CaptureSessionController> {
        &self.controller
    }

    pub fn tracking(&self) -> MutexGuard<'_, TrackingSessionAdapter> {
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn frame_ready(&self) -> &Arc<FrameReady> {
        &self.frame_ready
    }

    pub fn depth_slot(&self) -> Arc<DepthSlot> {
        self.depth.slot()
    }

    pub fn controls(&self) -> &Arc<RenderControls> {
        &self.controls
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A render pipeline sharing this orchestrator's frame signal, depth slot and tracking session
    pub fn render_pipeline<G: GpuBackend>(&self, gpu: G, screen: Resolution) -> RenderPipeline<G> {
        RenderPipeline::new(
            gpu,
            self.tracking.clone(),
            self.frame_ready.clone(),
            self.depth.slot(),
            self.depth.resolution().unwrap_or(self.config.depth.resolution()),
            self.controls.clone(),
            screen,
        )
    }

    /// The depth surface joins the session only when the camera advertises depth output
    /// and the sensor came up
    fn depth_surface(&self) -> Option<SurfaceTarget> {
        if !self.depth.is_available() {
            return None;
        }
        let surface = self.depth.surface()?;
        if self.hal.depth_resolutions(&self.device_id).is_empty() {
            return None;
        }
        Some(surface)
    }

    #[instrument(skip(self))]
    pub fn resume(&mut self) -> Result<()> {
        if self.resumed {
            return Ok(());
        }
        self.controller.gate().reset();

        if self.callbacks.is_none() {
            let callbacks = CallbackThread::spawn(
                self.controller.clone(),
                self.events.clone(),
                self.config.pipeline.callback_poll(),
            )
            .map_err(|e| Error::DeviceUnavailable(format!("camera callback thread: {}", e)))?;
            self.callbacks = Some(callbacks);
        }
        self.depth
            .start()
            .map_err(|e| Error::DeviceUnavailable(format!("depth thread: {}", e)))?;
        self.resumed = true;

        if self.surface_created {
            self.open_camera()?;
        }
        info!("Resumed");
        Ok(())
    }

    /// The render surface exists; the camera can be opened now
    #[instrument(skip(self))]
    pub fn on_surface_created(&mut self) -> Result<()> {
        self.surface_created = true;
        if self.resumed && self.controller.state() == SessionState::Closed {
            self.open_camera()?;
        }
        Ok(())
    }

    fn open_camera(&mut self) -> Result<()> {
        let mut targets = self.tracking().shared_surface_targets();
        targets.extend(self.depth_surface());

        self.controller.open(&self.device_id, targets)?;
        self.controller
            .wait_until_active(self.config.pipeline.gate_timeout())?;
        self.tracking().resume()
    }

    #[instrument(skip(self))]
    pub fn pause(&mut self) -> Result<()> {
        if !self.resumed {
            return Ok(());
        }

        match self.controller.gate().wait(self.config.pipeline.gate_timeout()) {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(e) => return Err(e),
        }
        self.tracking().pause();
        let closed = self.controller.close();
        self.depth.stop();
        if let Some(callbacks) = self.callbacks.take() {
            callbacks.stop();
        }
        self.resumed = false;

        info!("Paused");
        closed
    }

    /// Cancel in-flight waits and tear everything down
    #[instrument(skip(self))]
    pub fn shutdown(&mut self) {
        self.controller.gate().cancel();
        if let Err(e) = self.pause() {
            error!("Teardown incomplete: {}", e);
        }
    }

    /// Next fatal device error reported by the camera stack, if any.
    /// Camera, depth and callback threads are already torn down when it is returned.
    pub fn poll_fatal(&mut self) -> Option<Error> {
        let fatal = self.fatal.try_recv().ok()?;
        error!("Tearing down after fatal error: {}", fatal);
        if let Err(e) = self.pause() {
            error!("Teardown incomplete: {}", e);
        }
        Some(fatal)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.resumed {
            self.shutdown();
        }
    }
}
