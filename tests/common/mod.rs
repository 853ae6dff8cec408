// tests/common/mod.rs: Scripted hardware, tracking engine and GPU shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sharedcam::capture::{
    CameraHal, CameraSession, CaptureEvent, CaptureRequest, EventSender, SurfaceRole, SurfaceTarget,
};
use sharedcam::depth::{DepthFrame, DepthSensor};
use sharedcam::render::{DrawCall, GpuBackend, ProgramId, TextureId, Topology, Uniforms};
use sharedcam::tracking::frame::{Intrinsics, IDENTITY};
use sharedcam::tracking::{
    Camera, DisplayRotation, Frame, QuadCoords, TrackingEngine, TrackingOptions, TrackingState,
};
use sharedcam::{Config, Error, Resolution, Result};

pub const DEVICE: &str = "/dev/mock0";

pub fn config() -> Config {
    let mut config = Config::default();
    config.camera.device.path = DEVICE.into();
    config.pipeline.gate_timeout_ms = 5_000;
    config.pipeline.callback_poll_ms = 5;
    config
}

pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(1));
    }
}

// ===== Camera =====

/// Camera stack that answers every request through the event channel
#[derive(Default)]
pub struct MockHal {
    calls: Mutex<Vec<&'static str>>,
    events: Mutex<Option<EventSender>>,
    configure_delay: Option<Duration>,
    depth: Vec<Resolution>,
    targets: Mutex<Vec<SurfaceTarget>>,
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configure_delay(mut self, delay: Duration) -> Self {
        self.configure_delay = Some(delay);
        self
    }

    pub fn with_depth(mut self, resolution: Resolution) -> Self {
        self.depth.push(resolution);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn session_targets(&self) -> Vec<SurfaceTarget> {
        self.targets.lock().unwrap().clone()
    }

    /// Deliver a hardware callback as the device would
    pub fn emit(&self, event: CaptureEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            events.send(event).unwrap();
        }
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

impl CameraHal for MockHal {
    fn has_permission(&self) -> bool {
        true
    }

    fn open(&self, _device_id: &str, events: EventSender) -> Result<()> {
        self.record("open");
        *self.events.lock().unwrap() = Some(events.clone());
        events.send(CaptureEvent::DeviceOpened).unwrap();
        Ok(())
    }

    fn create_session(&self, session: &CameraSession) -> Result<()> {
        self.record("create_session");
        *self.targets.lock().unwrap() = session.targets().to_vec();

        let events = self.events.lock().unwrap().clone();
        let Some(events) = events else {
            return Ok(());
        };
        match self.configure_delay {
            Some(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    let _ = events.send(CaptureEvent::SessionConfigured);
                });
            }
            None => events.send(CaptureEvent::SessionConfigured).unwrap(),
        }
        Ok(())
    }

    fn submit_repeating(&self, _request: &CaptureRequest) -> Result<()> {
        self.record("submit_repeating");
        Ok(())
    }

    fn close_session(&self) {
        self.record("close_session");
    }

    fn close_device(&self) {
        self.record("close_device");
    }

    fn depth_resolutions(&self, _device_id: &str) -> Vec<Resolution> {
        self.depth.clone()
    }
}

// ===== Depth =====

pub struct MockSensor {
    pub frames: u16,
    emitted: u16,
    refuse_start: bool,
    fail_reads: bool,
    pub released: Arc<AtomicBool>,
}

impl MockSensor {
    pub fn new(frames: u16) -> Self {
        Self {
            frames,
            emitted: 0,
            refuse_start: false,
            fail_reads: false,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A sensor whose node exists but cannot be opened
    pub fn refusing_start() -> Self {
        Self {
            refuse_start: true,
            ..Self::new(0)
        }
    }

    /// A sensor that starts but errors on every read
    pub fn failing_reads() -> Self {
        Self {
            fail_reads: true,
            ..Self::new(0)
        }
    }
}

impl DepthSensor for MockSensor {
    fn resolution(&self) -> Resolution {
        Resolution::new(240, 180)
    }

    fn surface(&self) -> SurfaceTarget {
        SurfaceTarget::new(2, SurfaceRole::Depth)
    }

    fn start(&mut self) -> Result<()> {
        if self.refuse_start {
            return Err(Error::DeviceUnavailable("depth node busy".into()));
        }
        self.released.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u16>>> {
        thread::sleep(Duration::from_millis(1));
        if self.fail_reads {
            return Err(Error::DeviceUnavailable("depth read failed".into()));
        }
        if self.emitted == self.frames {
            return Ok(None);
        }
        self.emitted += 1;
        Ok(Some(vec![1000 + self.emitted; 240 * 180]))
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

// ===== Tracking =====

#[derive(Default)]
pub struct EngineSpy {
    pub transforms: AtomicU32,
    pub resumed: AtomicBool,
    pub preview_texture: Mutex<Option<TextureId>>,
}

pub struct MockEngine {
    spy: Arc<EngineSpy>,
    geometry_changed: bool,
    timestamp_ns: i64,
}

impl MockEngine {
    pub fn new() -> (Self, Arc<EngineSpy>) {
        let spy = Arc::new(EngineSpy::default());
        (
            Self {
                spy: spy.clone(),
                geometry_changed: false,
                timestamp_ns: 0,
            },
            spy,
        )
    }
}

impl TrackingEngine for MockEngine {
    fn configure(&mut self, _options: &TrackingOptions) -> Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.spy.resumed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&mut self) {
        self.spy.resumed.store(false, Ordering::SeqCst);
    }

    fn update(&mut self) -> Result<Frame> {
        self.timestamp_ns += 33_000_000;
        Ok(Frame {
            timestamp_ns: self.timestamp_ns,
            display_geometry_changed: std::mem::take(&mut self.geometry_changed),
            camera: Camera {
                tracking_state: TrackingState::Tracking,
                view: IDENTITY,
                intrinsics: Intrinsics::from_fov(1280, 720, 60.0),
            },
        })
    }

    fn shared_surface_targets(&self) -> Vec<SurfaceTarget> {
        vec![
            SurfaceTarget::new(1, SurfaceRole::TrackingPreview),
            SurfaceTarget::new(3, SurfaceRole::TrackingCpuImage),
        ]
    }

    fn set_preview_texture(&mut self, texture: TextureId) {
        *self.spy.preview_texture.lock().unwrap() = Some(texture);
    }

    fn set_display_geometry(&mut self, _rotation: DisplayRotation, _width: u32, _height: u32) {
        self.geometry_changed = true;
    }

    fn transform_display_uv(&self, _frame: &Frame, ndc: &QuadCoords) -> QuadCoords {
        self.spy.transforms.fetch_add(1, Ordering::SeqCst);
        ndc.map(|c| (c + 1.0) / 2.0)
    }
}

// ===== GPU =====

#[derive(Debug, Clone)]
pub struct RecordedDraw {
    pub program: ProgramId,
    pub color: TextureId,
    pub depth: TextureId,
    pub uniforms: Uniforms,
    pub uvs: QuadCoords,
    pub topology: Topology,
    pub vertex_count: u32,
}

#[derive(Default)]
pub struct RecordingGpu {
    next_id: u32,
    pub depth_textures: Vec<(TextureId, Resolution)>,
    pub depth_uploads: Vec<(TextureId, u64)>,
    pub draws: Vec<RecordedDraw>,
    pub viewport: Option<(u32, u32)>,
    pub fail_uploads: bool,
    pending_error: Option<String>,
}

impl RecordingGpu {
    fn id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

impl GpuBackend for RecordingGpu {
    fn create_external_texture(&mut self) -> Result<TextureId> {
        Ok(TextureId(self.id()))
    }

    fn create_depth_texture(&mut self, resolution: Resolution) -> Result<TextureId> {
        let id = TextureId(self.id());
        self.depth_textures.push((id, resolution));
        Ok(id)
    }

    fn create_program(&mut self, _source: &str) -> Result<ProgramId> {
        Ok(ProgramId(self.id()))
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.viewport = Some((width, height));
    }

    fn upload_depth(&mut self, texture: TextureId, frame: &DepthFrame) -> Result<()> {
        if self.fail_uploads {
            self.pending_error = Some("invalid value".into());
        }
        self.depth_uploads.push((texture, frame.sequence()));
        Ok(())
    }

    fn draw_quad(&mut self, call: &DrawCall<'_>) -> Result<()> {
        self.draws.push(RecordedDraw {
            program: call.program,
            color: call.color,
            depth: call.depth,
            uniforms: *call.uniforms,
            uvs: *call.uvs,
            topology: call.topology,
            vertex_count: call.vertex_count,
        });
        Ok(())
    }

    fn poll_error(&mut self) -> Option<String> {
        self.pending_error.take()
    }
}
