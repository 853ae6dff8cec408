// tests/test_render.rs: Render ticks over a live orchestrator with a recording GPU backend.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{config, wait_for, EngineSpy, MockEngine, MockHal, MockSensor, RecordingGpu};
use sharedcam::depth::DepthFrameSource;
use sharedcam::render::{RenderPipeline, SkipReason, TickOutcome, Topology, VIZ_MODE_COUNT};
use sharedcam::{Error, Orchestrator, Resolution};

const SCREEN: Resolution = Resolution {
    width: 1080,
    height: 2220,
};

struct Rig {
    hal: Arc<MockHal>,
    spy: Arc<EngineSpy>,
    orchestrator: Orchestrator,
    pipeline: RenderPipeline<RecordingGpu>,
}

fn rig(depth_frames: Option<u16>) -> Rig {
    match depth_frames {
        Some(frames) => rig_with_sensor(MockSensor::new(frames)),
        None => rig_with(MockHal::new(), DepthFrameSource::unavailable()),
    }
}

fn rig_with_sensor(sensor: MockSensor) -> Rig {
    rig_with(
        MockHal::new().with_depth(Resolution::new(240, 180)),
        DepthFrameSource::new(Box::new(sensor)),
    )
}

fn rig_with(hal: MockHal, depth: DepthFrameSource) -> Rig {
    let hal = Arc::new(hal);
    let (engine, spy) = MockEngine::new();
    let mut orchestrator =
        Orchestrator::new(config(), hal.clone(), Some(Box::new(engine)), depth).unwrap();

    let mut pipeline = orchestrator.render_pipeline(RecordingGpu::default(), SCREEN);
    pipeline.on_context_created().unwrap();
    pipeline.on_surface_resized(SCREEN.width, SCREEN.height);
    orchestrator.resume().unwrap();
    orchestrator.on_surface_created().unwrap();

    Rig {
        hal,
        spy,
        orchestrator,
        pipeline,
    }
}

impl Rig {
    fn wait_for_depth(&self, frames: u64) {
        let slot = self.orchestrator.depth_slot();
        wait_for(|| slot.frame_count() >= frames);
    }

    fn complete_capture(&self) {
        self.orchestrator.controller().on_capture_completed(1);
    }
}

#[test]
fn capture_completion_drives_exactly_one_composite_draw() {
    let mut rig = rig(Some(1));
    rig.wait_for_depth(1);
    rig.orchestrator.controls().set_threshold(50);

    rig.complete_capture();
    assert_eq!(rig.pipeline.on_tick().unwrap(), TickOutcome::Drawn);
    assert_eq!(
        rig.pipeline.on_tick().unwrap(),
        TickOutcome::Skipped(SkipReason::NoNewFrame)
    );

    let gpu = rig.pipeline.gpu();
    assert_eq!(gpu.depth_uploads.len(), 1);
    assert_eq!(gpu.draws.len(), 1);
    assert_eq!(gpu.viewport, Some((SCREEN.width, SCREEN.height)));

    let draw = &gpu.draws[0];
    assert_eq!(draw.topology, Topology::TriangleStrip);
    assert_eq!(draw.vertex_count, 4);
    assert_eq!(draw.depth, gpu.depth_uploads[0].0);
    assert_eq!(Some(draw.color), rig.pipeline.color_texture());
    assert_eq!(*rig.spy.preview_texture.lock().unwrap(), Some(draw.color));

    let u = draw.uniforms;
    assert_eq!(u.screen_resolution, [1080.0, 2220.0]);
    assert_eq!(u.depth_resolution, [240.0, 180.0]);
    assert_eq!(u.has_depth, 1);
    assert!((u.depth_threshold - 0.5).abs() < 1e-6);
    assert!((u.depth_y_offset + 156.67).abs() < 0.01);
    assert!(rig.pipeline.pose().is_some());

    rig.orchestrator.pause().unwrap();
    assert!(rig.hal.calls().ends_with(&["close_session", "close_device"]));
}

#[test]
fn idle_camera_never_draws() {
    let mut rig = rig(Some(1));
    rig.wait_for_depth(1);

    for _ in 0..100 {
        assert_eq!(
            rig.pipeline.on_tick().unwrap(),
            TickOutcome::Skipped(SkipReason::NoNewFrame)
        );
    }
    assert!(rig.pipeline.gpu().draws.is_empty());
    assert!(rig.pipeline.gpu().depth_uploads.is_empty());
    assert_eq!(rig.pipeline.stats().skipped, 100);
}

#[test]
fn display_transform_recomputed_only_on_geometry_change() {
    let mut rig = rig(None);

    for tick in 0..10 {
        if tick == 3 || tick == 7 {
            rig.pipeline.on_surface_resized(SCREEN.height, SCREEN.width);
        }
        rig.complete_capture();
        assert_eq!(rig.pipeline.on_tick().unwrap(), TickOutcome::Drawn);
    }

    assert_eq!(rig.spy.transforms.load(Ordering::SeqCst), 3);
    assert_eq!(rig.orchestrator.tracking().transform_count(), 3);
    assert_eq!(rig.pipeline.gpu().draws.len(), 10);
}

#[test]
fn depth_capable_device_waits_for_first_sample() {
    let mut rig = rig(Some(0));

    rig.complete_capture();
    assert_eq!(
        rig.pipeline.on_tick().unwrap(),
        TickOutcome::Skipped(SkipReason::DepthNotReady)
    );
    // the pending frame is kept for when depth arrives
    assert!(rig.orchestrator.frame_ready().is_set());
    assert!(rig.pipeline.gpu().draws.is_empty());
}

#[test]
fn color_only_device_draws_without_depth() {
    let mut rig = rig(None);

    rig.complete_capture();
    assert_eq!(rig.pipeline.on_tick().unwrap(), TickOutcome::Drawn);

    let gpu = rig.pipeline.gpu();
    assert!(gpu.depth_uploads.is_empty());
    assert_eq!(gpu.draws[0].uniforms.has_depth, 0);
    assert_eq!(gpu.draws[0].uniforms.depth_y_offset, 0.0);
}

#[test]
fn tick_before_context_keeps_pending_frame() {
    let hal = Arc::new(MockHal::new());
    let (engine, _spy) = MockEngine::new();
    let mut orchestrator = Orchestrator::new(
        config(),
        hal,
        Some(Box::new(engine)),
        DepthFrameSource::unavailable(),
    )
    .unwrap();
    let mut pipeline = orchestrator.render_pipeline(RecordingGpu::default(), SCREEN);
    orchestrator.on_surface_created().unwrap();
    orchestrator.resume().unwrap();

    orchestrator.controller().on_capture_completed(1);
    assert_eq!(
        pipeline.on_tick().unwrap(),
        TickOutcome::Skipped(SkipReason::NoContext)
    );
    assert!(orchestrator.frame_ready().is_set());

    pipeline.on_context_created().unwrap();
    assert_eq!(pipeline.on_tick().unwrap(), TickOutcome::Drawn);
}

#[test]
fn viz_mode_clamps_at_both_ends() {
    let rig = rig(None);
    let controls = rig.orchestrator.controls();

    assert_eq!(controls.prev_viz_mode(), 0);
    for _ in 0..20 {
        controls.next_viz_mode();
    }
    assert_eq!(controls.viz_mode(), VIZ_MODE_COUNT - 1);

    assert_eq!(controls.set_threshold(0), 1);
    assert_eq!(controls.set_threshold(250), 100);
}

#[test]
fn graphics_error_aborts_rendering() {
    let mut rig = rig(Some(2));
    rig.wait_for_depth(1);
    rig.pipeline.gpu_mut().fail_uploads = true;

    rig.complete_capture();
    let err = rig.pipeline.on_tick().unwrap_err();
    assert!(matches!(err, Error::GraphicsError { stage: "depth upload", .. }));
    assert!(err.is_fatal());
    assert!(rig.pipeline.is_aborted());
    assert!(rig.pipeline.gpu().draws.is_empty());

    rig.complete_capture();
    assert_eq!(rig.pipeline.on_tick().unwrap_err(), err);
}

#[test]
fn depth_sensor_that_fails_to_start_falls_back_to_color_only() {
    let mut rig = rig_with_sensor(MockSensor::refusing_start());
    assert!(!rig.orchestrator.depth_slot().is_capable());

    for _ in 0..5 {
        rig.complete_capture();
        assert_eq!(rig.pipeline.on_tick().unwrap(), TickOutcome::Drawn);
    }

    let gpu = rig.pipeline.gpu();
    assert_eq!(gpu.draws.len(), 5);
    assert!(gpu.depth_uploads.is_empty());
    assert!(gpu.draws.iter().all(|d| d.uniforms.has_depth == 0));
}

#[test]
fn depth_sensor_failing_before_first_sample_falls_back_to_color_only() {
    let mut rig = rig_with_sensor(MockSensor::failing_reads());

    rig.complete_capture();
    let slot = rig.orchestrator.depth_slot();
    wait_for(|| !slot.is_capable());

    assert_eq!(rig.pipeline.on_tick().unwrap(), TickOutcome::Drawn);
    let draw = &rig.pipeline.gpu().draws[0];
    assert_eq!(draw.uniforms.has_depth, 0);
    assert_eq!(draw.uniforms.depth_resolution, [0.0, 0.0]);
}
