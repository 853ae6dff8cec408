//! Background depth acquisition feeding a single "latest frame" slot.
//!
//! The acquisition thread never waits on consumers: each new sample replaces
//! the previous one with an atomic pointer swap, so readers see either the
//! old frame or the new one in full.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::session::SurfaceTarget;
use crate::depth::frame::DepthFrame;
use crate::{Resolution, Result};

/// Consecutive read failures after which acquisition gives up until restarted
const MAX_CONSECUTIVE_FAILURES: u32 = 30;
const RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// A device producing 16-bit depth samples
pub trait DepthSensor: Send {
    fn resolution(&self) -> Resolution;

    /// The output surface the capture session must include for this sensor
    fn surface(&self) -> SurfaceTarget;

    /// Acquire the underlying handle and start streaming
    fn start(&mut self) -> Result<()>;

    /// Wait a bounded time for the next sample; `Ok(None)` when none arrived
    fn next_frame(&mut self) -> Result<Option<Vec<u16>>>;

    /// Release the underlying handle. Called exactly once per successful `start`.
    fn release(&mut self);
}

/// Single-slot, last-writer-wins depth hand-off
#[derive(Debug)]
pub struct DepthSlot {
    latest: ArcSwapOption<DepthFrame>,
    published: AtomicU64,
    capable: AtomicBool,
}

impl DepthSlot {
    pub fn new(capable: bool) -> Arc<Self> {
        Arc::new(Self {
            latest: ArcSwapOption::empty(),
            published: AtomicU64::new(0),
            capable: AtomicBool::new(capable),
        })
    }

    /// Whether a working depth sensor backs this slot
    pub fn is_capable(&self) -> bool {
        self.capable.load(Ordering::Acquire)
    }

    /// The sensor is gone or never produced a sample; consumers fall back to color-only
    pub fn mark_incapable(&self) {
        if self.capable.swap(false, Ordering::AcqRel) {
            warn!("Depth capability lost, rendering color-only");
        }
    }

    fn mark_capable(&self) {
        self.capable.store(true, Ordering::Release);
    }

    /// Wrap `samples` as the next frame; malformed buffers are dropped
    pub fn publish(&self, resolution: Resolution, samples: Vec<u16>) -> Option<u64> {
        let sequence = self.published.load(Ordering::Relaxed) + 1;
        let Some(frame) = DepthFrame::new(resolution, samples, sequence) else {
            warn!("Dropping depth buffer that does not match {:?}", resolution);
            return None;
        };
        self.latest.store(Some(Arc::new(frame)));
        self.published.store(sequence, Ordering::Release);
        metrics::counter!("depth_frames").increment(1);
        Some(sequence)
    }

    pub fn latest(&self) -> Option<Arc<DepthFrame>> {
        self.latest.load_full()
    }

    pub fn frame_count(&self) -> u64 {
        self.published.load(Ordering::Acquire)
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Option<Box<dyn DepthSensor>>>,
}

/// Releases the sensor if the acquisition loop unwinds
struct ReleaseOnExit(Option<Box<dyn DepthSensor>>);

impl ReleaseOnExit {
    fn finish(mut self) -> Option<Box<dyn DepthSensor>> {
        self.0.take().map(|mut sensor| {
            sensor.release();
            sensor
        })
    }
}

impl Drop for ReleaseOnExit {
    fn drop(&mut self) {
        if let Some(sensor) = self.0.as_mut() {
            sensor.release();
        }
    }
}

pub struct DepthFrameSource {
    slot: Arc<DepthSlot>,
    sensor: Option<Box<dyn DepthSensor>>,
    surface: Option<SurfaceTarget>,
    resolution: Option<Resolution>,
    worker: Option<Worker>,
}

impl DepthFrameSource {
    pub fn new(sensor: Box<dyn DepthSensor>) -> Self {
        Self {
            slot: DepthSlot::new(true),
            surface: Some(sensor.surface()),
            resolution: Some(sensor.resolution()),
            sensor: Some(sensor),
            worker: None,
        }
    }

    /// A source for devices without depth; `latest` is always `None`
    pub fn unavailable() -> Self {
        Self {
            slot: DepthSlot::new(false),
            sensor: None,
            surface: None,
            resolution: None,
            worker: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.slot.is_capable()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Consumer handle for the render thread
    pub fn slot(&self) -> Arc<DepthSlot> {
        self.slot.clone()
    }

    pub fn surface(&self) -> Option<SurfaceTarget> {
        self.surface.clone()
    }

    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn latest(&self) -> Option<Arc<DepthFrame>> {
        self.slot.latest()
    }

    pub fn frame_count(&self) -> u64 {
        self.slot.frame_count()
    }

    #[instrument(skip(self))]
    pub fn start(&mut self) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(mut sensor) = self.sensor.take() else {
            debug!("No depth sensor, color-only mode");
            return Ok(());
        };

        if let Err(e) = sensor.start() {
            warn!("Depth sensor failed to start, continuing color-only: {}", e);
            self.sensor = Some(sensor);
            self.slot.mark_incapable();
            return Ok(());
        }
        self.slot.mark_capable();

        let stop = Arc::new(AtomicBool::new(false));
        let slot = self.slot.clone();
        let resolution = sensor.resolution();
        let spawned = thread::Builder::new().name("depth-acquisition".into()).spawn({
            let stop = stop.clone();
            move || {
                let mut guard = ReleaseOnExit(Some(sensor));
                if let Some(sensor) = guard.0.as_deref_mut() {
                    acquire(sensor, &slot, resolution, &stop);
                }
                guard.finish()
            }
        });

        match spawned {
            Ok(handle) => {
                info!("Depth acquisition started at {}x{}", resolution.width, resolution.height);
                self.worker = Some(Worker { stop, handle });
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn depth thread: {}", e);
                Err(e)
            }
        }
    }

    /// Stop acquisition, join the thread and release the sensor
    #[instrument(skip(self))]
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        match worker.handle.join() {
            Ok(sensor) => self.sensor = sensor,
            Err(_) => error!("Depth acquisition thread panicked, sensor dropped"),
        }
        info!("Depth acquisition stopped after {} frames", self.slot.frame_count());
    }
}

impl Drop for DepthFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquire(sensor: &mut dyn DepthSensor, slot: &DepthSlot, resolution: Resolution, stop: &AtomicBool) {
    let mut failures = 0;
    while !stop.load(Ordering::Acquire) {
        match sensor.next_frame() {
            Ok(Some(samples)) => {
                failures = 0;
                slot.publish(resolution, samples);
            }
            Ok(None) => {}
            Err(e) => {
                failures += 1;
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    error!("Depth sensor failed {} times in a row, giving up: {}", failures, e);
                    if slot.latest().is_none() {
                        slot.mark_incapable();
                    }
                    break;
                }
                warn!("Depth read failed: {}", e);
                thread::sleep(RETRY_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::session::SurfaceRole;
    use crate::Error;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Emits `frames` samples then idles, recording lifecycle calls
    struct CountingSensor {
        frames: u16,
        emitted: u16,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_always: bool,
        refuse_start: bool,
    }

    impl DepthSensor for CountingSensor {
        fn resolution(&self) -> Resolution {
            Resolution::new(2, 2)
        }

        fn surface(&self) -> SurfaceTarget {
            SurfaceTarget::new(9, SurfaceRole::Depth)
        }

        fn start(&mut self) -> Result<()> {
            if self.refuse_start {
                return Err(Error::DeviceUnavailable("busy".into()));
            }
            self.log.lock().unwrap().push("start");
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<Vec<u16>>> {
            if self.fail_always {
                return Err(Error::DeviceUnavailable("unplugged".into()));
            }
            thread::sleep(Duration::from_millis(1));
            if self.emitted < self.frames {
                self.emitted += 1;
                Ok(Some(vec![self.emitted; 4]))
            } else {
                Ok(None)
            }
        }

        fn release(&mut self) {
            self.log.lock().unwrap().push("release");
        }
    }

    fn sensor(frames: u16, log: &Arc<Mutex<Vec<&'static str>>>) -> Box<dyn DepthSensor> {
        Box::new(CountingSensor {
            frames,
            emitted: 0,
            log: log.clone(),
            fail_always: false,
            refuse_start: false,
        })
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn unavailable_source_is_permanently_empty() {
        let mut source = DepthFrameSource::unavailable();
        source.start().unwrap();
        assert!(!source.is_available());
        assert!(!source.is_running());
        assert!(source.latest().is_none());
        assert!(source.surface().is_none());
        source.stop();
    }

    #[test]
    fn latest_is_idempotent_between_arrivals() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut source = DepthFrameSource::new(sensor(3, &log));
        assert!(source.latest().is_none());

        source.start().unwrap();
        wait_for(|| source.frame_count() == 3);

        let a = source.latest().unwrap();
        let b = source.latest().unwrap();
        assert_eq!(a.sequence(), 3);
        assert_eq!(a.sequence(), b.sequence());
        assert_eq!(a.samples(), b.samples());
        assert_eq!(a.samples(), &[3, 3, 3, 3]);

        source.stop();
    }

    #[test]
    fn stop_releases_sensor_and_allows_restart() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut source = DepthFrameSource::new(sensor(1, &log));

        source.start().unwrap();
        wait_for(|| source.frame_count() == 1);
        source.stop();
        assert!(!source.is_running());
        assert_eq!(*log.lock().unwrap(), vec!["start", "release"]);

        source.start().unwrap();
        source.stop();
        assert_eq!(*log.lock().unwrap(), vec!["start", "release", "start", "release"]);
        // last frame survives a restart
        assert_eq!(source.latest().unwrap().sequence(), 1);
    }

    #[test]
    fn persistent_failures_end_acquisition_but_release_sensor() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut source = DepthFrameSource::new(Box::new(CountingSensor {
            frames: 0,
            emitted: 0,
            log: log.clone(),
            fail_always: true,
            refuse_start: false,
        }));

        source.start().unwrap();
        wait_for(|| log.lock().unwrap().contains(&"release"));
        source.stop();
        assert!(source.latest().is_none());
        // no sample ever arrived, so consumers stop waiting for one
        assert!(!source.is_available());
    }

    #[test]
    fn sensor_that_refuses_to_start_degrades_to_color_only() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut source = DepthFrameSource::new(Box::new(CountingSensor {
            frames: 1,
            emitted: 0,
            log: log.clone(),
            fail_always: false,
            refuse_start: true,
        }));
        assert!(source.is_available());

        source.start().unwrap();
        assert!(!source.is_running());
        assert!(!source.is_available());
        assert!(!source.slot().is_capable());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn slot_sequence_is_monotonic_and_drops_bad_buffers() {
        let slot = DepthSlot::new(true);
        let res = Resolution::new(1, 2);
        assert_eq!(slot.publish(res, vec![1, 2]), Some(1));
        assert_eq!(slot.publish(res, vec![1]), None);
        assert_eq!(slot.publish(res, vec![3, 4]), Some(2));
        assert_eq!(slot.latest().unwrap().samples(), &[3, 4]);
    }
}
