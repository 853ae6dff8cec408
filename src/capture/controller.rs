//! Owner of the camera device and its capture-session state machine

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::capture::frame_ready::FrameReady;
use crate::capture::gate::ChangesGate;
use crate::capture::hal::CameraHal;
use crate::capture::session::{
    transition, Action, CameraSession, CaptureEvent, RequestTemplate, SessionState, SurfaceTarget,
};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct CaptureStats {
    completed: AtomicU64,
    failed: AtomicU64,
    submitted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub submitted: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    state: SessionState,
    session: Option<CameraSession>,
    failed: bool,
    open_failure: Option<String>,
}

pub struct CaptureSessionController {
    hal: Arc<dyn CameraHal>,
    inner: Mutex<Inner>,
    gate: Arc<ChangesGate>,
    frame_ready: Arc<FrameReady>,
    events: flume::Sender<CaptureEvent>,
    fatal: flume::Sender<Error>,
    template: RequestTemplate,
    gate_timeout: Duration,
    stats: CaptureStats,
}

impl CaptureSessionController {
    pub fn new(
        hal: Arc<dyn CameraHal>,
        frame_ready: Arc<FrameReady>,
        gate: Arc<ChangesGate>,
        events: flume::Sender<CaptureEvent>,
        fatal: flume::Sender<Error>,
        template: RequestTemplate,
        gate_timeout: Duration,
    ) -> Self {
        Self {
            hal,
            inner: Mutex::new(Inner {
                state: SessionState::Closed,
                session: None,
                failed: false,
                open_failure: None,
            }),
            gate,
            frame_ready,
            events,
            fatal,
            template,
            gate_timeout,
            stats: CaptureStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Set when the last session ended through a device-level failure
    pub fn has_failed(&self) -> bool {
        self.lock().failed
    }

    pub fn session(&self) -> Option<CameraSession> {
        self.lock().session.clone()
    }

    pub fn stats(&self) -> CaptureStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn gate(&self) -> &Arc<ChangesGate> {
        &self.gate
    }

    /// Start opening `device_id`; the session is built over `targets` once the device is up
    #[instrument(skip(self, targets), fields(targets = targets.len()))]
    pub fn open(&self, device_id: &str, targets: Vec<SurfaceTarget>) -> Result<()> {
        if !self.hal.has_permission() {
            return Err(Error::DeviceUnavailable(
                "camera permission not granted".into(),
            ));
        }

        let mut inner = self.lock();
        if inner.state != SessionState::Closed {
            return Err(Error::DeviceUnavailable(format!(
                "camera {} already open ({:?})",
                device_id, inner.state
            )));
        }

        let mut session = CameraSession::new(device_id, self.template);
        for target in targets {
            session.add_target(target)?;
        }
        inner.session = Some(session);
        inner.failed = false;
        inner.open_failure = None;

        self.dispatch_locked(&mut inner, CaptureEvent::OpenRequested);

        match inner.open_failure.take() {
            Some(reason) => Err(Error::DeviceUnavailable(reason)),
            None => {
                info!("Opening camera {}", device_id);
                Ok(())
            }
        }
    }

    pub fn on_session_configured(&self) -> bool {
        self.dispatch(CaptureEvent::SessionConfigured)
    }

    pub fn on_capture_completed(&self, frame_number: u64) -> bool {
        self.dispatch(CaptureEvent::CaptureCompleted { frame_number })
    }

    /// Tear down the session and release the device.
    ///
    /// Waits for any in-flight configuration to settle first. A timeout leaves
    /// everything in place and reports [`Error::ConfigurationRace`]; a
    /// cancelled wait tears down regardless so no handle outlives shutdown.
    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        match self.gate.wait(self.gate_timeout) {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                warn!("Close cancelled while a configuration was in flight, forcing teardown")
            }
            Err(e) => return Err(e),
        }

        let mut inner = self.lock();
        if !self.gate.changes_possible() && !self.gate.is_cancelled() {
            return Err(Error::ConfigurationRace(
                "a new configuration started before close".into(),
            ));
        }

        self.dispatch_locked(&mut inner, CaptureEvent::CloseRequested);
        if inner.state == SessionState::Pausing {
            self.dispatch_locked(&mut inner, CaptureEvent::DeviceClosed);
        }
        inner.session = None;
        self.frame_ready.clear();

        info!("Camera closed");
        Ok(())
    }

    /// Block until the session reaches `Active`
    pub fn wait_until_active(&self, timeout: Duration) -> Result<()> {
        self.gate.wait(timeout)?;
        match self.lock().state {
            SessionState::Active => Ok(()),
            state => Err(Error::DeviceUnavailable(format!(
                "capture session settled in {:?} instead of Active",
                state
            ))),
        }
    }

    /// Rebuild the repeating request from the current session and resubmit it
    pub fn resubmit_repeating(&self) -> Result<()> {
        let inner = self.lock();
        if inner.state != SessionState::Active || !self.gate.changes_possible() {
            return Err(Error::ConfigurationRace(format!(
                "cannot build a request while {:?}",
                inner.state
            )));
        }
        self.submit(&inner)
    }

    /// Feed one hardware or controller event through the state machine.
    /// Returns whether the event was valid in the current state.
    pub fn dispatch(&self, event: CaptureEvent) -> bool {
        let mut inner = self.lock();
        self.dispatch_locked(&mut inner, event)
    }

    fn dispatch_locked(&self, inner: &mut Inner, event: CaptureEvent) -> bool {
        let mut queue = VecDeque::from([event]);
        let mut first = None;

        while let Some(event) = queue.pop_front() {
            let step = transition(inner.state, &event);
            first.get_or_insert(step.accepted);

            if !step.accepted {
                debug!(state = ?inner.state, ?event, "Ignoring capture event");
                continue;
            }
            if step.next != inner.state {
                debug!(from = ?inner.state, to = ?step.next, ?event, "Capture session transition");
            }
            inner.state = step.next;

            for action in step.actions {
                if let Some(follow_up) = self.execute(inner, action, &event) {
                    queue.push_back(follow_up);
                }
            }
        }

        first.unwrap_or(false)
    }

    fn execute(&self, inner: &mut Inner, action: Action, cause: &CaptureEvent) -> Option<CaptureEvent> {
        match action {
            Action::BeginChange => self.gate.begin_change(),
            Action::FinishChange => self.gate.finish_change(),
            Action::OpenDevice => {
                let device_id = inner.session.as_ref()?.device_id().to_owned();
                if let Err(e) = self.hal.open(&device_id, self.events.clone()) {
                    warn!("Failed to open camera {}: {}", device_id, e);
                    inner.open_failure = Some(e.to_string());
                    return Some(CaptureEvent::DeviceOpenFailed(e.to_string()));
                }
            }
            Action::CreateSession => {
                let session = inner.session.as_mut()?;
                match self.hal.create_session(session) {
                    Ok(()) => session.mark_configured(),
                    Err(e) => {
                        error!("Failed to create capture session: {}", e);
                        return Some(CaptureEvent::SessionConfigureFailed);
                    }
                }
            }
            Action::SubmitRepeating => {
                if let Err(e) = self.submit(inner) {
                    error!("Failed to set repeating request: {}", e);
                }
            }
            Action::SignalFrameReady => {
                self.frame_ready.signal();
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("capture_completed").increment(1);
            }
            Action::RecordCaptureFailure => {
                warn!(?cause, "Capture failed");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("capture_failed").increment(1);
            }
            Action::CloseSession => self.hal.close_session(),
            Action::CloseDevice => self.hal.close_device(),
            Action::ReportFatal(reason) => {
                error!("Camera fatal: {}", reason);
                inner.failed = true;
                inner.session = None;
                self.frame_ready.clear();
                if self.fatal.send(Error::DeviceFatal(reason)).is_err() {
                    debug!("Fatal signal dropped, orchestrator already gone");
                }
            }
        }
        None
    }

    fn submit(&self, inner: &Inner) -> Result<()> {
        let session = inner
            .session
            .as_ref()
            .ok_or_else(|| Error::ConfigurationRace("no capture session".into()))?;
        self.hal.submit_repeating(&session.build_request())?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Background thread delivering hardware callbacks to the controller
pub struct CallbackThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CallbackThread {
    pub fn spawn(
        controller: Arc<CaptureSessionController>,
        events: flume::Receiver<CaptureEvent>,
        poll: Duration,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new().name("camera-callbacks".into()).spawn({
            let stop = stop.clone();
            move || {
                while !stop.load(Ordering::Acquire) {
                    match events.recv_timeout(poll) {
                        Ok(event) => {
                            controller.dispatch(event);
                        }
                        Err(flume::RecvTimeoutError::Timeout) => {}
                        Err(flume::RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Camera callback thread exiting");
            }
        })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Camera callback thread panicked");
            }
        }
    }
}

impl Drop for CallbackThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
