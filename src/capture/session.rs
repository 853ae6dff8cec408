//! Capture-session lifecycle as one explicit state machine.
//!
//! Hardware callbacks (device opened, session configured, capture completed,
//! errors) and controller commands (open, close) are all [`CaptureEvent`]s.
//! [`transition`] is a pure function from `(state, event)` to the next state
//! and the side effects the controller must perform, so every path can be
//! tested without hardware.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Closed,
    Opening,
    Configuring,
    Active,
    Pausing,
}

impl SessionState {
    /// Whether a device handle is (or may be) held in this state
    pub fn holds_device(&self) -> bool {
        !matches!(self, SessionState::Closed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    OpenRequested,
    CloseRequested,
    DeviceOpened,
    DeviceOpenFailed(String),
    DeviceClosed,
    DeviceDisconnected,
    DeviceError(i32),
    SessionConfigured,
    SessionConfigureFailed,
    CaptureCompleted { frame_number: u64 },
    CaptureFailed { frame_number: u64, reason: String },
    CaptureBufferLost { frame_number: u64 },
    CaptureSequenceAborted { sequence_id: i32 },
}

/// Side effects requested by a transition, executed in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    BeginChange,
    OpenDevice,
    CreateSession,
    SubmitRepeating,
    SignalFrameReady,
    RecordCaptureFailure,
    CloseSession,
    CloseDevice,
    FinishChange,
    ReportFatal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SessionState,
    pub actions: Vec<Action>,
    /// False when the event is not valid in the current state
    pub accepted: bool,
}

impl Transition {
    fn to(next: SessionState, actions: Vec<Action>) -> Self {
        Self {
            next,
            actions,
            accepted: true,
        }
    }

    fn stay(state: SessionState) -> Self {
        Self::to(state, Vec::new())
    }

    fn reject(state: SessionState) -> Self {
        Self {
            next: state,
            actions: Vec::new(),
            accepted: false,
        }
    }
}

pub fn transition(state: SessionState, event: &CaptureEvent) -> Transition {
    use Action::*;
    use CaptureEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Closed, E::OpenRequested) => Transition::to(S::Opening, vec![BeginChange, OpenDevice]),
        (_, E::OpenRequested) => Transition::reject(state),

        (S::Opening, E::DeviceOpened) => Transition::to(S::Configuring, vec![CreateSession]),
        (S::Opening, E::DeviceOpenFailed(_)) => {
            Transition::to(S::Closed, vec![CloseDevice, FinishChange])
        }

        (S::Configuring, E::SessionConfigured) => {
            Transition::to(S::Active, vec![SubmitRepeating, FinishChange])
        }
        (S::Active, E::SessionConfigured) => Transition::to(S::Active, vec![SubmitRepeating]),
        (S::Configuring, E::SessionConfigureFailed) => Transition::to(
            S::Closed,
            vec![
                CloseDevice,
                FinishChange,
                ReportFatal("capture session configuration failed".into()),
            ],
        ),

        (S::Active, E::CaptureCompleted { .. }) => Transition::to(S::Active, vec![SignalFrameReady]),
        // Completions racing a close are dropped
        (_, E::CaptureCompleted { .. }) => Transition::stay(state),

        (
            S::Configuring | S::Active | S::Pausing,
            E::CaptureFailed { .. } | E::CaptureBufferLost { .. } | E::CaptureSequenceAborted { .. },
        ) => Transition::to(state, vec![RecordCaptureFailure]),

        (S::Closed, E::CloseRequested) => Transition::stay(state),
        (S::Opening, E::CloseRequested) => {
            Transition::to(S::Pausing, vec![CloseDevice, FinishChange])
        }
        (S::Configuring | S::Active, E::CloseRequested) => {
            Transition::to(S::Pausing, vec![CloseSession, CloseDevice, FinishChange])
        }
        (S::Pausing, E::CloseRequested) => Transition::stay(state),

        (S::Pausing, E::DeviceClosed) => Transition::to(S::Closed, Vec::new()),
        (S::Closed, E::DeviceClosed) => Transition::stay(state),
        (S::Opening | S::Configuring | S::Active, E::DeviceClosed) => Transition::to(
            S::Closed,
            vec![
                FinishChange,
                ReportFatal("camera device closed unexpectedly".into()),
            ],
        ),

        (S::Closed, E::DeviceDisconnected | E::DeviceError(_)) => Transition::stay(state),
        (_, E::DeviceDisconnected) => Transition::to(
            S::Closed,
            vec![
                CloseSession,
                CloseDevice,
                FinishChange,
                ReportFatal("camera device disconnected".into()),
            ],
        ),
        (_, E::DeviceError(code)) => Transition::to(
            S::Closed,
            vec![
                CloseSession,
                CloseDevice,
                FinishChange,
                ReportFatal(format!("camera device error {}", code)),
            ],
        ),

        _ => Transition::reject(state),
    }
}

/// Capture request templates the hardware understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTemplate {
    Preview,
    /// Stable frame rate, what the tracking engine expects
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceRole {
    TrackingPreview,
    TrackingCpuImage,
    Depth,
    Preview,
}

/// An output destination of the capture session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceTarget {
    pub id: u32,
    pub role: SurfaceRole,
}

impl SurfaceTarget {
    pub const fn new(id: u32, role: SurfaceRole) -> Self {
        Self { id, role }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub template: RequestTemplate,
    pub targets: Vec<SurfaceTarget>,
}

/// The open device and its capture configuration
#[derive(Debug, Clone)]
pub struct CameraSession {
    device_id: String,
    template: RequestTemplate,
    targets: Vec<SurfaceTarget>,
    configured: bool,
}

impl CameraSession {
    pub fn new(device_id: impl Into<String>, template: RequestTemplate) -> Self {
        Self {
            device_id: device_id.into(),
            template,
            targets: Vec::new(),
            configured: false,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn template(&self) -> RequestTemplate {
        self.template
    }

    pub fn targets(&self) -> &[SurfaceTarget] {
        &self.targets
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Targets are frozen once the hardware session has been created
    pub fn add_target(&mut self, target: SurfaceTarget) -> Result<()> {
        if self.configured {
            return Err(Error::ConfigurationRace(format!(
                "surface {} added to an already configured session on {}",
                target.id, self.device_id
            )));
        }
        if !self.targets.contains(&target) {
            self.targets.push(target);
        }
        Ok(())
    }

    pub fn mark_configured(&mut self) {
        self.configured = true;
    }

    pub fn build_request(&self) -> CaptureRequest {
        CaptureRequest {
            template: self.template,
            targets: self.targets.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [SessionState; 5] = [
        SessionState::Closed,
        SessionState::Opening,
        SessionState::Configuring,
        SessionState::Active,
        SessionState::Pausing,
    ];

    fn all_events() -> Vec<CaptureEvent> {
        vec![
            CaptureEvent::OpenRequested,
            CaptureEvent::CloseRequested,
            CaptureEvent::DeviceOpened,
            CaptureEvent::DeviceOpenFailed("busy".into()),
            CaptureEvent::DeviceClosed,
            CaptureEvent::DeviceDisconnected,
            CaptureEvent::DeviceError(4),
            CaptureEvent::SessionConfigured,
            CaptureEvent::SessionConfigureFailed,
            CaptureEvent::CaptureCompleted { frame_number: 1 },
            CaptureEvent::CaptureFailed {
                frame_number: 1,
                reason: "flush".into(),
            },
            CaptureEvent::CaptureBufferLost { frame_number: 1 },
            CaptureEvent::CaptureSequenceAborted { sequence_id: 1 },
        ]
    }

    #[test]
    fn active_is_only_reachable_from_configuring_or_active() {
        for state in ALL_STATES {
            for event in all_events() {
                let t = transition(state, &event);
                if t.next == SessionState::Active {
                    assert!(
                        matches!(state, SessionState::Configuring | SessionState::Active),
                        "{:?} --{:?}--> Active",
                        state,
                        event
                    );
                }
            }
        }
    }

    #[test]
    fn every_path_to_closed_releases_the_device_or_already_did() {
        for state in ALL_STATES {
            for event in all_events() {
                let t = transition(state, &event);
                if t.next == SessionState::Closed && state.holds_device() && state != SessionState::Pausing {
                    let releases = t.actions.contains(&Action::CloseDevice)
                        || event == CaptureEvent::DeviceClosed;
                    assert!(releases, "{:?} --{:?}--> Closed leaks the device", state, event);
                }
            }
        }
    }

    #[test]
    fn every_exit_from_an_in_flight_change_reopens_the_gate() {
        for state in [SessionState::Opening, SessionState::Configuring] {
            for event in all_events() {
                let t = transition(state, &event);
                if t.next != state && t.next != SessionState::Configuring {
                    assert!(
                        t.actions.contains(&Action::FinishChange),
                        "{:?} --{:?}--> {:?} leaves the gate shut",
                        state,
                        event,
                        t.next
                    );
                }
            }
        }
    }

    #[test]
    fn happy_path() {
        let mut state = SessionState::Closed;
        for (event, expected) in [
            (CaptureEvent::OpenRequested, SessionState::Opening),
            (CaptureEvent::DeviceOpened, SessionState::Configuring),
            (CaptureEvent::SessionConfigured, SessionState::Active),
            (CaptureEvent::CloseRequested, SessionState::Pausing),
            (CaptureEvent::DeviceClosed, SessionState::Closed),
        ] {
            let t = transition(state, &event);
            assert!(t.accepted);
            assert_eq!(t.next, expected);
            state = t.next;
        }
    }

    #[test]
    fn configured_again_while_active_only_resubmits() {
        let t = transition(SessionState::Active, &CaptureEvent::SessionConfigured);
        assert_eq!(t.next, SessionState::Active);
        assert_eq!(t.actions, vec![Action::SubmitRepeating]);
    }

    #[test]
    fn double_open_is_rejected() {
        for state in &ALL_STATES[1..] {
            assert!(!transition(*state, &CaptureEvent::OpenRequested).accepted);
        }
    }

    #[test]
    fn capture_failure_never_changes_state() {
        let t = transition(
            SessionState::Active,
            &CaptureEvent::CaptureFailed {
                frame_number: 7,
                reason: "error".into(),
            },
        );
        assert_eq!(t.next, SessionState::Active);
        assert_eq!(t.actions, vec![Action::RecordCaptureFailure]);
    }

    #[test]
    fn device_error_is_fatal_from_any_open_state() {
        for state in &ALL_STATES[1..] {
            let t = transition(*state, &CaptureEvent::DeviceError(3));
            assert_eq!(t.next, SessionState::Closed);
            assert!(t.actions.iter().any(|a| matches!(a, Action::ReportFatal(_))));
        }
    }

    #[test]
    fn targets_freeze_after_configuration() {
        let mut session = CameraSession::new("0", RequestTemplate::Record);
        session
            .add_target(SurfaceTarget::new(1, SurfaceRole::TrackingPreview))
            .unwrap();
        session.mark_configured();

        let err = session
            .add_target(SurfaceTarget::new(2, SurfaceRole::Depth))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationRace(_)));
        assert_eq!(session.build_request().targets.len(), 1);
    }
}
