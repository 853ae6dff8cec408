pub mod controller;
pub mod frame;
pub mod frame_ready;
pub mod gate;
pub mod hal;
pub mod session;
pub mod v4l2;

pub use controller::{CallbackThread, CaptureSessionController, CaptureStatsSnapshot};
pub use frame::{ColorFrame, FrameMetadata, PixelFormat, PreviewFeed};
pub use frame_ready::FrameReady;
pub use gate::ChangesGate;
pub use hal::{CameraHal, EventSender};
pub use session::{
    CameraSession, CaptureEvent, CaptureRequest, RequestTemplate, SessionState, SurfaceRole,
    SurfaceTarget,
};
pub use v4l2::V4l2Camera;
