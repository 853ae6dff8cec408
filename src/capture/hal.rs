//! Boundary to the camera hardware subsystem

use crate::capture::session::{CameraSession, CaptureEvent, CaptureRequest};
use crate::{Resolution, Result};

/// Where the hardware reports device, session and capture callbacks
pub type EventSender = flume::Sender<CaptureEvent>;

/// A camera stack that opens devices and streams repeating capture requests.
///
/// Every long-running operation completes asynchronously by sending a
/// [`CaptureEvent`] on the sender handed to [`CameraHal::open`]. A synchronous
/// `Err` means the request never reached the hardware.
pub trait CameraHal: Send + Sync {
    fn has_permission(&self) -> bool;

    /// Completes with `DeviceOpened` or `DeviceOpenFailed`
    fn open(&self, device_id: &str, events: EventSender) -> Result<()>;

    /// Completes with `SessionConfigured` or `SessionConfigureFailed`
    fn create_session(&self, session: &CameraSession) -> Result<()>;

    /// Replaces the repeating request; each capture reports `CaptureCompleted`
    /// or one of the failure events
    fn submit_repeating(&self, request: &CaptureRequest) -> Result<()>;

    fn close_session(&self);

    /// Returns once the device handle has been released
    fn close_device(&self);

    /// Output sizes the device offers for 16-bit depth, empty without a depth sensor
    fn depth_resolutions(&self, device_id: &str) -> Vec<Resolution>;
}
