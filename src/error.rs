//! Error taxonomy shared by every stage of the pipeline

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Permission missing, hardware absent or already held. The user may retry.
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Tracking engine not ready or failed this update. Skip the tick.
    #[error("tracking unavailable: {0}")]
    TrackingUnavailable(String),

    /// A session mutation was attempted while a configuration was in flight.
    #[error("capture session changes not possible: {0}")]
    ConfigurationRace(String),

    /// The GPU context can no longer be trusted.
    #[error("graphics error during {stage}: {message}")]
    GraphicsError { stage: &'static str, message: String },

    /// Asynchronous device error or disconnect.
    #[error("camera device fatal error: {0}")]
    DeviceFatal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Fatal errors unwind to the orchestrator; everything else degrades in place.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::GraphicsError { .. } | Error::DeviceFatal(_))
    }

    pub fn graphics(stage: &'static str, message: impl Into<String>) -> Self {
        Error::GraphicsError {
            stage,
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_device_and_graphics_errors_are_fatal() {
        assert!(Error::DeviceFatal("disconnected".into()).is_fatal());
        assert!(Error::graphics("draw", "lost").is_fatal());
        assert!(!Error::TrackingUnavailable("no session".into()).is_fatal());
        assert!(!Error::DeviceUnavailable("no permission".into()).is_fatal());
        assert!(!Error::ConfigurationRace("busy".into()).is_fatal());
        assert!(!Error::Cancelled.is_fatal());
    }
}
