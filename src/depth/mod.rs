pub mod frame;
pub mod source;
pub mod v4l2;

pub use frame::DepthFrame;
pub use source::{DepthFrameSource, DepthSensor, DepthSlot};
pub use v4l2::V4l2DepthSensor;

/// Time-of-flight stream size the composite shader is tuned for
pub const DEPTH_WIDTH: u32 = 240;
pub const DEPTH_HEIGHT: u32 = 180;

/// V4L2 fourcc of 16-bit greyscale/depth
pub const DEPTH16_FOURCC: &[u8; 4] = b"Y16 ";
