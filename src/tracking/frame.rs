use serde::{Deserialize, Serialize};

/// Column-major 4x4 matrix
pub type Mat4 = [f32; 16];

pub const IDENTITY: Mat4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Four 2D vertices of a triangle-strip quad, interleaved x/y
pub type QuadCoords = [f32; 8];

/// Full-screen quad in normalized device coordinates, triangle-strip order
pub const QUAD_NDC: QuadCoords = [-1.0, -1.0, -1.0, 1.0, 1.0, -1.0, 1.0, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Tracking,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayRotation {
    #[default]
    Rotation0,
    Rotation90,
    Rotation180,
    Rotation270,
}

impl DisplayRotation {
    pub fn quarter_turns(&self) -> u8 {
        match self {
            DisplayRotation::Rotation0 => 0,
            DisplayRotation::Rotation90 => 1,
            DisplayRotation::Rotation180 => 2,
            DisplayRotation::Rotation270 => 3,
        }
    }
}

/// Pinhole intrinsics of the tracked camera image, in pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub width: f32,
    pub height: f32,
}

impl Intrinsics {
    /// Centered principal point and square pixels for a horizontal field of view
    pub fn from_fov(width: u32, height: u32, horizontal_fov_deg: f32) -> Self {
        let fx = width as f32 / (2.0 * (horizontal_fov_deg.to_radians() / 2.0).tan());
        Self {
            fx,
            fy: fx,
            cx: width as f32 / 2.0,
            cy: height as f32 / 2.0,
            width: width as f32,
            height: height as f32,
        }
    }
}

/// Pose and tracking quality of the device camera for one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub tracking_state: TrackingState,
    pub view: Mat4,
    pub intrinsics: Intrinsics,
}

impl Camera {
    pub fn view_matrix(&self) -> Mat4 {
        self.view
    }

    /// OpenGL-style projection for the given clip planes
    pub fn projection_matrix(&self, near: f32, far: f32) -> Mat4 {
        let k = &self.intrinsics;
        let mut m = [0.0; 16];
        m[0] = 2.0 * k.fx / k.width;
        m[5] = 2.0 * k.fy / k.height;
        m[8] = 1.0 - 2.0 * k.cx / k.width;
        m[9] = 2.0 * k.cy / k.height - 1.0;
        m[10] = -(far + near) / (far - near);
        m[11] = -1.0;
        m[14] = -2.0 * far * near / (far - near);
        m
    }
}

/// One tracking update. Short-lived: a new one is produced every update.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Capture time of the camera image in nanoseconds, 0 before the first image
    pub timestamp_ns: i64,
    pub display_geometry_changed: bool,
    pub camera: Camera,
}

impl Frame {
    pub fn has_camera_image(&self) -> bool {
        self.timestamp_ns != 0
    }
}

/// View and projection published while the camera is tracking
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub timestamp_ns: i64,
    pub view: Mat4,
    pub projection: Mat4,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn projection_of_centered_camera() {
        let camera = Camera {
            tracking_state: TrackingState::Tracking,
            view: IDENTITY,
            intrinsics: Intrinsics::from_fov(640, 480, 90.0),
        };
        let p = camera.projection_matrix(0.01, 100.0);

        // 90 degree horizontal fov: fx = w/2
        assert!((p[0] - 1.0).abs() < 1e-5);
        assert!((p[5] - 640.0 / 480.0).abs() < 1e-5);
        assert!(p[8].abs() < 1e-6 && p[9].abs() < 1e-6);
        assert_eq!(p[11], -1.0);
        assert!((p[10] + 100.01 / 99.99).abs() < 1e-5);
    }
}
