//! # Pose Drift Estimator
//!
//! Smooths the incoming pose stream with a pair of exponential low pass filters and reports how far
//! the latest raw pose is from its smoothed counterpart. These magnitudes are used as a proxy for
//! the localisation uncertainty when fusing point clouds into the map.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use comms_if::sens::PoseMsg;
use nalgebra::{Vector3, Vector4};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A single sample from the pose stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSample {
    pub timestamp: DateTime<Utc>,

    /// Position in the map frame
    pub position: Vector3<f64>,

    /// Raw orientation quaternion components, ordered `[x, y, z, w]`
    pub orientation: Vector4<f64>,
}

/// Low pass filter state for the pose stream.
#[derive(Debug, Clone)]
pub struct PoseDriftEstimator {
    position_alpha: f64,
    orientation_alpha: f64,

    lowpass_position: Vector3<f64>,
    lowpass_orientation: Vector4<f64>,

    position_error: f64,
    orientation_error: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum DriftError {
    #[error("Low pass coefficient `{0}` must be in (0, 1], found {1}")]
    InvalidAlpha(&'static str, f64),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl PoseSample {
    pub fn new(timestamp: DateTime<Utc>, position: Vector3<f64>, orientation: Vector4<f64>) -> Self {
        Self {
            timestamp,
            position,
            orientation,
        }
    }
}

impl From<&PoseMsg> for PoseSample {
    fn from(msg: &PoseMsg) -> Self {
        Self {
            timestamp: msg.timestamp,
            position: Vector3::from(msg.position_m),
            orientation: Vector4::from(msg.attitude_q),
        }
    }
}

impl PoseDriftEstimator {
    /// Create a new estimator with the filters at the origin and an identity orientation.
    pub fn new(position_alpha: f64, orientation_alpha: f64) -> Result<Self, DriftError> {
        check_alpha("position_alpha", position_alpha)?;
        check_alpha("orientation_alpha", orientation_alpha)?;

        Ok(Self {
            position_alpha,
            orientation_alpha,
            lowpass_position: Vector3::zeros(),
            lowpass_orientation: Vector4::new(0.0, 0.0, 0.0, 1.0),
            position_error: 0.0,
            orientation_error: 0.0,
        })
    }

    /// Create a new estimator whose filters start at the given sample.
    pub fn with_initial(
        position_alpha: f64,
        orientation_alpha: f64,
        initial: &PoseSample,
    ) -> Result<Self, DriftError> {
        let mut est = Self::new(position_alpha, orientation_alpha)?;
        est.lowpass_position = initial.position;
        est.lowpass_orientation = initial.orientation;
        Ok(est)
    }

    /// Feed a new pose sample through the filters and recompute the error magnitudes.
    pub fn update(&mut self, sample: &PoseSample) {
        // Incremental form, exact when the sample equals the filtered state
        self.lowpass_position += self.position_alpha * (sample.position - self.lowpass_position);
        self.lowpass_orientation +=
            self.orientation_alpha * (sample.orientation - self.lowpass_orientation);

        // Plain euclidean distance over the quaternion components, not an angular distance
        self.position_error = (sample.position - self.lowpass_position).norm();
        self.orientation_error = (sample.orientation - self.lowpass_orientation).norm();
    }

    pub fn position_error(&self) -> f64 {
        self.position_error
    }

    pub fn orientation_error(&self) -> f64 {
        self.orientation_error
    }

    pub fn lowpass_position(&self) -> &Vector3<f64> {
        &self.lowpass_position
    }

    pub fn lowpass_orientation(&self) -> &Vector4<f64> {
        &self.lowpass_orientation
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn check_alpha(name: &'static str, alpha: f64) -> Result<(), DriftError> {
    if alpha > 0.0 && alpha <= 1.0 {
        Ok(())
    } else {
        Err(DriftError::InvalidAlpha(name, alpha))
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
