//! # Sensor Stream Messages
//!
//! Messages published by the localisation system and the depth sensors, consumed by the elevation
//! mapping executable.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use base64::DecodeError;
use byteorder::{BigEndian, ByteOrder};
use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A timestamped pose of the robot body in the map frame.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PoseMsg {
    /// UTC timestamp at which the pose was estimated
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Position `[x, y, z]` in meters
    pub position_m: [f64; 3],

    /// Attitude quaternion stored as `[x, y, z, w]`
    pub attitude_q: [f64; 4],
}

/// A serialisable point cloud.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PointCloudMsg {
    /// UTC timestamp at which the cloud was captured
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// The frame the points are expressed in
    pub frame_id: String,

    /// Number of points in the cloud
    pub num_points: usize,

    /// The point data, encoded in base64, by first flattening the `[x, y, z]` points, then
    /// converting to a bigendian Vec<u8> of f32s, then encoding in base64.
    pub b64_data: String,
}

/// A single parent to child transform.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TfMsg {
    /// UTC timestamp at which the transform was valid
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// Parent frame name
    pub parent_frame_id: String,

    /// Child frame name
    pub child_frame_id: String,

    /// Translation of the child origin in the parent frame, in meters
    pub translation_m: [f64; 3],

    /// Rotation from the child to the parent frame, stored as `[x, y, z, w]`
    pub rotation_q: [f64; 4],

    /// Static transforms are valid at all times
    #[serde(default)]
    pub is_static: bool,
}

// -----------------------------------------------------------------------------------------------
// ENUMS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum MsgError {
    #[error("Failed to decode data from base64: {0}")]
    DecodeError(DecodeError),

    #[error("The encoded data was the wrong size, expected {expected} values, got {actual}")]
    WrongSize { expected: usize, actual: usize },

    #[error("The declared size of the data is too large: {0} x {1} values")]
    SizeOverflow(usize, usize),
}

// -----------------------------------------------------------------------------------------------
// IMPLS
// -----------------------------------------------------------------------------------------------

impl PointCloudMsg {
    /// Build a message from a list of points.
    pub fn from_points(frame_id: &str, timestamp: DateTime<Utc>, points: &[[f32; 3]]) -> Self {
        let flat: Vec<f32> = points.iter().flat_map(|p| p.iter().copied()).collect();

        Self {
            timestamp,
            frame_id: frame_id.into(),
            num_points: points.len(),
            b64_data: encode_f32(&flat),
        }
    }

    /// Decode the points held by this message.
    pub fn points(&self) -> Result<Vec<[f32; 3]>, MsgError> {
        let expected = self
            .num_points
            .checked_mul(3)
            .ok_or(MsgError::SizeOverflow(self.num_points, 3))?;
        let flat = decode_f32(&self.b64_data, expected)?;

        Ok(flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect())
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Encode a slice of f32 values as big endian bytes in base64.
pub fn encode_f32(values: &[f32]) -> String {
    let mut bytes = vec![0u8; values.len() * 4];
    BigEndian::write_f32_into(values, &mut bytes);
    base64::encode(bytes)
}

/// Decode `expected` f32 values from a base64 string of big endian bytes.
pub fn decode_f32(b64_data: &str, expected: usize) -> Result<Vec<f32>, MsgError> {
    let bytes = base64::decode(b64_data).map_err(MsgError::DecodeError)?;

    let num_bytes = expected
        .checked_mul(4)
        .ok_or(MsgError::SizeOverflow(expected, 4))?;

    if bytes.len() != num_bytes {
        return Err(MsgError::WrongSize {
            expected,
            actual: bytes.len() / 4,
        });
    }

    let mut values = vec![0f32; expected];
    BigEndian::read_f32_into(&bytes, &mut values);

    Ok(values)
}
