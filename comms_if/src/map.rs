//! # Map Communications Module
//!
//! Messages published by the elevation mapping executable, and the commands/responses of its map
//! service.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sens::{decode_f32, encode_f32, MsgError};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Topic of the full map, published for every processed point cloud
pub const RAW_MAP_TOPIC: &str = "elevation_map_raw";

/// Topic of the rate limited single layer map
pub const RECORDABLE_MAP_TOPIC: &str = "elevation_map_recordable";

/// Topic of the elevation layer projected into a point cloud
pub const MAP_POINTS_TOPIC: &str = "elevation_map_points";

/// Topic of the heartbeat signal
pub const ALIVE_TOPIC: &str = "alive";

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A serialisable multi-layer grid map.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GridMapMsg {
    /// UTC timestamp of the map
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    /// The frame the map is expressed in
    pub frame_id: String,

    /// Size of one (square) cell in meters
    pub resolution_m: f64,

    /// Number of cells along the x and y axes
    pub num_cells: (usize, usize),

    /// Position of the centre of the map
    pub centre_position_m: (f64, f64),

    /// The layers contained in the map
    pub layers: Vec<LayerMsg>,
}

/// A single named layer of a [`GridMapMsg`].
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LayerMsg {
    /// Name of the layer
    pub name: String,

    /// Row-major (x index major) cell values encoded as base64 big endian f32s.
    pub b64_data: String,
}

/// A submap request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SubmapRequest {
    /// Centre of the requested submap in the map frame
    pub position_m: (f64, f64),

    /// Length of the submap along the x and y axes
    pub length_m: (f64, f64),

    /// Layers to include, all layers are returned if empty
    #[serde(default)]
    pub layers: Vec<String>,
}

/// The empty heartbeat message.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default)]
pub struct AliveMsg {}

// -----------------------------------------------------------------------------------------------
// ENUMS
// -----------------------------------------------------------------------------------------------

/// Commands that can be sent to the map service
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum MapCmd {
    /// Get a submap of the current map
    GetSubmap(SubmapRequest),

    /// Discard all accumulated map data
    ClearMap,

    /// Enable or disable publishing the map as a point cloud
    SetPublishPoints(bool),
}

/// Replies that can be sent by the map service
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum MapRep {
    /// The requested submap, `success` is false if the request extended outside the map
    Submap { map: GridMapMsg, success: bool },

    /// Result of a control command
    Success(bool),

    /// The command could not be understood or executed
    Error(String),
}

// -----------------------------------------------------------------------------------------------
// IMPLS
// -----------------------------------------------------------------------------------------------

impl LayerMsg {
    /// Encode the given layer values.
    pub fn new(name: &str, values: &[f32]) -> Self {
        Self {
            name: name.into(),
            b64_data: encode_f32(values),
        }
    }

    /// Decode `num_values` values of this layer.
    pub fn values(&self, num_values: usize) -> Result<Vec<f32>, MsgError> {
        decode_f32(&self.b64_data, num_values)
    }
}

impl GridMapMsg {
    /// Total number of cells in each layer
    pub fn layer_len(&self) -> Result<usize, MsgError> {
        self.num_cells
            .0
            .checked_mul(self.num_cells.1)
            .ok_or(MsgError::SizeOverflow(self.num_cells.0, self.num_cells.1))
    }

    /// Get a layer by name
    pub fn layer(&self, name: &str) -> Option<&LayerMsg> {
        self.layers.iter().find(|l| l.name == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_map_cmd_json() {
        let cmd = MapCmd::GetSubmap(SubmapRequest {
            position_m: (1.0, -2.0),
            length_m: (3.0, 3.0),
            layers: vec![],
        });

        let s = serde_json::to_string(&cmd).unwrap();
        match serde_json::from_str::<MapCmd>(&s).unwrap() {
            MapCmd::GetSubmap(r) => assert_eq!(r.position_m, (1.0, -2.0)),
            c => panic!("Unexpected command {:?}", c),
        }

        // Layers are optional in the request
        let req: SubmapRequest =
            serde_json::from_str(r#"{"position_m":[0.0,0.0],"length_m":[1.0,2.0]}"#).unwrap();
        assert!(req.layers.is_empty());
    }

    #[test]
    fn test_layer_msg() {
        let msg = GridMapMsg {
            timestamp: Utc::now(),
            frame_id: "map".into(),
            resolution_m: 0.1,
            num_cells: (2, 2),
            centre_position_m: (0.0, 0.0),
            layers: vec![LayerMsg::new("elevation", &[0.0, 1.0, 2.0, 3.0])],
        };

        assert_eq!(msg.layer_len(), Ok(4));
        assert!(msg.layer("variance").is_none());
        assert_eq!(
            msg.layer("elevation").unwrap().values(4).unwrap(),
            vec![0.0, 1.0, 2.0, 3.0]
        );

        let huge = GridMapMsg {
            num_cells: (usize::MAX / 2, 3),
            ..msg
        };
        assert_eq!(
            huge.layer_len(),
            Err(MsgError::SizeOverflow(usize::MAX / 2, 3))
        );
    }
}
