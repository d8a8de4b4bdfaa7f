//! # Elevation Mapping Executable Parameters
//!
//! This module provide parameters for the elevation mapping executable.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

use crate::map::BinningEngineParams;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevExecParams {
    /// Frame in which the map is built, every point cloud is transformed into it
    pub map_frame: String,

    /// Topic of the robot pose stream
    pub pose_topic: String,

    /// Topics of the point cloud sources, each is processed on its own thread
    pub pointcloud_topics: Vec<String>,

    /// Topic of the transform stream
    pub tf_topic: String,

    pub position_lowpass_alpha: f64,
    pub orientation_lowpass_alpha: f64,

    /// Rate of the recordable map publication. Zero or less disables it.
    pub recordable_fps: f64,

    /// Publish the elevation layer as a point cloud after every update
    pub enable_pointcloud_publishing: bool,

    pub engine: BinningEngineParams,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for ElevExecParams {
    fn default() -> Self {
        Self {
            map_frame: "map".into(),
            pose_topic: "pose".into(),
            pointcloud_topics: vec!["points".into()],
            tf_topic: "tf".into(),
            position_lowpass_alpha: 0.2,
            orientation_lowpass_alpha: 0.2,
            recordable_fps: 3.0,
            enable_pointcloud_publishing: false,
            engine: BinningEngineParams::default(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
