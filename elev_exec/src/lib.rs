//! # Elevation mapping library.
//!
//! This library allows other crates in the workspace to access items defined inside the elevation
//! mapping crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Pose drift estimator - low pass filters the pose stream to estimate localisation drift
pub mod drift;

/// Transform resolver - finds the transform between two frames at a point in time
pub mod tf;

/// Grid map snapshot and the map fusion engine
pub mod map;

/// Submap queries - extracts regions of a snapshot with the placeholder layers
pub mod submap;

/// Snapshot manager - shares a consistent copy of the map with every reader
pub mod snapshot;

/// Output channels for the map products
pub mod publish;

/// Node - orchestrates map updates, publication and the map services
pub mod node;

/// Map server - publishes map products and answers service requests over zmq
pub mod map_server;

/// Sensor client - receives pose, point cloud and transform streams over zmq
pub mod sensor_client;

/// Parameters for the elevation mapping executable
pub mod params;
