//! # Map
//!
//! This module implements the [`GridMap`] snapshot type, which is inspired by
//! [grid_map](https://github.com/ANYbotics/grid_map) by ANYbotics, and the [`MapEngine`] interface
//! through which point clouds are fused into the map.

// ------------------------------------------------------------------------------------------------
// MODS
// ------------------------------------------------------------------------------------------------

/// Main [`GridMap`] implementation
mod grid_map;

/// Implements the [`BinningEngine`] type
mod binning_engine;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use binning_engine::{BinningEngine, BinningEngineParams};
pub use grid_map::{GridMap, GridMapError};

use nalgebra::{Point3, Rotation3, Vector2, Vector3};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Name of the elevation layer
pub const ELEVATION: &str = "elevation";

/// Name of the elevation variance layer
pub const VARIANCE: &str = "variance";

/// Name of the layer marking cells which have been observed
pub const IS_VALID: &str = "is_valid";

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A fusion engine which maintains the authoritative map state.
///
/// The engine is only ever accessed by one caller at a time.
pub trait MapEngine: Send {
    /// Fuse a point cloud into the map.
    ///
    /// The points are given in the sensor frame, `rotation` and `translation` move them into the
    /// map frame. The error magnitudes are proxies for the current localisation uncertainty.
    fn input(
        &mut self,
        points: &[Point3<f64>],
        rotation: &Rotation3<f64>,
        translation: &Vector3<f64>,
        position_error: f64,
        orientation_error: f64,
    ) -> Result<(), EngineError>;

    /// Recentre the map on the given position.
    fn move_to(&mut self, position: &Vector2<f64>);

    /// Copy the current map state.
    fn snapshot(&self, frame_id: &str) -> GridMap;

    /// Discard all accumulated map data.
    fn clear(&mut self);
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("Invalid engine input: {0}")]
    InvalidInput(String),

    #[error("Map engine failure: {0}")]
    Failed(String),
}
