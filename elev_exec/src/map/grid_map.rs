//! # Grid Map
//!
//! [`GridMap`] is inspired by
//! [grid_map](https://github.com/ANYbotics/grid_map) by ANYbotics. The
//! [paper](https://www.researchgate.net/publication/284415855_A_Universal_Grid_Map_Library_Implementation_and_Use_Case_for_Rough_Terrain_Navigation)
//! gives a good intro the concepts behind `grid_map`.
//!
//! Cell `(0, 0)` is the cell with the largest x and y positions, indexes increase towards negative
//! x and y. Unknown values are stored as `NaN`.

// ------------------------------------------------------------------------------------------------
// INCLUDES
// ------------------------------------------------------------------------------------------------

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use comms_if::{
    map::{GridMapMsg, LayerMsg},
    sens::MsgError,
};
use nalgebra::Vector2;
use ndarray::{s, Array2};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Tolerance, as a fraction of a cell, used when snapping positions onto cell boundaries.
const CELL_TOLERANCE: f64 = 1e-6;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A grid-based map containing many named layers of information.
#[derive(Clone, Debug, PartialEq)]
pub struct GridMap {
    /// The frame the map is expressed in
    pub frame_id: String,

    /// Time the map was produced
    pub timestamp: DateTime<Utc>,

    /// The size of each (square) grid cell in meters per cell
    resolution: f64,

    /// The number of cells in each axis of the map
    num_cells: (usize, usize),

    /// Position of the centre of the map
    centre_position: Vector2<f64>,

    /// Layer names in insertion order
    layers: Vec<String>,

    /// Layer data, each with shape `num_cells`
    data: HashMap<String, Array2<f32>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum GridMapError {
    #[error("Requested position or cell outside map bounds")]
    OutsideMap,

    #[error("Attempted to access unknown layer {0}")]
    UnknownLayer(String),

    #[error("Cell resolution must be positive, found {0}")]
    InvalidResolution(f64),

    #[error("Provided array shape doesn't match the expected shape")]
    IncompatibleShape,

    #[error("Couldn't decode map message: {0}")]
    MsgError(MsgError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl GridMap {
    /// Create a new map without any layers.
    pub fn new(
        frame_id: &str,
        resolution: f64,
        num_cells: (usize, usize),
        centre_position: Vector2<f64>,
    ) -> Result<Self, GridMapError> {
        if !(resolution > 0.0) {
            return Err(GridMapError::InvalidResolution(resolution));
        }

        Ok(Self {
            frame_id: frame_id.into(),
            timestamp: Utc::now(),
            resolution,
            num_cells,
            centre_position,
            layers: Vec::new(),
            data: HashMap::new(),
        })
    }

    /// Create a map with no cells and no layers, at unit resolution.
    pub fn empty(frame_id: &str, centre_position: Vector2<f64>) -> Self {
        Self {
            frame_id: frame_id.into(),
            timestamp: Utc::now(),
            resolution: 1.0,
            num_cells: (0, 0),
            centre_position,
            layers: Vec::new(),
            data: HashMap::new(),
        }
    }

    /// Create an empty map with the same geometry as this one.
    pub fn empty_like(&self) -> Self {
        Self {
            frame_id: self.frame_id.clone(),
            timestamp: self.timestamp,
            resolution: self.resolution,
            num_cells: self.num_cells,
            centre_position: self.centre_position,
            layers: Vec::new(),
            data: HashMap::new(),
        }
    }

    /// Add or replace a layer.
    pub fn add_layer(&mut self, name: &str, data: Array2<f32>) -> Result<(), GridMapError> {
        if data.dim() != self.num_cells {
            return Err(GridMapError::IncompatibleShape);
        }

        if !self.data.contains_key(name) {
            self.layers.push(name.into());
        }
        self.data.insert(name.into(), data);

        Ok(())
    }

    /// Add or replace a layer with every cell set to `value`.
    pub fn add_layer_filled(&mut self, name: &str, value: f32) {
        if !self.data.contains_key(name) {
            self.layers.push(name.into());
        }
        self.data
            .insert(name.into(), Array2::from_elem(self.num_cells, value));
    }

    pub fn exists(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Result<&Array2<f32>, GridMapError> {
        self.data
            .get(name)
            .ok_or_else(|| GridMapError::UnknownLayer(name.into()))
    }

    pub fn layer_mut(&mut self, name: &str) -> Result<&mut Array2<f32>, GridMapError> {
        self.data
            .get_mut(name)
            .ok_or_else(|| GridMapError::UnknownLayer(name.into()))
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn num_cells(&self) -> (usize, usize) {
        self.num_cells
    }

    pub fn centre_position(&self) -> Vector2<f64> {
        self.centre_position
    }

    /// Length of each axis of the map in meters
    pub fn length(&self) -> Vector2<f64> {
        Vector2::new(
            self.num_cells.0 as f64 * self.resolution,
            self.num_cells.1 as f64 * self.resolution,
        )
    }

    /// Position of the map corner with the largest coordinates, the outer corner of cell (0, 0)
    fn max_corner(&self) -> Vector2<f64> {
        self.centre_position + 0.5 * self.length()
    }

    fn min_corner(&self) -> Vector2<f64> {
        self.centre_position - 0.5 * self.length()
    }

    pub fn position_in_map(&self, position: &Vector2<f64>) -> bool {
        let max = self.max_corner();
        let min = self.min_corner();

        position.x <= max.x && position.x >= min.x && position.y <= max.y && position.y >= min.y
    }

    pub fn position_to_cell(&self, position: &Vector2<f64>) -> Result<(usize, usize), GridMapError> {
        if !self.position_in_map(position) {
            return Err(GridMapError::OutsideMap);
        }

        // The lower bound of the map belongs to the last cell
        let offset = (self.max_corner() - position) / self.resolution;
        let cell = (
            (offset.x.floor() as usize).min(self.num_cells.0.saturating_sub(1)),
            (offset.y.floor() as usize).min(self.num_cells.1.saturating_sub(1)),
        );

        match cell.0 < self.num_cells.0 && cell.1 < self.num_cells.1 {
            true => Ok(cell),
            false => Err(GridMapError::OutsideMap),
        }
    }

    /// Position of the centre of the given cell
    pub fn cell_position(&self, cell: (usize, usize)) -> Result<Vector2<f64>, GridMapError> {
        if cell.0 >= self.num_cells.0 || cell.1 >= self.num_cells.1 {
            return Err(GridMapError::OutsideMap);
        }

        Ok(self.cell_position_unchecked(cell))
    }

    fn cell_position_unchecked(&self, cell: (usize, usize)) -> Vector2<f64> {
        self.max_corner()
            - Vector2::new(cell.0 as f64 + 0.5, cell.1 as f64 + 0.5) * self.resolution
    }

    /// Move the map so that its centre is as close as possible to `position` while staying aligned
    /// to the existing cells.
    ///
    /// Data is kept for cells which remain inside the map, newly uncovered cells are set to `NaN`.
    pub fn move_to(&mut self, position: &Vector2<f64>) {
        let shift = ((*position - self.centre_position) / self.resolution).map(f64::round);

        if !(shift.x.is_finite() && shift.y.is_finite()) || shift == Vector2::zeros() {
            return;
        }

        self.centre_position += shift * self.resolution;

        let (nx, ny) = (self.num_cells.0 as isize, self.num_cells.1 as isize);

        // Any shift of a whole map length or more uncovers every cell
        let shift = (
            shift.x.max(-(nx as f64)).min(nx as f64) as isize,
            shift.y.max(-(ny as f64)).min(ny as f64) as isize,
        );

        for data in self.data.values_mut() {
            let old = data.clone();
            data.fill(f32::NAN);

            // New cell i covers the position old cell i - shift covered
            for i in 0..nx {
                let oi = i - shift.0;
                if oi < 0 || oi >= nx {
                    continue;
                }
                for j in 0..ny {
                    let oj = j - shift.1;
                    if oj < 0 || oj >= ny {
                        continue;
                    }
                    data[[i as usize, j as usize]] = old[[oi as usize, oj as usize]];
                }
            }
        }
    }

    /// Extract a rectangular region of the map.
    ///
    /// The request is clamped to the map bounds and snapped onto whole cells. The returned flag is
    /// `true` only if the requested region lies entirely inside the map, a region which does not
    /// overlap the map at all produces a map with no cells.
    pub fn submap(&self, position: &Vector2<f64>, length: &Vector2<f64>) -> (GridMap, bool) {
        let max = self.max_corner();
        let min = self.min_corner();
        let tol = CELL_TOLERANCE * self.resolution;

        let req_max = *position + *length * 0.5;
        let req_min = *position - *length * 0.5;

        let is_success = length.x > 0.0
            && length.y > 0.0
            && req_max.x <= max.x + tol
            && req_max.y <= max.y + tol
            && req_min.x >= min.x - tol
            && req_min.y >= min.y - tol;

        let clamped_max = req_max.inf(&max);
        let clamped_min = req_min.sup(&min);

        let empty = || {
            let mut sub = self.empty_like();
            sub.num_cells = (0, 0);
            sub.centre_position = *position;
            for name in &self.layers {
                sub.add_layer_filled(name, 0.0);
            }
            sub
        };

        if clamped_min.x >= clamped_max.x || clamped_min.y >= clamped_max.y {
            return (empty(), false);
        }

        let start = (max - clamped_max) / self.resolution;
        let end = (max - clamped_min) / self.resolution;

        let start = (
            (start.x + CELL_TOLERANCE).floor() as usize,
            (start.y + CELL_TOLERANCE).floor() as usize,
        );
        let end = (
            ((end.x - CELL_TOLERANCE).ceil() as usize).min(self.num_cells.0),
            ((end.y - CELL_TOLERANCE).ceil() as usize).min(self.num_cells.1),
        );

        if start.0 >= end.0 || start.1 >= end.1 {
            return (empty(), false);
        }

        let mut sub = self.empty_like();
        sub.num_cells = (end.0 - start.0, end.1 - start.1);
        sub.centre_position = max
            - Vector2::new(
                start.0 as f64 + 0.5 * sub.num_cells.0 as f64,
                start.1 as f64 + 0.5 * sub.num_cells.1 as f64,
            ) * self.resolution;

        for name in &self.layers {
            sub.layers.push(name.clone());
            sub.data.insert(
                name.clone(),
                self.data[name]
                    .slice(s![start.0..end.0, start.1..end.1])
                    .to_owned(),
            );
        }

        (sub, is_success)
    }

    /// Copy of this map containing only the given layers, in the given order.
    ///
    /// Layers which don't exist are skipped.
    pub fn with_layers<S: AsRef<str>>(&self, names: &[S]) -> GridMap {
        let mut out = self.empty_like();

        for name in names {
            if let Some(data) = self.data.get(name.as_ref()) {
                out.layers.push(name.as_ref().into());
                out.data.insert(name.as_ref().into(), data.clone());
            }
        }

        out
    }

    /// Project a layer into a point cloud, one point per cell with a finite value.
    pub fn to_points(&self, layer: &str) -> Result<Vec<[f32; 3]>, GridMapError> {
        let data = self.layer(layer)?;

        Ok(data
            .indexed_iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(idx, v)| {
                let pos = self.cell_position_unchecked(idx);
                [pos.x as f32, pos.y as f32, *v]
            })
            .collect())
    }

    /// Convert the map into a message, stamped with the given time.
    pub fn to_msg(&self, timestamp: DateTime<Utc>) -> GridMapMsg {
        GridMapMsg {
            timestamp,
            frame_id: self.frame_id.clone(),
            resolution_m: self.resolution,
            num_cells: self.num_cells,
            centre_position_m: (self.centre_position.x, self.centre_position.y),
            layers: self
                .layers
                .iter()
                .map(|name| {
                    let values: Vec<f32> = self.data[name].iter().copied().collect();
                    LayerMsg::new(name, &values)
                })
                .collect(),
        }
    }

    /// Build a map from a message.
    pub fn from_msg(msg: &GridMapMsg) -> Result<Self, GridMapError> {
        let mut map = GridMap::new(
            &msg.frame_id,
            msg.resolution_m,
            msg.num_cells,
            Vector2::new(msg.centre_position_m.0, msg.centre_position_m.1),
        )?;
        map.timestamp = msg.timestamp;

        let layer_len = msg.layer_len().map_err(GridMapError::MsgError)?;

        for layer in &msg.layers {
            let values = layer.values(layer_len).map_err(GridMapError::MsgError)?;
            let data = Array2::from_shape_vec(msg.num_cells, values)
                .map_err(|_| GridMapError::IncompatibleShape)?;
            map.add_layer(&layer.name, data)?;
        }

        Ok(map)
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    /// 20 x 30 map of 1m cells centred at (10, 15), so covering (0, 0) to (20, 30)
    fn test_map() -> GridMap {
        let mut map = GridMap::new("map", 1.0, (20, 30), Vector2::new(10.0, 15.0)).unwrap();
        let data = Array2::from_shape_fn((20, 30), |(i, j)| (i * 100 + j) as f32);
        map.add_layer("elevation", data).unwrap();
        map.add_layer_filled("variance", 0.5);
        map
    }

    #[test]
    fn test_grid_map() -> Result<(), GridMapError> {
        let map = test_map();

        // Test out of bounds detection
        assert!(map.position_in_map(&Vector2::new(10.0, 15.0)));
        assert!(map.position_in_map(&Vector2::new(0.0, 0.0)));
        assert!(map.position_in_map(&Vector2::new(20.0, 30.0)));
        assert_eq!(map.position_in_map(&Vector2::new(-20.0, 30.0)), false);
        assert_eq!(map.position_in_map(&Vector2::new(20.1, 30.0)), false);

        // Test position->cell
        assert_eq!(map.position_to_cell(&Vector2::new(20.0, 30.0))?, (0, 0));
        assert_eq!(map.position_to_cell(&Vector2::new(10.0, 10.0))?, (10, 20));
        assert_eq!(map.position_to_cell(&Vector2::new(5.9, 12.5))?, (14, 17));
        assert_eq!(map.position_to_cell(&Vector2::new(0.0, 0.0))?, (19, 29));

        // Test cell->position
        assert_eq!(map.cell_position((0, 0))?, Vector2::new(19.5, 29.5));
        assert_eq!(map.cell_position((10, 20))?, Vector2::new(9.5, 9.5));
        assert_eq!(map.cell_position((14, 17))?, Vector2::new(5.5, 12.5));
        assert_eq!(map.cell_position((20, 0)), Err(GridMapError::OutsideMap));

        // Layers must match the map shape
        let mut map = map;
        assert_eq!(
            map.add_layer("bad", Array2::zeros((2, 2))),
            Err(GridMapError::IncompatibleShape)
        );

        Ok(())
    }

    #[test]
    fn test_submap_inside() {
        let map = test_map();

        let (sub, success) = map.submap(&Vector2::new(5.0, 10.0), &Vector2::new(4.0, 6.0));

        assert!(success);
        assert_eq!(sub.num_cells(), (4, 6));
        assert!((sub.length() - Vector2::new(4.0, 6.0)).norm() < 1e-9);
        assert!((sub.centre_position() - Vector2::new(5.0, 10.0)).norm() < 1e-9);
        assert_eq!(sub.layers(), map.layers());

        // The first submap cell is the map cell covering (6.5, 12.5)
        let first = map.position_to_cell(&Vector2::new(6.5, 12.5)).unwrap();
        assert_eq!(
            sub.layer("elevation").unwrap()[[0, 0]],
            map.layer("elevation").unwrap()[[first.0, first.1]]
        );
    }

    #[test]
    fn test_submap_fractional_resolution() {
        let mut map = GridMap::new("map", 0.1, (100, 100), Vector2::new(0.0, 0.0)).unwrap();
        map.add_layer_filled("elevation", 1.0);

        let (sub, success) = map.submap(&Vector2::new(1.0, 1.0), &Vector2::new(2.0, 2.0));

        assert!(success);
        assert_eq!(sub.num_cells(), (20, 20));
        assert!((sub.centre_position() - Vector2::new(1.0, 1.0)).norm() < 1e-9);
    }

    #[test]
    fn test_submap_outside() {
        let map = test_map();

        // Partially outside is clamped and reported as a failure
        let (sub, success) = map.submap(&Vector2::new(19.0, 15.0), &Vector2::new(4.0, 4.0));
        assert!(!success);
        assert_eq!(sub.num_cells(), (3, 4));

        // Fully outside gives an empty map
        let (sub, success) = map.submap(&Vector2::new(100.0, 100.0), &Vector2::new(2.0, 2.0));
        assert!(!success);
        assert_eq!(sub.num_cells(), (0, 0));
        assert_eq!(sub.layers(), map.layers());

        // Degenerate requests fail too
        let (_, success) = map.submap(&Vector2::new(5.0, 5.0), &Vector2::new(0.0, 2.0));
        assert!(!success);
    }

    #[test]
    fn test_move_to() {
        let mut map = test_map();
        let before = map.layer("elevation").unwrap().clone();

        map.move_to(&Vector2::new(12.2, 14.0));
        assert_eq!(map.centre_position(), Vector2::new(12.0, 14.0));

        // The position (10.5, 10.5) is still in the map, and keeps its value
        let old_cell = (9, 19);
        let new_cell = map.position_to_cell(&Vector2::new(10.5, 10.5)).unwrap();
        assert_eq!(new_cell, (11, 18));
        assert_eq!(
            map.layer("elevation").unwrap()[[new_cell.0, new_cell.1]],
            before[[old_cell.0, old_cell.1]]
        );

        // Cells entering the map at the high x side are unknown
        assert!(map.layer("elevation").unwrap()[[0, 5]].is_nan());
        assert!(map.layer("variance").unwrap()[[1, 5]].is_nan());
        assert_eq!(map.layer("variance").unwrap()[[2, 5]], 0.5);
    }

    #[test]
    fn test_move_far_away() {
        let mut map = test_map();

        map.move_to(&Vector2::new(-1e300, 1e300));
        assert_eq!(map.centre_position().x, -1e300);
        assert!(map.layer("elevation").unwrap().iter().all(|v| v.is_nan()));
        assert!(map.layer("variance").unwrap().iter().all(|v| v.is_nan()));

        // Non-finite targets leave the map untouched
        let centre = map.centre_position();
        map.move_to(&Vector2::new(f64::NAN, 0.0));
        map.move_to(&Vector2::new(f64::INFINITY, 0.0));
        assert_eq!(map.centre_position(), centre);

        // Moving exactly one map length also clears every cell
        let mut map = test_map();
        let length = map.length();
        map.move_to(&(map.centre_position() + Vector2::new(length.x, 0.0)));
        assert!(map.layer("elevation").unwrap().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_with_layers_and_points() {
        let mut map = GridMap::new("map", 1.0, (2, 2), Vector2::new(0.0, 0.0)).unwrap();
        let mut elev = Array2::from_elem((2, 2), f32::NAN);
        elev[[0, 0]] = 1.5;
        elev[[1, 1]] = -0.5;
        map.add_layer("elevation", elev).unwrap();
        map.add_layer_filled("variance", 0.1);

        let only = map.with_layers(&["variance", "unknown"]);
        assert_eq!(only.layers(), &["variance".to_string()]);
        assert_eq!(only.num_cells(), (2, 2));

        let points = map.to_points("elevation").unwrap();
        assert_eq!(points, vec![[0.5, 0.5, 1.5], [-0.5, -0.5, -0.5]]);
        assert!(map.to_points("color").is_err());
    }

    #[test]
    fn test_msg_conversion() {
        let map = test_map();
        let stamp = Utc::now();

        let msg = map.to_msg(stamp);
        assert_eq!(msg.num_cells, (20, 30));
        assert_eq!(msg.layers.len(), 2);

        let back = GridMap::from_msg(&msg).unwrap();
        assert_eq!(back.layers(), map.layers());
        assert_eq!(back.layer("elevation"), map.layer("elevation"));
        assert_eq!(back.centre_position(), map.centre_position());
        assert_eq!(back.resolution(), map.resolution());

        // A cell count whose product overflows is rejected
        let mut bad = msg;
        bad.num_cells = (usize::MAX, 2);
        assert!(matches!(
            GridMap::from_msg(&bad),
            Err(GridMapError::MsgError(MsgError::SizeOverflow(_, 2)))
        ));
    }
}
