//! # Submap Query
//!
//! Builds the response to a submap request from a map snapshot.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::map::SubmapRequest;
use log::debug;
use nalgebra::Vector2;

use crate::map::GridMap;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Layers which downstream consumers expect but which the front-end doesn't compute. They are
/// returned filled with zeros.
pub const PLACEHOLDER_LAYERS: [&str; 9] = [
    "horizontal_variance_x",
    "horizontal_variance_y",
    "horizontal_variance_xy",
    "time",
    "color",
    "lowest_scan_point",
    "sensor_x_at_lowest_scan",
    "sensor_y_at_lowest_scan",
    "sensor_z_at_lowest_scan",
];

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Extract the requested region from `map`.
///
/// Returns the submap and whether the requested region was entirely inside the map.
pub fn extract(map: &GridMap, request: &SubmapRequest) -> (GridMap, bool) {
    let position = Vector2::new(request.position_m.0, request.position_m.1);
    let length = Vector2::new(request.length_m.0, request.length_m.1);

    let (mut sub, success) = map.submap(&position, &length);

    for name in PLACEHOLDER_LAYERS.iter() {
        if !sub.exists(name) {
            sub.add_layer_filled(name, 0.0);
        }
    }

    if request.layers.is_empty() {
        return (sub, success);
    }

    for name in request.layers.iter().filter(|n| !sub.exists(n)) {
        debug!("Submap request for unknown layer \"{}\" skipped", name);
    }

    (sub.with_layers(&request.layers), success)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::map::{ELEVATION, VARIANCE};

    fn map() -> GridMap {
        let mut map = GridMap::new("map", 0.5, (40, 40), Vector2::new(0.0, 0.0)).unwrap();
        map.add_layer_filled(ELEVATION, 0.2);
        map.add_layer_filled(VARIANCE, 0.01);
        map
    }

    fn request(layers: &[&str]) -> SubmapRequest {
        SubmapRequest {
            position_m: (1.0, -2.0),
            length_m: (3.0, 2.0),
            layers: layers.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_all_layers() {
        let (sub, success) = extract(&map(), &request(&[]));

        assert!(success);
        assert_eq!(sub.num_cells(), (6, 4));
        assert_eq!(sub.layers().len(), 2 + PLACEHOLDER_LAYERS.len());
        assert_eq!(sub.layers()[0], ELEVATION);
        assert_eq!(sub.layers()[1], VARIANCE);

        for name in PLACEHOLDER_LAYERS.iter() {
            let layer = sub.layer(name).unwrap();
            assert_eq!(layer.dim(), (6, 4));
            assert!(layer.iter().all(|v| *v == 0.0));
        }
    }

    #[test]
    fn test_filtered_layers() {
        let (sub, success) = extract(&map(), &request(&["time", "nonexistent", ELEVATION]));

        assert!(success);
        assert_eq!(sub.layers(), &["time".to_string(), ELEVATION.to_string()]);
        assert!(sub.layer(ELEVATION).unwrap().iter().all(|v| *v == 0.2));
    }

    #[test]
    fn test_outside_request() {
        let mut req = request(&[]);
        req.position_m = (50.0, 50.0);

        let (sub, success) = extract(&map(), &req);

        assert!(!success);
        assert_eq!(sub.num_cells(), (0, 0));
        assert_eq!(sub.layer("color").unwrap().dim(), (0, 0));
    }
}
