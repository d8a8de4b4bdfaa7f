//! # Binning Engine
//!
//! A simple [`MapEngine`] which bins every point into a grid cell and fuses its height into the
//! cell with a 1D Kalman update.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use chrono::Utc;
use log::trace;
use nalgebra::{Point3, Rotation3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use super::{EngineError, GridMap, GridMapError, MapEngine, ELEVATION, IS_VALID, VARIANCE};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningEngineParams {
    /// Size of each cell in meters
    pub resolution_m: f64,

    /// Side length of the square map in meters
    pub map_length_m: f64,

    /// Scale of the range dependent sensor noise
    pub sensor_noise_factor: f64,

    /// Points with an absolute height above this are ignored
    pub max_height_m: f64,

    pub min_variance: f64,
    pub max_variance: f64,
}

pub struct BinningEngine {
    params: BinningEngineParams,
    map: GridMap,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for BinningEngineParams {
    fn default() -> Self {
        Self {
            resolution_m: 0.1,
            map_length_m: 10.0,
            sensor_noise_factor: 0.0025,
            max_height_m: 5.0,
            min_variance: 1e-6,
            max_variance: 1.0,
        }
    }
}

impl BinningEngine {
    /// Create a new engine with an empty map centred on the origin.
    pub fn new(params: BinningEngineParams) -> Result<Self, GridMapError> {
        if !(params.resolution_m > 0.0) {
            return Err(GridMapError::InvalidResolution(params.resolution_m));
        }

        let cells = (params.map_length_m / params.resolution_m).round().max(1.0) as usize;

        let mut map = GridMap::new("", params.resolution_m, (cells, cells), Vector2::zeros())?;
        map.add_layer_filled(ELEVATION, f32::NAN);
        map.add_layer_filled(VARIANCE, f32::NAN);
        map.add_layer_filled(IS_VALID, 0.0);

        Ok(Self { params, map })
    }

    pub fn params(&self) -> &BinningEngineParams {
        &self.params
    }

    /// Fuse a single measurement into the given cell.
    fn fuse(&mut self, cell: (usize, usize), height: f32, variance: f32) -> Result<(), GridMapError> {
        let min_var = self.params.min_variance as f32;
        let max_var = self.params.max_variance as f32;

        let prior_h = self.map.layer(ELEVATION)?[cell];
        let prior_v = self.map.layer(VARIANCE)?[cell];

        let (h, v) = if prior_h.is_finite() && prior_v.is_finite() {
            (
                (variance * prior_h + prior_v * height) / (prior_v + variance),
                (prior_v * variance) / (prior_v + variance),
            )
        } else {
            (height, variance)
        };

        self.map.layer_mut(ELEVATION)?[cell] = h;
        self.map.layer_mut(VARIANCE)?[cell] = v.max(min_var).min(max_var);
        self.map.layer_mut(IS_VALID)?[cell] = 1.0;

        Ok(())
    }
}

impl MapEngine for BinningEngine {
    fn input(
        &mut self,
        points: &[Point3<f64>],
        rotation: &Rotation3<f64>,
        translation: &Vector3<f64>,
        position_error: f64,
        orientation_error: f64,
    ) -> Result<(), EngineError> {
        if points.is_empty() {
            return Err(EngineError::InvalidInput("empty point cloud".into()));
        }
        if points.iter().any(|p| !p.coords.iter().all(|c| c.is_finite())) {
            return Err(EngineError::InvalidInput("non-finite point".into()));
        }

        let mut num_fused = 0usize;

        for p in points {
            let range = p.coords.norm();
            let map_p = rotation * p + translation;

            if map_p.z.abs() > self.params.max_height_m {
                continue;
            }

            let cell = match self.map.position_to_cell(&map_p.xy().coords) {
                Ok(c) => c,
                Err(_) => continue,
            };

            let variance = self.params.sensor_noise_factor * range.powi(2)
                + position_error.powi(2)
                + (orientation_error * range).powi(2);

            self.fuse(cell, map_p.z as f32, variance as f32)
                .map_err(|e| EngineError::Failed(e.to_string()))?;
            num_fused += 1;
        }

        trace!("Fused {} of {} points", num_fused, points.len());

        Ok(())
    }

    fn move_to(&mut self, position: &Vector2<f64>) {
        self.map.move_to(position);

        // Newly uncovered cells haven't been observed
        if let Ok(valid) = self.map.layer_mut(IS_VALID) {
            valid.mapv_inplace(|v| if v.is_nan() { 0.0 } else { v });
        }
    }

    fn snapshot(&self, frame_id: &str) -> GridMap {
        let mut map = self.map.clone();
        map.frame_id = frame_id.into();
        map.timestamp = Utc::now();
        map
    }

    fn clear(&mut self) {
        self.map.add_layer_filled(ELEVATION, f32::NAN);
        self.map.add_layer_filled(VARIANCE, f32::NAN);
        self.map.add_layer_filled(IS_VALID, 0.0);
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn engine() -> BinningEngine {
        BinningEngine::new(BinningEngineParams {
            resolution_m: 0.5,
            map_length_m: 4.0,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_converges_to_repeated_height() {
        let mut engine = engine();
        let points = vec![Point3::new(1.2, 0.7, 0.3)];
        let rot = Rotation3::identity();
        let trans = Vector3::new(0.0, 0.0, 0.1);

        for _ in 0..50 {
            engine.input(&points, &rot, &trans, 0.05, 0.01).unwrap();
        }

        let snap = engine.snapshot("map");
        let cell = snap.position_to_cell(&Vector2::new(1.2, 0.7)).unwrap();

        assert_eq!(snap.frame_id, "map");
        assert!((snap.layer(ELEVATION).unwrap()[cell] - 0.4).abs() < 1e-5);
        assert_eq!(snap.layer(IS_VALID).unwrap()[cell], 1.0);

        // Repeated measurements shrink the variance
        let var = snap.layer(VARIANCE).unwrap()[cell];
        assert!(var < 0.05f32.powi(2));
        assert!(var >= engine.params().min_variance as f32);

        // Untouched cells stay unknown
        assert!(snap.layer(ELEVATION).unwrap()[[0, 0]].is_nan());
        assert_eq!(snap.layer(IS_VALID).unwrap()[[0, 0]], 0.0);
    }

    #[test]
    fn test_first_measurement_taken_directly() {
        let mut engine = engine();
        let rot = Rotation3::from_euler_angles(0.0, 0.0, std::f64::consts::FRAC_PI_2);

        // Rotated by 90 degrees about z the point lands at (-0.3, 0.8)
        engine
            .input(&[Point3::new(0.8, 0.3, -0.2)], &rot, &Vector3::zeros(), 0.0, 0.0)
            .unwrap();

        let snap = engine.snapshot("map");
        let cell = snap.position_to_cell(&Vector2::new(-0.3, 0.8)).unwrap();
        assert!((snap.layer(ELEVATION).unwrap()[cell] + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut engine = engine();
        let rot = Rotation3::identity();
        let trans = Vector3::zeros();

        assert!(matches!(
            engine.input(&[], &rot, &trans, 0.0, 0.0),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            engine.input(&[Point3::new(f64::NAN, 0.0, 0.0)], &rot, &trans, 0.0, 0.0),
            Err(EngineError::InvalidInput(_))
        ));

        // Points outside the map or too high are ignored
        engine
            .input(
                &[Point3::new(100.0, 0.0, 0.0), Point3::new(0.1, 0.1, 50.0)],
                &rot,
                &trans,
                0.0,
                0.0,
            )
            .unwrap();
        let snap = engine.snapshot("map");
        assert!(snap.layer(ELEVATION).unwrap().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_move_and_clear() {
        let mut engine = engine();
        engine
            .input(
                &[Point3::new(0.25, 0.25, 1.0)],
                &Rotation3::identity(),
                &Vector3::zeros(),
                0.0,
                0.0,
            )
            .unwrap();

        engine.move_to(&Vector2::new(1.0, 0.0));
        let snap = engine.snapshot("map");
        assert_eq!(snap.centre_position(), Vector2::new(1.0, 0.0));

        let cell = snap.position_to_cell(&Vector2::new(0.25, 0.25)).unwrap();
        assert_eq!(snap.layer(ELEVATION).unwrap()[cell], 1.0);
        assert!(snap.layer(IS_VALID).unwrap().iter().all(|v| !v.is_nan()));

        engine.clear();
        let snap = engine.snapshot("map");
        assert!(snap.layer(ELEVATION).unwrap().iter().all(|v| v.is_nan()));
        assert!(snap.layer(VARIANCE).unwrap().iter().all(|v| v.is_nan()));
        assert!(snap.layer(IS_VALID).unwrap().iter().all(|v| *v == 0.0));
    }
}
