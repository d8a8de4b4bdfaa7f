//! # Elevation Mapping Node
//!
//! [`ElevMapNode`] holds all state shared between the input threads, the service handler and the
//! [`RecordableTimer`]. Every trigger is a method taking `&self`, so the node is shared behind an
//! `Arc`.
//!
//! Locks are always taken snapshot first, then engine. The fuse path only takes the engine lock.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use comms_if::{
    map::SubmapRequest,
    sens::{MsgError, PointCloudMsg},
};
use log::{debug, error, info, warn};
use nalgebra::{Point3, Vector2};
use util::logger::LogThrottle;

use crate::{
    drift::{DriftError, PoseDriftEstimator, PoseSample},
    map::{EngineError, GridMap, MapEngine, ELEVATION},
    params::ElevExecParams,
    publish::MapPublisher,
    snapshot::{SnapshotError, SnapshotManager},
    submap,
    tf::{TfError, TransformResolver, TF_WAIT_TIMEOUT},
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Minimum time between two processing summaries in the log
const PROCESS_LOG_PERIOD: Duration = Duration::from_secs(1);

/// Added to the recordable rate so that the period is always finite
const RECORDABLE_FPS_EPSILON: f64 = 1e-5;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

pub struct ElevMapNode<E, T, P> {
    map_frame: String,

    engine: Mutex<E>,

    drift: Mutex<PoseDriftEstimator>,

    snapshot: SnapshotManager,

    tf: T,

    publisher: P,

    publish_points: AtomicBool,

    process_log: LogThrottle,
}

/// A point cloud which has been decoded from the wire.
#[derive(Debug, Clone)]
pub struct PointCloudFrame {
    pub timestamp: DateTime<Utc>,

    /// Frame the points are expressed in
    pub frame_id: String,

    pub points: Vec<Point3<f64>>,
}

/// Background thread publishing the recordable map at a fixed rate.
pub struct RecordableTimer {
    run: Arc<AtomicBool>,
    jh: Option<JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Could not resolve the point cloud transform: {0}")]
    TfError(TfError),

    #[error("The map engine rejected the point cloud: {0}")]
    EngineError(EngineError),

    #[error("Invalid drift estimator parameters: {0}")]
    DriftError(DriftError),

    #[error("A shared lock is poisoned")]
    PoisonError,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl<G> From<PoisonError<G>> for NodeError {
    fn from(_: PoisonError<G>) -> Self {
        Self::PoisonError
    }
}

impl From<SnapshotError> for NodeError {
    fn from(e: SnapshotError) -> Self {
        match e {
            SnapshotError::PoisonError => Self::PoisonError,
        }
    }
}

impl PointCloudFrame {
    pub fn from_msg(msg: &PointCloudMsg) -> Result<Self, MsgError> {
        Ok(Self {
            timestamp: msg.timestamp,
            frame_id: msg.frame_id.clone(),
            points: msg
                .points()?
                .iter()
                .map(|p| Point3::new(p[0] as f64, p[1] as f64, p[2] as f64))
                .collect(),
        })
    }
}

impl<E, T, P> ElevMapNode<E, T, P>
where
    E: MapEngine,
    T: TransformResolver,
    P: MapPublisher,
{
    pub fn new(params: &ElevExecParams, engine: E, tf: T, publisher: P) -> Result<Self, NodeError> {
        let drift = PoseDriftEstimator::new(
            params.position_lowpass_alpha,
            params.orientation_lowpass_alpha,
        )
        .map_err(NodeError::DriftError)?;

        Ok(Self {
            map_frame: params.map_frame.clone(),
            engine: Mutex::new(engine),
            drift: Mutex::new(drift),
            snapshot: SnapshotManager::new(),
            tf,
            publisher,
            publish_points: AtomicBool::new(params.enable_pointcloud_publishing),
            process_log: LogThrottle::new(PROCESS_LOG_PERIOD),
        })
    }

    pub fn map_frame(&self) -> &str {
        &self.map_frame
    }

    pub fn tf(&self) -> &T {
        &self.tf
    }

    pub fn snapshot(&self) -> &SnapshotManager {
        &self.snapshot
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn publish_points_enabled(&self) -> bool {
        self.publish_points.load(Ordering::SeqCst)
    }

    /// Handle a new pose, recentring the map and updating the drift estimate.
    pub fn on_pose(&self, pose: &PoseSample) -> bool {
        let result = || -> Result<(), NodeError> {
            self.engine
                .lock()?
                .move_to(&Vector2::new(pose.position.x, pose.position.y));
            self.drift.lock()?.update(pose);
            Ok(())
        };

        match result() {
            Ok(()) => true,
            Err(e) => {
                error!("Could not process pose: {}", e);
                false
            }
        }
    }

    /// Handle a new point cloud.
    ///
    /// Returns `true` if the cloud was fused into the map. Failures are logged and never affect
    /// later clouds.
    pub fn on_point_cloud(&self, frame: &PointCloudFrame) -> bool {
        match self.process_point_cloud(frame) {
            Ok(()) => true,
            Err(NodeError::EngineError(e)) => {
                warn!("Point cloud from \"{}\" dropped: {}", frame.frame_id, e);
                false
            }
            Err(e) => {
                error!("Point cloud from \"{}\" dropped: {}", frame.frame_id, e);
                false
            }
        }
    }

    fn process_point_cloud(&self, frame: &PointCloudFrame) -> Result<(), NodeError> {
        let start = Instant::now();

        let transform = self
            .tf
            .resolve(&self.map_frame, &frame.frame_id, frame.timestamp, TF_WAIT_TIMEOUT)
            .map_err(NodeError::TfError)?;

        let (position_error, orientation_error) = {
            let drift = self.drift.lock()?;
            (drift.position_error(), drift.orientation_error())
        };

        self.engine
            .lock()?
            .input(
                &frame.points,
                &transform.rotation.to_rotation_matrix(),
                &transform.translation.vector,
                position_error,
                orientation_error,
            )
            .map_err(NodeError::EngineError)?;

        let snapshot = self.snapshot.refresh(&self.engine, &self.map_frame)?;

        if let Err(e) = self.publisher.publish_raw(&snapshot, Utc::now()) {
            warn!("Could not publish the raw map: {}", e);
        }

        if let Err(e) = self.publisher.publish_alive() {
            warn!("Could not publish heartbeat: {}", e);
        }

        if self.publish_points_enabled() {
            match snapshot.to_points(ELEVATION) {
                Ok(points) => {
                    if let Err(e) =
                        self.publisher
                            .publish_points(&self.map_frame, Utc::now(), &points)
                    {
                        warn!("Could not publish the map points: {}", e);
                    }
                }
                Err(e) => warn!("Could not project the map into points: {}", e),
            }
        }

        if self.process_log.ready() {
            info!(
                "Processed point cloud of {} points in {:.3} s",
                frame.points.len(),
                start.elapsed().as_secs_f64()
            );
        }
        debug!(
            "Position error: {:.4}, orientation error: {:.4}",
            position_error, orientation_error
        );

        Ok(())
    }

    /// Publish the elevation layer of the current snapshot on the recordable channel.
    ///
    /// Returns `false` if there was nothing to publish.
    pub fn publish_recordable(&self) -> bool {
        let map = match self.snapshot.layer_snapshot(ELEVATION) {
            Some(m) => m,
            None => return false,
        };

        match self.publisher.publish_recordable(&map) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not publish the recordable map: {}", e);
                false
            }
        }
    }

    /// Extract a region of the current snapshot.
    pub fn get_submap(&self, request: &SubmapRequest) -> (GridMap, bool) {
        match self.snapshot.current() {
            Some(map) => submap::extract(&map, request),
            None => {
                debug!("Submap requested before any map was built");
                (
                    GridMap::empty(
                        &self.map_frame,
                        Vector2::new(request.position_m.0, request.position_m.1),
                    ),
                    false,
                )
            }
        }
    }

    /// Discard all map data.
    pub fn clear_map(&self) -> bool {
        info!("Clearing map");

        let result = || -> Result<(), NodeError> {
            self.engine.lock()?.clear();
            self.snapshot.refresh(&self.engine, &self.map_frame)?;
            Ok(())
        };

        match result() {
            Ok(()) => true,
            Err(e) => {
                error!("Could not clear the map: {}", e);
                false
            }
        }
    }

    pub fn set_publish_points(&self, enabled: bool) -> bool {
        info!("Setting point cloud publishing to {}", enabled);
        self.publish_points.store(enabled, Ordering::SeqCst);
        true
    }
}

impl RecordableTimer {
    /// Start publishing the recordable map at `fps`.
    ///
    /// Returns `None` if `fps` isn't positive.
    pub fn spawn<E, T, P>(node: Arc<ElevMapNode<E, T, P>>, fps: f64) -> Option<Self>
    where
        E: MapEngine + 'static,
        T: TransformResolver + 'static,
        P: MapPublisher + 'static,
    {
        if !(fps > 0.0) {
            info!("Recordable map publication disabled");
            return None;
        }

        let period = util::time::seconds_to_std(1.0 / (fps + RECORDABLE_FPS_EPSILON));
        let run = Arc::new(AtomicBool::new(true));
        let run_clone = run.clone();

        let jh = thread::spawn(move || timer_thread(node, period, run_clone));

        info!("Publishing recordable map every {:.3} s", period.as_secs_f64());

        Some(Self { run, jh: Some(jh) })
    }

    pub fn stop(&mut self) {
        self.run.store(false, Ordering::Relaxed);

        if let Some(jh) = self.jh.take() {
            if jh.join().is_err() {
                error!("Recordable timer thread panicked");
            }
        }
    }
}

impl Drop for RecordableTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn timer_thread<E, T, P>(node: Arc<ElevMapNode<E, T, P>>, period: Duration, run: Arc<AtomicBool>)
where
    E: MapEngine,
    T: TransformResolver,
    P: MapPublisher,
{
    let mut next = Instant::now() + period;

    while run.load(Ordering::Relaxed) {
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        }

        if !run.load(Ordering::Relaxed) {
            break;
        }

        node.publish_recordable();

        next += period;
        let now = Instant::now();
        if now > next {
            warn!(
                "Recordable publication overran its period by {:.3} s",
                (now - next).as_secs_f64()
            );
            next = now;
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
