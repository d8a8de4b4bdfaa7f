//! # Transform Resolution
//!
//! Point clouds arrive in the frame of the sensor which captured them and must be moved into the
//! map frame before they can be fused. The [`TransformResolver`] trait is the interface the node
//! uses to do this, [`TfBuffer`] is a buffered implementation fed from a transform stream.
//!
//! The buffer holds a tree of frames, each child storing a time ordered history of its transform
//! relative to its parent. Lookups walk both frames up to their shared root, interpolating each
//! link at the requested time.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use comms_if::sens::TfMsg;
use log::trace;
use nalgebra::{Isometry3, Quaternion, Translation3, UnitQuaternion, Vector3};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Maximum time the node waits for a transform to become available.
pub const TF_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Length of the transform history kept for each frame, in seconds.
pub const TF_HISTORY_S: i64 = 10;

/// Maximum depth of a frame tree, deeper chains are treated as loops.
const MAX_CHAIN_DEPTH: usize = 64;

/// Slerp threshold below which two rotations are treated as the same.
const SLERP_EPSILON: f64 = 1e-9;

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Resolves the transform between two frames at a given time.
pub trait TransformResolver: Send + Sync {
    /// Get the transform which moves points from `source` into `target` at `stamp`, waiting at most
    /// `max_wait` for it to become available.
    fn resolve(
        &self,
        target: &str,
        source: &str,
        stamp: DateTime<Utc>,
        max_wait: Duration,
    ) -> Result<Isometry3<f64>, TfError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Buffer of transforms received from the transform stream.
#[derive(Debug)]
pub struct TfBuffer {
    frames: Mutex<HashMap<String, FrameHistory>>,
    updated: Condvar,
    history: chrono::Duration,
}

/// History of one child frame relative to its parent.
#[derive(Debug, Clone)]
struct FrameHistory {
    parent: String,
    is_static: bool,
    samples: VecDeque<(DateTime<Utc>, Isometry3<f64>)>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum TfError {
    #[error("Transform for frame {0} at the requested time has not been received yet")]
    NotYetAvailable(String),

    #[error("Requested time is older than the buffered history of frame {0}")]
    Extrapolation(String),

    #[error("No transform chain exists between {0} and {1}")]
    NoPath(String, String),

    #[error("Frame {0} is part of a loop in the transform tree")]
    Loop(String),

    #[error("Timed out waiting for transform: {0}")]
    Timeout(String),

    #[error("A frame cannot be its own parent ({0})")]
    SelfParent(String),

    #[error("Sync primitive is poisoned")]
    PoisonError,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TfBuffer {
    pub fn new() -> Self {
        Self::with_history(chrono::Duration::seconds(TF_HISTORY_S))
    }

    pub fn with_history(history: chrono::Duration) -> Self {
        Self {
            frames: Mutex::new(HashMap::new()),
            updated: Condvar::new(),
            history,
        }
    }

    /// Insert a transform of `child` relative to `parent` valid at `stamp`.
    ///
    /// If the child's parent changes its history is discarded. Static transforms replace the whole
    /// history and are valid at any time.
    pub fn insert(
        &self,
        parent: &str,
        child: &str,
        stamp: DateTime<Utc>,
        transform: Isometry3<f64>,
        is_static: bool,
    ) -> Result<(), TfError> {
        if parent == child {
            return Err(TfError::SelfParent(child.into()));
        }

        {
            let mut frames = self.frames.lock()?;

            let entry = frames
                .entry(child.to_string())
                .or_insert_with(|| FrameHistory::new(parent, is_static));

            if entry.parent != parent || entry.is_static != is_static {
                *entry = FrameHistory::new(parent, is_static);
            }

            entry.insert(stamp, transform, self.history);
        }

        self.updated.notify_all();

        Ok(())
    }

    /// Insert a transform received from the transform stream.
    pub fn insert_msg(&self, msg: &TfMsg) -> Result<(), TfError> {
        let q = msg.rotation_q;
        let rotation = UnitQuaternion::from_quaternion(Quaternion::new(q[3], q[0], q[1], q[2]));
        let translation = Translation3::from(Vector3::from(msg.translation_m));

        self.insert(
            &msg.parent_frame_id,
            &msg.child_frame_id,
            msg.timestamp,
            Isometry3::from_parts(translation, rotation),
            msg.is_static,
        )
    }

    /// Look up a transform without waiting.
    pub fn lookup(
        &self,
        target: &str,
        source: &str,
        stamp: DateTime<Utc>,
    ) -> Result<Isometry3<f64>, TfError> {
        let frames = self.frames.lock()?;
        lookup_in(&frames, target, source, stamp)
    }
}

impl Default for TfBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformResolver for TfBuffer {
    fn resolve(
        &self,
        target: &str,
        source: &str,
        stamp: DateTime<Utc>,
        max_wait: Duration,
    ) -> Result<Isometry3<f64>, TfError> {
        let deadline = Instant::now() + max_wait;

        let mut frames = self.frames.lock()?;

        loop {
            let err = match lookup_in(&frames, target, source, stamp) {
                Ok(t) => return Ok(t),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(TfError::Timeout(err.to_string()));
            }

            trace!("Waiting for transform {} -> {}: {}", source, target, err);

            frames = self.updated.wait_timeout(frames, deadline - now)?.0;
        }
    }
}

impl FrameHistory {
    fn new(parent: &str, is_static: bool) -> Self {
        Self {
            parent: parent.into(),
            is_static,
            samples: VecDeque::new(),
        }
    }

    fn insert(
        &mut self,
        stamp: DateTime<Utc>,
        transform: Isometry3<f64>,
        history: chrono::Duration,
    ) {
        if self.is_static {
            self.samples.clear();
            self.samples.push_back((stamp, transform));
            return;
        }

        // Keep the samples ordered, replacing any sample with the same stamp
        match self.samples.binary_search_by(|(s, _)| s.cmp(&stamp)) {
            Ok(i) => self.samples[i] = (stamp, transform),
            Err(i) => self.samples.insert(i, (stamp, transform)),
        }

        if let Some(&(latest, _)) = self.samples.back() {
            while let Some(&(oldest, _)) = self.samples.front() {
                if latest - oldest > history {
                    self.samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Get the transform of this frame relative to its parent at the given time.
    fn at(&self, frame: &str, stamp: DateTime<Utc>) -> Result<Isometry3<f64>, TfError> {
        let (first, last) = match (self.samples.front(), self.samples.back()) {
            (Some(f), Some(l)) => (f, l),
            _ => return Err(TfError::NotYetAvailable(frame.into())),
        };

        if self.is_static {
            return Ok(first.1);
        }
        if stamp > last.0 {
            return Err(TfError::NotYetAvailable(frame.into()));
        }
        if stamp < first.0 {
            return Err(TfError::Extrapolation(frame.into()));
        }

        let i = match self.samples.binary_search_by(|(s, _)| s.cmp(&stamp)) {
            Ok(i) => return Ok(self.samples[i].1),
            Err(i) => i,
        };

        // `stamp` lies strictly between samples i - 1 and i
        let (t0, a) = &self.samples[i - 1];
        let (t1, b) = &self.samples[i];

        let span = (*t1 - *t0).num_nanoseconds().unwrap_or(i64::MAX) as f64;
        let ratio = (stamp - *t0).num_nanoseconds().unwrap_or(0) as f64 / span;

        Ok(interpolate(a, b, ratio))
    }
}

impl TfError {
    /// True if waiting for more data could resolve this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TfError::NotYetAvailable(_) | TfError::NoPath(_, _))
    }
}

impl<G> From<PoisonError<G>> for TfError {
    fn from(_: PoisonError<G>) -> Self {
        Self::PoisonError
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn lookup_in(
    frames: &HashMap<String, FrameHistory>,
    target: &str,
    source: &str,
    stamp: DateTime<Utc>,
) -> Result<Isometry3<f64>, TfError> {
    if target == source {
        return Ok(Isometry3::identity());
    }

    let (source_root, root_t_source) = chain_to_root(frames, source, stamp)?;
    let (target_root, root_t_target) = chain_to_root(frames, target, stamp)?;

    if source_root != target_root {
        return Err(TfError::NoPath(source.into(), target.into()));
    }

    Ok(root_t_target.inverse() * root_t_source)
}

/// Walk from `frame` to the root of its tree, returning the root's name and the transform from
/// `frame` into the root.
fn chain_to_root(
    frames: &HashMap<String, FrameHistory>,
    frame: &str,
    stamp: DateTime<Utc>,
) -> Result<(String, Isometry3<f64>), TfError> {
    let mut transform = Isometry3::identity();
    let mut current = frame;

    for _ in 0..MAX_CHAIN_DEPTH {
        match frames.get(current) {
            Some(history) => {
                transform = history.at(current, stamp)? * transform;
                current = &history.parent;
            }
            None => return Ok((current.to_string(), transform)),
        }
    }

    Err(TfError::Loop(frame.into()))
}

fn interpolate(a: &Isometry3<f64>, b: &Isometry3<f64>, ratio: f64) -> Isometry3<f64> {
    let translation = a
        .translation
        .vector
        .lerp(&b.translation.vector, ratio);
    let rotation = a
        .rotation
        .try_slerp(&b.rotation, ratio, SLERP_EPSILON)
        .unwrap_or(a.rotation);

    Isometry3::from_parts(Translation3::from(translation), rotation)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::Point3;
    use std::{sync::Arc, thread};

    fn translation(x: f64, y: f64, z: f64) -> Isometry3<f64> {
        Isometry3::translation(x, y, z)
    }

    #[test]
    fn test_identity_and_static_chain() {
        let tf = TfBuffer::new();
        let now = Utc::now();

        assert_eq!(tf.lookup("map", "map", now).unwrap(), Isometry3::identity());

        tf.insert("map", "base", now, translation(1.0, 0.0, 0.0), false)
            .unwrap();
        tf.insert("base", "lidar", now, translation(0.0, 0.0, 0.5), true)
            .unwrap();

        let map_t_lidar = tf.lookup("map", "lidar", now).unwrap();
        let p = map_t_lidar * Point3::new(0.0, 0.0, 0.0);
        assert!((p - Point3::new(1.0, 0.0, 0.5)).norm() < 1e-12);

        // The inverse direction goes through the same root
        let lidar_t_map = tf.lookup("lidar", "map", now).unwrap();
        let p = lidar_t_map * Point3::new(1.0, 0.0, 0.5);
        assert!(p.coords.norm() < 1e-12);
    }

    #[test]
    fn test_interpolation() {
        let tf = TfBuffer::new();
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(100);

        tf.insert("map", "base", t0, translation(0.0, 0.0, 0.0), false)
            .unwrap();
        tf.insert("map", "base", t1, translation(1.0, 2.0, 0.0), false)
            .unwrap();

        let mid = tf
            .lookup("map", "base", t0 + chrono::Duration::milliseconds(25))
            .unwrap();
        assert!((mid.translation.vector - Vector3::new(0.25, 0.5, 0.0)).norm() < 1e-9);

        assert_eq!(
            tf.lookup("map", "base", t0 - chrono::Duration::milliseconds(1)),
            Err(TfError::Extrapolation("base".into()))
        );
        assert_eq!(
            tf.lookup("map", "base", t1 + chrono::Duration::milliseconds(1)),
            Err(TfError::NotYetAvailable("base".into()))
        );
        assert_eq!(
            tf.lookup("map", "camera", t0),
            Err(TfError::NoPath("camera".into(), "map".into()))
        );
    }

    #[test]
    fn test_resolve_times_out() {
        let tf = TfBuffer::new();
        let now = Utc::now();

        tf.insert("map", "base", now, translation(0.0, 0.0, 0.0), false)
            .unwrap();

        let start = Instant::now();
        let res = tf.resolve(
            "map",
            "base",
            now + chrono::Duration::seconds(1),
            Duration::from_millis(50),
        );

        assert!(matches!(res, Err(TfError::Timeout(_))));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_resolve_waits_for_new_data() {
        let tf = Arc::new(TfBuffer::new());
        let now = Utc::now();
        let later = now + chrono::Duration::milliseconds(200);

        tf.insert("map", "base", now, translation(0.0, 0.0, 0.0), false)
            .unwrap();

        let tf_clone = tf.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            tf_clone
                .insert("map", "base", later, translation(2.0, 0.0, 0.0), false)
                .unwrap();
        });

        let res = tf
            .resolve(
                "map",
                "base",
                now + chrono::Duration::milliseconds(100),
                Duration::from_secs(5),
            )
            .unwrap();
        assert!((res.translation.vector.x - 1.0).abs() < 1e-9);

        writer.join().unwrap();
    }

    #[test]
    fn test_history_pruned() {
        let tf = TfBuffer::with_history(chrono::Duration::seconds(1));
        let t0 = Utc::now();

        tf.insert("map", "base", t0, translation(0.0, 0.0, 0.0), false)
            .unwrap();
        tf.insert(
            "map",
            "base",
            t0 + chrono::Duration::seconds(5),
            translation(0.0, 0.0, 0.0),
            false,
        )
        .unwrap();

        assert_eq!(
            tf.lookup("map", "base", t0 + chrono::Duration::seconds(2)),
            Err(TfError::Extrapolation("base".into()))
        );
        assert_eq!(
            tf.insert("map", "map", t0, translation(0.0, 0.0, 0.0), false),
            Err(TfError::SelfParent("map".into()))
        );
    }
}
