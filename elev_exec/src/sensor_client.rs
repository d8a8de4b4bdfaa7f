//! # Sensor Client
//!
//! Subscribes to the pose, point cloud and transform streams. Each stream is received on its own
//! background thread which passes every decoded message on to the [`ElevMapNode`].

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use comms_if::{
    net::{zmq, MonitoredSocket, MonitoredSocketError, NetParams, SocketOptions, TopicError},
    sens::{PointCloudMsg, PoseMsg, TfMsg},
};
use log::{error, info, trace, warn};
use serde::de::DeserializeOwned;

use crate::{
    drift::PoseSample,
    map::MapEngine,
    node::{ElevMapNode, PointCloudFrame},
    params::ElevExecParams,
    publish::MapPublisher,
    tf::TfBuffer,
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Owns the background threads receiving sensor data.
pub struct SensorClient {
    bg_run: Arc<AtomicBool>,
    bg_jhs: Vec<JoinHandle<()>>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SensorClientError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("Could not subscribe to {0}: {1}")]
    SubscribeError(String, zmq::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SensorClient {
    /// Subscribe to every sensor stream and start passing data to `node`.
    pub fn new<E, P>(
        ctx: &zmq::Context,
        net_params: &NetParams,
        params: &ElevExecParams,
        node: Arc<ElevMapNode<E, TfBuffer, P>>,
    ) -> Result<Self, SensorClientError>
    where
        E: MapEngine + 'static,
        P: MapPublisher + 'static,
    {
        let bg_run = Arc::new(AtomicBool::new(true));
        let mut bg_jhs = Vec::new();

        // Pose stream
        {
            let socket = subscribe(ctx, net_params, &params.pose_topic)?;
            let node = node.clone();
            let run = bg_run.clone();
            let topic = params.pose_topic.clone();

            bg_jhs.push(thread::spawn(move || {
                bg_thread(socket, topic, run, |msg: PoseMsg| {
                    node.on_pose(&PoseSample::from(&msg));
                })
            }));
        }

        // Point cloud streams, one thread per source
        for topic in &params.pointcloud_topics {
            let socket = subscribe(ctx, net_params, topic)?;
            let node = node.clone();
            let run = bg_run.clone();

            bg_jhs.push(thread::spawn({
                let topic = topic.clone();
                move || {
                    bg_thread(socket, topic, run, |msg: PointCloudMsg| {
                        match PointCloudFrame::from_msg(&msg) {
                            Ok(frame) => {
                                node.on_point_cloud(&frame);
                            }
                            Err(e) => warn!("Could not decode point cloud: {}", e),
                        }
                    })
                }
            }));
        }

        // Transform stream
        {
            let socket = subscribe(ctx, net_params, &params.tf_topic)?;
            let run = bg_run.clone();
            let topic = params.tf_topic.clone();

            bg_jhs.push(thread::spawn(move || {
                bg_thread(socket, topic, run, |msg: TfMsg| {
                    if let Err(e) = node.tf().insert_msg(&msg) {
                        warn!(
                            "Could not insert transform {} -> {}: {}",
                            msg.parent_frame_id, msg.child_frame_id, e
                        );
                    }
                })
            }));
        }

        info!("SensorClient started {} input threads", bg_jhs.len());

        Ok(Self { bg_run, bg_jhs })
    }

    /// Stop all input threads and wait for them to exit.
    pub fn stop(&mut self) {
        self.bg_run.store(false, Ordering::Relaxed);

        for jh in self.bg_jhs.drain(..) {
            if jh.join().is_err() {
                error!("SensorClient input thread panicked");
            }
        }
    }
}

impl Drop for SensorClient {
    fn drop(&mut self) {
        self.stop();
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn subscribe(
    ctx: &zmq::Context,
    net_params: &NetParams,
    topic: &str,
) -> Result<MonitoredSocket, SensorClientError> {
    let socket = MonitoredSocket::new(
        ctx,
        zmq::SUB,
        SocketOptions::subscriber(),
        &net_params.sensor_endpoint,
    )
    .map_err(SensorClientError::SocketError)?;

    socket
        .set_subscribe(topic.as_bytes())
        .map_err(|e| SensorClientError::SubscribeError(topic.into(), e))?;

    Ok(socket)
}

/// Background thread, decodes messages on `topic` and passes them to `handler`.
fn bg_thread<M, F>(socket: MonitoredSocket, topic: String, run: Arc<AtomicBool>, mut handler: F)
where
    M: DeserializeOwned,
    F: FnMut(M),
{
    let mut was_connected = false;

    while run.load(Ordering::Relaxed) {
        let connected = socket.connected();
        if connected != was_connected {
            match connected {
                true => info!("Connected to the sensor publisher for {}", topic),
                false => warn!("Lost connection to the sensor publisher for {}", topic),
            }
            was_connected = connected;
        }

        let (msg_topic, payload) = match socket.recv_topic() {
            Ok(Some(m)) => m,
            Ok(None) => continue,
            Err(TopicError::Zmq(e)) => {
                error!("Error receiving message on {}: {}", topic, e);
                break;
            }
            Err(e) => {
                warn!("Malformed message on {}: {}", topic, e);
                continue;
            }
        };

        // Subscriptions match on prefix, so "points" also receives "points_rear"
        if msg_topic != topic {
            trace!("Ignoring message on {} in the {} thread", msg_topic, topic);
            continue;
        }

        match serde_json::from_str(&payload) {
            Ok(msg) => handler(msg),
            Err(e) => warn!("Error deserialising message on {}: {}", topic, e),
        }
    }
}
