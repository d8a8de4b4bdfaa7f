//! # Map Server
//!
//! Network side of the map outputs. [`MapServer`] publishes the map products on a PUB socket and
//! [`MapService`] answers submap and control requests on a REP socket.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use comms_if::{
    map::{
        AliveMsg, MapCmd, MapRep, ALIVE_TOPIC, MAP_POINTS_TOPIC, RAW_MAP_TOPIC,
        RECORDABLE_MAP_TOPIC,
    },
    net::{zmq, MonitoredSocket, MonitoredSocketError, NetParams, SocketOptions},
    sens::PointCloudMsg,
};
use log::{debug, error, warn};
use serde::Serialize;

use crate::{
    map::{GridMap, MapEngine},
    node::ElevMapNode,
    publish::{MapPublisher, PublishError},
    tf::TransformResolver,
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Pause after a failed service iteration
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Publishes the map products.
pub struct MapServer {
    socket: Mutex<MonitoredSocket>,
}

/// Answers requests made to the map.
pub struct MapService {
    socket: MonitoredSocket,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MapServerError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("Could not recieve a request: {0}")]
    RecvError(zmq::Error),

    #[error("Could not send the response: {0}")]
    SendError(zmq::Error),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl MapServer {
    /// Create a new instance of the map server.
    ///
    /// This function will not block until a subscriber connects.
    pub fn new(ctx: &zmq::Context, params: &NetParams) -> Result<Self, MapServerError> {
        let socket = MonitoredSocket::new(
            ctx,
            zmq::PUB,
            SocketOptions::publisher(),
            &params.map_endpoint,
        )
        .map_err(MapServerError::SocketError)?;

        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    fn send<M: Serialize>(&self, topic: &str, msg: &M) -> Result<(), PublishError> {
        let payload = serde_json::to_string(msg).map_err(PublishError::SerializationError)?;

        self.socket
            .lock()
            .map_err(|_| PublishError::TransportError("socket lock poisoned".into()))?
            .send_topic(topic, &payload)
            .map_err(|e| PublishError::TransportError(e.to_string()))
    }
}

impl MapPublisher for MapServer {
    fn publish_raw(&self, map: &GridMap, timestamp: DateTime<Utc>) -> Result<(), PublishError> {
        self.send(RAW_MAP_TOPIC, &map.to_msg(timestamp))
    }

    fn publish_recordable(&self, map: &GridMap) -> Result<(), PublishError> {
        self.send(RECORDABLE_MAP_TOPIC, &map.to_msg(map.timestamp))
    }

    fn publish_points(
        &self,
        frame_id: &str,
        timestamp: DateTime<Utc>,
        points: &[[f32; 3]],
    ) -> Result<(), PublishError> {
        self.send(
            MAP_POINTS_TOPIC,
            &PointCloudMsg::from_points(frame_id, timestamp, points),
        )
    }

    fn publish_alive(&self) -> Result<(), PublishError> {
        self.send(ALIVE_TOPIC, &AliveMsg {})
    }
}

impl MapService {
    pub fn new(ctx: &zmq::Context, params: &NetParams) -> Result<Self, MapServerError> {
        let socket = MonitoredSocket::new(
            ctx,
            zmq::REP,
            SocketOptions::server(),
            &params.service_endpoint,
        )
        .map_err(MapServerError::SocketError)?;

        Ok(Self { socket })
    }

    /// Answer requests until `run` is cleared.
    ///
    /// Errors on the socket are logged and serving carries on, only a terminated zmq context stops
    /// the loop early.
    pub fn serve<E, T, P>(&self, node: &ElevMapNode<E, T, P>, run: &AtomicBool)
    where
        E: MapEngine,
        T: TransformResolver,
        P: MapPublisher,
    {
        let mut pending = None;

        while run.load(Ordering::Relaxed) {
            match self.serve_once(node, &mut pending) {
                Ok(()) => (),
                Err(MapServerError::RecvError(zmq::Error::ETERM)) => {
                    error!("zmq context terminated, map service stopped");
                    break;
                }
                Err(e) => {
                    error!("Map service error: {}", e);
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }
    }

    /// Answer at most one request.
    ///
    /// A response which could not be sent is left in `pending` and sent again on the next call, the
    /// REP socket accepts no new request until it has been answered.
    fn serve_once<E, T, P>(
        &self,
        node: &ElevMapNode<E, T, P>,
        pending: &mut Option<String>,
    ) -> Result<(), MapServerError>
    where
        E: MapEngine,
        T: TransformResolver,
        P: MapPublisher,
    {
        if let Some(response) = pending.take() {
            self.send_response(response, pending)?;
        }

        let request = match self.socket.recv_bytes(0) {
            Ok(b) => b,
            Err(zmq::Error::EAGAIN) => return Ok(()),
            Err(zmq::Error::EFSM) => {
                // Still waiting on a response we no longer have, answer with an error instead
                *pending = Some(encode_response(&MapRep::Error(
                    "The response to this request was lost".into(),
                )));
                return Err(MapServerError::RecvError(zmq::Error::EFSM));
            }
            Err(e) => return Err(MapServerError::RecvError(e)),
        };

        // A REP socket must always answer, even if the request is garbage
        let response = match std::str::from_utf8(&request) {
            Ok(s) => handle_request(node, s),
            Err(_) => MapRep::Error("Request was not valid UTF-8".into()),
        };

        self.send_response(encode_response(&response), pending)
    }

    fn send_response(
        &self,
        response: String,
        pending: &mut Option<String>,
    ) -> Result<(), MapServerError> {
        self.socket.send(response.as_str(), 0).map_err(|e| {
            *pending = Some(response);
            MapServerError::SendError(e)
        })
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Serialize a response, falling back on a bare error reply.
fn encode_response(response: &MapRep) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        error!("Could not serialize the service response: {}", e);
        r#"{"Error":"Could not serialize the response"}"#.into()
    })
}

/// Parse and execute a serialized [`MapCmd`].
pub fn handle_request<E, T, P>(node: &ElevMapNode<E, T, P>, request: &str) -> MapRep
where
    E: MapEngine,
    T: TransformResolver,
    P: MapPublisher,
{
    match serde_json::from_str::<MapCmd>(request) {
        Ok(cmd) => handle_cmd(node, cmd),
        Err(e) => {
            warn!("Could not parse service request: {}", e);
            MapRep::Error(format!("Could not parse the request: {}", e))
        }
    }
}

/// Execute a single [`MapCmd`].
pub fn handle_cmd<E, T, P>(node: &ElevMapNode<E, T, P>, cmd: MapCmd) -> MapRep
where
    E: MapEngine,
    T: TransformResolver,
    P: MapPublisher,
{
    debug!("Service request: {:?}", cmd);

    match cmd {
        MapCmd::GetSubmap(req) => {
            let (map, success) = node.get_submap(&req);
            MapRep::Submap {
                map: map.to_msg(Utc::now()),
                success,
            }
        }
        MapCmd::ClearMap => MapRep::Success(node.clear_map()),
        MapCmd::SetPublishPoints(enabled) => MapRep::Success(node.set_publish_points(enabled)),
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        map::{BinningEngine, BinningEngineParams, ELEVATION},
        params::ElevExecParams,
        tf::TfBuffer,
    };
    use comms_if::map::SubmapRequest;

    struct NullPublisher;

    impl MapPublisher for NullPublisher {
        fn publish_raw(&self, _: &GridMap, _: DateTime<Utc>) -> Result<(), PublishError> {
            Ok(())
        }
        fn publish_recordable(&self, _: &GridMap) -> Result<(), PublishError> {
            Ok(())
        }
        fn publish_points(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: &[[f32; 3]],
        ) -> Result<(), PublishError> {
            Ok(())
        }
        fn publish_alive(&self) -> Result<(), PublishError> {
            Ok(())
        }
    }

    fn node() -> ElevMapNode<BinningEngine, TfBuffer, NullPublisher> {
        let params = ElevExecParams::default();
        let engine = BinningEngine::new(BinningEngineParams::default()).unwrap();
        let node = ElevMapNode::new(&params, engine, TfBuffer::new(), NullPublisher).unwrap();

        // Take a first snapshot of the (empty) engine map
        assert!(node.clear_map());
        node
    }

    #[test]
    fn test_handle_cmd() {
        let node = node();

        let rep = handle_cmd(
            &node,
            MapCmd::GetSubmap(SubmapRequest {
                position_m: (1.0, 1.0),
                length_m: (2.0, 2.0),
                layers: vec![ELEVATION.into()],
            }),
        );

        match rep {
            MapRep::Submap { map, success } => {
                assert!(success);
                assert_eq!(map.num_cells, (20, 20));
                assert_eq!(map.layers.len(), 1);
                assert!(map.layer(ELEVATION).is_some());
            }
            r => panic!("Unexpected response {:?}", r),
        }

        assert!(matches!(
            handle_cmd(&node, MapCmd::SetPublishPoints(true)),
            MapRep::Success(true)
        ));
        assert!(node.publish_points_enabled());

        assert!(matches!(
            handle_cmd(&node, MapCmd::ClearMap),
            MapRep::Success(true)
        ));
    }

    #[test]
    fn test_service_recovers_unanswered_request() {
        let node = node();
        let ctx = zmq::Context::new();
        let params = NetParams {
            sensor_endpoint: "inproc://sensors".into(),
            map_endpoint: "inproc://map".into(),
            service_endpoint: "inproc://map_service".into(),
        };

        let service = MapService::new(&ctx, &params).unwrap();
        let client = ctx.socket(zmq::REQ).unwrap();
        client.set_rcvtimeo(1000).unwrap();
        client.connect(&params.service_endpoint).unwrap();

        let req = serde_json::to_string(&MapCmd::SetPublishPoints(true)).unwrap();
        let recv_rep = |client: &zmq::Socket| -> MapRep {
            let rep = client.recv_string(0).unwrap().unwrap();
            serde_json::from_str(&rep).unwrap()
        };

        // Leave a request unanswered, as after a failed send
        client.send(req.as_str(), 0).unwrap();
        service.socket.recv_bytes(0).unwrap();

        let mut pending = None;
        assert!(matches!(
            service.serve_once(&node, &mut pending),
            Err(MapServerError::RecvError(zmq::Error::EFSM))
        ));
        assert!(pending.is_some());

        // The client gets an error reply and the service accepts new requests
        assert!(service.serve_once(&node, &mut pending).is_ok());
        assert!(pending.is_none());
        assert!(matches!(recv_rep(&client), MapRep::Error(_)));

        client.send(req.as_str(), 0).unwrap();
        assert!(service.serve_once(&node, &mut pending).is_ok());
        assert!(matches!(recv_rep(&client), MapRep::Success(true)));
        assert!(node.publish_points_enabled());
    }

    #[test]
    fn test_serve_stops_on_run_flag() {
        let node = node();
        let ctx = zmq::Context::new();
        let params = NetParams {
            sensor_endpoint: "inproc://sensors".into(),
            map_endpoint: "inproc://map".into(),
            service_endpoint: "inproc://map_service_stop".into(),
        };
        let service = MapService::new(&ctx, &params).unwrap();

        // Returns straight away once the flag is cleared
        service.serve(&node, &AtomicBool::new(false));
    }

    #[test]
    fn test_handle_request() {
        let node = node();

        let req = serde_json::to_string(&MapCmd::SetPublishPoints(false)).unwrap();
        assert!(matches!(
            handle_request(&node, &req),
            MapRep::Success(true)
        ));

        assert!(matches!(
            handle_request(&node, "{\"NotACommand\": 4}"),
            MapRep::Error(_)
        ));
    }
}
