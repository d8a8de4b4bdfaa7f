//! Main elevation mapping executable entry point.
//!
//! # Architecture
//!
//! The executable is event driven rather than cyclic:
//!
//!     - Initialise the map engine, transform buffer and node
//!     - Background threads:
//!         - Pose stream, recentres the map and updates the drift estimate
//!         - One thread per point cloud source, fuses clouds and publishes the map
//!         - Transform stream, fills the transform buffer
//!         - Recordable timer, publishes the elevation layer at a fixed rate
//!     - Main thread:
//!         - Map service, answers submap and control requests

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{eyre::WrapErr, Report};
use log::info;
use std::sync::{atomic::AtomicBool, Arc};

// Internal
use comms_if::net::NetParams;
use elev_lib::{
    map::BinningEngine,
    map_server::{MapServer, MapService},
    node::{ElevMapNode, RecordableTimer},
    params::ElevExecParams,
    sensor_client::SensorClient,
    tf::TfBuffer,
};
use util::{
    host,
    logger::{logger_init, LevelFilter},
    session::Session,
};

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    color_eyre::install()?;

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session = Session::new("elev_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(LevelFilter::Debug, &session).wrap_err("Failed to initialise logging")?;

    // Log information on this execution.
    info!("Elevation Mapping Executable\n");
    info!(
        "Running on: {:#?}",
        host::get_uname().wrap_err("Failed to get host information")?
    );
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let exec_params: ElevExecParams =
        util::params::load("elev_exec.toml").wrap_err("Could not load exec params")?;

    let net_params: NetParams =
        util::params::load("net.toml").wrap_err("Could not load net params")?;

    info!("Exec parameters loaded");

    // ---- INITIALISE NODE ----

    let engine =
        BinningEngine::new(exec_params.engine.clone()).wrap_err("Failed to create the engine")?;

    let zmq_ctx = comms_if::net::zmq::Context::new();

    let map_server = {
        let s = MapServer::new(&zmq_ctx, &net_params).wrap_err("Failed to initialise MapServer")?;
        info!("MapServer initialised");
        s
    };

    let node = Arc::new(
        ElevMapNode::new(&exec_params, engine, TfBuffer::new(), map_server)
            .wrap_err("Failed to create the node")?,
    );

    info!("Map frame: \"{}\"", node.map_frame());

    // ---- INITIALISE NETWORK ----

    info!("Initialising network");

    let _sensor_client = {
        let c = SensorClient::new(&zmq_ctx, &net_params, &exec_params, node.clone())
            .wrap_err("Failed to initialise SensorClient")?;
        info!("SensorClient initialised");
        c
    };

    let map_service = {
        let s =
            MapService::new(&zmq_ctx, &net_params).wrap_err("Failed to initialise MapService")?;
        info!("MapService initialised");
        s
    };

    let _recordable_timer = RecordableTimer::spawn(node.clone(), exec_params.recordable_fps);

    info!("Network initialisation complete");

    // ---- SERVICE LOOP ----

    info!("Begining service loop\n");

    let run = AtomicBool::new(true);

    map_service.serve(&*node, &run);

    info!("End of execution");

    Ok(())
}
