// src/main.rs

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod os;
pub mod protocol;
pub mod scene;

use std::process::ExitCode;

use anyhow::Context;
use log::{error, info, warn};

use crate::{
    config::Config,
    connection::Connection,
    scene::{SceneObject, SceneOptions},
};

/// Main entry point for `zcms`: shows a rotating wireframe cuboid until the
/// process is told to stop. A compositor hangup is reported as an error.
fn main() -> ExitCode {
    // Default filter is "info" if RUST_LOG is not set.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("Starting zcms...");

    match run() {
        Ok(()) => {
            info!("zcms exited successfully.");
            eprintln!("Exited gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {:#}. Root cause: {:?}", e, e.root_cause());
            eprintln!("Exited with error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    let socket_name = &config.connection.socket_name;
    let mut connection = Connection::connect(socket_name)
        .with_context(|| format!("Failed to set up a connection to {}", socket_name))?;

    if let Err(e) = connection.watch_signals() {
        connection.destroy();
        return Err(e).context("Failed to install signal handling");
    }

    let cuboid = &config.cuboid;
    let mut scene = match SceneObject::create_with(
        &connection,
        cuboid.width,
        cuboid.height,
        cuboid.depth,
        SceneOptions::from(&config),
    ) {
        Ok(scene) => scene,
        Err(e) => {
            connection.destroy();
            return Err(e).context("Failed to create the cuboid");
        }
    };

    info!("Starting main event loop...");
    let result = connection.run(&mut scene);
    info!("Event loop finished after {} frames", scene.frames_fired());

    // Teardown runs on every exit path: scene first, then the connection.
    if let Err(e) = scene.destroy(&connection) {
        warn!("Failed to release the cuboid cleanly: {}", e);
    }
    connection.destroy();

    result.context("Event loop terminated")
}
