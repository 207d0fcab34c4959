// src/error.rs

//! Error taxonomy for the client.
//!
//! Each subsystem reports its own typed error; `main` wraps them in
//! `anyhow::Error` with context before printing the exit diagnostic.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use wayland_client::ConnectError;

/// Failure to create or map an anonymous shared-memory region.
#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("refusing to allocate an empty shared memory region")]
    EmptyRegion,
    #[error("memfd_create failed")]
    Create(#[source] io::Error),
    #[error("failed to size shared memory region to {size} bytes")]
    Resize {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to map {size} bytes of shared memory")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to unmap {size} bytes of shared memory")]
    Unmap {
        size: usize,
        #[source]
        source: io::Error,
    },
}

/// Fatal failure of the connection or its event loop.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("XDG_RUNTIME_DIR is not set; cannot resolve socket {0}")]
    NoRuntimeDir(String),
    #[error("failed to connect to {}", path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to attach to the display socket")]
    Attach(#[source] ConnectError),
    #[error("failed to set up the readiness multiplexer")]
    Monitor(#[source] io::Error),
    #[error("failed to register the display socket with the readiness multiplexer")]
    Register(#[source] io::Error),
    #[error("waiting for readiness failed")]
    Wait(#[source] io::Error),
    #[error("reading from the display socket failed")]
    Read(#[source] io::Error),
    #[error("flushing the display socket failed")]
    Flush(#[source] io::Error),
    #[error("the compositor closed the connection")]
    Closed,
    #[error("protocol error on {interface}@{object}: code {code}: {message}")]
    Protocol {
        interface: String,
        object: u32,
        code: u32,
        message: String,
    },
    #[error("malformed {interface} event with opcode {opcode}")]
    BadMessage { interface: &'static str, opcode: u16 },
    #[error("the dispatcher is already running or was stopped")]
    NotIdle,
}

/// Required globals missing after the registry handshake.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("compositor does not advertise required interfaces: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("registry handshake failed")]
    Handshake(#[from] DispatchError),
}

/// Failure to build the scene object; no remote state is left behind.
#[derive(Debug, Error)]
pub enum CreationError {
    #[error("invalid cuboid dimensions {width} x {height} x {depth}")]
    InvalidDimensions { width: f32, height: f32, depth: f32 },
    #[error("invalid scene option {field}: {reason}")]
    InvalidOptions {
        field: &'static str,
        reason: &'static str,
    },
    #[error("shared memory allocation failed")]
    Allocation(#[from] AllocationError),
    #[error("protocol request failed")]
    Dispatch(#[from] DispatchError),
}
