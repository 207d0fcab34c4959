// src/protocol/mock.rs

//! A scripted compositor on the far end of a socket pair.
//!
//! Runs a `wayland-server` display on its own thread, answers the handful of
//! requests that need answers (registry binds, configure, frame callbacks)
//! and records every request. Joining returns the log once the client has
//! disconnected.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, trace};
use wayland_server::backend::{ClientData, ClientId, DisconnectReason};
use wayland_server::protocol::{wl_buffer, wl_callback, wl_seat, wl_shm, wl_shm_pool};
use wayland_server::{
    Client, DataInit, Dispatch, Display, DisplayHandle, GlobalDispatch, New, Resource, WEnum,
};

use super::server::{
    zgn_compositor, zgn_cuboid_window, zgn_opengl, zgn_opengl_component,
    zgn_opengl_element_array_buffer, zgn_opengl_shader_program, zgn_opengl_vertex_buffer,
    zgn_shell, zgn_virtual_object,
};
use crate::os::epoll::{EpollFlags, EventMonitor};
use crate::os::shm::SharedRegion;

/// Error code the mock posts when a scripted request arrives.
pub const REJECT_CODE: u32 = 3;

/// What the mock advertises and how it drives the client.
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub globals: Vec<(&'static str, u32)>,
    /// Frame timestamps handed out in order, one per commit with a pending
    /// frame. Once the list runs out frames stay pending.
    pub frame_times: Vec<u32>,
    /// Close the connection on the first commit after `frame_times` runs out.
    pub hang_up_when_exhausted: bool,
    /// Sent as a configure event whenever a cuboid window is created.
    pub configure_serial: Option<u32>,
    /// Posts a protocol error on this `(interface, request)`. Binds are
    /// recorded as `bind` requests on the bound interface.
    pub error_on: Option<(&'static str, &'static str)>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            globals: vec![
                ("wl_shm", 1),
                ("wl_seat", 7),
                ("zgn_compositor", 1),
                ("zgn_shell", 1),
                ("zgn_opengl", 1),
            ],
            frame_times: Vec::new(),
            hang_up_when_exhausted: false,
            configure_serial: None,
            error_on: None,
        }
    }
}

#[derive(Debug)]
pub enum Arg {
    Int(i32),
    Uint(u32),
    Str(String),
    /// Object or new id, by protocol id.
    Object(u32),
    Array(Vec<u8>),
    Fd(OwnedFd),
}

#[derive(Debug)]
pub struct Request {
    pub interface: &'static str,
    pub request: &'static str,
    pub object: u32,
    pub args: Vec<Arg>,
}

impl Request {
    pub fn is(&self, interface: &str, request: &str) -> bool {
        self.interface == interface && self.request == request
    }

    pub fn uint(&self, index: usize) -> u32 {
        match &self.args[index] {
            Arg::Uint(v) => *v,
            other => panic!("argument {} is {:?}, not uint", index, other),
        }
    }

    pub fn int(&self, index: usize) -> i32 {
        match &self.args[index] {
            Arg::Int(v) => *v,
            other => panic!("argument {} is {:?}, not int", index, other),
        }
    }

    pub fn string(&self, index: usize) -> &str {
        match &self.args[index] {
            Arg::Str(v) => v,
            other => panic!("argument {} is {:?}, not string", index, other),
        }
    }

    pub fn object(&self, index: usize) -> u32 {
        match &self.args[index] {
            Arg::Object(id) => *id,
            other => panic!("argument {} is {:?}, not an object", index, other),
        }
    }

    pub fn array(&self, index: usize) -> &[u8] {
        match &self.args[index] {
            Arg::Array(v) => v,
            other => panic!("argument {} is {:?}, not array", index, other),
        }
    }

    /// Maps the descriptor argument and copies out `len` bytes.
    pub fn fd_contents(&self, index: usize, len: usize) -> Vec<u8> {
        let Arg::Fd(fd) = &self.args[index] else {
            panic!("argument {} is not an fd", index);
        };
        let region = SharedRegion::from_fd(fd.try_clone().unwrap(), len).unwrap();
        let mapping = region.map().unwrap();
        mapping.to_vec()
    }
}

#[derive(Debug, Default)]
pub struct MockLog {
    pub requests: Vec<Request>,
    pub max_outstanding_frames: usize,
}

impl MockLog {
    pub fn matching<'a>(
        &'a self,
        interface: &'a str,
        request: &'a str,
    ) -> impl Iterator<Item = &'a Request> + 'a {
        self.requests.iter().filter(move |r| r.is(interface, request))
    }

    pub fn count(&self, interface: &str, request: &str) -> usize {
        self.matching(interface, request).count()
    }

    /// Interface names of destroyed objects, in request order.
    pub fn destroyed(&self) -> Vec<&'static str> {
        self.requests
            .iter()
            .filter(|r| r.request == "destroy")
            .map(|r| r.interface)
            .collect()
    }

    /// `(interface, version)` of every bind, in order.
    pub fn bound(&self) -> Vec<(&'static str, u32)> {
        self.requests
            .iter()
            .filter(|r| r.request == "bind")
            .map(|r| (r.interface, r.uint(0)))
            .collect()
    }
}

pub struct MockCompositor {
    handle: JoinHandle<MockLog>,
}

impl MockCompositor {
    /// Starts the mock and returns the client's end of the socket.
    pub fn spawn(config: MockConfig) -> (UnixStream, MockCompositor) {
        let (client, server) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || serve(server, config));
        (client, MockCompositor { handle })
    }

    /// Waits for the client to disconnect and returns what it sent.
    pub fn join(self) -> MockLog {
        self.handle.join().expect("mock compositor panicked")
    }
}

struct Session {
    disconnected: AtomicBool,
}

impl ClientData for Session {
    fn disconnected(&self, _client_id: ClientId, reason: DisconnectReason) {
        debug!("Mock client disconnected: {:?}", reason);
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

fn serve(stream: UnixStream, config: MockConfig) -> MockLog {
    let mut display = Display::<MockState>::new().unwrap();
    let mut handle = display.handle();
    for (name, version) in &config.globals {
        advertise(&handle, name, *version);
    }
    let session = Arc::new(Session {
        disconnected: AtomicBool::new(false),
    });
    let client = handle.insert_client(stream, session.clone()).unwrap();

    let mut monitor = EventMonitor::new().unwrap();
    let poll_fd = display.backend().poll_fd().as_raw_fd();
    monitor.add(poll_fd, 0, EpollFlags::EPOLLIN).unwrap();

    let mut state = MockState::new(config);
    let mut killed = false;
    while !session.disconnected.load(Ordering::SeqCst) {
        if let Err(e) = display.dispatch_clients(&mut state) {
            debug!("Mock dispatch failed: {}", e);
            break;
        }
        if let Err(e) = display.flush_clients() {
            debug!("Mock flush failed: {}", e);
        }
        if state.hang_up && !killed {
            debug!("Mock compositor out of frames; hanging up");
            handle
                .backend_handle()
                .kill_client(client.id(), DisconnectReason::ConnectionClosed);
            killed = true;
            continue;
        }
        monitor.wait(Some(Duration::from_millis(20))).unwrap();
    }
    debug!(
        "Mock compositor done after {} requests",
        state.log.requests.len()
    );
    state.log
}

fn advertise(handle: &DisplayHandle, name: &str, version: u32) {
    match name {
        "wl_shm" => {
            handle.create_global::<MockState, wl_shm::WlShm, ()>(version, ());
        }
        "wl_seat" => {
            handle.create_global::<MockState, wl_seat::WlSeat, ()>(version, ());
        }
        "zgn_compositor" => {
            handle.create_global::<MockState, zgn_compositor::ZgnCompositor, ()>(version, ());
        }
        "zgn_shell" => {
            handle.create_global::<MockState, zgn_shell::ZgnShell, ()>(version, ());
        }
        "zgn_opengl" => {
            handle.create_global::<MockState, zgn_opengl::ZgnOpengl, ()>(version, ());
        }
        other => panic!("mock cannot advertise {}", other),
    }
}

struct MockState {
    config: MockConfig,
    frame_times: VecDeque<u32>,
    pending_frames: Vec<wl_callback::WlCallback>,
    hang_up: bool,
    log: MockLog,
}

impl MockState {
    fn new(config: MockConfig) -> Self {
        let frame_times = config.frame_times.iter().copied().collect();
        Self {
            config,
            frame_times,
            pending_frames: Vec::new(),
            hang_up: false,
            log: MockLog::default(),
        }
    }

    fn record<R: Resource>(&mut self, resource: &R, request: &'static str, args: Vec<Arg>) {
        let interface = R::interface().name;
        let object = resource.id().protocol_id();
        trace!("mock <- {}@{}.{}", interface, object, request);
        if self.config.error_on == Some((interface, request)) {
            resource.post_error(REJECT_CODE, "rejected by mock");
        }
        self.log.requests.push(Request {
            interface,
            request,
            object,
            args,
        });
    }

    fn on_frame(&mut self, callback: wl_callback::WlCallback) {
        self.pending_frames.push(callback);
        self.log.max_outstanding_frames =
            self.log.max_outstanding_frames.max(self.pending_frames.len());
    }

    fn on_commit(&mut self) {
        if self.pending_frames.is_empty() || self.hang_up {
            return;
        }
        match self.frame_times.pop_front() {
            Some(time) => {
                for callback in std::mem::take(&mut self.pending_frames) {
                    callback.done(time);
                }
            }
            None if self.config.hang_up_when_exhausted => self.hang_up = true,
            None => {}
        }
    }
}

fn id<R: Resource>(resource: &R) -> Arg {
    Arg::Object(resource.id().protocol_id())
}

fn raw<T: Into<u32>>(value: WEnum<T>) -> u32 {
    match value {
        WEnum::Value(v) => v.into(),
        WEnum::Unknown(v) => v,
    }
}

macro_rules! global {
    ($interface:ty) => {
        impl GlobalDispatch<$interface, ()> for MockState {
            fn bind(
                state: &mut Self,
                _: &DisplayHandle,
                _: &Client,
                resource: New<$interface>,
                _: &(),
                data_init: &mut DataInit<'_, Self>,
            ) {
                let resource = data_init.init(resource, ());
                let version = resource.version();
                state.record(&resource, "bind", vec![Arg::Uint(version)]);
            }
        }
    };
}

global!(wl_shm::WlShm);
global!(wl_seat::WlSeat);
global!(zgn_compositor::ZgnCompositor);
global!(zgn_shell::ZgnShell);
global!(zgn_opengl::ZgnOpengl);

impl Dispatch<wl_shm::WlShm, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        shm: &wl_shm::WlShm,
        request: wl_shm::Request,
        _: &(),
        _: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_shm::Request::CreatePool { id: pool, fd, size } = request {
            let pool = data_init.init(pool, ());
            state.record(shm, "create_pool", vec![id(&pool), Arg::Fd(fd), Arg::Int(size)]);
        }
    }
}

impl Dispatch<wl_shm_pool::WlShmPool, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        pool: &wl_shm_pool::WlShmPool,
        request: wl_shm_pool::Request,
        _: &(),
        _: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id: buffer,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let buffer = data_init.init(buffer, ());
                state.record(
                    pool,
                    "create_buffer",
                    vec![
                        id(&buffer),
                        Arg::Int(offset),
                        Arg::Int(width),
                        Arg::Int(height),
                        Arg::Int(stride),
                        Arg::Uint(raw(format)),
                    ],
                );
            }
            wl_shm_pool::Request::Destroy => state.record(pool, "destroy", vec![]),
            _ => state.record(pool, "other", vec![]),
        }
    }
}

impl Dispatch<wl_buffer::WlBuffer, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        buffer: &wl_buffer::WlBuffer,
        request: wl_buffer::Request,
        _: &(),
        _: &DisplayHandle,
        _: &mut DataInit<'_, Self>,
    ) {
        if let wl_buffer::Request::Destroy = request {
            state.record(buffer, "destroy", vec![]);
        }
    }
}

impl Dispatch<wl_seat::WlSeat, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        seat: &wl_seat::WlSeat,
        _: wl_seat::Request,
        _: &(),
        _: &DisplayHandle,
        _: &mut DataInit<'_, Self>,
    ) {
        state.record(seat, "other", vec![]);
    }
}

impl Dispatch<wl_callback::WlCallback, ()> for MockState {
    fn request(
        _: &mut Self,
        _: &Client,
        _: &wl_callback::WlCallback,
        _: wl_callback::Request,
        _: &(),
        _: &DisplayHandle,
        _: &mut DataInit<'_, Self>,
    ) {
    }
}

impl Dispatch<zgn_compositor::ZgnCompositor, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        compositor: &zgn_compositor::ZgnCompositor,
        request: zgn_compositor::Request,
        _: &(),
        _: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zgn_compositor::Request::Destroy => state.record(compositor, "destroy", vec![]),
            zgn_compositor::Request::CreateVirtualObject { id: object } => {
                let object = data_init.init(object, ());
                state.record(compositor, "create_virtual_object", vec![id(&object)]);
            }
        }
    }
}

impl Dispatch<zgn_virtual_object::ZgnVirtualObject, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        object: &zgn_virtual_object::ZgnVirtualObject,
        request: zgn_virtual_object::Request,
        _: &(),
        _: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zgn_virtual_object::Request::Destroy => state.record(object, "destroy", vec![]),
            zgn_virtual_object::Request::Commit => {
                state.record(object, "commit", vec![]);
                state.on_commit();
            }
            zgn_virtual_object::Request::Frame { callback } => {
                let callback = data_init.init(callback, ());
                state.record(object, "frame", vec![id(&callback)]);
                state.on_frame(callback);
            }
        }
    }
}

impl Dispatch<zgn_shell::ZgnShell, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        shell: &zgn_shell::ZgnShell,
        request: zgn_shell::Request,
        _: &(),
        _: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zgn_shell::Request::Destroy => state.record(shell, "destroy", vec![]),
            zgn_shell::Request::GetCuboidWindow {
                id: window,
                virtual_object,
                half_size,
                quaternion,
            } => {
                let window = data_init.init(window, ());
                if let Some(serial) = state.config.configure_serial {
                    window.configure(serial, half_size.clone(), quaternion.clone());
                }
                state.record(
                    shell,
                    "get_cuboid_window",
                    vec![
                        id(&window),
                        id(&virtual_object),
                        Arg::Array(half_size),
                        Arg::Array(quaternion),
                    ],
                );
            }
        }
    }
}

impl Dispatch<zgn_cuboid_window::ZgnCuboidWindow, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        window: &zgn_cuboid_window::ZgnCuboidWindow,
        request: zgn_cuboid_window::Request,
        _: &(),
        _: &DisplayHandle,
        _: &mut DataInit<'_, Self>,
    ) {
        match request {
            zgn_cuboid_window::Request::Destroy => state.record(window, "destroy", vec![]),
            zgn_cuboid_window::Request::AckConfigure { serial } => {
                state.record(window, "ack_configure", vec![Arg::Uint(serial)]);
            }
        }
    }
}

impl Dispatch<zgn_opengl::ZgnOpengl, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        opengl: &zgn_opengl::ZgnOpengl,
        request: zgn_opengl::Request,
        _: &(),
        _: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            zgn_opengl::Request::Destroy => state.record(opengl, "destroy", vec![]),
            zgn_opengl::Request::CreateOpenglComponent {
                id: component,
                virtual_object,
            } => {
                let component = data_init.init(component, ());
                state.record(
                    opengl,
                    "create_opengl_component",
                    vec![id(&component), id(&virtual_object)],
                );
            }
            zgn_opengl::Request::CreateVertexBuffer { id: buffer } => {
                let buffer = data_init.init(buffer, ());
                state.record(opengl, "create_vertex_buffer", vec![id(&buffer)]);
            }
            zgn_opengl::Request::CreateElementArrayBuffer { id: buffer } => {
                let buffer = data_init.init(buffer, ());
                state.record(opengl, "create_element_array_buffer", vec![id(&buffer)]);
            }
            zgn_opengl::Request::CreateShaderProgram { id: program } => {
                let program = data_init.init(program, ());
                state.record(opengl, "create_shader_program", vec![id(&program)]);
            }
        }
    }
}

impl Dispatch<zgn_opengl_component::ZgnOpenglComponent, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        component: &zgn_opengl_component::ZgnOpenglComponent,
        request: zgn_opengl_component::Request,
        _: &(),
        _: &DisplayHandle,
        _: &mut DataInit<'_, Self>,
    ) {
        use zgn_opengl_component::Request as R;
        let (name, args) = match request {
            R::Destroy => ("destroy", vec![]),
            R::AttachVertexBuffer { vertex_buffer } => {
                ("attach_vertex_buffer", vec![id(&vertex_buffer)])
            }
            R::AttachElementArrayBuffer {
                element_array_buffer,
            } => (
                "attach_element_array_buffer",
                vec![id(&element_array_buffer)],
            ),
            R::AttachShaderProgram { shader_program } => {
                ("attach_shader_program", vec![id(&shader_program)])
            }
            R::SetCount { count } => ("set_count", vec![Arg::Uint(count)]),
            R::SetTopology { topology } => ("set_topology", vec![Arg::Uint(topology)]),
            R::AddVertexAttribute {
                index,
                size,
                attribute_type,
                normalized,
                stride,
                offset,
            } => (
                "add_vertex_attribute",
                [index, size, attribute_type, normalized, stride, offset]
                    .into_iter()
                    .map(Arg::Uint)
                    .collect(),
            ),
        };
        state.record(component, name, args);
    }
}

impl Dispatch<zgn_opengl_vertex_buffer::ZgnOpenglVertexBuffer, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        buffer: &zgn_opengl_vertex_buffer::ZgnOpenglVertexBuffer,
        request: zgn_opengl_vertex_buffer::Request,
        _: &(),
        _: &DisplayHandle,
        _: &mut DataInit<'_, Self>,
    ) {
        match request {
            zgn_opengl_vertex_buffer::Request::Destroy => state.record(buffer, "destroy", vec![]),
            zgn_opengl_vertex_buffer::Request::Attach { buffer: storage } => {
                state.record(buffer, "attach", vec![id(&storage)]);
            }
        }
    }
}

impl Dispatch<zgn_opengl_element_array_buffer::ZgnOpenglElementArrayBuffer, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        buffer: &zgn_opengl_element_array_buffer::ZgnOpenglElementArrayBuffer,
        request: zgn_opengl_element_array_buffer::Request,
        _: &(),
        _: &DisplayHandle,
        _: &mut DataInit<'_, Self>,
    ) {
        match request {
            zgn_opengl_element_array_buffer::Request::Destroy => {
                state.record(buffer, "destroy", vec![]);
            }
            zgn_opengl_element_array_buffer::Request::Attach {
                buffer: storage,
                indices_type,
            } => {
                state.record(
                    buffer,
                    "attach",
                    vec![id(&storage), Arg::Uint(indices_type)],
                );
            }
        }
    }
}

impl Dispatch<zgn_opengl_shader_program::ZgnOpenglShaderProgram, ()> for MockState {
    fn request(
        state: &mut Self,
        _: &Client,
        program: &zgn_opengl_shader_program::ZgnOpenglShaderProgram,
        request: zgn_opengl_shader_program::Request,
        _: &(),
        _: &DisplayHandle,
        _: &mut DataInit<'_, Self>,
    ) {
        use zgn_opengl_shader_program::Request as R;
        let (name, args) = match request {
            R::Destroy => ("destroy", vec![]),
            R::SetUniformFloatVector {
                location,
                size,
                count,
                value,
            } => (
                "set_uniform_float_vector",
                vec![
                    Arg::Str(location),
                    Arg::Uint(size),
                    Arg::Uint(count),
                    Arg::Array(value),
                ],
            ),
            R::SetVertexShader { fd, size } => {
                ("set_vertex_shader", vec![Arg::Fd(fd), Arg::Uint(size)])
            }
            R::SetFragmentShader { fd, size } => {
                ("set_fragment_shader", vec![Arg::Fd(fd), Arg::Uint(size)])
            }
            R::Link => ("link", vec![]),
        };
        state.record(program, name, args);
    }
}
