// src/scene/mod.rs

//! The scene object: a rotating wireframe cuboid rendered by the compositor.
//!
//! Geometry and shader text are uploaded once through shared memory. After
//! that the only per-frame traffic is a uniform update, a frame request and a
//! commit, issued from the frame callback so the animation re-arms itself.

pub mod geometry;
pub mod shader;

use std::num::NonZeroU32;
use std::os::fd::AsFd;

use log::{debug, error, info, trace, warn};
use wayland_client::protocol::{wl_buffer, wl_callback, wl_shm, wl_shm_pool};
use wayland_client::{delegate_noop, Connection as WlConnection, Dispatch, Proxy, QueueHandle};

use crate::config::Config;
use crate::connection::{Connection, Globals};
use crate::dispatcher::Flow;
use crate::error::{AllocationError, CreationError, DispatchError};
use crate::os::shm::SharedRegion;
use crate::protocol::client::{
    zgn_cuboid_window, zgn_opengl_component, zgn_opengl_element_array_buffer,
    zgn_opengl_shader_program, zgn_opengl_vertex_buffer, zgn_virtual_object,
};

use geometry::{
    cuboid_vertices, half_size, pool_payload, rotation_angle, IDENTITY_QUATERNION, INDEX_BYTES,
    INDEX_COUNT, VERTEX_BYTES, VERTEX_STRIDE,
};

/// Knobs that shape the cuboid and its animation.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneOptions {
    pub half_size_divisor: f32,
    pub vertex_extent_divisor: f32,
    pub rotation_period_ms: u32,
    pub uniform_name: String,
    pub max_frames: Option<u64>,
}

impl Default for SceneOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SceneOptions {
    fn from(config: &Config) -> Self {
        SceneOptions {
            half_size_divisor: config.cuboid.half_size_divisor,
            vertex_extent_divisor: config.cuboid.vertex_extent_divisor,
            rotation_period_ms: config.animation.rotation_period_ms,
            uniform_name: config.animation.uniform_name.clone(),
            max_frames: config.animation.max_frames,
        }
    }
}

impl SceneOptions {
    /// Checks everything the frame path relies on and returns the rotation
    /// period in its non-zero form.
    fn validate(&self) -> Result<NonZeroU32, CreationError> {
        let invalid = |field, reason| CreationError::InvalidOptions { field, reason };
        for (field, value) in [
            ("half_size_divisor", self.half_size_divisor),
            ("vertex_extent_divisor", self.vertex_extent_divisor),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(field, "must be a positive finite number"));
            }
        }
        if self.uniform_name.is_empty() || self.uniform_name.contains('\0') {
            return Err(invalid("uniform_name", "must be non-empty and free of NUL bytes"));
        }
        if self.max_frames == Some(0) {
            return Err(invalid("max_frames", "must be at least 1 when set"));
        }
        NonZeroU32::new(self.rotation_period_ms)
            .ok_or_else(|| invalid("rotation_period_ms", "must be non-zero"))
    }
}

/// A pending "tell me when to draw the next frame" request.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameToken {
    callback: wl_callback::WlCallback,
}

impl FrameToken {
    fn request(
        virtual_object: &zgn_virtual_object::ZgnVirtualObject,
        qh: &QueueHandle<SceneObject>,
    ) -> Self {
        let callback = virtual_object.frame(qh, ());
        trace!("Requested frame callback {}", callback.id());
        Self { callback }
    }

    pub fn callback(&self) -> &wl_callback::WlCallback {
        &self.callback
    }
}

/// Remote objects owned by the scene.
#[derive(Debug, Default)]
struct RemoteHandles {
    shader: Option<zgn_opengl_shader_program::ZgnOpenglShaderProgram>,
    vertex_buffer: Option<zgn_opengl_vertex_buffer::ZgnOpenglVertexBuffer>,
    vertex_wl_buffer: Option<wl_buffer::WlBuffer>,
    element_array_buffer: Option<zgn_opengl_element_array_buffer::ZgnOpenglElementArrayBuffer>,
    element_wl_buffer: Option<wl_buffer::WlBuffer>,
    pool: Option<wl_shm_pool::WlShmPool>,
    component: Option<zgn_opengl_component::ZgnOpenglComponent>,
    cuboid_window: Option<zgn_cuboid_window::ZgnCuboidWindow>,
    virtual_object: Option<zgn_virtual_object::ZgnVirtualObject>,
}

impl RemoteHandles {
    /// Attachments go before the component, the window before the virtual
    /// object it was created for. Releasing twice is a no-op.
    fn release(&mut self) {
        if let Some(shader) = self.shader.take() {
            shader.destroy();
        }
        if let Some(vertex_buffer) = self.vertex_buffer.take() {
            vertex_buffer.destroy();
        }
        if let Some(buffer) = self.vertex_wl_buffer.take() {
            buffer.destroy();
        }
        if let Some(element_array_buffer) = self.element_array_buffer.take() {
            element_array_buffer.destroy();
        }
        if let Some(buffer) = self.element_wl_buffer.take() {
            buffer.destroy();
        }
        if let Some(pool) = self.pool.take() {
            pool.destroy();
        }
        if let Some(component) = self.component.take() {
            component.destroy();
        }
        if let Some(window) = self.cuboid_window.take() {
            window.destroy();
        }
        if let Some(virtual_object) = self.virtual_object.take() {
            virtual_object.destroy();
        }
    }
}

/// Proxies the per-frame path needs; all present once creation succeeded.
#[derive(Debug, Clone)]
struct Core {
    virtual_object: zgn_virtual_object::ZgnVirtualObject,
    cuboid_window: zgn_cuboid_window::ZgnCuboidWindow,
    component: zgn_opengl_component::ZgnOpenglComponent,
    shader: zgn_opengl_shader_program::ZgnOpenglShaderProgram,
}

#[derive(Debug)]
pub struct SceneObject {
    width: f32,
    height: f32,
    depth: f32,
    core: Core,
    handles: RemoteHandles,
    frame: Option<FrameToken>,
    options: SceneOptions,
    period: NonZeroU32,
    frames_fired: u64,
}

impl SceneObject {
    pub fn create(
        connection: &Connection,
        width: f32,
        height: f32,
        depth: f32,
    ) -> Result<Self, CreationError> {
        Self::create_with(connection, width, height, depth, SceneOptions::default())
    }

    /// Builds the cuboid, issues the first frame request, commits and
    /// flushes.
    ///
    /// Arguments are validated before anything is sent. On a later failure
    /// every remote object created so far is released before the error is
    /// returned.
    pub fn create_with(
        connection: &Connection,
        width: f32,
        height: f32,
        depth: f32,
        options: SceneOptions,
    ) -> Result<Self, CreationError> {
        if [width, height, depth]
            .iter()
            .any(|v| !v.is_finite() || *v <= 0.0)
        {
            return Err(CreationError::InvalidDimensions {
                width,
                height,
                depth,
            });
        }
        let period = options.validate()?;

        let qh = connection.queue_handle();
        let mut handles = RemoteHandles::default();

        let built = Self::build(
            connection.globals(),
            &qh,
            &mut handles,
            [width, height, depth],
            &options,
        )
        .and_then(|core| {
            let frame = FrameToken::request(&core.virtual_object, &qh);
            core.virtual_object.commit();
            connection.flush()?;
            Ok((core, frame))
        });

        match built {
            Ok((core, frame)) => {
                info!(
                    "Created cuboid {}x{}x{} as {}",
                    width,
                    height,
                    depth,
                    core.virtual_object.id()
                );
                Ok(Self {
                    width,
                    height,
                    depth,
                    core,
                    handles,
                    frame: Some(frame),
                    options,
                    period,
                    frames_fired: 0,
                })
            }
            Err(e) => {
                error!("Failed to create cuboid: {}", e);
                handles.release();
                if let Err(flush_err) = connection.flush() {
                    warn!("Failed to flush partial cuboid release: {}", flush_err);
                }
                Err(e)
            }
        }
    }

    fn build(
        globals: &Globals,
        qh: &QueueHandle<SceneObject>,
        handles: &mut RemoteHandles,
        [width, height, depth]: [f32; 3],
        options: &SceneOptions,
    ) -> Result<Core, CreationError> {
        let virtual_object = globals.compositor.create_virtual_object(qh, ());
        handles.virtual_object = Some(virtual_object.clone());

        let half = half_size(width, height, depth, options.half_size_divisor);
        let cuboid_window = globals.shell.get_cuboid_window(
            &virtual_object,
            float_array(&half),
            float_array(&IDENTITY_QUATERNION),
            qh,
            (),
        );
        handles.cuboid_window = Some(cuboid_window.clone());

        let component = globals
            .opengl
            .create_opengl_component(&virtual_object, qh, ());
        handles.component = Some(component.clone());

        // Vertices and indices share one pool. The request duplicates the
        // descriptor, so the local region can go once it is sent.
        let vertices = cuboid_vertices(width, height, depth, options.vertex_extent_divisor);
        let region = SharedRegion::with_contents(&pool_payload(&vertices))?;
        let pool = globals
            .shm
            .create_pool(region.as_fd(), region.size() as i32, qh, ());
        handles.pool = Some(pool.clone());
        drop(region);

        let vertex_buffer = globals.opengl.create_vertex_buffer(qh, ());
        handles.vertex_buffer = Some(vertex_buffer.clone());
        let vertex_wl_buffer = create_buffer(&pool, 0, VERTEX_BYTES, qh);
        handles.vertex_wl_buffer = Some(vertex_wl_buffer.clone());
        vertex_buffer.attach(&vertex_wl_buffer);
        component.attach_vertex_buffer(&vertex_buffer);

        let element_array_buffer = globals.opengl.create_element_array_buffer(qh, ());
        handles.element_array_buffer = Some(element_array_buffer.clone());
        let element_wl_buffer = create_buffer(&pool, VERTEX_BYTES, INDEX_BYTES, qh);
        handles.element_wl_buffer = Some(element_wl_buffer.clone());
        element_array_buffer.attach(
            &element_wl_buffer,
            zgn_opengl_element_array_buffer::IndicesType::UnsignedShort.into(),
        );
        component.attach_element_array_buffer(&element_array_buffer);

        let program = globals.opengl.create_shader_program(qh, ());
        handles.shader = Some(program.clone());
        let (region, size) = shader_region(shader::VERTEX_SHADER)?;
        program.set_vertex_shader(region.as_fd(), size);
        let (region, size) = shader_region(shader::FRAGMENT_SHADER)?;
        program.set_fragment_shader(region.as_fd(), size);
        program.link();
        component.attach_shader_program(&program);

        component.set_count(INDEX_COUNT as u32);
        component.set_topology(zgn_opengl_component::Topology::Lines.into());
        component.add_vertex_attribute(
            0,
            3,
            zgn_opengl_component::VertexAttributeType::Float.into(),
            0,
            VERTEX_STRIDE as u32,
            0,
        );

        Ok(Core {
            virtual_object,
            cuboid_window,
            component,
            shader: program,
        })
    }

    #[cfg(test)]
    pub fn pending_frame(&self) -> Option<&FrameToken> {
        self.frame.as_ref()
    }

    /// Zero or one; never more.
    pub fn outstanding_frames(&self) -> usize {
        usize::from(self.frame.is_some())
    }

    pub fn frames_fired(&self) -> u64 {
        self.frames_fired
    }

    /// Asks the loop to stop once the configured frame limit is reached.
    pub fn flow(&self) -> Flow {
        match self.options.max_frames {
            Some(max) if self.frames_fired >= max => Flow::Stop,
            _ => Flow::Continue,
        }
    }

    pub fn commit(&self) {
        self.core.virtual_object.commit();
    }

    /// Consumes the outstanding frame token and re-arms the animation:
    /// uniform update, shader re-attach, next frame request, commit.
    ///
    /// Returns false (and does nothing) when `callback` is not the
    /// outstanding token.
    pub fn on_frame_fired(
        &mut self,
        qh: &QueueHandle<SceneObject>,
        callback: &wl_callback::WlCallback,
        time: u32,
    ) -> bool {
        match self.frame.take() {
            Some(token) if token.callback == *callback => {}
            other => {
                warn!(
                    "Ignoring done for callback {} (outstanding: {:?})",
                    callback.id(),
                    other.as_ref().map(|token| token.callback.id())
                );
                self.frame = other;
                return false;
            }
        }

        let angle = rotation_angle(time, self.period);
        trace!("Frame at {} ms: {} = {:.4} rad", time, self.options.uniform_name, angle);
        self.core.shader.set_uniform_float_vector(
            self.options.uniform_name.clone(),
            1,
            1,
            float_array(&[angle]),
        );
        self.core.component.attach_shader_program(&self.core.shader);
        self.frame = Some(FrameToken::request(&self.core.virtual_object, qh));
        self.commit();
        self.frames_fired += 1;
        debug_assert_eq!(self.outstanding_frames(), 1);
        true
    }

    /// Accepts whatever the compositor proposed; resizing is not supported.
    pub fn configure_ack(&self, serial: u32) {
        self.core.cuboid_window.ack_configure(serial);
    }

    /// Releases every remote object in dependency order and flushes.
    pub fn destroy(mut self, connection: &Connection) -> Result<(), DispatchError> {
        // A callback whose virtual object is gone never fires.
        self.frame = None;
        self.handles.release();
        info!(
            "Destroyed {}x{}x{} cuboid {} after {} frames",
            self.width,
            self.height,
            self.depth,
            self.core.virtual_object.id(),
            self.frames_fired
        );
        connection.flush()
    }
}

/// Packs floats in native byte order for a `wl_array` argument.
fn float_array(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

/// Reads a `wl_array` of native-endian floats; a trailing partial float is
/// ignored.
fn parse_float_array(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn shader_region(source: &str) -> Result<(SharedRegion, u32), AllocationError> {
    let bytes = shader::source_bytes(source);
    let region = SharedRegion::with_contents(&bytes)?;
    Ok((region, bytes.len() as u32))
}

fn create_buffer(
    pool: &wl_shm_pool::WlShmPool,
    offset: usize,
    len: usize,
    qh: &QueueHandle<SceneObject>,
) -> wl_buffer::WlBuffer {
    pool.create_buffer(
        offset as i32,
        len as i32,
        1,
        len as i32,
        wl_shm::Format::Argb8888,
        qh,
        (),
    )
}

impl Dispatch<wl_callback::WlCallback, ()> for SceneObject {
    fn event(
        scene: &mut Self,
        callback: &wl_callback::WlCallback,
        event: wl_callback::Event,
        _: &(),
        _: &WlConnection,
        qh: &QueueHandle<Self>,
    ) {
        if let wl_callback::Event::Done { callback_data } = event {
            scene.on_frame_fired(qh, callback, callback_data);
        }
    }
}

impl Dispatch<zgn_cuboid_window::ZgnCuboidWindow, ()> for SceneObject {
    fn event(
        scene: &mut Self,
        window: &zgn_cuboid_window::ZgnCuboidWindow,
        event: zgn_cuboid_window::Event,
        _: &(),
        _: &WlConnection,
        _: &QueueHandle<Self>,
    ) {
        if *window != scene.core.cuboid_window {
            warn!("Event for unknown window {}", window.id());
            return;
        }
        match event {
            zgn_cuboid_window::Event::Configure {
                serial,
                half_size,
                quaternion,
            } => {
                debug!(
                    "Configure serial {}: half size {:?}, quaternion {:?}",
                    serial,
                    parse_float_array(&half_size),
                    parse_float_array(&quaternion)
                );
                scene.configure_ack(serial);
            }
            zgn_cuboid_window::Event::Moved { face_direction } => {
                debug!(
                    "Window {} moved, facing {:?}",
                    window.id(),
                    parse_float_array(&face_direction)
                );
            }
        }
    }
}

delegate_noop!(SceneObject: zgn_virtual_object::ZgnVirtualObject);
delegate_noop!(SceneObject: zgn_opengl_component::ZgnOpenglComponent);
delegate_noop!(SceneObject: zgn_opengl_vertex_buffer::ZgnOpenglVertexBuffer);
delegate_noop!(SceneObject: zgn_opengl_element_array_buffer::ZgnOpenglElementArrayBuffer);
delegate_noop!(SceneObject: zgn_opengl_shader_program::ZgnOpenglShaderProgram);
delegate_noop!(SceneObject: wl_shm_pool::WlShmPool);
delegate_noop!(SceneObject: ignore wl_buffer::WlBuffer);
