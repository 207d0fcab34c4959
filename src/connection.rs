// src/connection.rs

//! The connection to the compositor: display socket, bound globals, and the
//! dispatcher that drives the scene.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use log::{debug, info, trace, warn};
use wayland_backend::client::{ReadEventsGuard, WaylandError};
use wayland_client::protocol::{wl_registry, wl_shm};
use wayland_client::{
    delegate_noop, Connection as WlConnection, Dispatch, EventQueue, Proxy, QueueHandle,
};

use crate::dispatcher::{Dispatcher, Flow, ReadIntent, ReadStatus, Transport};
use crate::error::{CapabilityError, DispatchError};
use crate::protocol::client::{zgn_compositor, zgn_opengl, zgn_shell};
use crate::scene::SceneObject;

/// Every interface the client uses is written against version 1.
const SUPPORTED_VERSION: u32 = 1;

/// Resolves a socket name against `$XDG_RUNTIME_DIR` unless it is absolute.
pub fn socket_path(name: &str) -> Result<PathBuf, DispatchError> {
    let path = PathBuf::from(name);
    if path.is_absolute() {
        return Ok(path);
    }
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .ok_or_else(|| DispatchError::NoRuntimeDir(name.to_owned()))?;
    Ok(PathBuf::from(runtime_dir).join(name))
}

fn negotiate(advertised: u32) -> u32 {
    advertised.min(SUPPORTED_VERSION)
}

/// True for the errors a socket reports once the compositor has gone away.
fn is_hangup(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

fn backend_error(err: WaylandError, io_error: fn(io::Error) -> DispatchError) -> DispatchError {
    match err {
        WaylandError::Io(e) if is_hangup(&e) => DispatchError::Closed,
        WaylandError::Io(e) => io_error(e),
        WaylandError::Protocol(e) => DispatchError::Protocol {
            interface: e.object_interface,
            object: e.object_id,
            code: e.code,
            message: e.message,
        },
    }
}

fn dispatch_error(err: wayland_client::DispatchError) -> DispatchError {
    match err {
        wayland_client::DispatchError::BadMessage {
            interface, opcode, ..
        } => DispatchError::BadMessage { interface, opcode },
        wayland_client::DispatchError::Backend(e) => backend_error(e, DispatchError::Read),
    }
}

/// The four globals the client cannot work without.
#[derive(Debug, Clone)]
pub struct Globals {
    pub shm: wl_shm::WlShm,
    pub compositor: zgn_compositor::ZgnCompositor,
    pub shell: zgn_shell::ZgnShell,
    pub opengl: zgn_opengl::ZgnOpengl,
}

/// Collects globals during the startup roundtrip.
#[derive(Debug, Default)]
struct RegistryBinder {
    shm: Option<wl_shm::WlShm>,
    compositor: Option<zgn_compositor::ZgnCompositor>,
    shell: Option<zgn_shell::ZgnShell>,
    opengl: Option<zgn_opengl::ZgnOpengl>,
}

impl RegistryBinder {
    fn resolve(&mut self) -> Result<Globals, CapabilityError> {
        match (&self.shm, &self.compositor, &self.shell, &self.opengl) {
            (Some(shm), Some(compositor), Some(shell), Some(opengl)) => Ok(Globals {
                shm: shm.clone(),
                compositor: compositor.clone(),
                shell: shell.clone(),
                opengl: opengl.clone(),
            }),
            _ => {
                let missing = [
                    (self.shm.is_none(), wl_shm::WlShm::interface().name),
                    (self.compositor.is_none(), zgn_compositor::ZgnCompositor::interface().name),
                    (self.shell.is_none(), zgn_shell::ZgnShell::interface().name),
                    (self.opengl.is_none(), zgn_opengl::ZgnOpengl::interface().name),
                ]
                .into_iter()
                .filter(|(absent, _)| *absent)
                .map(|(_, name)| name)
                .collect();
                Err(CapabilityError::Missing(missing))
            }
        }
    }

    /// Destroys whatever was bound; `wl_shm` v1 has no destructor and is
    /// only dropped.
    fn release(&mut self) {
        if let Some(compositor) = self.compositor.take() {
            compositor.destroy();
        }
        if let Some(shell) = self.shell.take() {
            shell.destroy();
        }
        if let Some(opengl) = self.opengl.take() {
            opengl.destroy();
        }
        self.shm = None;
    }
}

fn bind<I>(
    registry: &wl_registry::WlRegistry,
    name: u32,
    advertised: u32,
    qh: &QueueHandle<RegistryBinder>,
) -> I
where
    I: Proxy + 'static,
    RegistryBinder: Dispatch<I, ()>,
{
    let version = negotiate(advertised);
    let proxy = registry.bind::<I, _, _>(name, version, qh, ());
    info!("Bound {} v{} as {}", I::interface().name, version, proxy.id());
    proxy
}

impl Dispatch<wl_registry::WlRegistry, ()> for RegistryBinder {
    fn event(
        binder: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &WlConnection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => {
                debug!("Global {} {} v{}", name, interface, version);
                match interface.as_str() {
                    "wl_shm" if binder.shm.is_none() => {
                        binder.shm = Some(bind(registry, name, version, qh));
                    }
                    "zgn_compositor" if binder.compositor.is_none() => {
                        binder.compositor = Some(bind(registry, name, version, qh));
                    }
                    "zgn_shell" if binder.shell.is_none() => {
                        binder.shell = Some(bind(registry, name, version, qh));
                    }
                    "zgn_opengl" if binder.opengl.is_none() => {
                        binder.opengl = Some(bind(registry, name, version, qh));
                    }
                    _ => {}
                }
            }
            wl_registry::Event::GlobalRemove { name } => {
                warn!("Global {} removed during handshake", name);
            }
            other => trace!("Ignoring registry event {:?}", other),
        }
    }
}

delegate_noop!(RegistryBinder: ignore wl_shm::WlShm);
delegate_noop!(RegistryBinder: zgn_compositor::ZgnCompositor);
delegate_noop!(RegistryBinder: zgn_shell::ZgnShell);
delegate_noop!(RegistryBinder: zgn_opengl::ZgnOpengl);

/// The scene's event queue as seen by the [`Dispatcher`].
struct QueueTransport<'a> {
    connection: &'a WlConnection,
    queue: &'a mut EventQueue<SceneObject>,
    guard: Option<ReadEventsGuard>,
}

impl AsRawFd for QueueTransport<'_> {
    fn as_raw_fd(&self) -> RawFd {
        self.connection.backend().poll_fd().as_raw_fd()
    }
}

impl Transport<SceneObject> for QueueTransport<'_> {
    fn prepare_read(&mut self) -> Result<ReadIntent, DispatchError> {
        match self.queue.prepare_read() {
            Some(guard) => {
                self.guard = Some(guard);
                Ok(ReadIntent::Claimed)
            }
            None => Ok(ReadIntent::QueuePending),
        }
    }

    fn cancel_read(&mut self) {
        // Dropping the guard cancels the claim.
        self.guard = None;
    }

    fn read_events(&mut self) -> Result<ReadStatus, DispatchError> {
        let Some(guard) = self.guard.take() else {
            warn!("read_events without a claimed read");
            return Ok(ReadStatus::Received(0));
        };
        match guard.read() {
            Ok(count) => Ok(ReadStatus::Received(count)),
            Err(WaylandError::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                Ok(ReadStatus::Received(0))
            }
            Err(WaylandError::Io(e)) if is_hangup(&e) => {
                debug!("Display socket hung up: {}", e);
                Ok(ReadStatus::Closed)
            }
            Err(e) => Err(backend_error(e, DispatchError::Read)),
        }
    }

    fn dispatch_pending(&mut self, scene: &mut SceneObject) -> Result<Flow, DispatchError> {
        let count = self.queue.dispatch_pending(scene).map_err(dispatch_error)?;
        trace!("Dispatched {} events", count);
        Ok(scene.flow())
    }

    fn flush(&mut self) -> Result<(), DispatchError> {
        self.connection
            .flush()
            .map_err(|e| backend_error(e, DispatchError::Flush))
    }
}

pub struct Connection {
    connection: WlConnection,
    queue: EventQueue<SceneObject>,
    globals: Globals,
    dispatcher: Dispatcher,
}

impl Connection {
    pub fn connect(socket_name: &str) -> Result<Self, CapabilityError> {
        let path = socket_path(socket_name)?;
        debug!("Connecting to display socket {}", path.display());
        let stream = UnixStream::connect(&path)
            .map_err(|source| DispatchError::Connect { path, source })?;
        info!("Connected to display {}", socket_name);
        Self::establish(stream)
    }

    /// Performs the registry handshake over an already connected socket.
    ///
    /// Fails with [`CapabilityError::Missing`] if any required global is
    /// absent; globals that were bound are released first.
    pub fn establish(stream: UnixStream) -> Result<Self, CapabilityError> {
        let connection = WlConnection::from_socket(stream).map_err(DispatchError::Attach)?;
        let dispatcher = Dispatcher::new()?;

        let mut handshake = connection.new_event_queue::<RegistryBinder>();
        let _registry = connection.display().get_registry(&handshake.handle(), ());
        let mut binder = RegistryBinder::default();
        handshake
            .roundtrip(&mut binder)
            .map_err(dispatch_error)?;

        let globals = match binder.resolve() {
            Ok(globals) => globals,
            Err(e) => {
                binder.release();
                if let Err(flush_err) = connection.flush() {
                    warn!("Failed to flush global release: {}", flush_err);
                }
                return Err(e);
            }
        };

        info!("All required globals bound: {:?}", globals);
        let queue = connection.new_event_queue();
        Ok(Self {
            connection,
            queue,
            globals,
            dispatcher,
        })
    }

    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// Handle under which scene objects are created so their events reach
    /// [`Connection::run`].
    pub fn queue_handle(&self) -> QueueHandle<SceneObject> {
        self.queue.handle()
    }

    pub fn flush(&self) -> Result<(), DispatchError> {
        self.connection
            .flush()
            .map_err(|e| backend_error(e, DispatchError::Flush))
    }

    pub fn watch_signals(&mut self) -> Result<(), DispatchError> {
        self.dispatcher.watch_signals()
    }

    /// Runs the dispatch loop, delivering events to `scene`.
    pub fn run(&mut self, scene: &mut SceneObject) -> Result<(), DispatchError> {
        let mut transport = QueueTransport {
            connection: &self.connection,
            queue: &mut self.queue,
            guard: None,
        };
        self.dispatcher.run(&mut transport, scene)
    }

    /// Blocks until the compositor has answered everything sent so far.
    #[cfg(test)]
    pub fn roundtrip(&mut self, scene: &mut SceneObject) -> Result<(), DispatchError> {
        self.queue.roundtrip(scene).map_err(dispatch_error)?;
        Ok(())
    }

    #[cfg(test)]
    pub fn display(&self) -> wayland_client::protocol::wl_display::WlDisplay {
        self.connection.display()
    }

    /// Releases the bound globals and flushes; the socket closes on drop.
    pub fn destroy(self) {
        let Globals {
            compositor,
            shell,
            opengl,
            ..
        } = &self.globals;
        compositor.destroy();
        opengl.destroy();
        shell.destroy();
        if let Err(e) = self.flush() {
            warn!("Failed to flush final requests: {}", e);
        }
        info!("Connection destroyed (dispatcher {:?})", self.dispatcher.state());
    }
}
