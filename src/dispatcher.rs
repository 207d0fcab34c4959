// src/dispatcher.rs

//! The event loop that multiplexes the display socket through epoll.
//!
//! The event queue buffers inbound messages, so a naive blocking
//! read-then-dispatch can sleep on the socket while events already sit in the
//! local queue. Each iteration therefore follows the prepare/flush/wait/read/
//! dispatch/flush order:
//!
//! 1. claim the read, draining the local queue first while it is non-empty;
//! 2. flush requests queued so far;
//! 3. block in `epoll_wait` with no timeout;
//! 4. read the socket only once epoll reports it readable, then dispatch;
//! 5. flush whatever the handlers queued in response.
//!
//! A stop request from a handler or a signal takes effect at the top of the
//! next iteration. Server hangup is not a stop: events that arrived before it
//! are still dispatched, then the loop fails with [`DispatchError::Closed`].

use std::os::fd::{AsFd, AsRawFd};

use log::{debug, info, trace, warn};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use crate::error::DispatchError;
use crate::os::epoll::{EpollFlags, EventMonitor};

const DISPLAY_TOKEN: u64 = 0;
const SIGNAL_TOKEN: u64 = 1;

/// Whether dispatch should keep going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Outcome of trying to claim the right to read the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadIntent {
    Claimed,
    /// Events are already queued locally and must be dispatched first.
    QueuePending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    Received(usize),
    /// The server closed its end; events read before the hangup are still
    /// dispatchable.
    Closed,
}

/// The buffered protocol connection the dispatcher drives.
///
/// A successful `prepare_read` claims the socket until the matching
/// `read_events` or `cancel_read`.
pub trait Transport<H: ?Sized>: AsRawFd {
    fn prepare_read(&mut self) -> Result<ReadIntent, DispatchError>;
    fn cancel_read(&mut self);
    fn read_events(&mut self) -> Result<ReadStatus, DispatchError>;
    fn dispatch_pending(&mut self, handler: &mut H) -> Result<Flow, DispatchError>;
    fn flush(&mut self) -> Result<(), DispatchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopped,
}

pub struct Dispatcher {
    monitor: EventMonitor,
    state: LoopState,
    signals: Option<SignalFd>,
}

impl Dispatcher {
    pub fn new() -> Result<Self, DispatchError> {
        let monitor = EventMonitor::new().map_err(DispatchError::Monitor)?;
        Ok(Self {
            monitor,
            state: LoopState::Idle,
            signals: None,
        })
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Routes SIGINT and SIGTERM through a signalfd so they wake the wait and
    /// stop the loop cleanly instead of killing the process mid-frame.
    pub fn watch_signals(&mut self) -> Result<(), DispatchError> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.thread_block()
            .map_err(|errno| DispatchError::Monitor(errno.into()))?;
        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|errno| DispatchError::Monitor(errno.into()))?;
        self.monitor
            .add(signals.as_fd().as_raw_fd(), SIGNAL_TOKEN, EpollFlags::EPOLLIN)
            .map_err(DispatchError::Monitor)?;
        debug!("Watching SIGINT/SIGTERM via signalfd");
        self.signals = Some(signals);
        Ok(())
    }

    /// Runs until a handler or a signal stops the loop.
    ///
    /// Server hangup fails with [`DispatchError::Closed`]. The dispatcher runs
    /// once; a second call fails with `NotIdle`.
    pub fn run<H, T>(&mut self, transport: &mut T, handler: &mut H) -> Result<(), DispatchError>
    where
        H: ?Sized,
        T: Transport<H>,
    {
        if self.state != LoopState::Idle {
            return Err(DispatchError::NotIdle);
        }

        let fd = transport.as_raw_fd();
        self.monitor
            .add(fd, DISPLAY_TOKEN, EpollFlags::EPOLLIN)
            .map_err(DispatchError::Register)?;
        self.state = LoopState::Running;
        info!("Dispatcher running on display fd {}", fd);

        let result = self.run_loop(transport, handler);

        self.state = LoopState::Stopped;
        if let Err(e) = self.monitor.delete(fd) {
            warn!("Failed to deregister display fd {}: {}", fd, e);
        }
        match &result {
            Ok(()) => info!("Dispatcher stopped"),
            Err(e) => warn!("Dispatcher terminated: {}", e),
        }
        result
    }

    fn run_loop<H, T>(&mut self, transport: &mut T, handler: &mut H) -> Result<(), DispatchError>
    where
        H: ?Sized,
        T: Transport<H>,
    {
        transport.flush()?;
        while self.state == LoopState::Running {
            self.iterate(transport, handler)?;
        }
        Ok(())
    }

    /// Takes effect at the top of the next iteration; a loop that is not
    /// running is left alone.
    pub fn stop(&mut self) {
        if self.state == LoopState::Running {
            debug!("Stop requested");
            self.state = LoopState::Stopped;
        }
    }

    fn iterate<H, T>(&mut self, transport: &mut T, handler: &mut H) -> Result<(), DispatchError>
    where
        H: ?Sized,
        T: Transport<H>,
    {
        // Terminates: each pass empties the queue, after which the claim succeeds.
        loop {
            match transport.prepare_read()? {
                ReadIntent::Claimed => break,
                ReadIntent::QueuePending => {
                    trace!("Events queued locally; dispatching before read");
                    if transport.dispatch_pending(handler)? == Flow::Stop {
                        self.stop();
                    }
                }
            }
        }

        if let Err(e) = transport.flush() {
            transport.cancel_read();
            return Err(e);
        }
        if self.state != LoopState::Running {
            transport.cancel_read();
            return Ok(());
        }

        let (display_ready, signal_ready) = match self.monitor.wait(None) {
            Ok(ready) => (
                ready
                    .iter()
                    .any(|r| r.token == DISPLAY_TOKEN && r.flags.is_readable()),
                ready.iter().any(|r| r.token == SIGNAL_TOKEN),
            ),
            Err(e) => {
                transport.cancel_read();
                return Err(DispatchError::Wait(e));
            }
        };

        if signal_ready {
            self.drain_signals();
            self.stop();
        }

        if !display_ready {
            // Interrupted or woken for another source; never read blind.
            transport.cancel_read();
            return Ok(());
        }

        let status = transport.read_events()?;
        if transport.dispatch_pending(handler)? == Flow::Stop {
            self.stop();
        }

        if status == ReadStatus::Closed {
            warn!("Compositor closed the connection");
            return Err(DispatchError::Closed);
        }

        transport.flush()
    }

    fn drain_signals(&mut self) {
        let Some(signals) = self.signals.as_mut() else {
            return;
        };
        loop {
            match signals.read_signal() {
                Ok(Some(info)) => info!("Received signal {}; stopping", info.ssi_signo),
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read signalfd: {}", e);
                    break;
                }
            }
        }
    }
}
