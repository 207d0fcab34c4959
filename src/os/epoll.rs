// src/os/epoll.rs

//! Wrapper around `epoll` using raw `libc` FFI calls.
//!
//! The dispatcher registers at most a handful of descriptors, each tagged with
//! a caller-chosen `u64` token, and blocks in [`EventMonitor::wait`] until one
//! of them becomes ready.

use bitflags::bitflags;
use log::{debug, trace, warn};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EpollFlags: u32 {
        const EPOLLIN = libc::EPOLLIN as u32;
        const EPOLLOUT = libc::EPOLLOUT as u32;
        const EPOLLERR = libc::EPOLLERR as u32;
        const EPOLLHUP = libc::EPOLLHUP as u32;
        const EPOLLRDHUP = libc::EPOLLRDHUP as u32;
    }
}

impl EpollFlags {
    /// True when the descriptor has data or the peer went away; either way a
    /// read will not block.
    pub fn is_readable(self) -> bool {
        self.intersects(
            EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLERR,
        )
    }
}

/// One ready descriptor reported by `epoll_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: u64,
    pub flags: EpollFlags,
}

const MAX_EVENTS: usize = 16;

#[derive(Debug)]
pub struct EventMonitor {
    epoll_fd: RawFd,
    event_buffer: [libc::epoll_event; MAX_EVENTS],
    ready: Vec<Readiness>,
}

impl EventMonitor {
    pub fn new() -> io::Result<Self> {
        // SAFETY: plain syscall with no pointer arguments; the result is checked.
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error());
        }
        debug!("EventMonitor created with epoll_fd {}", epoll_fd);
        Ok(Self {
            epoll_fd,
            event_buffer: [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
            ready: Vec::with_capacity(MAX_EVENTS),
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, flags: EpollFlags) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, flags)?;
        trace!(
            "Added fd {} to epoll_fd {} with token {} and flags {:?}",
            fd,
            self.epoll_fd,
            token,
            flags
        );
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, EpollFlags::empty())?;
        trace!("Deleted fd {} from epoll_fd {}", fd, self.epoll_fd);
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, flags: EpollFlags) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: flags.bits(),
            u64: token,
        };
        // SAFETY: `event` is a live local for the duration of the call and
        // `epoll_fd` stays open until drop.
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Blocks until at least one registered descriptor is ready.
    ///
    /// `None` waits indefinitely. An interrupted wait (EINTR) yields an empty
    /// slice rather than an error so the caller can re-check its state.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<&[Readiness]> {
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        // SAFETY: the kernel writes at most MAX_EVENTS entries into
        // `event_buffer`, which holds exactly that many.
        let count = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.event_buffer.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms,
            )
        };

        self.ready.clear();
        if count == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("epoll_wait interrupted (EINTR)");
                return Ok(&self.ready);
            }
            return Err(err);
        }

        for event in &self.event_buffer[..count as usize] {
            // Copy out of the packed struct before use.
            let token = event.u64;
            let events = event.events;
            self.ready.push(Readiness {
                token,
                flags: EpollFlags::from_bits_truncate(events),
            });
        }
        trace!("epoll_wait on fd {} returned {} events", self.epoll_fd, count);
        Ok(&self.ready)
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        // SAFETY: the descriptor is owned by this monitor and closed only here.
        if unsafe { libc::close(self.epoll_fd) } == -1 {
            warn!(
                "Failed to close epoll_fd {}: {}",
                self.epoll_fd,
                io::Error::last_os_error()
            );
        } else {
            debug!("Closed epoll_fd {}", self.epoll_fd);
        }
    }
}
