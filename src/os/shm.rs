// src/os/shm.rs

//! Anonymous shared memory for handing bulk payloads to the compositor.
//!
//! A [`SharedRegion`] is a sized `memfd` that never has a filesystem path. The
//! payload is written through a scoped [`Mapping`]; afterwards the descriptor
//! is lent to an outgoing request and the region is dropped, closing the
//! local copy.

use std::ffi::CStr;
use std::io;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use log::{trace, warn};
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::error::AllocationError;

const REGION_NAME: &CStr = c"zcms-shm";

#[derive(Debug)]
pub struct SharedRegion {
    fd: OwnedFd,
    size: NonZeroUsize,
}

impl SharedRegion {
    pub fn allocate(size: usize) -> Result<Self, AllocationError> {
        let size = NonZeroUsize::new(size).ok_or(AllocationError::EmptyRegion)?;

        let fd = memfd_create(REGION_NAME, MFdFlags::MFD_CLOEXEC | MFdFlags::MFD_ALLOW_SEALING)
            .map_err(|errno| AllocationError::Create(io::Error::from(errno)))?;

        // On failure `fd` is dropped and therefore closed.
        nix::unistd::ftruncate(&fd, size.get() as libc::off_t).map_err(|errno| {
            AllocationError::Resize {
                size: size.get(),
                source: io::Error::from(errno),
            }
        })?;

        trace!("Allocated shared region fd {} ({} bytes)", fd.as_raw_fd(), size);
        Ok(Self { fd, size })
    }

    /// Allocates a region exactly the size of `bytes` and fills it.
    pub fn with_contents(bytes: &[u8]) -> Result<Self, AllocationError> {
        let region = Self::allocate(bytes.len())?;
        let mut mapping = region.map()?;
        mapping.copy_from_slice(bytes);
        mapping.finalize()?;
        Ok(region)
    }

    /// Wraps a descriptor received from the other end of the connection.
    #[cfg(test)]
    pub(crate) fn from_fd(fd: OwnedFd, size: usize) -> Result<Self, AllocationError> {
        let size = NonZeroUsize::new(size).ok_or(AllocationError::EmptyRegion)?;
        Ok(Self { fd, size })
    }

    pub fn size(&self) -> usize {
        self.size.get()
    }

    pub fn map(&self) -> Result<Mapping<'_>, AllocationError> {
        // SAFETY: a fresh shared mapping of a descriptor we own; the kernel
        // picks the address and nothing aliases it until `Mapping` is dropped.
        let ptr = unsafe {
            mmap(
                None,
                self.size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.fd,
                0,
            )
        }
        .map_err(|errno| AllocationError::Map {
            size: self.size.get(),
            source: io::Error::from(errno),
        })?;

        Ok(Mapping {
            ptr: Some(ptr.cast::<u8>()),
            len: self.size.get(),
            _region: self,
        })
    }
}

impl AsFd for SharedRegion {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Writable view of a [`SharedRegion`]; unmapped on drop.
pub struct Mapping<'a> {
    ptr: Option<NonNull<u8>>,
    len: usize,
    _region: &'a SharedRegion,
}

impl Mapping<'_> {
    /// Unmaps now and reports failure instead of logging it.
    pub fn finalize(mut self) -> Result<(), AllocationError> {
        self.unmap()
    }

    fn unmap(&mut self) -> Result<(), AllocationError> {
        let Some(ptr) = self.ptr.take() else {
            return Ok(());
        };
        // SAFETY: `ptr`/`len` come from a successful mmap and are unmapped once.
        unsafe { munmap(ptr.cast(), self.len) }.map_err(|errno| AllocationError::Unmap {
            size: self.len,
            source: io::Error::from(errno),
        })
    }
}

impl Deref for Mapping<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: the mapping is live for `len` bytes while `ptr` is Some.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }
}

impl DerefMut for Mapping<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: as above, and `&mut self` guarantees exclusive access.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            warn!("Failed to unmap shared region: {}", e);
        }
    }
}
