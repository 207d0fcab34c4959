// src/os/mod.rs

//! Thin wrappers over the Linux primitives the client needs: epoll for
//! readiness and memfd-backed shared memory for bulk payloads.

pub mod epoll;
pub mod shm;
