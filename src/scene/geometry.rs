// src/scene/geometry.rs

//! Wireframe cuboid geometry and the rotation schedule.
//!
//! Corner `i` takes its x sign from bit 2, y from bit 1 and z from bit 0, so
//! vertex 0 is `(-,-,-)` and vertex 7 is `(+,+,+)`:
//!
//! ```text
//!          2 .-----------. 6
//!           /|          /|        y
//!        3 .-----------. 7        |
//!          | |         | |        o--- x
//!        0 . |---------|-. 4     /
//!          |/          |/       z
//!        1 .-----------. 5
//! ```

use std::f32::consts::TAU;
use std::num::NonZeroU32;

pub const VERTEX_COUNT: usize = 8;
pub const INDEX_COUNT: usize = 24;

/// Twelve edges as index pairs: four along z, four along x, four along y.
pub const EDGE_INDICES: [u16; INDEX_COUNT] = [
    0, 1, 2, 3, 4, 5, 6, 7, // z edges
    0, 4, 1, 5, 2, 6, 3, 7, // x edges
    0, 2, 1, 3, 4, 6, 5, 7, // y edges
];

#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(C)]
pub struct Vertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

pub const VERTEX_STRIDE: usize = std::mem::size_of::<Vertex>();
pub const VERTEX_BYTES: usize = VERTEX_STRIDE * VERTEX_COUNT;
pub const INDEX_BYTES: usize = std::mem::size_of::<u16>() * INDEX_COUNT;
/// Pool layout: vertices first, indices immediately after.
pub const POOL_BYTES: usize = VERTEX_BYTES + INDEX_BYTES;

/// The eight corners at `±extent / divisor` along each axis.
pub fn cuboid_vertices(width: f32, height: f32, depth: f32, divisor: f32) -> [Vertex; VERTEX_COUNT] {
    let sign = |bit: usize, i: usize| if i & (1 << bit) != 0 { 1.0 } else { -1.0 };
    std::array::from_fn(|i| Vertex {
        x: sign(2, i) * width / divisor,
        y: sign(1, i) * height / divisor,
        z: sign(0, i) * depth / divisor,
    })
}

/// Half size proposed to the window system.
pub fn half_size(width: f32, height: f32, depth: f32, divisor: f32) -> [f32; 3] {
    [width / divisor, height / divisor, depth / divisor]
}

/// Identity orientation as `(x, y, z, w)`.
pub const IDENTITY_QUATERNION: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// Serialises vertices and indices in pool layout.
pub fn pool_payload(vertices: &[Vertex; VERTEX_COUNT]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(POOL_BYTES);
    for v in vertices {
        bytes.extend_from_slice(&v.x.to_ne_bytes());
        bytes.extend_from_slice(&v.y.to_ne_bytes());
        bytes.extend_from_slice(&v.z.to_ne_bytes());
    }
    for index in EDGE_INDICES {
        bytes.extend_from_slice(&index.to_ne_bytes());
    }
    bytes
}

/// Rotation angle in radians for a frame timestamp.
///
/// Wraps with the modulo before scaling, so it stays exact for any `u32`
/// timestamp.
pub fn rotation_angle(time: u32, period: NonZeroU32) -> f32 {
    let period = period.get();
    (time % period) as f32 / period as f32 * TAU
}
