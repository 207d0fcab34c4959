// src/protocol/mod.rs

//! Bindings for the Zigen extension, generated from `protocols/zigen.xml`.
//!
//! Core `wl_*` interfaces come from `wayland-client`; only the `zgn_*`
//! interfaces are generated here. The server half exists for the mock
//! compositor used in tests.

#![allow(dead_code, non_camel_case_types, unused_unsafe, unused_variables)]
#![allow(non_upper_case_globals, non_snake_case, unused_imports, clippy::all)]

pub mod client {
    use wayland_client;
    use wayland_client::protocol::*;

    pub mod __interfaces {
        use wayland_client::protocol::__interfaces::*;
        wayland_scanner::generate_interfaces!("protocols/zigen.xml");
    }
    use self::__interfaces::*;

    wayland_scanner::generate_client_code!("protocols/zigen.xml");
}


#[cfg(test)]
pub mod mock;
