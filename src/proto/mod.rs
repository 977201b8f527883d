//! Generated protobuf modules for the seeding bridge
//!
//! Checked-in output of prost/tonic for `proto/database_bridge.proto`
//! (client side only). Messages and client share one module so the
//! generated `super::` paths resolve.

#![allow(clippy::all)]

pub mod database_bridge {
    include!("database_bridge.rs");
    include!("database_bridge.tonic.rs");
}
