//! IDE-facing side of the bridge

pub mod protocol;
pub mod server;

pub use server::{serve, BridgeConfig};
