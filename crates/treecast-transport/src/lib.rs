//! treecast Transport Layer - carries messages between tree nodes
//!
//! This crate provides:
//! - The `Transport` capability trait and its factory type
//! - `Server` and `Client` wrappers binding a transport to an address
//! - TCP transport speaking newline-delimited text
//! - In-process transport for wiring assemblies without sockets

pub mod memory;
mod shared;
pub mod tcp;
pub mod transport;
pub mod wire;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::*;
pub use transport::*;
