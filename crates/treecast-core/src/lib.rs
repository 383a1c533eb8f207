//! treecast Core - Fundamental types and constants
//!
//! This crate defines the types shared by every treecast crate:
//! - The `Message` record carried down the tree
//! - The error type and result alias
//! - Queue and retry constants

pub mod error;
pub mod message;

pub use error::*;
pub use message::*;

use std::time::Duration;

/// Capacity of every bounded queue: node inbound, node child slots and
/// transport inbound/outbound.
pub const QUEUE_CAPACITY: usize = 100;

/// Default number of connection attempts made for each child before giving up.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default wait between two connection attempts.
pub const DEFAULT_CONNECT_INTERVAL: Duration = Duration::from_secs(1);
