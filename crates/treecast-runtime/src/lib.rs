//! treecast Runtime - Node broadcast engine
//!
//! A node owns one inbound queue and one outbound queue per child slot.
//! A single processing task drains the inbound queue in arrival order and
//! fans every message out to all child slots:
//! 1. Stamp the message with the node name
//! 2. Offer it to each child slot in index order
//! 3. Drop it for any slot whose queue is full

pub mod node;

pub use node::*;
