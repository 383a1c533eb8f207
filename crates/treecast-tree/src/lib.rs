//! treecast Tree - node assembly and orchestration
//!
//! A tree node binds together:
//! - one broadcast `Node`
//! - one `Server` accepting messages from the parent
//! - one `Client` per configured child slot
//!
//! and keeps messages moving between them with bridging tasks, while child
//! connections are established with bounded retry.

pub mod assembly;
pub mod bridge;
pub mod config;

pub use assembly::*;
pub use config::*;
