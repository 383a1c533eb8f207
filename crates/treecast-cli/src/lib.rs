//! Command-line front end for treecast tree nodes

pub mod args;
pub mod logging;

pub use args::NodeArgs;
pub use logging::{init_tracing, LogFormat};
