//! treecast-node - one node of a broadcast tree
//!
//! ```bash
//! # Leaf
//! treecast-node --port 3031
//!
//! # Root with two children
//! treecast-node --port 3030 --left 3031 --right 3032
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use treecast_cli::{init_tracing, NodeArgs};
use treecast_tree::TreeNode;

#[tokio::main]
async fn main() -> Result<()> {
    let args = NodeArgs::parse();
    init_tracing(args.log_format)?;

    let config = args.into_config().context("invalid node configuration")?;
    info!(
        port = %config.port,
        left = config.left().unwrap_or("-"),
        right = config.right().unwrap_or("-"),
        arity = config.arity(),
        "starting treecast node"
    );

    let node = TreeNode::with_tcp(config)?;
    node.start()
        .await
        .with_context(|| format!("failed to start {}", node.name()))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("received ctrl-c, shutting down");

    node.stop().await;
    Ok(())
}
