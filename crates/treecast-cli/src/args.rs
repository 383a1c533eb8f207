//! Flags of the `treecast-node` binary

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use treecast_tree::{RetryPolicy, TreeNodeConfig};

use crate::logging::LogFormat;

/// Run one node of a treecast broadcast tree
#[derive(Parser, Debug)]
#[command(name = "treecast-node")]
#[command(about = "Receive lines on a port and re-broadcast them to child nodes")]
#[command(version)]
pub struct NodeArgs {
    /// Address or bare port to listen on
    #[arg(long)]
    pub port: Option<String>,

    /// Left child address (slot 0)
    #[arg(long)]
    pub left: Option<String>,

    /// Right child address (slot 1)
    #[arg(long)]
    pub right: Option<String>,

    /// Additional child address, repeatable
    #[arg(long = "child")]
    pub children: Vec<String>,

    /// JSON configuration file; flags given on the command line take precedence
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Connection attempts per child before giving up
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// Delay between connection attempts, in milliseconds
    #[arg(long)]
    pub retry_interval_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

impl NodeArgs {
    /// Merge the config file (if any) with the flags into a validated config
    pub fn into_config(self) -> anyhow::Result<TreeNodeConfig> {
        let mut config = match &self.config {
            Some(path) => TreeNodeConfig::from_json_file(path)?,
            None => TreeNodeConfig::new(""),
        };

        if let Some(port) = self.port {
            config.port = port;
        }

        if self.left.is_some() || self.right.is_some() {
            let mut children = vec![self.left, self.right];
            children.extend(self.children.into_iter().map(Some));
            config.children = children;
        } else if !self.children.is_empty() {
            config.children = self.children.into_iter().map(Some).collect();
        }

        if self.retry_attempts.is_some() || self.retry_interval_ms.is_some() {
            let attempts = self.retry_attempts.unwrap_or(config.retry.max_attempts);
            let interval = self
                .retry_interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.retry.interval());
            config.retry = RetryPolicy::new(attempts, interval);
        }

        config.validate()?;
        Ok(config)
    }
}
