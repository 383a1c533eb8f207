//! Tree node configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use treecast_core::{
    TreecastError, TreecastResult, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_INTERVAL,
};

/// Bounded retry used when connecting to a child
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total connection attempts before giving up for good
    pub max_attempts: u32,
    /// Wait after a failed attempt, in milliseconds
    pub interval_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_INTERVAL)
    }
}

/// Configuration of one tree node process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNodeConfig {
    /// Address (or bare port) the server listens on
    pub port: String,
    /// Child addresses by slot. `None` or an empty string leaves the slot unconfigured.
    #[serde(default)]
    pub children: Vec<Option<String>>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl TreeNodeConfig {
    /// A node with no child slots
    pub fn new(port: impl Into<String>) -> Self {
        Self::with_children(port, Vec::new())
    }

    /// A binary node: slot 0 is left, slot 1 is right
    pub fn binary(port: impl Into<String>, left: Option<String>, right: Option<String>) -> Self {
        Self::with_children(port, vec![left, right])
    }

    pub fn with_children(port: impl Into<String>, children: Vec<Option<String>>) -> Self {
        TreeNodeConfig {
            port: port.into(),
            children,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn from_json_str(json: &str) -> TreecastResult<Self> {
        serde_json::from_str(json).map_err(|e| TreecastError::Config(e.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> TreecastResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| TreecastError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&json)
    }

    /// Number of child slots, configured or not
    pub fn arity(&self) -> usize {
        self.children.len()
    }

    /// Address of child slot `index`, if that slot is configured
    pub fn child_address(&self, index: usize) -> Option<&str> {
        self.children
            .get(index)?
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
    }

    pub fn left(&self) -> Option<&str> {
        self.child_address(0)
    }

    pub fn right(&self) -> Option<&str> {
        self.child_address(1)
    }

    /// Number of slots with an address
    pub fn configured_children(&self) -> usize {
        (0..self.arity())
            .filter(|&i| self.child_address(i).is_some())
            .count()
    }

    /// Name the node stamps on forwarded messages
    pub fn node_name(&self) -> String {
        format!("node-{}", self.port.trim())
    }

    pub fn validate(&self) -> TreecastResult<()> {
        if self.port.trim().is_empty() {
            return Err(TreecastError::Config("port is required".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(TreecastError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
