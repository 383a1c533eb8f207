//! Tree node assembly - wires a Node to its Server and child Clients

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use treecast_core::{TreecastError, TreecastResult};
use treecast_runtime::Node;
use treecast_transport::{Client, Server, TcpTransport, TransportFactory};

use crate::bridge::bridge;
use crate::config::{RetryPolicy, TreeNodeConfig};

/// Connection state of one child slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    /// No address configured for the slot
    Unconfigured,
    /// Configured, assembly not started yet
    Pending,
    /// Attempt number `attempt` is running or about to be retried
    Connecting { attempt: u32 },
    /// The dial succeeded. Not cleared if the child later drops the
    /// connection; writes to a dead link are only logged by the transport.
    Connected,
    /// Every attempt failed. The slot is never retried again and messages
    /// broadcast to it are eventually dropped.
    GaveUp { attempts: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AssemblyState {
    Created,
    Running,
    Stopped,
}

/// One process-level tree node: a Node, its Server and one Client per child
pub struct TreeNode {
    config: TreeNodeConfig,
    node: Node,
    server: Server,
    clients: Vec<Option<Arc<Client>>>,
    links: Arc<RwLock<Vec<LinkStatus>>>,
    state: Mutex<AssemblyState>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl TreeNode {
    /// Build the assembly. The configuration is validated before any
    /// transport is created.
    pub fn new(config: TreeNodeConfig, factory: TransportFactory) -> TreecastResult<Self> {
        config.validate()?;

        let arity = config.arity();
        let node = Node::new(config.node_name(), arity);
        let server = Server::new(factory(), config.port.trim());

        let clients: Vec<Option<Arc<Client>>> = (0..arity)
            .map(|slot| {
                config
                    .child_address(slot)
                    .map(|address| Arc::new(Client::new(factory(), address)))
            })
            .collect();
        let links = clients
            .iter()
            .map(|client| match client {
                Some(_) => LinkStatus::Pending,
                None => LinkStatus::Unconfigured,
            })
            .collect();

        Ok(TreeNode {
            config,
            node,
            server,
            clients,
            links: Arc::new(RwLock::new(links)),
            state: Mutex::new(AssemblyState::Created),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    /// Build the assembly over TCP
    pub fn with_tcp(config: TreeNodeConfig) -> TreecastResult<Self> {
        Self::new(config, TcpTransport::factory())
    }

    pub fn name(&self) -> &str {
        self.node.name()
    }

    pub fn config(&self) -> &TreeNodeConfig {
        &self.config
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Client of child slot `index`, if the slot is configured
    pub fn client(&self, index: usize) -> Option<&Client> {
        self.clients.get(index)?.as_deref()
    }

    pub fn left_client(&self) -> Option<&Client> {
        self.client(0)
    }

    pub fn right_client(&self) -> Option<&Client> {
        self.client(1)
    }

    pub fn link_status(&self, index: usize) -> Option<LinkStatus> {
        self.links.read().get(index).copied()
    }

    pub fn link_statuses(&self) -> Vec<LinkStatus> {
        self.links.read().clone()
    }

    /// Address the server is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Start the node, the server, the bridges and the child connections.
    ///
    /// A bind failure is returned here; everything already started is
    /// stopped again before returning.
    pub async fn start(&self) -> TreecastResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                AssemblyState::Running => return Err(TreecastError::AlreadyStarted),
                AssemblyState::Stopped => return Err(TreecastError::Cancelled),
                AssemblyState::Created => *state = AssemblyState::Running,
            }
        }

        if let Err(e) = self.launch().await {
            tracing::error!(node = %self.name(), "failed to start: {}", e);
            self.stop().await;
            return Err(e);
        }

        tracing::info!(
            node = %self.name(),
            port = %self.config.port,
            children = self.config.configured_children(),
            "tree node started"
        );
        Ok(())
    }

    async fn launch(&self) -> TreecastResult<()> {
        self.node.start()?;
        self.server.start().await?;

        let inbound = self.server.take_inbound()?;
        self.tasks.spawn(bridge(
            format!("{} inbound", self.name()),
            inbound,
            self.node.inbound(),
            self.cancel.clone(),
        ));

        for (slot, client) in self.clients.iter().enumerate() {
            let Some(client) = client else { continue };

            let child_queue = self.node.take_child_receiver(slot)?;
            self.tasks.spawn(connect_with_retry(
                self.name().to_string(),
                slot,
                Arc::clone(client),
                self.config.retry.clone(),
                Arc::clone(&self.links),
                self.cancel.clone(),
            ));
            self.tasks.spawn(bridge(
                format!("{} child-{}", self.name(), slot),
                child_queue,
                client.outbound(),
                self.cancel.clone(),
            ));
        }

        Ok(())
    }

    /// Shut everything down: cancel the assembly tasks, stop the node, close
    /// every client and the server, then wait for the tasks to finish.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == AssemblyState::Stopped {
                return;
            }
            *state = AssemblyState::Stopped;
        }

        tracing::info!(node = %self.name(), "shutting down tree node");
        self.cancel.cancel();
        self.node.stop().await;

        for (slot, client) in self.clients.iter().enumerate() {
            if let Some(client) = client {
                if let Err(e) = client.close().await {
                    tracing::warn!(node = %self.name(), slot, "failed to close client: {}", e);
                }
            }
        }
        if let Err(e) = self.server.close().await {
            tracing::warn!(node = %self.name(), "failed to close server: {}", e);
        }

        self.tasks.close();
        self.tasks.wait().await;
        tracing::debug!(node = %self.name(), "tree node stopped");
    }
}

impl Drop for TreeNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Dial one child, at most `retry.max_attempts` times. After the last failure
/// the slot is left unconnected for the lifetime of the assembly.
async fn connect_with_retry(
    node: String,
    slot: usize,
    client: Arc<Client>,
    retry: RetryPolicy,
    links: Arc<RwLock<Vec<LinkStatus>>>,
    cancel: CancellationToken,
) {
    let set_link = |status: LinkStatus| {
        if let Some(link) = links.write().get_mut(slot) {
            *link = status;
        }
    };

    for attempt in 1..=retry.max_attempts {
        if cancel.is_cancelled() {
            return;
        }
        set_link(LinkStatus::Connecting { attempt });

        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = client.connect() => result,
        };

        match result {
            Ok(()) => {
                set_link(LinkStatus::Connected);
                tracing::info!(node = %node, slot, "connected to child-{} at {}", slot, client.address());
                return;
            }
            Err(e) => {
                tracing::warn!(
                    node = %node,
                    slot,
                    attempt,
                    "failed to connect to child-{}: {}",
                    slot,
                    e
                );
            }
        }

        if attempt < retry.max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(retry.interval()) => {}
            }
        }
    }

    set_link(LinkStatus::GaveUp {
        attempts: retry.max_attempts,
    });
    tracing::error!(
        node = %node,
        slot,
        "failed to connect to child-{} at {} after {} attempts, giving up",
        slot,
        client.address(),
        retry.max_attempts
    );
}
