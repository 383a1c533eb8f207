//! treecast Node - broadcast engine implementation

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use treecast_core::{Message, TreecastError, TreecastResult, QUEUE_CAPACITY};

/// Node lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Running,
    Stopped,
}

/// Outcome of one fan-out, by child slot index
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Slots that accepted the message
    pub delivered: Vec<usize>,
    /// Slots whose queue was full or had no reader left
    pub dropped: Vec<usize>,
}

impl BroadcastReport {
    pub fn reached(&self) -> usize {
        self.delivered.len()
    }

    pub fn slots(&self) -> usize {
        self.delivered.len() + self.dropped.len()
    }
}

/// treecast Node - the broadcast engine
pub struct Node {
    inner: Arc<NodeInner>,
    /// Read end of the inbound queue, moved into the processing task on start
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    state: Mutex<NodeState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct NodeInner {
    name: String,
    inbound_tx: mpsc::Sender<Message>,
    /// Write ends of the child slots. Arity never changes after construction.
    children: RwLock<Vec<mpsc::Sender<Message>>>,
    /// Read ends of the child slots, each handed out once
    child_receivers: Mutex<Vec<Option<mpsc::Receiver<Message>>>>,
    cancel: CancellationToken,
}

impl Node {
    /// Create a node with `arity` child slots
    pub fn new(name: impl Into<String>, arity: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        let mut senders = Vec::with_capacity(arity);
        let mut receivers = Vec::with_capacity(arity);
        for _ in 0..arity {
            let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
            senders.push(tx);
            receivers.push(Some(rx));
        }

        Node {
            inner: Arc::new(NodeInner {
                name: name.into(),
                inbound_tx,
                children: RwLock::new(senders),
                child_receivers: Mutex::new(receivers),
                cancel: CancellationToken::new(),
            }),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            state: Mutex::new(NodeState::Created),
            task: Mutex::new(None),
        }
    }

    /// Create a node with two child slots (0 = left, 1 = right)
    pub fn binary(name: impl Into<String>) -> Self {
        Self::new(name, 2)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of child slots
    pub fn arity(&self) -> usize {
        self.inner.children.read().len()
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    /// Spawn the processing task. Must be called from within a tokio runtime.
    pub fn start(&self) -> TreecastResult<()> {
        let mut state = self.state.lock();
        match *state {
            NodeState::Running => return Err(TreecastError::AlreadyStarted),
            NodeState::Stopped => return Err(TreecastError::Cancelled),
            NodeState::Created => {}
        }

        let inbound = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(TreecastError::QueueTaken("node inbound"))?;

        let inner = Arc::clone(&self.inner);
        *self.task.lock() = Some(tokio::spawn(inner.run(inbound)));
        *state = NodeState::Running;

        tracing::debug!(node = %self.inner.name, arity = self.arity(), "node started");
        Ok(())
    }

    /// Cancel the processing task and wait for it to exit.
    ///
    /// A message being handled when cancellation lands is discarded. Child
    /// queues stay open; whoever took their read ends decides when to drop them.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        *self.state.lock() = NodeState::Stopped;

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(node = %self.inner.name, "processing task ended abnormally: {}", e);
            }
        }
    }

    /// Stamp the message with this node's name and offer it to every child.
    pub fn handle_message(&self, msg: Message) -> TreecastResult<BroadcastReport> {
        self.inner.handle_message(msg)
    }

    /// Enqueue onto one child slot, waiting for room.
    pub async fn send_to_child(&self, index: usize, msg: Message) -> TreecastResult<()> {
        let sender = self.inner.child_sender(index)?;

        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(TreecastError::Cancelled),
            // The reader of a slot only goes away while the owner shuts down.
            sent = sender.send(msg) => sent.map_err(|_| TreecastError::Cancelled),
        }
    }

    pub async fn send_to_left(&self, msg: Message) -> TreecastResult<()> {
        self.send_to_child(0, msg).await
    }

    pub async fn send_to_right(&self, msg: Message) -> TreecastResult<()> {
        self.send_to_child(1, msg).await
    }

    /// Write end of the inbound queue
    pub fn inbound(&self) -> mpsc::Sender<Message> {
        self.inner.inbound_tx.clone()
    }

    /// Read end of child slot `index`. Each slot's read end can be taken once.
    pub fn take_child_receiver(&self, index: usize) -> TreecastResult<mpsc::Receiver<Message>> {
        let mut receivers = self.inner.child_receivers.lock();
        let arity = receivers.len();
        receivers
            .get_mut(index)
            .ok_or(TreecastError::IndexOutOfRange { index, arity })?
            .take()
            .ok_or(TreecastError::QueueTaken("node child slot"))
    }

    /// Token cancelled when the node stops
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl NodeInner {
    fn child_sender(&self, index: usize) -> TreecastResult<mpsc::Sender<Message>> {
        let children = self.children.read();
        children
            .get(index)
            .cloned()
            .ok_or(TreecastError::IndexOutOfRange {
                index,
                arity: children.len(),
            })
    }

    fn handle_message(&self, mut msg: Message) -> TreecastResult<BroadcastReport> {
        if self.cancel.is_cancelled() {
            return Err(TreecastError::Cancelled);
        }

        tracing::debug!(node = %self.name, message = %msg, "received message");
        msg.stamp_source(&self.name);
        self.broadcast(msg)
    }

    fn broadcast(&self, msg: Message) -> TreecastResult<BroadcastReport> {
        let children = self.children.read();
        let mut report = BroadcastReport::default();

        if children.is_empty() {
            tracing::trace!(node = %self.name, "leaf node, nothing to broadcast");
            return Ok(report);
        }

        for (slot, child) in children.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(TreecastError::Cancelled);
            }

            match child.try_send(msg.clone()) {
                Ok(()) => report.delivered.push(slot),
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(node = %self.name, slot, "child queue full, dropping");
                    report.dropped.push(slot);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(node = %self.name, slot, "child queue has no reader, dropping");
                    report.dropped.push(slot);
                }
            }
        }

        tracing::debug!(
            node = %self.name,
            reached = report.reached(),
            slots = children.len(),
            "broadcast complete"
        );
        Ok(report)
    }

    async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<Message>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                next = inbound.recv() => {
                    let Some(msg) = next else { break };
                    match self.handle_message(msg) {
                        Ok(_) => {}
                        Err(e) if e.is_cancelled() => break,
                        Err(e) => tracing::warn!(node = %self.name, "error handling message: {}", e),
                    }
                }
            }
        }

        tracing::info!(node = %self.name, "node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use proptest::prelude::*;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn take_all(node: &Node) -> Vec<mpsc::Receiver<Message>> {
        (0..node.arity())
            .map(|i| node.take_child_receiver(i).unwrap())
            .collect()
    }

    #[test]
    fn test_binary_node_has_two_slots() {
        let node = Node::binary("root");
        assert_eq!(node.name(), "root");
        assert_eq!(node.arity(), 2);
        assert_eq!(node.state(), NodeState::Created);
    }

    #[test]
    fn test_child_receiver_taken_once() {
        let node = Node::new("n", 1);
        assert!(node.take_child_receiver(0).is_ok());
        assert_eq!(
            node.take_child_receiver(0).unwrap_err(),
            TreecastError::QueueTaken("node child slot")
        );
        assert_eq!(
            node.take_child_receiver(1).unwrap_err(),
            TreecastError::IndexOutOfRange { index: 1, arity: 1 }
        );
    }

    #[test]
    fn test_leaf_node_broadcast_is_noop() {
        let node = Node::new("leaf", 0);
        let report = node.handle_message(Message::new("to nobody", "leaf-1")).unwrap();
        assert_eq!(report, BroadcastReport::default());
    }

    #[test]
    fn test_ternary_broadcast() {
        let node = Node::new("ternary", 3);
        let mut readers = take_all(&node);
        let msg = Message::new("ternary broadcast", "t-1");

        let report = node.handle_message(msg.clone()).unwrap();
        assert_eq!(report.delivered, vec![0, 1, 2]);
        assert!(report.dropped.is_empty());

        for reader in readers.iter_mut() {
            let got = reader.try_recv().unwrap();
            assert_eq!(got.content(), "ternary broadcast");
            assert_eq!(got.id(), "t-1");
            assert_eq!(got.timestamp(), msg.timestamp());
            assert_eq!(got.source(), "ternary");
        }
    }

    #[test]
    fn test_full_slot_drops_independently() {
        let node = Node::binary("parent");
        let mut readers = take_all(&node);

        // Fill the left slot and keep the right one drained
        for i in 0..QUEUE_CAPACITY {
            let report = node.handle_message(Message::new(format!("fill-{i}"), "")).unwrap();
            assert_eq!(report.delivered, vec![0, 1]);
            readers[1].try_recv().unwrap();
        }

        let report = node.handle_message(Message::new("overflow", "o-1")).unwrap();
        assert_eq!(report.delivered, vec![1]);
        assert_eq!(report.dropped, vec![0]);
        assert_eq!(readers[1].try_recv().unwrap().content(), "overflow");
    }

    #[test]
    fn test_dropped_reader_counts_as_dropped() {
        let node = Node::binary("parent");
        drop(node.take_child_receiver(0).unwrap());
        let _right = node.take_child_receiver(1).unwrap();

        let report = node.handle_message(Message::new("x", "")).unwrap();
        assert_eq!(report.delivered, vec![1]);
        assert_eq!(report.dropped, vec![0]);
    }

    #[tokio::test]
    async fn test_send_to_child_out_of_range() {
        for arity in 0..5 {
            let node = Node::new("n", arity);
            for index in [arity, arity + 1, usize::MAX] {
                let err = node
                    .send_to_child(index, Message::new("x", ""))
                    .await
                    .unwrap_err();
                assert_eq!(err, TreecastError::IndexOutOfRange { index, arity });
            }
        }
    }

    #[tokio::test]
    async fn test_send_to_left_and_right() {
        let node = Node::binary("parent");
        let mut readers = take_all(&node);

        node.send_to_left(Message::new("left", "")).await.unwrap();
        node.send_to_right(Message::new("right", "")).await.unwrap();

        let left = readers[0].try_recv().unwrap();
        assert_eq!(left.content(), "left");
        // Directed sends do not stamp the source
        assert!(left.source().is_empty());
        assert_eq!(readers[1].try_recv().unwrap().content(), "right");
    }

    #[tokio::test]
    async fn test_send_to_child_blocks_until_cancelled() {
        let node = Arc::new(Node::new("n", 1));
        let _reader = node.take_child_receiver(0).unwrap();

        for _ in 0..QUEUE_CAPACITY {
            node.send_to_child(0, Message::new("fill", "")).await.unwrap();
        }

        let blocked = timeout(
            Duration::from_millis(50),
            node.send_to_child(0, Message::new("one too many", "")),
        )
        .await;
        assert!(blocked.is_err(), "send into a full slot should wait");

        let sender = Arc::clone(&node);
        let pending =
            tokio::spawn(async move { sender.send_to_child(0, Message::new("pending", "")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        node.stop().await;

        let result = timeout(WAIT, pending).await.unwrap().unwrap();
        assert_eq!(result.unwrap_err(), TreecastError::Cancelled);
    }

    #[tokio::test]
    async fn test_processing_task_broadcasts_inbound() {
        let node = Node::binary("root");
        let mut readers = take_all(&node);
        node.start().unwrap();
        assert_eq!(node.state(), NodeState::Running);

        node.inbound().send(Message::new("Hello, tree!", "test-1")).await.unwrap();

        for reader in readers.iter_mut() {
            let got = timeout(WAIT, reader.recv()).await.unwrap().unwrap();
            assert_eq!(got.content(), "Hello, tree!");
            assert_eq!(got.source(), "root");
        }

        node.stop().await;
    }

    #[tokio::test]
    async fn test_inbound_processed_in_order() {
        let node = Node::new("ordered", 1);
        let mut reader = node.take_child_receiver(0).unwrap();
        node.start().unwrap();

        let inbound = node.inbound();
        for i in 0..20 {
            inbound.send(Message::new(format!("msg-{i}"), "")).await.unwrap();
        }
        for i in 0..20 {
            let got = timeout(WAIT, reader.recv()).await.unwrap().unwrap();
            assert_eq!(got.content(), format!("msg-{i}"));
        }

        node.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let node = Node::new("n", 0);
        node.start().unwrap();
        assert_eq!(node.start().unwrap_err(), TreecastError::AlreadyStarted);
        node.stop().await;
        assert_eq!(node.start().unwrap_err(), TreecastError::Cancelled);
    }

    #[tokio::test]
    async fn test_stop_without_traffic() {
        let never_started = Node::binary("idle");
        never_started.stop().await;
        never_started.stop().await;
        assert_eq!(never_started.state(), NodeState::Stopped);

        let started = Node::binary("quiet");
        started.start().unwrap();
        started.stop().await;
        started.stop().await;
        assert_eq!(started.state(), NodeState::Stopped);
    }

    #[tokio::test]
    async fn test_no_processing_after_stop() {
        let node = Node::new("stopped", 1);
        let mut reader = node.take_child_receiver(0).unwrap();
        node.start().unwrap();
        node.stop().await;

        // The processing task is gone, so the inbound queue has no consumer
        let _ = node.inbound().try_send(Message::new("late", ""));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reader.try_recv().unwrap_err(), TryRecvError::Empty);

        assert_eq!(
            node.handle_message(Message::new("late", "")).unwrap_err(),
            TreecastError::Cancelled
        );
    }

    proptest! {
        #[test]
        fn broadcast_without_readers_never_blocks(arity in 0usize..8, extra in 0usize..30) {
            let node = Node::new("busy", arity);
            let mut readers = take_all(&node);
            prop_assert_eq!(readers.len(), arity);

            for i in 0..QUEUE_CAPACITY + extra {
                let report = node.handle_message(Message::new(format!("m{i}"), "")).unwrap();
                prop_assert_eq!(report.slots(), arity);
                if i >= QUEUE_CAPACITY {
                    prop_assert_eq!(report.dropped.len(), arity);
                }
            }

            for reader in readers.iter_mut() {
                let mut queued = 0;
                while reader.try_recv().is_ok() {
                    queued += 1;
                }
                prop_assert_eq!(queued, QUEUE_CAPACITY);
            }
        }

        #[test]
        fn hop_keeps_content_and_stamps_source(content in ".*", id in "[a-z0-9-]{0,12}", name in "[a-zA-Z-]{1,16}") {
            let node = Node::new(name.clone(), 1);
            let mut reader = node.take_child_receiver(0).unwrap();

            node.handle_message(Message::new(content.clone(), id.clone())).unwrap();
            let got = reader.try_recv().unwrap();

            prop_assert_eq!(got.content(), content.as_str());
            prop_assert_eq!(got.id(), id.as_str());
            prop_assert_eq!(got.source(), name.as_str());
        }
    }
}
