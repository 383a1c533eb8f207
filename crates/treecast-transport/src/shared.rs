//! Queue and lifecycle bookkeeping shared by the transport implementations

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use treecast_core::{Message, TreecastError, TreecastResult, QUEUE_CAPACITY};

use crate::transport::TransportState;

/// Lifecycle guard enforcing Idle -> (Listening | Connected) -> Closed
pub(crate) struct Lifecycle {
    state: RwLock<TransportState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Lifecycle {
            state: RwLock::new(TransportState::Idle),
        }
    }

    pub(crate) fn get(&self) -> TransportState {
        *self.state.read()
    }

    /// Fails unless the transport is still idle
    pub(crate) fn ensure_idle(&self) -> TreecastResult<()> {
        Self::check_idle(*self.state.read())
    }

    /// Move from Idle to `target`. Re-checked under the write lock because the
    /// bind or dial that precedes it runs unlocked.
    pub(crate) fn activate(&self, target: TransportState) -> TreecastResult<()> {
        let mut state = self.state.write();
        Self::check_idle(*state)?;
        *state = target;
        Ok(())
    }

    /// Returns false when the transport was already closed
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.write();
        if *state == TransportState::Closed {
            return false;
        }
        *state = TransportState::Closed;
        true
    }

    fn check_idle(state: TransportState) -> TreecastResult<()> {
        match state {
            TransportState::Idle => Ok(()),
            TransportState::Closed => Err(TreecastError::TransportClosed),
            TransportState::Listening | TransportState::Connected => {
                Err(TreecastError::AlreadyActive)
            }
        }
    }
}

/// The inbound and outbound queues a transport owns for its lifetime
pub(crate) struct Queues {
    inbound_tx: Mutex<Option<mpsc::Sender<Message>>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
}

impl Queues {
    pub(crate) fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        Queues {
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    /// Write end of the inbound queue, for reader loops
    pub(crate) fn inbound_sender(&self) -> TreecastResult<mpsc::Sender<Message>> {
        self.inbound_tx
            .lock()
            .clone()
            .ok_or(TreecastError::TransportClosed)
    }

    pub(crate) fn take_inbound(&self) -> TreecastResult<mpsc::Receiver<Message>> {
        self.inbound_rx
            .lock()
            .take()
            .ok_or(TreecastError::QueueTaken("transport inbound"))
    }

    pub(crate) fn outbound(&self) -> mpsc::Sender<Message> {
        self.outbound_tx.clone()
    }

    /// Read end of the outbound queue, for the draining loop
    pub(crate) fn take_outbound(&self) -> TreecastResult<mpsc::Receiver<Message>> {
        self.outbound_rx
            .lock()
            .take()
            .ok_or(TreecastError::QueueTaken("transport outbound"))
    }

    /// Retire both queues. Called once every spawned loop has finished: the
    /// inbound reader sees end-of-stream after draining, and outbound sends fail.
    pub(crate) fn retire(&self) {
        self.inbound_tx.lock().take();
        self.outbound_rx.lock().take();
    }
}
