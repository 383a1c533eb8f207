//! Queue-to-queue forwarding loops

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use treecast_core::Message;

/// Forward messages from one queue to another until cancelled or either side
/// goes away.
pub async fn bridge(
    route: String,
    from: mpsc::Receiver<Message>,
    to: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    bridge_with_tap(route, from, to, cancel, |_| {}).await
}

/// Like [`bridge`], calling `tap` on each message before it is handed on
pub async fn bridge_with_tap<F>(
    route: String,
    mut from: mpsc::Receiver<Message>,
    to: mpsc::Sender<Message>,
    cancel: CancellationToken,
    mut tap: F,
) where
    F: FnMut(&Message) + Send,
{
    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = from.recv() => match next {
                Some(msg) => msg,
                None => {
                    tracing::debug!("{}: source queue closed", route);
                    break;
                }
            },
        };
        tap(&msg);

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = to.send(msg) => {
                if sent.is_err() {
                    tracing::debug!("{}: destination queue closed", route);
                    break;
                }
            }
        }
    }
}
