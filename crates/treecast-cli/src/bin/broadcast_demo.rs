//! In-process broadcast through a five-node tree
//!
//! ```text
//!        ROOT
//!       /    \
//!    LEFT    RIGHT
//!    /          \
//! LEFT-GC    RIGHT-GC
//! ```

use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use treecast_cli::{init_tracing, LogFormat};
use treecast_core::Message;
use treecast_runtime::Node;
use treecast_tree::bridge::bridge_with_tap;

/// Pace between messages so the output of each one stays together
const STEP: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(LogFormat::Pretty)?;
    println!("=== treecast broadcast demo ===\n");

    let root = Node::binary("ROOT");
    let left = Node::binary("LEFT-CHILD");
    let right = Node::binary("RIGHT-CHILD");
    let left_gc = Node::binary("LEFT-GRANDCHILD");
    let right_gc = Node::binary("RIGHT-GRANDCHILD");

    let nodes = [&root, &left, &right, &left_gc, &right_gc];
    for node in nodes {
        node.start()?;
    }

    let cancel = CancellationToken::new();
    let tasks = TaskTracker::new();
    let edges = [
        ("ROOT -> LEFT-CHILD", &root, 0, &left),
        ("ROOT -> RIGHT-CHILD", &root, 1, &right),
        ("LEFT-CHILD -> LEFT-GRANDCHILD", &left, 0, &left_gc),
        ("RIGHT-CHILD -> RIGHT-GRANDCHILD", &right, 1, &right_gc),
    ];
    for (label, parent, slot, child) in edges {
        tasks.spawn(bridge_with_tap(
            label.to_string(),
            parent.take_child_receiver(slot)?,
            child.inbound(),
            cancel.clone(),
            move |msg: &Message| println!("  {label}: {msg} from {}", msg.source()),
        ));
    }

    println!("       ROOT");
    println!("      /    \\");
    println!("   LEFT    RIGHT");
    println!("   /          \\");
    println!("LEFT-GC    RIGHT-GC\n");

    let messages = [
        Message::new("Hello, everyone!", "msg-1"),
        Message::new("Broadcasting works!", "msg-2"),
        Message::new("Tree-wide message!", "msg-3"),
    ];
    for (i, msg) in messages.into_iter().enumerate() {
        println!("Sending message {}: {}", i + 1, msg);
        let report = root.handle_message(msg)?;
        println!("  ROOT reached {}/{} children", report.reached(), report.slots());
        tokio::time::sleep(STEP).await;
        println!();
    }

    cancel.cancel();
    tasks.close();
    tasks.wait().await;
    for node in nodes {
        node.stop().await;
    }

    println!("Each hop above names the node that forwarded the message.");
    Ok(())
}
