//! Message record carried through the tree
//!
//! Content and timestamp are fixed once a message exists. The only field a
//! hop may change is `source`, which every node overwrites with its own name
//! before fanning out.

use std::fmt;

use chrono::{DateTime, Utc};

/// A message flowing from the root of the tree towards its leaves
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Message {
    content: String,
    id: String,
    timestamp: Option<DateTime<Utc>>,
    source: String,
}

impl Message {
    /// Originate a message. The timestamp is taken now and never changes.
    pub fn new(content: impl Into<String>, id: impl Into<String>) -> Self {
        Message {
            content: content.into(),
            id: id.into(),
            timestamp: Some(Utc::now()),
            source: String::new(),
        }
    }

    /// Build a message from a line received off the wire.
    ///
    /// Only content crosses the wire, so id, timestamp and source stay empty.
    pub fn from_wire(content: impl Into<String>) -> Self {
        Message {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Correlation token, empty when none was given
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Origination time; `None` for messages ingested from the wire
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Name of the node that most recently forwarded this message
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Record the forwarding node. Called once per hop, before fan-out.
    pub fn stamp_source(&mut self, node: &str) {
        self.source.clear();
        self.source.push_str(node);
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_empty() {
            write!(f, "{:?}", self.content)
        } else {
            write!(f, "{:?} (id {})", self.content, self.id)
        }
    }
}
