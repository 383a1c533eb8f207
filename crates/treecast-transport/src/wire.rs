//! Line wire format and address forms
//!
//! One line of UTF-8 text is one message. Only the content crosses the wire.

use treecast_core::Message;

/// Longest line accepted from a peer, delimiter excluded
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Serialize a message as a newline-terminated line.
///
/// Content is not escaped: an interior `\n` is written as-is, so the next hop
/// reads it as separate messages, one per line.
pub fn encode_line(msg: &Message) -> String {
    let body = msg.content().strip_suffix('\n').unwrap_or(msg.content());
    if body.contains('\n') {
        tracing::debug!(
            "wire: message {} has interior newlines and will arrive as {} lines",
            msg,
            body.split('\n').count()
        );
    }

    let mut line = String::with_capacity(msg.content().len() + 1);
    line.push_str(msg.content());
    if !line.ends_with('\n') {
        line.push('\n');
    }
    line
}

/// Turn one received line into a message. Blank lines carry nothing.
pub fn decode_line(line: &str) -> Option<Message> {
    let content = line.strip_suffix('\n').unwrap_or(line);
    let content = content.strip_suffix('\r').unwrap_or(content);
    if content.is_empty() {
        return None;
    }
    Some(Message::from_wire(content))
}

/// Address to bind for a listen request. A bare port (`"3030"` or `":3030"`)
/// listens on all interfaces.
pub fn listen_address(address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None if !address.contains(':') => format!("0.0.0.0:{address}"),
        None => address.to_string(),
    }
}

/// Address to dial for a connect request. A bare port targets localhost.
pub fn dial_address(address: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("localhost:{port}"),
        None if !address.contains(':') => format!("localhost:{address}"),
        None => address.to_string(),
    }
}
