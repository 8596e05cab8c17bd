//! Cross-context channel.
//!
//! Each direction is one unbounded mpsc channel carrying whole batches, so
//! batches arrive in the order they were posted and the messages within a
//! batch keep their enqueue order.

use tokio::sync::mpsc;

use crate::message::{Message, Reply};

/// Batch of foreground → background messages.
pub type MessageBatch = Vec<Message>;
/// Batch of background → foreground replies.
pub type ReplyBatch = Vec<Reply>;

/// Foreground end: posts messages, receives replies.
#[derive(Debug)]
pub struct ClientEndpoint {
    pub outbound: mpsc::UnboundedSender<MessageBatch>,
    pub inbound: mpsc::UnboundedReceiver<ReplyBatch>,
}

/// Background end: receives messages, posts replies.
#[derive(Debug)]
pub struct ServerEndpoint {
    pub inbound: mpsc::UnboundedReceiver<MessageBatch>,
    pub outbound: mpsc::UnboundedSender<ReplyBatch>,
}

/// Create a connected pair of endpoints.
pub fn channel() -> (ClientEndpoint, ServerEndpoint) {
    let (message_tx, message_rx) = mpsc::unbounded_channel();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    (
        ClientEndpoint {
            outbound: message_tx,
            inbound: reply_rx,
        },
        ServerEndpoint {
            inbound: message_rx,
            outbound: reply_tx,
        },
    )
}
