use crate::{BinaryNode, Error, RelayConfig, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Connection-level collaborator. `query` is the only place a relay blocks.
pub trait Transport: Send + Sync {
    /// Request/response round trip.
    fn query(&self, node: BinaryNode) -> Result<BinaryNode>;

    /// Fire-and-forget delivery of a finished stanza.
    fn send(&self, node: BinaryNode) -> Result<()>;
}

/// Work handed from [`ChannelTransport`] to the socket owner.
#[derive(Debug)]
pub enum TransportEvent {
    Query {
        node: BinaryNode,
        reply: Sender<Result<BinaryNode>>,
    },
    Send(BinaryNode),
}

/// Bridges the [`Transport`] trait onto a channel drained by the connection
/// task. Queries wait for the reply up to `query_timeout`.
pub struct ChannelTransport {
    event_tx: Sender<TransportEvent>,
    query_timeout: Duration,
    tag_prefix: String,
    counter: AtomicU64,
}

impl ChannelTransport {
    pub fn new(event_tx: Sender<TransportEvent>, query_timeout: Duration) -> Self {
        Self {
            event_tx,
            query_timeout,
            tag_prefix: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            counter: AtomicU64::new(0),
        }
    }

    /// Convenience constructor returning the receiving half as well.
    pub fn unbounded(query_timeout: Duration) -> (Self, Receiver<TransportEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx, query_timeout), rx)
    }

    /// Unbounded bridge whose queries wait `config.query_timeout_ms`.
    pub fn from_config(config: &RelayConfig) -> (Self, Receiver<TransportEvent>) {
        Self::unbounded(config.query_timeout())
    }

    fn next_tag(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}.{}", self.tag_prefix, n)
    }
}

impl Transport for ChannelTransport {
    fn query(&self, mut node: BinaryNode) -> Result<BinaryNode> {
        if node.attr("id").is_none() {
            node.attrs.insert("id".to_string(), self.next_tag());
        }
        let context = format!("<{}> {}", node.tag, node.attr("xmlns").unwrap_or_default());

        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.event_tx
            .send(TransportEvent::Query {
                node,
                reply: reply_tx,
            })
            .map_err(|_| Error::Network("transport closed".to_string()))?;

        match reply_rx.recv_timeout(self.query_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(context)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Network(format!("reply dropped for {context}")))
            }
        }
    }

    fn send(&self, node: BinaryNode) -> Result<()> {
        self.event_tx
            .send(TransportEvent::Send(node))
            .map_err(|_| Error::Network("transport closed".to_string()))
    }
}
