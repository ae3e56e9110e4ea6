//! Query/response correlation
//!
//! One [`QueryPacketManager`] per connection. Sending a query assigns a fresh
//! correlation id, parks a oneshot sender under that id and returns a future
//! that resolves when the matching response arrives. A query that outlives
//! its timeout resolves to [`Packet::empty`]; closing the connection cancels
//! every pending query with [`ProtocolError::QueryCancelled`].

use std::{future::Future, sync::Arc, time::Duration};

use dashmap::DashMap;
use metrics::gauge;
use tokio::{sync::oneshot, time::Instant};
use tracing::debug;
use uuid::Uuid;

use crate::{
    channel::PacketWriter,
    error::{ProtocolError, ProtocolResult},
    packet::Packet,
};

/// Default time a query waits for its response.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pending handlers keyed by correlation id. The waiting-handler gauge is
/// adjusted on every insert and every successful removal.
#[derive(Debug, Default)]
struct PendingQueries {
    handlers: DashMap<Uuid, oneshot::Sender<Packet>>,
}

impl PendingQueries {
    fn insert(&self, id: Uuid, sender: oneshot::Sender<Packet>) {
        self.handlers.insert(id, sender);
        gauge!("cloudnet_query_waiting_handlers").increment(1.0);
    }

    fn take(&self, id: &Uuid) -> Option<oneshot::Sender<Packet>> {
        let (_, sender) = self.handlers.remove(id)?;
        gauge!("cloudnet_query_waiting_handlers").decrement(1.0);
        Some(sender)
    }

    fn clear(&self) -> usize {
        let mut cancelled = 0;
        self.handlers.retain(|_, _| {
            cancelled += 1;
            false
        });
        if cancelled > 0 {
            gauge!("cloudnet_query_waiting_handlers").decrement(cancelled as f64);
        }
        cancelled
    }
}

/// Removes the pending handler when the query future finishes or is dropped.
struct PendingGuard {
    pending: Arc<PendingQueries>,
    id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.take(&self.id);
    }
}

#[derive(Debug)]
pub struct QueryPacketManager {
    pending: Arc<PendingQueries>,
    timeout: Duration,
    writer: PacketWriter,
}

impl QueryPacketManager {
    pub(crate) fn new(writer: PacketWriter, timeout: Duration) -> Self {
        Self {
            pending: Arc::new(PendingQueries::default()),
            timeout,
            writer,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `packet` as a query and wait for the response.
    ///
    /// The packet is handed to the connection before this returns, so the
    /// returned future may be awaited later or dropped. The timeout counts
    /// from this call, not from the first poll. Any correlation id the caller
    /// set is replaced.
    ///
    /// Resolves to:
    /// - the response packet when it arrives in time
    /// - [`Packet::empty`] when the timeout elapses
    /// - [`ProtocolError::QueryCancelled`] when the connection closes first
    pub fn send_query_packet(
        &self,
        mut packet: Packet,
    ) -> impl Future<Output = ProtocolResult<Packet>> + Send + 'static {
        let id = Uuid::new_v4();
        packet.set_unique_id(id);

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let guard = PendingGuard {
            pending: self.pending.clone(),
            id,
        };
        let sent = self.writer.write(packet, None);
        let timeout = self.timeout;
        let deadline = Instant::now() + timeout;

        async move {
            let _guard = guard;
            sent?;
            match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(_)) => Err(ProtocolError::QueryCancelled(id)),
                Err(_) => {
                    debug!(query_id = %id, ?timeout, "Query timed out without response");
                    Ok(Packet::empty())
                }
            }
        }
    }

    /// Complete the pending query matching the response's correlation id.
    ///
    /// Returns false if no handler waits for it (unknown id, or it already
    /// timed out).
    pub fn handle_query_response(&self, response: Packet) -> bool {
        let Some(id) = response.unique_id() else {
            return false;
        };
        match self.pending.take(&id) {
            Some(sender) => sender.send(response).is_ok(),
            None => false,
        }
    }

    /// Approximate number of queries still waiting for a response.
    pub fn waiting_handler_count(&self) -> usize {
        self.pending.handlers.len()
    }

    /// Fail every pending query. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.pending.clear()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{channel::OutboundQueue, packet::QUERY_RESPONSE_CHANNEL};

    fn manager(timeout: Duration) -> (QueryPacketManager, OutboundQueue) {
        let (writer, queue) = PacketWriter::unbound(1);
        (QueryPacketManager::new(writer, timeout), queue)
    }

    #[tokio::test]
    async fn test_response_resolves_pending_query() {
        let (manager, mut queue) = manager(DEFAULT_QUERY_TIMEOUT);
        let mut packet = Packet::new(1, Bytes::from_static(b"ping"));
        packet.set_unique_id(Uuid::nil());

        let query = manager.send_query_packet(packet);
        assert_eq!(manager.waiting_handler_count(), 1);

        let sent = queue.try_next_packet().unwrap();
        let id = sent.unique_id().unwrap();
        assert_ne!(id, Uuid::nil());

        let response = sent.response(Bytes::from_static(b"pong")).unwrap();
        assert!(manager.handle_query_response(response));

        let answer = query.await.unwrap();
        assert_eq!(answer.channel(), QUERY_RESPONSE_CHANNEL);
        assert_eq!(answer.content().unwrap().as_ref(), b"pong");
        assert_eq!(manager.waiting_handler_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resolves_to_empty_packet() {
        let (manager, mut queue) = manager(Duration::from_secs(5));
        let query = manager.send_query_packet(Packet::new(1, Bytes::new()));
        let sent = queue.try_next_packet().unwrap();

        let answer = query.await.unwrap();
        assert!(answer.is_empty());
        assert!(matches!(
            answer.content(),
            Err(ProtocolError::EmptyPacketAccess)
        ));
        assert_eq!(manager.waiting_handler_count(), 0);

        // a late response finds nobody waiting
        let late = sent.response(Bytes::new()).unwrap();
        assert!(!manager.handle_query_response(late));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_from_send_not_first_poll() {
        let (manager, _queue) = manager(Duration::from_secs(5));
        let query = manager.send_query_packet(Packet::new(1, Bytes::new()));
        tokio::time::advance(Duration::from_secs(6)).await;

        let polled_at = Instant::now();
        let answer = query.await.unwrap();
        assert!(answer.is_empty());
        assert_eq!(polled_at.elapsed(), Duration::ZERO);
        assert_eq!(manager.waiting_handler_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_fails_pending_queries() {
        let (manager, _queue) = manager(DEFAULT_QUERY_TIMEOUT);
        let first = manager.send_query_packet(Packet::new(1, Bytes::new()));
        let second = manager.send_query_packet(Packet::new(1, Bytes::new()));

        assert_eq!(manager.cancel_all(), 2);
        assert!(matches!(
            first.await,
            Err(ProtocolError::QueryCancelled(_))
        ));
        assert!(matches!(
            second.await,
            Err(ProtocolError::QueryCancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_query_releases_handler() {
        let (manager, _queue) = manager(DEFAULT_QUERY_TIMEOUT);
        let query = manager.send_query_packet(Packet::new(1, Bytes::new()));
        assert_eq!(manager.waiting_handler_count(), 1);
        drop(query);
        assert_eq!(manager.waiting_handler_count(), 0);
    }

    #[test]
    fn test_response_without_id_is_ignored() {
        let (manager, _queue) = manager(DEFAULT_QUERY_TIMEOUT);
        assert!(!manager.handle_query_response(Packet::new(QUERY_RESPONSE_CHANNEL, Bytes::new())));
    }
}
