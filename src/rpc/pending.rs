//! Table of outstanding requests keyed by correlation id

use super::RpcError;
use crate::broker::Delivery;
use dashmap::DashMap;
use tokio::sync::oneshot;

/// Completion paths of one outstanding request
///
/// Wraps the single-shot sink the caller awaits. Whoever removes the entry
/// from the table owns the action and fires exactly one of the two paths;
/// the sink consumes itself on send, so a second terminal transition is
/// unrepresentable.
pub(crate) struct ResponseAction {
    sink: oneshot::Sender<Result<Delivery, RpcError>>,
}

impl ResponseAction {
    /// Creates the action and the receiver the caller awaits
    pub fn channel() -> (Self, oneshot::Receiver<Result<Delivery, RpcError>>) {
        let (sink, completion) = oneshot::channel();
        (Self { sink }, completion)
    }

    /// Hands the reply to the caller; dropped when the caller is gone
    pub fn succeed(self, delivery: Delivery) {
        let _ = self.sink.send(Ok(delivery));
    }

    /// Fails the caller with a lost-connection error
    pub fn fail(self) {
        let _ = self.sink.send(Err(RpcError::ConnectionLost));
    }
}

/// Concurrent map from correlation id to [`ResponseAction`]
///
/// One table serves the whole engine; entries are type-erased because the
/// payload type knowledge lives in the caller awaiting the sink.
#[derive(Default)]
pub(crate) struct PendingRequests {
    entries: DashMap<String, ResponseAction>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an entry under a fresh correlation id
    pub fn register(&self, correlation_id: String, action: ResponseAction) {
        let previous = self.entries.insert(correlation_id, action);
        debug_assert!(previous.is_none(), "correlation id registered twice");
    }

    /// Atomically detaches the entry for the given id, if present
    ///
    /// The only path through which a reply reaches a caller; detaching before
    /// invoking the action keeps terminal transitions mutually exclusive.
    pub fn try_remove(&self, correlation_id: &str) -> Option<ResponseAction> {
        self.entries
            .remove(correlation_id)
            .map(|(_, action)| action)
    }

    /// Removes and drops the entry for the given id, if still present
    pub fn discard(&self, correlation_id: &str) {
        self.entries.remove(correlation_id);
    }

    /// Drains the table, returning every action so failure callbacks can run
    /// outside any lock
    pub fn snapshot_and_clear(&self) -> Vec<ResponseAction> {
        let ids: Vec<String> = self.entries.iter().map(|entry| entry.key().clone()).collect();

        ids.iter()
            .filter_map(|id| self.try_remove(id))
            .collect()
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no requests are outstanding
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
