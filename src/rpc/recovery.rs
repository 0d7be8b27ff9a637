//! Invalidation of in-flight state after a connection recovery

use super::pending::PendingRequests;
use super::subscriptions::ResponseSubscriptionRegistry;
use crate::events::{ChannelKind, ConnectionRecovered, EventBus, EventStreamSubscription};
use log::debug;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Registers the recovery listener on the event bus
///
/// When the consumer channel is re-established, every reply queue and every
/// consumer registration from before the drop is gone on the broker side.
/// The listener fails all outstanding requests with a lost-connection error
/// and drains the subscription registry, so the next request of any type
/// pair rebuilds its reply queue from scratch. Recovery of producer channels
/// leaves in-flight state untouched.
///
/// Failing the pending requests and emptying the registry happen
/// synchronously on the publishing thread; only the broker-side consumer
/// cancellations are detached onto the runtime.
pub(super) fn register(
    events: &Arc<EventBus>,
    pending: Arc<PendingRequests>,
    subscriptions: Arc<ResponseSubscriptionRegistry>,
) -> EventStreamSubscription {
    let runtime = Handle::current();

    events.subscribe::<ConnectionRecovered, _>(move |event| {
        if event.channel != ChannelKind::Consumer {
            return;
        }

        let lost_requests = pending.snapshot_and_clear();
        let dropped_subscriptions = subscriptions.snapshot_and_clear();

        debug!(
            "consumer channel recovered: failing {} request(s), dropping {} reply subscription(s)",
            lost_requests.len(),
            dropped_subscriptions.len()
        );

        for request in lost_requests {
            request.fail();
        }
        for subscription in dropped_subscriptions {
            subscription.close_detached(&runtime);
        }
    })
}
