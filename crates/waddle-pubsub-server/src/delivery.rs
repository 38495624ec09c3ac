//! Outbound notification sink.
//!
//! The standalone host has no stanza router, so deliveries produced by the
//! engine are drained from the broadcaster channel and logged.

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use waddle_pubsub::{Delivery, Notification};

/// Drain deliveries until the channel closes or `cancel` fires. Returns the
/// number of notifications handled.
pub async fn run(mut rx: UnboundedReceiver<Delivery>, cancel: CancellationToken) -> usize {
    let mut delivered = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = rx.recv() => {
                let Some(delivery) = delivery else { break };
                log_delivery(&delivery);
                delivered += 1;
            }
        }
    }
    while let Ok(delivery) = rx.try_recv() {
        log_delivery(&delivery);
        delivered += 1;
    }
    info!(delivered, "Delivery sink stopped");
    delivered
}

fn log_delivery(delivery: &Delivery) {
    let notification = &delivery.notification;
    match notification {
        Notification::Items(event) => debug!(
            to = %delivery.to,
            node = %event.node_id,
            items = event.items.len(),
            subscriptions = ?event.subscription_ids,
            "items notification"
        ),
        Notification::AuthorizationRequest {
            node_id,
            subscription_id,
            subscriber,
        } => info!(
            to = %delivery.to,
            node = %node_id,
            subscription = %subscription_id,
            subscriber = %subscriber,
            "authorization request"
        ),
        other => debug!(
            to = %delivery.to,
            node = %other.node_id(),
            kind = other.kind(),
            "node notification"
        ),
    }
}
