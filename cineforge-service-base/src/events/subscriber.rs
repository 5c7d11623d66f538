use crate::events::{EventEnvelope, Subscription};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: EventEnvelope) -> anyhow::Result<()>;
}

/// Ack-after-handle consumer loop: a message is acknowledged by the handler
/// returning `Ok`; a failing handler nacks it for redelivery, bounded by
/// `max_delivery_attempts`. This is where at-least-once turns into "handled
/// at least once, dropped only after repeated failure".
pub async fn run_subscriber_loop(
    name: &'static str,
    mut subscription: Subscription,
    cancel: CancellationToken,
    max_delivery_attempts: u32,
    handler: Arc<dyn EventHandler>,
) {
    loop {
        let delivery = tokio::select! {
            _ = cancel.cancelled() => break,
            delivery = subscription.next() => delivery,
        };
        let Some(delivery) = delivery else {
            break;
        };
        match handler.handle(delivery.envelope.clone()).await {
            Ok(()) => {}
            Err(cause) => {
                if delivery.attempt >= max_delivery_attempts {
                    error!(
                        subscriber = name,
                        event_type = ?delivery.envelope.event_type(),
                        attempt = delivery.attempt,
                        %cause,
                        "dropping event after repeated handler failures"
                    );
                } else {
                    warn!(
                        subscriber = name,
                        event_type = ?delivery.envelope.event_type(),
                        attempt = delivery.attempt,
                        %cause,
                        "event handler failed, redelivering"
                    );
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(delivery.attempt)))
                        .await;
                    subscription.nack(delivery);
                }
            }
        }
    }
}
