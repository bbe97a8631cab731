use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use lapin::BasicProperties;
use lapin::Channel;
use tokio::sync::{Notify, Semaphore};

use crate::error::{AmqpError, Result};

#[derive(Debug, Clone)]
pub struct PublishStreamOptions {
    /// Caps the number of publishes in flight (sent but not yet confirmed).
    /// A `write()` past this point does not block — it returns
    /// `WriteOutcome::Pending` immediately.
    pub high_water_mark: usize,
}

impl Default for PublishStreamOptions {
    fn default() -> Self {
        Self { high_water_mark: 8 }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Empty string publishes to the default exchange.
    pub exchange: String,
    pub routing_key: String,
    pub content: Bytes,
    pub properties: BasicProperties,
    pub mandatory: bool,
}

impl OutboundMessage {
    pub fn new(routing_key: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: routing_key.into(),
            content: content.into(),
            properties: BasicProperties::default(),
            mandatory: false,
        }
    }
}

/// The outcome of one `write()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Confirmed,
    /// Broker accepted the publish but does not guarantee routing (no queue
    /// bound to match), relevant only when `mandatory` was set and the
    /// broker returned the message instead of confirming it.
    Returned,
    /// `high_water_mark` outstanding confirmations were already in flight;
    /// nothing was published. The caller should await `ready()` (or just
    /// retry later) before writing again.
    Pending,
}

/// A confirm-mode publisher with bounded in-flight back-pressure. See
/// `SPEC_FULL.md` §4.7.
///
/// Once a publish is nacked or otherwise fails, the stream is marked failed
/// and every subsequent `write()` fails fast without touching the channel.
pub struct PublishStream {
    channel: Arc<Channel>,
    permits: Semaphore,
    failed: AtomicBool,
    /// Woken every time a permit is returned or the stream fails, so
    /// `ready()` doesn't need to poll `permits`/`failed` on a timer.
    drained: Notify,
}

impl PublishStream {
    /// `channel` must already be in confirm mode (see
    /// `ChannelManager::with_confirms`).
    pub fn new(channel: Arc<Channel>, options: PublishStreamOptions) -> Self {
        Self {
            channel,
            permits: Semaphore::new(options.high_water_mark.max(1)),
            failed: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Publishes if headroom is available, without blocking for it.
    /// Validates `routing_key` is non-empty before touching the channel or
    /// the semaphore. Returns `Ok(WriteOutcome::Pending)` — not an error —
    /// when `high_water_mark` confirmations are already outstanding.
    pub async fn write(&self, message: OutboundMessage) -> Result<WriteOutcome> {
        if message.routing_key.is_empty() {
            return Err(AmqpError::InvalidState(
                "OutboundMessage::routing_key must not be empty".to_string(),
            ));
        }
        if self.is_failed() {
            return Err(AmqpError::InvalidState(
                "PublishStream is in a failed state".to_string(),
            ));
        }

        let permit = match self.permits.try_acquire() {
            Ok(permit) => permit,
            Err(_) => return Ok(WriteOutcome::Pending),
        };

        let result = self.publish_and_confirm(&message).await;
        drop(permit);
        self.drained.notify_waiters();

        if result.is_err() {
            self.failed.store(true, Ordering::SeqCst);
            self.drained.notify_waiters();
        }
        result
    }

    /// Resolves once a `write()` would not immediately return
    /// `WriteOutcome::Pending` — a permit is available — or once the stream
    /// has failed, so a caller awaiting drainage never blocks forever on a
    /// stream that has given up for good.
    pub async fn ready(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_failed() || self.permits.available_permits() > 0 {
                return;
            }
            notified.await;
        }
    }

    async fn publish_and_confirm(&self, message: &OutboundMessage) -> Result<WriteOutcome> {
        let publish = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    ..Default::default()
                },
                &message.content,
                message.properties.clone(),
            )
            .await
            .map_err(AmqpError::PublishFailure)?;

        // A mandatory, unroutable publish resolves as a `Nack` once the
        // broker basic.returns it rather than confirming — that is a
        // routing miss, not a broker-side failure, so it is reported
        // distinctly instead of as `PublishFailure`.
        match publish.await.map_err(AmqpError::PublishFailure)? {
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(WriteOutcome::Confirmed),
            Confirmation::Nack(_) if message.mandatory => Ok(WriteOutcome::Returned),
            Confirmation::Nack(_) => Err(AmqpError::PublishNacked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_high_water_mark_is_eight() {
        let options = PublishStreamOptions::default();
        assert_eq!(options.high_water_mark, 8);
    }

    #[test]
    fn outbound_message_defaults_to_default_exchange() {
        let message = OutboundMessage::new("orders.created", Bytes::from_static(b"{}"));
        assert_eq!(message.exchange, "");
        assert!(!message.mandatory);
    }

    #[tokio::test]
    async fn try_acquire_yields_pending_once_high_water_mark_is_exhausted() {
        let semaphore = Semaphore::new(1);
        let _held = semaphore.try_acquire().expect("first acquire has headroom");
        assert!(
            semaphore.try_acquire().is_err(),
            "a second concurrent acquire must not block — it must fail fast so write() can return Pending"
        );
    }
}
