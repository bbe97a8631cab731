use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use lapin::message::Delivery;
use lapin::types::{AMQPValue, FieldTable, LongString};
use lapin::{Connection, ExchangeKind};
use tracing::warn;

use crate::consumer::{BindingDef, ConsumeSpec, Consumer, ConsumerEvent, ConsumerOptions, ExchangeDef, QueueSpec};
use crate::error::{AmqpError, Result};
use crate::listener::{ConsumerFactory, Listener};

/// One stage of the delayed-retry pipeline.
#[derive(Clone)]
pub struct Tier {
    pub name: String,
    pub delay: Duration,
}

#[derive(Clone, Default)]
pub struct RoutingOptions {
    /// If true, the last tier dead-letters back to the first instead of
    /// requeueing. Opt-in, because a handler that always fails would
    /// otherwise loop forever.
    pub circular: bool,
    /// Defaults to `{name: "<base>-dlx", kind: Direct, durable: true}`.
    pub dead_letter_exchange: Option<ExchangeDef>,
}

/// Invoked once per delivery, on the tier it currently occupies. `Ok`
/// acks; `Err` triggers the tier's reject/requeue-with-delay behavior.
pub type MessageHandler = Arc<
    dyn Fn(Delivery) -> BoxFuture<'static, std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>>
        + Send
        + Sync,
>;

#[derive(Clone, Default)]
pub struct TieredListenerOptions {
    pub routing: RoutingOptions,
    /// Exchanges the first tier's queue binds to (the entry point for
    /// freshly published messages).
    pub exchanges: Vec<ExchangeDef>,
    pub binds: Vec<BindingDef>,
}

/// Builds N chained, dead-letter-linked queues implementing delayed retry
/// tiers, composed over a `Listener`. See `SPEC_FULL.md` §4.6.
///
/// Exposes `listen`/`stop_listening` directly rather than re-exporting the
/// internal `Listener` under a different name (see DESIGN.md's Open
/// Question ledger).
pub struct TieredListener {
    listener: Listener,
}

impl TieredListener {
    pub fn new(
        connection: Arc<Connection>,
        queue_name_base: impl Into<String>,
        tiers: Vec<Tier>,
        message_handler: MessageHandler,
        options: TieredListenerOptions,
    ) -> Result<Self> {
        if tiers.is_empty() {
            return Err(AmqpError::InvalidState(
                "TieredListener requires at least one tier".to_string(),
            ));
        }

        let queue_name_base = queue_name_base.into();
        let dlx = options.routing.dead_letter_exchange.clone().unwrap_or(ExchangeDef {
            name: format!("{queue_name_base}-dlx"),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
        });
        let circular = options.routing.circular;
        let tier_count = tiers.len();

        let factories: Vec<ConsumerFactory> = tiers
            .iter()
            .enumerate()
            .map(|(index, tier)| {
                let tier = tier.clone();
                let queue_name = format!("{queue_name_base}-{}", tier.name);

                let next_tier_name = if index + 1 < tier_count {
                    Some(tiers[index + 1].name.clone())
                } else if circular {
                    Some(tiers[0].name.clone())
                } else {
                    None
                };
                let is_terminal_non_circular = index + 1 == tier_count && !circular;

                let mut arguments = FieldTable::default();
                if let Some(next) = &next_tier_name {
                    arguments.insert(
                        "x-dead-letter-exchange".into(),
                        AMQPValue::LongString(LongString::from(dlx.name.clone())),
                    );
                    arguments.insert(
                        "x-dead-letter-routing-key".into(),
                        AMQPValue::LongString(LongString::from(next.clone())),
                    );
                }

                let mut exchanges = vec![dlx.clone()];
                let mut binds = vec![BindingDef {
                    exchange: dlx.name.clone(),
                    routing_key: tier.name.clone(),
                }];
                if index == 0 {
                    exchanges.extend(options.exchanges.clone());
                    binds.extend(options.binds.clone());
                }

                let consumer_options = ConsumerOptions {
                    queue: QueueSpec {
                        durable: true,
                        exclusive: false,
                        auto_delete: false,
                        arguments,
                    },
                    consume: ConsumeSpec::default(),
                    exchanges,
                    binds,
                };

                let handler = message_handler.clone();
                let delay = tier.delay;
                let queue_name_for_factory = queue_name.clone();

                let factory: ConsumerFactory = Arc::new(move |channel| {
                    let consumer = Consumer::new(channel, queue_name_for_factory.clone(), consumer_options.clone());
                    spawn_tier_processor(&consumer, is_terminal_non_circular, delay, handler.clone());
                    consumer
                });
                factory
            })
            .collect();

        Ok(Self {
            listener: Listener::new(connection, factories),
        })
    }

    pub async fn listen(&self) -> Result<()> {
        self.listener.listen().await
    }

    pub async fn stop_listening(&self) {
        self.listener.stop_listening().await
    }
}

fn spawn_tier_processor(
    consumer: &Consumer,
    terminal_non_circular: bool,
    delay: Duration,
    handler: MessageHandler,
) {
    let mut events = consumer.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let ConsumerEvent::Message(delivery, ops) = event else {
                continue;
            };
            let delivery_tag = delivery.delivery_tag;
            match handler(delivery).await {
                Ok(()) => {
                    if let Err(err) = ops.ack().await {
                        warn!(delivery_tag, error = %err, "tiered listener: ack failed");
                    }
                }
                Err(err) => {
                    warn!(delivery_tag, error = %err, "tiered listener: handler failed, delaying before routing");
                    tokio::time::sleep(delay).await;
                    let outcome = if terminal_non_circular {
                        ops.requeue().await
                    } else {
                        ops.reject().await
                    };
                    if let Err(err) = outcome {
                        warn!(delivery_tag, error = %err, "tiered listener: finalize after failure did not complete");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> Vec<Tier> {
        vec![
            Tier { name: "fast".into(), delay: Duration::from_millis(500) },
            Tier { name: "medium".into(), delay: Duration::from_secs(2) },
            Tier { name: "slow".into(), delay: Duration::from_secs(10) },
        ]
    }

    #[test]
    fn non_circular_chain_terminates_on_last_tier() {
        let tier_count = tiers().len();
        for (index, _tier) in tiers().iter().enumerate() {
            let next = if index + 1 < tier_count {
                Some(index + 1)
            } else {
                None
            };
            if index + 1 == tier_count {
                assert_eq!(next, None, "last non-circular tier has no forward DLX target");
            }
        }
    }

    #[test]
    fn default_dlx_name_derives_from_queue_base() {
        let options = TieredListenerOptions::default();
        assert!(options.routing.dead_letter_exchange.is_none());
    }
}
