use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer as LapinConsumer, ExchangeKind};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::emitter::AsyncEmitter;
use crate::error::{AmqpError, Result};

/// Queue declaration inputs, including arbitrary pass-through arguments
/// (e.g. `x-dead-letter-exchange`, used by `TieredListener`).
#[derive(Clone, Default)]
pub struct QueueSpec {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: FieldTable,
}

#[derive(Clone, Copy, Default)]
pub struct ConsumeSpec {
    pub prefetch: u16,
    pub exclusive: bool,
}

#[derive(Clone)]
pub struct ExchangeDef {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Clone)]
pub struct BindingDef {
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Clone, Default)]
pub struct ConsumerOptions {
    pub queue: QueueSpec,
    pub consume: ConsumeSpec,
    pub exchanges: Vec<ExchangeDef>,
    pub binds: Vec<BindingDef>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelInitiator {
    /// The broker ended the subscription (queue deleted, channel error,
    /// administrative cancel).
    Server,
}

/// The three finalization actions available for a delivered message. Each
/// must be invoked exactly once per delivery.
#[derive(Clone)]
pub struct Ops {
    acker: Acker,
}

impl Ops {
    fn new(acker: Acker) -> Self {
        Self { acker }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(AmqpError::PublishFailure)
    }

    /// Reject with requeue — the message becomes available for redelivery.
    pub async fn requeue(&self) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue: true })
            .await
            .map_err(AmqpError::PublishFailure)
    }

    /// Reject without requeue — routed to the queue's dead-letter exchange,
    /// if one is configured, or dropped otherwise.
    pub async fn reject(&self) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(AmqpError::PublishFailure)
    }
}

#[derive(Clone)]
pub enum ConsumerEvent {
    Message(Delivery, Ops),
    Cancel { initiator: CancelInitiator },
}

struct State {
    tag: Option<String>,
    live: bool,
    stopping: bool,
}

/// Declares a queue (plus exchanges/bindings) on a channel and runs one
/// `basic_consume` subscription. See `SPEC_FULL.md` §4.4.
///
/// Not reattachable to another channel — a fresh `Consumer` must be built
/// per channel epoch (this is the Listener's job).
pub struct Consumer {
    channel: Arc<Channel>,
    queue_name: String,
    options: ConsumerOptions,
    state: Arc<Mutex<State>>,
    emitter: Arc<AsyncEmitter<ConsumerEvent>>,
    /// Serializes declaration attempts: a caller that invokes `consume()`
    /// while one is already in flight blocks here instead of firing a second
    /// set of RPCs, then relays the in-flight attempt's outcome.
    declare_gate: AsyncMutex<()>,
    /// Bumped once per completed declaration attempt, so a caller that was
    /// waiting on `declare_gate` can tell whether the attempt it queued
    /// behind has actually concluded versus a later, unrelated one.
    declare_epoch: AtomicU64,
    /// `Display` of the most recent declaration failure, if the most recent
    /// attempt failed. Kept as a string rather than the original `AmqpError`
    /// because `lapin::Error` does not implement `Clone`.
    last_declare_error: Mutex<Option<String>>,
}

impl Consumer {
    pub fn new(channel: Arc<Channel>, queue_name: impl Into<String>, options: ConsumerOptions) -> Self {
        Self {
            channel,
            queue_name: queue_name.into(),
            options,
            state: Arc::new(Mutex::new(State {
                tag: None,
                live: false,
                stopping: false,
            })),
            emitter: Arc::new(AsyncEmitter::new(64)),
            declare_gate: AsyncMutex::new(()),
            declare_epoch: AtomicU64::new(0),
            last_declare_error: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ConsumerEvent> {
        self.emitter.subscribe()
    }

    pub fn tag(&self) -> Option<String> {
        self.state.lock().tag.clone()
    }

    pub fn is_stopping(&self) -> bool {
        self.state.lock().stopping
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().live
    }

    /// Idempotent: a call while already live is a no-op success. A call that
    /// arrives while an earlier call is still declaring does not redeclare —
    /// it waits for that attempt to conclude and relays its outcome, so two
    /// racing callers never observe different results for the one attempt
    /// they both joined.
    pub async fn consume(&self) -> Result<()> {
        if self.state.lock().live {
            return Ok(());
        }

        let epoch_before_wait = self.declare_epoch.load(Ordering::SeqCst);
        let _gate = self.declare_gate.lock().await;

        // Another caller's attempt concluded while we waited for the gate:
        // relay its outcome instead of redeclaring from scratch.
        if self.declare_epoch.load(Ordering::SeqCst) != epoch_before_wait {
            return match self.last_declare_error.lock().clone() {
                Some(message) => Err(AmqpError::ConsumerDeclarationConflictRelayed(message)),
                None => Ok(()),
            };
        }

        if self.state.lock().live {
            return Ok(());
        }

        let outcome = self.declare_and_consume().await;

        match outcome {
            Ok((tag, lapin_consumer)) => {
                {
                    let mut state = self.state.lock();
                    state.tag = Some(tag);
                    state.live = true;
                }
                *self.last_declare_error.lock() = None;
                self.declare_epoch.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(dispatch_loop(self.state.clone(), lapin_consumer, self.emitter.clone()));
                Ok(())
            }
            Err(err) => {
                error!(queue = %self.queue_name, error = %err, "consumer declaration failed");
                *self.last_declare_error.lock() = Some(err.to_string());
                self.declare_epoch.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn declare_and_consume(&self) -> Result<(String, LapinConsumer)> {
        let declare_options = QueueDeclareOptions {
            durable: self.options.queue.durable,
            exclusive: self.options.queue.exclusive,
            auto_delete: self.options.queue.auto_delete,
            ..Default::default()
        };
        let queue = self
            .channel
            .queue_declare(&self.queue_name, declare_options, self.options.queue.arguments.clone())
            .await
            .map_err(AmqpError::ConsumerDeclarationConflict)?;
        let effective_queue_name = queue.name().as_str().to_string();

        futures::future::try_join_all(self.options.exchanges.iter().map(|exchange| {
            self.channel.exchange_declare(
                &exchange.name,
                exchange.kind.clone(),
                ExchangeDeclareOptions {
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
        }))
        .await
        .map_err(AmqpError::ConsumerDeclarationConflict)?;

        futures::future::try_join_all(self.options.binds.iter().map(|bind| {
            self.channel.queue_bind(
                &effective_queue_name,
                &bind.exchange,
                &bind.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
        }))
        .await
        .map_err(AmqpError::ConsumerDeclarationConflict)?;

        // Prefetch must be in force before the basic.consume RPC; these two
        // calls are never joined, only sequenced, so QoS always lands first.
        if self.options.consume.prefetch > 0 {
            self.channel
                .basic_qos(self.options.consume.prefetch, BasicQosOptions::default())
                .await
                .map_err(AmqpError::ConsumerDeclarationConflict)?;
        }

        let consumer_tag = format!("fc-amqp-{}", Uuid::new_v4());
        let lapin_consumer = self
            .channel
            .basic_consume(
                &effective_queue_name,
                &consumer_tag,
                BasicConsumeOptions {
                    exclusive: self.options.consume.exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(AmqpError::ConsumerDeclarationConflict)?;

        Ok((consumer_tag, lapin_consumer))
    }

    /// Resolves once the server has acknowledged the cancel (or the channel
    /// has already closed). A no-op if not currently live or already
    /// stopping.
    pub async fn stop_consuming(&self) {
        let tag = {
            let mut state = self.state.lock();
            if state.stopping || !state.live {
                return;
            }
            state.stopping = true;
            state.tag.clone()
        };

        if let Some(tag) = tag {
            if let Err(err) = self
                .channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                warn!(queue = %self.queue_name, tag = %tag, error = %err, "basic_cancel failed (channel likely already closed)");
            }
        }

        let mut state = self.state.lock();
        state.stopping = false;
        state.live = false;
        state.tag = None;
    }
}

/// Drives the broker-delivered stream for one declaration epoch. When the
/// stream ends — server-initiated cancel, or the channel died under it — the
/// epoch's `live`/`tag` state is cleared here before `Cancel` is emitted, so
/// a `consume()` issued in response to that event always redeclares instead
/// of short-circuiting on stale `live == true` state.
async fn dispatch_loop(state: Arc<Mutex<State>>, mut consumer: LapinConsumer, emitter: Arc<AsyncEmitter<ConsumerEvent>>) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(delivery) => {
                let ops = Ops::new(delivery.acker.clone());
                debug!(delivery_tag = delivery.delivery_tag, "dispatching delivery");
                emitter.emit_async(ConsumerEvent::Message(delivery, ops));
            }
            Err(err) => {
                warn!(error = %err, "consumer stream error, treating as cancel");
                break;
            }
        }
    }

    {
        let mut state = state.lock();
        state.live = false;
        state.tag = None;
    }
    emitter.emit_async(ConsumerEvent::Cancel {
        initiator: CancelInitiator::Server,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_spec_defaults_are_transient_non_exclusive() {
        let spec = QueueSpec::default();
        assert!(!spec.durable);
        assert!(!spec.exclusive);
        assert!(!spec.auto_delete);
    }

    #[test]
    fn consume_spec_defaults_to_no_prefetch_limit() {
        let spec = ConsumeSpec::default();
        assert_eq!(spec.prefetch, 0);
    }
}
