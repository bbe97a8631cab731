//! Supervised, reconnecting AMQP 0-9-1 primitives built on top of `lapin`.
//!
//! Three layers of supervision compose: a [`Connector`] keeps one broker
//! connection alive across a list of URIs, a [`ChannelManager`] keeps one
//! channel alive on top of that connection, and a [`Consumer`] keeps one
//! `basic.consume` subscription alive on top of that channel. [`Listener`]
//! and [`TieredListener`] wire a set of consumer factories to a channel
//! manager so the whole consumer set rebuilds whenever the channel does.
//! [`PublishStream`] is the outbound counterpart: a confirm-mode publisher
//! with bounded back-pressure.

pub mod channel_manager;
pub mod connector;
pub mod consumer;
pub mod emitter;
pub mod error;
pub mod listener;
pub mod publish_stream;
pub mod retry;
pub mod tiered_listener;

pub use channel_manager::{ChannelManager, ChannelManagerEvent, ChannelManagerOptions};
pub use connector::{Connector, ConnectorEvent, ConnectorOptions};
pub use consumer::{
    BindingDef, CancelInitiator, ConsumeSpec, Consumer, ConsumerEvent, ConsumerOptions, ExchangeDef, Ops, QueueSpec,
};
pub use emitter::AsyncEmitter;
pub use error::{AmqpError, Result};
pub use listener::{ConsumerFactory, Listener};
pub use publish_stream::{OutboundMessage, PublishStream, PublishStreamOptions, WriteOutcome};
pub use retry::RetryPolicy;
pub use tiered_listener::{MessageHandler, RoutingOptions, Tier, TieredListener, TieredListenerOptions};
