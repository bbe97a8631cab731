use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use lapin::{Channel, Connection};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::error;

use crate::channel_manager::{ChannelManager, ChannelManagerEvent};
use crate::consumer::{Consumer, ConsumerEvent};
use crate::error::{AmqpError, Result};

/// Builds a `Consumer` against a freshly (re)created channel. Invoked once
/// per factory on every `ChannelManagerEvent::Create`.
pub type ConsumerFactory = Arc<dyn Fn(Arc<Channel>) -> Consumer + Send + Sync>;

/// Binds a set of consumer factories to an internally-owned `ChannelManager`,
/// rebuilding the whole consumer set whenever the channel is recreated. See
/// `SPEC_FULL.md` §4.5.
pub struct Listener {
    manager: Arc<ChannelManager>,
    consumers: Arc<Mutex<Vec<Arc<Consumer>>>>,
    ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
    interrupted: Arc<AtomicBool>,
    interrupt_notify: Arc<Notify>,
}

impl Listener {
    pub fn new(connection: Arc<Connection>, factories: Vec<ConsumerFactory>) -> Self {
        let manager = Arc::new(ChannelManager::no_confirms(connection));
        let consumers = Arc::new(Mutex::new(Vec::new()));
        let ready = Arc::new(AtomicBool::new(false));
        let ready_notify = Arc::new(Notify::new());

        let supervisor_manager = manager.clone();
        let supervisor_consumers = consumers.clone();
        let supervisor_ready = ready.clone();
        let supervisor_ready_notify = ready_notify.clone();
        tokio::spawn(async move {
            supervise(
                supervisor_manager,
                factories,
                supervisor_consumers,
                supervisor_ready,
                supervisor_ready_notify,
            )
            .await
        });

        Self {
            manager,
            consumers,
            ready,
            ready_notify,
            interrupted: Arc::new(AtomicBool::new(false)),
            interrupt_notify: Arc::new(Notify::new()),
        }
    }

    /// Resolves the first time every factory's consumer has started.
    /// Resolves to `Err(InterruptedStartup)` if `stop_listening` is called
    /// first.
    pub async fn listen(&self) -> Result<()> {
        self.manager.start()?;
        loop {
            if self.ready.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.interrupted.load(Ordering::SeqCst) {
                return Err(AmqpError::InterruptedStartup);
            }
            tokio::select! {
                _ = self.ready_notify.notified() => {}
                _ = self.interrupt_notify.notified() => {}
            }
        }
    }

    /// The channel currently backing every consumer, if the manager has one
    /// open. Mainly useful for tests that need to act on the broker side of
    /// a live consumer (e.g. deleting its queue to provoke a server cancel).
    pub fn current_channel(&self) -> Option<Arc<Channel>> {
        self.manager.current_channel()
    }

    /// Resolves once every consumer has stopped.
    pub async fn stop_listening(&self) {
        if !self.ready.load(Ordering::SeqCst) {
            self.interrupted.store(true, Ordering::SeqCst);
            self.interrupt_notify.notify_waiters();
        }
        self.manager.stop();
        let current = {
            let mut guard = self.consumers.lock();
            std::mem::take(&mut *guard)
        };
        for consumer in current {
            consumer.stop_consuming().await;
        }
    }
}

async fn supervise(
    manager: Arc<ChannelManager>,
    factories: Vec<ConsumerFactory>,
    consumers: Arc<Mutex<Vec<Arc<Consumer>>>>,
    ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
) {
    let mut events = manager.subscribe();
    loop {
        match events.recv().await {
            Ok(ChannelManagerEvent::Create(channel)) => {
                let new_set: Vec<Arc<Consumer>> = factories
                    .iter()
                    .map(|factory| Arc::new(factory(channel.clone())))
                    .collect();
                *consumers.lock() = new_set.clone();

                let remaining = Arc::new(AtomicUsize::new(new_set.len()));
                for consumer in new_set {
                    spawn_consumer_task(consumer, remaining.clone(), ready.clone(), ready_notify.clone());
                }
            }
            Ok(ChannelManagerEvent::Close(_channel)) => {
                let old = {
                    let mut guard = consumers.lock();
                    std::mem::take(&mut *guard)
                };
                for consumer in old {
                    consumer.stop_consuming().await;
                }
            }
            Err(_) => return,
        }
    }
}

/// Drives one consumer for its whole life under this listener: start it,
/// and whenever it cancels (server-initiated — a manual stop exits instead),
/// re-`consume()` it against the same channel.
fn spawn_consumer_task(
    consumer: Arc<Consumer>,
    remaining: Arc<AtomicUsize>,
    ready: Arc<AtomicBool>,
    ready_notify: Arc<Notify>,
) {
    tokio::spawn(async move {
        let mut counted = false;
        loop {
            let mut events = consumer.subscribe();
            if let Err(err) = consumer.consume().await {
                error!(error = %err, "listener: consumer declaration failed, awaiting channel recreation");
                return;
            }
            if !counted {
                counted = true;
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    ready.store(true, Ordering::SeqCst);
                    ready_notify.notify_waiters();
                }
            }

            loop {
                match events.recv().await {
                    Ok(ConsumerEvent::Cancel { .. }) => break,
                    Ok(ConsumerEvent::Message(..)) => continue,
                    Err(_) => return,
                }
            }

            if consumer.is_stopping() {
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_factory_is_object_safe() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConsumerFactory>();
    }
}
