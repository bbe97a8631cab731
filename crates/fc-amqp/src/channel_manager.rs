use std::sync::Arc;
use std::time::Duration;

use lapin::{options::ConfirmSelectOptions, Channel, Connection};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, Notify};
use tracing::{info, warn};

use crate::emitter::AsyncEmitter;
use crate::error::{AmqpError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy)]
pub struct ChannelManagerOptions {
    pub confirm: bool,
    pub retry: RetryPolicy,
}

impl Default for ChannelManagerOptions {
    fn default() -> Self {
        Self {
            confirm: false,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub enum ChannelManagerEvent {
    Create(Arc<Channel>),
    Close(Arc<Channel>),
}

struct State {
    started: bool,
    connection_closed: bool,
    channel: Option<Arc<Channel>>,
}

struct Inner {
    connection: Arc<Connection>,
    options: ChannelManagerOptions,
    state: Mutex<State>,
    emitter: AsyncEmitter<ChannelManagerEvent>,
    wake: Notify,
}

/// Maintains one open channel (plain or confirm) on a given connection,
/// recreating it on drop. See `SPEC_FULL.md` §4.3.
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl ChannelManager {
    pub fn new(connection: Arc<Connection>, options: ChannelManagerOptions) -> Self {
        let inner = Arc::new(Inner {
            connection,
            options,
            state: Mutex::new(State {
                started: false,
                connection_closed: false,
                channel: None,
            }),
            emitter: AsyncEmitter::new(16),
            wake: Notify::new(),
        });

        let supervisor = inner.clone();
        tokio::spawn(async move { Self::run(supervisor).await });

        Self { inner }
    }

    pub fn no_confirms(connection: Arc<Connection>) -> Self {
        Self::new(
            connection,
            ChannelManagerOptions {
                confirm: false,
                ..Default::default()
            },
        )
    }

    pub fn with_confirms(connection: Arc<Connection>) -> Self {
        Self::new(
            connection,
            ChannelManagerOptions {
                confirm: true,
                ..Default::default()
            },
        )
    }

    /// Begins channel creation. Fails if the underlying connection is
    /// already known to be dead.
    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.connection_closed {
            return Err(AmqpError::InvalidState(
                "ChannelManager::start on a closed connection".to_string(),
            ));
        }
        if state.started {
            return Ok(());
        }
        state.started = true;
        drop(state);
        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if !state.started {
            return;
        }
        state.started = false;
        drop(state);
        self.inner.wake.notify_one();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelManagerEvent> {
        self.inner.emitter.subscribe()
    }

    pub fn current_channel(&self) -> Option<Arc<Channel>> {
        self.inner.state.lock().channel.clone()
    }

    async fn run(inner: Arc<Inner>) {
        loop {
            Self::wait_until_started(&inner).await;

            if !inner.connection.status().connected() {
                let mut state = inner.state.lock();
                state.connection_closed = true;
                state.started = false;
                warn!("ChannelManager cannot start: connection already closed");
                continue;
            }

            match Self::attempt_create(&inner).await {
                Ok(channel) => {
                    let channel = Arc::new(channel);

                    if !inner.state.lock().started {
                        let doomed = channel.clone();
                        tokio::spawn(async move {
                            let _ = doomed.close(200, "stop").await;
                        });
                        continue;
                    }

                    inner.state.lock().channel = Some(channel.clone());
                    inner.emitter.emit_async(ChannelManagerEvent::Create(channel.clone()));

                    let dropped = install_drop_notifier(&channel);
                    tokio::select! {
                        _ = dropped => {
                            let err = AmqpError::ChannelDropped;
                            warn!(error = %err, "channel dropped");
                        }
                        _ = inner.wake.notified() => {}
                    }

                    let deliberate_stop = !inner.state.lock().started;
                    inner.state.lock().channel = None;
                    if deliberate_stop {
                        let _ = channel.close(200, "stop").await;
                    }
                    inner.emitter.emit_async(ChannelManagerEvent::Close(channel));

                    if deliberate_stop {
                        continue;
                    }

                    if !inner.connection.status().connected() {
                        let mut state = inner.state.lock();
                        state.connection_closed = true;
                        state.started = false;
                        continue;
                    }

                    Self::sleep_cancellable(inner.options.retry.channel_dropped_delay(), &inner).await;
                }
                Err(err) => {
                    let err = AmqpError::ChannelCreateFailed(err);
                    warn!(error = %err, "channel create failed");
                    if inner.state.lock().started {
                        Self::sleep_cancellable(inner.options.retry.channel_create_failure_delay(), &inner).await;
                    }
                }
            }
        }
    }

    async fn wait_until_started(inner: &Arc<Inner>) {
        loop {
            if inner.state.lock().started {
                return;
            }
            inner.wake.notified().await;
        }
    }

    async fn sleep_cancellable(delay: Duration, inner: &Arc<Inner>) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.wake.notified() => {}
        }
    }

    async fn attempt_create(inner: &Arc<Inner>) -> std::result::Result<Channel, lapin::Error> {
        let channel = inner.connection.create_channel().await?;
        if inner.options.confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
            info!("opened confirm channel");
        } else {
            info!("opened plain channel");
        }
        Ok(channel)
    }
}

fn install_drop_notifier(channel: &Channel) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    channel.on_error(move |_err| {
        if let Some(tx) = tx.lock().take() {
            let _ = tx.send(());
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_are_plain() {
        let options = ChannelManagerOptions::default();
        assert!(!options.confirm);
    }
}
