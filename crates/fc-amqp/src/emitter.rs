use tokio::sync::broadcast;

/// A keyed publish/subscribe primitive with two emission modes.
///
/// `emit` dispatches on the calling task, synchronously. `emit_async` defers
/// dispatch by spawning a task that yields once before sending — this is
/// the "post to next scheduler turn" primitive the supervisors need so a
/// handler reacting to a transition (e.g. a `Cancel` handler calling
/// `consume()` again) never runs inside the stack frame still mutating the
/// state that produced the event.
///
/// A `broadcast::Receiver` obtained from `subscribe` only observes sends
/// issued after it was created, which gives the "late subscribers miss past
/// events" semantics by construction — no bookkeeping required here.
pub struct AsyncEmitter<E> {
    tx: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> AsyncEmitter<E> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Dispatch `event` immediately, on the calling task. A send with no
    /// subscribers is not an error: lifecycle events are fire-and-forget.
    pub fn emit(&self, event: E) {
        let _ = self.tx.send(event);
    }

    /// Dispatch `event` after yielding once to the scheduler.
    pub fn emit_async(&self, event: E) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            let _ = tx.send(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    enum TestEvent {
        Up,
        Down,
    }

    #[tokio::test]
    async fn synchronous_emit_is_observed_immediately() {
        let emitter = AsyncEmitter::new(4);
        let mut rx = emitter.subscribe();
        emitter.emit(TestEvent::Up);
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Up);
    }

    #[tokio::test]
    async fn late_subscriber_misses_past_events() {
        let emitter = AsyncEmitter::new(4);
        emitter.emit(TestEvent::Up);
        let mut rx = emitter.subscribe();
        emitter.emit(TestEvent::Down);
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Down);
    }

    #[tokio::test]
    async fn async_emit_is_deferred_past_the_calling_frame() {
        let emitter = AsyncEmitter::new(4);
        let mut rx = emitter.subscribe();
        emitter.emit_async(TestEvent::Up);
        // The event must not be visible synchronously within this task's
        // current poll — only after yielding back to the scheduler.
        assert!(rx.try_recv().is_err());
        assert_eq!(rx.recv().await.unwrap(), TestEvent::Up);
    }
}
