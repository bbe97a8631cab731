use thiserror::Error;

/// One variant per error kind this crate distinguishes.
///
/// Supervisory components (`Connector`, `ChannelManager`) absorb the
/// retryable kinds themselves and never return them to a caller — those
/// variants exist so the retry loops have something typed to log. The
/// non-retryable kinds are the ones a caller actually sees as an `Err`.
#[derive(Error, Debug)]
pub enum AmqpError {
    /// Broker unreachable, auth timeout, DNS failure. Retried indefinitely
    /// by the `Connector`; never surfaced to a caller.
    #[error("transient connect failure: {0}")]
    TransientConnect(#[source] lapin::Error),

    /// A previously live connection terminated.
    #[error("connection dropped")]
    ConnectionDropped,

    /// Connection alive, but the broker refused to open a channel.
    #[error("channel create failed: {0}")]
    ChannelCreateFailed(#[source] lapin::Error),

    /// A previously live channel closed mid-life.
    #[error("channel dropped")]
    ChannelDropped,

    /// Queue/exchange/bind assertion failed during `Consumer::consume`.
    #[error("consumer declaration conflict: {0}")]
    ConsumerDeclarationConflict(#[source] lapin::Error),

    /// A `Consumer::consume()` call joined an in-flight declaration attempt
    /// that went on to fail. Carries the original failure's message rather
    /// than the original `AmqpError`, since `lapin::Error` is not `Clone`.
    #[error("consumer declaration conflict (observed by a joining caller): {0}")]
    ConsumerDeclarationConflictRelayed(String),

    /// The user-supplied message handler returned an error.
    #[error("message handler failed: {0}")]
    HandlerFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A publish was not transmitted, or the transmission itself failed.
    #[error("publish failed: {0}")]
    PublishFailure(#[source] lapin::Error),

    /// The broker transmitted the publish but confirmed it negatively
    /// (internal broker error, e.g. out of disk space), as opposed to
    /// returning it for being unroutable.
    #[error("publish was nacked by the broker")]
    PublishNacked,

    /// An operation was attempted in a state that forbids it (e.g.
    /// `ChannelManager::start` on a dead connection, or a malformed
    /// `PublishStream` write).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// `Listener::stop_listening` was called before `listen` resolved.
    #[error("startup interrupted by stop")]
    InterruptedStartup,
}

pub type Result<T> = std::result::Result<T, AmqpError>;
