use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::oneshot;

/// Snapshot of the stream flags at the time of a [`Reader::state_change`]
///  call. The stream mutex is held while the reader is notified, so the
///  reader cannot take the lock itself to inspect the stream; the stream
///  passes the flags along instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct StreamState {
    pub stopped: bool,
    pub paused: bool,
}

/// A source of packets feeding a stream.
///
/// The lifecycle of a reader is:
/// - construction (outside the lock)
/// - attach + `start` (stream mutex held; the returned channel is awaited
///   once the lock has been dropped)
/// - `state_change` whenever `stopped` or `paused` flips (stream mutex held)
/// - `join` (stream mutex not held, called at most once)
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reader: Send + Sync + 'static {
    /// Second-phase initialisation. Most readers don't need it; it exists for
    ///  initialisation that must not happen while the stream lock is held
    ///  (e.g. registering with a bypass service). Called with the lock held;
    ///  the returned channel, if any, is only awaited after the lock has been
    ///  dropped.
    fn start(&self) -> Option<oneshot::Receiver<anyhow::Result<()>>> {
        None
    }

    /// Notification that the stream may have changed state, because it was
    ///  resumed from a pause or because it has stopped. Called with the
    ///  stream lock held; must not block. The reader must, at its next safe
    ///  boundary, either cease enqueuing (pause) or abort pending I/O (stop).
    ///
    /// A stop received from the network will not necessarily result in a call
    ///  to this function; a stop requested by the user always does.
    fn state_change(&self, state: StreamState);

    /// Wait until the reader's last completion handler has run. Only called
    ///  after a `state_change` with the stream stopped.
    async fn join(&self);
}
