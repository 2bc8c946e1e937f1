use std::path::Path;

use async_stream::stream;
use futures::Stream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::{ChangeEvent, ChangeHandler, WatchError, Watcher};

/// Pushes every event into the channel behind a [`watch_stream`] stream.
pub struct StreamForwarder {
    sender: UnboundedSender<ChangeEvent>,
    cancellation_token: CancellationToken,
}

impl StreamForwarder {
    /// Ends the stream. Events already queued are discarded.
    pub fn close(&self) {
        self.cancellation_token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancellation_token.is_cancelled() || self.sender.is_closed()
    }
}

impl ChangeHandler for StreamForwarder {
    fn handle(&self, event: &ChangeEvent) {
        if self.cancellation_token.is_cancelled() {
            return;
        }
        // The receiver only goes away together with the stream.
        let _ = self.sender.send(event.clone());
    }
}

impl Drop for StreamForwarder {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Watches `path` on the shared registry and returns its events as a stream.
///
/// The stream ends when the watcher is dropped or
/// [`StreamForwarder::close`] is called through
/// [`Watcher::handler`].
pub fn watch_stream(
    path: impl AsRef<Path>,
) -> Result<
    (
        Watcher<StreamForwarder>,
        impl Stream<Item = ChangeEvent> + Send + 'static,
    ),
    WatchError,
> {
    let (forwarder, stream) = forwarder();
    Ok((Watcher::new(path, forwarder)?, stream))
}

pub(crate) fn forwarder() -> (StreamForwarder, impl Stream<Item = ChangeEvent> + Send + 'static) {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let cancellation_token = CancellationToken::new();
    let cancel_token = cancellation_token.clone();

    let events = stream! {
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => {
                    break;
                }
                val = receiver.recv() => {
                    match val {
                        Some(event) => yield event,
                        None => break,
                    }
                }
            }
        }
    };

    (
        StreamForwarder {
            sender,
            cancellation_token,
        },
        events,
    )
}
