//! Framed stream endpoint.
//!
//! Wraps an async reader/writer pair. Each payload travels as one
//! length-prefixed JSON frame (see [`crate::protocol`]).
//!
//! # Tasks
//!
//! - **Reader**: decodes frames and hands payloads to the listeners. Payloads
//!   that arrive before the first listener registers are buffered and
//!   replayed to it.
//! - **Writer**: drains an unbounded queue in order. On disconnect the queue
//!   is closed rather than discarded, so messages already sent (such as the
//!   acknowledgement of a disconnect command) still reach the peer.

use super::{MessageEndpoint, MessageListener};
use crate::protocol::{read_frame, write_frame};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

#[derive(Default)]
struct ListenerState {
    registered: Vec<MessageListener>,
    backlog: Vec<serde_json::Value>,
}

struct StreamInner {
    listeners: Mutex<ListenerState>,
    /// Serializes delivery so backlog replay cannot interleave with new frames.
    delivery: Mutex<()>,
    outbound: Mutex<Option<mpsc::UnboundedSender<serde_json::Value>>>,
    shutdown_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    flushed_rx: watch::Receiver<bool>,
}

impl StreamInner {
    fn deliver(&self, message: serde_json::Value) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let listeners = {
            let mut state = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            if state.registered.is_empty() {
                state.backlog.push(message);
                return;
            }
            state.registered.clone()
        };

        for listener in listeners {
            listener(message.clone());
        }
    }
}

/// Endpoint speaking length-prefixed JSON over an async byte stream.
#[derive(Clone)]
pub struct StreamEndpoint {
    inner: Arc<StreamInner>,
}

impl StreamEndpoint {
    /// Start the reader and writer tasks. Must be called within a tokio runtime.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (closed_tx, closed_rx) = watch::channel(false);
        let (flushed_tx, flushed_rx) = watch::channel(false);

        let inner = Arc::new(StreamInner {
            listeners: Mutex::new(ListenerState::default()),
            delivery: Mutex::new(()),
            outbound: Mutex::new(Some(outbound_tx)),
            shutdown_tx,
            closed_rx,
            flushed_rx,
        });

        tokio::spawn(Self::read_loop(reader, inner.clone(), shutdown_rx, closed_tx));
        tokio::spawn(Self::write_loop(writer, outbound_rx, flushed_tx));

        Self { inner }
    }

    /// Wait until the reader has stopped (EOF, read error, or disconnect).
    pub async fn closed(&self) {
        let mut closed_rx = self.inner.closed_rx.clone();
        let _ = closed_rx.wait_for(|closed| *closed).await;
    }

    /// Check whether the reader has stopped.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed_rx.borrow()
    }

    /// Wait until the writer has written everything queued before
    /// [`MessageEndpoint::disconnect`] and shut the stream down.
    pub async fn flushed(&self) {
        let mut flushed_rx = self.inner.flushed_rx.clone();
        let _ = flushed_rx.wait_for(|flushed| *flushed).await;
    }

    async fn read_loop<R: AsyncRead + Unpin>(
        mut reader: R,
        inner: Arc<StreamInner>,
        mut shutdown_rx: watch::Receiver<bool>,
        closed_tx: watch::Sender<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            debug!("Stream endpoint reached EOF");
                            break;
                        }
                        Err(e) => {
                            warn!("Stream endpoint read failed: {}", e);
                            break;
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    break;
                }
            };

            match serde_json::from_slice::<serde_json::Value>(&frame) {
                Ok(message) => inner.deliver(message),
                Err(e) => warn!("Dropping undecodable frame: {}", e),
            }
        }

        let _ = closed_tx.send(true);
    }

    async fn write_loop<W: AsyncWrite + Unpin>(
        mut writer: W,
        mut outbound_rx: mpsc::UnboundedReceiver<serde_json::Value>,
        flushed_tx: watch::Sender<bool>,
    ) {
        while let Some(message) = outbound_rx.recv().await {
            let bytes = match serde_json::to_vec(&message) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping unserializable message: {}", e);
                    continue;
                }
            };

            if let Err(e) = write_frame(&mut writer, &bytes).await {
                warn!("Stream endpoint write failed: {}", e);
                break;
            }
        }

        let _ = writer.shutdown().await;
        let _ = flushed_tx.send(true);
    }
}

impl MessageEndpoint for StreamEndpoint {
    fn on_message(&self, listener: MessageListener) {
        let _delivery = self.inner.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let backlog = {
            let mut state = self.inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            state.registered.push(listener.clone());
            std::mem::take(&mut state.backlog)
        };

        for message in backlog {
            listener(message);
        }
    }

    fn send_message(&self, message: serde_json::Value) {
        let outbound = self.inner.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("Dropping message: stream writer has stopped");
                }
            }
            None => debug!("Dropping message sent on a disconnected stream endpoint"),
        }
    }

    fn disconnect(&self) {
        // Dropping the sender lets the writer flush its queue and exit.
        let sender = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_some() {
            debug!("Disconnecting stream endpoint");
        }
        let _ = self.inner.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn linked_pair() -> (StreamEndpoint, StreamEndpoint) {
        let (a, b) = duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            StreamEndpoint::new(a_read, a_write),
            StreamEndpoint::new(b_read, b_write),
        )
    }

    fn channel_listener(endpoint: &StreamEndpoint) -> UnboundedReceiver<serde_json::Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        endpoint.on_message(Arc::new(move |message: serde_json::Value| {
            let _ = tx.send(message);
        }));
        rx
    }

    async fn next(rx: &mut UnboundedReceiver<serde_json::Value>) -> serde_json::Value {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("listener channel closed")
    }

    #[tokio::test]
    async fn test_messages_cross_in_order() {
        let (one, two) = linked_pair();
        let mut received = channel_listener(&two);

        for i in 0..5 {
            one.send_message(json!({"seq": i}));
        }

        for i in 0..5 {
            assert_eq!(next(&mut received).await, json!({"seq": i}));
        }
    }

    #[tokio::test]
    async fn test_early_messages_are_replayed_to_first_listener() {
        let (one, two) = linked_pair();
        one.send_message(json!("early"));

        // Give the reader a chance to buffer the frame before anyone listens.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut received = channel_listener(&two);
        one.send_message(json!("late"));

        assert_eq!(next(&mut received).await, json!("early"));
        assert_eq!(next(&mut received).await, json!("late"));
    }

    #[tokio::test]
    async fn test_disconnect_flushes_queued_messages() {
        let (one, two) = linked_pair();
        let mut received = channel_listener(&two);

        one.send_message(json!("last words"));
        one.disconnect();
        one.disconnect();
        one.send_message(json!("never sent"));

        tokio::time::timeout(Duration::from_secs(5), one.flushed())
            .await
            .expect("writer should flush and stop");
        assert_eq!(next(&mut received).await, json!("last words"));

        // The writer shut down, so the peer observes EOF.
        tokio::time::timeout(Duration::from_secs(5), two.closed())
            .await
            .expect("peer should observe EOF");
        assert!(two.is_closed());
        assert!(received.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_resolves_after_local_disconnect() {
        let (one, _two) = linked_pair();
        assert!(!one.is_closed());

        one.disconnect();
        tokio::time::timeout(Duration::from_secs(5), one.closed())
            .await
            .expect("reader should stop after disconnect");
    }
}
