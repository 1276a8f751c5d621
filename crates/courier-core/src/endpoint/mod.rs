//! Message endpoints.
//!
//! An endpoint is one side of an ordered, lossless channel that carries
//! structured JSON payloads. The connection machinery needs nothing beyond
//! the three operations of [`MessageEndpoint`].
//!
//! # Adapters
//!
//! - **Memory**: a linked pair of endpoints in the same process
//! - **Stream**: length-prefixed JSON frames over any async reader/writer
//! - **Process**: a stream endpoint over a child's stdin/stdout (parent side)
//!   or over the current process's stdio (child side)

pub mod memory;
pub mod process;
pub mod stream;

pub use memory::{endpoint_pair, MemoryEndpoint};
pub use process::{stdio_endpoint, ChildProcessEndpoint};
pub use stream::StreamEndpoint;

use std::sync::Arc;

/// Callback invoked once per inbound payload.
pub type MessageListener = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// The minimal channel contract needed by a connection.
pub trait MessageEndpoint: Send + Sync + 'static {
    /// Register a listener for inbound payloads. Registrations accumulate.
    fn on_message(&self, listener: MessageListener);

    /// Transmit one payload. Order is preserved; there is no acknowledgement.
    fn send_message(&self, message: serde_json::Value);

    /// Release the underlying channel. Calling this more than once is a no-op.
    fn disconnect(&self);
}

impl<E: MessageEndpoint + ?Sized> MessageEndpoint for Arc<E> {
    fn on_message(&self, listener: MessageListener) {
        (**self).on_message(listener)
    }

    fn send_message(&self, message: serde_json::Value) {
        (**self).send_message(message)
    }

    fn disconnect(&self) {
        (**self).disconnect()
    }
}
