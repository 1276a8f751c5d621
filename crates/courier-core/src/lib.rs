//! Courier: remote method invocation over ordered message channels.
//!
//! One side serves an [`Implementation`]; the other connects, learns the
//! served method names from a handshake, and calls them by name. Arguments
//! and results are structured [`Value`]s, and callbacks embedded in them
//! are swapped for opaque handles so the peer can call back into the side
//! that sent them.
//!
//! # Architecture
//!
//! - [`registry`]: callback ↔ handle mapping and payload (de)hydration
//! - [`coordinator`]: command/response correlation over one endpoint
//! - [`connection`]: lifecycle and the built-in `call` / `handshake` /
//!   `disconnect` commands
//! - [`endpoint`]: the channel contract plus memory, stream and
//!   child-process adapters
//!
//! # Example
//!
//! ```ignore
//! use courier_core::{connect_to, endpoint_pair, serve, MethodTable, Value};
//! use std::sync::Arc;
//!
//! let (child, parent) = endpoint_pair();
//! let service = MethodTable::new("Echo").sync_method("echo", |args| {
//!     Ok(args.into_iter().next().unwrap_or_default())
//! });
//! let _server = serve(child, Some(Arc::new(service)));
//!
//! let remote = connect_to(parent).await?;
//! assert_eq!(remote.call("echo", vec![Value::from("hi")]).await?, Value::from("hi"));
//! ```

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod implementation;
pub mod protocol;
pub mod registry;
pub mod value;

pub use config::{CommandNames, ConnectionConfig, ProtocolConfig};
pub use connection::{Connection, Remote};
pub use coordinator::{CommandCoordinator, CommandExecutor, PendingResponse};
pub use endpoint::process::{connect_child, serve_stdio};
pub use endpoint::{
    endpoint_pair, stdio_endpoint, ChildProcessEndpoint, MemoryEndpoint, MessageEndpoint,
    MessageListener, StreamEndpoint,
};
pub use error::{CourierError, Result};
pub use implementation::{Implementation, MethodTable, ServiceDescriptor};
pub use registry::{Handle, HandleRegistry};
pub use value::{Callback, Record, Value};

use std::sync::Arc;

/// Serve `implementation` (or nothing) over `endpoint`.
///
/// The returned connection is already active.
pub fn serve(
    endpoint: impl MessageEndpoint,
    implementation: Option<Arc<dyn Implementation>>,
) -> Connection {
    let connection = Connection::new(implementation);
    connection.listen(endpoint);
    connection
}

/// Connect to the implementation served on the other side of `endpoint`.
pub async fn connect_to(endpoint: impl MessageEndpoint) -> Result<Remote> {
    let connection = Connection::client();
    let descriptor = connection.connect(endpoint).await?;
    Ok(Remote::new(connection, descriptor))
}

/// Serve `implementation` on one end of an in-memory pair and connect to it
/// from the other.
///
/// Returns the serving side together with the connected remote.
pub async fn connect_local(
    implementation: Arc<dyn Implementation>,
) -> Result<(Connection, Remote)> {
    let (served, connecting) = endpoint_pair();
    let connection = serve(served, Some(implementation));
    let remote = connect_to(connecting).await?;
    Ok((connection, remote))
}

/// Gracefully disconnect a [`Connection`] or [`Remote`].
pub async fn disconnect(connection: impl AsRef<Connection>) {
    connection.as_ref().disconnect().await
}
