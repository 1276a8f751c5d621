//! Connection lifecycle.
//!
//! A [`Connection`] owns one handle registry and, while active, one
//! coordinator bound to one endpoint. It answers the three built-in commands:
//!
//! - `handshake`: returns the local [`ServiceDescriptor`]
//! - `call(target, args)`: a string target names a method of the served
//!   implementation, an integer target names a registered callback
//! - `disconnect`: acknowledged first, then the local side is torn down
//!
//! # Lifecycle
//!
//! `Idle -> Active -> Idle`. Binding a new endpoint while active silently
//! tears down the previous binding first. Teardown resets the registry,
//! closes the coordinator (failing pending calls with
//! [`CourierError::ConnectionClosed`]) and disconnects the endpoint.

use crate::config::{CommandNames, ConnectionConfig};
use crate::coordinator::{CommandCoordinator, CommandExecutor, PendingResponse};
use crate::endpoint::MessageEndpoint;
use crate::implementation::{Implementation, ServiceDescriptor};
use crate::registry::{Handle, HandleRegistry};
use crate::value::{Callback, Value};
use crate::{CourierError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct Session {
    generation: u64,
    endpoint: Arc<dyn MessageEndpoint>,
    coordinator: CommandCoordinator,
}

struct ConnectionInner {
    implementation: Option<Arc<dyn Implementation>>,
    descriptor: ServiceDescriptor,
    registry: Arc<HandleRegistry>,
    session: Mutex<Option<Session>>,
    generations: AtomicU64,
    config: ConnectionConfig,
    state_tx: watch::Sender<bool>,
}

impl ConnectionInner {
    /// Coordinator of the active session, with its generation.
    fn active(&self) -> Option<(u64, CommandCoordinator)> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| (session.generation, session.coordinator.clone()))
    }

    fn send_command(&self, name: &str, args: &[Value]) -> Result<PendingResponse> {
        let (_, coordinator) = self.active().ok_or(CourierError::NotConnected)?;
        Ok(coordinator.send_command(name, args))
    }

    /// Tear down the active session. With `generation` set, only a session of
    /// that generation is torn down.
    fn teardown(&self, generation: Option<u64>) -> bool {
        let session = {
            let mut guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            let current = match (guard.as_ref(), generation) {
                (Some(session), Some(expected)) => session.generation == expected,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !current {
                return false;
            }
            guard.take()
        };
        let Some(session) = session else {
            return false;
        };

        self.registry.reset();
        session.coordinator.close();
        session.endpoint.disconnect();
        self.state_tx.send_replace(false);

        info!(
            "Connection serving {} closed (session {})",
            self.descriptor.name, session.generation
        );
        true
    }

    async fn call_local(&self, args: Vec<Value>) -> Result<Value> {
        let mut args = args.into_iter();
        let target = args.next().unwrap_or_default();
        let call_args = match args.next() {
            Some(Value::List(items)) => items,
            None | Some(Value::Null) => Vec::new(),
            Some(other) => {
                return Err(CourierError::InvalidArguments {
                    message: format!("call arguments must be a list, got {:?}", other),
                })
            }
        };

        match target {
            Value::String(method) => {
                let implementation = match &self.implementation {
                    Some(implementation) if self.descriptor.has_method(&method) => {
                        implementation.clone()
                    }
                    _ => return Err(CourierError::NotCallable { target: method }),
                };
                implementation.invoke(&method, call_args).await
            }
            Value::Number(number) => {
                let callback = number
                    .as_u64()
                    .and_then(|handle| self.registry.lookup_callback(handle))
                    .ok_or_else(|| CourierError::NotCallable {
                        target: number.to_string(),
                    })?;
                callback.call(call_args).await
            }
            other => Err(CourierError::NotCallable {
                target: format!("{:?}", other),
            }),
        }
    }
}

/// Built-in executor for commands received by a connection.
struct ConnectionExecutor {
    inner: Weak<ConnectionInner>,
    generation: u64,
}

#[async_trait::async_trait]
impl CommandExecutor for ConnectionExecutor {
    async fn execute(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let inner = self.inner.upgrade().ok_or(CourierError::NotConnected)?;
        match name {
            CommandNames::CALL => inner.call_local(args).await,
            CommandNames::HANDSHAKE => Ok(inner.descriptor.to_value()),
            CommandNames::DISCONNECT => Ok(Value::Null),
            other => Err(CourierError::UnknownCommand {
                name: other.to_string(),
            }),
        }
    }

    fn response_sent(&self, name: &str) {
        if name != CommandNames::DISCONNECT {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            debug!("Peer requested disconnect");
            inner.teardown(Some(self.generation));
        }
    }
}

/// One side of a connection. Clones share the same state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create an idle connection, optionally serving `implementation`.
    pub fn new(implementation: Option<Arc<dyn Implementation>>) -> Self {
        Self::with_config(implementation, ConnectionConfig::default())
    }

    pub fn serving(implementation: Arc<dyn Implementation>) -> Self {
        Self::new(Some(implementation))
    }

    /// A connection that serves nothing and only calls out.
    pub fn client() -> Self {
        Self::new(None)
    }

    pub fn with_config(
        implementation: Option<Arc<dyn Implementation>>,
        config: ConnectionConfig,
    ) -> Self {
        let descriptor = implementation
            .as_ref()
            .map(|implementation| implementation.descriptor())
            .unwrap_or_else(ServiceDescriptor::none);
        let (state_tx, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak: &Weak<ConnectionInner>| {
            let weak = weak.clone();
            let hydrate = Arc::new(move |handle: Handle| {
                let generation = weak
                    .upgrade()
                    .and_then(|inner| inner.active())
                    .map(|(generation, _)| generation);
                remote_callback(weak.clone(), generation, handle)
            });

            ConnectionInner {
                implementation,
                descriptor,
                registry: Arc::new(HandleRegistry::new(hydrate)),
                session: Mutex::new(None),
                generations: AtomicU64::new(0),
                config,
                state_tx,
            }
        });

        Self { inner }
    }

    /// Bind to `endpoint` and start answering commands.
    pub fn listen(&self, endpoint: impl MessageEndpoint) {
        self.bind(Arc::new(endpoint));
    }

    /// Bind to `endpoint` and perform the handshake.
    ///
    /// Returns the descriptor of the implementation served by the peer.
    pub async fn connect(&self, endpoint: impl MessageEndpoint) -> Result<ServiceDescriptor> {
        let coordinator = self.bind(Arc::new(endpoint));
        let value = coordinator
            .send_command(CommandNames::HANDSHAKE, &[])
            .await?;
        let descriptor = ServiceDescriptor::from_value(&value)?;

        debug!(
            "Handshake complete: {} with {} method(s)",
            descriptor.name,
            descriptor.methods.len()
        );
        Ok(descriptor)
    }

    /// Invoke `method` on the peer's implementation.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.inner
            .send_command(CommandNames::CALL, &[Value::from(method), Value::List(args)])?
            .await
    }

    /// Gracefully disconnect.
    ///
    /// Asks the peer to disconnect and waits for its acknowledgement (bounded
    /// by the configured timeout), then tears down locally. Does nothing when
    /// already idle.
    pub async fn disconnect(&self) {
        let Some((generation, coordinator)) = self.inner.active() else {
            return;
        };

        let ack = coordinator.send_command(CommandNames::DISCONNECT, &[]);
        let result = match self.inner.config.disconnect_timeout {
            Some(limit) => match tokio::time::timeout(limit, ack).await {
                Ok(result) => result.map(|_| ()),
                Err(_) => {
                    warn!(
                        "Peer did not acknowledge disconnect within {:?}, closing anyway",
                        limit
                    );
                    Ok(())
                }
            },
            None => ack.await.map(|_| ()),
        };

        if let Err(e) = result {
            debug!("Disconnect was not acknowledged: {}", e);
        }

        self.inner.teardown(Some(generation));
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow()
    }

    /// Wait until the connection is idle.
    pub async fn closed(&self) {
        let mut state_rx = self.inner.state_tx.subscribe();
        let _ = state_rx.wait_for(|active| !*active).await;
    }

    /// Retire the handle of a local callback previously sent to the peer.
    ///
    /// Later invocations of that handle by the peer fail.
    pub fn release(&self, callback: &Callback) {
        self.inner.registry.release(callback);
    }

    /// Descriptor of the implementation served by this side.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.inner.descriptor
    }

    /// Number of local callbacks currently exposed to the peer.
    pub fn exposed_callbacks(&self) -> usize {
        self.inner.registry.len()
    }

    fn bind(&self, endpoint: Arc<dyn MessageEndpoint>) -> CommandCoordinator {
        if self.inner.teardown(None) {
            debug!("Replaced an active binding");
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let executor = Arc::new(ConnectionExecutor {
            inner: Arc::downgrade(&self.inner),
            generation,
        });
        let coordinator =
            CommandCoordinator::new(endpoint.clone(), self.inner.registry.clone(), executor);

        *self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Session {
            generation,
            endpoint,
            coordinator: coordinator.clone(),
        });
        self.inner.state_tx.send_replace(true);

        info!(
            "Connection serving {} bound (session {})",
            self.inner.descriptor.name, generation
        );
        coordinator
    }
}

impl AsRef<Connection> for Connection {
    fn as_ref(&self) -> &Connection {
        self
    }
}

/// Proxy for a callback living on the peer.
///
/// Handles are only meaningful to the session that received them, so the
/// proxy fails with [`CourierError::NotConnected`] once that session is gone,
/// even if the connection has been bound again since.
fn remote_callback(
    inner: Weak<ConnectionInner>,
    generation: Option<u64>,
    handle: Handle,
) -> Callback {
    Callback::new(move |args: Vec<Value>| {
        let session = inner.upgrade().and_then(|inner| inner.active());
        let pending = match session {
            Some((active, coordinator)) if Some(active) == generation => Ok(coordinator
                .send_command(CommandNames::CALL, &[Value::from(handle), Value::List(args)])),
            _ => Err(CourierError::NotConnected),
        };
        async move {
            match pending {
                Ok(pending) => pending.await,
                Err(e) => Err(e),
            }
        }
    })
}

/// The peer's implementation, as seen from a connected side.
#[derive(Clone)]
pub struct Remote {
    connection: Connection,
    descriptor: ServiceDescriptor,
}

impl Remote {
    pub fn new(connection: Connection, descriptor: ServiceDescriptor) -> Self {
        Self {
            connection,
            descriptor,
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn methods(&self) -> &[String] {
        &self.descriptor.methods
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.descriptor.has_method(method)
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Invoke a method the peer declared in its handshake.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        if !self.has_method(method) {
            return Err(CourierError::NotCallable {
                target: method.to_string(),
            });
        }
        self.connection.call(method, args).await
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }
}

impl AsRef<Connection> for Remote {
    fn as_ref(&self) -> &Connection {
        &self.connection
    }
}
