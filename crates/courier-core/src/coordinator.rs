//! Command/response coordination over a message endpoint.
//!
//! Outgoing commands get a per-coordinator sequence id and a pending result
//! slot; the slot is settled and removed when the matching response
//! arrives. Incoming commands are dispatched to a [`CommandExecutor`] on their
//! own task, and exactly one response is sent back for each.
//!
//! # Thread Safety
//!
//! The pending table is guarded by a `std::sync::Mutex` that is never held
//! across an `.await` or across a send on the endpoint.

use crate::endpoint::MessageEndpoint;
use crate::protocol::{Command, Message, Response};
use crate::registry::HandleRegistry;
use crate::value::Value;
use crate::{CourierError, Result};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// Handles commands received from the peer.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    /// Run the command `name` with rehydrated `args`.
    async fn execute(&self, name: &str, args: Vec<Value>) -> Result<Value>;

    /// Called after the response to a `name` command has been handed to the
    /// endpoint.
    fn response_sent(&self, _name: &str) {}
}

type PendingSender = oneshot::Sender<Result<Value>>;

struct CoordinatorInner {
    endpoint: Arc<dyn MessageEndpoint>,
    registry: Arc<HandleRegistry>,
    executor: Arc<dyn CommandExecutor>,
    next_seq: AtomicU64,
    pending: Mutex<HashMap<u64, PendingSender>>,
    open: AtomicBool,
}

/// Future for the response to one outgoing command.
///
/// Settles with the rehydrated value, the peer's error, or
/// [`CourierError::ConnectionClosed`] if the coordinator closes first.
#[must_use = "the response is only observed by awaiting it"]
pub struct PendingResponse {
    command_id: u64,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingResponse {
    /// Sequence id of the command this response answers.
    pub fn command_id(&self) -> u64 {
        self.command_id
    }
}

impl Future for PendingResponse {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx
            .poll_unpin(cx)
            .map(|received| received.unwrap_or(Err(CourierError::ConnectionClosed)))
    }
}

/// Correlates commands and responses over one endpoint.
#[derive(Clone)]
pub struct CommandCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl CommandCoordinator {
    /// Bind a coordinator to `endpoint` and start listening.
    pub fn new(
        endpoint: Arc<dyn MessageEndpoint>,
        registry: Arc<HandleRegistry>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        let inner = Arc::new(CoordinatorInner {
            endpoint,
            registry,
            executor,
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
        });

        let weak: Weak<CoordinatorInner> = Arc::downgrade(&inner);
        inner.endpoint.on_message(Arc::new(move |message: serde_json::Value| {
            if let Some(inner) = weak.upgrade() {
                CoordinatorInner::message_received(&inner, message);
            }
        }));

        Self { inner }
    }

    /// Send a command and return a future for its response.
    ///
    /// The command is transmitted before this returns. There is no timeout:
    /// if the peer never answers, the future only settles when the
    /// coordinator is closed.
    pub fn send_command(&self, name: &str, args: &[Value]) -> PendingResponse {
        let command_id = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        if !self.is_open() {
            let _ = tx.send(Err(CourierError::ConnectionClosed));
            return PendingResponse { command_id, rx };
        }

        let command = Command {
            command_id,
            name: name.to_string(),
            args: self.inner.registry.dehydrate_args(args),
        };

        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command_id, tx);

        self.inner.send(command.into());

        PendingResponse { command_id, rx }
    }

    /// Stop handling traffic and fail every pending command with
    /// [`CourierError::ConnectionClosed`].
    pub fn close(&self) {
        self.inner.open.store(false, Ordering::SeqCst);
        let drained: Vec<PendingSender> = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, tx)| tx)
            .collect();

        if !drained.is_empty() {
            debug!("Closing coordinator with {} pending command(s)", drained.len());
        }
        for tx in drained {
            let _ = tx.send(Err(CourierError::ConnectionClosed));
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    /// Number of commands still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl CoordinatorInner {
    fn message_received(this: &Arc<Self>, payload: serde_json::Value) {
        if !this.open.load(Ordering::SeqCst) {
            debug!("Ignoring message received by a closed coordinator");
            return;
        }

        debug!("Message received {:?}", payload);
        match Message::from_payload(&payload) {
            Some(Message::Response(response)) => this.dispatch_response(response),
            Some(Message::Command(command)) => {
                let inner = this.clone();
                tokio::spawn(async move { inner.dispatch_command(command).await });
            }
            None => debug!("Ignoring unrecognized message"),
        }
    }

    fn dispatch_response(&self, response: Response) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&response.response_id);

        let Some(tx) = pending else {
            debug!(
                "Received a response for unknown command {}",
                response.response_id
            );
            return;
        };

        let result = if response.error {
            Err(CourierError::from_wire_value(response.value))
        } else {
            Ok(self.registry.rehydrate(&response.value))
        };

        // The caller may have dropped its future; that is not an error.
        let _ = tx.send(result);
    }

    async fn dispatch_command(&self, command: Command) {
        let Command {
            command_id,
            name,
            args,
        } = command;

        let outcome = match self.registry.rehydrate(&args) {
            Value::List(args) => AssertUnwindSafe(self.executor.execute(&name, args))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(CourierError::other(format!("Handler for `{}` panicked", name)))
                }),
            _ => Err(CourierError::InvalidArguments {
                message: format!("arguments of `{}` must be a list", name),
            }),
        };

        let response = match outcome {
            Ok(value) => Response::success(command_id, self.registry.dehydrate(&value)),
            Err(e) => {
                debug!("Command {} (`{}`) failed: {}", command_id, name, e);
                Response::failure(command_id, &e)
            }
        };

        self.send(response.into());
        self.executor.response_sent(&name);
    }

    fn send(&self, message: Message) {
        let payload = message.into_payload();
        debug!("Sending message {:?}", payload);
        self.endpoint.send_message(payload);
    }
}
