//! Child-process endpoints.
//!
//! The parent spawns a worker with piped stdin/stdout and talks to it through
//! a [`ChildProcessEndpoint`]; the worker talks back through
//! [`stdio_endpoint`]. Disconnecting the parent side closes the child's
//! stdin once queued messages are flushed, which the worker observes as EOF.

use super::{MessageEndpoint, MessageListener, StreamEndpoint};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, Remote};
use crate::implementation::Implementation;
use crate::{CourierError, Result};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;

/// Parent-side endpoint for a spawned worker process.
pub struct ChildProcessEndpoint {
    stream: StreamEndpoint,
    child: Mutex<Child>,
    pid: Option<u32>,
}

impl ChildProcessEndpoint {
    /// Spawn `command` with piped stdio and wrap it as an endpoint.
    ///
    /// The child is killed if the endpoint is dropped while it is still running.
    pub fn spawn(command: &mut Command) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| CourierError::Io {
            message: "Child process stdin is not piped".to_string(),
            source: None,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| CourierError::Io {
            message: "Child process stdout is not piped".to_string(),
            source: None,
        })?;

        debug!("Spawned child process endpoint (PID {:?})", pid);

        Ok(Self {
            stream: StreamEndpoint::new(stdout, stdin),
            child: Mutex::new(child),
            pid,
        })
    }

    /// OS process id of the child, if it was available at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait for the child to exit.
    pub async fn wait(&self) -> Result<ExitStatus> {
        let mut child = self.child.lock().await;
        Ok(child.wait().await?)
    }

    /// Wait until the child's stdout has closed.
    pub async fn closed(&self) {
        self.stream.closed().await
    }
}

impl MessageEndpoint for ChildProcessEndpoint {
    fn on_message(&self, listener: MessageListener) {
        self.stream.on_message(listener)
    }

    fn send_message(&self, message: serde_json::Value) {
        self.stream.send_message(message)
    }

    fn disconnect(&self) {
        self.stream.disconnect()
    }
}

/// Child-side endpoint over this process's stdin/stdout.
///
/// Nothing else may write to stdout while it is in use.
pub fn stdio_endpoint() -> StreamEndpoint {
    StreamEndpoint::new(tokio::io::stdin(), tokio::io::stdout())
}

/// Serve `implementation` to the parent process over stdio.
///
/// Returns the connection together with the endpoint so the caller can wait
/// for either a graceful disconnect or the parent going away.
pub fn serve_stdio(
    implementation: Arc<dyn Implementation>,
    config: ConnectionConfig,
) -> (Connection, StreamEndpoint) {
    let endpoint = stdio_endpoint();
    let connection = Connection::with_config(Some(implementation), config);
    connection.listen(endpoint.clone());
    (connection, endpoint)
}

/// Spawn a worker and connect to the implementation it serves.
pub async fn connect_child(command: &mut Command) -> Result<(Remote, Arc<ChildProcessEndpoint>)> {
    let endpoint = Arc::new(ChildProcessEndpoint::spawn(command)?);
    let connection = Connection::client();
    let descriptor = connection.connect(endpoint.clone()).await?;
    Ok((Remote::new(connection, descriptor), endpoint))
}
