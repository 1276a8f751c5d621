//! Centralized configuration for Courier.
//!
//! Protocol constants live on `ProtocolConfig`; per-connection tunables live
//! on `ConnectionConfig`.

use std::time::Duration;

/// Wire-level protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Discriminant key carried by command messages.
    pub const COMMAND_KEY: &'static str = "--courier-command";
    /// Discriminant key carried by response messages.
    pub const RESPONSE_KEY: &'static str = "--courier-response";
    /// Key of a callback handle placeholder.
    pub const HANDLE_KEY: &'static str = "--courier-handle";

    /// Descriptor name reported by a side that serves no implementation.
    pub const NO_IMPLEMENTATION_NAME: &'static str = "<none>";

    /// Maximum payload size of a single stream frame.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB
}

/// Built-in command names understood by every connection.
pub struct CommandNames;

impl CommandNames {
    pub const CALL: &'static str = "call";
    pub const HANDSHAKE: &'static str = "handshake";
    pub const DISCONNECT: &'static str = "disconnect";
}

/// Per-connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// How long a graceful disconnect waits for the peer's acknowledgement
    /// before tearing down locally. `None` waits indefinitely.
    pub disconnect_timeout: Option<Duration>,
}

impl ConnectionConfig {
    pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Set the disconnect acknowledgement timeout.
    pub fn with_disconnect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.disconnect_timeout = timeout;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            disconnect_timeout: Some(ConnectionConfig::DEFAULT_DISCONNECT_TIMEOUT),
        }
    }
}
