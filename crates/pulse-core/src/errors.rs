use std::time::Duration;

use crate::ids::ConnectionId;

/// Caller-facing errors raised by the hub.
/// Only these cross the subsystem boundary; per-subscriber write failures
/// stay internal (see [`WriteError`]).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("Missing message parameter")]
    InvalidMessage,
    #[error("invalid channel key: {0:?}")]
    InvalidChannel(String),
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("registry full: {capacity} connections")]
    RegistryFull { capacity: usize },
    #[error("Not Found")]
    UnknownRoute(String),
    #[error("server shutting down")]
    ShuttingDown,
}

impl HubError {
    /// Whether the caller sent something wrong, as opposed to the hub
    /// refusing a well-formed request.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, Self::RegistryFull { .. } | Self::ShuttingDown)
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::InvalidChannel(_) => "invalid_channel",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::RegistryFull { .. } => "registry_full",
            Self::UnknownRoute(_) => "unknown_route",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

/// A single subscriber's transport rejected a write.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("connection closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
}

impl WriteError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Timeout(_) => "timeout",
        }
    }
}
