//! Event-stream fan-out server.
//!
//! Subscribers open a long-lived `text/event-stream` response on a channel;
//! a broadcast on that channel is written to every open stream.

pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod server;

pub use channel::{Channel, ChannelStore, SubscriberStream, Subscription};
pub use config::{ChannelSettings, ConfigError, ServerConfig};
pub use dispatcher::{BroadcastDispatcher, FanOut};
pub use error::HttpError;
pub use registry::ConnectionRegistry;
pub use server::{build_router, start, AppState, ServerHandle};
