//! Broker adapters implementing [`stockflow_events::Transport`].

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConfig, RedisStreamsTransport};
