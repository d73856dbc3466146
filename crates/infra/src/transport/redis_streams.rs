//! Redis Streams transport.
//!
//! Each topic maps to one stream (`<prefix><topic>`); a publish is a single
//! `XADD` carrying the envelope bytes untouched in the `payload` field. The
//! connection is reused across publishes and dropped after any error, so the
//! next publish reconnects.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, instrument, warn};

use stockflow_events::{Transport, TransportError};

const DEFAULT_STREAM_PREFIX: &str = "stockflow:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStreamsConfig {
    /// Prepended to the topic to form the stream key.
    pub stream_prefix: String,
    /// Approximate stream length cap (`MAXLEN ~`); `None` keeps everything.
    pub max_len: Option<u64>,
    /// Connect, read and write timeout for one publish.
    pub io_timeout: Duration,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            max_len: None,
            io_timeout: Duration::from_secs(3),
        }
    }
}

pub struct RedisStreamsTransport {
    client: Arc<redis::Client>,
    config: RedisStreamsConfig,
    connection: Mutex<Option<redis::Connection>>,
}

impl core::fmt::Debug for RedisStreamsTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsTransport")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsTransport {
    /// Does not connect; the first publish does.
    pub fn new(redis_url: impl AsRef<str>, config: RedisStreamsConfig) -> Result<Self, TransportError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| TransportError::Unavailable(format!("invalid redis url: {e}")))?;

        Ok(Self {
            client: Arc::new(client),
            config,
            connection: Mutex::new(None),
        })
    }

    pub fn stream_key(&self, topic: &str) -> String {
        format!("{}{}", self.config.stream_prefix, topic)
    }

    fn connect(&self) -> Result<redis::Connection, TransportError> {
        let timeout = self.config.io_timeout;
        let conn = self
            .client
            .get_connection_with_timeout(timeout)
            .map_err(|e| map_redis_error(e, timeout))?;
        conn.set_read_timeout(Some(timeout))
            .map_err(|e| map_redis_error(e, timeout))?;
        conn.set_write_timeout(Some(timeout))
            .map_err(|e| map_redis_error(e, timeout))?;
        Ok(conn)
    }

    fn xadd(&self, conn: &mut redis::Connection, stream_key: &str, topic: &str, payload: &[u8]) -> redis::RedisResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream_key);
        if let Some(max_len) = self.config.max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*")
            .arg("topic")
            .arg(topic)
            .arg("payload")
            .arg(payload)
            .query(conn)
    }
}

impl Transport for RedisStreamsTransport {
    #[instrument(skip(self, payload), fields(bytes = payload.len()), err)]
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let stream_key = self.stream_key(topic);
        let mut slot = self.connection.lock().unwrap_or_else(PoisonError::into_inner);

        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connect()?,
        };

        match self.xadd(&mut conn, &stream_key, topic, payload) {
            Ok(entry_id) => {
                debug!(stream_key = %stream_key, entry_id = %entry_id, "appended to stream");
                *slot = Some(conn);
                Ok(())
            }
            Err(e) => {
                warn!(stream_key = %stream_key, error = %e, "XADD failed; dropping connection");
                Err(map_redis_error(e, self.config.io_timeout))
            }
        }
    }
}

fn map_redis_error(err: redis::RedisError, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(timeout)
    } else if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
        TransportError::Unavailable(err.to_string())
    } else {
        TransportError::Rejected(err.to_string())
    }
}
