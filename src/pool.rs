use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool::managed::{Object, Pool, PoolError, RecycleError, RecycleResult, Timeouts};
use deadpool::Runtime;
use lapin::options::ConfirmSelectOptions;
use lapin::Channel;
use tracing::debug;

use crate::config::DriverConfig;
use crate::engine::establish_connection;
use crate::errors::{connection_error, MessagingError};

/// A live AMQP connection with its single channel, as kept by the pool.
pub struct PooledConnection {
    connection: lapin::Connection,
    channel: Channel,
    created_at: Instant,
    last_released_at: Instant,
    invalidated: bool,
}

impl PooledConnection {
    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

/// Creates pooled connections and discards the ones that are invalidated,
/// too old or have sat idle for too long.
pub struct ConnectionManager {
    config: Arc<DriverConfig>,
    confirm_mode: bool,
}

#[async_trait::async_trait]
impl deadpool::managed::Manager for ConnectionManager {
    type Type = PooledConnection;
    type Error = MessagingError;

    async fn create(&self) -> Result<PooledConnection, MessagingError> {
        let connection = establish_connection(&self.config, false).await?;
        let channel = connection.create_channel().await.map_err(connection_error)?;
        if self.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(connection_error)?;
        }
        let now = Instant::now();
        Ok(PooledConnection {
            connection,
            channel,
            created_at: now,
            last_released_at: now,
            invalidated: false,
        })
    }

    async fn recycle(&self, conn: &mut PooledConnection) -> RecycleResult<MessagingError> {
        if !conn.connection.status().connected() {
            return Err(RecycleError::Message("connection no longer open".to_string()));
        }
        match discard_reason(
            conn.created_at.elapsed(),
            conn.last_released_at.elapsed(),
            conn.invalidated,
            Duration::from_secs_f64(self.config.pool_recycle),
            Duration::from_secs_f64(self.config.pool_stale),
        ) {
            Some(reason) => {
                debug!(reason, "discarding pooled connection");
                Err(RecycleError::Message(reason.to_string()))
            }
            None => Ok(()),
        }
    }
}

/// Why a pooled connection must not be handed out again, if any.
fn discard_reason(
    age: Duration,
    idle: Duration,
    invalidated: bool,
    recycle: Duration,
    stale: Duration,
) -> Option<&'static str> {
    if invalidated {
        Some("invalidated by connectivity error")
    } else if age >= recycle {
        Some("connection older than pool_recycle")
    } else if idle >= stale {
        Some("connection idle longer than pool_stale")
    } else {
        None
    }
}

pub type ConnectionPool = Pool<ConnectionManager>;

/// Build one of the two engine pools. The size bound covers the configured
/// overflow allowance as well.
pub fn build_pool(
    config: Arc<DriverConfig>,
    confirm_mode: bool,
) -> Result<ConnectionPool, MessagingError> {
    let max_size = config.pool_max_size + config.pool_max_overflow;
    Pool::builder(ConnectionManager {
        config,
        confirm_mode,
    })
    .max_size(max_size)
    .runtime(Runtime::Tokio1)
    .build()
    .map_err(|e| MessagingError::Connection(format!("failed to build connection pool: {e}")))
}

/// Acquire a connection lease, waiting at most `wait` (the configured
/// `pool_timeout` when `None`).
pub async fn acquire(
    pool: &ConnectionPool,
    config: &DriverConfig,
    wait: Option<Duration>,
) -> Result<ConnectionLease, MessagingError> {
    let wait = match wait {
        Some(remaining) => remaining.min(config.pool_timeout_duration()),
        None => config.pool_timeout_duration(),
    };
    let timeouts = Timeouts {
        wait: Some(wait),
        create: Some(wait),
        recycle: Some(wait),
    };
    let object = pool.timeout_get(&timeouts).await.map_err(|e| match e {
        PoolError::Timeout(_) => MessagingError::PoolTimeout,
        PoolError::Backend(err) => err,
        other => MessagingError::Connection(format!("connection pool failure: {other}")),
    })?;
    Ok(ConnectionLease {
        inner: Some(object),
    })
}

/// Scoped lease of a pooled connection. Returned to the pool on drop unless
/// it was invalidated, in which case it is closed and discarded instead.
pub struct ConnectionLease {
    inner: Option<Object<ConnectionManager>>,
}

impl ConnectionLease {
    pub fn channel(&self) -> &Channel {
        // inner is only None after drop
        self.inner
            .as_ref()
            .expect("connection lease used after release")
            .channel()
    }

    /// Mark the leased connection as unusable. It will be closed instead of
    /// returned to the pool.
    pub fn invalidate(&mut self) {
        if let Some(obj) = self.inner.as_mut() {
            obj.invalidated = true;
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(mut obj) = self.inner.take() {
            if obj.invalidated {
                drop(Object::take(obj));
            } else {
                obj.last_released_at = Instant::now();
            }
        }
    }
}
