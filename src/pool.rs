//! Bounded per-source connection pool on top of `deadpool`.
//!
//! Checkout waits at most `checkout_timeout` for a slot. A connection goes back
//! to the idle set only through [`PooledConnection::release`]; a guard that is
//! dropped (error, timeout, cancellation) takes its connection out of the pool.

use crate::config::PoolSettings;
use crate::connectors::{Connector, RawResult, SourceConnection};
use crate::error::{HubError, Result};
use deadpool::managed::{self, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult};
use deadpool::Runtime;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Opens connections through a source's [`Connector`], retrying connection errors.
pub struct SourceManager {
    source_id: String,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
}

impl managed::Manager for SourceManager {
    type Type = Box<dyn SourceConnection>;
    type Error = HubError;

    async fn create(&self) -> Result<Box<dyn SourceConnection>> {
        let attempts = self.settings.connect_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.connector.open().await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    attempt += 1;
                    let delay = next_connect_delay(attempt, self.settings.connect_backoff);
                    warn!(
                        "Connecting to {} failed. Retrying in {:?} (Attempt {}/{}): {}",
                        self.source_id, delay, attempt, attempts, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn recycle(&self, _conn: &mut Box<dyn SourceConnection>, metrics: &Metrics) -> RecycleResult<HubError> {
        if metrics.last_used() >= self.settings.idle_timeout {
            return Err(RecycleError::Backend(HubError::connection(
                &self.source_id,
                "idle connection expired",
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ConnectionPool {
    source_id: Arc<str>,
    idle_timeout: Duration,
    pool: Pool<SourceManager>,
}

impl ConnectionPool {
    pub fn new(source_id: impl Into<String>, connector: Arc<dyn Connector>, settings: PoolSettings) -> Result<Self> {
        let source_id: String = source_id.into();
        let manager = SourceManager {
            source_id: source_id.clone(),
            connector,
            settings,
        };
        let pool = Pool::builder(manager)
            .max_size(settings.max_size.max(1))
            .wait_timeout(Some(settings.checkout_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| HubError::InvalidConfig(format!("pool for {}: {}", source_id, e)))?;
        Ok(Self {
            source_id: source_id.into(),
            idle_timeout: settings.idle_timeout,
            pool,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Check out a connection, reusing an idle one when available.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        let conn = self.pool.get().await.map_err(|e| match e {
            PoolError::Backend(e) => e,
            PoolError::Timeout(_) => HubError::ConnectionUnavailable(self.source_id.to_string()),
            other => {
                warn!("Checkout from {} failed: {}", self.source_id, other);
                HubError::ConnectionUnavailable(self.source_id.to_string())
            }
        })?;
        Ok(PooledConnection {
            conn: Some(conn),
            source_id: self.source_id.clone(),
        })
    }

    /// Open a fresh connection outside the pool, e.g. for a probe.
    pub async fn open_unpooled(&self) -> Result<Box<dyn SourceConnection>> {
        managed::Manager::create(self.pool.manager()).await
    }

    /// Drop idle connections unused for longer than the idle timeout.
    /// Returns how many went.
    pub fn evict_idle(&self) -> usize {
        let timeout = self.idle_timeout;
        let evicted = self
            .pool
            .retain(|_, metrics| metrics.last_used() < timeout)
            .removed
            .len();
        if evicted > 0 {
            debug!("Evicted {} idle connection(s) for {}", evicted, self.source_id);
        }
        evicted
    }

    pub fn idle_count(&self) -> usize {
        self.pool.status().available
    }

    /// Slots not held by a checked-out connection.
    pub fn available_slots(&self) -> usize {
        let status = self.pool.status();
        status.max_size - (status.size - status.available)
    }
}

/// Exponential backoff from `base`, plus up to `base` of jitter.
fn next_connect_delay(attempt: u32, base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay = base_ms.saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
    let jitter = if base_ms > 0 {
        rand::thread_rng().gen_range(0..=base_ms)
    } else {
        0
    };
    Duration::from_millis(delay.saturating_add(jitter)).min(MAX_CONNECT_BACKOFF)
}

/// A checked-out connection. Holding it holds one pool slot.
pub struct PooledConnection {
    conn: Option<Object<SourceManager>>,
    source_id: Arc<str>,
}

impl PooledConnection {
    pub async fn probe(&mut self) -> Result<()> {
        match self.conn.as_mut() {
            Some(conn) => conn.probe().await,
            None => Err(HubError::Query("connection already released".into())),
        }
    }

    pub async fn query(&mut self, statement: &str, row_limit: usize) -> Result<RawResult> {
        match self.conn.as_mut() {
            Some(conn) => conn.query(statement, row_limit).await,
            None => Err(HubError::Query("connection already released".into())),
        }
    }

    /// Return the connection to the idle set.
    pub fn release(mut self) {
        // Dropping the object hands it back to deadpool.
        drop(self.conn.take());
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("Discarding connection for {}", self.source_id);
            drop(Object::take(conn));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::testing::MockConnector;
    use std::sync::atomic::Ordering;

    fn settings(max_size: usize) -> PoolSettings {
        PoolSettings {
            max_size,
            idle_timeout: Duration::from_secs(60),
            checkout_timeout: Duration::from_millis(50),
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(1),
        }
    }

    fn pool(connector: Arc<MockConnector>, s: PoolSettings) -> ConnectionPool {
        ConnectionPool::new("src", connector, s).unwrap()
    }

    #[tokio::test]
    async fn test_exhausted_pool_yields_unavailable() {
        let pool = pool(Arc::new(MockConnector::default()), settings(1));
        let _held = pool.checkout().await.unwrap();
        let err = pool.checkout().await.err().unwrap();
        assert!(matches!(err, HubError::ConnectionUnavailable(id) if id == "src"));
    }

    #[tokio::test]
    async fn test_release_reuses_and_drop_discards() {
        let connector = Arc::new(MockConnector::default());
        let pool = pool(connector.clone(), settings(2));

        pool.checkout().await.unwrap().release();
        assert_eq!(pool.idle_count(), 1);
        let conn = pool.checkout().await.unwrap();
        assert_eq!(connector.opens(), 1);

        drop(conn);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available_slots(), 2);
        let _conn = pool.checkout().await.unwrap();
        assert_eq!(connector.opens(), 2);
    }

    #[tokio::test]
    async fn test_idle_connections_expire() {
        let mut s = settings(2);
        s.idle_timeout = Duration::from_millis(0);
        let connector = Arc::new(MockConnector::default());
        let pool = pool(connector.clone(), s);

        pool.checkout().await.unwrap().release();
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.idle_count(), 0);
        let _conn = pool.checkout().await.unwrap();
        assert_eq!(connector.opens(), 2);
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_opens.store(2, Ordering::SeqCst);
        let pool = pool(connector.clone(), settings(1));

        assert!(pool.checkout().await.is_ok());
        assert_eq!(connector.opens(), 3);
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_attempts() {
        let connector = Arc::new(MockConnector::default());
        connector.fail_opens.store(10, Ordering::SeqCst);
        let pool = pool(connector.clone(), settings(1));

        let err = pool.checkout().await.err().unwrap();
        assert!(matches!(err, HubError::Connection { .. }));
        assert_eq!(connector.opens(), 3);
        assert_eq!(pool.available_slots(), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert!(next_connect_delay(30, Duration::from_millis(200)) <= MAX_CONNECT_BACKOFF);
        assert!(next_connect_delay(1, Duration::from_millis(100)) >= Duration::from_millis(100));
    }
}
