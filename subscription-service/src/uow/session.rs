//! One database transaction shared by every repository of a unit of work.

use crate::error::{BillingError, BillingResult};
use sqlx::postgres::{PgConnection, PgPool};
use sqlx::{Postgres, Transaction};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument};

type ActiveTransaction = Option<Transaction<'static, Postgres>>;

/// Transactional session.
///
/// Statements are serialized through the mutex; a connection guard must be
/// dropped before the next statement on the same session is issued. Once the
/// session is committed or rolled back every further statement fails.
pub struct Session {
    tx: Mutex<ActiveTransaction>,
    queries: AtomicUsize,
}

/// Exclusive access to the session's connection for one statement.
pub struct SessionConnection<'a> {
    guard: MutexGuard<'a, ActiveTransaction>,
}

impl Deref for SessionConnection<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self.guard.as_ref() {
            Some(tx) => &**tx,
            None => unreachable!("session connection built without a transaction"),
        }
    }
}

impl DerefMut for SessionConnection<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self.guard.as_mut() {
            Some(tx) => &mut **tx,
            None => unreachable!("session connection built without a transaction"),
        }
    }
}

fn inactive() -> BillingError {
    BillingError::Database(anyhow::anyhow!("transaction is no longer active"))
}

impl Session {
    /// Open a transaction on a pooled connection.
    #[instrument(skip(pool))]
    pub async fn begin(pool: &PgPool) -> BillingResult<Self> {
        let tx = pool.begin().await.map_err(|e| {
            BillingError::Database(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            queries: AtomicUsize::new(0),
        })
    }

    /// Connection for a read. Counted for N+1 diagnostics.
    pub async fn read(&self) -> BillingResult<SessionConnection<'_>> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.connection().await
    }

    /// Connection for a write.
    pub async fn connection(&self) -> BillingResult<SessionConnection<'_>> {
        let guard = self.tx.lock().await;
        if guard.is_none() {
            return Err(inactive());
        }
        Ok(SessionConnection { guard })
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn reset_query_count(&self) {
        self.queries.store(0, Ordering::Relaxed);
    }

    pub async fn is_active(&self) -> bool {
        self.tx.lock().await.is_some()
    }

    /// Discard everything written in this session. A no-op once closed.
    pub async fn rollback(&self) -> BillingResult<()> {
        let tx = self.tx.lock().await.take();
        match tx {
            Some(tx) => {
                tx.rollback().await.map_err(|e| {
                    BillingError::Database(anyhow::anyhow!("Failed to roll back: {}", e))
                })?;
                debug!("Transaction rolled back");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub async fn commit(&self) -> BillingResult<()> {
        let tx = self.tx.lock().await.take().ok_or_else(inactive)?;
        tx.commit()
            .await
            .map_err(|e| BillingError::Database(anyhow::anyhow!("Failed to commit: {}", e)))?;
        debug!("Transaction committed");
        Ok(())
    }
}
