//! Connection pool contract (C5): bounded parallelism, throttle-aware
//! routing, and backpressure over a set of backend clients.

pub mod resilience;

use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::record::Record;
use crate::schema::model::RelationshipDescriptor;
use resilience::ConcurrencyLimiter;

/// One page of records retrieved via the backend's paging protocol (page
/// number + paging cookie).
#[derive(Debug, Clone)]
pub struct RetrievedPage {
    pub records: Vec<Record>,
    pub next_cookie: Option<String>,
    pub has_more: bool,
    /// Total record count, if the backend reports it up front.
    pub total_hint: Option<u64>,
}

/// Outcome of a single-record write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub old_id: Uuid,
    pub new_id: Uuid,
}

/// Outcome of a bulk (`UpsertMultiple`/`UpdateMultiple`) attempt.
#[derive(Debug, Clone)]
pub enum BulkOutcome {
    /// Bulk is supported; here is one result per input record, in order.
    Results(Vec<Result<WriteOutcome, ClientError>>),
    /// The backend does not support this bulk operation at all.
    NotSupported,
}

/// Errors a client operation can fail with. `Cancelled` and `Fatal` abort
/// the session; the others are per-record or retryable.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("bulk operation not supported for this entity")]
    BulkNotSupported,
    #[error("cannot insert duplicate key")]
    DuplicateKey,
    #[error("throttled")]
    Throttled,
    #[error("record not found")]
    NotFound,
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("{0}")]
    Other(String),
}

/// A single logical backend client. Implementations talk to the source or
/// target environment's bulk API surface.
#[async_trait]
pub trait Client: Send + Sync {
    async fn retrieve_page(
        &self,
        entity: &str,
        page_size: u32,
        page_number: u32,
        cookie: Option<&str>,
    ) -> Result<RetrievedPage, ClientError>;

    async fn retrieve_associations(
        &self,
        relationship: &RelationshipDescriptor,
        page_size: u32,
        page_number: u32,
        cookie: Option<&str>,
    ) -> Result<(Vec<(Uuid, Uuid)>, Option<String>, bool), ClientError>;

    async fn exists(&self, entity: &str, id: Uuid) -> Result<bool, ClientError>;

    async fn upsert(&self, entity: &str, record: &Record) -> Result<WriteOutcome, ClientError>;

    async fn upsert_multiple(
        &self,
        entity: &str,
        records: &[Record],
    ) -> Result<BulkOutcome, ClientError>;

    async fn update(&self, entity: &str, record: &Record) -> Result<WriteOutcome, ClientError>;

    async fn update_multiple(
        &self,
        entity: &str,
        records: &[Record],
    ) -> Result<BulkOutcome, ClientError>;

    async fn associate(
        &self,
        relationship: &RelationshipDescriptor,
        from: Uuid,
        to: &[Uuid],
    ) -> Result<(), ClientError>;
}

/// A scoped-release handle on a pooled client: dropping it returns the
/// permit to the pool. `Client` calls go straight through `Deref`.
pub struct PooledClient {
    client: Arc<dyn Client>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = dyn Client;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

/// The connection pool contract: vends clients under cooperative,
/// DOP-bounded acquisition.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledClient, ClientError>;

    fn dop(&self) -> usize;
}

/// A pool backed by a single shared client and a [`ConcurrencyLimiter`].
/// Sufficient for both the "one HTTP-backed client shared across workers"
/// and "one client per worker" deployment shapes, since the limiter alone
/// enforces DOP regardless of how many underlying connections the client
/// multiplexes internally.
pub struct SharedClientPool {
    client: Arc<dyn Client>,
    limiter: ConcurrencyLimiter,
}

impl SharedClientPool {
    pub fn new(client: Arc<dyn Client>, limiter: ConcurrencyLimiter) -> Self {
        Self { client, limiter }
    }
}

#[async_trait]
impl ConnectionPool for SharedClientPool {
    async fn acquire(&self, cancel: &CancellationToken) -> Result<PooledClient, ClientError> {
        tokio::select! {
            permit = self.limiter.acquire() => Ok(PooledClient {
                client: self.client.clone(),
                _permit: permit,
            }),
            _ = cancel.cancelled() => Err(ClientError::Fatal("cancelled".into())),
        }
    }

    fn dop(&self) -> usize {
        self.limiter.dop()
    }
}
