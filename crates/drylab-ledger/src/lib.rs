#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **drylab-ledger** – The durable, content-addressed event ledger.
//!
//! A [`Ledger`] is a single embedded SQLite database holding two tables: a
//! content-addressed `blobs` store and a per-`run_id` ordered `events` log.
//! It hashes and deduplicates blobs, validates every publish against a
//! [`SchemaRegistry`], assigns dense per-run sequence numbers, and offers
//! both a point-in-time [`Ledger::replay`] and a live, idle-terminating
//! [`Ledger::subscribe`].

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use drylab_schema::{SchemaError, SchemaRegistry};
use drylab_types::{Blob, EventHeader, EventRow, PublishOutcome, PublishRequest, RejectReason, Sha256, SchemaId};
use sha2::{Digest, Sha256 as Sha256Hasher};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::watch;
use tracing::{debug, info};

/// Name of the environment variable that overrides the default idle window
/// for both `subscribe` and the pipeline watchdog.
pub const IDLE_TIMEOUT_ENV_VAR: &str = "IDLE_TIMEOUT_MS";

/// Default idle window: 5 seconds.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Errors that can occur while operating on a [`Ledger`].
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The underlying database reported an I/O or query error.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    /// A row read back from the ledger failed re-validation against its own
    /// schema. This indicates tampering or a schema registry regression and
    /// is fatal to the read in progress.
    #[error("corrupt ledger: event {sha} (schema {schema}) failed re-validation: {reason}")]
    CorruptLedger {
        /// The offending event's content hash.
        sha: Sha256,
        /// The schema that no longer validates the blob.
        schema: SchemaId,
        /// Why re-validation failed.
        reason: String,
    },
    /// An event row referenced a blob that is no longer present.
    #[error("corrupt ledger: blob {0} referenced by an event is missing")]
    MissingBlob(Sha256),
}

/// Read the idle timeout override from [`IDLE_TIMEOUT_ENV_VAR`], falling
/// back to [`DEFAULT_IDLE_TIMEOUT`] if unset or unparsable.
pub fn idle_timeout_from_env() -> Duration {
    std::env::var(IDLE_TIMEOUT_ENV_VAR)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_IDLE_TIMEOUT)
}

fn sha256_hex(blob: &[u8]) -> Sha256 {
    let mut hasher = Sha256Hasher::new();
    hasher.update(blob);
    hex::encode(hasher.finalize())
}

struct Inner {
    pool: SqlitePool,
    registry: SchemaRegistry,
    idle_timeout: Duration,
    // Bumped on every successful publish; subscribers compare the version
    // they last observed rather than relying on being registered at the
    // exact instant of the bump, so a publish that lands between a
    // subscriber's DB poll and its wait call is never missed.
    watch_tx: watch::Sender<u64>,
}

/// A durable, content-addressed, per-run event ledger.
///
/// Cheap to clone: internally an `Arc` over the pool, schema registry and
/// wake primitive, following the teacher's `Arc`-wrapped-component shape
/// (e.g. `toka_runtime::Runtime` holding `Arc<dyn StorageBackend>`).
#[derive(Clone)]
pub struct Ledger(Arc<Inner>);

impl Ledger {
    /// Open (creating if missing) a SQLite-backed ledger at `path`, using
    /// the default idle timeout (see [`idle_timeout_from_env`]).
    pub async fn open(path: impl AsRef<Path>, registry: SchemaRegistry) -> Result<Self, LedgerError> {
        Self::open_with_idle_timeout(path, registry, idle_timeout_from_env()).await
    }

    /// Open a SQLite-backed ledger at `path` with an explicit idle timeout.
    pub async fn open_with_idle_timeout(
        path: impl AsRef<Path>,
        registry: SchemaRegistry,
        idle_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool, registry, idle_timeout).await
    }

    /// Open an in-memory ledger — useful for tests and the `demos/` binary.
    pub async fn open_in_memory(registry: SchemaRegistry) -> Result<Self, LedgerError> {
        Self::open_in_memory_with_idle_timeout(registry, idle_timeout_from_env()).await
    }

    /// Open an in-memory ledger with an explicit idle timeout.
    pub async fn open_in_memory_with_idle_timeout(
        registry: SchemaRegistry,
        idle_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool, registry, idle_timeout).await
    }

    async fn from_pool(pool: SqlitePool, registry: SchemaRegistry, idle_timeout: Duration) -> Result<Self, LedgerError> {
        Self::migrate(&pool).await?;
        let (watch_tx, _rx) = watch::channel(0u64);
        info!(idle_timeout_ms = idle_timeout.as_millis() as u64, "ledger opened");
        Ok(Self(Arc::new(Inner {
            pool,
            registry,
            idle_timeout,
            watch_tx,
        })))
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        // Best-effort: WAL is unsupported for `:memory:` databases and SQLite
        // simply leaves the journal mode unchanged in that case.
        let _ = sqlx::query("PRAGMA journal_mode = WAL").execute(pool).await;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blobs (sha TEXT PRIMARY KEY, bytes BLOB)",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                run_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                sha TEXT NOT NULL,
                schema TEXT NOT NULL,
                ts INTEGER NOT NULL,
                PRIMARY KEY (run_id, seq)
            )",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// The idle timeout this ledger's `subscribe` streams use.
    pub fn idle_timeout(&self) -> Duration {
        self.0.idle_timeout
    }

    /// Publish a prospective event.
    ///
    /// Validates, deduplicates, assigns a sequence number, and commits —
    /// all within one transaction — then wakes any live subscribers of the
    /// event's run.
    pub async fn publish(&self, req: PublishRequest) -> Result<PublishOutcome, LedgerError> {
        let sha = sha256_hex(&req.blob);

        if let Err(err) = self.0.registry.validate(&req.schema, &req.blob) {
            debug!(run_id = %req.run_id, schema = %req.schema, %err, "publish rejected");
            return Ok(PublishOutcome::Rejected(match err {
                SchemaError::UnknownSchema(_) => RejectReason::UnknownSchema,
                SchemaError::InvalidPayload { reason, .. } => RejectReason::InvalidPayload(reason),
            }));
        }

        let mut tx = self.0.pool.begin().await?;

        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT seq FROM events WHERE run_id = ? AND schema = ? AND sha = ?",
        )
        .bind(&req.run_id)
        .bind(&req.schema)
        .bind(&sha)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            tx.commit().await?;
            debug!(run_id = %req.run_id, schema = %req.schema, sha = %sha, "duplicate publish");
            return Ok(PublishOutcome::Duplicate);
        }

        sqlx::query("INSERT OR IGNORE INTO blobs (sha, bytes) VALUES (?, ?)")
            .bind(&sha)
            .bind(&req.blob)
            .execute(&mut *tx)
            .await?;

        let (next_seq,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE run_id = ?",
        )
        .bind(&req.run_id)
        .fetch_one(&mut *tx)
        .await?;

        let ts = drylab_types::now_ms();

        sqlx::query(
            "INSERT INTO events (run_id, seq, sha, schema, ts) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&req.run_id)
        .bind(next_seq)
        .bind(&sha)
        .bind(&req.schema)
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.0.watch_tx.send_modify(|v| *v = v.wrapping_add(1));
        debug!(run_id = %req.run_id, schema = %req.schema, sha = %sha, seq = next_seq, "committed");

        Ok(PublishOutcome::Committed(sha))
    }

    /// Byte-exact lookup of a blob by its content hash.
    pub async fn cat(&self, sha: &Sha256) -> Result<Option<Blob>, LedgerError> {
        let row = sqlx::query("SELECT bytes FROM blobs WHERE sha = ?")
            .bind(sha)
            .fetch_optional(&self.0.pool)
            .await?;
        Ok(row.map(|r| r.get::<Vec<u8>, _>("bytes")))
    }

    /// Snapshot of every event committed to `run_id` with `seq > from_seq`,
    /// in ascending `seq` order. Never blocks.
    pub async fn replay(&self, run_id: &str, from_seq: i64) -> Result<Vec<EventRow>, LedgerError> {
        self.fetch_rows(run_id, from_seq).await
    }

    /// Open a live subscription to `run_id`, resuming after `from_seq`.
    pub fn subscribe(&self, run_id: impl Into<String>, from_seq: i64) -> Subscription {
        Subscription {
            ledger: self.clone(),
            run_id: run_id.into(),
            cursor: from_seq,
            watch_rx: self.0.watch_tx.subscribe(),
            buffer: std::collections::VecDeque::new(),
        }
    }

    async fn fetch_rows(&self, run_id: &str, from_seq: i64) -> Result<Vec<EventRow>, LedgerError> {
        let rows = sqlx::query(
            "SELECT seq, sha, schema, ts FROM events WHERE run_id = ? AND seq > ? ORDER BY seq",
        )
        .bind(run_id)
        .bind(from_seq)
        .fetch_all(&self.0.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: i64 = row.get("seq");
            let sha: String = row.get("sha");
            let schema: String = row.get("schema");
            let ts: i64 = row.get("ts");

            let blob = self
                .cat(&sha)
                .await?
                .ok_or_else(|| LedgerError::MissingBlob(sha.clone()))?;

            if let Err(err) = self.0.registry.validate(&schema, &blob) {
                return Err(LedgerError::CorruptLedger {
                    sha,
                    schema,
                    reason: err.to_string(),
                });
            }

            events.push(EventRow {
                header: EventHeader { id: sha, schema, ts },
                blob,
                run_id: run_id.to_string(),
                seq,
            });
        }

        Ok(events)
    }
}

/// A live, ordered, idle-terminating view of one run's events.
///
/// Restartable: construct a fresh `Subscription` with `from_seq` equal to
/// the last `seq` you observed to resume exactly where you left off.
pub struct Subscription {
    ledger: Ledger,
    run_id: String,
    cursor: i64,
    watch_rx: watch::Receiver<u64>,
    buffer: std::collections::VecDeque<EventRow>,
}

impl Subscription {
    /// Await the next row in `seq` order.
    ///
    /// Returns `None` once the idle timeout elapses with no new events —
    /// this signals quiescence, not an error.
    pub async fn recv(&mut self) -> Option<Result<EventRow, LedgerError>> {
        loop {
            if let Some(row) = self.buffer.pop_front() {
                self.cursor = row.seq;
                return Some(Ok(row));
            }

            match self.ledger.fetch_rows(&self.run_id, self.cursor).await {
                Ok(rows) if !rows.is_empty() => {
                    self.buffer.extend(rows);
                    continue;
                }
                Ok(_) => {}
                Err(err) => return Some(Err(err)),
            }

            let idle_timeout = self.ledger.idle_timeout();
            match tokio::time::timeout(idle_timeout, self.watch_rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return None, // ledger dropped
                Err(_) => return None,     // idle timeout: stream quiesced
            }
        }
    }

    /// The `run_id` this subscription is reading.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The last `seq` emitted (or the starting cursor if nothing has been
    /// emitted yet).
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Adapt this subscription into a [`futures::Stream`], ending once the
    /// ledger has gone quiet for the idle window.
    pub fn into_stream(self) -> impl futures::Stream<Item = Result<EventRow, LedgerError>> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|item| (item, sub))
        })
    }
}
