//! Durable queue store backed by SQLite.
//!
//! Every operation runs in one `BEGIN IMMEDIATE` transaction that first
//! applies the staleness recovery rule. `IMMEDIATE` takes the write lock up
//! front, so claims stay exclusive even when a foreground process and a
//! background wake open the same file. Transactions run on the blocking pool
//! so a busy wait on the lock never stalls the async runtime.

mod schema;

pub use schema::SCHEMA_VERSION;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};

use super::{StoreOptions, superseded};
use crate::domain::{ClaimId, ItemId, ItemState, Metadata, StateFilter, StoreError, UploadItem};
use crate::observability::QueueCounts;
use crate::ports::{Clock, IdGenerator, QueueStore};

const ITEM_COLUMNS: &str = "id, content_ref, metadata, state, attempts, last_error, not_before, \
     claimed_at, enqueued_at, claim_id";

/// How long a writer waits for another connection's lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteQueueStore {
    /// rusqlite::Connection is not Sync.
    conn: Arc<Mutex<Connection>>,
    /// For error messages.
    path: PathBuf,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl std::fmt::Debug for SqliteQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteQueueStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SqliteQueueStore {
    /// Open or create a store at the given path, then recover stale claims
    /// left behind by a crashed process.
    pub async fn open(
        path: &Path,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone).map_err(|e| StoreError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL survives unclean shutdown and lets readers run during a write.
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.busy_timeout(BUSY_TIMEOUT)?;

            schema::migrate(&conn)?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(StoreError::io)??;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            options,
            clock,
            ids,
        };

        let recovered = store.recover_stale().await?;
        tracing::info!(
            path = %store.path.display(),
            recovered,
            "Opened queue store"
        );
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory(
        options: StoreOptions,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
            options,
            clock,
            ids,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on the blocking pool with the connection locked.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, DateTime<Utc>, &StoreOptions) -> Result<T, StoreError>
            + Send
            + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let clock = Arc::clone(&self.clock);
        let options = self.options.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(StoreError::io)?;
            f(&mut conn, clock.now(), &options)
        })
        .await
        .map_err(StoreError::io)?
    }

    /// Run `f` inside one immediate transaction, after stale recovery.
    async fn with_tx<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction<'_>, DateTime<Utc>, &StoreOptions) -> Result<T, StoreError>
            + Send
            + 'static,
    {
        self.blocking(move |conn, now, options| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            recover_stale(&tx, now, options.stale_after())?;
            let value = f(&tx, now, options)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }
}

/// The recovery rule: revert `InFlight` items claimed at or before
/// `now - stale_after`.
fn recover_stale(
    tx: &Transaction<'_>,
    now: DateTime<Utc>,
    stale_after: chrono::Duration,
) -> Result<usize, StoreError> {
    let threshold = now
        .timestamp_millis()
        .saturating_sub(stale_after.num_milliseconds());
    let recovered = tx.execute(
        "UPDATE upload_items SET state = 'pending', claimed_at = NULL, claim_id = NULL
         WHERE state = 'in_flight' AND (claimed_at IS NULL OR claimed_at <= ?1)",
        [threshold],
    )?;
    if recovered > 0 {
        tracing::warn!(recovered, "Recovered stale in-flight items");
    }
    Ok(recovered)
}

fn load_item(tx: &Transaction<'_>, id: ItemId) -> Result<Option<UploadItem>, StoreError> {
    let raw = tx
        .query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM upload_items WHERE id = ?1"),
            [id.to_string()],
            RawItem::from_row,
        )
        .optional()?;
    raw.map(RawItem::into_item).transpose()
}

/// Rows matching `where_clause`, in claim order (FIFO, insertion breaks ties).
fn load_items(
    tx: &Transaction<'_>,
    where_clause: &str,
    limit: Option<usize>,
    params: impl rusqlite::Params,
) -> Result<Vec<UploadItem>, StoreError> {
    let limit = limit.map_or(-1, |n| n.min(i64::MAX as usize) as i64);
    let mut stmt = tx.prepare(&format!(
        "SELECT {ITEM_COLUMNS} FROM upload_items WHERE {where_clause}
         ORDER BY enqueued_at, seq LIMIT {limit}"
    ))?;
    let raws = stmt
        .query_map(params, RawItem::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(RawItem::into_item).collect()
}

/// Persist the mutable fields of an item.
fn write_state(tx: &Transaction<'_>, item: &UploadItem) -> Result<(), StoreError> {
    let state = item
        .state
        .filter()
        .map(StateFilter::as_str)
        .ok_or_else(|| StoreError::Corrupt {
            id: item.id.to_string(),
            reason: "done items are deleted, not written".to_string(),
        })?;
    tx.execute(
        "UPDATE upload_items
         SET state = ?1, attempts = ?2, last_error = ?3, not_before = ?4, claimed_at = ?5,
             claim_id = ?6
         WHERE id = ?7",
        rusqlite::params![
            state,
            item.attempts,
            item.last_error,
            item.not_before.map(|t| t.timestamp_millis()),
            item.claimed_at.map(|t| t.timestamp_millis()),
            item.claim_id.map(|c| c.to_string()),
            item.id.to_string(),
        ],
    )?;
    Ok(())
}

/// A row as stored, before validation.
struct RawItem {
    id: String,
    content_ref: String,
    metadata: String,
    state: String,
    attempts: u32,
    last_error: Option<String>,
    not_before: Option<i64>,
    claimed_at: Option<i64>,
    enqueued_at: i64,
    claim_id: Option<String>,
}

impl RawItem {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content_ref: row.get(1)?,
            metadata: row.get(2)?,
            state: row.get(3)?,
            attempts: row.get(4)?,
            last_error: row.get(5)?,
            not_before: row.get(6)?,
            claimed_at: row.get(7)?,
            enqueued_at: row.get(8)?,
            claim_id: row.get(9)?,
        })
    }

    fn into_item(self) -> Result<UploadItem, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        };
        let millis = |ms: i64| {
            DateTime::<Utc>::from_timestamp_millis(ms)
                .ok_or_else(|| corrupt(format!("timestamp out of range: {ms}")))
        };

        let id: ItemId = self.id.parse().map_err(|e| corrupt(format!("{e}")))?;
        let claim_id: Option<ClaimId> = self
            .claim_id
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|e| corrupt(format!("{e}")))?;
        let metadata: Metadata =
            serde_json::from_str(&self.metadata).map_err(|e| corrupt(format!("metadata: {e}")))?;
        let state = match StateFilter::parse(&self.state) {
            Some(StateFilter::Pending) => ItemState::Pending,
            Some(StateFilter::InFlight) => ItemState::InFlight,
            Some(StateFilter::Failed) => ItemState::Failed {
                attempts: self.attempts,
                last_error: self.last_error.clone().unwrap_or_default(),
            },
            None => return Err(corrupt(format!("unknown state {:?}", self.state))),
        };

        Ok(UploadItem {
            id,
            content_ref: self.content_ref.clone(),
            metadata,
            state,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
            not_before: self.not_before.map(millis).transpose()?,
            claimed_at: self.claimed_at.map(millis).transpose()?,
            claim_id,
            enqueued_at: millis(self.enqueued_at)?,
        })
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, content_ref: &str, metadata: Metadata) -> Result<ItemId, StoreError> {
        let metadata_json = serde_json::to_string(&metadata).map_err(StoreError::io)?;
        let id = self.ids.generate_item_id();
        let content = content_ref.to_string();

        self.with_tx(move |tx, now, options| {
            let total: i64 =
                tx.query_row("SELECT COUNT(*) FROM upload_items", [], |row| row.get(0))?;
            if total as usize >= options.capacity {
                return Err(StoreError::StorageFull {
                    capacity: options.capacity,
                });
            }
            tx.execute(
                "INSERT INTO upload_items (id, content_ref, metadata, state, attempts, enqueued_at)
                 VALUES (?1, ?2, ?3, 'pending', 0, ?4)",
                rusqlite::params![id.to_string(), content, metadata_json, now.timestamp_millis()],
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(item_id = %id, content_ref, "Enqueued upload");
        Ok(id)
    }

    async fn count(&self, filter: StateFilter) -> Result<usize, StoreError> {
        self.with_tx(move |tx, _, _| {
            let n: i64 = tx.query_row(
                "SELECT COUNT(*) FROM upload_items WHERE state = ?1",
                [filter.as_str()],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    async fn claim_next(&self, limit: usize) -> Result<Vec<UploadItem>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let ids = Arc::clone(&self.ids);
        self.with_tx(move |tx, now, _| {
            let mut items = load_items(
                tx,
                "state = 'pending' AND (not_before IS NULL OR not_before <= ?1)",
                Some(limit),
                [now.timestamp_millis()],
            )?;
            for item in &mut items {
                item.claim(now, ids.generate_claim_id());
                write_state(tx, item)?;
            }
            Ok(items)
        })
        .await
    }

    async fn mark_done(&self, claimed: &UploadItem) -> Result<(), StoreError> {
        let (id, claim_id) = (claimed.id, claimed.claim_id);
        let (removed, exists) = self
            .with_tx(move |tx, _, _| {
                let removed = tx.execute(
                    "DELETE FROM upload_items
                     WHERE id = ?1 AND state = 'in_flight' AND claim_id = ?2",
                    rusqlite::params![id.to_string(), claim_id.map(|c| c.to_string())],
                )?;
                let exists = removed == 0
                    && tx.query_row(
                        "SELECT COUNT(*) FROM upload_items WHERE id = ?1",
                        [id.to_string()],
                        |row| row.get::<_, i64>(0),
                    )? > 0;
                Ok((removed > 0, exists))
            })
            .await?;

        if removed {
            tracing::debug!(item_id = %id, "Upload done, removed from queue");
        } else if exists {
            superseded(claimed, "completion");
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        claimed: &UploadItem,
        error: &str,
    ) -> Result<Option<ItemState>, StoreError> {
        enum Failure {
            Unknown,
            Superseded,
            Recorded(ItemState),
        }

        let (id, claim_id) = (claimed.id, claimed.claim_id);
        let error = error.to_string();
        let failure = self
            .with_tx(move |tx, now, options| {
                let Some(mut item) = load_item(tx, id)? else {
                    return Ok(Failure::Unknown);
                };
                if !item.is_claimed_by(claim_id) {
                    return Ok(Failure::Superseded);
                }
                item.record_failure(error, options.max_attempts, |attempts| {
                    options.retry_at(now, attempts)
                });
                write_state(tx, &item)?;
                Ok(Failure::Recorded(item.state))
            })
            .await?;

        match failure {
            Failure::Unknown => Ok(None),
            Failure::Superseded => {
                superseded(claimed, "failure");
                Ok(None)
            }
            Failure::Recorded(state) => Ok(Some(state)),
        }
    }

    async fn release(&self, claimed: &UploadItem) -> Result<bool, StoreError> {
        let (id, claim_id) = (claimed.id, claimed.claim_id);
        self.with_tx(move |tx, _, _| {
            let changed = tx.execute(
                "UPDATE upload_items SET state = 'pending', claimed_at = NULL, claim_id = NULL
                 WHERE id = ?1 AND state = 'in_flight' AND claim_id = ?2",
                rusqlite::params![id.to_string(), claim_id.map(|c| c.to_string())],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn requeue(&self, id: ItemId) -> Result<bool, StoreError> {
        self.with_tx(move |tx, _, _| {
            let Some(mut item) = load_item(tx, id)? else {
                return Ok(false);
            };
            if !matches!(item.state, ItemState::Failed { .. }) {
                return Ok(false);
            }
            item.requeue();
            write_state(tx, &item)?;
            Ok(true)
        })
        .await
    }

    async fn purge_failed(&self) -> Result<usize, StoreError> {
        self.with_tx(|tx, _, _| Ok(tx.execute("DELETE FROM upload_items WHERE state = 'failed'", [])?))
            .await
    }

    async fn recover_stale(&self) -> Result<usize, StoreError> {
        self.blocking(|conn, now, options| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let recovered = recover_stale(&tx, now, options.stale_after())?;
            tx.commit()?;
            Ok(recovered)
        })
        .await
    }

    async fn get(&self, id: ItemId) -> Result<Option<UploadItem>, StoreError> {
        self.with_tx(move |tx, _, _| load_item(tx, id)).await
    }

    async fn list(&self, filter: StateFilter) -> Result<Vec<UploadItem>, StoreError> {
        self.with_tx(move |tx, _, _| load_items(tx, "state = ?1", None, [filter.as_str()]))
            .await
    }

    async fn counts(&self) -> Result<QueueCounts, StoreError> {
        self.with_tx(|tx, _, _| {
            let mut stmt = tx.prepare("SELECT state, COUNT(*) FROM upload_items GROUP BY state")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = QueueCounts::default();
            for (state, n) in rows {
                match StateFilter::parse(&state) {
                    Some(StateFilter::Pending) => counts.pending = n as usize,
                    Some(StateFilter::InFlight) => counts.in_flight = n as usize,
                    Some(StateFilter::Failed) => counts.failed = n as usize,
                    None => tracing::warn!(state = %state, n, "Ignoring rows with unknown state"),
                }
            }
            Ok(counts)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::ports::{FixedClock, UlidGenerator};

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    async fn open_file(
        path: &Path,
        clock: Arc<FixedClock>,
        options: StoreOptions,
    ) -> SqliteQueueStore {
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        SqliteQueueStore::open(path, options, clock, ids)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn metadata_survives_persistence() {
        let clock = clock();
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let store = SqliteQueueStore::open_in_memory(StoreOptions::default(), clock, ids).unwrap();

        let mut metadata = Metadata::new();
        metadata.insert("destination".into(), "photos/a.jpg".into());
        metadata.insert("checksum".into(), "abc123".into());
        let id = store.enqueue("/var/a.jpg", metadata.clone()).await.unwrap();

        let item = store.get(id).await.unwrap().unwrap();
        assert_eq!(item.content_ref, "/var/a.jpg");
        assert_eq!(item.metadata, metadata);
        assert_eq!(item.state, ItemState::Pending);
    }

    #[tokio::test]
    async fn items_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let clock = clock();

        let id = {
            let store = open_file(&path, clock.clone(), StoreOptions::default()).await;
            store.enqueue("/a", Metadata::new()).await.unwrap()
        };

        let store = open_file(&path, clock, StoreOptions::default()).await;
        assert_eq!(store.count(StateFilter::Pending).await.unwrap(), 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().content_ref, "/a");
    }

    #[tokio::test]
    async fn crash_between_claim_and_done_is_recovered_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let clock = clock();
        let options = StoreOptions {
            stale_after: Duration::from_secs(30),
            ..StoreOptions::default()
        };

        let id = {
            let store = open_file(&path, clock.clone(), options.clone()).await;
            let id = store.enqueue("/a", Metadata::new()).await.unwrap();
            let claimed = store.claim_next(1).await.unwrap();
            assert_eq!(claimed.len(), 1);
            // dropped without mark_done: simulated crash
            id
        };

        // Within the grace period the claim is still honoured.
        clock.advance(chrono::Duration::seconds(10));
        {
            let store = open_file(&path, clock.clone(), options.clone()).await;
            assert_eq!(store.count(StateFilter::InFlight).await.unwrap(), 1);
            assert!(store.claim_next(1).await.unwrap().is_empty());
        }

        clock.advance(chrono::Duration::seconds(30));
        let store = open_file(&path, clock, options).await;
        assert_eq!(store.count(StateFilter::Pending).await.unwrap(), 1);
        let reclaimed = store.claim_next(1).await.unwrap();
        assert_eq!(reclaimed[0].id, id);
        assert_eq!(reclaimed[0].attempts, 0);
    }

    #[tokio::test]
    async fn two_connections_never_claim_the_same_item() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let clock = clock();

        let a = Arc::new(open_file(&path, clock.clone(), StoreOptions::default()).await);
        let b = Arc::new(open_file(&path, clock, StoreOptions::default()).await);
        for i in 0..20 {
            a.enqueue(&format!("/{i}"), Metadata::new()).await.unwrap();
        }

        let (ra, rb) = tokio::join!(
            tokio::spawn({
                let a = a.clone();
                async move { a.claim_next(15).await.unwrap() }
            }),
            tokio::spawn({
                let b = b.clone();
                async move { b.claim_next(15).await.unwrap() }
            }),
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(ra.len() + rb.len(), 20);
        for item in &ra {
            assert!(rb.iter().all(|other| other.id != item.id));
        }
    }

    #[tokio::test]
    async fn lock_wait_does_not_stall_the_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let store = Arc::new(open_file(&path, clock(), StoreOptions::default()).await);

        // another process holds the write lock
        let holder = Connection::open(&path).unwrap();
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();

        let waiting = tokio::spawn({
            let store = store.clone();
            async move { store.count(StateFilter::Pending).await }
        });
        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(1));

        holder.execute_batch("COMMIT").unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_state_is_reported() {
        let clock = clock();
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        let store = SqliteQueueStore::open_in_memory(StoreOptions::default(), clock, ids).unwrap();
        let id = store.enqueue("/a", Metadata::new()).await.unwrap();

        store
            .conn
            .lock()
            .unwrap()
            .execute("UPDATE upload_items SET state = 'bogus'", [])
            .unwrap();

        let err = store.get(id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
