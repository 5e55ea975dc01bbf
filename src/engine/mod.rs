mod catalog;
mod error;
mod ledger;
mod membership;
mod mutations;
mod queries;

pub use catalog::{Catalog, SharedBook};
pub use error::{ConflictKind, EngineError, Missing};
pub use ledger::Ledger;
pub use membership::Membership;
pub use mutations::Reclaim;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedRwLockWriteGuard, mpsc, oneshot};
use ulid::{Generator, Ulid};

use crate::clock::Clock;
use crate::model::*;
use crate::observability;
use crate::wal::{LogFile, Wal};

// ── Group-commit WAL channel ─────────────────────────────

pub(super) struct WalAppend {
    event: Event,
    response: oneshot::Sender<io::Result<()>>,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first append arrives.
/// 2. Drain all immediately available appends (the batch window).
/// 3. Single flush_sync for the whole batch.
/// 4. Respond to all senders with the batch result.
async fn wal_writer_loop<F: LogFile>(mut wal: Wal<F>, mut rx: mpsc::Receiver<WalAppend>) {
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!(path = %wal.path().display(), poisoned = wal.is_poisoned(), "WAL flush failed: {e}");
        }
        respond_batch(batch, &result);
    }
    tracing::debug!("WAL writer stopped");
}

/// All or nothing: on any error none of the batch stays in the log.
fn flush_batch<F: LogFile>(wal: &mut Wal<F>, batch: &[WalAppend]) -> io::Result<()> {
    for append in batch {
        if let Err(e) = wal.append_buffered(&append.event) {
            wal.rollback();
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn respond_batch(batch: Vec<WalAppend>, result: &io::Result<()>) {
    for append in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = append.response.send(r);
    }
}

// ── Stores ───────────────────────────────────────────────

/// Everything a commit touches. Cheap to clone so a commit can run detached.
#[derive(Clone)]
pub(super) struct Stores {
    catalog: Arc<Catalog>,
    members: Arc<Membership>,
    ledger: Arc<Ledger>,
    wal_tx: mpsc::Sender<WalAppend>,
}

impl Stores {
    fn new(wal_tx: mpsc::Sender<WalAppend>) -> Self {
        Self {
            catalog: Arc::new(Catalog::new()),
            members: Arc::new(Membership::new()),
            ledger: Arc::new(Ledger::new()),
            wal_tx,
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalAppend {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Apply an event that is not scoped to an existing book record.
    fn apply_global(&self, event: &Event) {
        match event {
            Event::BookAdded { id, details } => self.catalog.insert(Book::new(*id, details.clone())),
            Event::BookRemoved { id } => {
                self.catalog.remove(id);
            }
            Event::BorrowerRegistered { borrower } => self.members.insert(borrower.clone()),
            _ => {}
        }
    }
}

/// Apply a book-scoped event to the record and the ledger together
/// (no locking: caller holds the book's write lock).
///
/// This is the only place `Book::status` and `LedgerEntry::status` change.
fn apply_to_book(book: &mut Book, ledger: &Ledger, event: &Event) {
    match event {
        Event::BookUpdated { details, .. } => {
            book.title = details.title.clone();
            book.author = details.author.clone();
            book.isbn = details.isbn.clone();
            book.quantity = details.quantity;
        }
        Event::HoldPlaced {
            entry_id,
            book_id,
            roll_no,
            at,
            expires_at,
        } => {
            ledger.append(LedgerEntry::hold(*entry_id, *book_id, roll_no.clone(), *at, *expires_at));
            book.status = BookStatus::OnHold;
        }
        Event::BookIssued {
            hold_id,
            entry_id,
            book_id,
            roll_no,
            at,
        } => {
            let issue = LedgerEntry::issue(*entry_id, *book_id, roll_no.clone(), *at);
            ledger.close_and_append(hold_id, EntryStatus::Completed, issue);
            book.status = BookStatus::Borrowed;
        }
        Event::BookReturned {
            issue_id,
            entry_id,
            book_id,
            roll_no,
            at,
        } => {
            let returned = LedgerEntry::returned(*entry_id, *book_id, roll_no.clone(), *at);
            ledger.close_and_append(issue_id, EntryStatus::Completed, returned);
            book.status = BookStatus::Available;
        }
        Event::HoldExpired { hold_id, .. } => {
            ledger.set_status(hold_id, EntryStatus::Expired);
            // An issue that won the race leaves the book borrowed.
            if book.status == BookStatus::OnHold {
                book.status = BookStatus::Available;
            }
        }
        // Catalog and membership changes are handled at the map level
        Event::BookAdded { .. } | Event::BookRemoved { .. } | Event::BorrowerRegistered { .. } => {}
    }
}

// ── Engine ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// How long a hold stays valid after it is placed.
    pub hold_ttl_ms: Ms,
    /// Upper bound on any single operation, lock wait included.
    pub op_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_ttl_ms: DEFAULT_HOLD_TTL_MS,
            op_timeout: Duration::from_secs(5),
        }
    }
}

/// The transition engine: owns the catalog, membership and ledger and is the
/// only writer of any of them.
pub struct Engine {
    stores: Stores,
    clock: Arc<dyn Clock>,
    ids: Mutex<Generator>,
    settings: EngineSettings,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf, settings: EngineSettings, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?.events;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self::with_stores(Stores::new(wal_tx), settings, clock);
        engine.replay(&events);
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            books = engine.stores.catalog.len(),
            borrowers = engine.stores.members.len(),
            ledger_entries = engine.stores.ledger.len(),
            "library state restored"
        );
        Ok(engine)
    }

    fn with_stores(stores: Stores, settings: EngineSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            stores,
            clock,
            ids: Mutex::new(Generator::new()),
            settings,
        }
    }

    /// Rebuild in-memory state. We're the sole owner of these locks, so
    /// try_write always succeeds; never block here since this runs inside
    /// an async context.
    fn replay(&self, events: &[Event]) {
        for event in events {
            match event {
                Event::BookAdded { .. } | Event::BookRemoved { .. } | Event::BorrowerRegistered { .. } => {
                    self.stores.apply_global(event)
                }
                other => {
                    let Some(shared) = other.book_id().and_then(|id| self.stores.catalog.get(&id)) else {
                        tracing::warn!(?other, "replay: event for unknown book, skipping");
                        continue;
                    };
                    match shared.try_write() {
                        Ok(mut guard) => apply_to_book(&mut guard, &self.stores.ledger, other),
                        Err(_) => tracing::warn!(?other, "replay: book record busy, skipping"),
                    }
                }
            }
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.stores.catalog
    }

    pub fn members(&self) -> &Membership {
        &self.stores.members
    }

    pub fn ledger(&self) -> &Ledger {
        &self.stores.ledger
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    /// Monotonic within this process, so id order is creation order.
    pub(super) fn next_id(&self) -> Ulid {
        let mut generator = match self.ids.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        generator.generate().unwrap_or_else(|_| Ulid::new())
    }

    /// WAL-append then apply, as one unit.
    ///
    /// Runs on its own task and is not subject to the operation timeout: the
    /// caller gets the real outcome, and a dropped caller cannot leave the WAL
    /// and memory disagreeing. Any lock guards the caller took must be moved
    /// into `apply`.
    pub(super) async fn commit<T, F>(&self, event: Event, apply: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Stores, &Event) -> T + Send + 'static,
    {
        let stores = self.stores.clone();
        tokio::spawn(async move {
            stores.wal_append(&event).await?;
            Ok(apply(&stores, &event))
        })
        .await
        .map_err(|e| EngineError::WalError(format!("commit task failed: {e}")))?
    }

    /// Bound a wait that happens before commit (a lock acquisition) by the
    /// configured timeout. Nothing has been written when this fails.
    pub(super) async fn within_deadline<T>(
        &self,
        op: &'static str,
        wait: impl Future<Output = T>,
    ) -> Result<T, EngineError> {
        let after = self.settings.op_timeout;
        tokio::time::timeout(after, wait)
            .await
            .map_err(|_| EngineError::Timeout { op, after })
    }

    /// Run `op` and record its outcome and latency.
    pub(super) async fn instrumented<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let start = Instant::now();
        let result = fut.await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.category(),
        };
        metrics::counter!(observability::OPERATIONS_TOTAL, "op" => op, "outcome" => outcome).increment(1);
        metrics::histogram!(observability::OPERATION_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        if let Err(e) = &result
            && e.is_storage_failure()
        {
            tracing::warn!(op, "operation failed: {e}");
        }
        result
    }

    /// Write lock on a book, waiting at most the operation timeout.
    pub(super) async fn lock_book(
        &self,
        op: &'static str,
        id: &Ulid,
    ) -> Result<Option<OwnedRwLockWriteGuard<Book>>, EngineError> {
        self.within_deadline(op, self.stores.catalog.lock(id)).await
    }
}
