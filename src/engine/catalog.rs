use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::Book;

/// A book record behind its own lock. The write lock is the row lock every
/// transition on that book serializes on.
pub type SharedBook = Arc<RwLock<Book>>;

/// Keyed store of book records.
pub struct Catalog {
    books: DashMap<Ulid, SharedBook>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            books: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.books.contains_key(id)
    }

    pub fn get(&self, id: &Ulid) -> Option<SharedBook> {
        self.books.get(id).map(|e| e.value().clone())
    }

    pub fn ids(&self) -> Vec<Ulid> {
        self.books.iter().map(|e| *e.key()).collect()
    }

    pub(super) fn insert(&self, book: Book) {
        self.books.insert(book.id, Arc::new(RwLock::new(book)));
    }

    pub(super) fn remove(&self, id: &Ulid) -> Option<SharedBook> {
        self.books.remove(id).map(|(_, shared)| shared)
    }

    /// Point-in-time copy of one record.
    pub async fn snapshot(&self, id: &Ulid) -> Option<Book> {
        let shared = self.get(id)?;
        let guard = shared.read().await;
        Some(guard.clone())
    }

    /// Copies of every record, in no particular order.
    pub async fn snapshot_all(&self) -> Vec<Book> {
        let shared: Vec<SharedBook> = self.books.iter().map(|e| e.value().clone()).collect();
        join_all(shared.iter().map(|book| async move { book.read().await.clone() })).await
    }

    /// Take the write lock on a book.
    ///
    /// Returns `None` if the book does not exist, or was removed while this
    /// call was waiting for the lock (removal happens under the same lock).
    pub(super) async fn lock(&self, id: &Ulid) -> Option<OwnedRwLockWriteGuard<Book>> {
        let shared = self.get(id)?;
        let guard = shared.clone().write_owned().await;
        let still_live = self
            .books
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &shared));
        still_live.then_some(guard)
    }
}
