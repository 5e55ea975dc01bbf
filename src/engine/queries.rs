use futures::future::join_all;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_book(&self, id: Ulid) -> Option<Book> {
        self.stores.catalog.snapshot(&id).await
    }

    /// Every book, ordered by title.
    pub async fn list_books(&self) -> Vec<Book> {
        let mut books = self.stores.catalog.snapshot_all().await;
        books.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
        books
    }

    /// Books whose title or author contains `query` (case-insensitive), or
    /// whose isbn contains it. An empty query matches everything.
    pub async fn search(&self, query: &str) -> Result<Vec<Book>, EngineError> {
        if query.len() > MAX_SEARCH_QUERY_LEN {
            return Err(EngineError::LimitExceeded("search query too long"));
        }
        let needle = query.to_lowercase();
        let mut books = self.list_books().await;
        books.retain(|b| b.matches_query(&needle));
        Ok(books)
    }

    pub fn get_borrower(&self, roll_no: &str) -> Option<Borrower> {
        self.stores.members.get(roll_no)
    }

    pub fn list_borrowers(&self) -> Vec<Borrower> {
        self.stores.members.list()
    }

    /// Active holds with their book and borrower, newest first.
    pub async fn list_active_holds(&self) -> Vec<EntryView> {
        let holds = self.stores.ledger.active_with_action(Action::Hold);
        self.join_views(holds).await
    }

    /// Active loans with their book and borrower, oldest first.
    pub async fn list_active_loans(&self) -> Vec<EntryView> {
        let mut loans = self.stores.ledger.active_with_action(Action::Issue);
        loans.reverse();
        self.join_views(loans).await
    }

    /// The borrower's active entries, newest first.
    pub fn history_for_borrower(&self, roll_no: &str) -> Vec<LedgerEntry> {
        self.stores.ledger.active_for_borrower(roll_no)
    }

    /// Every entry ever recorded for a book, oldest first.
    pub fn ledger_for_book(&self, book_id: Ulid) -> Vec<LedgerEntry> {
        self.stores.ledger.entries_for_book(&book_id)
    }

    /// Compare every book's cached status with the status its ledger implies.
    /// Each book is checked under its read lock, so an in-flight transition
    /// is never mistaken for a divergence.
    pub async fn verify_invariants(&self) -> Vec<Inconsistency> {
        let mut found = Vec::new();
        for id in self.stores.catalog.ids() {
            let Some(shared) = self.stores.catalog.get(&id) else {
                continue;
            };
            let guard = shared.read().await;
            let derived = self.stores.ledger.derived_status(&id);
            if guard.status != derived {
                found.push(Inconsistency {
                    book_id: id,
                    recorded: guard.status,
                    derived,
                });
            }
        }
        found
    }

    /// Join entries with book and borrower snapshots, keeping their order.
    /// Entries whose book or borrower is gone are left out.
    async fn join_views(&self, entries: Vec<LedgerEntry>) -> Vec<EntryView> {
        let views = join_all(entries.into_iter().map(|entry| async move {
            let book = self.stores.catalog.snapshot(&entry.book_id).await;
            let borrower = self.stores.members.get(&entry.roll_no);
            book.zip(borrower)
                .map(|(book, borrower)| EntryView { entry, book, borrower })
        }))
        .await;
        views.into_iter().flatten().collect()
    }
}
