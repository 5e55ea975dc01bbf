use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{ConflictKind, Engine, EngineError, Missing, apply_to_book};

/// Outcome of reclaiming one overdue hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// Hold expired and the book went back to `available`.
    Released,
    /// Hold expired but the book was no longer `on_hold`, so its status was left alone.
    ExpiredOnly,
    /// Hold was no longer an active, overdue hold by the time we got the lock.
    Skipped,
}

fn check_len(value: &str, max: usize, msg: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(msg));
    }
    Ok(())
}

fn check_required(value: &str, msg: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::LimitExceeded(msg));
    }
    Ok(())
}

fn validate_details(details: &BookDetails) -> Result<(), EngineError> {
    check_required(&details.title, "title is required")?;
    check_required(&details.author, "author is required")?;
    check_len(&details.title, MAX_TITLE_LEN, "title too long")?;
    check_len(&details.author, MAX_AUTHOR_LEN, "author too long")?;
    if let Some(isbn) = &details.isbn {
        check_len(isbn, MAX_ISBN_LEN, "isbn too long")?;
    }
    Ok(())
}

fn validate_borrower(borrower: &Borrower) -> Result<(), EngineError> {
    check_required(&borrower.roll_no, "roll number is required")?;
    check_required(&borrower.name, "name is required")?;
    check_len(&borrower.roll_no, MAX_ROLL_NO_LEN, "roll number too long")?;
    check_len(&borrower.name, MAX_NAME_LEN, "name too long")?;
    check_len(&borrower.department, MAX_DEPARTMENT_LEN, "department too long")?;
    Ok(())
}

impl Engine {
    // ── Catalog and membership maintenance ───────────────────

    pub async fn add_book(&self, details: BookDetails) -> Result<Book, EngineError> {
        self.instrumented("add_book", async {
            validate_details(&details)?;
            if self.stores.catalog.len() >= MAX_BOOKS {
                return Err(EngineError::LimitExceeded("too many books"));
            }
            let book = Book::new(self.next_id(), details.clone());
            let event = Event::BookAdded { id: book.id, details };
            self.commit(event, |stores, event| stores.apply_global(event)).await?;
            tracing::debug!(book_id = %book.id, title = %book.title, "book added");
            Ok(book)
        })
        .await
    }

    /// Edit title/author/isbn/quantity. Status is never touched here.
    pub async fn update_book(&self, id: Ulid, details: BookDetails) -> Result<Book, EngineError> {
        self.instrumented("update_book", async {
            validate_details(&details)?;
            let guard = self
                .lock_book("update_book", &id)
                .await?
                .ok_or(EngineError::NotFound(Missing::Book(id)))?;
            let event = Event::BookUpdated { id, details };
            self.commit(event, move |stores, event| {
                let mut guard = guard;
                apply_to_book(&mut guard, &stores.ledger, event);
                guard.clone()
            })
            .await
        })
        .await
    }

    /// Remove a book from the catalog. Refused while any active entry
    /// references it; its ledger history is kept.
    pub async fn remove_book(&self, id: Ulid) -> Result<(), EngineError> {
        self.instrumented("remove_book", async {
            let guard = self
                .lock_book("remove_book", &id)
                .await?
                .ok_or(EngineError::NotFound(Missing::Book(id)))?;
            if !self.stores.ledger.active_for_book(&id).is_empty() {
                return Err(EngineError::Conflict(ConflictKind::BookInUse(id)));
            }
            let event = Event::BookRemoved { id };
            // The record leaves the map while its lock is still held, so
            // waiters see it gone.
            self.commit(event, move |stores, event| {
                stores.apply_global(event);
                drop(guard);
            })
            .await?;
            tracing::debug!(book_id = %id, "book removed");
            Ok(())
        })
        .await
    }

    pub async fn register_borrower(&self, borrower: Borrower) -> Result<Borrower, EngineError> {
        self.instrumented("register_borrower", async {
            validate_borrower(&borrower)?;
            let registration = self
                .within_deadline("register_borrower", self.stores.members.lock_registration())
                .await?;
            if self.stores.members.contains(&borrower.roll_no) {
                return Err(EngineError::Conflict(ConflictKind::DuplicateBorrower(
                    borrower.roll_no.clone(),
                )));
            }
            if self.stores.members.len() >= MAX_BORROWERS {
                return Err(EngineError::LimitExceeded("too many borrowers"));
            }
            let event = Event::BorrowerRegistered {
                borrower: borrower.clone(),
            };
            self.commit(event, move |stores, event| {
                stores.apply_global(event);
                drop(registration);
            })
            .await?;
            tracing::debug!(roll_no = %borrower.roll_no, "borrower registered");
            Ok(borrower)
        })
        .await
    }

    // ── Transitions ──────────────────────────────────────────

    /// Reserve an available book for a borrower for the hold window.
    pub async fn place_hold(&self, book_id: Ulid, roll_no: &str) -> Result<HoldReceipt, EngineError> {
        self.instrumented("place_hold", async {
            let borrower = self
                .stores
                .members
                .get(roll_no)
                .ok_or_else(|| EngineError::NotFound(Missing::Borrower(roll_no.to_string())))?;
            let not_available = EngineError::Conflict(ConflictKind::NotAvailable(book_id));
            let Some(guard) = self.lock_book("place_hold", &book_id).await? else {
                return Err(not_available);
            };
            if guard.status != BookStatus::Available {
                return Err(not_available);
            }
            if self.stores.ledger.find_active(&book_id, roll_no, Action::Hold).is_some() {
                return Err(EngineError::Conflict(ConflictKind::DuplicateHold {
                    book_id,
                    roll_no: roll_no.to_string(),
                }));
            }

            let at = self.clock.now_ms();
            let expires_at = at.saturating_add(self.settings.hold_ttl_ms);
            let entry_id = self.next_id();
            let event = Event::HoldPlaced {
                entry_id,
                book_id,
                roll_no: roll_no.to_string(),
                at,
                expires_at,
            };
            let book = self
                .commit(event, move |stores, event| {
                    let mut guard = guard;
                    apply_to_book(&mut guard, &stores.ledger, event);
                    guard.clone()
                })
                .await?;

            tracing::debug!(%book_id, roll_no, %entry_id, expires_at, "hold placed");
            Ok(HoldReceipt {
                entry: LedgerEntry::hold(entry_id, book_id, roll_no.to_string(), at, expires_at),
                book,
                borrower,
                expires_at,
            })
        })
        .await
    }

    /// Convert an active hold into a loan.
    ///
    /// Not gated on the hold's deadline: a hold past `expires_at` that the
    /// sweeper has not reclaimed yet can still be issued.
    pub async fn issue_book(&self, hold_id: Ulid) -> Result<LedgerEntry, EngineError> {
        self.instrumented("issue_book", async {
            let not_found = || EngineError::NotFound(Missing::Hold(hold_id));
            let active_hold = || self.stores.ledger.get(&hold_id).filter(LedgerEntry::is_active_hold);

            let hold = active_hold().ok_or_else(not_found)?;
            let guard = self.lock_book("issue_book", &hold.book_id).await?.ok_or_else(not_found)?;
            // Re-read under the lock: another issue or the sweeper may have got here first.
            let hold = active_hold().ok_or_else(not_found)?;
            if self
                .stores
                .ledger
                .find_active(&hold.book_id, &hold.roll_no, Action::Issue)
                .is_some()
            {
                return Err(EngineError::Conflict(ConflictKind::DuplicateLoan {
                    book_id: hold.book_id,
                    roll_no: hold.roll_no,
                }));
            }

            let at = self.clock.now_ms();
            let entry_id = self.next_id();
            let event = Event::BookIssued {
                hold_id,
                entry_id,
                book_id: hold.book_id,
                roll_no: hold.roll_no.clone(),
                at,
            };
            self.commit(event, move |stores, event| {
                let mut guard = guard;
                apply_to_book(&mut guard, &stores.ledger, event);
            })
            .await?;

            if hold.is_overdue_hold(at) {
                tracing::info!(%hold_id, book_id = %hold.book_id, "issued a hold past its deadline before it was swept");
            }
            tracing::debug!(%hold_id, book_id = %hold.book_id, roll_no = %hold.roll_no, "book issued");
            Ok(LedgerEntry::issue(entry_id, hold.book_id, hold.roll_no, at))
        })
        .await
    }

    /// Close the borrower's active loan of a book.
    pub async fn return_book(&self, book_id: Ulid, roll_no: &str) -> Result<LedgerEntry, EngineError> {
        self.instrumented("return_book", async {
            let not_found = || {
                EngineError::NotFound(Missing::ActiveLoan {
                    book_id,
                    roll_no: roll_no.to_string(),
                })
            };
            let guard = self.lock_book("return_book", &book_id).await?.ok_or_else(not_found)?;
            let loan = self
                .stores
                .ledger
                .find_active(&book_id, roll_no, Action::Issue)
                .ok_or_else(not_found)?;

            let at = self.clock.now_ms();
            let entry_id = self.next_id();
            let event = Event::BookReturned {
                issue_id: loan.id,
                entry_id,
                book_id,
                roll_no: roll_no.to_string(),
                at,
            };
            self.commit(event, move |stores, event| {
                let mut guard = guard;
                apply_to_book(&mut guard, &stores.ledger, event);
            })
            .await?;

            tracing::debug!(%book_id, roll_no, issue_id = %loan.id, "book returned");
            Ok(LedgerEntry::returned(entry_id, book_id, roll_no.to_string(), at))
        })
        .await
    }

    /// Expire one overdue hold and, if the book is still `on_hold`, make it
    /// available again. Ledger and catalog change together under the book lock.
    pub async fn expire_hold(&self, hold_id: Ulid, now: Ms) -> Result<Reclaim, EngineError> {
        self.instrumented("expire_hold", async {
            let Some(hold) = self.stores.ledger.get(&hold_id) else {
                return Ok(Reclaim::Skipped);
            };
            let Some(guard) = self.lock_book("expire_hold", &hold.book_id).await? else {
                return Ok(Reclaim::Skipped);
            };
            let still_overdue = self
                .stores
                .ledger
                .get(&hold_id)
                .is_some_and(|e| e.is_overdue_hold(now));
            if !still_overdue {
                return Ok(Reclaim::Skipped);
            }

            let event = Event::HoldExpired {
                hold_id,
                book_id: hold.book_id,
            };
            self.commit(event, move |stores, event| {
                let mut guard = guard;
                let was_on_hold = guard.status == BookStatus::OnHold;
                apply_to_book(&mut guard, &stores.ledger, event);
                if was_on_hold {
                    Reclaim::Released
                } else {
                    Reclaim::ExpiredOnly
                }
            })
            .await
        })
        .await
    }
}
