use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::{DashMap, DashSet};
use ulid::Ulid;

use crate::model::*;

impl LedgerEntry {
    pub(crate) fn hold(id: Ulid, book_id: Ulid, roll_no: String, at: Ms, expires_at: Ms) -> Self {
        Self {
            id,
            book_id,
            roll_no,
            action: Action::Hold,
            status: EntryStatus::Active,
            created_at: at,
            expires_at: Some(expires_at),
        }
    }

    pub(crate) fn issue(id: Ulid, book_id: Ulid, roll_no: String, at: Ms) -> Self {
        Self {
            id,
            book_id,
            roll_no,
            action: Action::Issue,
            status: EntryStatus::Active,
            created_at: at,
            expires_at: None,
        }
    }

    /// Return entries are born completed; they only record that the loan ended.
    pub(crate) fn returned(id: Ulid, book_id: Ulid, roll_no: String, at: Ms) -> Self {
        Self {
            id,
            book_id,
            roll_no,
            action: Action::Return,
            status: EntryStatus::Completed,
            created_at: at,
            expires_at: None,
        }
    }
}

/// Append-mostly record of every hold, issue and return; the source of truth
/// for what is active.
///
/// Entries are added or have their status changed, never removed. Every
/// write touching a book's entries happens while that book's write lock is
/// held.
///
/// The maps are updated one at a time, so `gate` makes each write step
/// (including close-then-append) indivisible for readers: writers hold it
/// exclusively, multi-entry reads hold it shared. It is never held across an
/// await.
pub struct Ledger {
    entries: DashMap<Ulid, LedgerEntry>,
    /// Entry ids per book, in append order.
    by_book: DashMap<Ulid, Vec<Ulid>>,
    by_borrower: DashMap<String, Vec<Ulid>>,
    active: DashSet<Ulid>,
    gate: RwLock<()>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_first(entries: &mut [LedgerEntry]) {
    entries.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
}

fn oldest_first(entries: &mut [LedgerEntry]) {
    entries.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_book: DashMap::new(),
            by_borrower: DashMap::new(),
            active: DashSet::new(),
            gate: RwLock::new(()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<LedgerEntry> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    // The gate guards `()`, so a poisoned lock carries no broken state.
    fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_gate(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Writes (apply step only) ─────────────────────────────

    pub(super) fn append(&self, entry: LedgerEntry) {
        let _gate = self.write_gate();
        self.insert_entry(entry);
    }

    /// Change an entry's status. Returns the previous status, or `None` if the
    /// entry does not exist.
    pub(super) fn set_status(&self, id: &Ulid, status: EntryStatus) -> Option<EntryStatus> {
        let _gate = self.write_gate();
        self.swap_status(id, status)
    }

    /// Close `id` with `status` and record `entry` as one step: no reader
    /// sees the old entry closed without the new one present.
    pub(super) fn close_and_append(&self, id: &Ulid, status: EntryStatus, entry: LedgerEntry) -> Option<EntryStatus> {
        let _gate = self.write_gate();
        let previous = self.swap_status(id, status);
        self.insert_entry(entry);
        previous
    }

    fn insert_entry(&self, entry: LedgerEntry) {
        let (id, book_id, roll_no, active) = (entry.id, entry.book_id, entry.roll_no.clone(), entry.is_active());
        self.entries.insert(id, entry);
        if active {
            self.active.insert(id);
        }
        self.by_book.entry(book_id).or_default().push(id);
        self.by_borrower.entry(roll_no).or_default().push(id);
    }

    fn swap_status(&self, id: &Ulid, status: EntryStatus) -> Option<EntryStatus> {
        let previous = self
            .entries
            .get_mut(id)
            .map(|mut e| std::mem::replace(&mut e.status, status))?;
        if status == EntryStatus::Active {
            self.active.insert(*id);
        } else {
            self.active.remove(id);
        }
        Some(previous)
    }

    // ── Reads ────────────────────────────────────────────────
    // Public reads take the gate once; the `*_ungated` helpers assume it is held.

    fn resolve(&self, ids: &[Ulid]) -> Vec<LedgerEntry> {
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    fn active_ids(&self) -> Vec<Ulid> {
        self.active.iter().map(|id| *id).collect()
    }

    fn entries_for_book_ungated(&self, book_id: &Ulid) -> Vec<LedgerEntry> {
        let ids = self
            .by_book
            .get(book_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut entries = self.resolve(&ids);
        oldest_first(&mut entries);
        entries
    }

    fn active_for_book_ungated(&self, book_id: &Ulid) -> Vec<LedgerEntry> {
        let mut entries = self.entries_for_book_ungated(book_id);
        entries.retain(LedgerEntry::is_active);
        entries
    }

    /// Full audit trail for a book, oldest first.
    pub fn entries_for_book(&self, book_id: &Ulid) -> Vec<LedgerEntry> {
        let _gate = self.read_gate();
        self.entries_for_book_ungated(book_id)
    }

    pub fn active_for_book(&self, book_id: &Ulid) -> Vec<LedgerEntry> {
        let _gate = self.read_gate();
        self.active_for_book_ungated(book_id)
    }

    /// The active entry of `action` for a (book, borrower) pair, if any.
    pub fn find_active(&self, book_id: &Ulid, roll_no: &str, action: Action) -> Option<LedgerEntry> {
        let _gate = self.read_gate();
        self.active_for_book_ungated(book_id)
            .into_iter()
            .find(|e| e.roll_no == roll_no && e.action == action)
    }

    /// Active entries for a borrower, newest first.
    pub fn active_for_borrower(&self, roll_no: &str) -> Vec<LedgerEntry> {
        let _gate = self.read_gate();
        let ids = self
            .by_borrower
            .get(roll_no)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut entries = self.resolve(&ids);
        entries.retain(LedgerEntry::is_active);
        newest_first(&mut entries);
        entries
    }

    /// Active entries of one action, newest first.
    pub fn active_with_action(&self, action: Action) -> Vec<LedgerEntry> {
        let _gate = self.read_gate();
        let mut entries = self.resolve(&self.active_ids());
        entries.retain(|e| e.is_active() && e.action == action);
        newest_first(&mut entries);
        entries
    }

    /// `(hold_id, book_id)` for every active hold with `expires_at <= now`.
    pub fn overdue_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let _gate = self.read_gate();
        let mut overdue: Vec<LedgerEntry> = self.resolve(&self.active_ids());
        overdue.retain(|e| e.is_overdue_hold(now));
        oldest_first(&mut overdue);
        overdue.into_iter().map(|e| (e.id, e.book_id)).collect()
    }

    /// What the book's status must be given its active entries.
    pub fn derived_status(&self, book_id: &Ulid) -> BookStatus {
        let _gate = self.read_gate();
        let active = self.active_for_book_ungated(book_id);
        if active.iter().any(|e| e.action == Action::Issue) {
            BookStatus::Borrowed
        } else if active.iter().any(|e| e.action == Action::Hold) {
            BookStatus::OnHold
        } else {
            BookStatus::Available
        }
    }
}
