use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Default hold window: 24 hours.
pub const DEFAULT_HOLD_TTL_MS: Ms = 24 * HOUR_MS;

/// Lifecycle status of a book record. A cached summary of the ledger's
/// active entries for that book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookStatus {
    #[default]
    Available,
    OnHold,
    Borrowed,
}

impl BookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookStatus::Available => "available",
            BookStatus::OnHold => "on_hold",
            BookStatus::Borrowed => "borrowed",
        }
    }
}

impl fmt::Display for BookStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: Ulid,
    pub title: String,
    pub author: String,
    pub isbn: Option<String>,
    pub status: BookStatus,
    /// Informational only; status is tracked per record, not per copy.
    pub quantity: u32,
}

impl Book {
    pub fn new(id: Ulid, details: BookDetails) -> Self {
        Self {
            id,
            title: details.title,
            author: details.author,
            isbn: details.isbn,
            status: BookStatus::Available,
            quantity: details.quantity,
        }
    }

    /// Case-insensitive substring match on title, author or isbn.
    /// `needle` must already be lowercased.
    pub fn matches_query(&self, needle: &str) -> bool {
        needle.is_empty()
            || self.title.to_lowercase().contains(needle)
            || self.author.to_lowercase().contains(needle)
            || self
                .isbn
                .as_deref()
                .is_some_and(|isbn| isbn.to_lowercase().contains(needle))
    }
}

/// Editable catalog metadata. Status is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDetails {
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

impl BookDetails {
    pub fn new(title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: author.into(),
            isbn: None,
            quantity: 1,
        }
    }

    pub fn with_isbn(mut self, isbn: impl Into<String>) -> Self {
        self.isbn = Some(isbn.into());
        self
    }

    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Borrower {
    pub roll_no: String,
    pub name: String,
    #[serde(default)]
    pub department: String,
}

impl Borrower {
    pub fn new(roll_no: impl Into<String>, name: impl Into<String>, department: impl Into<String>) -> Self {
        Self {
            roll_no: roll_no.into(),
            name: name.into(),
            department: department.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Hold,
    Issue,
    Return,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Hold => "hold",
            Action::Issue => "issue",
            Action::Return => "return",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Active,
    Completed,
    Expired,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Active => "active",
            EntryStatus::Completed => "completed",
            EntryStatus::Expired => "expired",
        }
    }
}

/// One hold/issue/return record. Immutable except for `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Ulid,
    pub book_id: Ulid,
    pub roll_no: String,
    pub action: Action,
    pub status: EntryStatus,
    pub created_at: Ms,
    /// Set only for holds.
    pub expires_at: Option<Ms>,
}

impl LedgerEntry {
    pub fn is_active(&self) -> bool {
        self.status == EntryStatus::Active
    }

    pub fn is_active_hold(&self) -> bool {
        self.action == Action::Hold && self.is_active()
    }

    /// Active hold whose deadline has passed but which has not been swept yet.
    pub fn is_overdue_hold(&self, now: Ms) -> bool {
        self.is_active_hold() && self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
///
/// Every transition is exactly one event, so a replayed log never holds half
/// of a hold/issue/return.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookAdded {
        id: Ulid,
        details: BookDetails,
    },
    BookUpdated {
        id: Ulid,
        details: BookDetails,
    },
    BookRemoved {
        id: Ulid,
    },
    BorrowerRegistered {
        borrower: Borrower,
    },
    HoldPlaced {
        entry_id: Ulid,
        book_id: Ulid,
        roll_no: String,
        at: Ms,
        expires_at: Ms,
    },
    BookIssued {
        hold_id: Ulid,
        entry_id: Ulid,
        book_id: Ulid,
        roll_no: String,
        at: Ms,
    },
    BookReturned {
        issue_id: Ulid,
        entry_id: Ulid,
        book_id: Ulid,
        roll_no: String,
        at: Ms,
    },
    HoldExpired {
        hold_id: Ulid,
        book_id: Ulid,
    },
}

impl Event {
    /// The book whose lock scopes this event, if any.
    pub fn book_id(&self) -> Option<Ulid> {
        match self {
            Event::BookAdded { id, .. } | Event::BookUpdated { id, .. } | Event::BookRemoved { id } => {
                Some(*id)
            }
            Event::HoldPlaced { book_id, .. }
            | Event::BookIssued { book_id, .. }
            | Event::BookReturned { book_id, .. }
            | Event::HoldExpired { book_id, .. } => Some(*book_id),
            Event::BorrowerRegistered { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Returned by a successful hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldReceipt {
    pub entry: LedgerEntry,
    pub book: Book,
    pub borrower: Borrower,
    pub expires_at: Ms,
}

/// A ledger entry joined with its book and borrower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryView {
    pub entry: LedgerEntry,
    pub book: Book,
    pub borrower: Borrower,
}

/// A book whose cached status disagrees with its ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconsistency {
    pub book_id: Ulid,
    pub recorded: BookStatus,
    pub derived: BookStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(action: Action, status: EntryStatus, expires_at: Option<Ms>) -> LedgerEntry {
        LedgerEntry {
            id: Ulid::new(),
            book_id: Ulid::new(),
            roll_no: "R001".into(),
            action,
            status,
            created_at: 1_000,
            expires_at,
        }
    }

    #[test]
    fn status_labels() {
        assert_eq!(BookStatus::Available.as_str(), "available");
        assert_eq!(BookStatus::OnHold.to_string(), "on_hold");
        assert_eq!(BookStatus::Borrowed.as_str(), "borrowed");
        assert_eq!(BookStatus::default(), BookStatus::Available);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&BookStatus::OnHold).unwrap();
        assert_eq!(json, "\"on_hold\"");
        let action: Action = serde_json::from_str("\"return\"").unwrap();
        assert_eq!(action, Action::Return);
    }

    #[test]
    fn overdue_hold_detection() {
        let hold = entry(Action::Hold, EntryStatus::Active, Some(5_000));
        assert!(!hold.is_overdue_hold(4_999));
        assert!(hold.is_overdue_hold(5_000)); // deadline is inclusive

        let done = entry(Action::Hold, EntryStatus::Completed, Some(5_000));
        assert!(!done.is_overdue_hold(10_000));

        let issue = entry(Action::Issue, EntryStatus::Active, None);
        assert!(!issue.is_overdue_hold(10_000));
    }

    #[test]
    fn book_query_matching() {
        let book = Book::new(
            Ulid::new(),
            BookDetails::new("The Rust Programming Language", "Steve Klabnik").with_isbn("978-1718503106"),
        );
        assert!(book.matches_query(""));
        assert!(book.matches_query("rust"));
        assert!(book.matches_query("klabnik"));
        assert!(book.matches_query("1718503"));
        assert!(!book.matches_query("python"));
    }

    #[test]
    fn book_details_defaults_from_json() {
        let details: BookDetails = serde_json::from_str(r#"{"title":"Dune","author":"Herbert"}"#).unwrap();
        assert_eq!(details.quantity, 1);
        assert_eq!(details.isbn, None);
        let book = Book::new(Ulid::new(), details);
        assert_eq!(book.status, BookStatus::Available);
    }

    #[test]
    fn event_book_scope() {
        let book_id = Ulid::new();
        let event = Event::HoldExpired { hold_id: Ulid::new(), book_id };
        assert_eq!(event.book_id(), Some(book_id));
        let event = Event::BorrowerRegistered {
            borrower: Borrower::new("R001", "Asha", "CSE"),
        };
        assert_eq!(event.book_id(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::HoldPlaced {
            entry_id: Ulid::new(),
            book_id: Ulid::new(),
            roll_no: "R001".into(),
            at: 1_000,
            expires_at: 1_000 + DEFAULT_HOLD_TTL_MS,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
