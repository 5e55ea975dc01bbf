use std::time::Duration;

use ulid::Ulid;

/// What a `NotFound` failed to find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Book(Ulid),
    Borrower(String),
    /// No active hold with this id: never existed or already processed.
    Hold(Ulid),
    ActiveLoan { book_id: Ulid, roll_no: String },
}

/// Which state-machine rule an operation would break.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    /// Book is missing or not `available`.
    NotAvailable(Ulid),
    DuplicateHold { book_id: Ulid, roll_no: String },
    DuplicateLoan { book_id: Ulid, roll_no: String },
    DuplicateBorrower(String),
    /// Book still has active ledger entries.
    BookInUse(Ulid),
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Missing),
    Conflict(ConflictKind),
    LimitExceeded(&'static str),
    WalError(String),
    Timeout { op: &'static str, after: Duration },
}

impl EngineError {
    /// Persistence could not be reached or the commit did not complete.
    /// Callers may retry these; the engine never does.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, EngineError::WalError(_) | EngineError::Timeout { .. })
    }

    /// Short, stable category for user-facing messaging and metrics labels.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(ConflictKind::NotAvailable(_)) => "unavailable",
            EngineError::Conflict(ConflictKind::BookInUse(_)) => "in_use",
            EngineError::Conflict(_) => "duplicate",
            EngineError::LimitExceeded(_) => "invalid",
            EngineError::WalError(_) | EngineError::Timeout { .. } => "storage",
        }
    }

    /// Message safe to show an end user. Storage details stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            EngineError::NotFound(Missing::Book(_)) => "Book not found".into(),
            EngineError::NotFound(Missing::Borrower(_)) => "Invalid roll number".into(),
            EngineError::NotFound(Missing::Hold(_)) => "Hold not found or already processed".into(),
            EngineError::NotFound(Missing::ActiveLoan { .. }) => "Active issue not found".into(),
            EngineError::Conflict(ConflictKind::NotAvailable(_)) => "Book not available for hold".into(),
            EngineError::Conflict(ConflictKind::DuplicateHold { .. }) => {
                "You already have a hold on this book".into()
            }
            EngineError::Conflict(ConflictKind::DuplicateLoan { .. }) => {
                "This book is already issued to you".into()
            }
            EngineError::Conflict(ConflictKind::DuplicateBorrower(_)) => "Roll number already exists".into(),
            EngineError::Conflict(ConflictKind::BookInUse(_)) => {
                "Cannot delete book with active transactions".into()
            }
            EngineError::LimitExceeded(msg) => format!("Invalid request: {msg}"),
            EngineError::WalError(_) | EngineError::Timeout { .. } => {
                "The library is temporarily unavailable, please try again".into()
            }
        }
    }
}

impl std::fmt::Display for Missing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Missing::Book(id) => write!(f, "book {id}"),
            Missing::Borrower(roll_no) => write!(f, "borrower {roll_no}"),
            Missing::Hold(id) => write!(f, "active hold {id}"),
            Missing::ActiveLoan { book_id, roll_no } => {
                write!(f, "active loan of book {book_id} to {roll_no}")
            }
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::NotAvailable(id) => write!(f, "book {id} is not available"),
            ConflictKind::DuplicateHold { book_id, roll_no } => {
                write!(f, "{roll_no} already holds book {book_id}")
            }
            ConflictKind::DuplicateLoan { book_id, roll_no } => {
                write!(f, "book {book_id} is already issued to {roll_no}")
            }
            ConflictKind::DuplicateBorrower(roll_no) => write!(f, "borrower {roll_no} already exists"),
            ConflictKind::BookInUse(id) => write!(f, "book {id} has active ledger entries"),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::Conflict(kind) => write!(f, "conflict: {kind}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
            EngineError::Timeout { op, after } => {
                write!(f, "{op} timed out after {}ms", after.as_millis())
            }
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        let id = Ulid::new();
        assert_eq!(EngineError::NotFound(Missing::Hold(id)).category(), "not_found");
        assert_eq!(
            EngineError::Conflict(ConflictKind::NotAvailable(id)).category(),
            "unavailable"
        );
        assert_eq!(
            EngineError::Conflict(ConflictKind::DuplicateHold {
                book_id: id,
                roll_no: "R001".into()
            })
            .category(),
            "duplicate"
        );
        assert_eq!(EngineError::Conflict(ConflictKind::BookInUse(id)).category(), "in_use");
        assert_eq!(EngineError::WalError("disk full".into()).category(), "storage");
    }

    #[test]
    fn storage_failures_hide_raw_errors() {
        let err = EngineError::WalError("No space left on device (os error 28)".into());
        assert!(err.is_storage_failure());
        assert!(!err.user_message().contains("os error"));
        assert!(err.to_string().contains("os error 28"));

        let timeout = EngineError::Timeout {
            op: "place_hold",
            after: Duration::from_millis(250),
        };
        assert!(timeout.is_storage_failure());
        assert_eq!(timeout.to_string(), "place_hold timed out after 250ms");
    }

    #[test]
    fn expected_outcomes_are_not_storage_failures() {
        let err = EngineError::NotFound(Missing::Borrower("R404".into()));
        assert!(!err.is_storage_failure());
        assert_eq!(err.to_string(), "not found: borrower R404");
        assert_eq!(err.user_message(), "Invalid roll number");
    }
}
