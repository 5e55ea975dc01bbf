use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::Borrower;

/// Registered borrowers keyed by roll number. Read-only to the transition
/// engine; records never change once registered.
pub struct Membership {
    borrowers: DashMap<String, Borrower>,
    /// Serializes registrations so the duplicate check and the insert are one unit.
    registration: Arc<Mutex<()>>,
}

impl Default for Membership {
    fn default() -> Self {
        Self::new()
    }
}

impl Membership {
    pub fn new() -> Self {
        Self {
            borrowers: DashMap::new(),
            registration: Arc::new(Mutex::new(())),
        }
    }

    pub fn len(&self) -> usize {
        self.borrowers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.borrowers.is_empty()
    }

    pub fn contains(&self, roll_no: &str) -> bool {
        self.borrowers.contains_key(roll_no)
    }

    pub fn get(&self, roll_no: &str) -> Option<Borrower> {
        self.borrowers.get(roll_no).map(|e| e.value().clone())
    }

    /// All borrowers ordered by roll number.
    pub fn list(&self) -> Vec<Borrower> {
        let mut all: Vec<Borrower> = self.borrowers.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.roll_no.cmp(&b.roll_no));
        all
    }

    pub(super) fn insert(&self, borrower: Borrower) {
        self.borrowers.insert(borrower.roll_no.clone(), borrower);
    }

    pub(super) async fn lock_registration(&self) -> OwnedMutexGuard<()> {
        self.registration.clone().lock_owned().await
    }
}
