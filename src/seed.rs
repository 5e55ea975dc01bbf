//! One-shot import of an initial catalog and borrower roster.
//!
//! ```json
//! {
//!   "books": [{ "title": "Dune", "author": "Frank Herbert", "isbn": "9780441013593" }],
//!   "borrowers": [{ "roll_no": "R001", "name": "Asha", "department": "CSE" }]
//! }
//! ```

use std::fmt;
use std::io;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::engine::{Engine, EngineError};
use crate::model::{BookDetails, Borrower};

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub books: Vec<BookDetails>,
    #[serde(default)]
    pub borrowers: Vec<Borrower>,
}

#[derive(Debug)]
pub enum SeedError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for SeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedError::Io(e) => write!(f, "cannot read seed file: {e}"),
            SeedError::Json(e) => write!(f, "invalid seed file: {e}"),
        }
    }
}

impl std::error::Error for SeedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SeedError::Io(e) => Some(e),
            SeedError::Json(e) => Some(e),
        }
    }
}

impl From<io::Error> for SeedError {
    fn from(e: io::Error) -> Self {
        SeedError::Io(e)
    }
}

impl From<serde_json::Error> for SeedError {
    fn from(e: serde_json::Error) -> Self {
        SeedError::Json(e)
    }
}

impl Seed {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, SeedError> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub books: usize,
    pub borrowers: usize,
}

/// Load `seed` into an empty library. Returns `None` without touching
/// anything if the library already has books or borrowers, so restarting
/// with the same seed configured is harmless.
pub async fn import(engine: &Engine, seed: &Seed) -> Result<Option<ImportSummary>, EngineError> {
    if !engine.catalog().is_empty() || !engine.members().is_empty() {
        info!("library not empty, seed skipped");
        return Ok(None);
    }

    let mut summary = ImportSummary::default();
    for borrower in &seed.borrowers {
        engine.register_borrower(borrower.clone()).await?;
        summary.borrowers += 1;
    }
    for details in &seed.books {
        engine.add_book(details.clone()).await?;
        summary.books += 1;
    }
    info!(books = summary.books, borrowers = summary.borrowers, "seed imported");
    Ok(Some(summary))
}
