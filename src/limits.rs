//! Input bounds enforced by the engine.

pub const MAX_BOOKS: usize = 1_000_000;
pub const MAX_BORROWERS: usize = 1_000_000;

pub const MAX_TITLE_LEN: usize = 512;
pub const MAX_AUTHOR_LEN: usize = 256;
pub const MAX_ISBN_LEN: usize = 32;
pub const MAX_ROLL_NO_LEN: usize = 64;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DEPARTMENT_LEN: usize = 128;
pub const MAX_SEARCH_QUERY_LEN: usize = 256;
