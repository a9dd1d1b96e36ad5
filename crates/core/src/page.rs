//! Limit/offset paging for list queries.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Page size used when the caller does not supply one.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Upper bound on a single page.
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// A window over an ordered result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    /// First page of `limit` rows.
    pub fn first(limit: u32) -> Self {
        Self { limit, offset: 0 }
    }

    /// Build a page from optional caller input, applying the default limit.
    ///
    /// A zero limit or one above [`MAX_PAGE_LIMIT`] is rejected rather than clamped.
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> DomainResult<Self> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
        if limit == 0 {
            return Err(DomainError::validation("limit must be at least 1"));
        }
        if limit > MAX_PAGE_LIMIT {
            return Err(DomainError::validation(format!(
                "limit cannot exceed {MAX_PAGE_LIMIT}"
            )));
        }
        Ok(Self {
            limit,
            offset: offset.unwrap_or(0),
        })
    }

    pub fn limit_i64(&self) -> i64 {
        i64::from(self.limit)
    }

    pub fn offset_i64(&self) -> i64 {
        i64::from(self.offset)
    }

    /// Slice an already-ordered collection to this page.
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .cloned()
            .collect()
    }
}
