pub mod access;
pub mod catalog;
pub mod role;
pub mod token;
pub mod user;

use serde::Deserialize;

/// Offset/limit window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Page {
    #[serde(default, rename = "page_offset")]
    pub offset: i64,
    #[serde(default = "Page::default_limit", rename = "page_limit")]
    pub limit: i64,
}

impl Page {
    pub const MAX_LIMIT: i64 = 100;

    fn default_limit() -> i64 {
        Self::MAX_LIMIT
    }

    /// Reject windows larger than [`Page::MAX_LIMIT`] or with negative bounds.
    pub fn validate(self) -> Result<Self, crate::errors::AppError> {
        if self.offset < 0 || self.limit < 0 {
            return Err(crate::errors::AppError::BadRequest("illegal page window".into()));
        }
        if self.limit > Self::MAX_LIMIT {
            return Err(crate::errors::AppError::BadRequest(
                "page_limit exceeds maximum".into(),
            ));
        }
        Ok(self)
    }

    /// Apply the window to an already ordered sequence.
    pub fn slice<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset.max(0) as usize)
            .take(self.limit.max(0) as usize)
            .cloned()
            .collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: Self::MAX_LIMIT,
        }
    }
}
