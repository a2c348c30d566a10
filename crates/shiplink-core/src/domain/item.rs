//! Work items and their retry bookkeeping
//!
//! The resilience layer never interprets what an item *is* (a shipment, a
//! document, a label); it only needs a stable identifier to attach failure
//! history to.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Opaque identifier of a unit of work.
///
/// Any non-empty string without control characters is accepted; the remote
/// side owns the format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemId(String);

impl ItemId {
    /// Create a new ItemId
    ///
    /// # Errors
    /// Returns error if the ID is empty, blank, or contains control characters
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.trim().is_empty() {
            return Err(DomainError::InvalidItemId(
                "Item ID cannot be empty".to_string(),
            ));
        }

        if id.chars().any(char::is_control) {
            return Err(DomainError::InvalidItemId(format!(
                "Item ID contains control characters: {id:?}"
            )));
        }

        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ItemId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ItemId> for String {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

/// Failure history for a single item.
///
/// Created lazily on the first failure, dropped on success. Once
/// `retry_count` exceeds the limiter's `max_retries` the item is considered
/// permanently failed and the record is kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    /// Identifier of the item this record belongs to
    pub item_id: String,
    /// Number of failed attempts so far
    pub retry_count: u32,
    /// Description of the most recent failure
    pub last_error: String,
    /// When the most recent attempt happened
    pub last_attempt_at: DateTime<Utc>,
}

impl RetryRecord {
    /// Creates an empty record (no failures yet) for `item_id`.
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            retry_count: 0,
            last_error: String::new(),
            last_attempt_at: Utc::now(),
        }
    }

    /// Records one more failed attempt and returns the new count.
    pub fn record_failure(&mut self, error: impl Into<String>) -> u32 {
        self.retry_count += 1;
        self.last_error = error.into();
        self.last_attempt_at = Utc::now();
        self.retry_count
    }
}
