//! Domain entities
//!
//! This module contains the core domain types for shiplink:
//! - `ItemId` - validated opaque identifier for a unit of work
//! - `RetryRecord` - per-item failure bookkeeping
//! - `StatusPolicy` - classification of remote status codes
//! - `TokenState` - an immutable credential with its expiry
//! - Domain-specific error types

pub mod errors;
pub mod item;
pub mod status;
pub mod token;

// Re-export commonly used types
pub use errors::DomainError;
pub use item::{ItemId, RetryRecord};
pub use status::StatusPolicy;
pub use token::TokenState;
