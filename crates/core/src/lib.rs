//! Ripple Core - Shared types for the ripple incremental collection engine.
//!
//! This crate provides the vocabulary every other ripple crate speaks:
//!
//! - `ChangeEvent`: One versioned edit of an ordered collection (reset, insert, remove, replace)
//! - `Version`: The strictly increasing sequence number carried by every change
//! - `Item`: Bound satisfied by every element type flowing through a pipeline
//! - `OperatorConfig`: Per-operator settings (log label, scheduling, self checks)
//! - `Error`: Error types for collection and operator operations
//!
//! # Example
//!
//! ```rust
//! use ripple_core::{ChangeEvent, ChangeKind};
//!
//! let event = ChangeEvent::Inserted { version: 3, start: 0, items: vec![1, 2] };
//! assert_eq!(event.version(), 3);
//! assert_eq!(event.kind(), ChangeKind::Inserted);
//! assert_eq!(event.len(), 2);
//! ```

mod change;
mod config;
mod error;

pub use change::{ChangeEvent, ChangeKind, Item, Version};
pub use config::OperatorConfig;
pub use error::{Error, Result};
