//! Ripple Reactive - Versioned collections and change subscriptions.
//!
//! This crate implements the source side of a ripple pipeline: a mutable
//! collection that publishes one versioned change record per mutation, and
//! the subscription machinery used to observe it.
//!
//! # Core Concepts
//!
//! - `VersionedCollection`: Ordered, versioned sequence; the source of truth and every operator's output
//! - `ChangeStream`: The push channel + snapshot contract every collection and operator exposes
//! - `Publisher` / `SubscriptionManager`: Listener registry and fan-out
//! - `Subscription`: Guard that keeps a listener registered until dropped
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ripple_reactive::{ChangeStream, VersionedCollection};
//!
//! let people = VersionedCollection::from_items(vec!["ada", "grace"]);
//!
//! let _sub = people.subscribe(Arc::new(|change| {
//!     println!("version {} touched {} items", change.version(), change.len());
//! }));
//!
//! people.push_range(vec!["barbara"]).await;
//! let snapshot = people.snapshot().await; // Inserted { version: 1, start: 0, items }
//! ```

mod collection;
mod stream;
mod subscription;

pub use collection::VersionedCollection;
pub use stream::{shared, ChangeStream, SharedStream};
pub use subscription::{Listener, Publisher, Subscription, SubscriptionId, SubscriptionManager};

// Re-export commonly used types from dependencies
pub use ripple_core::{ChangeEvent, ChangeKind, Error, Item, OperatorConfig, Result, Version};
