//! Ripple Incremental - Incrementally maintained collection operators.
//!
//! This crate implements the derived side of a ripple pipeline. Each
//! operator consumes versioned change records from its upstream streams and
//! keeps a materialized output consistent by applying the minimal edit each
//! record implies, re-reading an upstream in full only on reset.
//!
//! # Core Concepts
//!
//! - `ReplayBuffer`: Buffers out-of-order records and releases them strictly by version
//! - Drain worker: One task per operator owns its shadow state; feeders only enqueue and wake it
//! - Operators: `Filter`, `Concat`, `Index`, `Map`, `Sort`, `Reverse`, `Take`, `HotSwap`, `Join`
//!
//! Every operator output is itself a `ChangeStream`, so operators chain freely.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ripple_incremental::{Filter, Sort, Take};
//! use ripple_reactive::{shared, VersionedCollection};
//!
//! let scores = Arc::new(VersionedCollection::from_items(vec![12, 7, 30, 18, 3]));
//!
//! // Source -> Filter(score >= 10) -> Sort(desc) -> Take(first 2)
//! let passing = Filter::new(shared(&scores), |s: &i32| *s >= 10).await;
//! let ranked = Sort::new(shared(&passing), |a: &i32, b: &i32| b.cmp(a)).await;
//! let podium = Take::first(shared(&ranked), 2).await;
//!
//! scores.push_range(vec![25]).await;
//! // podium converges to [30, 25]
//! ```

mod operators;
mod replay;
mod worker;

#[cfg(test)]
mod testing;

pub use operators::{
    AsyncPredicate, Comparer, Concat, Filter, HotSwap, Index, Indexed, Join, JoinKind, Joined, Map, Mapper, MatchFn,
    Predicate, Reverse, Sort, Take, TakeFrom,
};
pub use replay::ReplayBuffer;

// Re-export commonly used types from dependencies
pub use ripple_core::{ChangeEvent, ChangeKind, Error, Item, OperatorConfig, Result, Version};
pub use ripple_reactive::{shared, ChangeStream, SharedStream, Subscription, VersionedCollection};
