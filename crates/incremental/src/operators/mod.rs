//! Derived operators.
//!
//! Every operator subscribes to one or more upstream streams, keeps a private
//! shadow state on its own worker task, and maintains a materialized output
//! that is itself a [`ChangeStream`](ripple_reactive::ChangeStream):
//! - Filter: subsequence accepted by a swappable predicate
//! - Concat: several sources appended in order
//! - Index: elements paired with their position
//! - Map: element-wise transform
//! - Sort: ordering under a swappable comparer
//! - Reverse: mirrored order
//! - Take: first-N or last-N window with a swappable width
//! - HotSwap: pass-through with a replaceable source
//! - Join: inner, left, right or full outer join built from the above

mod concat;
mod filter;
mod hot_swap;
mod index;
mod join;
mod map;
mod reverse;
mod sort;
mod take;

pub use concat::Concat;
pub use filter::{AsyncPredicate, Filter, Predicate};
pub use hot_swap::HotSwap;
pub use index::{Index, Indexed};
pub use join::{Join, JoinKind, Joined, MatchFn};
pub use map::{Map, Mapper};
pub use reverse::Reverse;
pub use sort::{Comparer, Sort};
pub use take::{Take, TakeFrom};
