//! Incremental relational join of two sources.
//!
//! The join is assembled from the other operators:
//!
//! ```text
//! right rows ─ Index ─ Filter(unmatched) ─ Map(right only) ─┐
//!                                                           Concat ─ Filter(kind) ─ output
//! left rows (left, first matching right or none) ───────────┘
//! ```
//!
//! A dedicated worker owns both source copies and two correlation tables:
//! the first matching right index of every left element, and the list of
//! left elements claiming every right element. Every change to a right
//! element's claim list is followed by an edit of that element in the right
//! rows collection, so the unmatched filter always re-evaluates it.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashSet;
use parking_lot::Mutex;
use ripple_core::{ChangeEvent, Error, Item, OperatorConfig, Result};
use ripple_reactive::{shared, ChangeStream, Listener, SharedStream, Subscription, VersionedCollection};
use tracing::{debug, trace};

use super::{Concat, Filter, Index, Indexed, Map};
use crate::replay::{attach, new_port, rebase_from, Port};
use crate::worker::{Drain, Signal, Worker};

/// Shared match condition between a left and a right element.
pub type MatchFn<L, R> = Arc<dyn Fn(&L, &R) -> bool + Send + Sync>;

/// Which rows a join keeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JoinKind {
    /// Matched pairs only.
    Inner,
    /// Every left element, matched or not.
    Left,
    /// Matched pairs and unmatched right elements.
    Right,
    /// Everything.
    FullOuter,
}

impl JoinKind {
    /// Returns true if a row of this shape belongs to the join result.
    pub fn admits<L, R>(self, row: &Joined<L, R>) -> bool {
        match self {
            JoinKind::Inner => row.left.is_some() && row.right.is_some(),
            JoinKind::Left => row.left.is_some(),
            JoinKind::Right => row.right.is_some(),
            JoinKind::FullOuter => true,
        }
    }
}

/// One row of a join result.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Joined<L, R> {
    pub left: Option<L>,
    pub right: Option<R>,
}

impl<L, R> Joined<L, R> {
    #[inline]
    pub fn matched(left: L, right: R) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
        }
    }

    #[inline]
    pub fn left_only(left: L) -> Self {
        Self {
            left: Some(left),
            right: None,
        }
    }

    #[inline]
    pub fn right_only(right: R) -> Self {
        Self {
            left: None,
            right: Some(right),
        }
    }

    #[inline]
    pub fn is_matched(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }
}

/// Materialized join of two sources.
///
/// Every left element is paired with the first right element (in source
/// order) it matches. Right elements claimed by no left element appear after
/// all left rows, in source order.
///
/// # Example
///
/// ```ignore
/// let users = Arc::new(VersionedCollection::from_items(vec![(1, "ada"), (2, "grace")]));
/// let logins = Arc::new(VersionedCollection::from_items(vec![(2, "10:42")]));
/// let join = Join::new(shared(&users), shared(&logins), |u: &(i32, &str), l: &(i32, &str)| u.0 == l.0, JoinKind::Inner).await?;
/// // join -> [Joined { left: Some((2, "grace")), right: Some((2, "10:42")) }]
/// ```
pub struct Join<L: Item, R: Item> {
    kind: JoinKind,
    result: Arc<Filter<Joined<L, R>>>,
    merged: Arc<Concat<Joined<L, R>>>,
    unmatched: Arc<Map<Indexed<R>, Joined<L, R>>>,
    unmatched_rows: Arc<Filter<Indexed<R>>>,
    indexed: Arc<Index<R>>,
    worker: Worker,
}

impl<L: Item, R: Item> Join<L, R> {
    pub async fn new<F>(left: SharedStream<L>, right: SharedStream<R>, matches: F, kind: JoinKind) -> Result<Arc<Self>>
    where
        F: Fn(&L, &R) -> bool + Send + Sync + 'static,
    {
        Self::with_config(&OperatorConfig::new("join"), left, right, matches, kind).await
    }

    pub async fn with_config<F>(
        config: &OperatorConfig,
        left: SharedStream<L>,
        right: SharedStream<R>,
        matches: F,
        kind: JoinKind,
    ) -> Result<Arc<Self>>
    where
        F: Fn(&L, &R) -> bool + Send + Sync + 'static,
    {
        let left_rows: Arc<VersionedCollection<Joined<L, R>>> = Arc::new(VersionedCollection::new());
        let right_rows: Arc<VersionedCollection<R>> = Arc::new(VersionedCollection::new());
        let right_to_left: Arc<Mutex<Vec<Vec<usize>>>> = Arc::default();

        let indexed = Index::with_config(&config.child("right_index"), shared(&right_rows)).await;
        let claims = Arc::clone(&right_to_left);
        let unmatched_rows = Filter::with_config(
            &config.child("unmatched"),
            shared(&indexed),
            move |row: &Indexed<R>| claims.lock().get(row.index).is_some_and(|lefts| lefts.is_empty()),
        )
        .await;
        let unmatched = Map::with_config(
            &config.child("right_only"),
            shared(&unmatched_rows),
            |row: &Indexed<R>| Joined::<L, R>::right_only(row.item.clone()),
        )
        .await;
        let merged = Concat::with_config(
            &config.child("merge"),
            vec![shared(&left_rows), shared(&unmatched)],
        )
        .await?;
        let result = Filter::with_config(
            &config.child("kind"),
            shared(&merged),
            move |row: &Joined<L, R>| kind.admits(row),
        )
        .await;

        let signal = Signal::new();
        let left_port = new_port();
        let right_port = new_port();
        let subscriptions = [
            attach(&*left, &left_port, &signal),
            attach(&*right, &right_port, &signal),
        ];
        rebase_from(&left_port, &*left).await;
        rebase_from(&right_port, &*right).await;
        debug!(operator = %config.label, ?kind, "join attached");

        let state = JoinState {
            label: config.label.clone(),
            check: config.check_invariants,
            matches: Arc::new(matches),
            left,
            right,
            left_port,
            right_port,
            _subscriptions: subscriptions,
            left_items: Vec::new(),
            right_items: Vec::new(),
            left_to_right: Vec::new(),
            right_to_left,
            left_rows,
            right_rows,
        };
        let worker = Worker::spawn(config, signal, state);
        Ok(Arc::new(Self {
            kind,
            result,
            merged,
            unmatched,
            unmatched_rows,
            indexed,
            worker,
        }))
    }

    #[inline]
    pub fn kind(&self) -> JoinKind {
        self.kind
    }

    #[inline]
    pub fn output(&self) -> &Arc<VersionedCollection<Joined<L, R>>> {
        self.result.output()
    }

    /// Stops the matching worker and every inner stage.
    pub async fn dispose(&self) {
        self.worker.shutdown().await;
        self.indexed.dispose().await;
        self.unmatched_rows.dispose().await;
        self.unmatched.dispose().await;
        self.merged.dispose().await;
        self.result.dispose().await;
    }
}

#[async_trait]
impl<L: Item, R: Item> ChangeStream<Joined<L, R>> for Join<L, R> {
    fn subscribe(&self, listener: Listener<Joined<L, R>>) -> Subscription {
        self.result.subscribe(listener)
    }

    async fn snapshot(&self) -> ChangeEvent<Joined<L, R>> {
        self.result.snapshot().await
    }
}

/// Edits collected while applying one record, emitted together.
struct Pending<L, R> {
    left: Vec<(usize, Joined<L, R>)>,
    right: Vec<(usize, R)>,
    touch: Vec<usize>,
}

impl<L, R> Default for Pending<L, R> {
    fn default() -> Self {
        Self {
            left: Vec::new(),
            right: Vec::new(),
            touch: Vec::new(),
        }
    }
}

struct JoinState<L: Item, R: Item> {
    label: String,
    check: bool,
    matches: MatchFn<L, R>,
    left: SharedStream<L>,
    right: SharedStream<R>,
    left_port: Port<L>,
    right_port: Port<R>,
    _subscriptions: [Subscription; 2],
    left_items: Vec<L>,
    right_items: Vec<R>,
    /// left index -> first matching right index
    left_to_right: Vec<Option<usize>>,
    /// right index -> left indices claiming it; read by the unmatched filter
    right_to_left: Arc<Mutex<Vec<Vec<usize>>>>,
    left_rows: Arc<VersionedCollection<Joined<L, R>>>,
    right_rows: Arc<VersionedCollection<R>>,
}

impl<L: Item, R: Item> JoinState<L, R> {
    /// Pairs every still unmatched candidate with its first matching right element.
    ///
    /// Candidates in `released` lost their previous match and get a
    /// left-only row when nothing matches them anymore.
    fn match_unmatched(
        &mut self,
        candidates: &[usize],
        released: &HashSet<usize>,
        pending: &mut Pending<L, R>,
    ) -> Result<()> {
        let mut right_to_left = self.right_to_left.lock();
        for &index in candidates {
            let (Some(left), Some(slot)) = (self.left_items.get(index), self.left_to_right.get(index)) else {
                return Err(Error::stale(format!("join left row {index} past end")));
            };
            if slot.is_some() {
                continue;
            }
            match self.right_items.iter().position(|right| (self.matches)(left, right)) {
                Some(claimed) => {
                    self.left_to_right[index] = Some(claimed);
                    let lefts = &mut right_to_left[claimed];
                    lefts.push(index);
                    if lefts.len() == 1 {
                        pending.touch.push(claimed);
                    }
                    pending.left.push((
                        index,
                        Joined::matched(left.clone(), self.right_items[claimed].clone()),
                    ));
                }
                None if released.contains(&index) => {
                    pending.left.push((index, Joined::left_only(left.clone())));
                }
                None => {}
            }
        }
        Ok(())
    }

    async fn flush(&self, pending: Pending<L, R>) -> Result<()> {
        let Pending {
            left,
            right,
            mut touch,
        } = pending;
        if !left.is_empty() {
            self.left_rows.replace_bulk(left).await?;
        }
        if !right.is_empty() {
            let replaced: HashSet<usize> = right.iter().map(|(index, _)| *index).collect();
            touch.retain(|index| !replaced.contains(index));
            self.right_rows.replace_bulk(right).await?;
        }
        touch.sort_unstable();
        touch.dedup();
        if !touch.is_empty() {
            self.right_rows.touch(&touch).await?;
        }
        Ok(())
    }

    fn all_left(&self) -> Vec<usize> {
        (0..self.left_items.len()).collect()
    }

    // ---- Left side ----

    async fn reset_left(&mut self) -> Result<()> {
        self.left_items.clear();
        self.left_to_right.clear();
        let freed: Vec<usize> = {
            let mut right_to_left = self.right_to_left.lock();
            let mut freed = Vec::new();
            for (index, lefts) in right_to_left.iter_mut().enumerate() {
                if !lefts.is_empty() {
                    lefts.clear();
                    freed.push(index);
                }
            }
            freed
        };
        if !self.left_rows.is_empty().await {
            self.left_rows.clear().await;
        }
        if !freed.is_empty() {
            self.right_rows.touch(&freed).await?;
        }
        rebase_from(&self.left_port, &*self.left).await;
        Ok(())
    }

    async fn on_left_inserted(&mut self, at: usize, items: &[L]) -> Result<()> {
        if at > self.left_items.len() {
            return Err(Error::stale(format!(
                "join left insert at {at} past length {}",
                self.left_items.len()
            )));
        }
        let count = items.len();
        if count == 0 {
            return Ok(());
        }
        let mut touch = Vec::new();
        let rows: Vec<Joined<L, R>> = {
            let mut right_to_left = self.right_to_left.lock();
            for index in right_to_left.iter_mut().flatten() {
                if *index >= at {
                    *index += count;
                }
            }
            let mut rows = Vec::with_capacity(count);
            let mut slots = Vec::with_capacity(count);
            for (offset, item) in items.iter().enumerate() {
                match self.right_items.iter().position(|right| (self.matches)(item, right)) {
                    Some(claimed) => {
                        let lefts = &mut right_to_left[claimed];
                        lefts.push(at + offset);
                        if lefts.len() == 1 {
                            touch.push(claimed);
                        }
                        slots.push(Some(claimed));
                        rows.push(Joined::matched(item.clone(), self.right_items[claimed].clone()));
                    }
                    None => {
                        slots.push(None);
                        rows.push(Joined::left_only(item.clone()));
                    }
                }
            }
            self.left_to_right.splice(at..at, slots);
            rows
        };
        self.left_items.splice(at..at, items.iter().cloned());
        self.left_rows.insert_range(at, rows).await?;
        if !touch.is_empty() {
            self.right_rows.touch(&touch).await?;
        }
        Ok(())
    }

    async fn on_left_removed(&mut self, at: usize, count: usize) -> Result<()> {
        let end = at + count;
        if end > self.left_items.len() {
            return Err(Error::stale(format!(
                "join left remove of {at}..{end} past length {}",
                self.left_items.len()
            )));
        }
        if count == 0 {
            return Ok(());
        }
        self.left_items.drain(at..end);
        self.left_to_right.drain(at..end);
        let freed: Vec<usize> = {
            let mut right_to_left = self.right_to_left.lock();
            let mut freed = Vec::new();
            for (claimed, lefts) in right_to_left.iter_mut().enumerate() {
                let before = lefts.len();
                lefts.retain(|&index| index < at || index >= end);
                for index in lefts.iter_mut() {
                    if *index >= end {
                        *index -= count;
                    }
                }
                if before > 0 && lefts.is_empty() {
                    freed.push(claimed);
                }
            }
            freed
        };
        self.left_rows.remove_range(at, count).await?;
        if !freed.is_empty() {
            self.right_rows.touch(&freed).await?;
        }
        Ok(())
    }

    async fn on_left_replaced(&mut self, indices: &[usize], new_items: &[L]) -> Result<()> {
        let mut pending = Pending::default();
        let mut released = HashSet::new();
        {
            let mut right_to_left = self.right_to_left.lock();
            for (&index, item) in indices.iter().zip(new_items) {
                let slot = self
                    .left_items
                    .get_mut(index)
                    .ok_or_else(|| Error::stale(format!("join left replace at {index} past end")))?;
                *slot = item.clone();
                if let Some(claimed) = self.left_to_right[index].take() {
                    let lefts = right_to_left
                        .get_mut(claimed)
                        .ok_or_else(|| Error::stale(format!("join claim on missing right row {claimed}")))?;
                    lefts.retain(|&left| left != index);
                    if lefts.is_empty() {
                        pending.touch.push(claimed);
                    }
                }
                released.insert(index);
            }
        }
        self.match_unmatched(indices, &released, &mut pending)?;
        self.flush(pending).await
    }

    // ---- Right side ----

    async fn reset_right(&mut self) -> Result<()> {
        self.right_items.clear();
        self.right_to_left.lock().clear();
        let mut updates = Vec::new();
        for (index, slot) in self.left_to_right.iter_mut().enumerate() {
            if slot.take().is_some() {
                updates.push((index, Joined::left_only(self.left_items[index].clone())));
            }
        }
        if !self.right_rows.is_empty().await {
            self.right_rows.clear().await;
        }
        if !updates.is_empty() {
            self.left_rows.replace_bulk(updates).await?;
        }
        rebase_from(&self.right_port, &*self.right).await;
        Ok(())
    }

    async fn on_right_inserted(&mut self, at: usize, items: &[R]) -> Result<()> {
        if at > self.right_items.len() {
            return Err(Error::stale(format!(
                "join right insert at {at} past length {}",
                self.right_items.len()
            )));
        }
        let count = items.len();
        if count == 0 {
            return Ok(());
        }
        for claimed in self.left_to_right.iter_mut().flatten() {
            if *claimed >= at {
                *claimed += count;
            }
        }
        self.right_to_left
            .lock()
            .splice(at..at, std::iter::repeat_with(Vec::new).take(count));
        self.right_items.splice(at..at, items.iter().cloned());
        self.right_rows.insert_range(at, items.to_vec()).await?;

        let mut pending = Pending::default();
        let candidates = self.all_left();
        self.match_unmatched(&candidates, &HashSet::new(), &mut pending)?;
        self.flush(pending).await
    }

    async fn on_right_removed(&mut self, at: usize, count: usize) -> Result<()> {
        let end = at + count;
        if end > self.right_items.len() {
            return Err(Error::stale(format!(
                "join right remove of {at}..{end} past length {}",
                self.right_items.len()
            )));
        }
        if count == 0 {
            return Ok(());
        }
        let mut released: Vec<usize> = self
            .right_to_left
            .lock()
            .drain(at..end)
            .flatten()
            .collect();
        for &index in &released {
            let slot = self
                .left_to_right
                .get_mut(index)
                .ok_or_else(|| Error::stale(format!("join claim by missing left row {index}")))?;
            *slot = None;
        }
        for claimed in self.left_to_right.iter_mut().flatten() {
            if *claimed >= end {
                *claimed -= count;
            }
        }
        self.right_items.drain(at..end);
        self.right_rows.remove_range(at, count).await?;

        released.sort_unstable();
        let released_set: HashSet<usize> = released.iter().copied().collect();
        let mut pending = Pending::default();
        self.match_unmatched(&released, &released_set, &mut pending)?;
        self.flush(pending).await
    }

    async fn on_right_replaced(&mut self, indices: &[usize], new_items: &[R]) -> Result<()> {
        let mut pending = Pending::default();
        let mut released = HashSet::new();
        {
            let mut right_to_left = self.right_to_left.lock();
            for (&claimed, item) in indices.iter().zip(new_items) {
                let slot = self
                    .right_items
                    .get_mut(claimed)
                    .ok_or_else(|| Error::stale(format!("join right replace at {claimed} past end")))?;
                *slot = item.clone();
                let lefts = right_to_left
                    .get_mut(claimed)
                    .ok_or_else(|| Error::stale(format!("join claims missing for right row {claimed}")))?;
                let mut kept = Vec::with_capacity(lefts.len());
                for &index in lefts.iter() {
                    let left = self
                        .left_items
                        .get(index)
                        .ok_or_else(|| Error::stale(format!("join claim by missing left row {index}")))?;
                    if (self.matches)(left, item) {
                        kept.push(index);
                        pending.left.push((index, Joined::matched(left.clone(), item.clone())));
                    } else {
                        self.left_to_right[index] = None;
                        released.insert(index);
                    }
                }
                *lefts = kept;
                pending.right.push((claimed, item.clone()));
            }
        }
        let candidates = self.all_left();
        self.match_unmatched(&candidates, &released, &mut pending)?;
        self.flush(pending).await
    }

    async fn apply_left(&mut self, event: &ChangeEvent<L>) -> Result<()> {
        match event {
            ChangeEvent::Reset { .. } => self.reset_left().await,
            ChangeEvent::Inserted { start, items, .. } => self.on_left_inserted(*start, items).await,
            ChangeEvent::Removed { start, items, .. } => self.on_left_removed(*start, items.len()).await,
            ChangeEvent::Replaced {
                indices, new_items, ..
            } => self.on_left_replaced(indices, new_items).await,
        }
    }

    async fn apply_right(&mut self, event: &ChangeEvent<R>) -> Result<()> {
        match event {
            ChangeEvent::Reset { .. } => self.reset_right().await,
            ChangeEvent::Inserted { start, items, .. } => self.on_right_inserted(*start, items).await,
            ChangeEvent::Removed { start, items, .. } => self.on_right_removed(*start, items.len()).await,
            ChangeEvent::Replaced {
                indices, new_items, ..
            } => self.on_right_replaced(indices, new_items).await,
        }
    }

    async fn verify(&self) -> Result<()> {
        {
            let right_to_left = self.right_to_left.lock();
            if right_to_left.len() != self.right_items.len() {
                return Err(Error::stale(format!(
                    "join tracks claims for {} right rows but holds {}",
                    right_to_left.len(),
                    self.right_items.len()
                )));
            }
            let mut claims = 0;
            for (index, slot) in self.left_to_right.iter().enumerate() {
                if let Some(claimed) = slot {
                    claims += 1;
                    if !right_to_left.get(*claimed).is_some_and(|lefts| lefts.contains(&index)) {
                        return Err(Error::stale(format!(
                            "join left row {index} claims right row {claimed} one way only"
                        )));
                    }
                }
            }
            let recorded: usize = right_to_left.iter().map(Vec::len).sum();
            if recorded != claims {
                return Err(Error::stale(format!(
                    "join holds {recorded} right claims for {claims} matched left rows"
                )));
            }
        }
        let left_len = self.left_rows.len().await;
        let right_len = self.right_rows.len().await;
        if left_len != self.left_items.len() || right_len != self.right_items.len() {
            return Err(Error::stale(format!(
                "join rows ({left_len}, {right_len}) out of step with sources ({}, {})",
                self.left_items.len(),
                self.right_items.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl<L: Item, R: Item> Drain for JoinState<L, R> {
    async fn step(&mut self) -> Result<bool> {
        let mut progressed = false;
        let left = self.left_port.lock().pop_ready();
        if let Some(event) = left {
            trace!(operator = %self.label, side = "left", version = event.version(), kind = ?event.kind(), "applying change");
            self.apply_left(&event).await?;
            progressed = true;
        }
        let right = self.right_port.lock().pop_ready();
        if let Some(event) = right {
            trace!(operator = %self.label, side = "right", version = event.version(), kind = ?event.kind(), "applying change");
            self.apply_right(&event).await?;
            progressed = true;
        }
        if progressed && self.check {
            self.verify().await?;
        }
        Ok(progressed)
    }

    fn poison(&mut self) {
        self.left_port.lock().poison();
        self.right_port.lock().poison();
    }
}
