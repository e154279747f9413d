//! Property-based convergence tests.
//!
//! A random edit script is applied to a source collection while a set of
//! operators follows it. Once the script is done and the workers go quiet,
//! every operator output must equal the result of applying the operator's
//! semantics to the final source contents from scratch.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use ripple_incremental::{
    shared, ChangeStream, Concat, Filter, Index, Indexed, Item, Join, JoinKind, Joined, Map, Reverse, Sort, Take,
    VersionedCollection,
};
use tokio::time::Instant;

#[derive(Clone, Debug)]
enum Edit {
    Insert { at: usize, values: Vec<i32> },
    Remove { at: usize, count: usize },
    Replace { at: usize, value: i32 },
    ReplaceMany { updates: Vec<(usize, i32)> },
    Clear,
    Pause,
}

/// Strategy for generating one edit. Positions are seeds reduced modulo the
/// collection length when the edit is applied.
fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        4 => (any::<usize>(), prop::collection::vec(-20i32..20, 1..4))
            .prop_map(|(at, values)| Edit::Insert { at, values }),
        3 => (any::<usize>(), 1usize..4).prop_map(|(at, count)| Edit::Remove { at, count }),
        3 => (any::<usize>(), -20i32..20).prop_map(|(at, value)| Edit::Replace { at, value }),
        1 => prop::collection::vec((any::<usize>(), -20i32..20), 1..4)
            .prop_map(|updates| Edit::ReplaceMany { updates }),
        1 => Just(Edit::Clear),
        2 => Just(Edit::Pause),
    ]
}

/// Applies `edit` to both the model and the collection.
///
/// When `unique` is set, edits that would introduce a duplicate value are
/// skipped.
async fn apply(edit: &Edit, model: &mut Vec<i32>, collection: &VersionedCollection<i32>, unique: bool) {
    match edit {
        Edit::Insert { at, values } => {
            let mut values = values.clone();
            if unique {
                let mut seen = model.clone();
                values.retain(|value| {
                    let fresh = !seen.contains(value);
                    seen.push(*value);
                    fresh
                });
                if values.is_empty() {
                    return;
                }
            }
            let at = at % (model.len() + 1);
            model.splice(at..at, values.iter().copied());
            collection.insert_range(at, values).await.unwrap();
        }
        Edit::Remove { at, count } => {
            if model.is_empty() {
                return;
            }
            let at = at % model.len();
            let count = (*count).min(model.len() - at);
            model.drain(at..at + count);
            collection.remove_range(at, count).await.unwrap();
        }
        Edit::Replace { at, value } => {
            if model.is_empty() || (unique && model.contains(value)) {
                return;
            }
            let at = at % model.len();
            model[at] = *value;
            collection.replace_at(at, *value).await.unwrap();
        }
        Edit::ReplaceMany { updates } => {
            if model.is_empty() || unique {
                return;
            }
            let mut applied: Vec<(usize, i32)> = Vec::new();
            for (seed, value) in updates {
                let at = seed % model.len();
                if applied.iter().all(|(index, _)| *index != at) {
                    applied.push((at, *value));
                }
            }
            for (at, value) in &applied {
                model[*at] = *value;
            }
            collection.replace_bulk(applied).await.unwrap();
        }
        Edit::Clear => {
            model.clear();
            collection.clear().await;
        }
        Edit::Pause => {
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        }
    }
}

async fn settle<T, S>(stream: &S, expected: &[T]) -> Vec<T>
where
    T: Item + PartialEq,
    S: ChangeStream<T> + ?Sized,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let items = stream.snapshot().await.into_items();
        if items == expected || Instant::now() >= deadline {
            return items;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Observed and expected contents of one operator.
struct Outcome {
    name: &'static str,
    actual: Vec<String>,
    expected: Vec<String>,
}

impl Outcome {
    fn new<T: std::fmt::Debug>(name: &'static str, actual: &[T], expected: &[T]) -> Self {
        let render = |items: &[T]| -> Vec<String> { items.iter().map(|item| format!("{item:?}")).collect() };
        Self {
            name,
            actual: render(actual),
            expected: render(expected),
        }
    }
}

async fn run_single_source(initial: Vec<i32>, edits: Vec<Edit>) -> Vec<Outcome> {
    let source = Arc::new(VersionedCollection::from_items(initial.clone()));
    let filtered = Filter::new(shared(&source), |n: &i32| n % 3 != 0).await;
    let sorted = Sort::new(shared(&filtered), |a: &i32, b: &i32| a.cmp(b)).await;
    let smallest = Take::first(shared(&sorted), 5).await;
    let tail = Take::last(shared(&source), 4).await;
    let reversed = Reverse::new(shared(&source)).await;
    let indexed = Index::new(shared(&source)).await;
    let doubled = Map::new(shared(&source), |n: &i32| n * 2).await;
    let concat = Concat::new(vec![shared(&filtered), shared(&source)]).await.unwrap();

    let mut model = initial;
    for edit in &edits {
        apply(edit, &mut model, &source, false).await;
    }

    let expected_filtered: Vec<i32> = model.iter().copied().filter(|n| n % 3 != 0).collect();
    let mut expected_sorted = expected_filtered.clone();
    expected_sorted.sort();
    let expected_smallest: Vec<i32> = expected_sorted.iter().copied().take(5).collect();
    let expected_tail: Vec<i32> = model[model.len().saturating_sub(4)..].to_vec();
    let expected_reversed: Vec<i32> = model.iter().rev().copied().collect();
    let expected_indexed: Vec<Indexed<i32>> = model
        .iter()
        .enumerate()
        .map(|(index, item)| Indexed::new(index, *item))
        .collect();
    let expected_doubled: Vec<i32> = model.iter().map(|n| n * 2).collect();
    let expected_concat: Vec<i32> = expected_filtered.iter().chain(model.iter()).copied().collect();

    vec![
        Outcome::new("filter", &settle(&*filtered, &expected_filtered).await, &expected_filtered),
        Outcome::new("sort", &settle(&*sorted, &expected_sorted).await, &expected_sorted),
        Outcome::new("take_first", &settle(&*smallest, &expected_smallest).await, &expected_smallest),
        Outcome::new("take_last", &settle(&*tail, &expected_tail).await, &expected_tail),
        Outcome::new("reverse", &settle(&*reversed, &expected_reversed).await, &expected_reversed),
        Outcome::new("index", &settle(&*indexed, &expected_indexed).await, &expected_indexed),
        Outcome::new("map", &settle(&*doubled, &expected_doubled).await, &expected_doubled),
        Outcome::new("concat", &settle(&*concat, &expected_concat).await, &expected_concat),
    ]
}

/// Full outer join of `left` and `right` under equality, where `right` holds
/// distinct values.
fn expected_join(left: &[i32], right: &[i32]) -> Vec<Joined<i32, i32>> {
    let mut rows: Vec<Joined<i32, i32>> = left
        .iter()
        .map(|l| {
            if right.contains(l) {
                Joined::matched(*l, *l)
            } else {
                Joined::left_only(*l)
            }
        })
        .collect();
    rows.extend(right.iter().filter(|r| !left.contains(r)).map(|r| Joined::right_only(*r)));
    rows
}

async fn run_join(left_initial: Vec<i32>, right_initial: Vec<i32>, edits: Vec<(bool, Edit)>) -> Vec<Outcome> {
    let left = Arc::new(VersionedCollection::from_items(left_initial.clone()));
    let right = Arc::new(VersionedCollection::from_items(right_initial.clone()));
    let joined = Join::new(shared(&left), shared(&right), |l: &i32, r: &i32| l == r, JoinKind::FullOuter)
        .await
        .unwrap();
    let inner = Join::new(shared(&left), shared(&right), |l: &i32, r: &i32| l == r, JoinKind::Inner)
        .await
        .unwrap();

    let mut left_model = left_initial;
    let mut right_model = right_initial;
    for (on_left, edit) in &edits {
        if *on_left {
            apply(edit, &mut left_model, &left, false).await;
        } else {
            apply(edit, &mut right_model, &right, true).await;
        }
    }

    let expected = expected_join(&left_model, &right_model);
    let expected_inner: Vec<Joined<i32, i32>> = expected.iter().filter(|row| row.is_matched()).cloned().collect();
    vec![
        Outcome::new("full_outer_join", &settle(&*joined, &expected).await, &expected),
        Outcome::new("inner_join", &settle(&*inner, &expected_inner).await, &expected_inner),
    ]
}

fn distinct_values() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::hash_set(-20i32..20, 0..8).prop_map(|set| set.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: every single-source operator converges to its model.
    #[test]
    fn operators_converge_to_model(
        initial in prop::collection::vec(-20i32..20, 0..12),
        edits in prop::collection::vec(edit_strategy(), 0..30),
    ) {
        let outcomes = runtime().block_on(run_single_source(initial, edits));
        for outcome in outcomes {
            prop_assert_eq!(outcome.actual, outcome.expected, "operator {}", outcome.name);
        }
    }

    /// Property: join converges when the right side holds distinct values.
    #[test]
    fn join_converges_to_model(
        left in prop::collection::vec(-20i32..20, 0..10),
        right in distinct_values(),
        edits in prop::collection::vec((any::<bool>(), edit_strategy()), 0..30),
    ) {
        let outcomes = runtime().block_on(run_join(left, right, edits));
        for outcome in outcomes {
            prop_assert_eq!(outcome.actual, outcome.expected, "operator {}", outcome.name);
        }
    }
}
