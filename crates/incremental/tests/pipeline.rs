//! Integration tests for chained operator pipelines.
//!
//! Every operator output is a `ChangeStream`, so these tests build small
//! graphs out of several operators, drive the sources, and wait for the
//! tail of the graph to converge.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ripple_incremental::{
    shared, ChangeEvent, ChangeStream, Concat, Filter, HotSwap, Index, Indexed, Item, Join, JoinKind, Joined,
    Map, OperatorConfig, Reverse, Sort, Subscription, Take, VersionedCollection,
};
use tokio::time::Instant;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Polls `stream` until it holds `expected` or five seconds pass.
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
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

fn record<T, S>(stream: &S) -> (Subscription, Arc<Mutex<Vec<ChangeEvent<T>>>>)
where
    T: Item,
    S: ChangeStream<T> + ?Sized,
{
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let subscription = stream.subscribe(Arc::new(move |event: &Arc<ChangeEvent<T>>| {
        sink.lock().push(ChangeEvent::clone(event));
    }));
    (subscription, log)
}

#[tokio::test]
async fn test_filter_sort_take_chain() {
    init_tracing();
    let scores = Arc::new(VersionedCollection::from_items(vec![12, 7, 30, 18, 3]));
    let passing = Filter::new(shared(&scores), |s: &i32| *s >= 10).await;
    let ranked = Sort::new(shared(&passing), |a: &i32, b: &i32| b.cmp(a)).await;
    let podium = Take::first(shared(&ranked), 2).await;

    assert_eq!(settle(&*podium, &[30, 18]).await, vec![30, 18]);

    scores.push_range(vec![25]).await;
    assert_eq!(settle(&*podium, &[30, 25]).await, vec![30, 25]);

    // 30 -> 5 drops out of the filter entirely
    scores.replace_at(2, 5).await.unwrap();
    assert_eq!(settle(&*podium, &[25, 18]).await, vec![25, 18]);

    scores.remove_range(0, 2).await.unwrap();
    assert_eq!(settle(&*podium, &[25, 18]).await, vec![25, 18]);

    podium.set_count(5);
    assert_eq!(settle(&*ranked, &[25, 18]).await, vec![25, 18]);
    assert_eq!(settle(&*podium, &[25, 18]).await, vec![25, 18]);
}

#[tokio::test]
async fn test_concat_of_filters_then_reverse() {
    init_tracing();
    let numbers = Arc::new(VersionedCollection::from_items((1..=6).collect::<Vec<i32>>()));
    let evens = Filter::new(shared(&numbers), |n: &i32| n % 2 == 0).await;
    let odds = Filter::new(shared(&numbers), |n: &i32| n % 2 == 1).await;
    let both = Concat::new(vec![shared(&evens), shared(&odds)]).await.unwrap();
    let reversed = Reverse::new(shared(&both)).await;

    assert_eq!(settle(&*reversed, &[5, 3, 1, 6, 4, 2]).await, vec![5, 3, 1, 6, 4, 2]);

    numbers.insert_range(0, vec![10, 11]).await.unwrap();
    assert_eq!(
        settle(&*reversed, &[5, 3, 1, 11, 6, 4, 2, 10]).await,
        vec![5, 3, 1, 11, 6, 4, 2, 10]
    );

    numbers.clear().await;
    assert_eq!(settle(&*reversed, &[]).await, Vec::<i32>::new());
}

#[tokio::test]
async fn test_index_map_pipeline_restamps_positions() {
    init_tracing();
    let names = Arc::new(VersionedCollection::from_items(vec!["ada", "bob", "cy"]));
    let indexed = Index::new(shared(&names)).await;
    let labels = Map::new(shared(&indexed), |row: &Indexed<&'static str>| {
        format!("{}:{}", row.index, row.item)
    })
    .await;

    let expected = ["0:ada", "1:bob", "2:cy"].map(String::from);
    assert_eq!(settle(&*labels, &expected).await, expected.to_vec());

    names.remove_range(0, 1).await.unwrap();
    let expected = ["0:bob", "1:cy"].map(String::from);
    assert_eq!(settle(&*labels, &expected).await, expected.to_vec());

    names.insert_range(1, vec!["dee"]).await.unwrap();
    let expected = ["0:bob", "1:dee", "2:cy"].map(String::from);
    assert_eq!(settle(&*labels, &expected).await, expected.to_vec());
}

#[tokio::test]
async fn test_join_feeds_downstream_operators() {
    init_tracing();
    let users = Arc::new(VersionedCollection::from_items(vec![(1, "ada"), (2, "grace")]));
    let logins = Arc::new(VersionedCollection::from_items(vec![(2, 10), (3, 7)]));
    let joined = Join::new(
        shared(&users),
        shared(&logins),
        |user: &(i32, &'static str), login: &(i32, i32)| user.0 == login.0,
        JoinKind::Inner,
    )
    .await
    .unwrap();
    let names = Map::new(shared(&joined), |row: &Joined<(i32, &'static str), (i32, i32)>| {
        row.left.map(|user| user.1).unwrap_or("?")
    })
    .await;

    assert_eq!(settle(&*names, &["grace"]).await, vec!["grace"]);

    logins.push_range(vec![(1, 4)]).await;
    assert_eq!(settle(&*names, &["ada", "grace"]).await, vec!["ada", "grace"]);

    users.remove_range(1, 1).await.unwrap();
    assert_eq!(settle(&*names, &["ada"]).await, vec!["ada"]);
}

#[tokio::test]
async fn test_operator_output_versions_are_dense() {
    init_tracing();
    let source = Arc::new(VersionedCollection::from_items(vec![4, 1, 3]));
    let sorted = Sort::new(shared(&source), |a: &i32, b: &i32| a.cmp(b)).await;
    settle(&*sorted, &[1, 3, 4]).await;

    let (_subscription, log) = record(&*sorted);
    let start = sorted.output().version().await;
    for value in [2, 9, 0] {
        source.push_range(vec![value]).await;
    }
    source.replace_at(0, 7).await.unwrap();
    source.remove_range(1, 2).await.unwrap();

    settle(&*sorted, &[0, 2, 7, 9]).await;
    let versions: Vec<_> = log.lock().iter().map(ChangeEvent::version).collect();
    assert!(!versions.is_empty());
    for (offset, version) in versions.iter().enumerate() {
        assert_eq!(*version, start + offset as u64 + 1);
    }
}

#[tokio::test]
async fn test_bootstrap_does_not_duplicate_rows() {
    init_tracing();
    let source = Arc::new(VersionedCollection::from_items(vec![1, 2, 3]));
    // Writes racing with construction must be applied exactly once.
    let writer = {
        let source = Arc::clone(&source);
        tokio::spawn(async move {
            for value in 4..=20 {
                source.push_range(vec![value]).await;
                tokio::task::yield_now().await;
            }
        })
    };
    let mirror = Map::new(shared(&source), |n: &i32| *n).await;
    writer.await.unwrap();

    let expected: Vec<i32> = (1..=20).collect();
    assert_eq!(settle(&*mirror, &expected).await, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_with_predicate_swaps() {
    init_tracing();
    let source = Arc::new(VersionedCollection::new());
    let config = OperatorConfig::new("multiples").with_yield_every(4);
    let filtered = Filter::with_config(&config, shared(&source), |n: &u32| n % 2 == 0).await;
    let sorted = Sort::new(shared(&filtered), |a: &u32, b: &u32| a.cmp(b)).await;

    let mut producers = Vec::new();
    for producer in 0..4u32 {
        let source = Arc::clone(&source);
        producers.push(tokio::spawn(async move {
            for step in 0..50u32 {
                source.push_range(vec![producer * 1000 + step]).await;
                if step % 10 == 9 {
                    source.remove_range(0, 1).await.unwrap();
                }
            }
        }));
    }
    for divisor in [3u32, 5, 7] {
        filtered.set_predicate(move |n: &u32| n % divisor == 0);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for producer in producers {
        producer.await.unwrap();
    }

    let mut expected: Vec<u32> = source.collect_where(|n| n % 7 == 0).await;
    expected.sort_unstable();
    assert_eq!(settle(&*sorted, &expected).await, expected);
}

#[tokio::test]
async fn test_hot_swap_feeds_take() {
    init_tracing();
    let morning = Arc::new(VersionedCollection::from_items(vec![1, 2, 3, 4]));
    let evening = Arc::new(VersionedCollection::from_items(vec![9, 8]));
    let current = HotSwap::new(shared(&morning)).await;
    let last_two = Take::last(shared(&current), 2).await;

    assert_eq!(settle(&*last_two, &[3, 4]).await, vec![3, 4]);

    current.swap_source(shared(&evening), true).await.unwrap();
    assert_eq!(settle(&*last_two, &[9, 8]).await, vec![9, 8]);

    evening.push_range(vec![7]).await;
    morning.push_range(vec![100]).await;
    assert_eq!(settle(&*last_two, &[8, 7]).await, vec![8, 7]);

    current.swap_source(shared(&morning), false).await.unwrap();
    assert_eq!(settle(&*last_two, &[4, 100]).await, vec![4, 100]);
}

#[tokio::test]
async fn test_sort_comparer_swap_downstream_of_filter() {
    init_tracing();
    let words = Arc::new(VersionedCollection::from_items(vec!["pear", "fig", "banana", "kiwi", "apple"]));
    let short = Filter::new(shared(&words), |w: &&'static str| w.len() <= 5).await;
    let sorted = Sort::new(shared(&short), |a: &&'static str, b: &&'static str| a.cmp(b)).await;

    assert_eq!(
        settle(&*sorted, &["apple", "fig", "kiwi", "pear"]).await,
        vec!["apple", "fig", "kiwi", "pear"]
    );

    // Ties keep source order after a comparer swap.
    sorted.set_comparer(|a: &&'static str, b: &&'static str| a.len().cmp(&b.len()));
    assert_eq!(
        settle(&*sorted, &["fig", "pear", "kiwi", "apple"]).await,
        vec!["fig", "pear", "kiwi", "apple"]
    );
}

#[tokio::test]
async fn test_disposed_pipeline_stops_following_source() {
    init_tracing();
    let source = Arc::new(VersionedCollection::from_items(vec![1, 2, 3]));
    let doubled = Map::new(shared(&source), |n: &i32| n * 2).await;
    assert_eq!(settle(&*doubled, &[2, 4, 6]).await, vec![2, 4, 6]);

    doubled.dispose().await;
    assert_eq!(source.subscriber_count(), 0);

    source.push_range(vec![4]).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(doubled.snapshot().await.into_items(), vec![2, 4, 6]);
}
