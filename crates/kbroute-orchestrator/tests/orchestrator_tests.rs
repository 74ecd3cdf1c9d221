mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use kbroute_core::config::RetrievalSettings;
use kbroute_core::error::{AdapterFailure, FailureKind};
use kbroute_core::traits::{CollectionSource, IndexAdapter};
use kbroute_core::types::{HealthMark, PreparedQuery, QueryRequest, SourceGroup, TierLabel};
use kbroute_embed::HashEmbedder;
use kbroute_orchestrator::{
    CollectionRegistry, EventSink, FanoutCoordinator, FixedTier, JsonlSink, KnowledgeOrchestrator, QueryEvent,
    Retrieval, Target,
};

use common::{hit, wait_for_lines, Scripted, ScriptedSource};

fn settings() -> RetrievalSettings {
    RetrievalSettings { tier_max_latency_ms: 1_000, ..RetrievalSettings::default() }
}

/// Registry with one backend per (collection, group, adapter).
async fn registry(collections: Vec<(&str, SourceGroup, Arc<dyn IndexAdapter>)>) -> Arc<CollectionRegistry> {
    let sources = collections
        .into_iter()
        .map(|(name, group, adapter)| {
            Arc::new(ScriptedSource::new(group.as_str(), group).serve(name, adapter)) as Arc<dyn CollectionSource>
        })
        .collect();
    let registry = Arc::new(CollectionRegistry::new(sources));
    registry.discover().await;
    registry
}

fn fixed(label: TierLabel, adapter: Scripted) -> Arc<FixedTier> {
    Arc::new(FixedTier::new(label, Arc::new(adapter)))
}

fn empty_tiers(builder: kbroute_orchestrator::OrchestratorBuilder) -> kbroute_orchestrator::OrchestratorBuilder {
    builder
        .tier(fixed(TierLabel::SingleIndex, Scripted::hits("single", vec![])))
        .tier(fixed(TierLabel::LocalSnapshot, Scripted::hits("snapshot", vec![])))
        .tier(fixed(TierLabel::KeywordFiles, Scripted::hits("keyword", vec![])))
}

fn ids(r: &Retrieval) -> Vec<String> {
    r.results().iter().map(|x| x.hit.chunk.id.clone()).collect()
}

#[tokio::test]
async fn collection_weight_outranks_raw_similarity() {
    let newest = Arc::new(Scripted::hits("newest", vec![hit("fresh", 0.80, "newest/kb", 1.0)]));
    let legacy = Arc::new(Scripted::hits("legacy", vec![hit("old", 0.95, "legacy/kb", 0.7)]));
    let reg = registry(vec![("kb", SourceGroup::Newest, newest), ("kb", SourceGroup::Legacy, legacy)]).await;
    let orch = KnowledgeOrchestrator::builder(reg).settings(settings()).registry_tier().build();

    let r = orch.retrieve(QueryRequest::new("dharma")).await;
    assert_eq!(r.tier(), Some(TierLabel::MultiCollection));
    assert_eq!(ids(&r), ["fresh", "old"]);
    assert!((r.results()[0].composite - 0.80).abs() < 1e-6);
    assert!((r.results()[1].composite - 0.665).abs() < 1e-6);
    assert!(!r.partial());
}

#[tokio::test]
async fn distinct_scores_are_strictly_descending_and_truncated() {
    let hits = (0..8).map(|i| hit(&format!("c{i}"), 0.1 * i as f32 + 0.05, "a/kb", 1.0)).collect();
    let reg = registry(vec![("kb", SourceGroup::Newest, Arc::new(Scripted::hits("a", hits)))]).await;
    let orch = KnowledgeOrchestrator::builder(reg).settings(settings()).registry_tier().build();

    let r = orch.retrieve(QueryRequest::new("q").with_top_n(3)).await;
    let composites: Vec<f32> = r.results().iter().map(|x| x.composite).collect();
    assert_eq!(composites.len(), 3);
    assert!(composites.windows(2).all(|w| w[0] > w[1]));
}

#[tokio::test]
async fn equal_composites_order_ignores_arrival_order() {
    // Every hit has composite 0.5; the slower adapter is delayed in one run
    // and not the other.
    let run = |slow_first: bool| async move {
        let a_delay = if slow_first { Duration::from_millis(40) } else { Duration::ZERO };
        let b_delay = if slow_first { Duration::ZERO } else { Duration::from_millis(40) };
        let a = Arc::new(Scripted::hits("a", vec![hit("x", 1.0, "recent/kb", 0.5), hit("y", 0.5, "recent/kb", 1.0)]).delayed(a_delay));
        let b = Arc::new(Scripted::hits("b", vec![hit("z", 1.0, "older/kb", 0.5), hit("w", 0.5, "newest/kb", 1.0)]).delayed(b_delay));
        let reg = registry(vec![("kb", SourceGroup::Recent, a), ("kb", SourceGroup::Older, b)]).await;
        let orch = KnowledgeOrchestrator::builder(reg).settings(settings()).registry_tier().build();
        ids(&orch.retrieve(QueryRequest::new("q")).await)
    };
    let first = run(true).await;
    let second = run(false).await;
    assert_eq!(first, second);
    // raw desc puts x and z first; collection id asc breaks the remaining ties.
    assert_eq!(first, ["z", "x", "w", "y"]);
}

#[tokio::test]
async fn duplicate_chunk_keeps_the_higher_composite() {
    let mut dup_a = hit("p1", 0.9, "older/kb", 0.8);
    dup_a.chunk = dup_a.chunk.with_meta("content_hash", "h1");
    let mut dup_b = hit("p2", 0.8, "newest/kb", 1.0);
    dup_b.chunk = dup_b.chunk.with_meta("content_hash", "h1");
    let reg = registry(vec![
        ("kb", SourceGroup::Older, Arc::new(Scripted::hits("a", vec![dup_a]))),
        ("kb", SourceGroup::Newest, Arc::new(Scripted::hits("b", vec![dup_b]))),
    ])
    .await;
    let orch = KnowledgeOrchestrator::builder(reg).settings(settings()).registry_tier().build();

    let r = orch.retrieve(QueryRequest::new("q")).await;
    assert_eq!(ids(&r), ["p2"], "0.80 beats 0.72");
}

#[tokio::test]
async fn all_adapters_failing_advances_to_next_tier() {
    let reg = registry(vec![
        ("kb", SourceGroup::Newest, Arc::new(Scripted::failing("a", AdapterFailure::bad_response("junk")))),
        ("kb", SourceGroup::Recent, Arc::new(Scripted::failing("b", AdapterFailure::timeout("slow")))),
    ])
    .await;
    let orch = KnowledgeOrchestrator::builder(reg)
        .settings(settings())
        .registry_tier()
        .tier(fixed(TierLabel::SingleIndex, Scripted::hits("single", vec![hit("s1", 0.6, "nas/main", 1.0)])))
        .build();

    let r = orch.retrieve(QueryRequest::new("q")).await;
    let Retrieval::Found(report) = &r else { panic!("expected results") };
    assert_eq!(report.tier, TierLabel::SingleIndex);
    assert!(!report.partial, "partial reflects the answering tier");
    assert_eq!(report.attempts.len(), 2);
    assert_eq!(report.attempts[0].tier, TierLabel::MultiCollection);
    assert_eq!(report.attempts[0].failures.len(), 2);
    assert!(report.attempts[0].partial);
}

#[tokio::test]
async fn one_answering_adapter_among_failures_stops_the_chain() {
    let reg = registry(vec![
        ("kb", SourceGroup::Newest, Arc::new(Scripted::failing("a", AdapterFailure::bad_response("junk")))),
        ("kb", SourceGroup::Legacy, Arc::new(Scripted::hits("b", vec![hit("only", 0.3, "legacy/kb", 0.7)]))),
    ])
    .await;
    let keyword = Arc::new(Scripted::hits("keyword", vec![hit("kw", 1.0, "keyword_files", 1.0)]));
    let orch = KnowledgeOrchestrator::builder(reg)
        .settings(settings())
        .registry_tier()
        .tier(Arc::new(FixedTier::new(TierLabel::KeywordFiles, keyword.clone())))
        .build();

    let r = orch.retrieve(QueryRequest::new("q")).await;
    assert_eq!(r.tier(), Some(TierLabel::MultiCollection));
    assert_eq!(ids(&r), ["only"]);
    assert!(r.partial());
    assert_eq!(keyword.call_count(), 0, "lower tiers are never consulted");
}

#[tokio::test]
async fn four_empty_tiers_yield_not_found() {
    let reg = registry(vec![("kb", SourceGroup::Newest, Arc::new(Scripted::hits("a", vec![])))]).await;
    let orch = empty_tiers(KnowledgeOrchestrator::builder(reg).settings(settings()).registry_tier()).build();

    let r = orch.retrieve(QueryRequest::new("q")).await;
    let Retrieval::NotFound(nf) = &r else { panic!("expected not found") };
    assert_eq!(nf.tiers_attempted, TierLabel::DEFAULT_ORDER.to_vec());
    assert!(r.results().is_empty());

    let health = orch.health();
    assert_eq!(health.not_found, 1);
    assert_eq!(health.queries, 1);
}

#[tokio::test]
async fn deadline_discards_slow_adapter_and_marks_partial() {
    let fast = Arc::new(Scripted::hits("fast", vec![hit("quick", 0.5, "newest/kb", 1.0)]));
    let slow = Arc::new(Scripted::hits("slow", vec![hit("late", 0.99, "recent/kb", 0.9)]).delayed(Duration::from_millis(500)));
    let reg = registry(vec![("kb", SourceGroup::Newest, fast), ("kb", SourceGroup::Recent, slow)]).await;
    let orch = KnowledgeOrchestrator::builder(reg).settings(settings()).registry_tier().build();

    let started = Instant::now();
    let r = orch.retrieve(QueryRequest::new("q").with_deadline(Duration::from_millis(50))).await;
    assert!(started.elapsed() < Duration::from_millis(400), "did not wait for the slow adapter");
    let Retrieval::Found(report) = &r else { panic!("expected results") };
    assert_eq!(ids(&r), ["quick"]);
    assert!(report.partial);
    assert_eq!(report.attempts[0].discarded, ["slow"]);
}

#[tokio::test]
async fn deadline_exhaustion_leaves_later_tiers_empty() {
    let slow = Arc::new(Scripted::hits("slow", vec![hit("late", 0.9, "newest/kb", 1.0)]).delayed(Duration::from_millis(300)));
    let reg = registry(vec![("kb", SourceGroup::Newest, slow)]).await;
    let late_keyword = Scripted::hits("keyword", vec![hit("kw", 1.0, "keyword_files", 1.0)]).delayed(Duration::from_millis(300));
    let orch = KnowledgeOrchestrator::builder(reg)
        .settings(settings())
        .registry_tier()
        .tier(fixed(TierLabel::KeywordFiles, late_keyword))
        .build();

    let r = orch.retrieve(QueryRequest::new("q").with_deadline(Duration::from_millis(60))).await;
    assert!(r.is_not_found());
}

#[tokio::test]
async fn unreachable_is_retried_once_other_failures_are_not() {
    let flaky = Arc::new(Scripted::with_outcomes(
        "flaky",
        vec![Err(AdapterFailure::unreachable("refused")), Ok(vec![hit("h", 0.5, "a", 1.0)])],
    ));
    let timeout = Arc::new(Scripted::failing("timeout", AdapterFailure::timeout("slow")));
    let down = Arc::new(Scripted::failing("down", AdapterFailure::unreachable("refused")));
    let down_health = HealthMark::healthy_now();
    let flaky_health = HealthMark::default();

    let fanout = FanoutCoordinator::new(4, Duration::from_secs(1), 5);
    let query = Arc::new(PreparedQuery::new("q", Instant::now() + Duration::from_secs(1)));
    let res = fanout
        .search(
            vec![
                Target::new(flaky.clone()).with_health(flaky_health.clone()),
                Target::new(timeout.clone()),
                Target::new(down.clone()).with_health(down_health.clone()),
            ],
            query,
        )
        .await;

    assert_eq!(flaky.call_count(), 2);
    assert_eq!(timeout.call_count(), 1);
    assert_eq!(down.call_count(), 2);
    assert_eq!(res.hits.len(), 1);
    assert!(res.partial);
    let mut kinds: Vec<FailureKind> = res.failures.iter().map(|f| f.kind).collect();
    kinds.sort_by_key(|k| format!("{k:?}"));
    assert_eq!(kinds, [FailureKind::Timeout, FailureKind::Unreachable]);
    assert!(flaky_health.is_healthy() && flaky_health.last_seen().is_some());
    assert!(!down_health.is_healthy());
}

#[tokio::test]
async fn panicking_adapter_is_a_failure_not_a_discard() {
    let broken = Arc::new(Scripted::hits("broken", vec![]).panicking());
    let fine = Arc::new(Scripted::hits("fine", vec![hit("h", 0.5, "a", 1.0)]));
    let fanout = FanoutCoordinator::new(4, Duration::from_secs(5), 5);
    let query = Arc::new(PreparedQuery::new("q", Instant::now() + Duration::from_secs(5)));

    let started = std::time::Instant::now();
    let res = fanout.search(vec![Target::new(broken.clone()), Target::new(fine)], query).await;
    assert!(started.elapsed() < Duration::from_secs(2), "a panic must not wait out the deadline");

    assert_eq!(res.hits.len(), 1);
    assert!(res.partial);
    assert!(res.discarded.is_empty());
    assert_eq!(res.failures.len(), 1);
    assert_eq!(res.failures[0].adapter, "broken");
    assert_eq!(res.failures[0].kind, FailureKind::BadResponse);
    assert!(res.failures[0].message.contains("index segment is corrupt"));
    assert_eq!(broken.call_count(), 1);
}

#[tokio::test]
async fn zero_targets_is_an_immediate_miss() {
    let fanout = FanoutCoordinator::new(4, Duration::from_secs(1), 5);
    let query = Arc::new(PreparedQuery::new("q", Instant::now() + Duration::from_secs(1)));
    let res = fanout.search(Vec::new(), query).await;
    assert!(res.hits.is_empty());
    assert!(!res.partial);
    assert!(res.failures.is_empty());
}

#[tokio::test]
async fn tier_override_filters_unconfigured_and_duplicate_labels() {
    let reg = registry(vec![("kb", SourceGroup::Newest, Arc::new(Scripted::hits("a", vec![hit("t1", 0.9, "a", 1.0)])))]).await;
    let orch = KnowledgeOrchestrator::builder(reg)
        .settings(settings())
        .registry_tier()
        .tier(fixed(TierLabel::KeywordFiles, Scripted::hits("keyword", vec![hit("kw", 1.0, "keyword_files", 1.0)])))
        .build();

    let order = orch.chain().effective_order(Some(&[
        TierLabel::LocalSnapshot,
        TierLabel::KeywordFiles,
        TierLabel::KeywordFiles,
        TierLabel::MultiCollection,
    ][..]));
    assert_eq!(order, [TierLabel::KeywordFiles, TierLabel::MultiCollection]);
    assert_eq!(orch.chain().effective_order(Some(&[TierLabel::SingleIndex][..])), orch.chain().default_order());

    let r = orch
        .retrieve(QueryRequest::new("q").with_tier_order(vec![TierLabel::KeywordFiles, TierLabel::MultiCollection]))
        .await;
    assert_eq!(r.tier(), Some(TierLabel::KeywordFiles));
}

#[tokio::test]
async fn vector_tiers_are_skipped_without_an_embedder() {
    let vector = Arc::new(Scripted::hits("vec", vec![hit("v", 0.9, "a", 1.0)]).vector());
    let reg = registry(vec![("kb", SourceGroup::Newest, vector.clone())]).await;
    let orch = KnowledgeOrchestrator::builder(reg)
        .settings(settings())
        .registry_tier()
        .tier(fixed(TierLabel::KeywordFiles, Scripted::hits("keyword", vec![hit("kw", 1.0, "keyword_files", 1.0)])))
        .build();

    let r = orch.retrieve(QueryRequest::new("q")).await;
    let Retrieval::Found(report) = &r else { panic!("expected results") };
    assert_eq!(report.tier, TierLabel::KeywordFiles);
    assert!(report.attempts[0].skipped.is_some());
    assert_eq!(vector.call_count(), 0);
}

#[tokio::test]
async fn vector_tiers_run_with_an_embedder() {
    let vector = Arc::new(Scripted::hits("vec", vec![hit("v", 0.9, "a", 1.0)]).vector());
    let reg = registry(vec![("kb", SourceGroup::Newest, vector.clone())]).await;
    let orch = KnowledgeOrchestrator::builder(reg)
        .settings(settings())
        .registry_tier()
        .embedder(Arc::new(HashEmbedder::new(8)))
        .build();

    let r = orch.retrieve(QueryRequest::new("q")).await;
    assert_eq!(ids(&r), ["v"]);
    assert_eq!(vector.call_count(), 1);
}

#[tokio::test]
async fn collections_of_another_dimension_are_left_out() {
    let small = Arc::new(Scripted::hits("small", vec![hit("s", 0.6, "newest/small", 1.0)]).vector());
    let large = Arc::new(Scripted::hits("large", vec![hit("l", 0.99, "legacy/large", 0.7)]).vector());
    let sources = vec![
        Arc::new(ScriptedSource::new("newest", SourceGroup::Newest).serve_with_dimension("small", 8, small.clone()))
            as Arc<dyn CollectionSource>,
        Arc::new(ScriptedSource::new("legacy", SourceGroup::Legacy).serve_with_dimension("large", 384, large.clone()))
            as Arc<dyn CollectionSource>,
    ];
    let reg = Arc::new(CollectionRegistry::new(sources));
    reg.discover().await;
    let orch = KnowledgeOrchestrator::builder(reg)
        .settings(settings())
        .registry_tier()
        .embedder(Arc::new(HashEmbedder::new(8)))
        .build();

    let r = orch.retrieve(QueryRequest::new("q")).await;
    let Retrieval::Found(report) = &r else { panic!("expected results") };
    assert_eq!(ids(&r), ["s"]);
    assert_eq!(large.call_count(), 0);
    assert_eq!(small.call_count(), 1);
    assert_eq!(report.attempts[0].targets, 2);
    assert_eq!(report.attempts[0].incompatible, ["large"]);
    assert!(report.attempts[0].failures.is_empty());
    assert!(!report.partial);
}

#[tokio::test]
async fn health_histogram_counts_answering_tiers() {
    let reg = registry(vec![("kb", SourceGroup::Newest, Arc::new(Scripted::hits("a", vec![hit("t1", 0.9, "a", 1.0)])))]).await;
    let orch = KnowledgeOrchestrator::builder(reg).settings(settings()).registry_tier().build();
    orch.retrieve(QueryRequest::new("one")).await;
    orch.retrieve(QueryRequest::new("two")).await;
    orch.retrieve(QueryRequest::new("   ")).await;

    let health = orch.health();
    assert_eq!(health.collections_discovered, 1);
    assert_eq!(health.healthy, 1);
    assert_eq!(health.last_tier_used_histogram.get("multi_collection"), Some(&2));
    assert_eq!(health.not_found, 1);
    assert!(health.last_discovery.is_some());
    let json = serde_json::to_value(&health).unwrap();
    assert_eq!(json["collections"][0]["id"], "newest/kb");
}

#[tokio::test]
async fn jsonl_sink_appends_one_line_per_query() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("events.jsonl");
    let reg = registry(vec![("kb", SourceGroup::Newest, Arc::new(Scripted::hits("a", vec![hit("t1", 0.9, "a", 1.0)])))]).await;
    let orch = KnowledgeOrchestrator::builder(reg)
        .settings(settings())
        .registry_tier()
        .sink(Arc::new(JsonlSink::new(&path)))
        .build();
    orch.retrieve(QueryRequest::new("first")).await;
    orch.retrieve(QueryRequest::new("second")).await;

    let text = wait_for_lines(&path, 2).await;
    let events: Vec<QueryEvent> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].query, "first");
    assert_eq!(events[0].tier, Some(TierLabel::MultiCollection));
    assert_eq!(events[0].result_count, 1);
}

#[tokio::test]
async fn failing_sink_does_not_affect_the_response() {
    let tmp = tempfile::TempDir::new().unwrap();
    let sink = JsonlSink::new(tmp.path().join("missing-dir").join("events.jsonl"));
    let event = QueryEvent {
        query: "q".into(),
        tier: None,
        result_count: 0,
        latency_ms: 1,
        partial: false,
        timestamp: chrono::Utc::now(),
    };
    assert!(sink.emit(&event).await.is_err());

    let reg = registry(vec![("kb", SourceGroup::Newest, Arc::new(Scripted::hits("a", vec![hit("t1", 0.9, "a", 1.0)])))]).await;
    let orch = KnowledgeOrchestrator::builder(reg).settings(settings()).registry_tier().sink(Arc::new(sink)).build();
    assert_eq!(ids(&orch.retrieve(QueryRequest::new("q")).await), ["t1"]);
}

struct StuckSink;

#[async_trait]
impl EventSink for StuckSink {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn emit(&self, _event: &QueryEvent) -> anyhow::Result<()> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn stuck_sink_never_delays_a_response() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("events.jsonl");
    let reg = registry(vec![("kb", SourceGroup::Newest, Arc::new(Scripted::hits("a", vec![hit("t1", 0.9, "a", 1.0)])))]).await;
    let orch = KnowledgeOrchestrator::builder(reg)
        .settings(settings())
        .registry_tier()
        .sink(Arc::new(StuckSink))
        .sink(Arc::new(JsonlSink::new(&path)))
        .build();

    for _ in 0..5 {
        let request = QueryRequest::new("q").with_deadline(Duration::from_millis(500));
        let started = std::time::Instant::now();
        let r = orch.retrieve(request).await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(ids(&r), ["t1"]);
    }

    // The stuck sink times out per event, so later sinks still receive it.
    let text = wait_for_lines(&path, 1).await;
    assert!(text.starts_with('{'));
}

#[tokio::test]
async fn retrieval_serializes_with_outcome_tag() {
    let reg = registry(vec![("kb", SourceGroup::Newest, Arc::new(Scripted::hits("a", vec![hit("t1", 0.9, "a", 1.0)])))]).await;
    let orch = KnowledgeOrchestrator::builder(reg).settings(settings()).registry_tier().build();
    let json = serde_json::to_value(orch.retrieve(QueryRequest::new("q")).await).unwrap();
    assert_eq!(json["outcome"], "found");
    assert_eq!(json["tier"], "multi_collection");
    assert_eq!(json["results"][0]["hit"]["chunk"]["id"], "t1");
}
