//! Discovery scenarios: scripted sources -> Orchestrator::stream_with() -> assert.
//!
//! Each test wires MockSources into a MockSourceFactory and inspects the
//! streamed results. No browser.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;

use chatscan_common::*;
use chatscan_discovery::testing::{raw_chat, MockSource, MockSourceFactory, ScriptedPage};
use chatscan_discovery::{Orchestrator, SessionRegistry, STREAMING_KEY};

async fn run(factory: MockSourceFactory) -> Vec<ParsingResult> {
    run_with(Orchestrator::new(DiscoveryConfig::without_delays()), factory).await
}

async fn run_with(orchestrator: Orchestrator, factory: MockSourceFactory) -> Vec<ParsingResult> {
    orchestrator
        .stream_with(Arc::new(factory))
        .collect::<Vec<_>>()
        .await
}

fn terminal(results: &[ParsingResult]) -> &ParsingResult {
    let last = results.last().expect("run yielded nothing");
    assert!(
        !last.metadata.contains_key(STREAMING_KEY),
        "last result must be terminal"
    );
    last
}

fn ids(result: &ParsingResult) -> Vec<&str> {
    result.entities.iter().map(|e| e.id.as_str()).collect()
}

fn chats(source: SourceKind, range: std::ops::Range<usize>) -> Vec<RawEntity> {
    range
        .map(|n| raw_chat(source, &format!("{n}@c.us"), &format!("Chat {n}")))
        .collect()
}

// ---------------------------------------------------------------------------
// Source selection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn store_snapshot_is_complete_and_clean() {
    let store = MockSource::new(SourceKind::Store)
        .batch(vec![
            raw_chat(SourceKind::Store, "1@c.us", "Alice"),
            raw_chat(SourceKind::Store, "2@c.us", "Bob"),
            raw_chat(SourceKind::Store, "3@g.us", "Family"),
        ])
        .always_complete()
        .total(3);
    let cleanups = store.cleanup_counter();

    let results = run(MockSourceFactory::new().with(store)).await;
    let last = terminal(&results);

    assert_eq!(last.completeness, Completeness::Complete);
    assert_eq!(last.collected, 3);
    assert_eq!(last.expected, Some(3));
    assert_eq!(last.missing_count, 0);
    assert_eq!(last.source_type, SourceKind::Store);
    assert!(!last.source_degraded);
    assert!(last.anomalies.is_empty(), "anomalies: {:?}", last.anomalies);
    assert!(last.entities.iter().all(|e| e.integrity == Integrity::Verified));
    assert_eq!(last.metadata["completion_reason"], serde_json::Value::Null);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_network_falls_back_to_dom() {
    let store = MockSource::new(SourceKind::Store).unavailable("window.Store not found");
    let network = MockSource::new(SourceKind::Network);
    let dom = MockSource::new(SourceKind::Dom)
        .batch(vec![
            raw_chat(SourceKind::Dom, "dom_chat_aaaaaaaaaaaaaaaa_0", "Alice"),
            raw_chat(SourceKind::Dom, "dom_chat_bbbbbbbbbbbbbbbb_1", "Bob"),
        ])
        .always_complete();
    let counters = [
        store.cleanup_counter(),
        network.cleanup_counter(),
        dom.cleanup_counter(),
    ];

    let factory = Arc::new(MockSourceFactory::new().with(store).with(network).with(dom));
    let results: Vec<_> = Orchestrator::new(DiscoveryConfig::without_delays())
        .stream_with(factory.clone())
        .collect()
        .await;
    let last = terminal(&results);

    assert_eq!(last.source_type, SourceKind::Dom);
    assert!(last.source_degraded);
    assert_eq!(last.collected, 2);
    assert!(last.entities.iter().all(|e| e.integrity == Integrity::Fallback));
    assert_eq!(last.metadata["fallback"]["succeeded"], true);
    assert_eq!(
        factory.created(),
        vec![SourceKind::Store, SourceKind::Network, SourceKind::Dom]
    );
    for counter in &counters {
        assert_eq!(counter.load(Ordering::SeqCst), 1, "every source cleaned up once");
    }
}

#[tokio::test]
async fn failed_fallback_still_yields_a_terminal_result() {
    let factory = MockSourceFactory::new()
        .with(MockSource::new(SourceKind::Network))
        .with(MockSource::new(SourceKind::Dom).unavailable("chat list container not found"));

    let results = run(factory).await;
    assert_eq!(results.len(), 1);
    let last = terminal(&results);

    assert_eq!(last.source_type, SourceKind::Network);
    assert_eq!(last.collected, 0);
    assert_eq!(last.completeness, Completeness::Partial);
    assert_eq!(last.metadata["fallback"]["succeeded"], false);
    assert!(!last.has_anomaly("parsing_error"));
}

#[tokio::test]
async fn all_sources_unavailable_is_reported_not_raised() {
    let factory = MockSourceFactory::new()
        .with(MockSource::new(SourceKind::Store).unavailable("no store"))
        .with(MockSource::new(SourceKind::Network).unavailable("no cdp"))
        .with(MockSource::new(SourceKind::Dom).unavailable("no list"));

    let results = run(factory).await;
    assert_eq!(results.len(), 1);
    let last = terminal(&results);

    assert_eq!(last.source_type, SourceKind::Unknown);
    assert!(last.source_degraded);
    assert_eq!(last.completeness, Completeness::Partial);
    assert!(last.entities.is_empty());
    assert!(last.has_anomaly("parsing_error"));
    assert_eq!(last.metadata["error"], true);
    assert_eq!(
        last.metadata["source_metadata"]["attempted_sources"]
            .as_array()
            .unwrap()
            .len(),
        3
    );
}

// ---------------------------------------------------------------------------
// Completeness and identity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn short_of_announced_total_is_partial() {
    let store = MockSource::new(SourceKind::Store)
        .batch(chats(SourceKind::Store, 0..7))
        .always_complete()
        .total(10);

    let results = run(MockSourceFactory::new().with(store)).await;
    let last = terminal(&results);

    assert_eq!(last.completeness, Completeness::Partial);
    assert_eq!(last.collected, 7);
    assert_eq!(last.expected, Some(10));
    assert_eq!(last.missing_count, 3);
    assert_eq!(last.metadata["source_complete"], true);
}

#[tokio::test]
async fn chat_type_follows_id_suffix() {
    let store = MockSource::new(SourceKind::Store)
        .batch(vec![
            raw_chat(SourceKind::Store, "120363@g.us", "Family"),
            raw_chat(SourceKind::Store, "5511@c.us", "Dana"),
            raw_chat(SourceKind::Store, "status@broadcast", "Status"),
        ])
        .always_complete();

    let results = run(MockSourceFactory::new().with(store)).await;
    let last = terminal(&results);

    let type_of = |id: &str| {
        last.entities
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.entity_type)
    };
    assert_eq!(type_of("120363@g.us"), Some(EntityType::Group));
    assert_eq!(type_of("5511@c.us"), Some(EntityType::Personal));
    assert_eq!(type_of("status@broadcast"), Some(EntityType::Broadcast));
}

#[tokio::test]
async fn renamed_chat_raises_name_conflict() {
    let network = MockSource::new(SourceKind::Network)
        .batch(vec![raw_chat(SourceKind::Network, "1@c.us", "Alice")])
        .batch(vec![raw_chat(SourceKind::Network, "1@c.us", "Alicia")])
        .complete_when_drained();

    let results = run(MockSourceFactory::new().with(network)).await;
    let last = terminal(&results);

    assert_eq!(last.collected, 1);
    assert_eq!(last.entities[0].name.as_deref(), Some("Alice"));
    assert!(last.has_anomaly("name_conflict"));
    assert!(last.has_anomaly("duplicate_ids"));

    let conflict = last
        .anomalies
        .iter()
        .find_map(|a| match a {
            Anomaly::NameConflict { names, .. } => Some(names.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(conflict, vec!["Alice".to_string(), "Alicia".to_string()]);
}

#[tokio::test]
async fn chats_without_any_id_are_dropped() {
    let mut nameless = raw_chat(SourceKind::Store, "x@c.us", "Ghost");
    nameless.primary_id = None;
    let store = MockSource::new(SourceKind::Store)
        .batch(vec![raw_chat(SourceKind::Store, "1@c.us", "Alice"), nameless])
        .always_complete();

    let results = run(MockSourceFactory::new().with(store)).await;
    let last = terminal(&results);

    assert_eq!(ids(last), vec!["1@c.us"]);
    assert_eq!(last.metadata["dropped_entities_count"], 1);
}

// ---------------------------------------------------------------------------
// Streaming invariants
// ---------------------------------------------------------------------------

#[tokio::test]
async fn published_ids_are_unique_at_every_step() {
    let network = MockSource::new(SourceKind::Network)
        .batch(chats(SourceKind::Network, 0..3))
        .batch(chats(SourceKind::Network, 2..5))
        .batch(chats(SourceKind::Network, 4..6))
        .complete_when_drained();

    let results = run(MockSourceFactory::new().with(network)).await;
    assert!(results.len() >= 2);

    for result in &results {
        let unique: HashSet<_> = ids(result).into_iter().collect();
        assert_eq!(unique.len(), result.entities.len(), "duplicate id published");
    }
    assert_eq!(terminal(&results).collected, 6);
}

#[tokio::test]
async fn collected_count_never_decreases() {
    let network = MockSource::new(SourceKind::Network)
        .batch(chats(SourceKind::Network, 0..2))
        .batch(chats(SourceKind::Network, 0..2))
        .batch(chats(SourceKind::Network, 2..4))
        .batch(chats(SourceKind::Network, 4..5))
        .complete_when_drained();

    let results = run(MockSourceFactory::new().with(network)).await;

    let counts: Vec<_> = results.iter().map(|r| r.collected).collect();
    assert!(counts.windows(2).all(|w| w[0] <= w[1]), "counts: {counts:?}");
    assert_eq!(counts.last(), Some(&5));

    let intermediate = &results[..results.len() - 1];
    assert!(intermediate.iter().all(|r| r.metadata[STREAMING_KEY] == true));
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn extraction_errors_skip_the_batch() {
    let store = MockSource::new(SourceKind::Store)
        .failing_batch("evaluate timed out")
        .batch(chats(SourceKind::Store, 0..2))
        .complete_when_drained();

    let results = run(MockSourceFactory::new().with(store)).await;
    let last = terminal(&results);

    assert_eq!(last.collected, 2);
    assert_eq!(last.completeness, Completeness::Complete);
    assert_eq!(last.metadata["batch_errors"], 1);
    assert!(!last.has_anomaly("parsing_error"));
}

#[tokio::test]
async fn fatal_error_keeps_partial_entities() {
    let store = MockSource::new(SourceKind::Store)
        .batch(chats(SourceKind::Store, 0..2))
        .fatal_batch("target crashed");
    let cleanups = store.cleanup_counter();

    let results = run(MockSourceFactory::new().with(store)).await;
    assert_eq!(results.len(), 2);
    let last = terminal(&results);

    assert_eq!(last.collected, 2);
    assert_eq!(last.completeness, Completeness::Partial);
    assert_eq!(last.source_type, SourceKind::Store);
    assert!(!last.source_degraded);
    assert!(last.has_anomaly("parsing_error"));
    assert_eq!(last.metadata["error"], true);
    assert!(last.metadata["error_message"]
        .as_str()
        .unwrap()
        .contains("target crashed"));
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_iteration_ceiling_ends_the_run() {
    let mut dom = MockSource::new(SourceKind::Dom);
    for n in 0..10 {
        dom = dom.batch(chats(SourceKind::Dom, n..n + 1));
    }
    let config = DiscoveryConfig::builder().max_batch_iterations(3).build();

    let results = run_with(Orchestrator::new(config), MockSourceFactory::new().with(dom)).await;
    let last = terminal(&results);

    assert_eq!(last.collected, 3);
    assert_eq!(last.completeness, Completeness::Partial);
    assert_eq!(last.metadata["batch_count"], 3);
}

#[tokio::test]
async fn cancellation_ends_with_a_partial_result() {
    let network = MockSource::new(SourceKind::Network)
        .batch(chats(SourceKind::Network, 0..2))
        .batch(chats(SourceKind::Network, 2..4))
        .batch(chats(SourceKind::Network, 4..6));
    let cancel = Arc::new(AtomicBool::new(false));
    let orchestrator =
        Orchestrator::new(DiscoveryConfig::without_delays()).with_cancel_flag(cancel.clone());

    let factory = MockSourceFactory::new()
        .with(MockSource::new(SourceKind::Store).unavailable("no store"))
        .with(network);
    let mut stream = orchestrator.stream_with(Arc::new(factory));

    let first = stream.next().await.unwrap();
    assert_eq!(first.metadata[STREAMING_KEY], true);
    cancel.store(true, Ordering::SeqCst);

    let rest: Vec<_> = stream.collect().await;
    assert_eq!(rest.len(), 1);
    let last = terminal(&rest);

    assert_eq!(last.collected, 2);
    assert_eq!(last.completeness, Completeness::Partial);
    assert_eq!(last.metadata["cancelled"], true);
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_session_yields_failure_result() {
    let registry = SessionRegistry::new();
    let results: Vec<_> = Orchestrator::new(DiscoveryConfig::without_delays())
        .parse_session_streaming(registry, "missing".to_string())
        .collect()
        .await;

    assert_eq!(results.len(), 1);
    let last = terminal(&results);
    assert!(last.has_anomaly("parsing_error"));
    assert_eq!(last.source_type, SourceKind::Unknown);
    assert!(last.metadata["error_message"]
        .as_str()
        .unwrap()
        .contains("missing"));
}

#[tokio::test]
async fn registered_session_runs_against_its_page() {
    use chatscan_discovery::sources::store::{FETCH_SCRIPT, PROBE_SCRIPT};
    use serde_json::json;

    let page = ScriptedPage::new()
        .on_evaluate(
            PROBE_SCRIPT,
            json!({ "available": true, "totalCount": 1, "storeKeys": ["Chat"] }),
        )
        .on_evaluate(FETCH_SCRIPT, json!([{ "jid": "1@c.us", "name": "Alice" }]));

    let registry = SessionRegistry::new();
    registry.register("work", Arc::new(page)).await;

    let results: Vec<_> = Orchestrator::new(DiscoveryConfig::without_delays())
        .parse_session_streaming(registry.clone(), "work".to_string())
        .collect()
        .await;
    let last = terminal(&results);

    assert_eq!(last.source_type, SourceKind::Store);
    assert_eq!(ids(last), vec!["1@c.us"]);
    assert!(registry.lease("work").await.is_ok(), "lease released after the run");
}
