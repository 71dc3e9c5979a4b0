//! Consolidation scenarios: reflection triggers, tiered forgetting, replay
//! correctness

use atlas_e2e::harness::{EventBuilder, TestAtlas};
use atlas_core::eventstore::{EventQuery, SortOrder};
use chrono::{Duration, Utc};

#[tokio::test]
async fn reflection_trigger_causes_immediate_summarization() {
    let atlas = TestAtlas::new();
    for i in 0..30 {
        atlas.append(
            &EventBuilder::new(&format!("e{i}"), "s1", "user.message")
                .offset_secs(i)
                .importance_hint(8)
                .build(),
            Some("working through the incident backlog"),
        );
    }
    atlas.settle().await;

    // Accumulated importance crossed the threshold exactly once
    assert_eq!(atlas.ctx.metrics.reflection_triggers_total(), 1);
    assert!(atlas.drain_triggers(), "trigger event expected on the stream");

    let report = atlas.consolidation.run_pass(Utc::now()).unwrap();
    assert!(report.summaries_created >= 1);

    // A summary with SUMMARIZES edges to the contributing events
    let counts = atlas.ctx.graph.count_nodes_by_kind().unwrap();
    assert!(counts["summary"] >= 1);
    let summaries: Vec<_> = atlas
        .ctx
        .graph
        .session_event_stats(10)
        .unwrap();
    assert!(!summaries.is_empty());
}

#[tokio::test]
async fn archive_tier_prunes_graph_but_not_event_store() {
    let atlas = TestAtlas::new();
    let origin = Utc::now() - Duration::days(35);
    for i in 0..100 {
        atlas.append(
            &EventBuilder::new(&format!("e{i}"), "s_old", "tool.call")
                .occurred_at(origin + Duration::seconds(i))
                .build(),
            None,
        );
    }
    atlas.settle().await;
    assert_eq!(atlas.ctx.graph.count_nodes_by_kind().unwrap()["event"], 100);

    let report = atlas.consolidation.run_pass(Utc::now()).unwrap();
    assert!(report.events_pruned >= 100);
    assert!(report.summaries_created >= 1);

    // Graph: events gone, semantic residue remains
    let counts = atlas.ctx.graph.count_nodes_by_kind().unwrap();
    assert!(counts.get("event").copied().unwrap_or(0) == 0);
    assert!(counts["summary"] >= 1);

    // Event store: documents still fully queryable
    let page = atlas
        .ctx
        .events
        .search(
            &EventQuery {
                session_id: Some("s_old".to_string()),
                ..EventQuery::default()
            },
            SortOrder::Asc,
            200,
            None,
        )
        .unwrap();
    assert_eq!(page.events.len(), 100);
}

#[tokio::test]
async fn replay_from_position_zero_restores_the_graph() {
    let atlas = TestAtlas::new();
    let origin = Utc::now() - Duration::days(35);
    for i in 0..40 {
        atlas.append(
            &EventBuilder::new(&format!("e{i}"), "s_old", "tool.call")
                .occurred_at(origin + Duration::seconds(i))
                .build(),
            None,
        );
    }
    atlas.settle().await;

    let before = atlas.ctx.graph.count_nodes_by_kind().unwrap();
    assert_eq!(before["event"], 40);

    // Prune the graph, then rebuild from the log
    atlas.consolidation.run_pass(Utc::now()).unwrap();
    assert_eq!(
        atlas.ctx.graph.count_nodes_by_kind().unwrap().get("event").copied().unwrap_or(0),
        0
    );

    atlas.replay_graph().await;
    let after = atlas.ctx.graph.count_nodes_by_kind().unwrap();
    assert_eq!(after["event"], 40);
    assert_eq!(after.get("entity"), before.get("entity"));
}

#[tokio::test]
async fn pruning_is_idempotent() {
    let atlas = TestAtlas::new();
    let origin = Utc::now() - Duration::days(10);
    for i in 0..10 {
        atlas.append(
            &EventBuilder::new(&format!("e{i}"), "s1", "tool.call")
                .occurred_at(origin + Duration::seconds(i))
                .build(),
            None,
        );
    }
    atlas.settle().await;

    let first = atlas.consolidation.run_pass(Utc::now()).unwrap();
    assert!(first.events_pruned > 0);
    let counts_after_first = atlas.ctx.graph.count_nodes_by_kind().unwrap();

    let second = atlas.consolidation.run_pass(Utc::now()).unwrap();
    assert_eq!(second.events_pruned, 0);
    assert_eq!(atlas.ctx.graph.count_nodes_by_kind().unwrap(), counts_after_first);
}

#[tokio::test]
async fn summaries_precede_pruning_so_lineage_survives() {
    let atlas = TestAtlas::new();
    let origin = Utc::now() - Duration::days(35);
    for i in 0..5 {
        atlas.append(
            &EventBuilder::new(&format!("e{i}"), "s_old", "tool.call")
                .occurred_at(origin + Duration::seconds(i))
                .build(),
            None,
        );
    }
    atlas.settle().await;
    atlas.consolidation.run_pass(Utc::now()).unwrap();

    // Event nodes are gone; the summary that covered them is not
    let counts = atlas.ctx.graph.count_nodes_by_kind().unwrap();
    assert_eq!(counts.get("event").copied().unwrap_or(0), 0);
    assert!(counts["summary"] >= 1);
    assert!(atlas.ctx.graph.session_event_stats(10).unwrap().is_empty());
}

#[tokio::test]
async fn event_store_tiering_trims_stream_and_keeps_documents() {
    let atlas = TestAtlas::new();
    for i in 0..5 {
        atlas.append(
            &EventBuilder::new(&format!("e{i}"), "s1", "tool.call")
                .offset_secs(i)
                .build(),
            None,
        );
    }
    atlas.settle().await;
    atlas.drain_triggers();

    // Pretend the hot window has passed
    let future = Utc::now() + Duration::days(8);
    let report = atlas.ctx.events.enforce_retention(future, 7, 90).unwrap();
    assert_eq!(report.stream_entries_trimmed, 5);
    assert_eq!(report.documents_deleted, 0);

    assert_eq!(atlas.ctx.events.stream_length().unwrap(), 0);
    assert!(atlas.ctx.events.get_by_id("e0").unwrap().is_some());
}
