//! Retrieval scenarios: intent-aware subgraph queries, working memory,
//! lineage bounds

use atlas_e2e::harness::{EventBuilder, TestAtlas};
use atlas_core::domain::{entity_id, event_node_id, EntityType};
use atlas_core::graph::LineageDirection;
use atlas_core::retrieval::SubgraphRequest;

#[tokio::test]
async fn why_query_reaches_preference_and_source_event() {
    let atlas = TestAtlas::new();
    atlas.append(
        &EventBuilder::new("x1", "s1", "user.preference.stated").build(),
        Some(
            r#"{"user_id":"u1","category":"communication","key":"notification_method","value":"email","polarity":"positive"}"#,
        ),
    );
    atlas.settle().await;

    let request = SubgraphRequest {
        query: "Why do I get email alerts?".to_string(),
        session_id: Some("s1".to_string()),
        agent_id: Some("a1".to_string()),
        user_id: Some("u1".to_string()),
        ..SubgraphRequest::default()
    };
    let response = atlas.engine.query_subgraph(&request).unwrap();

    // Intent classification found `why` with conviction
    let why = response.meta.inferred_intents.get("why").copied().unwrap_or(0.0);
    assert!(why >= 0.5, "why confidence {why}");
    assert!(response.meta.intent_override.is_none());

    // Seeds include the user entity inferred from the request
    let user_entity = entity_id("u1", EntityType::User);
    assert!(response.meta.seed_nodes.contains(&user_entity));

    // The preference and its source event are both in the result
    assert!(response.nodes.keys().any(|id| id.starts_with("pref_")));
    assert!(response.nodes.contains_key(&event_node_id("x1")));

    // Provenance on the preference resolves to the stated event
    let preference = response
        .nodes
        .values()
        .find(|n| n.id.starts_with("pref_"))
        .unwrap();
    let provenance = preference.provenance.as_ref().expect("provenance");
    assert_eq!(provenance.event_id, "x1");
    assert_eq!(provenance.source, "stated");
    assert!(!provenance.global_position.is_empty());
}

#[tokio::test]
async fn explicit_intent_bypasses_classification() {
    let atlas = TestAtlas::new();
    atlas.append(
        &EventBuilder::new("x1", "s1", "user.preference.stated").build(),
        Some(
            r#"{"user_id":"u1","category":"tool","key":"editor","value":"vim","polarity":"positive"}"#,
        ),
    );
    atlas.settle().await;

    let request = SubgraphRequest {
        query: "anything at all".to_string(),
        user_id: Some("u1".to_string()),
        intent: Some("personalize".to_string()),
        ..SubgraphRequest::default()
    };
    let response = atlas.engine.query_subgraph(&request).unwrap();
    assert_eq!(response.meta.intent_override.as_deref(), Some("personalize"));
    assert!(response.meta.inferred_intents.contains_key("personalize"));
}

#[tokio::test]
async fn empty_session_context_is_an_empty_response() {
    let atlas = TestAtlas::new();
    let response = atlas.engine.context("never-seen", None, 20, 3).unwrap();
    assert!(response.nodes.is_empty());
    assert!(response.edges.is_empty());
    assert_eq!(response.meta.nodes_returned, 0);
}

#[tokio::test]
async fn working_memory_is_bounded_and_episodic() {
    let atlas = TestAtlas::new();
    for i in 0..12 {
        let trace = if i < 6 { "trace_a" } else { "trace_b" };
        atlas.append(
            &EventBuilder::new(&format!("e{i}"), "s1", "tool.call")
                .offset_secs(i)
                .trace(trace)
                .build(),
            None,
        );
    }
    atlas.settle().await;

    let response = atlas.engine.context("s1", Some("tool work"), 5, 3).unwrap();
    assert_eq!(response.meta.nodes_returned, 5);
    assert!(response.meta.truncated);
    assert!(response.meta.capacity.used_nodes <= response.meta.capacity.max_nodes);

    let episodes = response.episodes.expect("episodes");
    assert!(!episodes.is_empty());
    for episode in &episodes {
        assert!(episode.time_range_start <= episode.time_range_end);
    }
}

#[tokio::test]
async fn lineage_truncates_at_depth_with_exact_bounds_echoed() {
    let atlas = TestAtlas::new();
    // Chain: e0 <- e1 <- e2 <- e3 <- e4
    for i in 0..5 {
        let mut builder = EventBuilder::new(&format!("e{i}"), "s1", "tool.call").offset_secs(i);
        if i > 0 {
            builder = builder.parent(&format!("e{}", i - 1));
        }
        atlas.append(&builder.build(), None);
    }
    while atlas.projection.run_once().unwrap() > 0 {}

    let response = atlas
        .engine
        .lineage(&event_node_id("e4"), LineageDirection::Backward, Some(2), None)
        .unwrap();
    assert!(response.meta.truncated);
    assert_eq!(response.meta.capacity.max_depth, 2);
    assert_eq!(response.meta.capacity.used_nodes, 3);
    assert_eq!(response.nodes.len(), 3);
    assert!(response.meta.inferred_intents.contains_key("why"));

    // Full depth reaches the whole chain
    let full = atlas
        .engine
        .lineage(&event_node_id("e4"), LineageDirection::Backward, Some(10), None)
        .unwrap();
    assert_eq!(full.nodes.len(), 5);
    assert!(!full.meta.truncated);
}

#[tokio::test]
async fn subgraph_respects_max_nodes() {
    let atlas = TestAtlas::new();
    for i in 0..15 {
        atlas.append(
            &EventBuilder::new(&format!("e{i}"), "s1", "tool.call")
                .offset_secs(i)
                .build(),
            None,
        );
    }
    atlas.settle().await;

    let request = SubgraphRequest {
        query: "what happened in this session".to_string(),
        session_id: Some("s1".to_string()),
        agent_id: Some("a1".to_string()),
        max_nodes: Some(4),
        ..SubgraphRequest::default()
    };
    let response = atlas.engine.query_subgraph(&request).unwrap();
    assert!(response.meta.capacity.used_nodes <= 4);
    assert!(response.nodes.len() <= 4);
}

#[tokio::test]
async fn returned_nodes_gain_access_reinforcement() {
    let atlas = TestAtlas::new();
    atlas.append(&EventBuilder::new("e0", "s1", "tool.call").build(), None);
    atlas.settle().await;

    let before = atlas
        .ctx
        .graph
        .get_node(&event_node_id("e0"))
        .unwrap()
        .unwrap()
        .access_count;
    let _ = atlas.engine.context("s1", None, 10, 3).unwrap();
    // The update is dispatched to a blocking task; give it a beat
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let after = atlas
        .ctx
        .graph
        .get_node(&event_node_id("e0"))
        .unwrap()
        .unwrap()
        .access_count;
    assert!(after > before, "access count {after} not above {before}");
}
