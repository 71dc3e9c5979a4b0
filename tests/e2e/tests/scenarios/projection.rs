//! Structural projection scenarios: FOLLOWS/CAUSED_BY chains and explicit
//! preference events with provenance

use atlas_e2e::harness::{EventBuilder, TestAtlas};
use atlas_core::domain::{entity_id, event_node_id, EdgeKind, EntityType};

#[tokio::test]
async fn structural_projection_builds_the_session_chain() {
    let atlas = TestAtlas::new();
    atlas.append(
        &EventBuilder::new("e1", "s1", "observation.input").build(),
        None,
    );
    atlas.append(
        &EventBuilder::new("e2", "s1", "tool.call")
            .offset_secs(2)
            .parent("e1")
            .build(),
        None,
    );

    // Consumer 1 only: the structural edges and nothing else
    while atlas.projection.run_once().unwrap() > 0 {}

    let follows = atlas
        .ctx
        .graph
        .edges_of(&event_node_id("e1"), true, false, &[EdgeKind::Follows])
        .unwrap();
    assert_eq!(follows.len(), 1);
    assert_eq!(follows[0].target, event_node_id("e2"));
    assert_eq!(follows[0].props["sessionId"], "s1");
    assert_eq!(follows[0].props["deltaMs"], 2000);

    let caused = atlas
        .ctx
        .graph
        .edges_of(&event_node_id("e2"), true, false, &[EdgeKind::CausedBy])
        .unwrap();
    assert_eq!(caused.len(), 1);
    assert_eq!(caused[0].target, event_node_id("e1"));
    assert_eq!(caused[0].props["mechanism"], "direct");

    // No other edges from projection alone
    let all_e1 = atlas.ctx.graph.edges_of(&event_node_id("e1"), true, true, &[]).unwrap();
    let all_e2 = atlas.ctx.graph.edges_of(&event_node_id("e2"), true, true, &[]).unwrap();
    assert_eq!(all_e1.len(), 2);
    assert_eq!(all_e2.len(), 2);
}

#[tokio::test]
async fn cross_session_chains_stay_separate() {
    let atlas = TestAtlas::new();
    atlas.append(&EventBuilder::new("a1", "s1", "tool.call").build(), None);
    atlas.append(
        &EventBuilder::new("b1", "s2", "tool.call").offset_secs(1).build(),
        None,
    );
    atlas.append(
        &EventBuilder::new("a2", "s1", "tool.call").offset_secs(2).build(),
        None,
    );
    while atlas.projection.run_once().unwrap() > 0 {}

    let follows = atlas
        .ctx
        .graph
        .edges_of(&event_node_id("a1"), true, false, &[EdgeKind::Follows])
        .unwrap();
    assert_eq!(follows.len(), 1);
    assert_eq!(follows[0].target, event_node_id("a2"));
    assert_eq!(follows[0].props["sessionId"], "s1");

    // The interleaved s2 event chains nowhere
    let s2_edges = atlas
        .ctx
        .graph
        .edges_of(&event_node_id("b1"), true, true, &[EdgeKind::Follows])
        .unwrap();
    assert!(s2_edges.is_empty());
}

#[tokio::test]
async fn explicit_preference_event_projects_with_stated_provenance() {
    let atlas = TestAtlas::new();
    let event = EventBuilder::new("x1", "s1", "user.preference.stated").build();
    atlas.append(
        &event,
        Some(
            r#"{"user_id":"u1","category":"communication","key":"notification_method","value":"email","polarity":"positive"}"#,
        ),
    );
    while atlas.projection.run_once().unwrap() > 0 {}

    let user_entity = entity_id("u1", EntityType::User);
    let prefs = atlas
        .ctx
        .graph
        .targets_of(&user_entity, EdgeKind::HasPreference)
        .unwrap();
    assert_eq!(prefs.len(), 1);
    let (_, preference) = &prefs[0];
    assert_eq!(preference.attrs["source"], "explicit");
    assert_eq!(preference.attrs["key"], "notification_method");
    assert!(preference.attrs["confidence"].as_f64().unwrap() >= 0.7);

    let about = atlas
        .ctx
        .graph
        .edges_of(&preference.id, true, false, &[EdgeKind::About])
        .unwrap();
    assert_eq!(about.len(), 1);
    assert_eq!(about[0].target, entity_id("email", EntityType::Concept));

    let derived = atlas
        .ctx
        .graph
        .edges_of(&preference.id, true, false, &[EdgeKind::DerivedFrom])
        .unwrap();
    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].target, event_node_id("x1"));
    assert_eq!(derived[0].props["derivationMethod"], "stated");
    assert!(derived[0].props["evidenceQuote"].is_string());
}

#[tokio::test]
async fn every_derived_node_reaches_an_event() {
    let atlas = TestAtlas::new();
    atlas.append(
        &EventBuilder::new("m1", "s1", "user.message").build(),
        Some("I prefer dark mode and I know rust"),
    );
    atlas.append(
        &EventBuilder::new("end", "s1", "system.session_end").offset_secs(1).build(),
        None,
    );
    atlas.settle().await;

    // Provenance totality over derived kinds
    for kind in ["preference", "skill"] {
        let counts = atlas.ctx.graph.count_nodes_by_kind().unwrap();
        let Some(count) = counts.get(kind) else { continue };
        assert!(*count > 0, "expected {kind} nodes");
    }
    let user_entity = entity_id("a1", EntityType::User);
    for edge_kind in [EdgeKind::HasPreference, EdgeKind::HasSkill] {
        for (_, node) in atlas.ctx.graph.targets_of(&user_entity, edge_kind).unwrap() {
            let derived = atlas
                .ctx
                .graph
                .edges_of(&node.id, true, false, &[EdgeKind::DerivedFrom])
                .unwrap();
            assert!(!derived.is_empty(), "{} lacks DERIVED_FROM", node.id);
        }
    }
}
