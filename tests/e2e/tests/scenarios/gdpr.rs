//! GDPR erasure scenario: cascade over payloads, event documents, and the
//! personalization subgraph

use atlas_e2e::harness::{EventBuilder, TestAtlas};
use atlas_core::domain::{entity_id, EdgeKind, EntityType};

#[tokio::test]
async fn erasure_cascades_and_tombstones() {
    let atlas = TestAtlas::new();

    // Build up personalization knowledge for u1 across a session
    atlas.append(
        &EventBuilder::new("x1", "u1_session", "user.preference.stated").build(),
        Some(
            r#"{"user_id":"u1","category":"communication","key":"notification_method","value":"email","polarity":"positive"}"#,
        ),
    );
    for i in 0..9 {
        atlas.append(
            &EventBuilder::new(&format!("m{i}"), "u1_session", "user.message")
                .offset_secs(i + 1)
                .build(),
            Some(&format!("{{\"user_id\":\"u1\",\"text\":\"turn {i}\"}}")),
        );
    }
    atlas.append(
        &EventBuilder::new("end", "u1_session", "system.session_end")
            .offset_secs(20)
            .build(),
        None,
    );
    atlas.settle().await;

    let user_entity = entity_id("u1", EntityType::User);
    assert!(
        !atlas
            .ctx
            .graph
            .targets_of(&user_entity, EdgeKind::HasPreference)
            .unwrap()
            .is_empty()
    );
    assert!(atlas.ctx.payloads.get("p_x1").unwrap().is_some());

    // The erasure cascade: crypto-shred payloads, tombstone documents,
    // remove the personalization subgraph
    let sessions = vec!["u1_session".to_string()];
    let erased = atlas.ctx.payloads.erase_sessions(&sessions).unwrap();
    assert!(erased >= 10);
    for event in atlas
        .ctx
        .events
        .get_by_session("u1_session", None, None, 100)
        .unwrap()
    {
        atlas.ctx.events.tombstone_document(&event.event_id).unwrap();
    }
    atlas.ctx.graph.erase_user(&user_entity).unwrap();

    // Preferences and profile are gone
    assert!(
        atlas
            .ctx
            .graph
            .targets_of(&user_entity, EdgeKind::HasPreference)
            .unwrap()
            .is_empty()
    );
    assert!(
        atlas
            .ctx
            .graph
            .targets_of(&user_entity, EdgeKind::HasProfile)
            .unwrap()
            .is_empty()
    );

    // The entity survives only as a tombstone
    let entity = atlas.ctx.graph.get_entity(&user_entity).unwrap().unwrap();
    assert_eq!(entity.attrs["name"], "[erased]");
    assert_eq!(entity.attrs["tombstoned"], true);

    // Documents remain addressable but resolve to nothing live
    let events = atlas
        .ctx
        .events
        .get_by_session("u1_session", None, None, 100)
        .unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.payload_ref.is_empty()));
    assert!(atlas.ctx.payloads.get("p_x1").unwrap().is_none());
}

#[tokio::test]
async fn erasure_leaves_other_users_intact() {
    let atlas = TestAtlas::new();
    for (user, session) in [("u1", "s1"), ("u2", "s2")] {
        atlas.append(
            &EventBuilder::new(&format!("x_{user}"), session, "user.preference.stated").build(),
            Some(&format!(
                "{{\"user_id\":\"{user}\",\"category\":\"tool\",\"key\":\"editor\",\"value\":\"vim\",\"polarity\":\"positive\"}}"
            )),
        );
    }
    atlas.settle().await;

    let u1 = entity_id("u1", EntityType::User);
    let u2 = entity_id("u2", EntityType::User);
    atlas.ctx.payloads.erase_sessions(&["s1".to_string()]).unwrap();
    atlas.ctx.graph.erase_user(&u1).unwrap();

    assert!(atlas.ctx.graph.targets_of(&u1, EdgeKind::HasPreference).unwrap().is_empty());
    assert_eq!(
        atlas.ctx.graph.targets_of(&u2, EdgeKind::HasPreference).unwrap().len(),
        1
    );
    assert!(atlas.ctx.payloads.get("p_x_u2").unwrap().is_some());
}
