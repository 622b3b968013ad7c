//! Outbound delivery pipeline against stub peers
//!
//! Exercises shared-inbox deduplication and retry-exhaustion rollback
//! with a zero backoff base so exhaustion happens in milliseconds.

mod common;

use chrono::Utc;

use common::{start_node, start_remote_peer};
use lagoon::data::{
    Actor, ActorType, Follow, FollowState, ObjectType, Status, Store, Visibility,
};
use lagoon::id::EntityId;

fn remote_person(ap_id: &str, username: &str, inbox: &str, shared_inbox: Option<&str>) -> Actor {
    Actor {
        id: EntityId::generate().to_string(),
        ap_id: ap_id.to_string(),
        username: username.to_string(),
        domain: Some("remote.example".to_string()),
        display_name: None,
        summary: None,
        inbox_uri: inbox.to_string(),
        shared_inbox_uri: shared_inbox.map(str::to_string),
        outbox_uri: None,
        followers_uri: None,
        following_uri: None,
        public_key_pem: "pem".to_string(),
        private_key_pem: None,
        actor_type: ActorType::Person,
        locked: false,
        bot: false,
        suspended: false,
        discoverable: true,
        followers_count: 0,
        following_count: 0,
        statuses_count: 0,
        fetched_at: Some(Utc::now()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn public_status(author: &Actor) -> Status {
    let id = EntityId::generate();
    Status {
        id: id.to_string(),
        uri: format!("{}/statuses/{}", author.ap_id, id),
        object_type: ObjectType::Note,
        account_ap_id: author.ap_id.clone(),
        content: "<p>broadcast</p>".to_string(),
        text: "broadcast".to_string(),
        visibility: Visibility::Public,
        sensitive: false,
        spoiler_text: None,
        in_reply_to_uri: None,
        conversation_uri: None,
        language: None,
        local: true,
        replies_count: 0,
        reblogs_count: 0,
        favourites_count: 0,
        published_at: Utc::now(),
        edited_at: None,
    }
}

async fn accepted_follower(node: &common::TestNode, follower: &Actor, target: &Actor) {
    let follow = Follow {
        id: EntityId::generate().to_string(),
        actor_ap_id: follower.ap_id.clone(),
        target_ap_id: target.ap_id.clone(),
        uri: format!("{}/follows/{}", follower.ap_id, EntityId::generate()),
        state: FollowState::Pending,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    node.store.insert_follow(&follow).await.unwrap();
    node.store.accept_follow(&follow.uri).await.unwrap();
}

#[tokio::test]
async fn two_followers_behind_one_shared_inbox_get_one_delivery() {
    let node = start_node().await;
    let peer = start_remote_peer().await;
    let alice = node
        .state
        .provision_local_actor("alice")
        .await
        .expect("provision alice");

    // Two followers on the same server, both advertising its shared inbox.
    let bob = remote_person(
        &peer.actor_uri("bob"),
        "bob",
        &peer.inbox_uri("bob"),
        Some(&peer.shared_inbox_uri()),
    );
    let carol = remote_person(
        &peer.actor_uri("carol"),
        "carol",
        &peer.inbox_uri("carol"),
        Some(&peer.shared_inbox_uri()),
    );
    node.store.upsert_actor(&bob).await.unwrap();
    node.store.upsert_actor(&carol).await.unwrap();
    accepted_follower(&node, &bob, &alice).await;
    accepted_follower(&node, &carol, &alice).await;

    let status = public_status(&alice);
    node.store.insert_status(&status).await.unwrap();

    let activity = node
        .state
        .delivery
        .send_status_create(&alice, &status, &[])
        .await
        .expect("fan-out");

    assert_eq!(
        peer.shared_inbox_hits(),
        1,
        "one server must receive exactly one delivery"
    );
    assert_eq!(peer.personal_inbox_hits(), 0);

    let stored = node
        .store
        .activity_by_uri(&activity.uri)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.delivered);

    let deliveries = peer.deliveries().await;
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0]["type"], "Create");
    assert_eq!(deliveries[0]["object"]["id"], status.uri.as_str());
}

#[tokio::test]
async fn mentioned_actor_gets_a_personal_inbox_delivery() {
    let node = start_node().await;
    let peer = start_remote_peer().await;
    let alice = node
        .state
        .provision_local_actor("alice")
        .await
        .expect("provision alice");

    let bob = remote_person(
        &peer.actor_uri("bob"),
        "bob",
        &peer.inbox_uri("bob"),
        Some(&peer.shared_inbox_uri()),
    );
    node.store.upsert_actor(&bob).await.unwrap();

    let status = public_status(&alice);
    node.store.insert_status(&status).await.unwrap();

    node.state
        .delivery
        .send_status_create(&alice, &status, std::slice::from_ref(&bob))
        .await
        .expect("fan-out");

    // No follower edge: the only delivery is the mention, routed to the
    // personal inbox.
    assert_eq!(peer.personal_inbox_hits(), 1);
    assert_eq!(peer.shared_inbox_hits(), 0);
}

#[tokio::test]
async fn follow_delivery_exhaustion_rolls_the_edge_back() {
    let node = start_node().await;
    let peer = start_remote_peer().await;
    let alice = node
        .state
        .provision_local_actor("alice")
        .await
        .expect("provision alice");

    // The target's inbox always answers 500.
    let bob = remote_person(
        &peer.actor_uri("bob"),
        "bob",
        &peer.failing_inbox_uri(),
        None,
    );
    node.store.upsert_actor(&bob).await.unwrap();

    let follow = Follow {
        id: EntityId::generate().to_string(),
        actor_ap_id: alice.ap_id.clone(),
        target_ap_id: bob.ap_id.clone(),
        uri: format!("{}/follow/{}", alice.ap_id, EntityId::generate()),
        state: FollowState::Pending,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    node.store.insert_follow(&follow).await.unwrap();

    let result = node.state.delivery.send_follow(&alice, &bob, &follow).await;
    assert!(result.is_err(), "delivery must fail after exhausting retries");

    assert_eq!(peer.failing_inbox_hits(), 3, "three attempts, then give up");

    // An unacknowledged follow must not persist.
    assert!(node.store.follow_by_uri(&follow.uri).await.unwrap().is_none());

    let activity = node
        .store
        .activity_by_uri(&follow.uri)
        .await
        .unwrap()
        .unwrap();
    assert!(!activity.delivered);
    assert_eq!(activity.delivery_attempts, 3);
    assert!(activity.last_delivery_error.is_some());
}

#[tokio::test]
async fn accept_delivery_exhaustion_rolls_the_inbound_follow_back() {
    let node = start_node().await;
    let peer = start_remote_peer().await;
    let alice = node
        .state
        .provision_local_actor("alice")
        .await
        .expect("provision alice");

    let bob = remote_person(
        &peer.actor_uri("bob"),
        "bob",
        &peer.failing_inbox_uri(),
        None,
    );
    node.store.upsert_actor(&bob).await.unwrap();

    // Inbound follow, auto-accepted; the Accept delivery then fails for
    // good, so the edge is rolled back.
    let follow = Follow {
        id: EntityId::generate().to_string(),
        actor_ap_id: bob.ap_id.clone(),
        target_ap_id: alice.ap_id.clone(),
        uri: format!("{}/follows/1", peer.base_url),
        state: FollowState::Pending,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    node.store.insert_follow(&follow).await.unwrap();
    node.store.accept_follow(&follow.uri).await.unwrap();

    let result = node
        .state
        .delivery
        .send_accept(&alice, &follow, &peer.failing_inbox_uri())
        .await;
    assert!(result.is_err());

    assert!(node.store.follow_by_uri(&follow.uri).await.unwrap().is_none());

    let alice = node
        .store
        .actor_by_ap_id(&alice.ap_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alice.followers_count, 0, "rollback reverses the counter");
}

#[tokio::test]
async fn direct_visibility_skips_followers_entirely() {
    let node = start_node().await;
    let peer = start_remote_peer().await;
    let alice = node
        .state
        .provision_local_actor("alice")
        .await
        .expect("provision alice");

    let bob = remote_person(
        &peer.actor_uri("bob"),
        "bob",
        &peer.inbox_uri("bob"),
        Some(&peer.shared_inbox_uri()),
    );
    let carol = remote_person(
        &peer.actor_uri("carol"),
        "carol",
        &peer.inbox_uri("carol"),
        Some(&peer.shared_inbox_uri()),
    );
    node.store.upsert_actor(&bob).await.unwrap();
    node.store.upsert_actor(&carol).await.unwrap();
    accepted_follower(&node, &carol, &alice).await;

    let mut status = public_status(&alice);
    status.visibility = Visibility::Direct;
    node.store.insert_status(&status).await.unwrap();

    node.state
        .delivery
        .send_status_create(&alice, &status, std::slice::from_ref(&bob))
        .await
        .expect("fan-out");

    // Only the mentioned actor is addressed; the follower is not.
    assert_eq!(peer.personal_inbox_hits(), 1);
    assert_eq!(peer.shared_inbox_hits(), 0);
}

#[tokio::test]
async fn relay_subscription_and_mirroring_reference_objects_by_uri() {
    let node = start_node().await;
    let peer = start_remote_peer().await;
    let alice = node
        .state
        .provision_local_actor("alice")
        .await
        .expect("provision alice");

    // Subscribe: the relay inbox receives a signed Follow of the public
    // collection.
    let relay = node
        .state
        .relay
        .subscribe(&peer.shared_inbox_uri())
        .await
        .expect("subscribe");
    assert_eq!(peer.shared_inbox_hits(), 1);
    let deliveries = peer.deliveries().await;
    assert_eq!(deliveries[0]["type"], "Follow");
    assert_eq!(
        deliveries[0]["object"],
        "https://www.w3.org/ns/activitystreams#Public"
    );

    // The relay accepts; mirroring becomes active.
    let follow_uri = relay.follow_activity_uri.clone().unwrap();
    assert!(node.state.relay.handle_accept(&follow_uri).await.unwrap());

    let status = public_status(&alice);
    node.store.insert_status(&status).await.unwrap();
    assert!(node.state.relay.mirror_status(&status).await.unwrap());

    let deliveries = peer.deliveries().await;
    let announce = deliveries
        .iter()
        .find(|delivery| delivery["type"] == "Announce")
        .expect("announce delivered");
    assert!(announce["object"].is_string(), "object by URI, not embedded");
    assert_eq!(announce["object"], status.uri.as_str());

    // Second mirror of the same status is suppressed by the seen-id check.
    assert!(!node.state.relay.mirror_status(&status).await.unwrap());
    let announces = peer
        .deliveries()
        .await
        .iter()
        .filter(|delivery| delivery["type"] == "Announce")
        .count();
    assert_eq!(announces, 1);
}
