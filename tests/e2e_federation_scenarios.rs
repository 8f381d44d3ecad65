//! E2E scenarios where the local forge starts the conversation

mod common;

use common::{REMOTE_ACTOR, REMOTE_BASE, RemoteActorKeys, TestServer};
use serde_json::json;

async fn server_with_remote() -> (TestServer, RemoteActorKeys) {
    let server = TestServer::new().await;
    let remote = RemoteActorKeys::generate(REMOTE_ACTOR);
    server.federation.serve_forgejo_host(REMOTE_BASE);
    server
        .federation
        .serve_person(REMOTE_ACTOR, "distant", &remote.public_key_pem);
    (server, remote)
}

#[tokio::test]
async fn test_outbound_follow_is_delivered_and_accepted() {
    let (server, remote) = server_with_remote().await;
    let user = server.create_user("alice").await;
    let local_actor = server.public_url(&format!("/api/v1/activitypub/user-id/{}", user.id));

    let following = server
        .state
        .federation
        .outbox
        .follow_remote(&user, REMOTE_ACTOR)
        .await
        .unwrap();
    assert!(!following.accepted);

    let delivery = server.next_delivery().await;
    assert_eq!(delivery.url, format!("{REMOTE_ACTOR}/inbox"));
    assert_eq!(delivery.key_id, format!("{local_actor}#main-key"));
    assert_eq!(delivery.payload["type"], "Follow");
    assert_eq!(delivery.payload["object"], REMOTE_ACTOR);
    assert_eq!(delivery.payload["id"], following.follow_activity_id);

    let accept = json!({
        "type": "Accept",
        "id": format!("{REMOTE_ACTOR}/accepts/1"),
        "actor": REMOTE_ACTOR,
        "object": delivery.payload,
    });
    let response = server
        .post_signed(
            &format!("/api/v1/activitypub/user-id/{}/inbox", user.id),
            &remote,
            &accept,
        )
        .await;
    assert_eq!(response.status(), 204);

    let stored = server
        .state
        .db
        .find_following(user.id, following.federated_user_id)
        .await
        .unwrap()
        .unwrap();
    assert!(stored.accepted);

    // Unfollow sends an Undo wrapping the original Follow
    assert!(
        server
            .state
            .federation
            .outbox
            .unfollow_remote(&user, REMOTE_ACTOR)
            .await
            .unwrap()
    );
    let undo = server.next_delivery().await;
    assert_eq!(undo.payload["type"], "Undo");
    assert_eq!(undo.payload["object"]["id"], following.follow_activity_id);
}

#[tokio::test]
async fn test_user_activity_reaches_followers() {
    let (server, remote) = server_with_remote().await;
    let user = server.create_user("alice").await;
    let local_actor = server.public_url(&format!("/api/v1/activitypub/user-id/{}", user.id));

    let follow = json!({
        "type": "Follow",
        "id": format!("{REMOTE_ACTOR}/follows/9"),
        "actor": REMOTE_ACTOR,
        "object": local_actor,
    });
    let response = server
        .post_signed(
            &format!("/api/v1/activitypub/user-id/{}/inbox", user.id),
            &remote,
            &follow,
        )
        .await;
    assert_eq!(response.status(), 202);
    assert_eq!(server.next_delivery().await.payload["type"], "Accept");

    let queued = server
        .state
        .federation
        .outbox
        .send_user_activity(&user, "pushed 3 commits", Some("https://forge.example/alice/forge"))
        .await
        .unwrap();
    assert_eq!(queued, 1);

    let delivery = server.next_delivery().await;
    assert_eq!(delivery.url, format!("{REMOTE_ACTOR}/inbox"));
    assert_eq!(delivery.payload["type"], "Create");
    assert_eq!(delivery.payload["actor"], local_actor);
    assert_eq!(delivery.payload["object"]["type"], "Note");
    assert_eq!(delivery.payload["object"]["content"], "pushed 3 commits");
}

#[tokio::test]
async fn test_like_is_delivered_to_the_repository_inbox() {
    let (server, _remote) = server_with_remote().await;
    let user = server.create_user("alice").await;
    let repository = "https://remote.example/api/v1/activitypub/repository-id/3";

    server
        .state
        .federation
        .outbox
        .send_like(&user, repository)
        .await
        .unwrap();

    let delivery = server.next_delivery().await;
    assert_eq!(delivery.url, format!("{repository}/inbox"));
    assert_eq!(delivery.payload["type"], "Like");
    assert_eq!(delivery.payload["object"], repository);
    assert!(delivery.payload["startTime"].is_string());

    server
        .state
        .federation
        .outbox
        .send_undo_like(&user, repository)
        .await
        .unwrap();

    let delivery = server.next_delivery().await;
    assert_eq!(delivery.payload["type"], "Undo");
    assert_eq!(delivery.payload["object"]["type"], "Like");
}

#[tokio::test]
async fn test_refresh_sweep_picks_up_moved_inbox() {
    let (server, remote) = server_with_remote().await;
    let user = server.create_user("alice").await;
    server
        .state
        .federation
        .outbox
        .follow_remote(&user, REMOTE_ACTOR)
        .await
        .unwrap();
    server.next_delivery().await;

    let moved = json!({
        "type": "Person",
        "id": REMOTE_ACTOR,
        "preferredUsername": "distant",
        "inbox": "https://remote.example/api/v1/activitypub/user-id/7/new-inbox",
        "publicKey": {
            "id": remote.key_id(),
            "owner": REMOTE_ACTOR,
            "publicKeyPem": &remote.public_key_pem,
        }
    });
    server.federation.serve(REMOTE_ACTOR, moved);

    assert_eq!(server.state.federation.refresh_all().await.unwrap(), 1);

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    let mut inbox_path = String::new();
    while tokio::time::Instant::now() < deadline {
        let remote_actor = server
            .state
            .federation
            .actors
            .find(REMOTE_ACTOR)
            .await
            .unwrap()
            .unwrap();
        inbox_path = remote_actor.federated_user.inbox_path;
        if inbox_path.ends_with("/new-inbox") {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(inbox_path, "/api/v1/activitypub/user-id/7/new-inbox");
}
