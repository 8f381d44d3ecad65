//! E2E tests for ActivityPub actor documents and inboxes

mod common;

use common::{REMOTE_ACTOR, REMOTE_BASE, RemoteActorKeys, TestServer};
use serde_json::{Value, json};

#[tokio::test]
async fn test_person_actor_document() {
    let server = TestServer::new().await;
    let user = server.create_user("alice").await;

    let response = server
        .client
        .get(&server.url(&format!("/api/v1/activitypub/user-id/{}", user.id)))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/activity+json"
    );
    let json: Value = response.json().await.unwrap();
    let actor = server.public_url(&format!("/api/v1/activitypub/user-id/{}", user.id));
    assert_eq!(json["type"], "Person");
    assert_eq!(json["id"], actor);
    assert_eq!(json["preferredUsername"], "alice");
    assert_eq!(json["inbox"], format!("{actor}/inbox"));
    assert_eq!(json["publicKey"]["id"], format!("{actor}#main-key"));
    assert!(
        json["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .contains("BEGIN PUBLIC KEY")
    );
}

#[tokio::test]
async fn test_unknown_person_is_not_found() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/api/v1/activitypub/user-id/999"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_repository_actor_document() {
    let server = TestServer::new().await;
    let owner = server.create_user("alice").await;
    let repository = server
        .state
        .create_repository(&owner, "forge")
        .await
        .unwrap();

    let response = server
        .client
        .get(&server.url(&format!(
            "/api/v1/activitypub/repository-id/{}",
            repository.id
        )))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "Repository");
    assert_eq!(
        json["id"],
        server.public_url(&format!("/api/v1/activitypub/repository-id/{}", repository.id))
    );
}

#[tokio::test]
async fn test_instance_actor_document() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/api/v1/activitypub/actor"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "Application");
    assert_eq!(
        json["publicKey"]["id"],
        server.public_url("/api/v1/activitypub/actor#main-key")
    );
}

#[tokio::test]
async fn test_inbox_rejects_unsigned_activity() {
    let server = TestServer::new().await;
    let user = server.create_user("alice").await;

    let activity = json!({
        "type": "Follow",
        "actor": REMOTE_ACTOR,
        "object": server.public_url(&format!("/api/v1/activitypub/user-id/{}", user.id)),
    });

    let response = server
        .client
        .post(&server.url(&format!("/api/v1/activitypub/user-id/{}/inbox", user.id)))
        .header("Content-Type", "application/activity+json")
        .json(&activity)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_inbox_rejects_signature_key_of_another_actor() {
    let server = TestServer::new().await;
    let user = server.create_user("alice").await;
    let mallory = RemoteActorKeys::generate("https://remote.example/api/v1/activitypub/user-id/66");

    let activity = json!({
        "type": "Follow",
        "id": format!("{REMOTE_ACTOR}/follows/1"),
        "actor": REMOTE_ACTOR,
        "object": server.public_url(&format!("/api/v1/activitypub/user-id/{}", user.id)),
    });

    let response = server
        .post_signed(
            &format!("/api/v1/activitypub/user-id/{}/inbox", user.id),
            &mallory,
            &activity,
        )
        .await;

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_inbox_is_hidden_when_federation_disabled() {
    let server = TestServer::with_config(|config| config.federation.enabled = false).await;
    let user = server.create_user("alice").await;

    let response = server
        .client
        .post(&server.url(&format!("/api/v1/activitypub/user-id/{}/inbox", user.id)))
        .json(&json!({"type": "Follow"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_signed_follow_is_accepted_and_answered() {
    let server = TestServer::new().await;
    let user = server.create_user("alice").await;
    let remote = RemoteActorKeys::generate(REMOTE_ACTOR);
    server.federation.serve_forgejo_host(REMOTE_BASE);
    server
        .federation
        .serve_person(REMOTE_ACTOR, "distant", &remote.public_key_pem);

    let local_actor = server.public_url(&format!("/api/v1/activitypub/user-id/{}", user.id));
    let follow = json!({
        "type": "Follow",
        "id": format!("{REMOTE_ACTOR}/follows/1"),
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
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "Accepted");

    let delivery = server.next_delivery().await;
    assert_eq!(delivery.url, format!("{REMOTE_ACTOR}/inbox"));
    assert_eq!(delivery.key_id, format!("{local_actor}#main-key"));
    assert_eq!(delivery.payload["type"], "Accept");
    assert_eq!(delivery.payload["actor"], local_actor);
    assert_eq!(delivery.payload["object"]["id"], follow["id"]);

    let followers = server.state.db.list_followers(user.id).await.unwrap();
    assert_eq!(followers.len(), 1);
    assert_eq!(followers[0].normalized_original_url, REMOTE_ACTOR);

    // Undo removes the edge again
    let undo = json!({
        "type": "Undo",
        "actor": REMOTE_ACTOR,
        "object": follow,
    });
    let response = server
        .post_signed(
            &format!("/api/v1/activitypub/user-id/{}/inbox", user.id),
            &remote,
            &undo,
        )
        .await;
    assert_eq!(response.status(), 204);
    assert!(server.state.db.list_followers(user.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_follow_for_another_actor_is_not_acceptable() {
    let server = TestServer::new().await;
    let user = server.create_user("alice").await;
    let other = server.create_user("carol").await;
    let remote = RemoteActorKeys::generate(REMOTE_ACTOR);
    server.federation.serve_forgejo_host(REMOTE_BASE);
    server
        .federation
        .serve_person(REMOTE_ACTOR, "distant", &remote.public_key_pem);

    let follow = json!({
        "type": "Follow",
        "id": format!("{REMOTE_ACTOR}/follows/2"),
        "actor": REMOTE_ACTOR,
        "object": server.public_url(&format!("/api/v1/activitypub/user-id/{}", other.id)),
    });

    let response = server
        .post_signed(
            &format!("/api/v1/activitypub/user-id/{}/inbox", user.id),
            &remote,
            &follow,
        )
        .await;

    assert_eq!(response.status(), 406);
    assert!(server.state.db.list_followers(user.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_like_and_undo_like_star_the_repository() {
    let server = TestServer::new().await;
    let owner = server.create_user("alice").await;
    let repository = server
        .state
        .create_repository(&owner, "forge")
        .await
        .unwrap();
    let remote = RemoteActorKeys::generate(REMOTE_ACTOR);
    server.federation.serve_forgejo_host(REMOTE_BASE);
    server
        .federation
        .serve_person(REMOTE_ACTOR, "distant", &remote.public_key_pem);

    let inbox = format!("/api/v1/activitypub/repository-id/{}/inbox", repository.id);
    let repository_iri =
        server.public_url(&format!("/api/v1/activitypub/repository-id/{}", repository.id));
    let now = chrono::Utc::now();
    let like = json!({
        "type": "Like",
        "id": format!("{REMOTE_ACTOR}/likes/1"),
        "actor": REMOTE_ACTOR,
        "object": repository_iri,
        "startTime": (now - chrono::Duration::seconds(10)).to_rfc3339(),
    });

    let response = server.post_signed(&inbox, &remote, &like).await;
    assert_eq!(response.status(), 204);
    assert_eq!(
        server
            .state
            .db
            .count_repository_stars(repository.id)
            .await
            .unwrap(),
        1
    );

    // Replaying the same Like is rejected by the ordering check
    let response = server.post_signed(&inbox, &remote, &like).await;
    assert_eq!(response.status(), 406);

    let undo = json!({
        "type": "Undo",
        "actor": REMOTE_ACTOR,
        "startTime": now.to_rfc3339(),
        "object": like,
    });
    let response = server.post_signed(&inbox, &remote, &undo).await;
    assert_eq!(response.status(), 204);
    assert_eq!(
        server
            .state
            .db
            .count_repository_stars(repository.id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_create_note_is_recorded_once_without_signatures() {
    let server =
        TestServer::with_config(|config| config.federation.signature_enforced = false).await;
    let user = server.create_user("alice").await;
    let remote = RemoteActorKeys::generate(REMOTE_ACTOR);
    server.federation.serve_forgejo_host(REMOTE_BASE);
    server
        .federation
        .serve_person(REMOTE_ACTOR, "distant", &remote.public_key_pem);

    let create = json!({
        "type": "Create",
        "id": format!("{REMOTE_ACTOR}/activities/1"),
        "actor": REMOTE_ACTOR,
        "published": (chrono::Utc::now() - chrono::Duration::seconds(5)).to_rfc3339(),
        "object": {
            "type": "Note",
            "attributedTo": REMOTE_ACTOR,
            "content": "<p>pushed</p><script>alert(1)</script>",
            "url": "https://remote.example/distant/forge/commit/abc",
        }
    });
    let inbox = server.url(&format!("/api/v1/activitypub/user-id/{}/inbox", user.id));

    let response = server.client.post(&inbox).json(&create).send().await.unwrap();
    assert_eq!(response.status(), 204);

    let shadow = server
        .state
        .federation
        .actors
        .find(REMOTE_ACTOR)
        .await
        .unwrap()
        .unwrap();
    let activities = server
        .state
        .db
        .list_federated_user_activities(shadow.user.id)
        .await
        .unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].note_content, "<p>pushed</p>");
    assert_eq!(
        activities[0].note_url,
        "https://remote.example/distant/forge/commit/abc"
    );
}

#[tokio::test]
async fn test_unknown_activity_type_is_not_acceptable() {
    let server =
        TestServer::with_config(|config| config.federation.signature_enforced = false).await;
    let user = server.create_user("alice").await;

    let response = server
        .client
        .post(&server.url(&format!("/api/v1/activitypub/user-id/{}/inbox", user.id)))
        .json(&json!({
            "type": "Announce",
            "actor": REMOTE_ACTOR,
            "object": "https://remote.example/notes/1",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 406);
}
