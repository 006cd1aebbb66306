mod support;

use reqwest::{multipart, Client, StatusCode};
use serde_json::{json, Value};
use uuid::Uuid;

use support::spawn_server;

#[tokio::test]
async fn api_requires_a_bearer_token() {
    let server = spawn_server().await;
    let client = Client::new();

    let health = client.get(server.http("/health")).send().await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let response = client
        .get(server.http("/api/v1/inbox"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "INVALID_TOKEN");

    let forged = client
        .get(server.http("/api/v1/inbox"))
        .bearer_auth("forged.token.value")
        .send()
        .await
        .unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn only_group_admins_can_add_members() {
    let server = spawn_server().await;
    let client = Client::new();
    let owner = server.backend.users.register("owner");
    let member = server.backend.users.register("member");
    let newcomer = server.backend.users.register("newcomer");

    let created = client
        .post(server.http("/api/v1/conversations"))
        .bearer_auth(server.token(owner))
        .json(&json!({
            "kind": "group",
            "name": "weekly prayer",
            "description": "thursday evenings",
            "member_ids": [member],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let conversation: Value = created.json().await.unwrap();
    let members_url = server.http(&format!(
        "/api/v1/conversations/{}/members",
        conversation["id"].as_str().unwrap()
    ));

    let rejected = client
        .post(&members_url)
        .bearer_auth(server.token(member))
        .json(&json!({ "user_ids": [newcomer] }))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::FORBIDDEN);
    let body: Value = rejected.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHORIZED");

    let added: Value = client
        .post(&members_url)
        .bearer_auth(server.token(owner))
        .json(&json!({ "user_ids": [newcomer, member] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    // 已经在群里的成员被跳过
    assert_eq!(added.as_array().unwrap().len(), 1);
    assert_eq!(added[0]["user_id"], json!(newcomer));

    let detail: Value = client
        .get(server.http(&format!(
            "/api/v1/conversations/{}",
            conversation["id"].as_str().unwrap()
        )))
        .bearer_auth(server.token(newcomer))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["conversation"]["id"], conversation["id"]);
}

#[tokio::test]
async fn outsiders_cannot_read_a_conversation() {
    let server = spawn_server().await;
    let client = Client::new();
    let owner = server.backend.users.register("owner");
    let outsider = server.backend.users.register("outsider");

    let conversation: Value = client
        .post(server.http("/api/v1/conversations"))
        .bearer_auth(server.token(owner))
        .json(&json!({ "kind": "group", "name": "private" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let response = client
        .get(server.http(&format!(
            "/api/v1/conversations/{}",
            conversation["id"].as_str().unwrap()
        )))
        .bearer_auth(server.token(outsider))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "NOT_MEMBER");
}

#[tokio::test]
async fn repeated_likes_collapse_until_acknowledged() {
    let server = spawn_server().await;
    let client = Client::new();
    let author = server.backend.users.register("author");
    let first_fan = server.backend.users.register("first");
    let second_fan = server.backend.users.register("second");
    let post_id = Uuid::new_v4();

    for fan in [first_fan, second_fan] {
        let response = client
            .post(server.http("/api/v1/social-events"))
            .bearer_auth(server.token(fan))
            .json(&json!({ "type": "post_liked", "post_id": post_id, "author_id": author }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["recorded"], true);
    }

    let author_token = server.token(author);
    let missed: Value = client
        .get(server.http("/api/v1/notifications/missed"))
        .bearer_auth(&author_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let notifications = missed["notifications"].as_array().unwrap();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0]["actors_count"], 2);
    assert_eq!(notifications[0]["last_actor_id"], json!(second_fan));

    let ack = client
        .post(server.http("/api/v1/notifications/ack"))
        .bearer_auth(&author_token)
        .json(&json!({ "cursor": missed["cursor"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(ack.status(), StatusCode::OK);
    let stored: Value = ack.json().await.unwrap();
    assert_eq!(stored["cursor"], missed["cursor"]);

    let again: Value = client
        .get(server.http("/api/v1/notifications/missed"))
        .bearer_auth(&author_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(again["notifications"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn message_notifications_stay_one_per_message() {
    let server = spawn_server().await;
    let client = Client::new();
    let sender = server.backend.users.register("sender");
    let recipient = server.backend.users.register("recipient");
    let conversation_id = Uuid::new_v4();

    for _ in 0..2 {
        let response = client
            .post(server.http("/api/v1/social-events"))
            .bearer_auth(server.token(sender))
            .json(&json!({
                "type": "message_received",
                "recipient_id": recipient,
                "conversation_id": conversation_id,
                "message_id": Uuid::new_v4(),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let missed: Value = client
        .get(server.http("/api/v1/notifications/missed"))
        .bearer_auth(server.token(recipient))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let notifications = missed["notifications"].as_array().unwrap();
    assert_eq!(notifications.len(), 2);
    assert!(notifications
        .iter()
        .all(|n| n["notification_type"] == "NEW_MESSAGE" && n["actors_count"] == 1));
    assert_eq!(notifications[0]["conversation_id"], json!(conversation_id));
}

#[tokio::test]
async fn liking_your_own_post_records_nothing() {
    let server = spawn_server().await;
    let client = Client::new();
    let author = server.backend.users.register("author");

    let body: Value = client
        .post(server.http("/api/v1/social-events"))
        .bearer_auth(server.token(author))
        .json(&json!({ "type": "post_liked", "post_id": Uuid::new_v4(), "author_id": author }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["recorded"], false);
}

#[tokio::test]
async fn uploads_are_classified_by_content_type() {
    let server = spawn_server().await;
    let client = Client::new();
    let user = server.backend.users.register("uploader");

    let part = multipart::Part::bytes(vec![0x89, b'P', b'N', b'G'])
        .file_name("photo.png")
        .mime_str("image/png")
        .unwrap();
    let response = client
        .post(server.http("/api/v1/uploads"))
        .bearer_auth(server.token(user))
        .multipart(multipart::Form::new().part("file", part))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let uploaded: Value = response.json().await.unwrap();
    assert_eq!(uploaded["file_type"], "image");
    assert_eq!(uploaded["file_size"], 4);
    assert_eq!(uploaded["file_name"], "photo.png");

    let part = multipart::Part::bytes(b"MZ".to_vec())
        .file_name("setup.exe")
        .mime_str("application/x-msdownload")
        .unwrap();
    let rejected = client
        .post(server.http("/api/v1/uploads"))
        .bearer_auth(server.token(user))
        .multipart(multipart::Form::new().part("file", part))
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}
