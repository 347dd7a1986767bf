use mailgoat::client::{ClientError, MailGoatClient, MailTransport, SendRequest};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn send_posts_message_and_returns_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/send/message"))
        .and(header("X-Server-API-Key", "test-key"))
        .and(header("Authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "to": ["user@example.com"],
            "subject": "Hello",
            "plain_body": "World",
            "from": "team@example.com",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "data": { "message": { "id": "msg_123" } }
        })))
        .expect(1)
        .mount(&server)
        .await;

    // Trailing slash on the server URL must not break path joining.
    let client = MailGoatClient::new(&format!("{}/", server.uri()), "test-key").unwrap();
    let id = client
        .send(
            "user@example.com",
            "Hello",
            "World",
            Some("team@example.com"),
        )
        .await
        .unwrap();
    assert_eq!(id, "msg_123");
}

#[tokio::test]
async fn http_error_carries_api_message() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/send/message"))
        .respond_with(
            ResponseTemplate::new(422).set_body_json(json!({ "error": "invalid recipient" })),
        )
        .mount(&server)
        .await;

    let client = MailGoatClient::new(&server.uri(), "test-key").unwrap();
    let err = client
        .send("bad", "S", "B", None)
        .await
        .unwrap_err();
    match &err {
        ClientError::Api { status, message, .. } => {
            assert_eq!(*status, 422);
            assert_eq!(message, "invalid recipient");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.to_string(), "MailGoat API error (422): invalid recipient");
}

#[tokio::test]
async fn success_without_message_id_is_an_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/send/message"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "status": "success" })))
        .mount(&server)
        .await;

    let client = MailGoatClient::new(&server.uri(), "test-key").unwrap();
    let request = SendRequest {
        to: vec!["user@example.com".into()],
        subject: "S".into(),
        body: "B".into(),
        ..Default::default()
    };
    let err = client.send_message(&request).await.unwrap_err();
    match &err {
        ClientError::Api { status, message, .. } => {
            assert_eq!(*status, 202);
            assert_eq!(message, "missing message_id in API response");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn read_unwraps_data_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/messages/msg_9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "success",
            "data": {
                "id": "msg_9",
                "to": "user@example.com",
                "subject": "Hi",
                "plain_body": "Body",
                "status": "sent"
            }
        })))
        .mount(&server)
        .await;

    let client = MailGoatClient::new(&server.uri(), "test-key").unwrap();
    let message = client.read("msg_9").await.unwrap();
    assert_eq!(message.id, "msg_9");
    assert_eq!(message.to, vec!["user@example.com".to_string()]);
    assert_eq!(message.subject.as_deref(), Some("Hi"));
    assert_eq!(message.body.as_deref(), Some("Body"));
    assert_eq!(message.status.as_deref(), Some("sent"));
}

#[tokio::test]
async fn unreachable_server_is_a_network_error() {
    // Nothing listens on the discard port.
    let client = MailGoatClient::new("http://127.0.0.1:9", "test-key").unwrap();
    let err = client.send("a@example.com", "S", "B", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Network(_)));
}
