use super::*;
use axum::{body, body::Body, http::Request};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tower::ServiceExt;

const BOUNDARY: &str = "chat-test-boundary";

async fn test_state() -> (Arc<AppState>, tempfile::TempDir) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let upload_root = tempfile::tempdir().expect("upload dir");
    let api = ApiContext {
        storage,
        uploads: UploadConfig {
            dir: upload_root.path().join("uploads"),
            public_prefix: "/static/uploads".into(),
        },
    };
    (Arc::new(AppState::new(api)), upload_root)
}

async fn test_app() -> (Router, Arc<AppState>, tempfile::TempDir) {
    let (state, dir) = test_state().await;
    (build_router(state.clone(), 64 * 1024), state, dir)
}

async fn login_as(state: &AppState, user_name: &str) -> LoginResponse {
    let email = format!("{user_name}@example.com");
    server_api::register(
        &state.api,
        RegisterRequest {
            user_name: user_name.into(),
            email: email.clone(),
            password: "pw".into(),
        },
    )
    .await
    .expect("register");
    server_api::login(
        &state.api,
        LoginRequest {
            email,
            password: "pw".into(),
        },
    )
    .await
    .expect("login")
}

fn json_request(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn multipart_request(uri: &str, field: &str, bytes: &[u8]) -> Request<Body> {
    let mut payload = format!(
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"me.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n"
    )
    .into_bytes();
    payload.extend_from_slice(bytes);
    payload.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::post(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header("content-length", payload.len())
        .body(Body::from(payload))
        .expect("request")
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _state, _dir) = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(body.as_ref(), b"ok");
}

#[tokio::test]
async fn register_then_login_returns_session_details() {
    let (app, _state, _dir) = test_app().await;

    let register = json_request(
        "/register",
        serde_json::json!({ "user_name": "alice", "email": "alice@example.com", "password": "pw" }),
    );
    let response = app.clone().oneshot(register).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let ack: StatusMessage = body_json(response).await;
    assert_eq!(ack.message, "User registered successfully");

    let duplicate = json_request(
        "/register",
        serde_json::json!({ "user_name": "alice", "email": "alice@example.com", "password": "pw" }),
    );
    let response = app.clone().oneshot(duplicate).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err: ApiError = body_json(response).await;
    assert_eq!(err.detail, "User Already exist");

    let login = json_request(
        "/login",
        serde_json::json!({ "email": "alice@example.com", "password": "pw" }),
    );
    let response = app.clone().oneshot(login).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let session: LoginResponse = body_json(response).await;
    assert_eq!(session.user_name, "alice");
    assert_eq!(session.message, "Login successful");
    assert!(!session.token.is_empty());

    let wrong = json_request(
        "/login",
        serde_json::json!({ "email": "alice@example.com", "password": "nope" }),
    );
    let response = app.oneshot(wrong).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err: ApiError = body_json(response).await;
    assert_eq!(err.detail, "Password Incorrect");
}

#[tokio::test]
async fn messages_route_lists_history_in_order() {
    let (app, state, _dir) = test_app().await;
    let session = login_as(&state, "alice").await;
    let user = server_api::authenticate(&state.api, &SessionToken(session.token))
        .await
        .expect("user");
    server_api::post_message(&state.api, &user, "first")
        .await
        .expect("post");
    server_api::post_message(&state.api, &user, "second")
        .await
        .expect("post");

    let request = Request::get("/messages").body(Body::empty()).expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let entries: Vec<HistoryEntry> = body_json(response).await;
    let texts: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(texts, ["first", "second"]);
    assert!(entries.iter().all(|e| e.user_name == "alice"));

    let request = Request::get("/messages?limit=1")
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(request).await.expect("response");
    let entries: Vec<HistoryEntry> = body_json(response).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "second");
}

#[tokio::test]
async fn change_password_route_maps_errors_to_status_codes() {
    let (app, state, _dir) = test_app().await;
    let session = login_as(&state, "bob").await;

    let request = json_request(
        "/change-password/not-a-token",
        serde_json::json!({ "old_password": "pw", "new_password": "next" }),
    );
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = json_request(
        &format!("/change-password/{}", session.token),
        serde_json::json!({ "old_password": "bad", "new_password": "next" }),
    );
    let response = app.clone().oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let err: ApiError = body_json(response).await;
    assert_eq!(err.detail, "Old password incorrect");

    let request = json_request(
        &format!("/change-password/{}", session.token),
        serde_json::json!({ "old_password": "pw", "new_password": "next" }),
    );
    let response = app.oneshot(request).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let ack: StatusMessage = body_json(response).await;
    assert_eq!(ack.message, "Password changed successfully");
}

#[tokio::test]
async fn uploaded_profile_pic_is_served_back() {
    let (app, state, _dir) = test_app().await;
    let session = login_as(&state, "carol").await;

    let upload = multipart_request(
        &format!("/upload-profile-pic/{}", session.token),
        "file",
        b"fake-jpeg",
    );
    let response = app.clone().oneshot(upload).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let stored: ProfilePicResponse = body_json(response).await;
    let url = stored.profile_pic.expect("profile pic url");
    assert!(url.starts_with("/static/uploads/"));

    let fetch = Request::get(url.as_str()).body(Body::empty()).expect("request");
    let response = app.clone().oneshot(fetch).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(bytes.as_ref(), b"fake-jpeg");

    let lookup = Request::get(format!("/profile-pic/{}", session.token))
        .body(Body::empty())
        .expect("request");
    let response = app.oneshot(lookup).await.expect("response");
    let current: ProfilePicResponse = body_json(response).await;
    assert_eq!(current.profile_pic.as_deref(), Some(url.as_str()));
}

#[tokio::test]
async fn upload_rejects_bad_token_and_missing_field() {
    let (app, state, _dir) = test_app().await;
    let session = login_as(&state, "dave").await;

    let bad_token = multipart_request("/upload-profile-pic/bogus", "file", b"x");
    let response = app.clone().oneshot(bad_token).await.expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let wrong_field = multipart_request(
        &format!("/upload-profile-pic/{}", session.token),
        "avatar",
        b"x",
    );
    let response = app.clone().oneshot(wrong_field).await.expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let oversized = multipart_request(
        &format!("/upload-profile-pic/{}", session.token),
        "file",
        &vec![7u8; 128 * 1024],
    );
    let response = app.oneshot(oversized).await.expect("response");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state, 64 * 1024);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

async fn next_text<S>(stream: &mut S) -> String
where
    S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("frame");
        if let WsMessage::Text(text) = msg {
            return text;
        }
    }
}

#[tokio::test]
async fn socket_replays_history_and_broadcasts_to_everyone() {
    let (state, _dir) = test_state().await;
    let alice = login_as(&state, "alice").await;
    let bob = login_as(&state, "bob").await;
    let alice_user = server_api::authenticate(&state.api, &SessionToken(alice.token.clone()))
        .await
        .expect("alice");
    server_api::post_message(&state.api, &alice_user, "earlier")
        .await
        .expect("seed");

    let addr = spawn_server(state.clone()).await;
    let (mut alice_ws, _) = connect_async(format!("ws://{addr}/ws/{}", alice.token))
        .await
        .expect("alice connects");
    let (mut bob_ws, _) = connect_async(format!("ws://{addr}/ws/{}", bob.token))
        .await
        .expect("bob connects");

    // The replayed line proves each socket is subscribed.
    assert!(next_text(&mut alice_ws).await.ends_with("] alice: earlier"));
    assert!(next_text(&mut bob_ws).await.ends_with("] alice: earlier"));

    alice_ws
        .send(WsMessage::Text("hello: bob".into()))
        .await
        .expect("send");

    let seen_by_alice = next_text(&mut alice_ws).await;
    let seen_by_bob = next_text(&mut bob_ws).await;
    assert_eq!(seen_by_alice, seen_by_bob);
    let line = shared::chat_line::ChatLine::parse(&seen_by_bob);
    assert_eq!(line.sender, "alice");
    assert_eq!(line.text, "hello: bob");

    let history = server_api::history(&state.api, None).await.expect("history");
    assert_eq!(history.len(), 2);
}

async fn seeded_alice(state: &AppState) -> (LoginResponse, server_api::ChatBroadcast) {
    let alice = login_as(state, "alice").await;
    let user = server_api::authenticate(&state.api, &SessionToken(alice.token.clone()))
        .await
        .expect("alice");
    let earlier = server_api::post_message(&state.api, &user, "earlier")
        .await
        .expect("seed");
    (alice, earlier)
}

#[tokio::test]
async fn history_false_skips_the_replay() {
    let (state, _dir) = test_state().await;
    let (alice, _) = seeded_alice(&state).await;
    let addr = spawn_server(state).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/{}?history=false", alice.token))
        .await
        .expect("connect");
    ws.send(WsMessage::Text("new".into())).await.expect("send");

    let first = next_text(&mut ws).await;
    assert!(first.ends_with("] alice: new"), "unexpected first frame {first}");
}

#[tokio::test]
async fn replayed_lines_are_not_repeated_from_the_broadcast() {
    let (state, _dir) = test_state().await;
    let (alice, earlier) = seeded_alice(&state).await;
    let addr = spawn_server(state.clone()).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/{}", alice.token))
        .await
        .expect("connect");
    assert_eq!(next_text(&mut ws).await, earlier.line);

    // Same message arriving through the fan-out after it was replayed.
    let _ = state.lines.send(earlier);
    ws.send(WsMessage::Text("new".into())).await.expect("send");

    let next = next_text(&mut ws).await;
    assert!(next.ends_with("] alice: new"), "unexpected frame {next}");
}

#[tokio::test]
async fn socket_with_unknown_token_is_closed_with_policy_code() {
    let (state, _dir) = test_state().await;
    let addr = spawn_server(state).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/bogus"))
        .await
        .expect("handshake");

    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("frame before timeout")
        .expect("stream open")
        .expect("frame");
    match msg {
        WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_the_socket_ends_the_session() {
    let (state, _dir) = test_state().await;
    let erin = login_as(&state, "erin").await;
    let token = SessionToken(erin.token.clone());
    let addr = spawn_server(state.clone()).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/{}?history=false", erin.token))
        .await
        .expect("connect");
    ws.close(None).await.expect("close");

    let mut ended = false;
    for _ in 0..100 {
        if server_api::authenticate(&state.api, &token).await.is_err() {
            ended = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ended, "session should be removed after disconnect");
}
