mod common;

use common::{register, spawn_server, test_config};
use paircast_proto::{
    ConnectionInitResponse, ConnectionJoinResponse, ErrorBody, MailboxRecvResponse,
};
use paircast_server::mailbox::MailboxError;
use reqwest::StatusCode;
use serde_json::json;

#[tokio::test]
async fn happy_path_pairing() {
    let (addr, _state) = spawn_server(test_config()).await;
    let client = reqwest::Client::new();

    let alice = register(&client, addr, "alice-laptop").await;
    assert_eq!(alice.session_token.len(), 64);
    assert!(!alice.display_name.is_empty());

    let init: ConnectionInitResponse = client
        .post(format!("http://{}/connection/init", addr))
        .json(&json!({
            "client_id": alice.client_id,
            "session_token": alice.session_token,
            "rendezvous_id_b64": "R1",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let mailbox = init.mailbox_id.clone();

    let bob = register(&client, addr, "bob-phone").await;
    let join: ConnectionJoinResponse = client
        .post(format!("http://{}/connection/join", addr))
        .json(&json!({
            "token_b64": "R1",
            "client_id": bob.client_id,
            "session_token": bob.session_token,
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(join.mailbox_id, mailbox);
    let bob_ref = join.peer_mailbox_id.clone();
    assert_ne!(bob_ref, mailbox);

    let send = client
        .post(format!("http://{}/connection/send", addr))
        .json(&json!({
            "mailbox_id": mailbox,
            "from_mailbox_id": bob_ref,
            "ciphertext_b64": "E1",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(send.status(), StatusCode::ACCEPTED);

    let recv: MailboxRecvResponse = client
        .post(format!("http://{}/connection/recv", addr))
        .json(&json!({ "mailbox_id": mailbox }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(recv.messages.len(), 1);
    assert_eq!(recv.messages[0].seq, 0);
    assert_eq!(recv.messages[0].from_mailbox_id, bob_ref);
    assert_eq!(recv.messages[0].ciphertext_b64, "E1");

    let send = client
        .post(format!("http://{}/connection/send", addr))
        .json(&json!({
            "mailbox_id": mailbox,
            "from_mailbox_id": mailbox,
            "ciphertext_b64": "E2",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(send.status(), StatusCode::ACCEPTED);

    // Two concurrent readers observe the same dense list.
    let (first, second) = tokio::join!(
        client
            .post(format!("http://{}/connection/recv", addr))
            .json(&json!({ "mailbox_id": mailbox }))
            .send(),
        client
            .post(format!("http://{}/connection/recv", addr))
            .json(&json!({ "mailbox_id": mailbox }))
            .send(),
    );
    let first: MailboxRecvResponse = first.unwrap().json().await.unwrap();
    let second: MailboxRecvResponse = second.unwrap().json().await.unwrap();
    assert_eq!(first.messages, second.messages);
    let seqs: Vec<u64> = first.messages.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![0, 1]);
    assert_eq!(first.messages[1].ciphertext_b64, "E2");
    assert_eq!(first.messages[1].from_mailbox_id, mailbox);
}

#[tokio::test]
async fn double_claim_has_single_winner() {
    let (addr, _state) = spawn_server(test_config()).await;
    let client = reqwest::Client::new();

    let alice = register(&client, addr, "initiator").await;
    let init: ConnectionInitResponse = client
        .post(format!("http://{}/connection/init", addr))
        .json(&json!({
            "client_id": alice.client_id,
            "session_token": alice.session_token,
            "rendezvous_id_b64": "R2",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let join = |client: reqwest::Client| async move {
        client
            .post(format!("http://{}/connection/join", addr))
            .json(&json!({ "token_b64": "R2" }))
            .send()
            .await
            .unwrap()
    };
    let (left, right) = tokio::join!(join(client.clone()), join(client.clone()));
    let statuses = [left.status(), right.status()];
    assert!(statuses.contains(&StatusCode::OK));
    assert!(statuses.contains(&StatusCode::NOT_FOUND));

    for response in [left, right] {
        if response.status() == StatusCode::OK {
            let join: ConnectionJoinResponse = response.json().await.unwrap();
            assert_eq!(join.mailbox_id, init.mailbox_id);
        }
    }
}

#[tokio::test]
async fn third_participant_is_rejected() {
    let (addr, state) = spawn_server(test_config()).await;
    let client = reqwest::Client::new();

    let alice = register(&client, addr, "a").await;
    let init: ConnectionInitResponse = client
        .post(format!("http://{}/connection/init", addr))
        .json(&json!({
            "client_id": alice.client_id,
            "session_token": alice.session_token,
            "rendezvous_id_b64": "R3",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let bob = register(&client, addr, "b").await;
    let join = client
        .post(format!("http://{}/connection/join", addr))
        .json(&json!({
            "token_b64": "R3",
            "client_id": bob.client_id,
            "session_token": bob.session_token,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(join.status(), StatusCode::OK);

    let forged = state
        .mailboxes
        .add_participant(&init.mailbox_id, "intruder")
        .await;
    assert!(matches!(forged, Err(MailboxError::ParticipantLimit)));

    let header = state.mailboxes.verify(&init.mailbox_id).await.unwrap();
    assert_eq!(header.participants.len(), 2);
    assert_eq!(header.participants[0], alice.client_id.to_string());
    assert_eq!(header.participants[1], bob.client_id.to_string());
}

#[tokio::test]
async fn consumed_token_is_indistinguishable_from_unknown() {
    let (addr, _state) = spawn_server(test_config()).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/connection/join", addr))
        .json(&json!({ "token_b64": "never-existed" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: ErrorBody = response.json().await.unwrap();
    assert_eq!(body.title, "NotFound");
}

#[tokio::test]
async fn queue_bound_surfaces_as_conflict() {
    let config = {
        let mut config = test_config();
        config.max_queue_len = 4;
        config
    };
    let (addr, _state) = spawn_server(config).await;
    let client = reqwest::Client::new();

    let alice = register(&client, addr, "a").await;
    let init: ConnectionInitResponse = client
        .post(format!("http://{}/connection/init", addr))
        .json(&json!({
            "client_id": alice.client_id,
            "session_token": alice.session_token,
            "rendezvous_id_b64": "R4",
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    for _ in 0..4 {
        let response = client
            .post(format!("http://{}/connection/send", addr))
            .json(&json!({
                "mailbox_id": init.mailbox_id,
                "from_mailbox_id": init.mailbox_id,
                "ciphertext_b64": "AA==",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
    let overflow = client
        .post(format!("http://{}/connection/send", addr))
        .json(&json!({
            "mailbox_id": init.mailbox_id,
            "from_mailbox_id": init.mailbox_id,
            "ciphertext_b64": "AA==",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(overflow.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn hostile_field_contents_are_rejected() {
    let (addr, _state) = spawn_server(test_config()).await;
    let client = reqwest::Client::new();

    // A quote in the sender reference must never reach the store.
    let response = client
        .post(format!("http://{}/connection/send", addr))
        .json(&json!({
            "mailbox_id": "f".repeat(32),
            "from_mailbox_id": "evil\",\"seq\":999",
            "ciphertext_b64": "AA==",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .post(format!("http://{}/connection/send", addr))
        .json(&json!({
            "mailbox_id": "f".repeat(32),
            "from_mailbox_id": "f".repeat(32),
            "ciphertext_b64": "AA==\"}",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .post(format!("http://{}/connection/recv", addr))
        .json(&json!({ "mailbox_id": "not a mailbox id" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_ciphertext_is_rejected() {
    let (addr, _state) = spawn_server(test_config()).await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/connection/send", addr))
        .json(&json!({
            "mailbox_id": "f".repeat(32),
            "from_mailbox_id": "f".repeat(32),
            "ciphertext_b64": "A".repeat(70_000),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn bad_auth_and_bad_json_are_distinct() {
    let (addr, _state) = spawn_server(test_config()).await;
    let client = reqwest::Client::new();

    let alice = register(&client, addr, "a").await;
    let response = client
        .post(format!("http://{}/heartbeat", addr))
        .json(&json!({
            "client_id": alice.client_id,
            "session_token": "0".repeat(64),
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .post(format!("http://{}/heartbeat", addr))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn register_rate_limit_carries_retry_after() {
    let config = {
        let mut config = test_config();
        config.rate_limits.register.burst = 2;
        config
    };
    let (addr, _state) = spawn_server(config).await;
    let client = reqwest::Client::new();

    register(&client, addr, "one").await;
    register(&client, addr, "two").await;
    let response = client
        .post(format!("http://{}/register", addr))
        .json(&json!({ "device_label": "three" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
}

#[tokio::test]
async fn session_close_invalidates_token() {
    let (addr, _state) = spawn_server(test_config()).await;
    let client = reqwest::Client::new();

    let alice = register(&client, addr, "a").await;
    let response = client
        .post(format!("http://{}/session/close", addr))
        .json(&json!({
            "client_id": alice.client_id,
            "session_token": alice.session_token,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = client
        .post(format!("http://{}/heartbeat", addr))
        .json(&json!({
            "client_id": alice.client_id,
            "session_token": alice.session_token,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_and_root_respond() {
    let (addr, _state) = spawn_server(test_config()).await;
    let client = reqwest::Client::new();
    let health = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body: serde_json::Value = health.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let root = client
        .get(format!("http://{}/", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(root.status(), StatusCode::OK);
}
