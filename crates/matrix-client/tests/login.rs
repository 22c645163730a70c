// Copyright 2020 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use matrix_client::{ClientEvent, LoginMethod, MatrixContext};
use ruma::{device_id, user_id};
use serde_json::json;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

async fn mock_homeserver() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/versions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "versions": ["r0.6.0", "r0.6.1"],
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user_id": "@alice:example.org",
            "access_token": "syt_token",
            "device_id": "DEV1",
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/user/@alice:example.org/account_data/m.direct"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "errcode": "M_NOT_FOUND",
            "error": "Account data not found",
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/joined_rooms"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "joined_rooms": [],
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/user/@alice:example.org/filter"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "filter_id": "f1",
        })))
        .mount(&server)
        .await;

    // The first upload reports an empty pool, which makes the client top
    // it up once more; the second reports a full pool.
    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "one_time_key_counts": { "signed_curve25519": 0 },
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "one_time_key_counts": { "signed_curve25519": 500 },
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({
                    "next_batch": "s1",
                    "device_one_time_keys_count": { "signed_curve25519": 500 },
                }))
                .set_delay(Duration::from_millis(250)),
        )
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn password_login_uploads_keys_and_syncs() {
    let dir = tempfile::tempdir().unwrap();
    let server = mock_homeserver().await;

    let context = MatrixContext::open(dir.path()).await.unwrap();
    let client = context
        .client_builder()
        .user_id("@alice:example.org")
        .password("hunter2")
        .homeserver(server.uri().parse().unwrap())
        .device_display_name("integration test")
        .enabled(true)
        .build()
        .await
        .unwrap();

    let mut events = client.subscribe();
    client.start_sync().await;

    let mut key_uploads = Vec::new();
    let mut logged_in = None;
    let mut synced = None;

    let collect = async {
        while let Ok(event) = events.recv().await {
            match event {
                ClientEvent::LoggedIn { method } => logged_in = Some(method),
                ClientEvent::KeysUploaded { one_time_key_count } => {
                    key_uploads.push(one_time_key_count);
                }
                ClientEvent::SyncCompleted { next_batch } => {
                    synced = Some(next_batch);
                    break;
                }
                ClientEvent::SyncFailed { error, .. } => {
                    panic!("sync failed: {error}");
                }
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(20), collect).await.expect("timed out");

    client.stop_sync().await;

    assert_eq!(logged_in, Some(LoginMethod::Password));
    assert_eq!(key_uploads, vec![0, 500]);
    assert_eq!(synced.as_deref(), Some("s1"));

    // The first upload carried the signed device keys along.
    let uploads: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/_matrix/client/r0/keys/upload")
        .collect();
    assert_eq!(uploads.len(), 2);

    let first: serde_json::Value = serde_json::from_slice(&uploads[0].body).unwrap();
    assert!(first.get("device_keys").is_some());
    assert!(first["device_keys"]["signatures"]["@alice:example.org"]["ed25519:DEV1"].is_string());
    assert!(!first["one_time_keys"].as_object().unwrap().is_empty());

    let second: serde_json::Value = serde_json::from_slice(&uploads[1].body).unwrap();
    assert!(second.get("device_keys").is_none());

    // The account row survived with its pickle and the advanced cursor.
    let account = context
        .store()
        .load_account(user_id!("@alice:example.org"), device_id!("DEV1"))
        .await
        .unwrap()
        .expect("the account was persisted");
    assert!(account.pickle.is_some_and(|p| !p.is_empty()));
    assert_eq!(account.next_batch.as_deref(), Some("s1"));
    assert_eq!(account.filter_id.as_deref(), Some("f1"));
    assert!(account.enabled);

    context.close().await.unwrap();
}

#[tokio::test]
async fn bad_password_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/versions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "versions": ["r0.6.1"],
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/login"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "errcode": "M_FORBIDDEN",
            "error": "Invalid password",
        })))
        .mount(&server)
        .await;

    let context = MatrixContext::open(dir.path()).await.unwrap();
    let client = context
        .client_builder()
        .user_id("@alice:example.org")
        .password("wrong")
        .homeserver(server.uri().parse().unwrap())
        .build()
        .await
        .unwrap();

    let mut events = client.subscribe();
    client.start_sync().await;

    let failure = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::SyncFailed { error, will_retry }) => break (error, will_retry),
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out");

    assert!(matches!(&*failure.0, matrix_client::Error::BadPassword));
    assert!(!failure.1);

    client.stop_sync().await;
    context.close().await.unwrap();
}
