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

use matrix_client::{ClientEvent, DeliveryState, Error, MatrixContext, SendHandle};
use ruma::room_id;
use serde_json::json;
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

async fn mock_homeserver() -> MockServer {
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
            "joined_rooms": ["!room:example.org"],
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

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/rooms/!room:example.org/joined_members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "joined": {
                "@alice:example.org": { "display_name": "Alice" },
                "@bob:example.org": { "display_name": "Bob" },
            },
        })))
        .mount(&server)
        .await;

    // The final PUT never answers in time; cancellation has to cut it off.
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/.*/send/.*$"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "event_id": "$sent" }))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&server)
        .await;

    server
}

#[tokio::test]
async fn cancelling_a_send_fails_that_message_only() {
    let dir = tempfile::tempdir().unwrap();
    let server = mock_homeserver().await;
    let room = room_id!("!room:example.org");

    let context = MatrixContext::open(dir.path()).await.unwrap();
    let client = context
        .client_builder()
        .user_id("@alice:example.org")
        .password("hunter2")
        .homeserver(server.uri().parse().unwrap())
        .enabled(true)
        .build()
        .await
        .unwrap();

    let mut events = client.subscribe();
    client.start_sync().await;

    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            match events.recv().await {
                Ok(ClientEvent::SyncCompleted { .. }) => break,
                Ok(ClientEvent::SyncFailed { error, .. }) => panic!("sync failed: {error}"),
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for the first sync");

    // A handle cancelled up front fails before anything goes out.
    let handle = SendHandle::new();
    handle.cancel();
    assert!(handle.is_cancelled());
    let err = client.send_text(room, "never sent", Some(&handle)).await.unwrap_err();
    assert!(matches!(err, Error::SendCancelled));

    // Cancelling mid-flight aborts the pending PUT.
    let handle = SendHandle::new();
    let send = tokio::spawn({
        let client = client.clone();
        let handle = handle.clone();
        async move { client.send_text(room, "cut off", Some(&handle)).await }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), send)
        .await
        .expect("the cancelled send did not resolve")
        .unwrap();
    assert!(matches!(result.unwrap_err(), Error::SendCancelled));

    // The local echo of the cancelled message is marked failed; the
    // client itself keeps working.
    let room_state = client.room(room).await.unwrap();
    let room_state = room_state.read().await;
    assert!(room_state
        .events()
        .iter()
        .any(|e| e.body() == Some("cut off") && e.state == DeliveryState::Failed));

    drop(room_state);
    client.stop_sync().await;
    context.close().await.unwrap();
}
