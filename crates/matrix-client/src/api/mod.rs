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

//! Request and response bodies of the client-server API endpoints the
//! library talks to.

use std::collections::BTreeMap;

use ruma::{OwnedMxcUri, OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod keys;
pub mod login;
pub mod sync;

/// `GET /_matrix/client/versions`
#[derive(Debug, Deserialize)]
pub struct VersionsResponse {
    pub versions: Vec<String>,
}

/// `POST /_matrix/client/r0/user/{userId}/filter`
#[derive(Debug, Deserialize)]
pub struct FilterResponse {
    pub filter_id: String,
}

/// `GET /_matrix/client/r0/joined_rooms`
#[derive(Debug, Deserialize)]
pub struct JoinedRoomsResponse {
    pub joined_rooms: Vec<OwnedRoomId>,
}

/// `GET /_matrix/client/r0/rooms/{roomId}/joined_members`
#[derive(Debug, Deserialize)]
pub struct JoinedMembersResponse {
    #[serde(default)]
    pub joined: BTreeMap<OwnedUserId, RoomMemberInfo>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RoomMemberInfo {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// `PUT /_matrix/client/r0/rooms/{roomId}/send/{type}/{txnId}`
#[derive(Debug, Deserialize)]
pub struct SendResponse {
    pub event_id: ruma::OwnedEventId,
}

/// `GET /_matrix/client/r0/rooms/{roomId}/messages`
#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    pub start: Option<String>,
    pub end: Option<String>,
    #[serde(default)]
    pub chunk: Vec<Value>,
}

/// `POST /_matrix/media/r0/upload`
#[derive(Debug, Deserialize)]
pub struct UploadResponse {
    pub content_uri: OwnedMxcUri,
}

/// `POST /_matrix/client/r0/rooms/{roomId}/read_markers`
#[derive(Debug, Default, Serialize)]
pub struct ReadMarkersRequest {
    #[serde(rename = "m.fully_read", skip_serializing_if = "Option::is_none")]
    pub fully_read: Option<ruma::OwnedEventId>,
    #[serde(rename = "m.read", skip_serializing_if = "Option::is_none")]
    pub read: Option<ruma::OwnedEventId>,
}

/// `PUT /_matrix/client/r0/rooms/{roomId}/typing/{userId}`
#[derive(Debug, Serialize)]
pub struct TypingRequest {
    pub typing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// `GET /.well-known/matrix/client`
#[derive(Debug, Default, Deserialize)]
pub struct WellKnownResponse {
    #[serde(rename = "m.homeserver")]
    pub homeserver: Option<WellKnownHomeserver>,
}

#[derive(Debug, Deserialize)]
pub struct WellKnownHomeserver {
    pub base_url: String,
}
