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

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId};
use serde::Deserialize;
use serde_json::Value;

/// `GET /_matrix/client/r0/sync`
///
/// Events are kept as raw JSON values here; the client parses them while
/// dispatching since encrypted ones need a decryption pass first.
#[derive(Debug, Default, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub account_data: EventsContainer,
    #[serde(default)]
    pub to_device: EventsContainer,
    #[serde(default)]
    pub rooms: Rooms,
    #[serde(default)]
    pub device_lists: DeviceLists,
    #[serde(default)]
    pub device_one_time_keys_count: BTreeMap<String, u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventsContainer {
    #[serde(default)]
    pub events: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<OwnedRoomId, JoinedRoom>,
    #[serde(default)]
    pub invite: BTreeMap<OwnedRoomId, InvitedRoom>,
    #[serde(default)]
    pub leave: BTreeMap<OwnedRoomId, LeftRoom>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: EventsContainer,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub account_data: EventsContainer,
}

#[derive(Debug, Default, Deserialize)]
pub struct InvitedRoom {
    #[serde(default)]
    pub invite_state: EventsContainer,
}

#[derive(Debug, Default, Deserialize)]
pub struct LeftRoom {
    #[serde(default)]
    pub state: EventsContainer,
    #[serde(default)]
    pub timeline: Timeline,
}

#[derive(Debug, Default, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub limited: bool,
    pub prev_batch: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}
