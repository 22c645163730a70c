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

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The one-time key algorithm we claim and publish.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";

/// `POST /_matrix/client/r0/keys/upload`
#[derive(Debug, Default, Serialize)]
pub struct KeysUploadRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub one_time_keys: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct KeysUploadResponse {
    #[serde(default)]
    pub one_time_key_counts: BTreeMap<String, u64>,
}

impl KeysUploadResponse {
    pub fn signed_curve25519_count(&self) -> u64 {
        self.one_time_key_counts.get(SIGNED_CURVE25519).copied().unwrap_or(0)
    }
}

/// `POST /_matrix/client/r0/keys/query`
#[derive(Debug, Serialize)]
pub struct KeysQueryRequest {
    pub device_keys: BTreeMap<OwnedUserId, Vec<OwnedDeviceId>>,
    pub timeout: u64,
}

#[derive(Debug, Deserialize)]
pub struct KeysQueryResponse {
    #[serde(default)]
    pub device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// The signed device keys object published by each device.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DeviceKeys {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    #[serde(default)]
    pub algorithms: Vec<String>,
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    #[serde(default)]
    pub signatures: BTreeMap<OwnedUserId, BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "DeviceUnsigned::is_empty")]
    pub unsigned: DeviceUnsigned,
}

impl DeviceKeys {
    pub fn curve25519(&self) -> Option<&str> {
        self.keys.get(&format!("curve25519:{}", self.device_id)).map(String::as_str)
    }

    pub fn ed25519(&self) -> Option<&str> {
        self.keys.get(&format!("ed25519:{}", self.device_id)).map(String::as_str)
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeviceUnsigned {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_display_name: Option<String>,
}

impl DeviceUnsigned {
    fn is_empty(&self) -> bool {
        self.device_display_name.is_none()
    }
}

/// `POST /_matrix/client/r0/keys/claim`
#[derive(Debug, Serialize)]
pub struct KeysClaimRequest {
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>>,
    pub timeout: u64,
}

#[derive(Debug, Deserialize)]
pub struct KeysClaimResponse {
    #[serde(default)]
    pub one_time_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, BTreeMap<String, Value>>>,
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// `PUT /_matrix/client/r0/sendToDevice/{type}/{txnId}`
#[derive(Debug, Serialize)]
pub struct SendToDeviceRequest {
    /// `messages[user_id][device_id]` → event content.
    pub messages: BTreeMap<OwnedUserId, BTreeMap<String, Value>>,
}
