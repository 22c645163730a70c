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

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};

use super::WellKnownResponse;

/// `POST /_matrix/client/r0/login`
#[derive(Debug, Serialize)]
pub struct LoginRequest {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub identifier: LoginIdentifier,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_device_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
}

impl LoginRequest {
    pub fn password_login(
        identifier: LoginIdentifier,
        password: String,
        device_display_name: Option<String>,
    ) -> Self {
        Self {
            kind: "m.login.password",
            identifier,
            password,
            initial_device_display_name: device_display_name,
            device_id: None,
        }
    }
}

/// Who is logging in: a Matrix id or a third party (email) address.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum LoginIdentifier {
    #[serde(rename = "m.id.user")]
    User { user: String },
    #[serde(rename = "m.id.thirdparty")]
    ThirdParty { medium: &'static str, address: String },
}

impl LoginIdentifier {
    /// Addresses containing an `@` past the first character are treated as
    /// email, everything else as a user id or localpart.
    pub fn new(user: &str) -> Self {
        if user.find('@').is_some_and(|idx| idx > 0) {
            LoginIdentifier::ThirdParty { medium: "email", address: user.to_owned() }
        } else {
            LoginIdentifier::User { user: user.to_owned() }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub user_id: OwnedUserId,
    pub access_token: String,
    pub device_id: OwnedDeviceId,
    #[serde(default)]
    pub well_known: Option<WellKnownResponse>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn identifier_classification() {
        assert_matches::assert_matches!(
            LoginIdentifier::new("alice@example.org"),
            LoginIdentifier::ThirdParty { .. }
        );
        assert_matches::assert_matches!(
            LoginIdentifier::new("@alice:example.org"),
            LoginIdentifier::User { .. }
        );
        assert_matches::assert_matches!(LoginIdentifier::new("alice"), LoginIdentifier::User { .. });
    }

    #[test]
    fn password_login_body() {
        let request = LoginRequest::password_login(
            LoginIdentifier::new("@alice:example.org"),
            "hunter2".to_owned(),
            Some("unit test".to_owned()),
        );

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({
                "type": "m.login.password",
                "identifier": { "type": "m.id.user", "user": "@alice:example.org" },
                "password": "hunter2",
                "initial_device_display_name": "unit test",
            })
        );
    }
}
