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

//! The credential sink interface.
//!
//! The library never touches an OS keyring itself; the embedding
//! application provides an opaque key-value store keyed on
//! `(username, server, protocol)` and the library hands it one JSON
//! document per account. The pickle passphrase only ever travels through
//! here, it is never written to the database in clear.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The protocol attribute every entry is stored under.
pub const CREDENTIAL_PROTOCOL: &str = "matrix";

/// The document stored per `(username, server)` pair.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct StoredCredentials {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// The passphrase protecting the account's pickled sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pickle_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default)]
    pub enabled: bool,
}

/// An opaque credential store provided by the application.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    type Error;

    /// Load the credentials stored for `(username, server)`, if any.
    async fn load(
        &self,
        username: &str,
        server: &str,
    ) -> Result<Option<StoredCredentials>, Self::Error>;

    /// Store (or replace) the credentials for `(username, server)`.
    async fn save(
        &self,
        username: &str,
        server: &str,
        credentials: &StoredCredentials,
    ) -> Result<(), Self::Error>;

    /// Remove the entry for `(username, server)`.
    async fn delete(&self, username: &str, server: &str) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_round_trip() {
        let credentials = StoredCredentials {
            user_id: Some("@alice:example.org".to_owned()),
            password: Some("hunter2".to_owned()),
            access_token: Some("token".to_owned()),
            pickle_key: Some("passphrase".to_owned()),
            device_id: Some("DEV1".to_owned()),
            enabled: true,
        };

        let json = serde_json::to_string(&credentials).unwrap();
        let parsed: StoredCredentials = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, credentials);
    }

    #[test]
    fn absent_fields_stay_out_of_the_document() {
        let json = serde_json::to_value(StoredCredentials::default()).unwrap();
        assert_eq!(json, serde_json::json!({ "enabled": false }));
    }
}
