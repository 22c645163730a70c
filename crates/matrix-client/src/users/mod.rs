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

//! Known users, their devices and the device list tracker.

use std::collections::{BTreeMap, HashMap, HashSet};

use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    api::keys::{
        DeviceKeys, KeysClaimRequest, KeysClaimResponse, KeysQueryRequest, KeysQueryResponse,
        SIGNED_CURVE25519,
    },
    crypto::verify_signed_json,
    error::{Error, Result},
    http_client::HttpClient,
    store::Store,
};

/// How much we trust one device of a user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeviceVerification {
    /// Never looked at.
    #[default]
    Unset = 0,
    /// Seen and accepted without interactive verification.
    Known = 1,
    /// Interactively verified.
    Verified = 2,
    /// Explicitly distrusted; no keys are ever encrypted for it.
    Blacklisted = 3,
    /// Not trusted, but not blocking either.
    Ignored = 4,
}

impl DeviceVerification {
    pub(crate) fn db_code(self) -> i64 {
        self as i64
    }

    pub(crate) fn from_db_code(code: i64) -> Self {
        match code {
            1 => Self::Known,
            2 => Self::Verified,
            3 => Self::Blacklisted,
            4 => Self::Ignored,
            _ => Self::Unset,
        }
    }
}

/// One device of one user, as discovered through `/keys/query`.
///
/// The identity keys are immutable once seen; only the verification state
/// changes, through SAS or the explicit setters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    /// Curve25519 identity key, unpadded base64.
    pub curve25519: Option<String>,
    /// Ed25519 fingerprint key, unpadded base64.
    pub ed25519: Option<String>,
    pub algorithms: Vec<String>,
    pub display_name: Option<String>,
    pub verification: DeviceVerification,
}

impl Device {
    fn from_device_keys(keys: &DeviceKeys) -> Self {
        Self {
            user_id: keys.user_id.clone(),
            device_id: keys.device_id.clone(),
            curve25519: keys.curve25519().map(ToOwned::to_owned),
            ed25519: keys.ed25519().map(ToOwned::to_owned),
            algorithms: keys.algorithms.clone(),
            display_name: keys.unsigned.device_display_name.clone(),
            verification: DeviceVerification::Unset,
        }
    }
}

/// A user the client knows about.
#[derive(Clone, Debug, Default)]
pub struct User {
    pub user_id: Option<OwnedUserId>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub devices: BTreeMap<OwnedDeviceId, Device>,
}

/// A device together with the one-time key claimed for it.
#[derive(Clone, Debug)]
pub struct ClaimedDevice {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub curve25519: String,
    pub ed25519: String,
    /// `None` when an Olm session already exists and no key was needed.
    pub one_time_key: Option<String>,
}

/// The diff `/keys/query` produced for one user.
#[derive(Clone, Debug, Default)]
pub struct DeviceListChange {
    pub user_id: Option<OwnedUserId>,
    pub added: Vec<OwnedDeviceId>,
    pub removed: Vec<OwnedDeviceId>,
}

#[derive(Default)]
struct DirectoryState {
    users: HashMap<OwnedUserId, User>,
    /// Users whose device list may be stale. No key may be claimed against
    /// them until a `/keys/query` refreshed the list.
    changed_users: HashSet<OwnedUserId>,
}

/// Registry of known users and their device lists.
///
/// At most one `/keys/query` is in flight at a time; concurrent refresh
/// requests queue up behind it (the query lock is fair) and re-check what
/// still needs loading once it is their turn.
pub(crate) struct UserDirectory {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    state: Mutex<DirectoryState>,
    /// Held for the whole duration of a `/keys/query` round trip.
    query_lock: Mutex<()>,
    store: Store,
}

impl UserDirectory {
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId, store: Store) -> Self {
        Self {
            user_id,
            device_id,
            state: Mutex::new(DirectoryState::default()),
            query_lock: Mutex::new(()),
            store,
        }
    }

    /// Merge the `device_lists.changed` array of a sync response, creating
    /// directory entries for users we haven't seen yet.
    pub async fn mark_changed(&self, users: &[OwnedUserId]) {
        let mut state = self.state.lock().await;
        for user in users {
            state.users.entry(user.clone()).or_default().user_id = Some(user.clone());
            state.changed_users.insert(user.clone());
        }
    }

    pub async fn is_changed(&self, user: &UserId) -> bool {
        self.state.lock().await.changed_users.contains(user)
    }

    pub async fn device(&self, user: &UserId, device: &DeviceId) -> Option<Device> {
        self.state.lock().await.users.get(user)?.devices.get(device).cloned()
    }

    pub async fn devices_of(&self, user: &UserId) -> Vec<Device> {
        self.state
            .lock()
            .await
            .users
            .get(user)
            .map(|u| u.devices.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a profile seen in a member event.
    pub async fn set_profile(
        &self,
        user: &UserId,
        display_name: Option<String>,
        avatar_url: Option<String>,
    ) {
        let mut state = self.state.lock().await;
        let entry = state.users.entry(user.to_owned()).or_default();
        entry.user_id = Some(user.to_owned());
        if display_name.is_some() {
            entry.display_name = display_name;
        }
        if avatar_url.is_some() {
            entry.avatar_url = avatar_url;
        }
    }

    pub async fn display_name(&self, user: &UserId) -> Option<String> {
        self.state.lock().await.users.get(user)?.display_name.clone()
    }

    /// Populate a user's devices from the store without going to the
    /// network. Users whose stored list is flagged outdated join the
    /// changed set.
    pub async fn hydrate(&self, users: &[OwnedUserId]) -> Result<()> {
        for user in users {
            let (outdated, devices) = self
                .store
                .load_user_devices(&self.user_id, &self.device_id, user.clone())
                .await?;

            let mut state = self.state.lock().await;
            let entry = state.users.entry(user.clone()).or_default();
            entry.user_id = Some(user.clone());
            for device in devices {
                entry.devices.insert(device.device_id.clone(), device);
            }
            if outdated {
                state.changed_users.insert(user.clone());
            }
        }
        Ok(())
    }

    /// Refresh the device lists of the given users through `/keys/query`.
    ///
    /// The request set is snapshotted out of `changed_users`; a failure
    /// puts it back so the next attempt retries, and ids re-added while the
    /// request was in flight are picked up by the next call.
    pub async fn load_devices(
        &self,
        http: &HttpClient,
        users: &[OwnedUserId],
    ) -> Result<Vec<DeviceListChange>> {
        let _query_guard = self.query_lock.lock().await;

        let request_set = {
            let mut state = self.state.lock().await;
            let mut set: Vec<OwnedUserId> = Vec::new();
            for user in users {
                // Skip users that are neither pending nor unknown.
                let pending = state.changed_users.contains(user);
                let known =
                    state.users.get(user).is_some_and(|u| !u.devices.is_empty());
                if pending || !known {
                    state.changed_users.remove(user);
                    set.push(user.clone());
                }
            }
            set
        };

        if request_set.is_empty() {
            return Ok(Vec::new());
        }

        let request = KeysQueryRequest {
            device_keys: request_set.iter().map(|u| (u.clone(), Vec::new())).collect(),
            timeout: 10_000,
        };

        let response: Result<KeysQueryResponse, _> =
            http.post("/_matrix/client/r0/keys/query", &request).await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                // Put the users back so nothing is silently forgotten.
                self.state.lock().await.changed_users.extend(request_set);
                return Err(e.into());
            }
        };

        self.apply_query_response(&request_set, response).await
    }

    async fn apply_query_response(
        &self,
        request_set: &[OwnedUserId],
        response: KeysQueryResponse,
    ) -> Result<Vec<DeviceListChange>> {
        let mut changes = Vec::new();

        for user in request_set {
            let device_map = response.device_keys.get(user).cloned().unwrap_or_default();

            let mut fresh: BTreeMap<OwnedDeviceId, Device> = BTreeMap::new();
            for (device_id, keys) in &device_map {
                if &keys.user_id != user || &keys.device_id != device_id {
                    warn!(
                        user_id = user.as_str(),
                        device_id = device_id.as_str(),
                        "Mismatched ids in a device keys payload"
                    );
                    continue;
                }

                let Some(ed25519) = keys.ed25519() else {
                    continue;
                };

                let payload = serde_json::to_value(keys)?;
                if let Err(e) = verify_signed_json(&payload, user, device_id.as_str(), ed25519) {
                    warn!(
                        user_id = user.as_str(),
                        device_id = device_id.as_str(),
                        "Rejecting a device with a bad self-signature: {e}"
                    );
                    continue;
                }

                fresh.insert(device_id.clone(), Device::from_device_keys(keys));
            }

            let mut state = self.state.lock().await;
            let entry = state.users.entry(user.clone()).or_default();
            entry.user_id = Some(user.clone());

            let removed: Vec<OwnedDeviceId> =
                entry.devices.keys().filter(|id| !fresh.contains_key(*id)).cloned().collect();
            let added: Vec<OwnedDeviceId> =
                fresh.keys().filter(|id| !entry.devices.contains_key(*id)).cloned().collect();

            for id in &removed {
                entry.devices.remove(id);
            }
            for (id, mut device) in fresh {
                // Keep the verification state of devices we already track.
                if let Some(existing) = entry.devices.get(&id) {
                    device.verification = existing.verification;
                }
                entry.devices.insert(id, device);
            }

            let devices: Vec<Device> = entry.devices.values().cloned().collect();
            drop(state);

            self.store
                .save_user_devices(
                    &self.user_id,
                    &self.device_id,
                    user.clone(),
                    devices,
                    removed.clone(),
                    false,
                )
                .await?;

            debug!(
                user_id = user.as_str(),
                added = added.len(),
                removed = removed.len(),
                "Refreshed a device list"
            );

            changes.push(DeviceListChange { user_id: Some(user.clone()), added, removed });
        }

        Ok(changes)
    }

    /// Claim one-time keys for the given devices.
    ///
    /// Fails with [`Error::UserDeviceChanged`] when any requested user has
    /// a pending device list refresh; run [`Self::load_devices`] first.
    /// Each returned key's signature is verified against the device's
    /// ed25519 key before it is accepted.
    pub async fn claim_keys(
        &self,
        http: &HttpClient,
        devices: &[(OwnedUserId, OwnedDeviceId)],
    ) -> Result<Vec<ClaimedDevice>> {
        let mut request: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, String>> = BTreeMap::new();
        {
            let state = self.state.lock().await;
            for (user, device) in devices {
                if state.changed_users.contains(user) {
                    return Err(Error::UserDeviceChanged);
                }
                request
                    .entry(user.clone())
                    .or_default()
                    .insert(device.clone(), SIGNED_CURVE25519.to_owned());
            }
        }

        if request.is_empty() {
            return Ok(Vec::new());
        }

        let response: KeysClaimResponse = http
            .post(
                "/_matrix/client/r0/keys/claim",
                &KeysClaimRequest { one_time_keys: request, timeout: 10_000 },
            )
            .await
            .map_err(Error::from)?;

        let mut claimed = Vec::new();
        let state = self.state.lock().await;

        for (user, device_keys) in &response.one_time_keys {
            for (device_id, keys) in device_keys {
                let Some(device) =
                    state.users.get(user).and_then(|u| u.devices.get(device_id))
                else {
                    warn!(
                        user_id = user.as_str(),
                        device_id = device_id.as_str(),
                        "A one-time key was claimed for an unknown device"
                    );
                    continue;
                };
                let (Some(curve25519), Some(ed25519)) = (&device.curve25519, &device.ed25519)
                else {
                    continue;
                };

                let Some((_, key)) = keys
                    .iter()
                    .find(|(id, _)| id.starts_with(SIGNED_CURVE25519))
                else {
                    continue;
                };

                if let Err(e) = verify_signed_json(key, user, device_id.as_str(), ed25519) {
                    warn!(
                        user_id = user.as_str(),
                        device_id = device_id.as_str(),
                        "Rejecting a one-time key with a bad signature: {e}"
                    );
                    continue;
                }

                let Some(one_time_key) = key.get("key").and_then(Value::as_str) else {
                    continue;
                };

                claimed.push(ClaimedDevice {
                    user_id: user.clone(),
                    device_id: device_id.clone(),
                    curve25519: curve25519.clone(),
                    ed25519: ed25519.clone(),
                    one_time_key: Some(one_time_key.to_owned()),
                });
            }
        }

        Ok(claimed)
    }

    /// Flip a device's verification state and persist it.
    pub async fn set_device_verification(
        &self,
        user: &UserId,
        device: &DeviceId,
        verification: DeviceVerification,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(device) =
                state.users.get_mut(user).and_then(|u| u.devices.get_mut(device))
            {
                device.verification = verification;
            }
        }

        self.store
            .set_device_verification(user.to_owned(), device.to_owned(), verification)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;

    async fn directory() -> (UserDirectory, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "matrix.db").await.unwrap();
        store
            .save_account(&crate::store::StoredAccount {
                user_id: user_id!("@alice:example.org").to_owned(),
                device_id: device_id!("A1").to_owned(),
                pickle: None,
                next_batch: None,
                filter_id: None,
                homeserver: None,
                enabled: true,
            })
            .await
            .unwrap();

        let directory = UserDirectory::new(
            user_id!("@alice:example.org").to_owned(),
            device_id!("A1").to_owned(),
            store.clone(),
        );
        (directory, store, dir)
    }

    #[tokio::test]
    async fn changed_users_blocks_key_claims() {
        let (directory, _store, _dir) = directory().await;
        let bob = user_id!("@bob:example.org").to_owned();

        directory.mark_changed(std::slice::from_ref(&bob)).await;
        assert!(directory.is_changed(&bob).await);

        let http = HttpClient::new().unwrap();
        let result = directory
            .claim_keys(&http, &[(bob.clone(), device_id!("BOB1").to_owned())])
            .await;
        assert_matches::assert_matches!(result, Err(Error::UserDeviceChanged));
    }

    #[tokio::test]
    async fn profiles_accumulate() {
        let (directory, _store, _dir) = directory().await;
        let bob = user_id!("@bob:example.org");

        directory.set_profile(bob, Some("Bob".to_owned()), None).await;
        directory.set_profile(bob, None, Some("mxc://example.org/a".to_owned())).await;

        assert_eq!(directory.display_name(bob).await.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn hydrate_restores_stored_devices() {
        let (directory, store, _dir) = directory().await;
        let bob = user_id!("@bob:example.org").to_owned();

        store
            .save_user_devices(
                user_id!("@alice:example.org"),
                device_id!("A1"),
                bob.clone(),
                vec![Device {
                    user_id: bob.clone(),
                    device_id: device_id!("BOB1").to_owned(),
                    curve25519: Some("curve".to_owned()),
                    ed25519: Some("ed".to_owned()),
                    algorithms: vec![],
                    display_name: None,
                    verification: DeviceVerification::Known,
                }],
                vec![],
                false,
            )
            .await
            .unwrap();

        directory.hydrate(std::slice::from_ref(&bob)).await.unwrap();
        let device = directory.device(&bob, device_id!("BOB1")).await.unwrap();
        assert_eq!(device.verification, DeviceVerification::Known);
        assert!(!directory.is_changed(&bob).await);
    }
}
