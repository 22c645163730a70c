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

//! The account controller: login, the long-poll sync loop, and the
//! operations the application calls.

mod rooms;
mod sync;
mod verification;

pub use rooms::SendHandle;
pub use verification::VerificationInfo;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::{
    api::{
        keys::{KeysUploadRequest, KeysUploadResponse},
        login::{LoginIdentifier, LoginRequest, LoginResponse},
        FilterResponse, JoinedRoomsResponse, VersionsResponse, WellKnownResponse,
    },
    crypto::{verification::VerificationSession, OlmMachine},
    error::{Error, Result},
    events::Event,
    http_client::HttpClient,
    room::Room,
    secret_store::StoredCredentials,
    store::{Store, StoredAccount},
    users::UserDirectory,
};

/// Delay before the sync loop retries after a transport failure.
const RESYNC_DELAY: Duration = Duration::from_secs(30);

/// Server side long-poll timeout, milliseconds.
const SYNC_TIMEOUT_MS: &str = "30000";

/// How a login was performed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoginMethod {
    Password,
    AccessToken,
}

/// Everything a [`Client`] reports back to the application.
///
/// Events are delivered through a broadcast channel, so handlers can never
/// re-enter the client synchronously.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// Homeserver discovery resolved a base URL.
    HomeserverDiscovered { base_url: Url },
    /// The homeserver speaks a supported client-server API version.
    HomeserverVerified,
    LoggedIn { method: LoginMethod },
    /// The stored access token was rejected; a fresh password login is
    /// being attempted.
    AccessTokenExpired,
    /// A `/keys/upload` completed; the server now holds this many signed
    /// one-time keys.
    KeysUploaded { one_time_key_count: u64 },
    /// One sync response was fully applied.
    SyncCompleted { next_batch: String },
    /// The sync loop hit an error. `will_retry` tells whether it handles
    /// the problem itself or gave up.
    SyncFailed { error: Arc<Error>, will_retry: bool },
    /// A room changed: membership, metadata or timeline.
    RoomUpdated { room_id: OwnedRoomId },
    /// A (decrypted) timeline event arrived.
    RoomEvent { room_id: OwnedRoomId, event: Arc<Event> },
    /// A tracked user's device list was refreshed.
    UserDevicesChanged {
        user_id: OwnedUserId,
        added: Vec<OwnedDeviceId>,
        removed: Vec<OwnedDeviceId>,
    },
    /// A device verification flow progressed; look the session up by its
    /// flow id to interact with it.
    KeyVerification { flow_id: String },
}

#[derive(Default)]
struct ClientConfig {
    /// What the user typed: a full Matrix id, a localpart, or an email.
    login_id: Option<String>,
    user_id: Option<OwnedUserId>,
    device_id: Option<OwnedDeviceId>,
    password: Option<Zeroizing<String>>,
    access_token: Option<String>,
    device_display_name: Option<String>,
    pickle_passphrase: Option<Zeroizing<String>>,
    enabled: bool,
}

/// Start-up progress flags. `start_sync` walks them in order; concurrent
/// entries collapse into whatever step is currently running.
#[derive(Default)]
struct SyncState {
    db_loaded: bool,
    discovered: bool,
    verified: bool,
    logged_in: bool,
    direct_loaded: bool,
    rooms_loaded: bool,
    filter_uploaded: bool,
    is_logging_in: bool,
    next_batch: Option<String>,
    filter_id: Option<String>,
}

pub(crate) struct ClientInner {
    pub(crate) store: Store,
    pub(crate) http: HttpClient,
    config: Mutex<ClientConfig>,
    state: Mutex<SyncState>,
    pub(crate) machine: Mutex<Option<OlmMachine>>,
    pub(crate) directory: Mutex<Option<Arc<UserDirectory>>>,
    pub(crate) rooms: RwLock<HashMap<OwnedRoomId, Arc<RwLock<Room>>>>,
    pub(crate) send_locks: Mutex<HashMap<OwnedRoomId, Arc<Mutex<()>>>>,
    pub(crate) verifications: Mutex<HashMap<String, VerificationSession>>,
    events_tx: broadcast::Sender<ClientEvent>,
    sync_failed: AtomicBool,
    /// Set when a database save failed; the next save is forced even if
    /// nothing seems dirty.
    pub(crate) save_pending: AtomicBool,
    sync_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A Matrix client for one account.
///
/// Cloning is cheap and every clone drives the same account.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

/// Builder for a [`Client`].
pub struct ClientBuilder {
    store: Store,
    config: ClientConfig,
    homeserver: Option<Url>,
}

impl std::fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBuilder").field("homeserver", &self.homeserver).finish_non_exhaustive()
    }
}

impl ClientBuilder {
    pub(crate) fn new(store: Store) -> Self {
        Self { store, config: ClientConfig::default(), homeserver: None }
    }

    /// The Matrix id, localpart or email address to log in with.
    pub fn user_id(mut self, user_id: &str) -> Self {
        self.config.login_id = Some(user_id.to_owned());
        if let Ok(parsed) = OwnedUserId::try_from(user_id) {
            self.config.user_id = Some(parsed);
        }
        self
    }

    pub fn device_id(mut self, device_id: &str) -> Self {
        self.config.device_id = Some(device_id.into());
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.config.password = Some(Zeroizing::new(password.to_owned()));
        self
    }

    pub fn access_token(mut self, token: &str) -> Self {
        self.config.access_token = Some(token.to_owned());
        self
    }

    pub fn homeserver(mut self, url: Url) -> Self {
        self.homeserver = Some(url);
        self
    }

    pub fn device_display_name(mut self, name: &str) -> Self {
        self.config.device_display_name = Some(name.to_owned());
        self
    }

    /// The passphrase protecting the pickled sessions, as handed back by a
    /// previous [`Client::credentials`] call.
    pub fn pickle_passphrase(mut self, passphrase: &str) -> Self {
        self.config.pickle_passphrase = Some(Zeroizing::new(passphrase.to_owned()));
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Hydrate the builder from a credential store document.
    pub fn credentials(mut self, credentials: &StoredCredentials) -> Self {
        if let Some(user_id) = &credentials.user_id {
            self = self.user_id(user_id);
        }
        if let Some(password) = &credentials.password {
            self = self.password(password);
        }
        if let Some(token) = &credentials.access_token {
            self = self.access_token(token);
        }
        if let Some(device_id) = &credentials.device_id {
            self = self.device_id(device_id);
        }
        if let Some(pickle_key) = &credentials.pickle_key {
            self = self.pickle_passphrase(pickle_key);
        }
        self.config.enabled = credentials.enabled;
        self
    }

    pub async fn build(self) -> Result<Client> {
        let http = HttpClient::new().map_err(Error::from)?;
        if let Some(homeserver) = self.homeserver {
            http.set_homeserver(homeserver).await;
        }
        if let Some(token) = &self.config.access_token {
            http.set_access_token(Some(token.clone())).await;
        }

        let (events_tx, _) = broadcast::channel(256);

        Ok(Client {
            inner: Arc::new(ClientInner {
                store: self.store,
                http,
                config: Mutex::new(self.config),
                state: Mutex::new(SyncState::default()),
                machine: Mutex::new(None),
                directory: Mutex::new(None),
                rooms: RwLock::new(HashMap::new()),
                send_locks: Mutex::new(HashMap::new()),
                verifications: Mutex::new(HashMap::new()),
                events_tx,
                sync_failed: AtomicBool::new(false),
                save_pending: AtomicBool::new(false),
                sync_task: Mutex::new(None),
            }),
        })
    }
}

impl Client {
    /// Subscribe to the client's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events_tx.subscribe()
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    pub async fn user_id(&self) -> Option<OwnedUserId> {
        self.inner.config.lock().await.user_id.clone()
    }

    pub async fn device_id(&self) -> Option<OwnedDeviceId> {
        self.inner.config.lock().await.device_id.clone()
    }

    pub async fn homeserver(&self) -> Option<Url> {
        self.inner.http.homeserver().await
    }

    /// Whether the last sync attempt failed and a retry is pending.
    pub fn sync_failed(&self) -> bool {
        self.inner.sync_failed.load(Ordering::Relaxed)
    }

    pub async fn is_logging_in(&self) -> bool {
        self.inner.state.lock().await.is_logging_in
    }

    /// The credential document to hand to a credential store. `None` until
    /// the first successful login.
    pub async fn credentials(&self) -> Option<StoredCredentials> {
        let pickle_key = {
            let machine = self.inner.machine.lock().await;
            machine.as_ref().map(|m| m.pickle_passphrase().to_string())
        };

        let config = self.inner.config.lock().await;
        Some(StoredCredentials {
            user_id: Some(config.user_id.clone()?.to_string()),
            password: config.password.as_ref().map(|p| p.to_string()),
            access_token: config.access_token.clone(),
            pickle_key,
            device_id: config.device_id.as_ref().map(|d| d.to_string()),
            enabled: config.enabled,
        })
    }

    /// The known rooms, in no particular order.
    pub async fn rooms(&self) -> Vec<Arc<RwLock<Room>>> {
        self.inner.rooms.read().await.values().cloned().collect()
    }

    pub async fn room(&self, room_id: &ruma::RoomId) -> Option<Arc<RwLock<Room>>> {
        self.inner.rooms.read().await.get(room_id).cloned()
    }

    /// Enter the sync state machine.
    ///
    /// Idempotent and re-entrant: while a sync task is running further
    /// calls are no-ops, and every step is guarded by its own flag.
    pub async fn start_sync(&self) {
        let mut task = self.inner.sync_task.lock().await;
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        let client = self.clone();
        *task = Some(tokio::spawn(async move {
            client.sync_loop().await;
        }));
    }

    /// Cancel the running sync, clear retry timers and reset the logged-in
    /// state. The next [`Self::start_sync`] starts from a fresh handle.
    pub async fn stop_sync(&self) {
        if let Some(handle) = self.inner.sync_task.lock().await.take() {
            handle.abort();
        }

        let mut state = self.inner.state.lock().await;
        state.logged_in = false;
        state.is_logging_in = false;
        self.inner.sync_failed.store(false, Ordering::Relaxed);
    }

    /// Invalidate the session server side and drop the local login state.
    pub async fn logout(&self) -> Result<()> {
        let _: serde_json::Value =
            self.inner.http.post("/_matrix/client/r0/logout", &serde_json::json!({})).await?;

        self.stop_sync().await;
        let mut config = self.inner.config.lock().await;
        config.access_token = None;
        self.inner.http.set_access_token(None).await;
        Ok(())
    }

    async fn sync_loop(&self) {
        loop {
            let result = self.advance().await;

            let error = match result {
                Ok(()) => continue,
                Err(e) => e,
            };

            match self.handle_matrix_glitches(&error).await {
                Glitch::Handled => continue,
                Glitch::RetryLater => {
                    self.inner.sync_failed.store(true, Ordering::Relaxed);
                    self.emit(ClientEvent::SyncFailed {
                        error: Arc::new(error),
                        will_retry: true,
                    });
                    tokio::time::sleep(RESYNC_DELAY).await;
                    continue;
                }
                Glitch::Surface => {
                    self.emit(ClientEvent::SyncFailed {
                        error: Arc::new(error),
                        will_retry: false,
                    });
                    break;
                }
            }
        }
    }

    /// Run the first unmet start-up step, or one long-poll sync when the
    /// chain is complete.
    async fn advance(&self) -> Result<()> {
        {
            let state = self.inner.state.lock().await;
            if !state.db_loaded {
                drop(state);
                return self.load_from_store().await;
            }
            if !state.discovered {
                drop(state);
                return self.discover_homeserver().await;
            }
            if !state.verified {
                drop(state);
                return self.verify_homeserver().await;
            }
            if !state.logged_in {
                drop(state);
                return self.login().await;
            }
            if !state.direct_loaded {
                drop(state);
                return self.load_direct_rooms().await;
            }
            if !state.rooms_loaded {
                drop(state);
                return self.load_joined_rooms().await;
            }
            if !state.filter_uploaded {
                drop(state);
                return self.upload_filter().await;
            }
        }

        self.sync_once().await?;
        self.inner.sync_failed.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn load_from_store(&self) -> Result<()> {
        let (user_id, device_id) = {
            let config = self.inner.config.lock().await;
            (config.user_id.clone(), config.device_id.clone())
        };

        if let (Some(user_id), Some(device_id)) = (user_id, device_id) {
            if let Some(account) = self.inner.store.load_account(&user_id, &device_id).await? {
                debug!(user_id = user_id.as_str(), "Restored the account from the store");
                let config = self.inner.config.lock().await;
                let mut state = self.inner.state.lock().await;

                state.next_batch = account.next_batch;
                state.filter_id = account.filter_id.clone();
                state.filter_uploaded = account.filter_id.is_some();

                if let Some(homeserver) = account
                    .homeserver
                    .as_deref()
                    .and_then(|url| Url::parse(url).ok())
                {
                    self.inner.http.set_homeserver(homeserver).await;
                }

                let passphrase = config.pickle_passphrase.clone();
                if let (Some(pickle), Some(passphrase)) = (account.pickle, passphrase) {
                    let machine = OlmMachine::new(
                        self.inner.store.clone(),
                        user_id.clone(),
                        device_id.clone(),
                        Some((pickle, passphrase)),
                    )?;
                    *self.inner.machine.lock().await = Some(machine);
                    self.install_directory(user_id.clone(), device_id.clone()).await;
                }

                if config.access_token.is_some() {
                    self.inner
                        .http
                        .set_access_token(config.access_token.clone())
                        .await;
                }
            }
        }

        self.inner.state.lock().await.db_loaded = true;
        self.restore_rooms().await?;
        Ok(())
    }

    async fn discover_homeserver(&self) -> Result<()> {
        if self.inner.http.homeserver().await.is_some() {
            self.inner.state.lock().await.discovered = true;
            return Ok(());
        }

        let server_name = {
            let config = self.inner.config.lock().await;
            config.user_id.as_ref().map(|u| u.server_name().to_string())
        }
        .ok_or(Error::NoHomeserver)?;

        let well_known_url = Url::parse(&format!("https://{server_name}"))
            .and_then(|u| u.join("/.well-known/matrix/client"))
            .map_err(|_| Error::BadHomeserver(server_name.clone()))?;

        let response: WellKnownResponse =
            self.inner.http.get_absolute(well_known_url).await.map_err(Error::from)?;
        let base_url = response
            .homeserver
            .and_then(|h| Url::parse(&h.base_url).ok())
            .ok_or_else(|| Error::BadHomeserver(server_name.clone()))?;

        info!(%base_url, "Discovered the homeserver");
        self.inner.http.set_homeserver(base_url.clone()).await;
        self.inner.state.lock().await.discovered = true;
        self.emit(ClientEvent::HomeserverDiscovered { base_url });
        Ok(())
    }

    async fn verify_homeserver(&self) -> Result<()> {
        let response: VersionsResponse =
            self.inner.http.get("/_matrix/client/versions", &[], false).await.map_err(Error::from)?;

        if response.versions.is_empty() {
            let homeserver =
                self.inner.http.homeserver().await.map(|u| u.to_string()).unwrap_or_default();
            return Err(Error::BadHomeserver(homeserver));
        }

        self.inner.state.lock().await.verified = true;
        self.emit(ClientEvent::HomeserverVerified);
        Ok(())
    }

    async fn login(&self) -> Result<()> {
        // A known access token short-circuits the password login.
        {
            let config = self.inner.config.lock().await;
            if config.access_token.is_some() {
                self.inner.http.set_access_token(config.access_token.clone()).await;
                drop(config);
                self.ensure_machine().await?;
                self.inner.state.lock().await.logged_in = true;
                self.emit(ClientEvent::LoggedIn { method: LoginMethod::AccessToken });
                return Ok(());
            }
        }

        {
            let mut state = self.inner.state.lock().await;
            state.is_logging_in = true;
        }

        let result = self.password_login().await;

        self.inner.state.lock().await.is_logging_in = false;
        result
    }

    async fn password_login(&self) -> Result<()> {
        let (login_id, password, display_name) = {
            let config = self.inner.config.lock().await;
            (
                config.login_id.clone().ok_or(Error::NoHomeserver)?,
                config.password.clone().ok_or(Error::BadPassword)?,
                config.device_display_name.clone(),
            )
        };

        let request = LoginRequest::password_login(
            LoginIdentifier::new(&login_id),
            password.to_string(),
            display_name,
        );

        let response: Result<LoginResponse, _> =
            self.inner.http.request(reqwest::Method::POST, "/_matrix/client/r0/login", &[], Some(&request), false).await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return Err(match Error::from(e) {
                    Error::Matrix(e) if e.errcode == "M_FORBIDDEN" => Error::BadPassword,
                    e => e,
                })
            }
        };

        // The login response may point us at a better base URL.
        if let Some(base_url) = response
            .well_known
            .as_ref()
            .and_then(|w| w.homeserver.as_ref())
            .and_then(|h| Url::parse(&h.base_url).ok())
        {
            self.inner.http.set_homeserver(base_url).await;
        }

        info!(user_id = response.user_id.as_str(), "Logged in");

        {
            let mut config = self.inner.config.lock().await;
            config.user_id = Some(response.user_id.clone());
            config.device_id = Some(response.device_id.clone());
            config.access_token = Some(response.access_token.clone());
        }
        self.inner.http.set_access_token(Some(response.access_token)).await;

        // A fresh login means fresh identity keys.
        let machine = OlmMachine::new(
            self.inner.store.clone(),
            response.user_id.clone(),
            response.device_id.clone(),
            None,
        )?;
        self.save_account_with(&machine).await?;
        *self.inner.machine.lock().await = Some(machine);
        self.install_directory(response.user_id, response.device_id).await;

        self.inner.state.lock().await.logged_in = true;
        self.emit(ClientEvent::LoggedIn { method: LoginMethod::Password });

        // Publish the device keys and a first batch of one-time keys right
        // away so peers can open Olm channels to us.
        self.top_up_one_time_keys(0).await?;
        Ok(())
    }

    /// Restore or lazily create the crypto machine for token logins.
    async fn ensure_machine(&self) -> Result<()> {
        if self.inner.machine.lock().await.is_some() {
            return Ok(());
        }

        let (user_id, device_id) = {
            let config = self.inner.config.lock().await;
            (config.user_id.clone(), config.device_id.clone())
        };
        let (Some(user_id), Some(device_id)) = (user_id, device_id) else {
            return Err(Error::NotLoggedIn);
        };

        let machine =
            OlmMachine::new(self.inner.store.clone(), user_id.clone(), device_id.clone(), None)?;
        self.save_account_with(&machine).await?;
        *self.inner.machine.lock().await = Some(machine);
        self.install_directory(user_id, device_id).await;
        Ok(())
    }

    async fn install_directory(&self, user_id: OwnedUserId, device_id: OwnedDeviceId) {
        let mut directory = self.inner.directory.lock().await;
        if directory.is_none() {
            *directory =
                Some(Arc::new(UserDirectory::new(user_id, device_id, self.inner.store.clone())));
        }
    }

    pub(crate) async fn directory(&self) -> Result<Arc<UserDirectory>> {
        self.inner.directory.lock().await.clone().ok_or(Error::NotLoggedIn)
    }

    async fn load_direct_rooms(&self) -> Result<()> {
        let user_id = self.user_id().await.ok_or(Error::NotLoggedIn)?;
        let path = format!("/_matrix/client/r0/user/{user_id}/account_data/m.direct");

        match self.inner.http.get::<serde_json::Value>(&path, &[], true).await {
            Ok(content) => self.apply_direct_rooms(&content).await,
            // No direct rooms recorded yet.
            Err(crate::error::HttpError::Api(e)) if e.errcode == "M_NOT_FOUND" => {}
            Err(e) => return Err(e.into()),
        }

        self.inner.state.lock().await.direct_loaded = true;
        Ok(())
    }

    async fn load_joined_rooms(&self) -> Result<()> {
        let response: JoinedRoomsResponse =
            self.inner.http.get("/_matrix/client/r0/joined_rooms", &[], true).await.map_err(Error::from)?;

        for room_id in response.joined_rooms {
            self.get_or_create_room(&room_id).await;
        }

        self.inner.state.lock().await.rooms_loaded = true;
        Ok(())
    }

    async fn upload_filter(&self) -> Result<()> {
        {
            let state = self.inner.state.lock().await;
            if state.filter_id.is_some() {
                drop(state);
                self.inner.state.lock().await.filter_uploaded = true;
                return Ok(());
            }
        }

        let user_id = self.user_id().await.ok_or(Error::NotLoggedIn)?;
        let filter = serde_json::json!({
            "room": {
                "timeline": { "limit": 20 },
                "state": { "lazy_load_members": true },
            },
        });

        let response: FilterResponse = self
            .inner
            .http
            .post(&format!("/_matrix/client/r0/user/{user_id}/filter"), &filter)
            .await
            .map_err(Error::from)?;

        debug!(filter_id = response.filter_id.as_str(), "Uploaded the sync filter");

        {
            let mut state = self.inner.state.lock().await;
            state.filter_id = Some(response.filter_id);
            state.filter_uploaded = true;
        }
        self.save_account().await?;
        Ok(())
    }

    /// Upload one-time keys until the server holds at least half the
    /// account maximum. `server_count` is the server's current count.
    pub(crate) async fn top_up_one_time_keys(&self, server_count: u64) -> Result<()> {
        let mut machine_guard = self.inner.machine.lock().await;
        let machine = machine_guard.as_mut().ok_or(Error::NotLoggedIn)?;

        let target = (machine.max_one_time_keys() / 2) as u64;
        let mut count = server_count;
        let mut include_device_keys = server_count == 0;

        // Two rounds are enough in practice: one to publish the device
        // keys, one to fill the key pool; the cap breaks pathological
        // server answers.
        for _ in 0..3 {
            if count >= target {
                break;
            }

            machine.generate_one_time_keys((target - count) as usize);

            let request = KeysUploadRequest {
                device_keys: if include_device_keys {
                    Some(machine.device_keys()?)
                } else {
                    None
                },
                one_time_keys: machine.signed_one_time_keys()?,
            };

            let response: KeysUploadResponse =
                self.inner.http.post("/_matrix/client/r0/keys/upload", &request).await?;

            machine.mark_keys_as_published();
            include_device_keys = false;
            count = response.signed_curve25519_count();

            debug!(count, "Uploaded one-time keys");
            self.emit(ClientEvent::KeysUploaded { one_time_key_count: count });
        }

        let pickle = machine.account_pickle();
        drop(machine_guard);
        self.save_account_pickle(pickle).await?;
        Ok(())
    }

    /// Persist the account row from the current config and machine state.
    pub(crate) async fn save_account(&self) -> Result<()> {
        let machine = self.inner.machine.lock().await;
        let Some(machine) = machine.as_ref() else {
            return Ok(());
        };
        self.save_account_with(machine).await
    }

    async fn save_account_with(&self, machine: &OlmMachine) -> Result<()> {
        let account = {
            let config = self.inner.config.lock().await;
            let state = self.inner.state.lock().await;
            StoredAccount {
                user_id: machine.user_id().to_owned(),
                device_id: machine.device_id().to_owned(),
                pickle: Some(machine.account_pickle()),
                next_batch: state.next_batch.clone(),
                filter_id: state.filter_id.clone(),
                homeserver: self.inner.http.homeserver().await.map(|u| u.to_string()),
                enabled: config.enabled,
            }
        };

        match self.inner.store.save_account(&account).await {
            Ok(()) => {
                self.inner.save_pending.store(false, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                // Force the next save even if nothing looks dirty by then.
                self.inner.save_pending.store(true, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    async fn save_account_pickle(&self, pickle: String) -> Result<()> {
        let (user_id, device_id) = {
            let config = self.inner.config.lock().await;
            (config.user_id.clone(), config.device_id.clone())
        };
        let (Some(user_id), Some(device_id)) = (user_id, device_id) else {
            return Ok(());
        };

        let account = {
            let config = self.inner.config.lock().await;
            let state = self.inner.state.lock().await;
            StoredAccount {
                user_id,
                device_id,
                pickle: Some(pickle),
                next_batch: state.next_batch.clone(),
                filter_id: state.filter_id.clone(),
                homeserver: self.inner.http.homeserver().await.map(|u| u.to_string()),
                enabled: config.enabled,
            }
        };

        self.inner.store.save_account(&account).await?;
        Ok(())
    }

    pub(crate) async fn get_or_create_room(&self, room_id: &ruma::RoomId) -> Arc<RwLock<Room>> {
        if let Some(room) = self.inner.rooms.read().await.get(room_id) {
            return room.clone();
        }

        let room = Arc::new(RwLock::new(Room::new(room_id.to_owned())));
        self.inner.rooms.write().await.insert(room_id.to_owned(), room.clone());
        room
    }

    async fn restore_rooms(&self) -> Result<()> {
        let (user_id, device_id) = {
            let config = self.inner.config.lock().await;
            (config.user_id.clone(), config.device_id.clone())
        };
        let (Some(user_id), Some(device_id)) = (user_id, device_id) else {
            return Ok(());
        };

        let snapshots = match self.inner.store.load_rooms(&user_id, &device_id).await {
            Ok(snapshots) => snapshots,
            Err(crate::error::StoreError::UnknownAccount(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for snapshot in snapshots {
            let mut room = Room::restore(&snapshot);

            let members = self
                .inner
                .store
                .load_room_members(&user_id, &device_id, snapshot.room_id.clone())
                .await?;
            for (member, state, json) in members {
                room.set_membership_from_store(member, state, json);
            }

            if room.is_encrypted() {
                if let Some(machine) = self.inner.machine.lock().await.as_mut() {
                    machine.set_room_rotation(snapshot.room_id.clone(), room.rotation);
                }
            }

            self.inner
                .rooms
                .write()
                .await
                .insert(snapshot.room_id.clone(), Arc::new(RwLock::new(room)));
        }

        Ok(())
    }

    async fn apply_direct_rooms(&self, content: &serde_json::Value) {
        let Some(map) = content.as_object() else { return };

        for rooms in map.values() {
            let Some(rooms) = rooms.as_array() else { continue };
            for room_id in rooms.iter().filter_map(serde_json::Value::as_str) {
                let Ok(room_id) = <&ruma::RoomId>::try_from(room_id) else { continue };
                let room = self.get_or_create_room(room_id).await;
                room.write().await.direct = true;
            }
        }
    }

    /// Classify a sync-path error.
    ///
    /// `M_UNKNOWN_TOKEN` with a stored password wipes the account and
    /// re-enters the login step. Transport-level failures schedule a
    /// timed retry, gated on a cheap reachability probe. Everything else
    /// is surfaced untouched.
    async fn handle_matrix_glitches(&self, error: &Error) -> Glitch {
        if let Some(matrix) = error.as_matrix() {
            let has_password =
                { self.inner.config.lock().await.password.is_some() };

            if matrix.is_unknown_token() && has_password {
                warn!("The access token went stale, falling back to a password login");
                self.reset_login_state().await;
                self.emit(ClientEvent::AccessTokenExpired);
                return Glitch::Handled;
            }
        }

        if error.is_recoverable() && self.can_connect().await {
            return Glitch::RetryLater;
        }

        Glitch::Surface
    }

    async fn reset_login_state(&self) {
        let (user_id, device_id) = {
            let mut config = self.inner.config.lock().await;
            config.access_token = None;
            (config.user_id.clone(), config.device_id.clone())
        };
        self.inner.http.set_access_token(None).await;

        if let (Some(user_id), Some(device_id)) = (user_id, device_id) {
            if let Err(e) = self.inner.store.delete_account(&user_id, &device_id).await {
                warn!("Failed to drop the stale account row: {e}");
            }
        }

        let mut state = self.inner.state.lock().await;
        state.logged_in = false;
        state.next_batch = None;
        state.filter_uploaded = false;
        state.filter_id = None;
        *self.inner.machine.lock().await = None;
    }

    /// A cheap reachability heuristic: can the homeserver's name be
    /// resolved at all? Retrying while offline would just burn the timer.
    async fn can_connect(&self) -> bool {
        let Some(homeserver) = self.inner.http.homeserver().await else {
            return true;
        };
        let Some(host) = homeserver.host_str() else {
            return true;
        };
        let port = homeserver.port_or_known_default().unwrap_or(443);
        let host = host.to_owned();

        tokio::net::lookup_host((host, port)).await.is_ok()
    }

    pub(crate) async fn sync_once(&self) -> Result<()> {
        // A failed save leaves this flag behind; retry before pulling new
        // state so nothing rides on top of unpersisted state.
        if self.inner.save_pending.load(Ordering::Relaxed) {
            self.save_account().await?;
        }

        let (since, filter) = {
            let state = self.inner.state.lock().await;
            (state.next_batch.clone(), state.filter_id.clone())
        };

        let mut query: Vec<(&str, &str)> = vec![("timeout", SYNC_TIMEOUT_MS)];
        if let Some(since) = since.as_deref() {
            query.push(("since", since));
        }
        if let Some(filter) = filter.as_deref() {
            query.push(("filter", filter));
        }

        let response: crate::api::sync::SyncResponse =
            self.inner.http.get("/_matrix/client/r0/sync", &query, true).await.map_err(Error::from)?;

        self.handle_sync_response(response).await
    }
}

enum Glitch {
    /// The error was absorbed; continue the loop immediately.
    Handled,
    /// Transient; retry after the resync delay.
    RetryLater,
    /// Not ours to fix; tell the application and stop.
    Surface,
}
