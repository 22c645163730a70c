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

use std::collections::{BTreeMap, HashMap};

use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::{json, Value};
use tracing::{debug, warn};
use vodozemac::{
    megolm::SessionKey,
    olm::{Account, AccountPickle, OlmMessage},
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature,
};
use zeroize::Zeroizing;

use super::{
    attachments::FileKey,
    group_sessions::{InboundSession, OutboundGroupSession, RotationSettings},
    olm::{olm_message_from_parts, olm_message_to_parts, OlmSession, SessionKind, SessionState},
    MEGOLM_V1, OLM_V1,
};
use crate::{
    error::CryptoError,
    events::{Event, EventType},
    store::Store,
    users::ClaimedDevice,
    utilities::{canonical_json, expand_pickle_key, generate_pickle_passphrase},
};

/// A decrypted to-device message.
#[derive(Debug)]
pub(crate) enum DecryptedToDevice {
    /// The message carried a Megolm session; it has been installed and the
    /// next room decryption can use it.
    RoomKey { room_id: OwnedRoomId, session_id: String },
    /// Any other decrypted event, handed back for dispatch.
    Event(Event),
}

/// All cryptographic state of one account: the Olm account with its
/// identity keys and one-time key pool, every Olm and Megolm session, and
/// the attachment key cache.
pub(crate) struct OlmMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    account: Account,
    pickle_passphrase: Zeroizing<String>,
    pickle_key: Zeroizing<[u8; 32]>,
    store: Store,

    /// All known Olm sessions, inbound and outbound, per peer curve25519
    /// key. Inbound routing scans these since the session id is not on the
    /// wire.
    olm_sessions: HashMap<String, Vec<OlmSession>>,
    /// Inbound Megolm sessions by session id.
    inbound_megolm: HashMap<String, InboundSession>,
    /// Outbound Megolm sessions by session id, including freshly created
    /// ones whose key distribution hasn't completed yet.
    outbound_megolm: HashMap<String, OutboundGroupSession>,
    /// The active outbound session of each room.
    room_out_session: HashMap<OwnedRoomId, String>,
    /// Per-room rotation limits, from `m.room.encryption` state.
    room_rotation: HashMap<OwnedRoomId, RotationSettings>,
    /// Attachment keys by MXC URI.
    file_keys: HashMap<String, FileKey>,
}

impl OlmMachine {
    /// Restore an account from its pickle, or create a fresh one with new
    /// identity keys and a new pickle passphrase.
    pub fn new(
        store: Store,
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        restored: Option<(String, Zeroizing<String>)>,
    ) -> Result<Self, CryptoError> {
        let (account, passphrase) = match restored {
            Some((pickle, passphrase)) => {
                let key = expand_pickle_key(&passphrase);
                let account = Account::from_pickle(AccountPickle::from_encrypted(&pickle, &key)?);
                debug!(user_id = user_id.as_str(), "Restored the Olm account from its pickle");
                (account, passphrase)
            }
            None => {
                debug!(user_id = user_id.as_str(), "Creating a new Olm account");
                (Account::new(), generate_pickle_passphrase())
            }
        };

        let pickle_key = expand_pickle_key(&passphrase);

        Ok(Self {
            user_id,
            device_id,
            account,
            pickle_passphrase: passphrase,
            pickle_key,
            store,
            olm_sessions: HashMap::new(),
            inbound_megolm: HashMap::new(),
            outbound_megolm: HashMap::new(),
            room_out_session: HashMap::new(),
            room_rotation: HashMap::new(),
            file_keys: HashMap::new(),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Our curve25519 identity key, unpadded base64.
    pub fn curve25519_key(&self) -> String {
        self.account.curve25519_key().to_base64()
    }

    /// Our ed25519 fingerprint key, unpadded base64.
    pub fn ed25519_key(&self) -> String {
        self.account.ed25519_key().to_base64()
    }

    /// The account pickle, encrypted with the pickle key, ready for the
    /// `accounts` table.
    pub fn account_pickle(&self) -> String {
        self.account.pickle().encrypt(&self.pickle_key)
    }

    /// The passphrase protecting all pickles. Never written to disk in
    /// clear; hand it to a credential store only.
    pub fn pickle_passphrase(&self) -> &Zeroizing<String> {
        &self.pickle_passphrase
    }

    pub(crate) fn pickle_key(&self) -> [u8; 32] {
        *self.pickle_key
    }

    pub fn set_room_rotation(&mut self, room_id: OwnedRoomId, settings: RotationSettings) {
        self.room_rotation.insert(room_id, settings);
    }

    /// Sign a JSON object in place, merging into any `signatures` already
    /// present. `unsigned` and `signatures` are excluded from the signed
    /// canonical form.
    pub fn sign_json(&self, object: &mut Value) -> Result<(), CryptoError> {
        let map = object
            .as_object_mut()
            .ok_or(CryptoError::MalformedEvent("only objects can be signed"))?;
        let unsigned = map.remove("unsigned");
        let signatures = map.remove("signatures");

        let canonical = canonical_json(object)?;
        let signature = self.account.sign(&canonical);

        let map = object.as_object_mut().expect("the value was an object above");
        if let Some(unsigned) = unsigned {
            map.insert("unsigned".to_owned(), unsigned);
        }

        let mut signatures = signatures.unwrap_or_else(|| json!({}));
        signatures[self.user_id.as_str()][format!("ed25519:{}", self.device_id)] =
            Value::String(signature.to_base64());
        map.insert("signatures".to_owned(), signatures);

        Ok(())
    }

    /// The signed device keys object for `/keys/upload`.
    pub fn device_keys(&self) -> Result<Value, CryptoError> {
        let mut keys = json!({
            "algorithms": [OLM_V1, MEGOLM_V1],
            "device_id": self.device_id.as_str(),
            "user_id": self.user_id.as_str(),
            "keys": {
                (format!("curve25519:{}", self.device_id)): self.curve25519_key(),
                (format!("ed25519:{}", self.device_id)): self.ed25519_key(),
            },
        });
        self.sign_json(&mut keys)?;
        Ok(keys)
    }

    /// The maximum number of one-time keys the account can hold.
    pub fn max_one_time_keys(&self) -> usize {
        self.account.max_number_of_one_time_keys()
    }

    /// Generate up to `count` fresh one-time keys, capped at half the
    /// account maximum per batch. Returns how many were created.
    pub fn generate_one_time_keys(&mut self, count: usize) -> usize {
        let count = count.min(self.max_one_time_keys() / 2);
        self.account.generate_one_time_keys(count);
        count
    }

    /// The not-yet-published one-time keys, each individually signed, in
    /// the `/keys/upload` wire form.
    pub fn signed_one_time_keys(&self) -> Result<BTreeMap<String, Value>, CryptoError> {
        let mut result = BTreeMap::new();

        for (key_id, key) in self.account.one_time_keys() {
            let mut signed = json!({ "key": key.to_base64() });
            self.sign_json(&mut signed)?;
            result.insert(format!("signed_curve25519:{}", key_id.to_base64()), signed);
        }

        Ok(result)
    }

    /// Mark every unpublished one-time key as uploaded.
    pub fn mark_keys_as_published(&mut self) {
        self.account.mark_keys_as_published();
    }

    /// Decrypt an `m.room.encrypted` to-device message.
    ///
    /// Sessions are tried in the order: in-memory cache, store scan,
    /// fresh inbound session for a pre-key message.
    pub async fn handle_to_device(&mut self, event: &Value) -> Result<DecryptedToDevice, CryptoError> {
        let sender = event
            .get("sender")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("to-device event without a sender"))?;
        let content = event
            .get("content")
            .ok_or(CryptoError::MalformedEvent("to-device event without content"))?;

        if content.get("algorithm").and_then(Value::as_str) != Some(OLM_V1) {
            return Err(CryptoError::MalformedEvent("unsupported to-device algorithm"));
        }

        let sender_key = content
            .get("sender_key")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing sender_key"))?
            .to_owned();

        let own_key = self.curve25519_key();
        let ciphertext = content
            .get("ciphertext")
            .and_then(|c| c.get(&own_key))
            .ok_or(CryptoError::MalformedEvent("not encrypted for this device"))?;
        let message_type = ciphertext
            .get("type")
            .and_then(Value::as_u64)
            .ok_or(CryptoError::MalformedEvent("missing Olm message type"))?;
        let body = ciphertext
            .get("body")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing Olm ciphertext"))?;

        let message = olm_message_from_parts(message_type, body)?;
        let plaintext = self.decrypt_olm(&sender_key, message_type, body, &message).await?;

        let decrypted: Value = serde_json::from_slice(&plaintext)?;
        self.check_recipient(sender, &decrypted)?;

        let kind = decrypted
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("decrypted event without a type"))?
            .to_owned();
        let inner_content = decrypted.get("content").cloned().unwrap_or(Value::Null);

        if kind == "m.room_key" {
            let sender_ed25519 = decrypted
                .get("keys")
                .and_then(|k| k.get("ed25519"))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            return self.receive_room_key(&sender_key, sender_ed25519, &inner_content).await;
        }

        let mut event = Event::outgoing(EventType::from_str(&kind), inner_content);
        event.transaction_id = None;
        event.state = crate::events::DeliveryState::Received;
        event.sender = sender.try_into().ok();
        Ok(DecryptedToDevice::Event(event))
    }

    async fn decrypt_olm(
        &mut self,
        sender_key: &str,
        message_type: u64,
        body: &str,
        message: &OlmMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        if let Some(sessions) = self.olm_sessions.get_mut(sender_key) {
            for session in sessions.iter_mut() {
                if let Ok(plaintext) = session.decrypt(message) {
                    let record = session.to_record(&self.pickle_key);
                    self.store.save_session(&self.user_id, &self.device_id, record).await?;
                    return Ok(plaintext);
                }
            }
        }

        // Not in memory; scan the pickled sessions for this peer.
        if let Some((record, plaintext)) = self
            .store
            .lookup_olm_session(
                &self.user_id,
                &self.device_id,
                sender_key.to_owned(),
                message_type,
                body.to_owned(),
                self.pickle_key(),
            )
            .await?
        {
            let session = OlmSession::from_record(&record, &self.pickle_key)?;
            self.olm_sessions.entry(sender_key.to_owned()).or_default().push(session);
            return Ok(plaintext);
        }

        let OlmMessage::PreKey(prekey) = message else {
            return Err(CryptoError::MissingSession(sender_key.to_owned()));
        };

        let identity_key = Curve25519PublicKey::from_base64(sender_key)?;
        let result = self.account.create_inbound_session(identity_key, prekey)?;
        debug!(sender_key, "Created a new inbound Olm session from a pre-key message");

        let session = OlmSession::new_inbound(result.session, sender_key);
        let record = session.to_record(&self.pickle_key);
        self.store.save_session(&self.user_id, &self.device_id, record).await?;
        self.olm_sessions.entry(sender_key.to_owned()).or_default().push(session);

        Ok(result.plaintext)
    }

    /// Reject decrypted payloads that were addressed to a different device.
    fn check_recipient(&self, sender: &str, decrypted: &Value) -> Result<(), CryptoError> {
        if decrypted.get("recipient").and_then(Value::as_str) != Some(self.user_id.as_str()) {
            return Err(CryptoError::MismatchedKeys("recipient"));
        }

        let recipient_ed25519 = decrypted
            .get("recipient_keys")
            .and_then(|k| k.get("ed25519"))
            .and_then(Value::as_str);
        if recipient_ed25519 != Some(self.ed25519_key().as_str()) {
            return Err(CryptoError::MismatchedKeys("recipient key"));
        }

        if decrypted.get("sender").and_then(Value::as_str) != Some(sender) {
            return Err(CryptoError::MismatchedKeys("sender"));
        }

        Ok(())
    }

    async fn receive_room_key(
        &mut self,
        sender_key: &str,
        sender_ed25519: Option<String>,
        content: &Value,
    ) -> Result<DecryptedToDevice, CryptoError> {
        if content.get("algorithm").and_then(Value::as_str) != Some(MEGOLM_V1) {
            return Err(CryptoError::MalformedEvent("unsupported room key algorithm"));
        }

        let room_id: OwnedRoomId = content
            .get("room_id")
            .and_then(Value::as_str)
            .and_then(|id| id.try_into().ok())
            .ok_or(CryptoError::MalformedEvent("room key without a room id"))?;
        let session_key = content
            .get("session_key")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("room key without a session key"))?;

        let session_key = SessionKey::from_base64(session_key)?;
        let session =
            InboundSession::new(&session_key, room_id.clone(), sender_key.to_owned(), sender_ed25519);
        let session_id = session.session_id();

        if content.get("session_id").and_then(Value::as_str) != Some(session_id.as_str()) {
            return Err(CryptoError::MismatchedKeys("session id"));
        }

        debug!(room_id = room_id.as_str(), session_id = session_id.as_str(), "Received a new inbound group session");

        let record = session.to_record(&self.pickle_key);
        self.store.save_session(&self.user_id, &self.device_id, record).await?;
        self.inbound_megolm.insert(session_id.clone(), session);

        Ok(DecryptedToDevice::RoomKey { room_id, session_id })
    }

    /// Decrypt an `m.room.encrypted` room event (the Megolm path).
    pub async fn handle_room_encrypted(
        &mut self,
        room_id: &RoomId,
        event: &Value,
    ) -> Result<Event, CryptoError> {
        let content = event
            .get("content")
            .ok_or(CryptoError::MalformedEvent("encrypted event without content"))?;

        if content.get("algorithm").and_then(Value::as_str) != Some(MEGOLM_V1) {
            return Err(CryptoError::MalformedEvent("unsupported room algorithm"));
        }

        let session_id = content
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing session id"))?;
        let sender_key = content
            .get("sender_key")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing sender_key"))?;
        let ciphertext = content
            .get("ciphertext")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing ciphertext"))?;

        if !self.inbound_megolm.contains_key(session_id) {
            let record = self
                .store
                .lookup_session(
                    &self.user_id,
                    &self.device_id,
                    sender_key.to_owned(),
                    session_id.to_owned(),
                    SessionKind::MegolmIn,
                )
                .await?
                .ok_or_else(|| CryptoError::UnknownMegolmSession(session_id.to_owned()))?;
            let session = InboundSession::from_record(&record, &self.pickle_key)?;
            self.inbound_megolm.insert(session_id.to_owned(), session);
        }

        let session = self
            .inbound_megolm
            .get_mut(session_id)
            .expect("the session was inserted above");

        let message = vodozemac::megolm::MegolmMessage::from_base64(ciphertext)
            .map_err(|_| CryptoError::MalformedEvent("undecodable Megolm ciphertext"))?;
        let (plaintext, _message_index) = session.decrypt(&message)?;

        let record = session.to_record(&self.pickle_key);
        self.store.save_session(&self.user_id, &self.device_id, record).await?;

        let decrypted: Value = serde_json::from_slice(&plaintext)?;
        if decrypted.get("room_id").and_then(Value::as_str) != Some(room_id.as_str()) {
            return Err(CryptoError::MismatchedKeys("room id"));
        }

        let kind = decrypted
            .get("type")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("decrypted event without a type"))?;
        let inner_content = decrypted.get("content").cloned().unwrap_or(Value::Null);

        let mut result = Event::from_sync_json(event)
            .ok_or(CryptoError::MalformedEvent("encrypted event without a type"))?;
        result.encrypted_source = Some(event.clone());
        result.event_type = EventType::from_str(kind);
        result.content = inner_content;

        if let Some(file) = result.content.get("file") {
            if let Some(file_key) = FileKey::from_content(file) {
                self.save_file_enc(file_key).await?;
            }
        }

        Ok(result)
    }

    /// Is there a usable outbound group session for the room? Rotates the
    /// session out when it hit its limits.
    pub async fn has_room_group_key(&mut self, room_id: &RoomId) -> Result<bool, CryptoError> {
        let Some(session_id) = self.room_out_session.get(room_id).cloned() else {
            return Ok(false);
        };
        let own_identity_key = self.curve25519_key();

        let Some(session) = self.outbound_megolm.get_mut(&session_id) else {
            self.room_out_session.remove(room_id);
            return Ok(false);
        };

        if session.state == SessionState::Usable && !session.should_rotate() {
            return Ok(true);
        }

        debug!(
            room_id = room_id.as_str(),
            session_id = session_id.as_str(),
            "The outbound group session expired, rotating it out"
        );
        session.state = SessionState::Rotated;
        let record = session.to_record(&own_identity_key, &self.pickle_key);
        self.store.save_session(&self.user_id, &self.device_id, record).await?;

        self.outbound_megolm.remove(&session_id);
        self.room_out_session.remove(room_id);
        Ok(false)
    }

    /// Create a fresh outbound group session for the room and the per-device
    /// `m.room.encrypted` Olm envelopes distributing its key.
    ///
    /// The session is not activated here; call [`Self::set_room_group_key`]
    /// once the `/sendToDevice` request went through, so no message is ever
    /// encrypted with a key the recipients don't hold.
    pub async fn create_room_group_keys(
        &mut self,
        room_id: &RoomId,
        recipients: &[ClaimedDevice],
    ) -> Result<(String, BTreeMap<OwnedUserId, BTreeMap<String, Value>>), CryptoError> {
        let settings = self.room_rotation.get(room_id).copied().unwrap_or_default();
        let session = OutboundGroupSession::new(room_id.to_owned(), settings);
        let session_id = session.session_id();
        let session_key = session.session_key().to_owned();

        // Keep an inbound copy so our own messages decrypt on this device.
        let own_inbound = InboundSession::new(
            &SessionKey::from_base64(&session_key)?,
            room_id.to_owned(),
            self.curve25519_key(),
            Some(self.ed25519_key()),
        );
        let record = own_inbound.to_record(&self.pickle_key);
        self.store.save_session(&self.user_id, &self.device_id, record).await?;
        self.inbound_megolm.insert(own_inbound.session_id(), own_inbound);

        let record = session.to_record(&self.curve25519_key(), &self.pickle_key);
        self.store.save_session(&self.user_id, &self.device_id, record).await?;
        self.outbound_megolm.insert(session_id.clone(), session);

        let mut messages: BTreeMap<OwnedUserId, BTreeMap<String, Value>> = BTreeMap::new();

        for device in recipients {
            if device.user_id == self.user_id && device.device_id == self.device_id {
                continue;
            }

            let payload = json!({
                "type": "m.room_key",
                "content": {
                    "algorithm": MEGOLM_V1,
                    "room_id": room_id.as_str(),
                    "session_id": session_id.as_str(),
                    "session_key": session_key.as_str(),
                },
                "sender": self.user_id.as_str(),
                "sender_device": self.device_id.as_str(),
                "keys": { "ed25519": self.ed25519_key() },
                "recipient": device.user_id.as_str(),
                "recipient_keys": { "ed25519": device.ed25519.as_str() },
            });

            match self.encrypt_to_device(device, &payload.to_string()).await {
                Ok(encrypted) => {
                    messages
                        .entry(device.user_id.clone())
                        .or_default()
                        .insert(device.device_id.to_string(), encrypted);
                }
                Err(e) => {
                    warn!(
                        user_id = device.user_id.as_str(),
                        device_id = device.device_id.as_str(),
                        "Skipping a device the room key can't be encrypted for: {e}"
                    );
                }
            }
        }

        Ok((session_id, messages))
    }

    /// Olm-encrypt a payload for one device, creating an outbound session
    /// from its claimed one-time key if none exists yet.
    async fn encrypt_to_device(
        &mut self,
        device: &ClaimedDevice,
        plaintext: &str,
    ) -> Result<Value, CryptoError> {
        let sessions = self.olm_sessions.entry(device.curve25519.clone()).or_default();

        let session = match sessions
            .iter_mut()
            .find(|s| s.kind == SessionKind::OlmOut && s.state == SessionState::Usable)
        {
            Some(session) => session,
            None => {
                let one_time_key = device
                    .one_time_key
                    .as_deref()
                    .ok_or_else(|| CryptoError::MissingSession(device.curve25519.clone()))?;
                let session = OlmSession::new_outbound(
                    &mut self.account,
                    Curve25519PublicKey::from_base64(&device.curve25519)?,
                    Curve25519PublicKey::from_base64(one_time_key)?,
                );
                sessions.push(session);
                sessions.last_mut().expect("the session was pushed above")
            }
        };

        let message = session.encrypt(plaintext);
        let (message_type, body) = olm_message_to_parts(&message);
        let record = session.to_record(&self.pickle_key);
        self.store.save_session(&self.user_id, &self.device_id, record).await?;

        Ok(json!({
            "algorithm": OLM_V1,
            "sender_key": self.curve25519_key(),
            "ciphertext": {
                (device.curve25519.clone()): { "type": message_type, "body": body },
            },
        }))
    }

    /// Activate a distributed group session as the room's outbound session.
    pub fn set_room_group_key(&mut self, room_id: &RoomId, session_id: &str) {
        self.room_out_session.insert(room_id.to_owned(), session_id.to_owned());
    }

    /// Invalidate the room's outbound session, e.g. because the member list
    /// or a member's device list changed. Past traffic stays decryptable.
    pub async fn rm_room_group_key(&mut self, room_id: &RoomId) -> Result<(), CryptoError> {
        let Some(session_id) = self.room_out_session.remove(room_id) else {
            return Ok(());
        };

        if let Some(mut session) = self.outbound_megolm.remove(&session_id) {
            session.state = SessionState::Invalidated;
            let record = session.to_record(&self.curve25519_key(), &self.pickle_key);
            self.store.save_session(&self.user_id, &self.device_id, record).await?;
        }

        Ok(())
    }

    /// Encrypt a room event with the room's outbound group session,
    /// returning ready `m.room.encrypted` content.
    pub async fn encrypt_for_room(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<Value, CryptoError> {
        let session_id = self
            .room_out_session
            .get(room_id)
            .cloned()
            .ok_or_else(|| CryptoError::MissingOutboundSession(room_id.to_string()))?;
        let own_identity_key = self.curve25519_key();
        let session = self
            .outbound_megolm
            .get_mut(&session_id)
            .ok_or_else(|| CryptoError::MissingOutboundSession(room_id.to_string()))?;

        let payload = json!({
            "type": event_type,
            "content": content,
            "room_id": room_id.as_str(),
        });
        let ciphertext = session.encrypt(&payload.to_string());

        let record = session.to_record(&own_identity_key, &self.pickle_key);
        self.store.save_session(&self.user_id, &self.device_id, record).await?;

        Ok(json!({
            "algorithm": MEGOLM_V1,
            "ciphertext": ciphertext.to_base64(),
            "sender_key": own_identity_key,
            "session_id": session_id,
            "device_id": self.device_id.as_str(),
        }))
    }

    /// Look up the attachment key for an MXC URI, cache first, store
    /// second.
    pub async fn find_file_enc(&mut self, uri: &str) -> Result<Option<FileKey>, CryptoError> {
        if let Some(key) = self.file_keys.get(uri) {
            return Ok(Some(key.clone()));
        }

        let key = self.store.find_file_enc(&self.user_id, &self.device_id, uri.to_owned()).await?;
        if let Some(key) = &key {
            self.file_keys.insert(uri.to_owned(), key.clone());
        }
        Ok(key)
    }

    pub async fn save_file_enc(&mut self, key: FileKey) -> Result<(), CryptoError> {
        if let Some(uri) = &key.mxc_uri {
            self.file_keys.insert(uri.clone(), key.clone());
            self.store.save_file_enc(&self.user_id, &self.device_id, key).await?;
        }
        Ok(())
    }
}

/// Verify the ed25519 signature of a signed JSON object against the given
/// key. The object is checked in its canonical form with `signatures` and
/// `unsigned` removed.
pub(crate) fn verify_signed_json(
    object: &Value,
    user_id: &UserId,
    device_id: &str,
    ed25519_key: &str,
) -> Result<(), CryptoError> {
    let mut copy = object.clone();
    let map = copy
        .as_object_mut()
        .ok_or(CryptoError::MalformedEvent("only objects can be verified"))?;

    let signatures = map
        .remove("signatures")
        .ok_or(CryptoError::MalformedEvent("missing signatures"))?;
    map.remove("unsigned");

    let signature = signatures
        .get(user_id.as_str())
        .and_then(|s| s.get(format!("ed25519:{device_id}")))
        .and_then(Value::as_str)
        .ok_or(CryptoError::MalformedEvent("no signature by the expected device"))?;
    let signature = Ed25519Signature::from_base64(signature)?;
    let key = Ed25519PublicKey::from_base64(ed25519_key)?;

    let canonical = canonical_json(&copy)?;
    key.verify(canonical.as_bytes(), &signature)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};

    use super::*;
    use crate::store::Store;

    async fn machine(user: &UserId, device: &DeviceId) -> (OlmMachine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "matrix.db").await.unwrap();
        store
            .save_account(&crate::store::StoredAccount {
                user_id: user.to_owned(),
                device_id: device.to_owned(),
                pickle: None,
                next_batch: None,
                filter_id: None,
                homeserver: None,
                enabled: true,
            })
            .await
            .unwrap();
        let machine =
            OlmMachine::new(store, user.to_owned(), device.to_owned(), None).unwrap();
        (machine, dir)
    }

    fn claimed_device(machine: &mut OlmMachine) -> ClaimedDevice {
        machine.generate_one_time_keys(1);
        let one_time_key =
            machine.account.one_time_keys().values().next().unwrap().to_base64();
        machine.mark_keys_as_published();

        ClaimedDevice {
            user_id: machine.user_id().to_owned(),
            device_id: machine.device_id().to_owned(),
            curve25519: machine.curve25519_key(),
            ed25519: machine.ed25519_key(),
            one_time_key: Some(one_time_key),
        }
    }

    #[tokio::test]
    async fn sign_and_verify_json() {
        let (machine, _dir) = machine(user_id!("@alice:example.org"), device_id!("ALICE1")).await;

        let mut object = json!({ "key": "value", "unsigned": { "age": 5 } });
        machine.sign_json(&mut object).unwrap();

        verify_signed_json(
            &object,
            user_id!("@alice:example.org"),
            "ALICE1",
            &machine.ed25519_key(),
        )
        .unwrap();

        // A single changed bit in the signed body must fail verification.
        object["key"] = Value::String("othervalue".to_owned());
        verify_signed_json(
            &object,
            user_id!("@alice:example.org"),
            "ALICE1",
            &machine.ed25519_key(),
        )
        .unwrap_err();
    }

    #[tokio::test]
    async fn one_time_keys_are_published_once() {
        let (mut machine, _dir) = machine(user_id!("@alice:example.org"), device_id!("A1")).await;

        let generated = machine.generate_one_time_keys(5);
        assert_eq!(generated, 5);
        assert_eq!(machine.signed_one_time_keys().unwrap().len(), 5);

        machine.mark_keys_as_published();
        assert!(machine.signed_one_time_keys().unwrap().is_empty());

        machine.generate_one_time_keys(usize::MAX);
        assert!(!machine.signed_one_time_keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn encrypted_room_message_round_trip() {
        let room = room_id!("!room:example.org");
        let (mut alice, _a) = machine(user_id!("@alice:example.org"), device_id!("A1")).await;
        let (mut bob, _b) = machine(user_id!("@bob:example.org"), device_id!("B1")).await;

        let bob_device = claimed_device(&mut bob);
        let (session_id, messages) =
            alice.create_room_group_keys(room, &[bob_device]).await.unwrap();
        alice.set_room_group_key(room, &session_id);

        // Simulate the to-device delivery of the room key to Bob.
        let envelope = &messages[bob.user_id()][bob.device_id().as_str()];
        let to_device = json!({
            "type": "m.room.encrypted",
            "sender": alice.user_id().as_str(),
            "content": envelope,
        });
        let decrypted = bob.handle_to_device(&to_device).await.unwrap();
        assert_matches::assert_matches!(decrypted, DecryptedToDevice::RoomKey { .. });

        // Now the actual room message.
        for body in ["hello", "world"] {
            let content = json!({ "msgtype": "m.text", "body": body });
            let encrypted = alice.encrypt_for_room(room, "m.room.message", &content).await.unwrap();

            let event = json!({
                "type": "m.room.encrypted",
                "event_id": format!("${body}"),
                "sender": alice.user_id().as_str(),
                "origin_server_ts": 1_662_000_000_000_i64,
                "content": encrypted,
            });

            let decrypted = bob.handle_room_encrypted(room, &event).await.unwrap();
            assert_eq!(decrypted.event_type, EventType::RoomMessage);
            assert_eq!(decrypted.body(), Some(body));
            assert!(decrypted.encrypted_source.is_some());
        }

        // Alice can decrypt her own traffic through the inbound copy.
        let content = json!({ "msgtype": "m.text", "body": "self" });
        let encrypted = alice.encrypt_for_room(room, "m.room.message", &content).await.unwrap();
        let event = json!({
            "type": "m.room.encrypted",
            "event_id": "$self",
            "sender": alice.user_id().as_str(),
            "content": encrypted,
        });
        let decrypted = alice.handle_room_encrypted(room, &event).await.unwrap();
        assert_eq!(decrypted.body(), Some("self"));
    }

    #[tokio::test]
    async fn rotation_by_message_count_triggers_redistribution() {
        let room = room_id!("!room:example.org");
        let (mut alice, _a) = machine(user_id!("@alice:example.org"), device_id!("A1")).await;
        let (mut bob, _b) = machine(user_id!("@bob:example.org"), device_id!("B1")).await;

        alice.set_room_rotation(
            room.to_owned(),
            RotationSettings { messages: 3, ..Default::default() },
        );

        let bob_device = claimed_device(&mut bob);
        let (first_session, messages) =
            alice.create_room_group_keys(room, std::slice::from_ref(&bob_device)).await.unwrap();
        alice.set_room_group_key(room, &first_session);

        let envelope = &messages[bob.user_id()][bob.device_id().as_str()];
        bob.handle_to_device(&json!({
            "type": "m.room.encrypted",
            "sender": alice.user_id().as_str(),
            "content": envelope,
        }))
        .await
        .unwrap();

        let mut events = Vec::new();
        for (index, body) in ["one", "two", "three"].iter().enumerate() {
            assert!(alice.has_room_group_key(room).await.unwrap(), "message {index}");
            let content = json!({ "msgtype": "m.text", "body": body });
            events.push(alice.encrypt_for_room(room, "m.room.message", &content).await.unwrap());
        }

        // The third message exhausted the session.
        assert!(!alice.has_room_group_key(room).await.unwrap());

        let (second_session, messages) =
            alice.create_room_group_keys(room, std::slice::from_ref(&bob_device)).await.unwrap();
        assert_ne!(first_session, second_session);
        alice.set_room_group_key(room, &second_session);

        let envelope = &messages[bob.user_id()][bob.device_id().as_str()];
        bob.handle_to_device(&json!({
            "type": "m.room.encrypted",
            "sender": alice.user_id().as_str(),
            "content": envelope,
        }))
        .await
        .unwrap();

        let content = json!({ "msgtype": "m.text", "body": "four" });
        events.push(alice.encrypt_for_room(room, "m.room.message", &content).await.unwrap());

        // Bob decrypts all four messages across both sessions.
        for (index, encrypted) in events.iter().enumerate() {
            let event = json!({
                "type": "m.room.encrypted",
                "event_id": format!("$ev{index}"),
                "sender": alice.user_id().as_str(),
                "content": encrypted,
            });
            let decrypted = bob.handle_room_encrypted(room, &event).await.unwrap();
            assert_eq!(decrypted.event_type, EventType::RoomMessage);
        }
    }

    #[tokio::test]
    async fn account_pickle_round_trip() {
        let (mut machine, dir) = machine(user_id!("@alice:example.org"), device_id!("A1")).await;
        machine.generate_one_time_keys(2);

        let pickle = machine.account_pickle();
        let passphrase = machine.pickle_passphrase().clone();
        let curve = machine.curve25519_key();
        let store = Store::open(dir.path(), "matrix.db").await.unwrap();

        let restored = OlmMachine::new(
            store,
            machine.user_id().to_owned(),
            machine.device_id().to_owned(),
            Some((pickle, passphrase)),
        )
        .unwrap();

        assert_eq!(restored.curve25519_key(), curve);
        assert_eq!(restored.signed_one_time_keys().unwrap().len(), 2);
    }
}
