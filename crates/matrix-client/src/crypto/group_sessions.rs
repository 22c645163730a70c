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

use ruma::OwnedRoomId;
use vodozemac::megolm::{
    GroupSession, GroupSessionPickle, InboundGroupSession, InboundGroupSessionPickle,
    MegolmMessage, SessionConfig, SessionKey,
};

use super::olm::{SessionKind, SessionRecord, SessionState};
use crate::{error::CryptoError, utilities::now_millis};

/// How long and how much an outbound group session may be used before a
/// fresh one has to be distributed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotationSettings {
    /// Maximum session age.
    pub period: Duration,
    /// Maximum number of messages encrypted with one session.
    pub messages: u64,
}

impl Default for RotationSettings {
    fn default() -> Self {
        // One week, matching the common rotation_period_ms room default.
        Self { period: Duration::from_millis(604_800_000), messages: 100 }
    }
}

/// The outbound Megolm session of one room.
pub(crate) struct OutboundGroupSession {
    inner: GroupSession,
    pub room_id: OwnedRoomId,
    pub created_ms: i64,
    pub message_count: u64,
    pub settings: RotationSettings,
    pub state: SessionState,
    /// The exported session key, captured at message index 0 so every
    /// recipient can decrypt from the first message onwards.
    session_key: String,
}

impl OutboundGroupSession {
    pub fn new(room_id: OwnedRoomId, settings: RotationSettings) -> Self {
        let inner = GroupSession::new(SessionConfig::version_1());
        let session_key = inner.session_key().to_base64();

        Self {
            inner,
            room_id,
            created_ms: now_millis(),
            message_count: 0,
            settings,
            state: SessionState::Usable,
            session_key,
        }
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    /// The session key to share with every recipient device.
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    pub fn encrypt(&mut self, plaintext: &str) -> MegolmMessage {
        self.message_count += 1;
        self.inner.encrypt(plaintext)
    }

    /// Has this session hit its message count or age limit?
    pub fn should_rotate(&self) -> bool {
        if self.message_count >= self.settings.messages {
            return true;
        }

        let age_ms = now_millis().saturating_sub(self.created_ms);
        age_ms as u128 >= self.settings.period.as_millis()
    }

    pub fn to_record(&self, own_identity_key: &str, pickle_key: &[u8; 32]) -> SessionRecord {
        SessionRecord {
            sender_key: own_identity_key.to_owned(),
            session_id: self.session_id(),
            kind: SessionKind::MegolmOut,
            pickle: self.inner.pickle().encrypt(pickle_key),
            room_id: Some(self.room_id.clone()),
            chain_index: Some(self.message_count as i64),
            state: self.state,
            created_ms: self.created_ms,
            signing_key: None,
        }
    }

    pub fn from_record(
        record: &SessionRecord,
        settings: RotationSettings,
        pickle_key: &[u8; 32],
    ) -> Result<Self, CryptoError> {
        let room_id = record
            .room_id
            .clone()
            .ok_or(CryptoError::MalformedEvent("Megolm session record without a room id"))?;
        let pickle = GroupSessionPickle::from_encrypted(&record.pickle, pickle_key)?;
        let inner = GroupSession::from_pickle(pickle);
        let session_key = inner.session_key().to_base64();

        Ok(Self {
            inner,
            room_id,
            created_ms: record.created_ms,
            message_count: record.chain_index.unwrap_or(0) as u64,
            settings,
            state: record.state,
            session_key,
        })
    }
}

/// An inbound Megolm session, ours or a peer's.
pub(crate) struct InboundSession {
    inner: InboundGroupSession,
    pub room_id: OwnedRoomId,
    /// Curve25519 key of the device that shared the session with us.
    pub sender_key: String,
    /// The sharing device's claimed ed25519 key.
    pub signing_key: Option<String>,
    pub state: SessionState,
    pub created_ms: i64,
}

impl InboundSession {
    pub fn new(
        session_key: &SessionKey,
        room_id: OwnedRoomId,
        sender_key: String,
        signing_key: Option<String>,
    ) -> Self {
        Self {
            inner: InboundGroupSession::new(session_key, SessionConfig::version_1()),
            room_id,
            sender_key,
            signing_key,
            state: SessionState::Usable,
            created_ms: now_millis(),
        }
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    pub fn decrypt(&mut self, message: &MegolmMessage) -> Result<(Vec<u8>, u32), CryptoError> {
        let decrypted = self.inner.decrypt(message)?;
        Ok((decrypted.plaintext, decrypted.message_index))
    }

    pub fn to_record(&self, pickle_key: &[u8; 32]) -> SessionRecord {
        SessionRecord {
            sender_key: self.sender_key.clone(),
            session_id: self.session_id(),
            kind: SessionKind::MegolmIn,
            pickle: self.inner.pickle().encrypt(pickle_key),
            room_id: Some(self.room_id.clone()),
            chain_index: Some(i64::from(self.inner.first_known_index())),
            state: self.state,
            created_ms: self.created_ms,
            signing_key: self.signing_key.clone(),
        }
    }

    pub fn from_record(record: &SessionRecord, pickle_key: &[u8; 32]) -> Result<Self, CryptoError> {
        let room_id = record
            .room_id
            .clone()
            .ok_or(CryptoError::MalformedEvent("Megolm session record without a room id"))?;
        let pickle = InboundGroupSessionPickle::from_encrypted(&record.pickle, pickle_key)?;

        Ok(Self {
            inner: InboundGroupSession::from_pickle(pickle),
            room_id,
            sender_key: record.sender_key.clone(),
            signing_key: record.signing_key.clone(),
            state: record.state,
            created_ms: record.created_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use ruma::room_id;
    use vodozemac::megolm::SessionKey;

    use super::*;

    #[test]
    fn shared_key_decrypts_in_order() {
        let room = room_id!("!test:example.org");
        let mut outbound = OutboundGroupSession::new(room.to_owned(), RotationSettings::default());

        let key = SessionKey::from_base64(outbound.session_key()).unwrap();
        let mut inbound =
            InboundSession::new(&key, room.to_owned(), "sender-key".to_owned(), None);
        assert_eq!(outbound.session_id(), inbound.session_id());

        for (index, plaintext) in ["first", "second", "third"].iter().enumerate() {
            let message = outbound.encrypt(plaintext);
            let (decrypted, message_index) = inbound.decrypt(&message).unwrap();
            assert_eq!(decrypted, plaintext.as_bytes());
            assert_eq!(message_index, index as u32);
        }
    }

    #[test]
    fn ciphertext_from_another_session_is_rejected() {
        let room = room_id!("!test:example.org");
        let mut outbound = OutboundGroupSession::new(room.to_owned(), RotationSettings::default());
        let other = OutboundGroupSession::new(room.to_owned(), RotationSettings::default());

        let key = SessionKey::from_base64(other.session_key()).unwrap();
        let mut inbound = InboundSession::new(&key, room.to_owned(), "sender-key".to_owned(), None);

        let message = outbound.encrypt("psst");
        inbound.decrypt(&message).unwrap_err();
    }

    #[test]
    fn rotation_accounting() {
        let room = room_id!("!test:example.org");
        let settings = RotationSettings { messages: 3, ..Default::default() };
        let mut outbound = OutboundGroupSession::new(room.to_owned(), settings);

        assert!(!outbound.should_rotate());
        for _ in 0..3 {
            outbound.encrypt("filler");
        }
        assert!(outbound.should_rotate());
    }

    #[test]
    fn outbound_pickle_round_trip_keeps_the_counter() {
        let room = room_id!("!test:example.org");
        let mut outbound = OutboundGroupSession::new(room.to_owned(), RotationSettings::default());
        outbound.encrypt("one");
        outbound.encrypt("two");

        let pickle_key = [3u8; 32];
        let record = outbound.to_record("own-key", &pickle_key);
        assert_eq!(record.chain_index, Some(2));

        let restored =
            OutboundGroupSession::from_record(&record, RotationSettings::default(), &pickle_key)
                .unwrap();
        assert_eq!(restored.message_count, 2);
        assert_eq!(restored.session_id(), outbound.session_id());
        assert_eq!(restored.message_index(), 2);
    }
}
