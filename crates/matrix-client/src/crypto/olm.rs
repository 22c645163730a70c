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

use ruma::OwnedRoomId;
use vodozemac::olm::{Message, OlmMessage, PreKeyMessage, Session, SessionConfig, SessionPickle};

use crate::{error::CryptoError, utilities::now_millis};

/// What kind of cryptographic session a pickle holds.
///
/// The discriminants are the values of the `session.type` column and must
/// never change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKind {
    OlmOut = 0,
    OlmIn = 1,
    MegolmOut = 2,
    MegolmIn = 3,
}

impl SessionKind {
    pub(crate) fn db_code(self) -> i64 {
        self as i64
    }

    pub(crate) fn from_db_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::OlmOut),
            1 => Some(Self::OlmIn),
            2 => Some(Self::MegolmOut),
            3 => Some(Self::MegolmIn),
            _ => None,
        }
    }
}

/// Whether a session may still be used for new traffic.
///
/// Rotated and invalidated sessions stay in the store so historical
/// ciphertext keeps decrypting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Usable = 0,
    Rotated = 1,
    Invalidated = 2,
}

impl SessionState {
    pub(crate) fn db_code(self) -> i64 {
        self as i64
    }

    pub(crate) fn from_db_code(code: i64) -> Self {
        match code {
            1 => Self::Rotated,
            2 => Self::Invalidated,
            _ => Self::Usable,
        }
    }
}

/// The persisted form of a session, one row of the `session` table.
#[derive(Clone, Debug)]
pub struct SessionRecord {
    /// Peer curve25519 key for Olm sessions, the sharing sender's key for
    /// inbound Megolm sessions, our own identity key for outbound Megolm.
    pub sender_key: String,
    pub session_id: String,
    pub kind: SessionKind,
    /// Pickle, encrypted with the account's pickle key.
    pub pickle: String,
    /// Set for Megolm sessions only.
    pub room_id: Option<OwnedRoomId>,
    /// Message index: the outbound message count for Megolm sessions.
    pub chain_index: Option<i64>,
    pub state: SessionState,
    pub created_ms: i64,
    /// The claimed ed25519 key of the sender, inbound Megolm only.
    pub signing_key: Option<String>,
}

/// A 1:1 Olm session with one peer device.
pub(crate) struct OlmSession {
    inner: Session,
    pub kind: SessionKind,
    /// The peer's curve25519 identity key.
    pub sender_key: String,
    pub state: SessionState,
    pub created_ms: i64,
}

impl OlmSession {
    /// Create an outbound session towards a device whose one-time key we
    /// claimed.
    pub fn new_outbound(
        account: &mut vodozemac::olm::Account,
        their_identity_key: vodozemac::Curve25519PublicKey,
        their_one_time_key: vodozemac::Curve25519PublicKey,
    ) -> Self {
        let session = account.create_outbound_session(
            SessionConfig::version_1(),
            their_identity_key,
            their_one_time_key,
        );

        Self {
            inner: session,
            kind: SessionKind::OlmOut,
            sender_key: their_identity_key.to_base64(),
            state: SessionState::Usable,
            created_ms: now_millis(),
        }
    }

    /// Wrap the session half of an inbound creation result.
    pub fn new_inbound(session: Session, their_identity_key: &str) -> Self {
        Self {
            inner: session,
            kind: SessionKind::OlmIn,
            sender_key: their_identity_key.to_owned(),
            state: SessionState::Usable,
            created_ms: now_millis(),
        }
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    pub fn encrypt(&mut self, plaintext: &str) -> OlmMessage {
        self.inner.encrypt(plaintext)
    }

    pub fn decrypt(&mut self, message: &OlmMessage) -> Result<Vec<u8>, CryptoError> {
        Ok(self.inner.decrypt(message)?)
    }

    pub fn to_record(&self, pickle_key: &[u8; 32]) -> SessionRecord {
        SessionRecord {
            sender_key: self.sender_key.clone(),
            session_id: self.session_id(),
            kind: self.kind,
            pickle: self.inner.pickle().encrypt(pickle_key),
            room_id: None,
            chain_index: None,
            state: self.state,
            created_ms: self.created_ms,
            signing_key: None,
        }
    }

    pub fn from_record(record: &SessionRecord, pickle_key: &[u8; 32]) -> Result<Self, CryptoError> {
        let pickle = SessionPickle::from_encrypted(&record.pickle, pickle_key)?;

        Ok(Self {
            inner: Session::from_pickle(pickle),
            kind: record.kind,
            sender_key: record.sender_key.clone(),
            state: record.state,
            created_ms: record.created_ms,
        })
    }
}

/// Rebuild an [`OlmMessage`] from its wire form, a `(type, body)` pair.
pub(crate) fn olm_message_from_parts(
    message_type: u64,
    body: &str,
) -> Result<OlmMessage, CryptoError> {
    match message_type {
        0 => Ok(OlmMessage::PreKey(PreKeyMessage::from_base64(body)?)),
        1 => Ok(OlmMessage::Normal(Message::from_base64(body)?)),
        _ => Err(CryptoError::MalformedEvent("unknown Olm message type")),
    }
}

/// Split an [`OlmMessage`] into its wire form.
pub(crate) fn olm_message_to_parts(message: &OlmMessage) -> (u64, String) {
    match message {
        OlmMessage::PreKey(m) => (0, m.to_base64()),
        OlmMessage::Normal(m) => (1, m.to_base64()),
    }
}

#[cfg(test)]
mod tests {
    use vodozemac::olm::{Account, OlmMessage};

    use super::*;

    #[test]
    fn outbound_session_round_trip() {
        let mut alice = Account::new();
        let mut bob = Account::new();
        bob.generate_one_time_keys(1);

        let one_time_key = *bob.one_time_keys().values().next().unwrap();
        let mut session = OlmSession::new_outbound(&mut alice, bob.curve25519_key(), one_time_key);
        bob.mark_keys_as_published();

        let message = session.encrypt("it's a secret to everybody");
        let OlmMessage::PreKey(prekey) = &message else {
            panic!("the first message must be a pre-key message");
        };

        let inbound = bob.create_inbound_session(alice.curve25519_key(), prekey).unwrap();
        assert_eq!(inbound.plaintext, b"it's a secret to everybody");

        // The ratchet keeps working across a pickle round-trip.
        let pickle_key = [7u8; 32];
        let record = session.to_record(&pickle_key);
        assert_eq!(record.kind, SessionKind::OlmOut);

        let mut restored = OlmSession::from_record(&record, &pickle_key).unwrap();
        let mut bob_session = OlmSession::new_inbound(inbound.session, &alice.curve25519_key().to_base64());

        let second = restored.encrypt("follow-up");
        assert_eq!(bob_session.decrypt(&second).unwrap(), b"follow-up");
    }

    #[test]
    fn message_wire_round_trip() {
        let mut alice = Account::new();
        let mut bob = Account::new();
        bob.generate_one_time_keys(1);
        let one_time_key = *bob.one_time_keys().values().next().unwrap();
        let mut session = OlmSession::new_outbound(&mut alice, bob.curve25519_key(), one_time_key);

        let message = session.encrypt("wire");
        let (message_type, body) = olm_message_to_parts(&message);
        assert_eq!(message_type, 0);

        let rebuilt = olm_message_from_parts(message_type, &body).unwrap();
        let inbound = match &rebuilt {
            OlmMessage::PreKey(m) => bob.create_inbound_session(alice.curve25519_key(), m).unwrap(),
            OlmMessage::Normal(_) => panic!("expected a pre-key message"),
        };
        assert_eq!(inbound.plaintext, b"wire");
    }

    #[test]
    fn kind_codes_are_stable() {
        for kind in [SessionKind::OlmOut, SessionKind::OlmIn, SessionKind::MegolmOut, SessionKind::MegolmIn] {
            assert_eq!(SessionKind::from_db_code(kind.db_code()), Some(kind));
        }
        assert_eq!(SessionKind::from_db_code(17), None);
    }
}
