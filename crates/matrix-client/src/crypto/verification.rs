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

//! Interactive device verification with short authentication strings.
//!
//! One [`VerificationSession`] tracks one flow against one peer device,
//! from `m.key.verification.request` to `done` or `cancel`. This side acts
//! as the responder: the peer starts, we accept.

use ruma::{OwnedDeviceId, OwnedUserId};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use vodozemac::{
    sas::{EstablishedSas, Mac, Sas},
    Curve25519PublicKey,
};

use crate::{
    events::EventType,
    utilities::{canonical_json, encode, now_millis},
};

/// A request older than this is stale and gets cancelled.
const MAX_REQUEST_AGE_MS: i64 = 10 * 60 * 1000;
/// A request further in the future than this is bogus and gets cancelled.
const MAX_REQUEST_SKEW_MS: i64 = 5 * 60 * 1000;

const SAS_METHOD: &str = "m.sas.v1";
const KEY_AGREEMENT: &str = "curve25519-hkdf-sha256";
const HASH: &str = "sha256";
const MAC_METHOD: &str = "hkdf-hmac-sha256";

/// Why a verification was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelCode {
    User,
    Timeout,
    UnknownMethod,
    KeyMismatch,
    UserMismatch,
    UnexpectedMessage,
}

impl CancelCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "m.user",
            Self::Timeout => "m.timeout",
            Self::UnknownMethod => "m.unknown_method",
            Self::KeyMismatch => "m.key_mismatch",
            Self::UserMismatch => "m.user_mismatch",
            Self::UnexpectedMessage => "m.unexpected_message",
        }
    }

    fn reason(self) -> &'static str {
        match self {
            Self::User => "User cancelled the verification",
            Self::Timeout => "The verification timed out",
            Self::UnknownMethod => "Unknown or unsupported verification method",
            Self::KeyMismatch => "A key could not be verified",
            Self::UserMismatch => "The expected user did not match",
            Self::UnexpectedMessage => "An unexpected message was received",
        }
    }

    pub(crate) fn from_str(code: &str) -> Self {
        match code {
            "m.timeout" => Self::Timeout,
            "m.unknown_method" => Self::UnknownMethod,
            "m.key_mismatch" => Self::KeyMismatch,
            "m.user_mismatch" => Self::UserMismatch,
            "m.unexpected_message" => Self::UnexpectedMessage,
            _ => Self::User,
        }
    }
}

/// Where a verification flow currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationPhase {
    /// The peer asked for verification; waiting for the user to accept.
    Requested,
    /// We sent `ready`, waiting for the peer's `start`.
    Ready,
    /// `start` validated, `accept` with our commitment sent.
    Accepted,
    /// Both `key` events crossed; emoji and decimals are available.
    KeysExchanged,
    /// The user confirmed the codes; our `mac` is out.
    Confirmed,
    /// The peer's MAC verified and `done` was exchanged.
    Done,
    Cancelled(CancelCode),
}

/// An event the session wants sent to the peer device.
#[derive(Debug)]
pub(crate) struct OutgoingVerification {
    pub event_type: EventType,
    pub content: Value,
}

/// One in-flight SAS verification against one peer device.
pub struct VerificationSession {
    flow_id: String,
    our_user: OwnedUserId,
    our_device: OwnedDeviceId,
    our_ed25519: String,
    their_user: OwnedUserId,
    their_device: OwnedDeviceId,
    their_ed25519: Option<String>,
    phase: VerificationPhase,
    sas: Option<Sas>,
    our_public_key: String,
    established: Option<EstablishedSas>,
    emoji_indices: Option<[u8; 7]>,
    decimals: Option<(u16, u16, u16)>,
    we_confirmed: bool,
    their_mac: Option<Value>,
}

impl std::fmt::Debug for VerificationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationSession")
            .field("flow_id", &self.flow_id)
            .field("their_user", &self.their_user)
            .field("their_device", &self.their_device)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl VerificationSession {
    /// Create a session for an incoming `m.key.verification.request`.
    ///
    /// Requests outside the freshness window are rejected with the cancel
    /// code the caller should send back.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_request(
        our_user: OwnedUserId,
        our_device: OwnedDeviceId,
        our_ed25519: String,
        their_user: OwnedUserId,
        their_device: OwnedDeviceId,
        their_ed25519: Option<String>,
        flow_id: String,
        request_ts_ms: Option<i64>,
    ) -> Result<Self, CancelCode> {
        if let Some(ts) = request_ts_ms {
            let now = now_millis();
            if now - ts > MAX_REQUEST_AGE_MS || ts - now > MAX_REQUEST_SKEW_MS {
                return Err(CancelCode::Timeout);
            }
        }

        let sas = Sas::new();
        let our_public_key = sas.public_key().to_base64();

        Ok(Self {
            flow_id,
            our_user,
            our_device,
            our_ed25519,
            their_user,
            their_device,
            their_ed25519,
            phase: VerificationPhase::Requested,
            sas: Some(sas),
            our_public_key,
            established: None,
            emoji_indices: None,
            decimals: None,
            we_confirmed: false,
            their_mac: None,
        })
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn their_user(&self) -> &OwnedUserId {
        &self.their_user
    }

    pub fn their_device(&self) -> &OwnedDeviceId {
        &self.their_device
    }

    pub fn phase(&self) -> VerificationPhase {
        self.phase
    }

    /// The seven emoji of the short authentication string, available once
    /// keys are exchanged.
    pub fn emoji(&self) -> Option<[(&'static str, &'static str); 7]> {
        self.emoji_indices.map(|indices| indices.map(emoji_from_index))
    }

    /// The three decimal codes, each offset by 1000.
    pub fn decimals(&self) -> Option<(u16, u16, u16)> {
        self.decimals
    }

    /// Whether this flow completed with a verified peer device.
    pub fn is_verified(&self) -> bool {
        self.phase == VerificationPhase::Done
    }

    /// The user accepted the request; produce the `ready` event.
    pub(crate) fn accept_request(&mut self) -> Result<OutgoingVerification, CancelCode> {
        if self.phase != VerificationPhase::Requested {
            return Err(CancelCode::UnexpectedMessage);
        }

        self.phase = VerificationPhase::Ready;
        Ok(OutgoingVerification {
            event_type: EventType::KeyVerificationReady,
            content: json!({
                "transaction_id": self.flow_id.as_str(),
                "from_device": self.our_device.as_str(),
                "methods": [SAS_METHOD],
            }),
        })
    }

    /// Cancel the flow from our side.
    pub(crate) fn cancel(&mut self, code: CancelCode) -> OutgoingVerification {
        self.phase = VerificationPhase::Cancelled(code);
        OutgoingVerification {
            event_type: EventType::KeyVerificationCancel,
            content: json!({
                "transaction_id": self.flow_id.as_str(),
                "code": code.as_str(),
                "reason": code.reason(),
            }),
        }
    }

    /// Feed a verification event into the state machine.
    ///
    /// Returns the events to send in response. An `Err` means the flow has
    /// to be cancelled with the returned code; the caller sends the cancel
    /// event and drops the session.
    pub(crate) fn handle_event(
        &mut self,
        event_type: &EventType,
        content: &Value,
    ) -> Result<Vec<OutgoingVerification>, CancelCode> {
        match event_type {
            EventType::KeyVerificationStart => self.on_start(content),
            EventType::KeyVerificationKey => self.on_key(content),
            EventType::KeyVerificationMac => self.on_mac(content),
            EventType::KeyVerificationDone => self.on_done(),
            EventType::KeyVerificationCancel => {
                let code = content
                    .get("code")
                    .and_then(Value::as_str)
                    .map(CancelCode::from_str)
                    .unwrap_or(CancelCode::User);
                self.phase = VerificationPhase::Cancelled(code);
                Ok(Vec::new())
            }
            _ => Err(CancelCode::UnexpectedMessage),
        }
    }

    fn on_start(&mut self, content: &Value) -> Result<Vec<OutgoingVerification>, CancelCode> {
        if !matches!(self.phase, VerificationPhase::Requested | VerificationPhase::Ready) {
            return Err(CancelCode::UnexpectedMessage);
        }

        let method = content.get("method").and_then(Value::as_str);
        if method != Some(SAS_METHOD)
            || !array_contains(content, "key_agreement_protocols", KEY_AGREEMENT)
            || !array_contains(content, "hashes", HASH)
            || !array_contains(content, "message_authentication_codes", MAC_METHOD)
            || !array_contains(content, "short_authentication_string", "decimal")
        {
            return Err(CancelCode::UnknownMethod);
        }

        // The commitment binds our ephemeral public key to the exact start
        // event we accepted.
        let canonical = canonical_json(content).map_err(|_| CancelCode::UnexpectedMessage)?;
        let commitment = encode(
            Sha256::new()
                .chain_update(self.our_public_key.as_bytes())
                .chain_update(canonical.as_bytes())
                .finalize(),
        );

        self.phase = VerificationPhase::Accepted;
        debug!(flow_id = self.flow_id.as_str(), "Accepting a SAS verification start");

        Ok(vec![OutgoingVerification {
            event_type: EventType::KeyVerificationAccept,
            content: json!({
                "transaction_id": self.flow_id.as_str(),
                "method": SAS_METHOD,
                "key_agreement_protocol": KEY_AGREEMENT,
                "hash": HASH,
                "message_authentication_code": MAC_METHOD,
                "short_authentication_string": ["decimal", "emoji"],
                "commitment": commitment,
            }),
        }])
    }

    fn on_key(&mut self, content: &Value) -> Result<Vec<OutgoingVerification>, CancelCode> {
        if self.phase != VerificationPhase::Accepted {
            return Err(CancelCode::UnexpectedMessage);
        }

        let their_key = content
            .get("key")
            .and_then(Value::as_str)
            .ok_or(CancelCode::UnexpectedMessage)?;
        let their_public_key =
            Curve25519PublicKey::from_base64(their_key).map_err(|_| CancelCode::KeyMismatch)?;

        let sas = self.sas.take().ok_or(CancelCode::UnexpectedMessage)?;
        let established =
            sas.diffie_hellman(their_public_key).map_err(|_| CancelCode::KeyMismatch)?;

        // The starter's info comes first; we are the responder.
        let info = format!(
            "MATRIX_KEY_VERIFICATION_SAS|{}|{}|{}|{}|{}|{}|{}",
            self.their_user,
            self.their_device,
            their_key,
            self.our_user,
            self.our_device,
            self.our_public_key,
            self.flow_id,
        );

        let bytes = established.bytes(&info);
        self.emoji_indices = Some(bytes.emoji_indices());
        self.decimals = Some(bytes.decimals());
        self.established = Some(established);
        self.phase = VerificationPhase::KeysExchanged;

        Ok(vec![OutgoingVerification {
            event_type: EventType::KeyVerificationKey,
            content: json!({
                "transaction_id": self.flow_id.as_str(),
                "key": self.our_public_key.as_str(),
            }),
        }])
    }

    fn on_mac(&mut self, content: &Value) -> Result<Vec<OutgoingVerification>, CancelCode> {
        if !matches!(
            self.phase,
            VerificationPhase::KeysExchanged | VerificationPhase::Confirmed
        ) {
            return Err(CancelCode::UnexpectedMessage);
        }

        self.their_mac = Some(content.clone());

        if self.we_confirmed {
            self.verify_their_mac()?;
            self.phase = VerificationPhase::Done;
            return Ok(vec![self.done_event()]);
        }

        Ok(Vec::new())
    }

    fn on_done(&mut self) -> Result<Vec<OutgoingVerification>, CancelCode> {
        match self.phase {
            VerificationPhase::Done => Ok(Vec::new()),
            VerificationPhase::Confirmed => Ok(Vec::new()),
            _ => Err(CancelCode::UnexpectedMessage),
        }
    }

    /// The user compared the codes and confirmed they match.
    ///
    /// Sends our MAC; when the peer's MAC already arrived it is verified
    /// now and `done` goes out with it.
    pub(crate) fn confirm(&mut self) -> Result<Vec<OutgoingVerification>, CancelCode> {
        if !matches!(
            self.phase,
            VerificationPhase::KeysExchanged | VerificationPhase::Confirmed
        ) || self.we_confirmed
        {
            return Err(CancelCode::UnexpectedMessage);
        }

        let established = self.established.as_ref().ok_or(CancelCode::UnexpectedMessage)?;

        let base_info = format!(
            "MATRIX_KEY_VERIFICATION_MAC{}{}{}{}{}",
            self.our_user, self.our_device, self.their_user, self.their_device, self.flow_id,
        );
        let key_id = format!("ed25519:{}", self.our_device);

        let mac = established
            .calculate_mac(&self.our_ed25519, &format!("{base_info}{key_id}"))
            .to_base64();
        let keys_mac =
            established.calculate_mac(&key_id, &format!("{base_info}KEY_IDS")).to_base64();

        self.we_confirmed = true;
        self.phase = VerificationPhase::Confirmed;

        let mut out = vec![OutgoingVerification {
            event_type: EventType::KeyVerificationMac,
            content: json!({
                "transaction_id": self.flow_id.as_str(),
                "mac": { (key_id): mac },
                "keys": keys_mac,
            }),
        }];

        if self.their_mac.is_some() {
            self.verify_their_mac()?;
            self.phase = VerificationPhase::Done;
            out.push(self.done_event());
        }

        Ok(out)
    }

    fn done_event(&self) -> OutgoingVerification {
        OutgoingVerification {
            event_type: EventType::KeyVerificationDone,
            content: json!({ "transaction_id": self.flow_id.as_str() }),
        }
    }

    fn verify_their_mac(&mut self) -> Result<(), CancelCode> {
        let established = self.established.as_ref().ok_or(CancelCode::UnexpectedMessage)?;
        let content = self.their_mac.as_ref().ok_or(CancelCode::UnexpectedMessage)?;

        let mac_map = content
            .get("mac")
            .and_then(Value::as_object)
            .ok_or(CancelCode::UnexpectedMessage)?;
        let keys_mac = content
            .get("keys")
            .and_then(Value::as_str)
            .ok_or(CancelCode::UnexpectedMessage)?;

        let base_info = format!(
            "MATRIX_KEY_VERIFICATION_MAC{}{}{}{}{}",
            self.their_user, self.their_device, self.our_user, self.our_device, self.flow_id,
        );

        // First the MAC over the sorted key id list.
        let mut key_ids: Vec<&str> = mac_map.keys().map(String::as_str).collect();
        key_ids.sort_unstable();
        let key_ids = key_ids.join(",");

        let keys_mac = Mac::from_base64(keys_mac).map_err(|_| CancelCode::KeyMismatch)?;
        established
            .verify_mac(&key_ids, &format!("{base_info}KEY_IDS"), &keys_mac)
            .map_err(|_| CancelCode::KeyMismatch)?;

        // Then the fingerprint key itself.
        let expected_key_id = format!("ed25519:{}", self.their_device);
        let their_ed25519 =
            self.their_ed25519.as_deref().ok_or(CancelCode::KeyMismatch)?;

        let mut fingerprint_checked = false;
        for (key_id, mac) in mac_map {
            if key_id != &expected_key_id {
                // Cross-signing identity keys are not part of this flow.
                continue;
            }

            let mac = mac
                .as_str()
                .and_then(|m| Mac::from_base64(m).ok())
                .ok_or(CancelCode::KeyMismatch)?;
            established
                .verify_mac(their_ed25519, &format!("{base_info}{key_id}"), &mac)
                .map_err(|_| CancelCode::KeyMismatch)?;
            fingerprint_checked = true;
        }

        if !fingerprint_checked {
            return Err(CancelCode::KeyMismatch);
        }

        debug!(flow_id = self.flow_id.as_str(), "The peer's verification MAC checked out");
        Ok(())
    }
}

fn array_contains(content: &Value, field: &str, needle: &str) -> bool {
    content
        .get(field)
        .and_then(Value::as_array)
        .is_some_and(|a| a.iter().any(|v| v.as_str() == Some(needle)))
}

/// The emoji table of the specification: 64 entries, indexed by 6 bits of
/// the SAS bytes.
fn emoji_from_index(index: u8) -> (&'static str, &'static str) {
    match index {
        0 => ("🐶", "Dog"),
        1 => ("🐱", "Cat"),
        2 => ("🦁", "Lion"),
        3 => ("🐎", "Horse"),
        4 => ("🦄", "Unicorn"),
        5 => ("🐷", "Pig"),
        6 => ("🐘", "Elephant"),
        7 => ("🐰", "Rabbit"),
        8 => ("🐼", "Panda"),
        9 => ("🐓", "Rooster"),
        10 => ("🐧", "Penguin"),
        11 => ("🐢", "Turtle"),
        12 => ("🐟", "Fish"),
        13 => ("🐙", "Octopus"),
        14 => ("🦋", "Butterfly"),
        15 => ("🌷", "Flower"),
        16 => ("🌳", "Tree"),
        17 => ("🌵", "Cactus"),
        18 => ("🍄", "Mushroom"),
        19 => ("🌏", "Globe"),
        20 => ("🌙", "Moon"),
        21 => ("☁️", "Cloud"),
        22 => ("🔥", "Fire"),
        23 => ("🍌", "Banana"),
        24 => ("🍎", "Apple"),
        25 => ("🍓", "Strawberry"),
        26 => ("🌽", "Corn"),
        27 => ("🍕", "Pizza"),
        28 => ("🎂", "Cake"),
        29 => ("❤️", "Heart"),
        30 => ("😀", "Smiley"),
        31 => ("🤖", "Robot"),
        32 => ("🎩", "Hat"),
        33 => ("👓", "Glasses"),
        34 => ("🔧", "Spanner"),
        35 => ("🎅", "Santa"),
        36 => ("👍", "Thumbs Up"),
        37 => ("☂️", "Umbrella"),
        38 => ("⌛", "Hourglass"),
        39 => ("⏰", "Clock"),
        40 => ("🎁", "Gift"),
        41 => ("💡", "Light Bulb"),
        42 => ("📕", "Book"),
        43 => ("✏️", "Pencil"),
        44 => ("📎", "Paperclip"),
        45 => ("✂️", "Scissors"),
        46 => ("🔒", "Lock"),
        47 => ("🔑", "Key"),
        48 => ("🔨", "Hammer"),
        49 => ("☎️", "Telephone"),
        50 => ("🏁", "Flag"),
        51 => ("🚂", "Train"),
        52 => ("🚲", "Bicycle"),
        53 => ("✈️", "Aeroplane"),
        54 => ("🚀", "Rocket"),
        55 => ("🏆", "Trophy"),
        56 => ("⚽", "Ball"),
        57 => ("🎸", "Guitar"),
        58 => ("🎺", "Trumpet"),
        59 => ("🔔", "Bell"),
        60 => ("⚓", "Anchor"),
        61 => ("🎧", "Headphones"),
        62 => ("📁", "Folder"),
        _ => ("📌", "Pin"),
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;

    /// A hand-rolled starter side, standing in for the peer client.
    struct Starter {
        sas: Option<Sas>,
        established: Option<EstablishedSas>,
        public_key: String,
        ed25519: String,
    }

    impl Starter {
        fn new(ed25519: &str) -> Self {
            let sas = Sas::new();
            let public_key = sas.public_key().to_base64();
            Self { sas: Some(sas), established: None, public_key, ed25519: ed25519.to_owned() }
        }

        fn start_content(&self, flow_id: &str) -> Value {
            json!({
                "transaction_id": flow_id,
                "from_device": "BOB1",
                "method": "m.sas.v1",
                "key_agreement_protocols": ["curve25519-hkdf-sha256"],
                "hashes": ["sha256"],
                "message_authentication_codes": ["hkdf-hmac-sha256"],
                "short_authentication_string": ["decimal", "emoji"],
            })
        }

        fn receive_key(&mut self, responder_key: &str, info: &str) -> ([u8; 7], (u16, u16, u16)) {
            let their_key = Curve25519PublicKey::from_base64(responder_key).unwrap();
            let established = self.sas.take().unwrap().diffie_hellman(their_key).unwrap();
            let bytes = established.bytes(info);
            let result = (bytes.emoji_indices(), bytes.decimals());
            self.established = Some(established);
            result
        }

        fn mac_content(&self, flow_id: &str, tampered: bool) -> Value {
            let established = self.established.as_ref().unwrap();
            let base_info = format!(
                "MATRIX_KEY_VERIFICATION_MAC{}{}{}{}{}",
                "@bob:example.org", "BOB1", "@alice:example.org", "ALICE1", flow_id,
            );
            let key_id = "ed25519:BOB1";

            let signed = if tampered { "A".repeat(43) } else { self.ed25519.clone() };
            let mac =
                established.calculate_mac(&signed, &format!("{base_info}{key_id}")).to_base64();
            let keys_mac =
                established.calculate_mac(key_id, &format!("{base_info}KEY_IDS")).to_base64();

            json!({
                "transaction_id": flow_id,
                "mac": { (key_id): mac },
                "keys": keys_mac,
            })
        }
    }

    fn session(their_ed25519: Option<String>) -> VerificationSession {
        VerificationSession::from_request(
            user_id!("@alice:example.org").to_owned(),
            device_id!("ALICE1").to_owned(),
            "alice-ed25519-key".to_owned(),
            user_id!("@bob:example.org").to_owned(),
            device_id!("BOB1").to_owned(),
            their_ed25519,
            "txn-1".to_owned(),
            Some(now_millis()),
        )
        .unwrap()
    }

    fn run_to_keys_exchanged(
        alice: &mut VerificationSession,
        bob: &mut Starter,
    ) -> ([u8; 7], (u16, u16, u16)) {
        alice.accept_request().unwrap();

        let out = alice
            .handle_event(&EventType::KeyVerificationStart, &bob.start_content("txn-1"))
            .unwrap();
        assert_eq!(out[0].event_type, EventType::KeyVerificationAccept);

        let out = alice
            .handle_event(
                &EventType::KeyVerificationKey,
                &json!({ "transaction_id": "txn-1", "key": bob.public_key }),
            )
            .unwrap();
        assert_eq!(out[0].event_type, EventType::KeyVerificationKey);
        let alice_key = out[0].content["key"].as_str().unwrap().to_owned();

        let info = format!(
            "MATRIX_KEY_VERIFICATION_SAS|@bob:example.org|BOB1|{}|@alice:example.org|ALICE1|{}|txn-1",
            bob.public_key, alice_key,
        );
        bob.receive_key(&alice_key, &info)
    }

    #[test]
    fn both_sides_derive_the_same_codes() {
        let mut bob = Starter::new("bob-ed25519-key");
        let mut alice = session(Some("bob-ed25519-key".to_owned()));

        let (bob_emoji, bob_decimals) = run_to_keys_exchanged(&mut alice, &mut bob);

        assert_eq!(alice.phase(), VerificationPhase::KeysExchanged);
        assert_eq!(alice.emoji().unwrap().len(), 7);
        assert_eq!(
            alice.emoji().unwrap().to_vec(),
            bob_emoji.map(emoji_from_index).to_vec()
        );
        assert_eq!(alice.decimals().unwrap(), bob_decimals);

        // All decimals carry the 1000 offset.
        let (a, b, c) = alice.decimals().unwrap();
        for n in [a, b, c] {
            assert!((1000..=9191).contains(&n));
        }
    }

    #[test]
    fn happy_path_ends_verified() {
        let mut bob = Starter::new("bob-ed25519-key");
        let mut alice = session(Some("bob-ed25519-key".to_owned()));
        run_to_keys_exchanged(&mut alice, &mut bob);

        let out = alice.confirm().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_type, EventType::KeyVerificationMac);

        let out = alice
            .handle_event(&EventType::KeyVerificationMac, &bob.mac_content("txn-1", false))
            .unwrap();
        assert_eq!(out[0].event_type, EventType::KeyVerificationDone);
        assert_eq!(alice.phase(), VerificationPhase::Done);
        assert!(alice.is_verified());
    }

    #[test]
    fn mac_over_a_tampered_key_cancels_with_key_mismatch() {
        let mut bob = Starter::new("bob-ed25519-key");
        let mut alice = session(Some("bob-ed25519-key".to_owned()));
        run_to_keys_exchanged(&mut alice, &mut bob);

        alice.confirm().unwrap();
        let result =
            alice.handle_event(&EventType::KeyVerificationMac, &bob.mac_content("txn-1", true));
        assert_eq!(result.unwrap_err(), CancelCode::KeyMismatch);
        assert!(!alice.is_verified());
    }

    #[test]
    fn unsupported_method_is_rejected() {
        let mut alice = session(None);
        alice.accept_request().unwrap();

        let start = json!({
            "transaction_id": "txn-1",
            "method": "m.reciprocate.v1",
            "key_agreement_protocols": ["curve25519-hkdf-sha256"],
            "hashes": ["sha256"],
            "message_authentication_codes": ["hkdf-hmac-sha256"],
            "short_authentication_string": ["decimal"],
        });
        let result = alice.handle_event(&EventType::KeyVerificationStart, &start);
        assert_eq!(result.unwrap_err(), CancelCode::UnknownMethod);
    }

    #[test]
    fn stale_requests_time_out() {
        let result = VerificationSession::from_request(
            user_id!("@alice:example.org").to_owned(),
            device_id!("ALICE1").to_owned(),
            "ed".to_owned(),
            user_id!("@bob:example.org").to_owned(),
            device_id!("BOB1").to_owned(),
            None,
            "txn-2".to_owned(),
            Some(now_millis() - 11 * 60 * 1000),
        );
        assert_eq!(result.unwrap_err(), CancelCode::Timeout);
    }

    #[test]
    fn out_of_order_key_event_is_unexpected() {
        let mut alice = session(None);
        let result = alice.handle_event(
            &EventType::KeyVerificationKey,
            &json!({ "transaction_id": "txn-1", "key": "" }),
        );
        assert_eq!(result.unwrap_err(), CancelCode::UnexpectedMessage);
    }
}
