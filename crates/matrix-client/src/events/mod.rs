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

//! Room and to-device events.
//!
//! Events are plain data tagged with an [`EventType`]; the content payload
//! stays JSON since most of it is passed through to the application
//! unchanged.

use ruma::{OwnedEventId, OwnedUserId, TransactionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The type of an event, covering the event kinds the library reacts to.
///
/// Everything else is carried as [`EventType::Custom`] so that unknown
/// traffic survives a store round-trip unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    RoomMessage,
    RoomEncrypted,
    RoomMember,
    RoomName,
    RoomTopic,
    RoomAvatar,
    RoomCreate,
    RoomPowerLevels,
    RoomEncryption,
    RoomTombstone,
    RoomRedaction,
    Reaction,
    RoomKey,
    ForwardedRoomKey,
    KeyVerificationRequest,
    KeyVerificationReady,
    KeyVerificationStart,
    KeyVerificationAccept,
    KeyVerificationKey,
    KeyVerificationMac,
    KeyVerificationDone,
    KeyVerificationCancel,
    Direct,
    Typing,
    Receipt,
    CallInvite,
    CallAnswer,
    CallCandidates,
    CallHangup,
    Custom(String),
}

impl EventType {
    pub fn from_str(kind: &str) -> Self {
        match kind {
            "m.room.message" => Self::RoomMessage,
            "m.room.encrypted" => Self::RoomEncrypted,
            "m.room.member" => Self::RoomMember,
            "m.room.name" => Self::RoomName,
            "m.room.topic" => Self::RoomTopic,
            "m.room.avatar" => Self::RoomAvatar,
            "m.room.create" => Self::RoomCreate,
            "m.room.power_levels" => Self::RoomPowerLevels,
            "m.room.encryption" => Self::RoomEncryption,
            "m.room.tombstone" => Self::RoomTombstone,
            "m.room.redaction" => Self::RoomRedaction,
            "m.reaction" => Self::Reaction,
            "m.room_key" => Self::RoomKey,
            "m.forwarded_room_key" => Self::ForwardedRoomKey,
            "m.key.verification.request" => Self::KeyVerificationRequest,
            "m.key.verification.ready" => Self::KeyVerificationReady,
            "m.key.verification.start" => Self::KeyVerificationStart,
            "m.key.verification.accept" => Self::KeyVerificationAccept,
            "m.key.verification.key" => Self::KeyVerificationKey,
            "m.key.verification.mac" => Self::KeyVerificationMac,
            "m.key.verification.done" => Self::KeyVerificationDone,
            "m.key.verification.cancel" => Self::KeyVerificationCancel,
            "m.direct" => Self::Direct,
            "m.typing" => Self::Typing,
            "m.receipt" => Self::Receipt,
            "m.call.invite" => Self::CallInvite,
            "m.call.answer" => Self::CallAnswer,
            "m.call.candidates" => Self::CallCandidates,
            "m.call.hangup" => Self::CallHangup,
            other => Self::Custom(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::RoomMessage => "m.room.message",
            Self::RoomEncrypted => "m.room.encrypted",
            Self::RoomMember => "m.room.member",
            Self::RoomName => "m.room.name",
            Self::RoomTopic => "m.room.topic",
            Self::RoomAvatar => "m.room.avatar",
            Self::RoomCreate => "m.room.create",
            Self::RoomPowerLevels => "m.room.power_levels",
            Self::RoomEncryption => "m.room.encryption",
            Self::RoomTombstone => "m.room.tombstone",
            Self::RoomRedaction => "m.room.redaction",
            Self::Reaction => "m.reaction",
            Self::RoomKey => "m.room_key",
            Self::ForwardedRoomKey => "m.forwarded_room_key",
            Self::KeyVerificationRequest => "m.key.verification.request",
            Self::KeyVerificationReady => "m.key.verification.ready",
            Self::KeyVerificationStart => "m.key.verification.start",
            Self::KeyVerificationAccept => "m.key.verification.accept",
            Self::KeyVerificationKey => "m.key.verification.key",
            Self::KeyVerificationMac => "m.key.verification.mac",
            Self::KeyVerificationDone => "m.key.verification.done",
            Self::KeyVerificationCancel => "m.key.verification.cancel",
            Self::Direct => "m.direct",
            Self::Typing => "m.typing",
            Self::Receipt => "m.receipt",
            Self::CallInvite => "m.call.invite",
            Self::CallAnswer => "m.call.answer",
            Self::CallCandidates => "m.call.candidates",
            Self::CallHangup => "m.call.hangup",
            Self::Custom(kind) => kind,
        }
    }

    /// Stable integer used in the `room_events.event_type` column so the
    /// message history query can filter without touching the JSON payload.
    pub(crate) fn db_code(&self) -> i64 {
        match self {
            Self::RoomMessage => 1,
            Self::RoomEncrypted => 2,
            Self::RoomMember => 3,
            Self::RoomName => 4,
            Self::RoomTopic => 5,
            Self::RoomAvatar => 6,
            Self::RoomCreate => 7,
            Self::RoomPowerLevels => 8,
            Self::RoomEncryption => 9,
            Self::RoomTombstone => 10,
            Self::RoomRedaction => 11,
            Self::Reaction => 12,
            Self::RoomKey => 13,
            Self::ForwardedRoomKey => 14,
            Self::KeyVerificationRequest => 15,
            Self::KeyVerificationReady => 16,
            Self::KeyVerificationStart => 17,
            Self::KeyVerificationAccept => 18,
            Self::KeyVerificationKey => 19,
            Self::KeyVerificationMac => 20,
            Self::KeyVerificationDone => 21,
            Self::KeyVerificationCancel => 22,
            Self::Direct => 23,
            Self::Typing => 24,
            Self::Receipt => 25,
            Self::CallInvite => 26,
            Self::CallAnswer => 27,
            Self::CallCandidates => 28,
            Self::CallHangup => 29,
            Self::Custom(_) => 0,
        }
    }

    /// Room state events mirrored into per-room fields.
    pub fn is_state(&self) -> bool {
        matches!(
            self,
            Self::RoomMember
                | Self::RoomName
                | Self::RoomTopic
                | Self::RoomAvatar
                | Self::RoomCreate
                | Self::RoomPowerLevels
                | Self::RoomEncryption
                | Self::RoomTombstone
        )
    }

    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            Self::KeyVerificationRequest
                | Self::KeyVerificationReady
                | Self::KeyVerificationStart
                | Self::KeyVerificationAccept
                | Self::KeyVerificationKey
                | Self::KeyVerificationMac
                | Self::KeyVerificationDone
                | Self::KeyVerificationCancel
        )
    }
}

/// Where an event is in its life cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Received from the homeserver.
    #[default]
    Received,
    /// Queued or in flight.
    Sending,
    /// The final PUT completed and the server assigned an event id.
    Sent,
    /// The send failed terminally.
    Failed,
}

impl DeliveryState {
    pub(crate) fn db_code(self) -> i64 {
        match self {
            Self::Received => 0,
            Self::Sending => 1,
            Self::Sent => 2,
            Self::Failed => 3,
        }
    }

    pub(crate) fn from_db_code(code: i64) -> Self {
        match code {
            1 => Self::Sending,
            2 => Self::Sent,
            3 => Self::Failed,
            _ => Self::Received,
        }
    }
}

/// A single room or to-device event.
///
/// Delivered events are immutable; an edit arrives as a separate event
/// whose [`Event::replaces`] points at the original.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique event id, assigned by the homeserver. Locally
    /// originated events carry the transaction id until the send completes.
    pub event_id: Option<OwnedEventId>,
    pub event_type: EventType,
    pub sender: Option<OwnedUserId>,
    pub state_key: Option<String>,
    /// Origin server timestamp in milliseconds.
    pub origin_server_ts: Option<i64>,
    /// The (decrypted, if applicable) content payload.
    pub content: Value,
    /// The original `m.room.encrypted` envelope when this event was
    /// decrypted from one.
    pub encrypted_source: Option<Value>,
    /// Event this one replaces (`m.replace` relation).
    pub replaces: Option<OwnedEventId>,
    /// Event this one replies to.
    pub reply_to: Option<OwnedEventId>,
    /// Client-generated transaction id for events we sent.
    pub transaction_id: Option<String>,
    pub state: DeliveryState,
}

impl Event {
    /// Parse an event out of a sync timeline, state list, or to-device
    /// list. Returns `None` when the value has no `type`.
    pub(crate) fn from_sync_json(value: &Value) -> Option<Self> {
        let kind = value.get("type")?.as_str()?;
        let content = value.get("content").cloned().unwrap_or(Value::Null);

        let relates_to = content.get("m.relates_to");
        let replaces = relates_to
            .filter(|r| r.get("rel_type").and_then(Value::as_str) == Some("m.replace"))
            .and_then(|r| r.get("event_id"))
            .and_then(Value::as_str)
            .and_then(|id| id.try_into().ok());
        let reply_to = relates_to
            .and_then(|r| r.get("m.in_reply_to"))
            .and_then(|r| r.get("event_id"))
            .and_then(Value::as_str)
            .and_then(|id| id.try_into().ok());

        Some(Self {
            event_id: value
                .get("event_id")
                .and_then(Value::as_str)
                .and_then(|id| id.try_into().ok()),
            event_type: EventType::from_str(kind),
            sender: value
                .get("sender")
                .and_then(Value::as_str)
                .and_then(|id| id.try_into().ok()),
            state_key: value.get("state_key").and_then(Value::as_str).map(ToOwned::to_owned),
            origin_server_ts: value.get("origin_server_ts").and_then(Value::as_i64),
            content,
            encrypted_source: None,
            replaces,
            reply_to,
            transaction_id: value
                .get("unsigned")
                .and_then(|u| u.get("transaction_id"))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            state: DeliveryState::Received,
        })
    }

    /// A freshly authored `m.text` message, queued for sending.
    pub fn text_message(body: impl Into<String>) -> Self {
        let body = body.into();
        Self::outgoing(
            EventType::RoomMessage,
            serde_json::json!({ "msgtype": "m.text", "body": body }),
        )
    }

    pub(crate) fn outgoing(event_type: EventType, content: Value) -> Self {
        Self {
            event_id: None,
            event_type,
            sender: None,
            state_key: None,
            origin_server_ts: None,
            content,
            encrypted_source: None,
            replaces: None,
            reply_to: None,
            transaction_id: Some(TransactionId::new().to_string()),
            state: DeliveryState::Sending,
        }
    }

    /// The `body` of a message-like content payload.
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }

    /// The identifier events are deduplicated on: the event id when the
    /// server assigned one, the transaction id before that.
    pub(crate) fn uid(&self) -> Option<&str> {
        self.event_id
            .as_ref()
            .map(|id| id.as_str())
            .or(self.transaction_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_message_event() {
        let event = Event::from_sync_json(&json!({
            "type": "m.room.message",
            "event_id": "$ev1",
            "sender": "@alice:example.org",
            "origin_server_ts": 1_662_000_000_123_i64,
            "content": { "msgtype": "m.text", "body": "hi" },
            "unsigned": { "transaction_id": "txn1" },
        }))
        .unwrap();

        assert_eq!(event.event_type, EventType::RoomMessage);
        assert_eq!(event.body(), Some("hi"));
        assert_eq!(event.sender.as_deref().map(|s| s.as_str()), Some("@alice:example.org"));
        assert_eq!(event.transaction_id.as_deref(), Some("txn1"));
        assert_eq!(event.uid(), Some("$ev1"));
    }

    #[test]
    fn parse_replacement_relation() {
        let event = Event::from_sync_json(&json!({
            "type": "m.room.message",
            "event_id": "$ev2",
            "content": {
                "msgtype": "m.text",
                "body": "* fixed",
                "m.relates_to": { "rel_type": "m.replace", "event_id": "$ev1" },
            },
        }))
        .unwrap();

        assert_eq!(event.replaces.as_deref().map(|e| e.as_str()), Some("$ev1"));
        assert_eq!(event.reply_to, None);
    }

    #[test]
    fn type_round_trip() {
        for kind in ["m.room.message", "m.room_key", "m.key.verification.start", "org.custom"] {
            assert_eq!(EventType::from_str(kind).as_str(), kind);
        }
    }

    #[test]
    fn untyped_event_is_rejected() {
        assert!(Event::from_sync_json(&json!({ "content": {} })).is_none());
    }
}
