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

//! Per-room state: the roster, the timeline, and the metadata mirrored out
//! of state events.
//!
//! A `Room` is pure state; everything that talks to the homeserver lives
//! on the [`Client`](crate::Client).

use std::collections::BTreeMap;

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::{json, Value};

use crate::{
    crypto::RotationSettings,
    events::{Event, EventType},
    store::{RoomSnapshot, MEMBER_INVITED, MEMBER_JOINED, MEMBER_LEFT},
};

/// Membership of one user in one room.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Membership {
    Joined,
    Invited,
    Left,
}

impl Membership {
    pub(crate) fn db_code(self) -> i64 {
        match self {
            Self::Joined => MEMBER_JOINED,
            Self::Invited => MEMBER_INVITED,
            Self::Left => MEMBER_LEFT,
        }
    }

    pub(crate) fn from_db_code(code: i64) -> Self {
        match code {
            MEMBER_INVITED => Self::Invited,
            MEMBER_LEFT => Self::Left,
            _ => Self::Joined,
        }
    }
}

/// A member entry: membership plus the profile carried by the member
/// event.
#[derive(Clone, Debug, Default)]
pub struct RoomMember {
    pub membership: Option<Membership>,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// What changed when an event was applied to a room.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct RoomChange {
    /// A member joined, left, or was invited.
    pub membership: bool,
    /// Name, topic, encryption, tombstone or power levels changed.
    pub metadata: bool,
    /// A pending outbound event was confirmed by its transaction id.
    pub confirmed_txn: Option<String>,
}

/// One joined (or invited, or left) room.
#[derive(Debug)]
pub struct Room {
    room_id: OwnedRoomId,
    pub(crate) name: Option<String>,
    pub(crate) topic: Option<String>,
    pub(crate) avatar_url: Option<String>,
    pub(crate) encrypted: bool,
    pub(crate) rotation: RotationSettings,
    pub(crate) direct: bool,
    pub(crate) left: bool,
    pub(crate) tombstone: Option<OwnedRoomId>,
    pub(crate) power_levels: Option<Value>,
    pub(crate) prev_batch: Option<String>,
    pub(crate) members: BTreeMap<OwnedUserId, RoomMember>,
    /// The ordered in-memory timeline, oldest first.
    pub(crate) events: Vec<Event>,
}

impl Room {
    pub(crate) fn new(room_id: OwnedRoomId) -> Self {
        Self {
            room_id,
            name: None,
            topic: None,
            avatar_url: None,
            encrypted: false,
            rotation: RotationSettings::default(),
            direct: false,
            left: false,
            tombstone: None,
            power_levels: None,
            prev_batch: None,
            members: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The explicit room name, if one is set.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// Does the room have encryption enabled? Once on, never off.
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn has_left(&self) -> bool {
        self.left
    }

    /// The room replacing this one after a tombstone.
    pub fn tombstone(&self) -> Option<&RoomId> {
        self.tombstone.as_deref()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn joined_members(&self) -> impl Iterator<Item = &OwnedUserId> {
        self.members
            .iter()
            .filter(|(_, m)| m.membership == Some(Membership::Joined))
            .map(|(id, _)| id)
    }

    pub fn invited_members(&self) -> impl Iterator<Item = &OwnedUserId> {
        self.members
            .iter()
            .filter(|(_, m)| m.membership == Some(Membership::Invited))
            .map(|(id, _)| id)
    }

    pub(crate) fn member_count(&self) -> usize {
        self.joined_members().count()
    }

    /// The name to show for this room.
    ///
    /// Falls back from the explicit name to one derived from up to three
    /// other members, or "Empty room" when nobody else is around.
    pub fn display_name(&self, own_user: &UserId) -> String {
        if let Some(name) = &self.name {
            if !name.is_empty() {
                return name.clone();
            }
        }

        let mut others: Vec<&OwnedUserId> =
            self.joined_members().filter(|id| id.as_str() != own_user.as_str()).collect();
        if others.is_empty() {
            others = self
                .invited_members()
                .filter(|id| id.as_str() != own_user.as_str())
                .collect();
        }

        let label = |id: &OwnedUserId| -> String {
            self.members
                .get(id)
                .and_then(|m| m.display_name.clone())
                .unwrap_or_else(|| id.localpart().to_owned())
        };

        match others.len() {
            0 => "Empty room".to_owned(),
            1 => label(others[0]),
            2 => format!("{} and {}", label(others[0]), label(others[1])),
            n => format!(
                "{} and {} and {} other(s)",
                label(others[0]),
                label(others[1]),
                n - 2
            ),
        }
    }

    /// Mirror a (decrypted) event into the room state and timeline.
    ///
    /// Returns what changed so the caller can persist and notify.
    pub(crate) fn apply_event(&mut self, event: &Event) -> RoomChange {
        let mut change = RoomChange::default();

        // A sync echo of something we sent replaces the pending copy.
        if let Some(txn) = &event.transaction_id {
            if let Some(position) = self
                .events
                .iter()
                .position(|e| e.event_id.is_none() && e.transaction_id.as_deref() == Some(txn))
            {
                self.events.remove(position);
                change.confirmed_txn = Some(txn.clone());
            }
        }

        match &event.event_type {
            EventType::RoomMember => {
                change.membership = self.apply_member_event(event);
            }
            EventType::RoomName => {
                self.name = event
                    .content
                    .get("name")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                change.metadata = true;
            }
            EventType::RoomTopic => {
                self.topic = event
                    .content
                    .get("topic")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                change.metadata = true;
            }
            EventType::RoomAvatar => {
                self.avatar_url =
                    event.content.get("url").and_then(Value::as_str).map(ToOwned::to_owned);
                change.metadata = true;
            }
            EventType::RoomEncryption => {
                self.encrypted = true;
                self.rotation = rotation_from_content(&event.content);
                change.metadata = true;
            }
            EventType::RoomTombstone => {
                self.tombstone = event
                    .content
                    .get("replacement_room")
                    .and_then(Value::as_str)
                    .and_then(|id| id.try_into().ok());
                change.metadata = true;
            }
            EventType::RoomPowerLevels => {
                self.power_levels = Some(event.content.clone());
                change.metadata = true;
            }
            _ => {}
        }

        if event.event_id.is_some() || event.transaction_id.is_some() {
            if !self
                .events
                .iter()
                .any(|e| e.event_id.is_some() && e.event_id == event.event_id)
            {
                self.events.push(event.clone());
            }
        }

        change
    }

    fn apply_member_event(&mut self, event: &Event) -> bool {
        let Some(state_key) = event.state_key.as_deref() else {
            return false;
        };
        let Ok(member_id) = OwnedUserId::try_from(state_key) else {
            return false;
        };

        let membership = match event.content.get("membership").and_then(Value::as_str) {
            Some("join") => Membership::Joined,
            Some("invite") => Membership::Invited,
            Some("leave") | Some("ban") => Membership::Left,
            _ => return false,
        };

        let entry = self.members.entry(member_id).or_default();
        let changed = entry.membership != Some(membership);
        entry.membership = Some(membership);

        if let Some(name) = event.content.get("displayname").and_then(Value::as_str) {
            entry.display_name = Some(name.to_owned());
        }
        if let Some(url) = event.content.get("avatar_url").and_then(Value::as_str) {
            entry.avatar_url = Some(url.to_owned());
        }

        changed
    }

    /// Queue a locally authored event at the end of the timeline.
    pub(crate) fn push_pending(&mut self, event: Event) {
        self.events.push(event);
    }

    pub(crate) fn set_membership_from_store(
        &mut self,
        member: OwnedUserId,
        code: i64,
        json: Option<Value>,
    ) {
        let entry = self.members.entry(member).or_default();
        entry.membership = Some(Membership::from_db_code(code));
        if let Some(json) = json {
            entry.display_name = json
                .get("display_name")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned);
            entry.avatar_url =
                json.get("avatar_url").and_then(Value::as_str).map(ToOwned::to_owned);
        }
    }

    /// The metadata blob persisted in the `rooms` table.
    pub(crate) fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room_id.clone(),
            prev_batch: self.prev_batch.clone(),
            data: json!({
                "name": &self.name,
                "topic": &self.topic,
                "avatar_url": &self.avatar_url,
                "encrypted": self.encrypted,
                "direct": self.direct,
                "left": self.left,
                "power_levels": &self.power_levels,
                "rotation_msgs": self.rotation.messages,
                "rotation_period_ms": self.rotation.period.as_millis() as u64,
            }),
            replacement: self.tombstone.clone(),
        }
    }

    pub(crate) fn restore(snapshot: &RoomSnapshot) -> Self {
        let mut room = Self::new(snapshot.room_id.clone());
        room.prev_batch = snapshot.prev_batch.clone();
        room.tombstone = snapshot.replacement.clone();

        let data = &snapshot.data;
        room.name = data.get("name").and_then(Value::as_str).map(ToOwned::to_owned);
        room.topic = data.get("topic").and_then(Value::as_str).map(ToOwned::to_owned);
        room.avatar_url =
            data.get("avatar_url").and_then(Value::as_str).map(ToOwned::to_owned);
        room.encrypted = data.get("encrypted").and_then(Value::as_bool).unwrap_or(false);
        room.direct = data.get("direct").and_then(Value::as_bool).unwrap_or(false);
        room.left = data.get("left").and_then(Value::as_bool).unwrap_or(false);
        room.power_levels = data.get("power_levels").filter(|v| !v.is_null()).cloned();

        if let Some(messages) = data.get("rotation_msgs").and_then(Value::as_u64) {
            room.rotation.messages = messages;
        }
        if let Some(period) = data.get("rotation_period_ms").and_then(Value::as_u64) {
            room.rotation.period = std::time::Duration::from_millis(period);
        }

        room
    }
}

fn rotation_from_content(content: &Value) -> RotationSettings {
    let mut settings = RotationSettings::default();
    if let Some(messages) = content.get("rotation_period_msgs").and_then(Value::as_u64) {
        settings.messages = messages;
    }
    if let Some(period) = content.get("rotation_period_ms").and_then(Value::as_u64) {
        settings.period = std::time::Duration::from_millis(period);
    }
    settings
}

#[cfg(test)]
mod tests {
    use ruma::{room_id, user_id};
    use serde_json::json;

    use super::*;

    fn member_event(user: &str, membership: &str, display_name: Option<&str>) -> Event {
        let mut content = json!({ "membership": membership });
        if let Some(name) = display_name {
            content["displayname"] = Value::String(name.to_owned());
        }

        Event::from_sync_json(&json!({
            "type": "m.room.member",
            "event_id": format!("$member-{user}-{membership}"),
            "sender": user,
            "state_key": user,
            "origin_server_ts": 1_662_000_000_000_i64,
            "content": content,
        }))
        .unwrap()
    }

    fn room() -> Room {
        Room::new(room_id!("!room:example.org").to_owned())
    }

    #[test]
    fn derived_names_follow_the_fallback_chain() {
        let own = user_id!("@self:example.org");
        let mut room = room();

        assert_eq!(room.display_name(own), "Empty room");

        room.apply_event(&member_event("@self:example.org", "join", None));
        assert_eq!(room.display_name(own), "Empty room");

        room.apply_event(&member_event("@anna:example.org", "join", Some("Anna")));
        assert_eq!(room.display_name(own), "Anna");

        room.apply_event(&member_event("@ben:example.org", "join", None));
        assert_eq!(room.display_name(own), "Anna and ben");

        room.apply_event(&member_event("@carol:example.org", "join", Some("Carol")));
        room.apply_event(&member_event("@dan:example.org", "join", None));
        assert_eq!(room.display_name(own), "Anna and ben and 2 other(s)");

        // The explicit name wins over everything.
        room.apply_event(
            &Event::from_sync_json(&json!({
                "type": "m.room.name",
                "event_id": "$name",
                "content": { "name": "Garden" },
            }))
            .unwrap(),
        );
        assert_eq!(room.display_name(own), "Garden");
    }

    #[test]
    fn invited_members_name_the_room_when_nobody_joined() {
        let own = user_id!("@self:example.org");
        let mut room = room();

        room.apply_event(&member_event("@self:example.org", "join", None));
        room.apply_event(&member_event("@eve:example.org", "invite", Some("Eve")));
        assert_eq!(room.display_name(own), "Eve");
    }

    #[test]
    fn membership_transitions() {
        let mut room = room();

        let change = room.apply_event(&member_event("@anna:example.org", "invite", None));
        assert!(change.membership);
        assert_eq!(room.invited_members().count(), 1);

        // invite → join moves, not duplicates.
        room.apply_event(&member_event("@anna:example.org", "join", None));
        assert_eq!(room.invited_members().count(), 0);
        assert_eq!(room.joined_members().count(), 1);

        room.apply_event(&member_event("@anna:example.org", "leave", None));
        assert_eq!(room.joined_members().count(), 0);

        // Re-applying the same state is not a change.
        let change = room.apply_event(&member_event("@anna:example.org", "leave", None));
        assert!(!change.membership);
    }

    #[test]
    fn encryption_state_is_sticky_and_carries_rotation_limits() {
        let mut room = room();
        assert!(!room.is_encrypted());

        room.apply_event(
            &Event::from_sync_json(&json!({
                "type": "m.room.encryption",
                "event_id": "$enc",
                "content": {
                    "algorithm": "m.megolm.v1.aes-sha2",
                    "rotation_period_msgs": 3,
                },
            }))
            .unwrap(),
        );

        assert!(room.is_encrypted());
        assert_eq!(room.rotation.messages, 3);
    }

    #[test]
    fn local_echo_is_replaced_by_the_server_copy() {
        let mut room = room();

        let mut pending = Event::text_message("hi");
        let txn = pending.transaction_id.clone().unwrap();
        pending.sender = Some(user_id!("@self:example.org").to_owned());
        room.push_pending(pending);
        assert_eq!(room.events().len(), 1);

        let confirmed = Event::from_sync_json(&json!({
            "type": "m.room.message",
            "event_id": "$server",
            "sender": "@self:example.org",
            "content": { "msgtype": "m.text", "body": "hi" },
            "unsigned": { "transaction_id": txn },
        }))
        .unwrap();

        let change = room.apply_event(&confirmed);
        assert_eq!(change.confirmed_txn.as_deref(), Some(txn.as_str()));
        assert_eq!(room.events().len(), 1);
        assert_eq!(room.events()[0].event_id.as_deref().map(|e| e.as_str()), Some("$server"));
    }

    #[test]
    fn snapshot_round_trip() {
        let mut room = room();
        room.name = Some("Garden".to_owned());
        room.encrypted = true;
        room.direct = true;
        room.prev_batch = Some("prev".to_owned());
        room.rotation.messages = 42;

        let restored = Room::restore(&room.snapshot());
        assert_eq!(restored.name(), Some("Garden"));
        assert!(restored.is_encrypted());
        assert!(restored.is_direct());
        assert_eq!(restored.prev_batch.as_deref(), Some("prev"));
        assert_eq!(restored.rotation.messages, 42);
    }
}
