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

//! Dispatching one `/sync` response into the other components.
//!
//! The handling order is fixed: account data, then to-device messages
//! (they may carry the Megolm keys the room events right after them
//! need), then joined rooms, then device list changes.

use std::sync::Arc;

use ruma::{OwnedRoomId, RoomId};
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{Client, ClientEvent};
use crate::{
    api::{keys::SIGNED_CURVE25519, sync::JoinedRoom, sync::SyncResponse},
    crypto::DecryptedToDevice,
    error::{Error, Result},
    events::{Event, EventType},
    room::Membership,
};

impl Client {
    pub(super) async fn handle_sync_response(&self, response: SyncResponse) -> Result<()> {
        // 1. Account data.
        for event in &response.account_data.events {
            if event.get("type").and_then(Value::as_str) == Some("m.direct") {
                if let Some(content) = event.get("content") {
                    self.apply_direct_rooms(content).await;
                }
            }
        }

        // 2. To-device traffic, Megolm key shares first of all.
        for event in &response.to_device.events {
            self.handle_to_device_event(event).await;
        }

        // 3. Joined rooms.
        for (room_id, payload) in &response.rooms.join {
            self.handle_joined_room(room_id, payload).await?;
        }

        // Invites and leaves only touch local membership.
        for (room_id, payload) in &response.rooms.invite {
            let room = self.get_or_create_room(room_id).await;
            let mut room = room.write().await;
            for raw in &payload.invite_state.events {
                if let Some(event) = Event::from_sync_json(raw) {
                    room.apply_event(&event);
                }
            }
            drop(room);
            self.emit(ClientEvent::RoomUpdated { room_id: room_id.clone() });
        }

        for (room_id, _payload) in &response.rooms.leave {
            if let Some(room) = self.room(room_id).await {
                room.write().await.left = true;
                self.persist_room(room_id).await?;
                self.emit(ClientEvent::RoomUpdated { room_id: room_id.clone() });
            }
        }

        // 4. Device list changes.
        if !response.device_lists.changed.is_empty() {
            let directory = self.directory().await?;
            directory.mark_changed(&response.device_lists.changed).await;
        }

        // The batch is applied; move the cursor and persist everything in
        // one account save. Decryption failures above were logged and
        // skipped, they never hold the cursor back.
        {
            let mut state = self.inner.state.lock().await;
            state.next_batch = Some(response.next_batch.clone());
        }
        self.save_account().await?;

        // Top the one-time key pool up when the server runs low.
        let server_count =
            response.device_one_time_keys_count.get(SIGNED_CURVE25519).copied();
        if let Some(count) = server_count {
            let max = {
                let machine = self.inner.machine.lock().await;
                machine.as_ref().map(|m| m.max_one_time_keys() as u64)
            };
            if let Some(max) = max {
                if count < max / 2 {
                    self.top_up_one_time_keys(count).await?;
                }
            }
        }

        self.emit(ClientEvent::SyncCompleted { next_batch: response.next_batch });
        Ok(())
    }

    async fn handle_to_device_event(&self, raw: &Value) {
        let Some(kind) = raw.get("type").and_then(Value::as_str) else {
            return;
        };

        match kind {
            "m.room.encrypted" => {
                let decrypted = {
                    let mut machine = self.inner.machine.lock().await;
                    let Some(machine) = machine.as_mut() else { return };
                    machine.handle_to_device(raw).await
                };

                match decrypted {
                    Ok(DecryptedToDevice::RoomKey { room_id, session_id }) => {
                        trace!(
                            room_id = room_id.as_str(),
                            session_id = session_id.as_str(),
                            "Installed an inbound group session"
                        );
                    }
                    Ok(DecryptedToDevice::Event(event)) => {
                        if event.event_type.is_verification() {
                            self.handle_verification_event(&event).await;
                        }
                    }
                    // Skip-and-log: one undecryptable message must not
                    // stall the batch.
                    Err(e) => {
                        warn!("Failed to decrypt a to-device message: {e}");
                    }
                }
            }
            _ => {
                if let Some(event) = Event::from_sync_json(raw) {
                    if event.event_type.is_verification() {
                        self.handle_verification_event(&event).await;
                    } else {
                        trace!(kind, "Ignoring an unhandled to-device event");
                    }
                }
            }
        }
    }

    async fn handle_joined_room(&self, room_id: &RoomId, payload: &JoinedRoom) -> Result<()> {
        let room_arc = self.get_or_create_room(room_id).await;
        let (user_id, device_id) = {
            let machine = self.inner.machine.lock().await;
            let Some(machine) = machine.as_ref() else {
                return Err(Error::NotLoggedIn);
            };
            (machine.user_id().to_owned(), machine.device_id().to_owned())
        };

        let mut timeline_events = Vec::new();
        let mut dirty = false;

        {
            let mut room = room_arc.write().await;

            for raw in &payload.state.events {
                if let Some(event) = self.parse_room_event(room_id, raw).await {
                    dirty |= self.apply_room_event(&mut room, room_id, &event).await?;
                }
            }

            for raw in &payload.timeline.events {
                if let Some(event) = self.parse_room_event(room_id, raw).await {
                    dirty |= self.apply_room_event(&mut room, room_id, &event).await?;
                    timeline_events.push(event);
                }
            }

            if payload.timeline.limited {
                if let Some(prev_batch) = &payload.timeline.prev_batch {
                    room.prev_batch = Some(prev_batch.clone());
                }
            } else if room.prev_batch.is_none() {
                room.prev_batch = payload.timeline.prev_batch.clone();
            }
        }

        if !timeline_events.is_empty() {
            self.inner
                .store
                .add_room_events(
                    &user_id,
                    &device_id,
                    room_id.to_owned(),
                    timeline_events.clone(),
                    false,
                )
                .await?;
        }

        if dirty || !timeline_events.is_empty() {
            self.persist_room(room_id).await?;
        }

        for event in timeline_events {
            self.emit(ClientEvent::RoomEvent {
                room_id: room_id.to_owned(),
                event: Arc::new(event),
            });
        }
        self.emit(ClientEvent::RoomUpdated { room_id: room_id.to_owned() });

        Ok(())
    }

    /// Parse a raw room event, transparently decrypting `m.room.encrypted`
    /// payloads. An event that fails to decrypt is kept in its encrypted
    /// form so the timeline stays complete.
    async fn parse_room_event(&self, room_id: &RoomId, raw: &Value) -> Option<Event> {
        if raw.get("type").and_then(Value::as_str) == Some("m.room.encrypted") {
            let decrypted = {
                let mut machine = self.inner.machine.lock().await;
                let machine = machine.as_mut()?;
                machine.handle_room_encrypted(room_id, raw).await
            };

            match decrypted {
                Ok(event) => return Some(event),
                Err(e) => {
                    warn!(room_id = room_id.as_str(), "Failed to decrypt a room event: {e}");
                    return Event::from_sync_json(raw);
                }
            }
        }

        Event::from_sync_json(raw)
    }

    /// Mirror one event into the room and the durable state. Returns
    /// whether the room's persisted metadata changed.
    async fn apply_room_event(
        &self,
        room: &mut crate::room::Room,
        room_id: &RoomId,
        event: &Event,
    ) -> Result<bool> {
        let change = room.apply_event(event);

        match &event.event_type {
            EventType::RoomMember => {
                if let Some(member_id) = event
                    .state_key
                    .as_deref()
                    .and_then(|s| ruma::OwnedUserId::try_from(s).ok())
                {
                    // Keep the directory's profile in step with the roster.
                    if let Ok(directory) = self.directory().await {
                        directory
                            .set_profile(
                                &member_id,
                                event
                                    .content
                                    .get("displayname")
                                    .and_then(Value::as_str)
                                    .map(ToOwned::to_owned),
                                event
                                    .content
                                    .get("avatar_url")
                                    .and_then(Value::as_str)
                                    .map(ToOwned::to_owned),
                            )
                            .await;
                    }

                    if change.membership {
                        let membership =
                            match event.content.get("membership").and_then(Value::as_str) {
                                Some("join") => Membership::Joined,
                                Some("invite") => Membership::Invited,
                                _ => Membership::Left,
                            };

                        let (user_id, device_id) = {
                            let machine = self.inner.machine.lock().await;
                            let Some(machine) = machine.as_ref() else {
                                return Ok(true);
                            };
                            (machine.user_id().to_owned(), machine.device_id().to_owned())
                        };

                        self.inner
                            .store
                            .set_room_member(
                                &user_id,
                                &device_id,
                                room_id.to_owned(),
                                member_id,
                                membership.db_code(),
                                Some(serde_json::json!({
                                    "display_name": event
                                        .content
                                        .get("displayname")
                                        .and_then(Value::as_str),
                                    "avatar_url": event
                                        .content
                                        .get("avatar_url")
                                        .and_then(Value::as_str),
                                })),
                            )
                            .await?;

                        // Membership changes invalidate the room key; the
                        // next encrypted send redistributes a fresh one.
                        if room.is_encrypted() {
                            let mut machine = self.inner.machine.lock().await;
                            if let Some(machine) = machine.as_mut() {
                                if let Err(e) = machine.rm_room_group_key(room_id).await {
                                    warn!("Failed to invalidate the room key: {e}");
                                }
                            }
                        }
                    }
                }
            }
            EventType::RoomEncryption => {
                let mut machine = self.inner.machine.lock().await;
                if let Some(machine) = machine.as_mut() {
                    machine.set_room_rotation(room_id.to_owned(), room.rotation);
                }
                debug!(room_id = room_id.as_str(), "The room turned on encryption");
            }
            _ => {}
        }

        Ok(change.metadata || change.membership)
    }

    pub(super) async fn persist_room(&self, room_id: &RoomId) -> Result<()> {
        let Some(room) = self.room(room_id).await else {
            return Ok(());
        };
        let snapshot = room.read().await.snapshot();

        let (user_id, device_id) = {
            let machine = self.inner.machine.lock().await;
            let Some(machine) = machine.as_ref() else {
                return Ok(());
            };
            (machine.user_id().to_owned(), machine.device_id().to_owned())
        };

        self.inner.store.save_room(&user_id, &device_id, snapshot).await?;
        Ok(())
    }

    /// The ids of the rooms this client currently knows.
    pub async fn room_ids(&self) -> Vec<OwnedRoomId> {
        self.inner.rooms.read().await.keys().cloned().collect()
    }
}
