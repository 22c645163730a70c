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

//! Room operations: the outbound send pipeline, pagination, and the small
//! per-room requests.
//!
//! Sends are strictly ordered per room: a fair async mutex dispatches one
//! message at a time, and the next send never starts before the current
//! one finished its final PUT.

use std::{sync::Arc, time::Duration};

use ruma::{OwnedEventId, OwnedUserId, RoomId, TransactionId};
use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use super::Client;
use crate::{
    api::{
        JoinedMembersResponse, MessagesResponse, ReadMarkersRequest, SendResponse, TypingRequest,
        UploadResponse,
    },
    crypto::attachments,
    error::{Error, Result},
    events::{DeliveryState, Event, EventType},
    users::ClaimedDevice,
};

/// Transient failures of one send are retried this many times, with the
/// delay doubling in between.
const SEND_RETRIES: u32 = 3;
const SEND_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Window size used for history paging, store and network alike.
const PAGE_LIMIT: usize = 30;

/// Cancellation handle for one send.
///
/// Create a handle, pass it to a send, and call [`SendHandle::cancel`]
/// from anywhere to abort that send; it fails terminally with
/// [`Error::SendCancelled`] while everything else in flight is untouched.
/// A send that already completed is unaffected.
#[derive(Clone, Debug)]
pub struct SendHandle {
    cancelled: Arc<watch::Sender<bool>>,
}

impl Default for SendHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SendHandle {
    pub fn new() -> Self {
        let (cancelled, _) = watch::channel(false);
        Self { cancelled: Arc::new(cancelled) }
    }

    /// Abort the send this handle was passed to.
    pub fn cancel(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::SendCancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve once [`Self::cancel`] was called.
    async fn wait(&self) {
        let mut rx = self.cancelled.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // The sender lives inside this handle; with it gone nobody
                // can cancel any more.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Client {
    /// Send a text message, transparently encrypting it when the room
    /// calls for it. Resolves with the event id of the final PUT.
    ///
    /// A [`SendHandle`] created beforehand can abort this send only.
    pub async fn send_text(
        &self,
        room_id: &RoomId,
        body: &str,
        handle: Option<&SendHandle>,
    ) -> Result<OwnedEventId> {
        self.send_message_event(room_id, Event::text_message(body), handle).await
    }

    /// Encrypt and upload a file, then send the message event pointing at
    /// it. For unencrypted rooms the bytes are uploaded as they are.
    pub async fn send_file(
        &self,
        room_id: &RoomId,
        filename: &str,
        content_type: &str,
        mut data: Vec<u8>,
        handle: Option<&SendHandle>,
    ) -> Result<OwnedEventId> {
        if let Some(handle) = handle {
            handle.check()?;
        }

        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;
        let encrypted = room.read().await.is_encrypted();

        let content = if encrypted {
            let mut file_key = attachments::encrypt_attachment(&mut data);
            let response: UploadResponse = self
                .inner
                .http
                .upload_media("application/octet-stream", Some(filename), data)
                .await?;

            file_key.mxc_uri = Some(response.content_uri.to_string());
            {
                let mut machine = self.inner.machine.lock().await;
                if let Some(machine) = machine.as_mut() {
                    machine.save_file_enc(file_key.clone()).await?;
                }
            }

            serde_json::json!({
                "msgtype": "m.file",
                "body": filename,
                "file": file_key.to_content(),
                "info": { "mimetype": content_type },
            })
        } else {
            let response: UploadResponse =
                self.inner.http.upload_media(content_type, Some(filename), data).await?;
            serde_json::json!({
                "msgtype": "m.file",
                "body": filename,
                "url": response.content_uri.to_string(),
                "info": { "mimetype": content_type },
            })
        };

        self.send_message_event(room_id, Event::outgoing(EventType::RoomMessage, content), handle)
            .await
    }

    /// Download a media attachment, decrypting it when key material for
    /// its MXC URI is on file.
    pub async fn get_file(&self, mxc_uri: &str) -> Result<Vec<u8>> {
        let uri = mxc_uri.strip_prefix("mxc://").unwrap_or(mxc_uri);
        let (server, media_id) = uri
            .split_once('/')
            .ok_or(Error::Crypto(crate::error::CryptoError::MalformedEvent("bad MXC URI")))?;

        let mut data = self.inner.http.download_media(server, media_id).await?;

        let file_key = {
            let mut machine = self.inner.machine.lock().await;
            match machine.as_mut() {
                Some(machine) => machine.find_file_enc(mxc_uri).await?,
                None => None,
            }
        };

        if let Some(file_key) = file_key {
            attachments::decrypt_attachment(&mut data, &file_key)?;
        }

        Ok(data)
    }

    async fn send_message_event(
        &self,
        room_id: &RoomId,
        event: Event,
        handle: Option<&SendHandle>,
    ) -> Result<OwnedEventId> {
        let fallback = SendHandle::new();
        let handle = handle.unwrap_or(&fallback);
        handle.check()?;

        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;

        // Local echo first; the sync response swaps it for the server copy.
        room.write().await.push_pending(event.clone());

        // Cancellation also has to reach a send still queued behind
        // another message.
        let lock = self.send_lock(room_id).await;
        let guard = tokio::select! {
            guard = lock.lock() => Some(guard),
            () = handle.wait() => None,
        };

        let result = match guard {
            None => Err(Error::SendCancelled),
            Some(_guard) => {
                let mut attempt = 0;
                loop {
                    if let Err(e) = handle.check() {
                        break Err(e);
                    }

                    match self.run_send_pipeline(room_id, &event, handle).await {
                        Ok(event_id) => break Ok(event_id),
                        Err(e) if e.is_recoverable() && attempt < SEND_RETRIES => {
                            attempt += 1;
                            let delay = SEND_RETRY_DELAY * 2u32.pow(attempt - 1);
                            warn!(
                                room_id = room_id.as_str(),
                                attempt, "A send failed on a transient error, retrying: {e}"
                            );
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = handle.wait() => break Err(Error::SendCancelled),
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        {
            let mut room = room.write().await;
            if let Some(pending) = room
                .events
                .iter_mut()
                .find(|e| e.transaction_id == event.transaction_id && e.event_id.is_none())
            {
                match &result {
                    Ok(event_id) => {
                        pending.event_id = Some(event_id.clone());
                        pending.state = DeliveryState::Sent;
                    }
                    Err(_) => pending.state = DeliveryState::Failed,
                }
            }
        }
        self.emit(super::ClientEvent::RoomUpdated { room_id: room_id.to_owned() });

        result
    }

    /// The per-message pipeline. Steps (members, devices, one-time keys,
    /// group keys, the final PUT) run in order; any failure aborts this
    /// message only. Cancellation is checked between the steps and races
    /// the final PUT.
    async fn run_send_pipeline(
        &self,
        room_id: &RoomId,
        event: &Event,
        handle: &SendHandle,
    ) -> Result<OwnedEventId> {
        self.ensure_members_loaded(room_id).await?;
        handle.check()?;

        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;
        let encrypted = room.read().await.is_encrypted();

        let txn = event
            .transaction_id
            .clone()
            .unwrap_or_else(|| TransactionId::new().to_string());

        let (event_type, content) = if encrypted {
            self.ensure_room_group_key(room_id).await?;
            handle.check()?;

            let mut machine = self.inner.machine.lock().await;
            let machine = machine.as_mut().ok_or(Error::NotLoggedIn)?;
            let content = machine
                .encrypt_for_room(room_id, event.event_type.as_str(), &event.content)
                .await?;
            ("m.room.encrypted".to_owned(), content)
        } else {
            (event.event_type.as_str().to_owned(), event.content.clone())
        };

        let path = format!("/_matrix/client/r0/rooms/{room_id}/send/{event_type}/{txn}");
        let put = self.inner.http.put::<_, SendResponse>(&path, &content);
        let response = tokio::select! {
            response = put => response?,
            () = handle.wait() => return Err(Error::SendCancelled),
        };

        debug!(
            room_id = room_id.as_str(),
            event_id = response.event_id.as_str(),
            "Message sent"
        );

        Ok(response.event_id)
    }

    /// Make sure the member roster is populated, fetching
    /// `/joined_members` on first use.
    async fn ensure_members_loaded(&self, room_id: &RoomId) -> Result<()> {
        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;

        if room.read().await.member_count() > 0 {
            return Ok(());
        }

        let response: JoinedMembersResponse = self
            .inner
            .http
            .get(&format!("/_matrix/client/r0/rooms/{room_id}/joined_members"), &[], true)
            .await
            .map_err(Error::from)?;

        let (user_id, device_id) = {
            let machine = self.inner.machine.lock().await;
            let machine = machine.as_ref().ok_or(Error::NotLoggedIn)?;
            (machine.user_id().to_owned(), machine.device_id().to_owned())
        };

        let mut room_guard = room.write().await;
        for (member, info) in &response.joined {
            room_guard.set_membership_from_store(
                member.clone(),
                crate::room::Membership::Joined.db_code(),
                Some(serde_json::json!({
                    "display_name": &info.display_name,
                    "avatar_url": &info.avatar_url,
                })),
            );

            self.inner
                .store
                .set_room_member(
                    &user_id,
                    &device_id,
                    room_id.to_owned(),
                    member.clone(),
                    crate::room::Membership::Joined.db_code(),
                    Some(serde_json::json!({
                        "display_name": &info.display_name,
                        "avatar_url": &info.avatar_url,
                    })),
                )
                .await?;
        }

        Ok(())
    }

    /// Steps (b)–(d): device lists fresh, one-time keys claimed, group
    /// session distributed and activated.
    async fn ensure_room_group_key(&self, room_id: &RoomId) -> Result<()> {
        {
            let mut machine = self.inner.machine.lock().await;
            let machine = machine.as_mut().ok_or(Error::NotLoggedIn)?;
            if machine.has_room_group_key(room_id).await? {
                return Ok(());
            }
        }

        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;
        let members: Vec<OwnedUserId> = {
            let room = room.read().await;
            room.joined_members().chain(room.invited_members()).cloned().collect()
        };

        let directory = self.directory().await?;
        directory.hydrate(&members).await?;

        // (b) refresh every stale or unknown device list.
        let changes = directory.load_devices(&self.inner.http, &members).await?;
        for change in changes {
            if let Some(user_id) = change.user_id {
                self.emit(super::ClientEvent::UserDevicesChanged {
                    user_id,
                    added: change.added,
                    removed: change.removed,
                });
            }
        }

        // (c) claim one-time keys for every usable device.
        let mut wanted = Vec::new();
        for member in &members {
            for device in directory.devices_of(member).await {
                if device.verification == crate::users::DeviceVerification::Blacklisted {
                    continue;
                }
                if device.curve25519.is_none() || device.ed25519.is_none() {
                    continue;
                }
                wanted.push((member.clone(), device.device_id.clone()));
            }
        }

        let claimed: Vec<ClaimedDevice> = match directory
            .claim_keys(&self.inner.http, &wanted)
            .await
        {
            Ok(claimed) => claimed,
            Err(Error::UserDeviceChanged) => {
                // A device list changed underneath us; refresh once and
                // try again.
                directory.load_devices(&self.inner.http, &members).await?;
                directory.claim_keys(&self.inner.http, &wanted).await?
            }
            Err(e) => return Err(e),
        };

        // (d) build and ship the room key, then activate it.
        let (session_id, messages) = {
            let mut machine = self.inner.machine.lock().await;
            let machine = machine.as_mut().ok_or(Error::NotLoggedIn)?;
            machine.create_room_group_keys(room_id, &claimed).await?
        };

        if !messages.is_empty() {
            let txn = TransactionId::new();
            let _: serde_json::Value = self
                .inner
                .http
                .put(
                    &format!("/_matrix/client/r0/sendToDevice/m.room.encrypted/{txn}"),
                    &crate::api::keys::SendToDeviceRequest { messages },
                )
                .await?;
        }

        // Only after the keys reached the server does the session become
        // the room's active one.
        let mut machine = self.inner.machine.lock().await;
        let machine = machine.as_mut().ok_or(Error::NotLoggedIn)?;
        machine.set_room_group_key(room_id, &session_id);

        debug!(room_id = room_id.as_str(), session_id = session_id.as_str(), "Distributed a fresh room key");
        Ok(())
    }

    /// Load older events, store first, `/messages` second.
    ///
    /// Returns the loaded chunk, newest first. An empty result with no
    /// cursor left means the start of history was reached.
    pub async fn load_past_events(&self, room_id: &RoomId) -> Result<Vec<Event>> {
        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;

        let (user_id, device_id) = {
            let machine = self.inner.machine.lock().await;
            let machine = machine.as_ref().ok_or(Error::NotLoggedIn)?;
            (machine.user_id().to_owned(), machine.device_id().to_owned())
        };

        let oldest_uid = {
            let room = room.read().await;
            room.events.first().and_then(|e| e.uid().map(ToOwned::to_owned))
        };

        let stored = self
            .inner
            .store
            .get_past_events(&user_id, &device_id, room_id.to_owned(), oldest_uid, PAGE_LIMIT)
            .await?;

        if !stored.is_empty() {
            let mut room = room.write().await;
            for event in &stored {
                room.events.insert(0, event.clone());
            }
            return Ok(stored);
        }

        let Some(prev_batch) = room.read().await.prev_batch.clone() else {
            return Ok(Vec::new());
        };

        let response: MessagesResponse = self
            .inner
            .http
            .get(
                &format!("/_matrix/client/r0/rooms/{room_id}/messages"),
                &[
                    ("from", prev_batch.as_str()),
                    ("dir", "b"),
                    ("limit", "30"),
                ],
                true,
            )
            .await
            .map_err(Error::from)?;

        let mut chunk = Vec::new();
        for raw in &response.chunk {
            if let Some(event) = self.parse_past_event(room_id, raw).await {
                chunk.push(event);
            }
        }

        if !chunk.is_empty() {
            self.inner
                .store
                .add_room_events(&user_id, &device_id, room_id.to_owned(), chunk.clone(), true)
                .await?;
        }

        {
            let mut room = room.write().await;
            // Identical start and end tokens mark the beginning of
            // history; drop the cursor so we stop asking.
            if response.start.is_some() && response.start == response.end {
                room.prev_batch = None;
            } else {
                room.prev_batch = response.end.clone();
            }

            for event in &chunk {
                room.events.insert(0, event.clone());
            }
        }
        self.persist_room(room_id).await?;

        Ok(chunk)
    }

    async fn parse_past_event(&self, room_id: &RoomId, raw: &Value) -> Option<Event> {
        if raw.get("type").and_then(Value::as_str) == Some("m.room.encrypted") {
            let decrypted = {
                let mut machine = self.inner.machine.lock().await;
                let machine = machine.as_mut()?;
                machine.handle_room_encrypted(room_id, raw).await
            };
            match decrypted {
                Ok(event) => return Some(event),
                Err(e) => {
                    warn!(room_id = room_id.as_str(), "An old event failed to decrypt: {e}");
                    return Event::from_sync_json(raw);
                }
            }
        }

        Event::from_sync_json(raw)
    }

    /// Signal that the user started or stopped typing.
    pub async fn set_typing(&self, room_id: &RoomId, typing: bool) -> Result<()> {
        let user_id = self.user_id().await.ok_or(Error::NotLoggedIn)?;
        let request = TypingRequest { typing, timeout: typing.then_some(4_000) };

        let _: serde_json::Value = self
            .inner
            .http
            .put(&format!("/_matrix/client/r0/rooms/{room_id}/typing/{user_id}"), &request)
            .await?;
        Ok(())
    }

    /// Move the fully-read marker and the public read receipt.
    pub async fn send_read_markers(
        &self,
        room_id: &RoomId,
        fully_read: Option<OwnedEventId>,
        read: Option<OwnedEventId>,
    ) -> Result<()> {
        let request = ReadMarkersRequest { fully_read, read };
        let _: serde_json::Value = self
            .inner
            .http
            .post(&format!("/_matrix/client/r0/rooms/{room_id}/read_markers"), &request)
            .await?;
        Ok(())
    }

    /// Leave the room. The room object stays around, marked left.
    pub async fn leave_room(&self, room_id: &RoomId) -> Result<()> {
        let _: serde_json::Value = self
            .inner
            .http
            .post(&format!("/_matrix/client/r0/rooms/{room_id}/leave"), &serde_json::json!({}))
            .await?;

        if let Some(room) = self.room(room_id).await {
            room.write().await.left = true;
            self.persist_room(room_id).await?;
        }
        Ok(())
    }

    /// Fetch the full current state of a room and apply it locally.
    pub async fn load_room_state(&self, room_id: &RoomId) -> Result<Vec<Event>> {
        let raw: Vec<Value> = self
            .inner
            .http
            .get(&format!("/_matrix/client/r0/rooms/{room_id}/state"), &[], true)
            .await
            .map_err(Error::from)?;

        let room = self
            .room(room_id)
            .await
            .ok_or_else(|| Error::UnknownRoom(room_id.to_owned()))?;

        let mut events = Vec::new();
        {
            let mut room = room.write().await;
            for value in &raw {
                if let Some(event) = Event::from_sync_json(value) {
                    room.apply_event(&event);
                    events.push(event);
                }
            }
        }
        self.persist_room(room_id).await?;

        Ok(events)
    }

    /// PUT a state event. State events are never encrypted.
    pub async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
        handle: Option<&SendHandle>,
    ) -> Result<OwnedEventId> {
        let path = format!("/_matrix/client/r0/rooms/{room_id}/state/{event_type}");
        let put = self.inner.http.put::<_, SendResponse>(&path, &content);

        let response = match handle {
            Some(handle) => {
                handle.check()?;
                tokio::select! {
                    response = put => response?,
                    () = handle.wait() => return Err(Error::SendCancelled),
                }
            }
            None => put.await?,
        };

        Ok(response.event_id)
    }

    async fn send_lock(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        self.inner
            .send_locks
            .lock()
            .await
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
