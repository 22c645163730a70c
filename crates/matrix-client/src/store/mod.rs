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

//! The SQLite backed store.
//!
//! All statements run on one dedicated worker thread consuming a FIFO task
//! queue, so every observer sees a total order of writes and the connection
//! is never shared. The async methods push a task and await its completion
//! through a oneshot channel.

mod migrations;

use std::{
    path::{Path, PathBuf},
    sync::mpsc,
};

use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, UserId};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::warn;
use zeroize::Zeroizing;

use crate::{
    crypto::{
        olm::{olm_message_from_parts, OlmSession, SessionKind, SessionState},
        FileKey, SessionRecord,
    },
    error::StoreError,
    events::{DeliveryState, Event, EventType},
    users::{Device, DeviceVerification},
    utilities::now_millis,
};

/// One row of the `accounts` table, plus the values that ride in its JSON
/// payload column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredAccount {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    /// The encrypted Olm account pickle. `None` keeps whatever the row
    /// already holds.
    pub pickle: Option<String>,
    pub next_batch: Option<String>,
    pub filter_id: Option<String>,
    pub homeserver: Option<String>,
    pub enabled: bool,
}

/// Persisted per-room state: the cursor and the JSON room metadata blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: OwnedRoomId,
    pub prev_batch: Option<String>,
    pub data: Value,
    /// The room this one was tombstoned into, if any.
    pub replacement: Option<OwnedRoomId>,
}

/// Membership column codes of `room_members.user_state`.
pub(crate) const MEMBER_JOINED: i64 = 0;
pub(crate) const MEMBER_INVITED: i64 = 1;
pub(crate) const MEMBER_LEFT: i64 = 2;

enum Task {
    Run(Box<dyn FnOnce(&mut StoreInner) + Send>),
    Close(oneshot::Sender<()>),
}

/// Handle to the store worker. Cheap to clone; all clones share the same
/// worker thread and task queue.
#[derive(Clone)]
pub struct Store {
    sender: mpsc::Sender<Task>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

struct StoreInner {
    conn: Connection,
}

impl Store {
    /// Create the directory tree, open or create the database and run
    /// pending migrations. Fails atomically: on error nothing is left
    /// half-open.
    pub async fn open(dir: impl AsRef<Path>, filename: &str) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_owned();
        let path = dir.join(filename);

        let (result_tx, result_rx) = oneshot::channel();
        let (task_tx, task_rx) = mpsc::channel::<Task>();

        std::thread::Builder::new().name("matrix-client-store".to_owned()).spawn(move || {
            let mut inner = match open_inner(&dir, &path) {
                Ok(inner) => {
                    let _ = result_tx.send(Ok(()));
                    inner
                }
                Err(e) => {
                    let _ = result_tx.send(Err(e));
                    return;
                }
            };

            // The worker only exits once the close task is processed, so
            // no accepted write is ever dropped.
            while let Ok(task) = task_rx.recv() {
                match task {
                    Task::Run(f) => f(&mut inner),
                    Task::Close(ack) => {
                        let _ = ack.send(());
                        break;
                    }
                }
            }
        })?;

        result_rx.await.map_err(|_| StoreError::Closed)??;
        Ok(Store { sender: task_tx })
    }

    /// Drain the queue and stop the worker thread.
    pub async fn close(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(Task::Close(tx)).map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)
    }

    async fn interact<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut StoreInner) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Task::Run(Box::new(move |inner| {
                let _ = tx.send(f(inner));
            })))
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    pub async fn save_account(&self, account: &StoredAccount) -> Result<(), StoreError> {
        let account = account.clone();
        self.interact(move |inner| inner.save_account(&account)).await
    }

    pub async fn load_account(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<StoredAccount>, StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| inner.load_account(&user_id, &device_id)).await
    }

    /// Remove the account and everything hanging off it: rooms, events,
    /// members, sessions and attachment keys.
    pub async fn delete_account(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| inner.delete_account(&user_id, &device_id)).await
    }

    pub async fn save_room(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        snapshot: RoomSnapshot,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| inner.save_room(&user_id, &device_id, snapshot)).await
    }

    pub async fn load_rooms(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<RoomSnapshot>, StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| inner.load_rooms(&user_id, &device_id)).await
    }

    /// Insert events, assigning a contiguous `sorted_id` block ascending
    /// (append) or descending (prepend) from the current extremum. Events
    /// already present on `(room, event_uid)` are skipped.
    pub async fn add_room_events(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: OwnedRoomId,
        events: Vec<Event>,
        prepend: bool,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| {
            inner.add_room_events(&user_id, &device_id, &room_id, &events, prepend)
        })
        .await
    }

    /// Load up to `limit` room message events older than `from` (or the
    /// newest ones when `from` is `None`), newest first. The `from` event
    /// itself is excluded.
    pub async fn get_past_events(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: OwnedRoomId,
        from: Option<String>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| {
            inner.get_past_events(&user_id, &device_id, &room_id, from.as_deref(), limit)
        })
        .await
    }

    pub async fn set_room_member(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: OwnedRoomId,
        member: OwnedUserId,
        membership: i64,
        member_json: Option<Value>,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| {
            inner.set_room_member(&user_id, &device_id, &room_id, &member, membership, member_json)
        })
        .await
    }

    pub async fn load_room_members(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: OwnedRoomId,
    ) -> Result<Vec<(OwnedUserId, i64, Option<Value>)>, StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| inner.load_room_members(&user_id, &device_id, &room_id)).await
    }

    /// Insert or update a pickled session, keyed on
    /// `(account, sender_key, session_id)`.
    pub async fn save_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        record: SessionRecord,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| inner.save_session(&user_id, &device_id, &record)).await
    }

    /// Exact session lookup, used for Megolm decryption.
    pub async fn lookup_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: String,
        session_id: String,
        kind: SessionKind,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| {
            inner.lookup_session(&user_id, &device_id, &sender_key, &session_id, kind)
        })
        .await
    }

    /// Scan every pickled Olm session for the peer key and try to decrypt
    /// the message with each. Returns the first session that succeeds,
    /// with its advanced pickle already written back, and the plaintext.
    pub async fn lookup_olm_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: String,
        message_type: u64,
        ciphertext: String,
        pickle_key: [u8; 32],
    ) -> Result<Option<(SessionRecord, Vec<u8>)>, StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| {
            let pickle_key = Zeroizing::new(pickle_key);
            inner.lookup_olm_session(
                &user_id,
                &device_id,
                &sender_key,
                message_type,
                &ciphertext,
                &pickle_key,
            )
        })
        .await
    }

    pub async fn save_file_enc(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        key: FileKey,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| inner.save_file_enc(&user_id, &device_id, &key)).await
    }

    pub async fn find_file_enc(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        uri: String,
    ) -> Result<Option<FileKey>, StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| inner.find_file_enc(&user_id, &device_id, &uri)).await
    }

    /// Apply a device list diff for one tracked user.
    pub async fn save_user_devices(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        target: OwnedUserId,
        devices: Vec<Device>,
        removed: Vec<OwnedDeviceId>,
        outdated: bool,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| {
            inner.save_user_devices(&user_id, &device_id, &target, &devices, &removed, outdated)
        })
        .await
    }

    pub async fn load_user_devices(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        target: OwnedUserId,
    ) -> Result<(bool, Vec<Device>), StoreError> {
        let user_id = user_id.to_owned();
        let device_id = device_id.to_owned();
        self.interact(move |inner| inner.load_user_devices(&user_id, &device_id, &target)).await
    }

    pub async fn set_device_verification(
        &self,
        target: OwnedUserId,
        target_device: OwnedDeviceId,
        verification: DeviceVerification,
    ) -> Result<(), StoreError> {
        self.interact(move |inner| {
            inner.set_device_verification(&target, &target_device, verification)
        })
        .await
    }
}

fn open_inner(dir: &Path, path: &PathBuf) -> Result<StoreInner, StoreError> {
    std::fs::create_dir_all(dir)?;
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    migrations::run(&conn, path)?;
    Ok(StoreInner { conn })
}

impl StoreInner {
    fn account_id(&self, user_id: &UserId, device_id: &DeviceId) -> Result<i64, StoreError> {
        self.conn
            .query_row(
                "SELECT accounts.id FROM accounts
                 JOIN user_devices ON accounts.user_device_id = user_devices.id
                 JOIN users ON user_devices.user_id = users.id
                 WHERE users.username = ?1 AND user_devices.device = ?2",
                params![user_id.as_str(), device_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::UnknownAccount(format!("{user_id} {device_id}")))
    }

    fn ensure_user(
        conn: &Connection,
        username: &str,
        account_id: Option<i64>,
    ) -> Result<i64, StoreError> {
        conn.execute(
            "INSERT INTO users(username, account_id) VALUES (?1, ?2)
             ON CONFLICT(username) DO UPDATE
             SET account_id = COALESCE(users.account_id, excluded.account_id)",
            params![username, account_id],
        )?;
        Ok(conn.query_row("SELECT id FROM users WHERE username = ?1", params![username], |row| {
            row.get(0)
        })?)
    }

    fn ensure_room(
        conn: &Connection,
        account_id: i64,
        room_name: &str,
    ) -> Result<i64, StoreError> {
        conn.execute(
            "INSERT OR IGNORE INTO rooms(account_id, room_name) VALUES (?1, ?2)",
            params![account_id, room_name],
        )?;
        Ok(conn.query_row(
            "SELECT id FROM rooms WHERE account_id = ?1 AND room_name = ?2",
            params![account_id, room_name],
            |row| row.get(0),
        )?)
    }

    fn ensure_member(conn: &Connection, room_row: i64, user_row: i64) -> Result<i64, StoreError> {
        conn.execute(
            "INSERT OR IGNORE INTO room_members(room_id, user_id) VALUES (?1, ?2)",
            params![room_row, user_row],
        )?;
        Ok(conn.query_row(
            "SELECT id FROM room_members WHERE room_id = ?1 AND user_id = ?2",
            params![room_row, user_row],
            |row| row.get(0),
        )?)
    }

    fn save_account(&mut self, account: &StoredAccount) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;

        let user_row = Self::ensure_user(&tx, account.user_id.as_str(), None)?;
        tx.execute(
            "INSERT OR IGNORE INTO user_devices(user_id, device) VALUES (?1, ?2)",
            params![user_row, account.device_id.as_str()],
        )?;
        let device_row: i64 = tx.query_row(
            "SELECT id FROM user_devices WHERE user_id = ?1 AND device = ?2",
            params![user_row, account.device_id.as_str()],
            |row| row.get(0),
        )?;

        let json_data = json!({
            "filter_id": &account.filter_id,
            "homeserver": &account.homeserver,
        });

        tx.execute(
            "INSERT INTO accounts(user_device_id, next_batch, pickle, enabled, json_data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_device_id) DO UPDATE SET
               next_batch = excluded.next_batch,
               pickle = COALESCE(excluded.pickle, accounts.pickle),
               enabled = excluded.enabled,
               json_data = excluded.json_data",
            params![
                device_row,
                account.next_batch,
                account.pickle,
                account.enabled,
                json_data.to_string(),
            ],
        )?;

        tx.execute(
            "UPDATE users
             SET account_id = (SELECT accounts.id FROM accounts WHERE user_device_id = ?1)
             WHERE id = ?2 AND account_id IS NULL",
            params![device_row, user_row],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load_account(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<StoredAccount>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT accounts.next_batch, accounts.pickle, accounts.enabled, accounts.json_data
                 FROM accounts
                 JOIN user_devices ON accounts.user_device_id = user_devices.id
                 JOIN users ON user_devices.user_id = users.id
                 WHERE users.username = ?1 AND user_devices.device = ?2",
                params![user_id.as_str(), device_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((next_batch, pickle, enabled, json_data)) = row else {
            return Ok(None);
        };

        let data: Value =
            json_data.as_deref().map(serde_json::from_str).transpose()?.unwrap_or(Value::Null);

        Ok(Some(StoredAccount {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            pickle,
            next_batch,
            filter_id: data.get("filter_id").and_then(Value::as_str).map(ToOwned::to_owned),
            homeserver: data.get("homeserver").and_then(Value::as_str).map(ToOwned::to_owned),
            enabled,
        }))
    }

    fn delete_account(&mut self, user_id: &UserId, device_id: &DeviceId) -> Result<(), StoreError> {
        let account_id = match self.account_id(user_id, device_id) {
            Ok(id) => id,
            Err(StoreError::UnknownAccount(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM session WHERE account_id = ?1", params![account_id])?;
        tx.execute("DELETE FROM encryption_keys WHERE account_id = ?1", params![account_id])?;
        // Events reference members, so they have to go first.
        tx.execute(
            "DELETE FROM room_events
             WHERE room_id IN (SELECT id FROM rooms WHERE account_id = ?1)",
            params![account_id],
        )?;
        tx.execute(
            "DELETE FROM room_members
             WHERE room_id IN (SELECT id FROM rooms WHERE account_id = ?1)",
            params![account_id],
        )?;
        // Tombstone targets self-reference the table; clear them so the
        // delete order inside the statement can't matter.
        tx.execute(
            "UPDATE rooms SET replacement_room_id = NULL WHERE account_id = ?1",
            params![account_id],
        )?;
        tx.execute("DELETE FROM rooms WHERE account_id = ?1", params![account_id])?;
        tx.execute("UPDATE users SET account_id = NULL WHERE account_id = ?1", params![account_id])?;
        tx.execute("DELETE FROM accounts WHERE id = ?1", params![account_id])?;
        tx.commit()?;
        Ok(())
    }

    fn save_room(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        snapshot: RoomSnapshot,
    ) -> Result<(), StoreError> {
        let account_id = self.account_id(user_id, device_id)?;
        let tx = self.conn.transaction()?;

        let room_row = Self::ensure_room(&tx, account_id, snapshot.room_id.as_str())?;
        let replacement_row = snapshot
            .replacement
            .as_ref()
            .map(|id| Self::ensure_room(&tx, account_id, id.as_str()))
            .transpose()?;

        tx.execute(
            "UPDATE rooms SET prev_batch = ?1, json_data = ?2, replacement_room_id = ?3
             WHERE id = ?4",
            params![snapshot.prev_batch, snapshot.data.to_string(), replacement_row, room_row],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load_rooms(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Vec<RoomSnapshot>, StoreError> {
        let account_id = self.account_id(user_id, device_id)?;

        let mut statement = self.conn.prepare(
            "SELECT rooms.room_name, rooms.prev_batch, rooms.json_data, replacement.room_name
             FROM rooms
             LEFT JOIN rooms AS replacement ON rooms.replacement_room_id = replacement.id
             WHERE rooms.account_id = ?1",
        )?;

        let rows = statement.query_map(params![account_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (name, prev_batch, json_data, replacement) = row?;
            let room_id: OwnedRoomId =
                name.as_str().try_into().map_err(|_| StoreError::CorruptId(name.clone()))?;

            snapshots.push(RoomSnapshot {
                room_id,
                prev_batch,
                data: json_data
                    .as_deref()
                    .map(serde_json::from_str)
                    .transpose()?
                    .unwrap_or(Value::Null),
                replacement: replacement.and_then(|r| r.as_str().try_into().ok()),
            });
        }

        Ok(snapshots)
    }

    fn add_room_events(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &OwnedRoomId,
        events: &[Event],
        prepend: bool,
    ) -> Result<(), StoreError> {
        let account_id = self.account_id(user_id, device_id)?;
        let tx = self.conn.transaction()?;
        let room_row = Self::ensure_room(&tx, account_id, room_id.as_str())?;

        let extremum: Option<i64> = tx.query_row(
            if prepend {
                "SELECT MIN(sorted_id) FROM room_events WHERE room_id = ?1"
            } else {
                "SELECT MAX(sorted_id) FROM room_events WHERE room_id = ?1"
            },
            params![room_row],
            |row| row.get(0),
        )?;

        let step: i64 = if prepend { -1 } else { 1 };
        let mut next = extremum.unwrap_or(0) + step;

        for event in events {
            let Some(uid) = event.uid() else {
                warn!(room_id = room_id.as_str(), "Skipping an event with no usable id");
                continue;
            };

            let sender = event.sender.as_ref().map(|s| s.as_str()).unwrap_or(user_id.as_str());
            let user_row = Self::ensure_user(&tx, sender, None)?;
            let sender_row = Self::ensure_member(&tx, room_row, user_row)?;

            let json_data = json!({
                "type": event.event_type.as_str(),
                "sender": sender,
                "content": &event.content,
                "encrypted": &event.encrypted_source,
                "replaces": &event.replaces,
                "reply_to": &event.reply_to,
            });

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO room_events
                 (sorted_id, room_id, sender_id, event_type, event_uid, txnid,
                  event_state, state_key, origin_server_ts, json_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    next,
                    room_row,
                    sender_row,
                    event.event_type.db_code(),
                    uid,
                    event.transaction_id,
                    event.state.db_code(),
                    event.state_key,
                    event.origin_server_ts.unwrap_or_else(now_millis),
                    json_data.to_string(),
                ],
            )?;

            if inserted > 0 {
                next += step;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn get_past_events(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &OwnedRoomId,
        from: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError> {
        let account_id = self.account_id(user_id, device_id)?;
        let room_row: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM rooms WHERE account_id = ?1 AND room_name = ?2",
                params![account_id, room_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(room_row) = room_row else {
            return Ok(Vec::new());
        };

        let bound = match from {
            Some(uid) => self
                .conn
                .query_row(
                    "SELECT sorted_id FROM room_events WHERE room_id = ?1 AND event_uid = ?2",
                    params![room_row, uid],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?,
            None => None,
        };

        let mut statement = self.conn.prepare(
            "SELECT event_uid, txnid, event_state, state_key, origin_server_ts, json_data
             FROM room_events
             WHERE room_id = ?1 AND event_type = ?2 AND sorted_id < ?3
             ORDER BY sorted_id DESC LIMIT ?4",
        )?;

        let rows = statement.query_map(
            params![
                room_row,
                EventType::RoomMessage.db_code(),
                bound.unwrap_or(i64::MAX),
                limit as i64,
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            },
        )?;

        let mut events = Vec::new();
        for row in rows {
            let (uid, txnid, event_state, state_key, ts, json_data) = row?;
            events.push(row_to_event(uid, txnid, event_state, state_key, ts, json_data)?);
        }

        Ok(events)
    }

    fn set_room_member(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &OwnedRoomId,
        member: &UserId,
        membership: i64,
        member_json: Option<Value>,
    ) -> Result<(), StoreError> {
        let account_id = self.account_id(user_id, device_id)?;
        let tx = self.conn.transaction()?;

        let room_row = Self::ensure_room(&tx, account_id, room_id.as_str())?;
        let user_row = Self::ensure_user(&tx, member.as_str(), None)?;
        let member_row = Self::ensure_member(&tx, room_row, user_row)?;

        tx.execute(
            "UPDATE room_members
             SET user_state = ?1, json_data = COALESCE(?2, json_data)
             WHERE id = ?3",
            params![membership, member_json.map(|j| j.to_string()), member_row],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn load_room_members(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        room_id: &OwnedRoomId,
    ) -> Result<Vec<(OwnedUserId, i64, Option<Value>)>, StoreError> {
        let account_id = self.account_id(user_id, device_id)?;

        let mut statement = self.conn.prepare(
            "SELECT users.username, room_members.user_state, room_members.json_data
             FROM room_members
             JOIN users ON room_members.user_id = users.id
             JOIN rooms ON room_members.room_id = rooms.id
             WHERE rooms.account_id = ?1 AND rooms.room_name = ?2",
        )?;

        let rows = statement.query_map(params![account_id, room_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut members = Vec::new();
        for row in rows {
            let (username, state, json_data) = row?;
            let member: OwnedUserId = username
                .as_str()
                .try_into()
                .map_err(|_| StoreError::CorruptId(username.clone()))?;
            members.push((
                member,
                state,
                json_data.as_deref().map(serde_json::from_str).transpose()?,
            ));
        }

        Ok(members)
    }

    fn save_session(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        record: &SessionRecord,
    ) -> Result<(), StoreError> {
        let account_id = self.account_id(user_id, device_id)?;
        let tx = self.conn.transaction()?;

        let room_row = record
            .room_id
            .as_ref()
            .map(|id| Self::ensure_room(&tx, account_id, id.as_str()))
            .transpose()?;

        let json_data = json!({
            "state": record.state.db_code(),
            "signing_key": &record.signing_key,
        });

        tx.execute(
            "INSERT INTO session
             (account_id, sender_key, session_id, type, pickle, time, room_id, json_data, chain_index)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(account_id, sender_key, session_id) DO UPDATE SET
               pickle = excluded.pickle,
               json_data = excluded.json_data,
               chain_index = excluded.chain_index",
            params![
                account_id,
                record.sender_key,
                record.session_id,
                record.kind.db_code(),
                record.pickle,
                record.created_ms,
                room_row,
                json_data.to_string(),
                record.chain_index,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    fn lookup_session(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: &str,
        session_id: &str,
        kind: SessionKind,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let account_id = self.account_id(user_id, device_id)?;

        let row = self
            .conn
            .query_row(
                "SELECT session.pickle, session.time, session.chain_index, session.json_data,
                        rooms.room_name
                 FROM session
                 LEFT JOIN rooms ON session.room_id = rooms.id
                 WHERE session.account_id = ?1 AND session.sender_key = ?2
                   AND session.session_id = ?3 AND session.type = ?4",
                params![account_id, sender_key, session_id, kind.db_code()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;

        let Some((pickle, time, chain_index, json_data, room_name)) = row else {
            return Ok(None);
        };

        Ok(Some(session_record(
            sender_key, session_id, kind, pickle, time, chain_index, json_data, room_name,
        )?))
    }

    fn lookup_olm_session(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: &str,
        message_type: u64,
        ciphertext: &str,
        pickle_key: &[u8; 32],
    ) -> Result<Option<(SessionRecord, Vec<u8>)>, StoreError> {
        let account_id = self.account_id(user_id, device_id)?;

        let message = match olm_message_from_parts(message_type, ciphertext) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable Olm message handed to the session scan: {e}");
                return Ok(None);
            }
        };

        let mut statement = self.conn.prepare(
            "SELECT session.id, session.session_id, session.type, session.pickle,
                    session.time, session.chain_index, session.json_data
             FROM session
             WHERE session.account_id = ?1 AND session.sender_key = ?2
               AND session.type IN (?3, ?4)",
        )?;

        let rows = statement.query_map(
            params![
                account_id,
                sender_key,
                SessionKind::OlmOut.db_code(),
                SessionKind::OlmIn.db_code(),
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            },
        )?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row?);
        }
        drop(statement);

        for (row_id, session_id, kind, pickle, time, chain_index, json_data) in candidates {
            let Some(kind) = SessionKind::from_db_code(kind) else { continue };
            let record = session_record(
                sender_key,
                &session_id,
                kind,
                pickle,
                time,
                chain_index,
                json_data,
                None,
            )?;

            let mut session = match OlmSession::from_record(&record, pickle_key) {
                Ok(session) => session,
                Err(e) => {
                    warn!(session_id = session_id.as_str(), "Skipping a session that fails to unpickle: {e}");
                    continue;
                }
            };

            if let Ok(plaintext) = session.decrypt(&message) {
                // Persist the advanced ratchet before handing the session
                // back, or the same message keys would be reused.
                let updated = session.to_record(pickle_key);
                self.conn.execute(
                    "UPDATE session SET pickle = ?1 WHERE id = ?2",
                    params![updated.pickle, row_id],
                )?;
                return Ok(Some((updated, plaintext)));
            }
        }

        Ok(None)
    }

    fn save_file_enc(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        key: &FileKey,
    ) -> Result<(), StoreError> {
        let account_id = self.account_id(user_id, device_id)?;
        let Some(uri) = &key.mxc_uri else {
            return Ok(());
        };

        self.conn.execute(
            "INSERT INTO encryption_keys
             (account_id, file_url, file_sha256, iv, version, algorithm, key, type, extractable)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(account_id, file_url) DO UPDATE SET
               file_sha256 = excluded.file_sha256,
               iv = excluded.iv,
               version = excluded.version,
               algorithm = excluded.algorithm,
               key = excluded.key,
               type = excluded.type,
               extractable = excluded.extractable",
            params![
                account_id,
                uri,
                key.sha256,
                key.iv,
                file_version_code(&key.version),
                file_algorithm_code(&key.algorithm),
                key.key,
                file_key_type_code(&key.key_type),
                key.extractable,
            ],
        )?;

        Ok(())
    }

    fn find_file_enc(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        uri: &str,
    ) -> Result<Option<FileKey>, StoreError> {
        let account_id = self.account_id(user_id, device_id)?;

        let row = self
            .conn
            .query_row(
                "SELECT file_sha256, iv, version, algorithm, key, type, extractable
                 FROM encryption_keys WHERE account_id = ?1 AND file_url = ?2",
                params![account_id, uri],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, bool>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((sha256, iv, version, algorithm, key, key_type, extractable)) = row else {
            return Ok(None);
        };

        Ok(Some(FileKey {
            mxc_uri: Some(uri.to_owned()),
            sha256: sha256.unwrap_or_default(),
            iv,
            key,
            algorithm: file_algorithm_name(algorithm),
            version: file_version_name(version),
            key_type: file_key_type_name(key_type),
            extractable,
        }))
    }

    fn save_user_devices(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        target: &UserId,
        devices: &[Device],
        removed: &[OwnedDeviceId],
        outdated: bool,
    ) -> Result<(), StoreError> {
        let account_id = self.account_id(user_id, device_id)?;
        let tx = self.conn.transaction()?;

        let user_row = Self::ensure_user(&tx, target.as_str(), Some(account_id))?;
        tx.execute("UPDATE users SET outdated = ?1 WHERE id = ?2", params![outdated, user_row])?;

        for device in removed {
            tx.execute(
                "DELETE FROM user_devices WHERE user_id = ?1 AND device = ?2",
                params![user_row, device.as_str()],
            )?;
        }

        for device in devices {
            let json_data = json!({
                "algorithms": &device.algorithms,
                "display_name": &device.display_name,
            });
            tx.execute(
                "INSERT INTO user_devices(user_id, device, curve25519_key, ed25519_key, json_data)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id, device) DO UPDATE SET
                   curve25519_key = excluded.curve25519_key,
                   ed25519_key = excluded.ed25519_key,
                   json_data = excluded.json_data",
                params![
                    user_row,
                    device.device_id.as_str(),
                    device.curve25519,
                    device.ed25519,
                    json_data.to_string(),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn load_user_devices(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        target: &UserId,
    ) -> Result<(bool, Vec<Device>), StoreError> {
        // The account join is only a validity check here; device rows hang
        // off the users table directly.
        self.account_id(user_id, device_id)?;

        let outdated: Option<bool> = self
            .conn
            .query_row(
                "SELECT outdated FROM users WHERE username = ?1",
                params![target.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(outdated) = outdated else {
            return Ok((true, Vec::new()));
        };

        let mut statement = self.conn.prepare(
            "SELECT user_devices.device, user_devices.curve25519_key, user_devices.ed25519_key,
                    user_devices.verification, user_devices.json_data
             FROM user_devices
             JOIN users ON user_devices.user_id = users.id
             WHERE users.username = ?1",
        )?;

        let rows = statement.query_map(params![target.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;

        let mut devices = Vec::new();
        for row in rows {
            let (device, curve25519, ed25519, verification, json_data) = row?;
            let data: Value = json_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or(Value::Null);

            devices.push(Device {
                user_id: target.to_owned(),
                device_id: device.into(),
                curve25519,
                ed25519,
                algorithms: data
                    .get("algorithms")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter().filter_map(Value::as_str).map(ToOwned::to_owned).collect()
                    })
                    .unwrap_or_default(),
                display_name: data
                    .get("display_name")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned),
                verification: DeviceVerification::from_db_code(verification),
            });
        }

        Ok((outdated, devices))
    }

    fn set_device_verification(
        &mut self,
        target: &UserId,
        target_device: &DeviceId,
        verification: DeviceVerification,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE user_devices SET verification = ?1
             WHERE device = ?2
               AND user_id = (SELECT id FROM users WHERE username = ?3)",
            params![verification.db_code(), target_device.as_str(), target.as_str()],
        )?;
        Ok(())
    }
}

fn row_to_event(
    uid: String,
    txnid: Option<String>,
    event_state: Option<i64>,
    state_key: Option<String>,
    origin_server_ts: i64,
    json_data: Option<String>,
) -> Result<Event, StoreError> {
    let data: Value =
        json_data.as_deref().map(serde_json::from_str).transpose()?.unwrap_or(Value::Null);

    let event_type = data
        .get("type")
        .and_then(Value::as_str)
        .map(EventType::from_str)
        .unwrap_or(EventType::Custom("m.unknown".to_owned()));

    Ok(Event {
        event_id: uid.starts_with('$').then(|| uid.as_str().try_into().ok()).flatten(),
        event_type,
        sender: data.get("sender").and_then(Value::as_str).and_then(|s| s.try_into().ok()),
        state_key,
        origin_server_ts: Some(origin_server_ts),
        content: data.get("content").cloned().unwrap_or(Value::Null),
        encrypted_source: data.get("encrypted").filter(|v| !v.is_null()).cloned(),
        replaces: data.get("replaces").and_then(Value::as_str).and_then(|s| s.try_into().ok()),
        reply_to: data.get("reply_to").and_then(Value::as_str).and_then(|s| s.try_into().ok()),
        transaction_id: txnid,
        state: DeliveryState::from_db_code(event_state.unwrap_or(0)),
    })
}

#[allow(clippy::too_many_arguments)]
fn session_record(
    sender_key: &str,
    session_id: &str,
    kind: SessionKind,
    pickle: String,
    time: Option<i64>,
    chain_index: Option<i64>,
    json_data: Option<String>,
    room_name: Option<String>,
) -> Result<SessionRecord, StoreError> {
    let data: Value =
        json_data.as_deref().map(serde_json::from_str).transpose()?.unwrap_or(Value::Null);

    Ok(SessionRecord {
        sender_key: sender_key.to_owned(),
        session_id: session_id.to_owned(),
        kind,
        pickle,
        room_id: room_name.and_then(|r| r.as_str().try_into().ok()),
        chain_index,
        state: SessionState::from_db_code(
            data.get("state").and_then(Value::as_i64).unwrap_or(0),
        ),
        created_ms: time.unwrap_or(0),
        signing_key: data.get("signing_key").and_then(Value::as_str).map(ToOwned::to_owned),
    })
}

fn file_algorithm_code(name: &str) -> i64 {
    match name {
        "A256CTR" => 1,
        _ => 0,
    }
}

fn file_algorithm_name(code: i64) -> String {
    match code {
        1 => "A256CTR".to_owned(),
        _ => "unknown".to_owned(),
    }
}

fn file_key_type_code(name: &str) -> i64 {
    match name {
        "oct" => 1,
        _ => 0,
    }
}

fn file_key_type_name(code: i64) -> String {
    match code {
        1 => "oct".to_owned(),
        _ => "unknown".to_owned(),
    }
}

fn file_version_code(name: &str) -> i64 {
    match name {
        "v2" => 2,
        "v1" => 1,
        _ => 0,
    }
}

fn file_version_name(code: i64) -> String {
    match code {
        2 => "v2".to_owned(),
        1 => "v1".to_owned(),
        _ => "unknown".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;

    use super::*;

    async fn store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), "matrix.db").await.unwrap();
        (store, dir)
    }

    fn account() -> StoredAccount {
        StoredAccount {
            user_id: user_id!("@alice:example.org").to_owned(),
            device_id: device_id!("DEV1").to_owned(),
            pickle: Some("pickled".to_owned()),
            next_batch: Some("batch-1".to_owned()),
            filter_id: Some("1".to_owned()),
            homeserver: Some("https://matrix.example.org".to_owned()),
            enabled: true,
        }
    }

    fn message_event(uid: &str, body: &str) -> Event {
        Event::from_sync_json(&json!({
            "type": "m.room.message",
            "event_id": uid,
            "sender": "@bob:example.org",
            "origin_server_ts": 1_662_000_000_000_i64,
            "content": { "msgtype": "m.text", "body": body },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn account_save_load_round_trip() {
        let (store, _dir) = store().await;
        let account = account();

        store.save_account(&account).await.unwrap();
        let loaded = store
            .load_account(&account.user_id, &account.device_id)
            .await
            .unwrap()
            .unwrap();
        similar_asserts::assert_eq!(loaded, account);

        // Saving without a pickle keeps the stored one.
        let mut update = account.clone();
        update.pickle = None;
        update.next_batch = Some("batch-2".to_owned());
        store.save_account(&update).await.unwrap();

        let loaded = store
            .load_account(&account.user_id, &account.device_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.pickle.as_deref(), Some("pickled"));
        assert_eq!(loaded.next_batch.as_deref(), Some("batch-2"));
    }

    #[tokio::test]
    async fn missing_account_loads_as_none() {
        let (store, _dir) = store().await;
        let loaded = store
            .load_account(user_id!("@nobody:example.org"), device_id!("NOPE"))
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn event_insertion_is_idempotent_and_ordered() {
        let (store, _dir) = store().await;
        let account = account();
        store.save_account(&account).await.unwrap();

        let room = room_id!("!room:example.org").to_owned();
        let events: Vec<Event> =
            (0..5).map(|i| message_event(&format!("$ev{i}"), &format!("message {i}"))).collect();

        store
            .add_room_events(&account.user_id, &account.device_id, room.clone(), events.clone(), false)
            .await
            .unwrap();

        // Re-adding the same events, prepending this time, changes nothing.
        store
            .add_room_events(&account.user_id, &account.device_id, room.clone(), events, true)
            .await
            .unwrap();

        let loaded = store
            .get_past_events(&account.user_id, &account.device_id, room.clone(), None, 30)
            .await
            .unwrap();

        assert_eq!(loaded.len(), 5);
        // Newest first.
        assert_eq!(loaded[0].body(), Some("message 4"));
        assert_eq!(loaded[4].body(), Some("message 0"));
    }

    #[tokio::test]
    async fn prepended_history_sorts_before_existing_events() {
        let (store, _dir) = store().await;
        let account = account();
        store.save_account(&account).await.unwrap();
        let room = room_id!("!room:example.org").to_owned();

        store
            .add_room_events(
                &account.user_id,
                &account.device_id,
                room.clone(),
                vec![message_event("$new", "new")],
                false,
            )
            .await
            .unwrap();

        // A backfill chunk arrives newest-first and is prepended.
        store
            .add_room_events(
                &account.user_id,
                &account.device_id,
                room.clone(),
                vec![message_event("$old2", "old 2"), message_event("$old1", "old 1")],
                true,
            )
            .await
            .unwrap();

        let loaded = store
            .get_past_events(&account.user_id, &account.device_id, room.clone(), None, 30)
            .await
            .unwrap();
        let bodies: Vec<_> = loaded.iter().filter_map(Event::body).collect();
        assert_eq!(bodies, ["new", "old 2", "old 1"]);

        // Paging from a known event excludes the event itself.
        let from = store
            .get_past_events(
                &account.user_id,
                &account.device_id,
                room,
                Some("$new".to_owned()),
                30,
            )
            .await
            .unwrap();
        let bodies: Vec<_> = from.iter().filter_map(Event::body).collect();
        assert_eq!(bodies, ["old 2", "old 1"]);
    }

    #[tokio::test]
    async fn room_snapshot_round_trip() {
        let (store, _dir) = store().await;
        let account = account();
        store.save_account(&account).await.unwrap();

        let snapshot = RoomSnapshot {
            room_id: room_id!("!room:example.org").to_owned(),
            prev_batch: Some("prev-1".to_owned()),
            data: json!({ "name": "Cauldron", "encrypted": true }),
            replacement: Some(room_id!("!next:example.org").to_owned()),
        };

        store.save_room(&account.user_id, &account.device_id, snapshot.clone()).await.unwrap();
        let rooms = store.load_rooms(&account.user_id, &account.device_id).await.unwrap();

        let loaded = rooms.iter().find(|r| r.room_id == snapshot.room_id).unwrap();
        assert_eq!(loaded, &snapshot);
    }

    #[tokio::test]
    async fn olm_session_scan_decrypts_and_advances_the_pickle() {
        let (store, _dir) = store().await;
        let account = account();
        store.save_account(&account).await.unwrap();

        let pickle_key = [9u8; 32];
        let mut alice = vodozemac::olm::Account::new();
        let mut bob = vodozemac::olm::Account::new();
        bob.generate_one_time_keys(1);
        let one_time_key = *bob.one_time_keys().values().next().unwrap();

        // Bob's inbound session is what our account has persisted.
        let mut alice_session =
            OlmSession::new_outbound(&mut alice, bob.curve25519_key(), one_time_key);
        let message = alice_session.encrypt("first");
        let vodozemac::olm::OlmMessage::PreKey(prekey) = &message else {
            panic!("expected a pre-key message");
        };
        let inbound = bob.create_inbound_session(alice.curve25519_key(), prekey).unwrap();
        let bob_session =
            OlmSession::new_inbound(inbound.session, &alice.curve25519_key().to_base64());

        store
            .save_session(&account.user_id, &account.device_id, bob_session.to_record(&pickle_key))
            .await
            .unwrap();

        // A later message decrypts straight out of the store scan.
        let second = alice_session.encrypt("second");
        let (message_type, body) = crate::crypto::olm::olm_message_to_parts(&second);
        let (record, plaintext) = store
            .lookup_olm_session(
                &account.user_id,
                &account.device_id,
                alice.curve25519_key().to_base64(),
                message_type,
                body,
                pickle_key,
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(plaintext, b"second");
        assert_eq!(record.kind, SessionKind::OlmIn);

        // An unrelated sender key finds nothing.
        let third = alice_session.encrypt("third");
        let (message_type, body) = crate::crypto::olm::olm_message_to_parts(&third);
        let missing = store
            .lookup_olm_session(
                &account.user_id,
                &account.device_id,
                "unknown-sender-key".to_owned(),
                message_type,
                body,
                pickle_key,
            )
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn file_key_round_trip() {
        let (store, _dir) = store().await;
        let account = account();
        store.save_account(&account).await.unwrap();

        let key = FileKey {
            mxc_uri: Some("mxc://example.org/abcdef".to_owned()),
            sha256: "hash".to_owned(),
            iv: "iv".to_owned(),
            key: "key".to_owned(),
            algorithm: "A256CTR".to_owned(),
            version: "v2".to_owned(),
            key_type: "oct".to_owned(),
            extractable: true,
        };

        store.save_file_enc(&account.user_id, &account.device_id, key.clone()).await.unwrap();
        let loaded = store
            .find_file_enc(
                &account.user_id,
                &account.device_id,
                "mxc://example.org/abcdef".to_owned(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, key);
    }

    #[tokio::test]
    async fn device_list_diffs_apply() {
        let (store, _dir) = store().await;
        let account = account();
        store.save_account(&account).await.unwrap();

        let bob = user_id!("@bob:example.org").to_owned();
        let device = Device {
            user_id: bob.clone(),
            device_id: device_id!("BOB1").to_owned(),
            curve25519: Some("curve".to_owned()),
            ed25519: Some("ed".to_owned()),
            algorithms: vec!["m.olm.v1.curve25519-aes-sha2".to_owned()],
            display_name: Some("phone".to_owned()),
            verification: DeviceVerification::Unset,
        };

        store
            .save_user_devices(
                &account.user_id,
                &account.device_id,
                bob.clone(),
                vec![device.clone()],
                vec![],
                false,
            )
            .await
            .unwrap();

        let (outdated, devices) = store
            .load_user_devices(&account.user_id, &account.device_id, bob.clone())
            .await
            .unwrap();
        assert!(!outdated);
        assert_eq!(devices, vec![device]);

        store
            .set_device_verification(
                bob.clone(),
                device_id!("BOB1").to_owned(),
                DeviceVerification::Verified,
            )
            .await
            .unwrap();
        let (_, devices) = store
            .load_user_devices(&account.user_id, &account.device_id, bob.clone())
            .await
            .unwrap();
        assert_eq!(devices[0].verification, DeviceVerification::Verified);

        store
            .save_user_devices(
                &account.user_id,
                &account.device_id,
                bob.clone(),
                vec![],
                vec![device_id!("BOB1").to_owned()],
                false,
            )
            .await
            .unwrap();
        let (_, devices) =
            store.load_user_devices(&account.user_id, &account.device_id, bob).await.unwrap();
        assert!(devices.is_empty());
    }

    #[tokio::test]
    async fn delete_account_cascades() {
        let (store, _dir) = store().await;
        let account = account();
        store.save_account(&account).await.unwrap();

        let room = room_id!("!room:example.org").to_owned();
        store
            .add_room_events(
                &account.user_id,
                &account.device_id,
                room,
                vec![message_event("$ev", "bye")],
                false,
            )
            .await
            .unwrap();

        store.delete_account(&account.user_id, &account.device_id).await.unwrap();
        assert!(store
            .load_account(&account.user_id, &account.device_id)
            .await
            .unwrap()
            .is_none());

        // Deleting an unknown account is a no-op, not an error.
        store.delete_account(&account.user_id, &account.device_id).await.unwrap();
    }

    #[tokio::test]
    async fn close_stops_the_worker() {
        let (store, _dir) = store().await;
        store.close().await.unwrap();
        assert_matches::assert_matches!(
            store.save_account(&account()).await,
            Err(StoreError::Closed)
        );
    }
}
