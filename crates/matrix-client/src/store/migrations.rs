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

//! Schema creation and forward-only migrations.
//!
//! The schema version lives in `PRAGMA user_version`. Migrations chain
//! through every intermediate version; each step backs the database file up
//! first and rebuilds tables through `tmp_*` copies inside one transaction
//! with foreign keys disabled.

use std::{
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreError;

/// The schema version this build reads and writes.
pub(crate) const SCHEMA_VERSION: u32 = 2;

/// The full current schema, used when the database is brand new.
const CREATE_SCHEMA: &str = "\
    BEGIN TRANSACTION;

    PRAGMA user_version = 2;

    CREATE TABLE IF NOT EXISTS users (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER REFERENCES accounts(id),
    username TEXT NOT NULL UNIQUE,
    outdated INTEGER DEFAULT 1,
    json_data TEXT);

    CREATE TABLE IF NOT EXISTS user_devices (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    device TEXT NOT NULL,
    curve25519_key TEXT,
    ed25519_key TEXT,
    verification INTEGER DEFAULT 0,
    json_data TEXT,
    UNIQUE (user_id, device));

    CREATE TABLE IF NOT EXISTS accounts (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    user_device_id INTEGER NOT NULL REFERENCES user_devices(id),
    next_batch TEXT,
    pickle TEXT,
    enabled INTEGER DEFAULT 0,
    json_data TEXT,
    UNIQUE (user_device_id));

    CREATE TABLE IF NOT EXISTS rooms (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    room_name TEXT NOT NULL,
    prev_batch TEXT,
    replacement_room_id INTEGER REFERENCES rooms(id),
    json_data TEXT,
    UNIQUE (account_id, room_name));

    CREATE TABLE IF NOT EXISTS room_members (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id),
    user_state INTEGER NOT NULL DEFAULT 0,
    json_data TEXT,
    UNIQUE (room_id, user_id));

    CREATE TABLE IF NOT EXISTS room_events (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    sorted_id INTEGER NOT NULL,
    room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    sender_id INTEGER NOT NULL REFERENCES room_members(id),
    event_type INTEGER NOT NULL,
    event_uid TEXT NOT NULL,
    txnid TEXT,
    replaces_event_id INTEGER REFERENCES room_events(id),
    reply_to_id INTEGER REFERENCES room_events(id),
    event_state INTEGER,
    state_key TEXT,
    origin_server_ts INTEGER NOT NULL,
    json_data TEXT,
    UNIQUE (room_id, event_uid));

    CREATE TABLE IF NOT EXISTS encryption_keys (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER REFERENCES accounts(id),
    file_url TEXT NOT NULL,
    file_sha256 TEXT,
    iv TEXT NOT NULL,
    version INT DEFAULT 2 NOT NULL,
    algorithm INT NOT NULL,
    key TEXT NOT NULL,
    type INT NOT NULL,
    extractable INT DEFAULT 1 NOT NULL,
    json_data TEXT,
    UNIQUE (account_id, file_url));

    CREATE TABLE IF NOT EXISTS session (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER NOT NULL REFERENCES accounts(id),
    sender_key TEXT NOT NULL,
    session_id TEXT NOT NULL,
    type INTEGER NOT NULL,
    pickle TEXT NOT NULL,
    time INT,
    room_id INTEGER REFERENCES rooms(id),
    json_data TEXT,
    chain_index INTEGER,
    UNIQUE (account_id, sender_key, session_id));

    COMMIT;";

/// Version 1 splits the device out of the users table into `user_devices`
/// and adds the JSON payload columns.
const MIGRATE_TO_V1: &str = "\
    PRAGMA foreign_keys=OFF;
    BEGIN TRANSACTION;

    CREATE TABLE IF NOT EXISTS tmp_users (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    outdated INTEGER DEFAULT 1,
    json_data TEXT);

    CREATE TABLE IF NOT EXISTS user_devices (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    device TEXT NOT NULL,
    curve25519_key TEXT,
    ed25519_key TEXT,
    verification INTEGER DEFAULT 0,
    json_data TEXT,
    UNIQUE (user_id, device));

    CREATE TABLE IF NOT EXISTS tmp_accounts (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    user_device_id INTEGER NOT NULL REFERENCES user_devices(id),
    next_batch TEXT,
    pickle TEXT,
    enabled INTEGER DEFAULT 0,
    json_data TEXT,
    UNIQUE (user_device_id));

    INSERT INTO tmp_users(username)
    SELECT DISTINCT username FROM users;

    INSERT INTO user_devices(user_id,device)
    SELECT tmp_users.id,devices.device FROM tmp_users
    JOIN users ON users.username=tmp_users.username
    JOIN devices ON users.device_id=devices.id;

    INSERT INTO tmp_accounts(user_device_id,next_batch,pickle,enabled)
    SELECT user_devices.id,next_batch,pickle,enabled FROM accounts
    JOIN users ON users.id=accounts.user_id
    JOIN devices ON users.device_id=devices.id
    JOIN user_devices ON user_devices.device=devices.device
    JOIN tmp_users ON user_devices.user_id=tmp_users.id
    AND tmp_users.username=users.username;

    UPDATE session SET account_id=(SELECT tmp_accounts.id
    FROM tmp_accounts
    INNER JOIN accounts ON accounts.pickle=tmp_accounts.pickle
    AND session.account_id=accounts.id);

    UPDATE rooms SET account_id=(SELECT tmp_accounts.id
    FROM tmp_accounts
    INNER JOIN accounts ON accounts.pickle=tmp_accounts.pickle
    AND rooms.account_id=accounts.id);

    DROP TABLE IF EXISTS users;
    DROP TABLE IF EXISTS accounts;
    DROP TABLE IF EXISTS devices;

    ALTER TABLE tmp_users RENAME TO users;
    ALTER TABLE tmp_accounts RENAME TO accounts;

    ALTER TABLE rooms ADD COLUMN replacement_room_id
    INTEGER REFERENCES rooms(id);
    ALTER TABLE rooms ADD COLUMN json_data TEXT;

    ALTER TABLE encryption_keys ADD COLUMN json_data TEXT;

    ALTER TABLE session ADD COLUMN room_id
    INTEGER REFERENCES rooms(id);
    ALTER TABLE session ADD COLUMN json_data TEXT;

    PRAGMA user_version = 1;

    COMMIT;
    PRAGMA foreign_keys=ON;";

/// Version 2 adds room event history, room membership, account scoping of
/// users and attachment keys, and the Megolm chain index.
const MIGRATE_TO_V2: &str = "\
    PRAGMA foreign_keys=OFF;
    BEGIN TRANSACTION;

    CREATE TABLE IF NOT EXISTS room_members (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    user_id INTEGER NOT NULL REFERENCES users(id),
    user_state INTEGER NOT NULL DEFAULT 0,
    json_data TEXT,
    UNIQUE (room_id, user_id));

    CREATE TABLE IF NOT EXISTS room_events (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    sorted_id INTEGER NOT NULL,
    room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    sender_id INTEGER NOT NULL REFERENCES room_members(id),
    event_type INTEGER NOT NULL,
    event_uid TEXT NOT NULL,
    txnid TEXT,
    replaces_event_id INTEGER REFERENCES room_events(id),
    reply_to_id INTEGER REFERENCES room_events(id),
    event_state INTEGER,
    state_key TEXT,
    origin_server_ts INTEGER NOT NULL,
    json_data TEXT,
    UNIQUE (room_id, event_uid));

    CREATE TABLE IF NOT EXISTS tmp_encryption_keys (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER REFERENCES accounts(id),
    file_url TEXT NOT NULL,
    file_sha256 TEXT,
    iv TEXT NOT NULL,
    version INT DEFAULT 2 NOT NULL,
    algorithm INT NOT NULL,
    key TEXT NOT NULL,
    type INT NOT NULL,
    extractable INT DEFAULT 1 NOT NULL,
    json_data TEXT,
    UNIQUE (account_id, file_url));

    INSERT INTO tmp_encryption_keys(file_url,file_sha256,iv,version,algorithm,key,type,extractable)
    SELECT DISTINCT file_url,file_sha256,iv,version,algorithm,key,type,extractable FROM encryption_keys;

    CREATE TABLE IF NOT EXISTS tmp_users (
    id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
    account_id INTEGER REFERENCES accounts(id),
    username TEXT NOT NULL UNIQUE,
    outdated INTEGER DEFAULT 1,
    json_data TEXT);

    INSERT INTO tmp_users(id,username)
    SELECT DISTINCT id,username FROM users;

    DROP TABLE IF EXISTS users;
    DROP TABLE IF EXISTS encryption_keys;

    ALTER TABLE tmp_users RENAME TO users;
    ALTER TABLE tmp_encryption_keys RENAME TO encryption_keys;

    ALTER TABLE session ADD COLUMN chain_index INTEGER;

    PRAGMA user_version = 2;

    COMMIT;
    PRAGMA foreign_keys=ON;";

/// Copy the database file aside before touching it. A missing source and a
/// pre-existing target are both tolerated.
fn backup(db_path: &Path) -> Result<(), StoreError> {
    let timestamp =
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let backup_path = db_path.with_extension(format!("{timestamp}.bak"));

    info!("Copying database for backup");
    match std::fs::copy(db_path, &backup_path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn schema_version(conn: &Connection) -> Result<u32, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get::<_, u32>(0))?)
}

fn has_tables(conn: &Connection) -> Result<bool, StoreError> {
    let count: u32 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = 'accounts'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Bring the database up to [`SCHEMA_VERSION`], creating it from scratch
/// when it is empty.
pub(crate) fn run(conn: &Connection, db_path: &Path) -> Result<(), StoreError> {
    let version = schema_version(conn)?;

    if version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema(version));
    }

    if version == 0 && !has_tables(conn)? {
        conn.execute_batch(CREATE_SCHEMA)?;
        return Ok(());
    }

    if version < 1 {
        backup(db_path)?;
        conn.execute_batch(MIGRATE_TO_V1)?;
        debug!("Migrated the database to version 1");
    }

    if version < 2 {
        backup(db_path)?;
        conn.execute_batch(MIGRATE_TO_V2)?;
        debug!("Migrated the database to version 2");
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// The original version 0 layout, used as a migration fixture.
    pub(crate) const V0_SCHEMA: &str = "\
        BEGIN TRANSACTION;

        CREATE TABLE IF NOT EXISTS users (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        device_id INTEGER NOT NULL REFERENCES devices(id));

        CREATE TABLE IF NOT EXISTS devices (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        device TEXT NOT NULL UNIQUE);

        CREATE TABLE IF NOT EXISTS accounts (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id),
        next_batch TEXT,
        pickle TEXT,
        enabled INTEGER DEFAULT 0);

        CREATE TABLE IF NOT EXISTS rooms (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts(id),
        room_name TEXT NOT NULL,
        prev_batch TEXT,
        UNIQUE (account_id, room_name));

        CREATE TABLE IF NOT EXISTS encryption_keys (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        file_url TEXT NOT NULL UNIQUE,
        file_sha256 TEXT,
        iv TEXT NOT NULL,
        version INT DEFAULT 2 NOT NULL,
        algorithm INT NOT NULL,
        key TEXT NOT NULL,
        type INT NOT NULL,
        extractable INT DEFAULT 1 NOT NULL);

        CREATE TABLE IF NOT EXISTS session (
        id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
        account_id INTEGER NOT NULL REFERENCES accounts(id),
        sender_key TEXT NOT NULL,
        session_id TEXT NOT NULL,
        type INTEGER NOT NULL,
        pickle TEXT NOT NULL,
        time INT,
        UNIQUE (account_id, sender_key, session_id));

        COMMIT;";

    fn row_count(conn: &Connection, table: &str) -> u32 {
        conn.query_row(&format!("SELECT count(*) FROM {table}"), [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn fresh_database_gets_the_current_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.db");
        let conn = Connection::open(&path).unwrap();

        run(&conn, &path).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(has_tables(&conn).unwrap());
    }

    #[test]
    fn v0_database_migrates_forward_through_every_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(V0_SCHEMA).unwrap();
            conn.execute_batch(
                "INSERT INTO devices(id, device) VALUES (1, 'DEV1');
                 INSERT INTO users(id, username, device_id) VALUES (1, '@alice:example.org', 1);
                 INSERT INTO accounts(id, user_id, next_batch, pickle, enabled)
                 VALUES (1, 1, 'batch-1', 'pickled-account', 1);
                 INSERT INTO rooms(account_id, room_name, prev_batch)
                 VALUES (1, '!room:example.org', 'prev-1');
                 INSERT INTO session(account_id, sender_key, session_id, type, pickle, time)
                 VALUES (1, 'curve-key', 'session-1', 0, 'pickled-session', 12345);",
            )
            .unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        run(&conn, &path).unwrap();

        assert_eq!(schema_version(&conn).unwrap(), 2);

        // Every row survived the re-projection.
        assert_eq!(row_count(&conn, "users"), 1);
        assert_eq!(row_count(&conn, "user_devices"), 1);
        assert_eq!(row_count(&conn, "accounts"), 1);
        assert_eq!(row_count(&conn, "rooms"), 1);
        assert_eq!(row_count(&conn, "session"), 1);

        let (next_batch, pickle, enabled): (String, String, bool) = conn
            .query_row("SELECT next_batch, pickle, enabled FROM accounts", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        assert_eq!(next_batch, "batch-1");
        assert_eq!(pickle, "pickled-account");
        assert!(enabled);

        // The new columns exist.
        conn.execute("UPDATE session SET chain_index = 3", []).unwrap();
        conn.execute("UPDATE rooms SET json_data = '{}'", []).unwrap();

        // A backup file was left next to the database.
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().is_some_and(|ext| ext == "bak")
            })
            .count();
        assert!(backups >= 1);
    }

    #[test]
    fn future_schema_fails_the_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE accounts (id INTEGER); PRAGMA user_version = 9;")
            .unwrap();

        assert_matches::assert_matches!(
            run(&conn, &path),
            Err(StoreError::UnsupportedSchema(9))
        );
    }

    #[test]
    fn migration_is_idempotent_at_target_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stable.db");
        let conn = Connection::open(&path).unwrap();

        run(&conn, &path).unwrap();
        run(&conn, &path).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }
}
