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

//! An embeddable Matrix client library with end-to-end encryption enabled
//! by default.
//!
//! The entry point is a [`MatrixContext`], which owns one open [`Store`]
//! and any number of [`Client`]s sharing it:
//!
//! ```no_run
//! use matrix_client::{ClientEvent, MatrixContext};
//!
//! # async fn example() -> matrix_client::Result<()> {
//! let context = MatrixContext::open("/var/lib/my-app").await?;
//!
//! let client = context
//!     .client_builder()
//!     .user_id("@alice:example.org")
//!     .password("hunter2")
//!     .device_display_name("my app")
//!     .enabled(true)
//!     .build()
//!     .await?;
//!
//! let mut events = client.subscribe();
//! client.start_sync().await;
//!
//! while let Ok(event) = events.recv().await {
//!     if let ClientEvent::RoomEvent { room_id, event } = event {
//!         println!("{room_id}: {:?}", event.body());
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Incoming traffic is decrypted transparently; outgoing messages are
//! encrypted whenever the room calls for it, including the device list
//! tracking, one-time key claims and Megolm session rotation that
//! involves.

#![warn(missing_debug_implementations)]

mod api;
mod client;
mod crypto;
mod error;
mod events;
mod http_client;
mod room;
mod secret_store;
mod store;
mod users;
mod utilities;

use std::path::Path;

pub use client::{Client, ClientBuilder, ClientEvent, LoginMethod, SendHandle, VerificationInfo};
pub use crypto::{
    verification::{CancelCode, VerificationPhase, VerificationSession},
    FileKey, RotationSettings, SessionKind, SessionRecord, SessionState,
};
pub use error::{CryptoError, Error, HttpError, MatrixError, Result, StoreError};
pub use events::{DeliveryState, Event, EventType};
pub use room::{Membership, Room, RoomMember};
pub use secret_store::{CredentialStore, StoredCredentials, CREDENTIAL_PROTOCOL};
pub use store::{RoomSnapshot, Store, StoredAccount};
pub use users::{ClaimedDevice, Device, DeviceVerification, User};

/// The database filename used inside the context directory.
const STORE_FILENAME: &str = "matrix.db";

/// The top level handle an application holds: one open store plus the
/// clients built on it.
#[derive(Clone, Debug)]
pub struct MatrixContext {
    store: Store,
}

impl MatrixContext {
    /// Open (or create) the store under `dir` and wrap it in a context.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let store = Store::open(dir, STORE_FILENAME).await?;
        Ok(Self { store })
    }

    /// Build a client backed by this context's store.
    pub fn client_builder(&self) -> ClientBuilder {
        ClientBuilder::new(self.store.clone())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Flush and stop the store worker. Call this last; clients built on
    /// the context fail their database operations afterwards.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        Ok(())
    }
}
