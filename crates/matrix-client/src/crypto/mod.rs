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

//! End-to-end encryption: the Olm account, session caches, attachment
//! keys, and SAS device verification.

pub(crate) mod attachments;
pub(crate) mod group_sessions;
mod machine;
pub(crate) mod olm;
pub mod verification;

pub use attachments::FileKey;
pub use group_sessions::RotationSettings;
pub(crate) use machine::{verify_signed_json, DecryptedToDevice, OlmMachine};
pub use olm::{SessionKind, SessionRecord, SessionState};

/// The Olm to-device algorithm identifier.
pub(crate) const OLM_V1: &str = "m.olm.v1.curve25519-aes-sha2";

/// The Megolm room message algorithm identifier.
pub(crate) const MEGOLM_V1: &str = "m.megolm.v1.aes-sha2";
