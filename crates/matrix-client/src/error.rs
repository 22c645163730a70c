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

//! Error conditions.

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

/// Result type of the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error response from a Matrix homeserver.
///
/// The `errcode` and `error` strings are carried verbatim from the wire so
/// that callers can match on the full Matrix error corpus
/// (`M_FORBIDDEN`, `M_UNKNOWN_TOKEN`, `M_BAD_JSON`, `M_LIMIT_EXCEEDED`, ...).
#[derive(Clone, Debug, Deserialize, Error, PartialEq, Eq)]
#[error("the homeserver responded with {errcode}: {error}")]
pub struct MatrixError {
    /// The unique error code, e.g. `M_FORBIDDEN`.
    pub errcode: String,
    /// The human readable error message.
    #[serde(default)]
    pub error: String,
    /// Time in milliseconds to wait before retrying, sent with
    /// `M_LIMIT_EXCEEDED`.
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}

impl MatrixError {
    /// Did the homeserver reject our access token?
    pub fn is_unknown_token(&self) -> bool {
        self.errcode == "M_UNKNOWN_TOKEN"
    }
}

/// Errors of the HTTP layer.
#[derive(Debug, Error)]
pub enum HttpError {
    /// An error at the transport level, e.g. a timeout or a refused
    /// connection.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// The server returned a non-2xx status without a parseable Matrix
    /// error body.
    #[error("the server returned status {0}")]
    Server(StatusCode),

    /// The server returned a structured Matrix error.
    #[error(transparent)]
    Api(#[from] MatrixError),

    /// The response body wasn't valid JSON.
    #[error("malformed server response: {0}")]
    Json(#[from] serde_json::Error),

    /// A request was attempted that needs authentication before the client
    /// logged in.
    #[error("the access token wasn't set")]
    AuthenticationRequired,

    /// The homeserver URL or a path fragment could not be parsed.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl HttpError {
    /// True for failures that are worth retrying after a pause: transport
    /// glitches, resolver errors, gateway errors and garbled responses.
    ///
    /// Mirrors the transport classification used by the sync recovery path:
    /// everything between "request was cancelled" and "TLS handshake failed"
    /// counts, as do JSON parse failures of a response body.
    pub fn is_recoverable(&self) -> bool {
        match self {
            HttpError::Reqwest(e) => {
                e.is_timeout() || e.is_connect() || (e.is_request() && e.status().is_none())
            }
            HttpError::Server(status) => status.is_server_error(),
            HttpError::Json(_) => true,
            HttpError::Api(_) | HttpError::AuthenticationRequired | HttpError::Url(_) => false,
        }
    }
}

/// Errors of the SQLite store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An underlying SQLite failure.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the store directory or the migration backup failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The database was created by a newer version of the library.
    #[error("unsupported database schema version {0}")]
    UnsupportedSchema(u32),

    /// The store worker thread is gone, no further task can run.
    #[error("the store has been closed")]
    Closed,

    /// A JSON payload column failed to (de)serialize.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A pickled session in the database could not be restored.
    #[error(transparent)]
    Pickle(#[from] vodozemac::PickleError),

    /// A stored identifier column did not parse back into a Matrix id.
    #[error("corrupt identifier in the database: {0}")]
    CorruptId(String),

    /// The account the operation refers to is not in the database.
    #[error("unknown account {0}")]
    UnknownAccount(String),
}

/// Errors of the encryption engine.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Restoring an account or session from its pickle failed.
    #[error(transparent)]
    Pickle(#[from] vodozemac::PickleError),

    /// An Olm message failed to decrypt with every candidate session.
    #[error(transparent)]
    OlmDecryption(#[from] vodozemac::olm::DecryptionError),

    /// A Megolm message failed to decrypt.
    #[error(transparent)]
    MegolmDecryption(#[from] vodozemac::megolm::DecryptionError),

    /// An inbound Olm session could not be created from a pre-key message.
    #[error(transparent)]
    SessionCreation(#[from] vodozemac::olm::SessionCreationError),

    /// A Megolm session key failed to decode.
    #[error(transparent)]
    SessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),

    /// An Olm message failed to decode from its wire form.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// An ed25519 signature did not verify.
    #[error(transparent)]
    Signature(#[from] vodozemac::SignatureError),

    /// A public key failed to decode.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// Base64 key material failed to decode.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),

    /// No usable Olm session was found for the given sender key.
    #[error("no Olm session found for sender key {0}")]
    MissingSession(String),

    /// A Megolm ciphertext referenced a session we never received.
    #[error("unknown Megolm session {0}")]
    UnknownMegolmSession(String),

    /// There is no active outbound group session for the room.
    #[error("no outbound group session for room {0}")]
    MissingOutboundSession(String),

    /// The event is missing fields that the encryption scheme requires.
    #[error("malformed encrypted event: {0}")]
    MalformedEvent(&'static str),

    /// The decrypted payload was addressed to someone else or signed by an
    /// unexpected device.
    #[error("mismatch between the event and its encryption envelope: {0}")]
    MismatchedKeys(&'static str),

    /// An attachment's ciphertext did not match its recorded SHA-256.
    #[error("attachment hash mismatch")]
    AttachmentHash,

    /// A JSON payload failed to (de)serialize.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The canonical JSON form of an object could not be produced.
    #[error("object has no canonical JSON form: {0}")]
    NotCanonical(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The top level error type of the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error(transparent)]
    Http(HttpError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// No homeserver is configured and none could be discovered from the
    /// user id.
    #[error("no homeserver configured")]
    NoHomeserver,

    /// The configured homeserver does not speak a supported version of the
    /// client-server API.
    #[error("{0} is not a valid Matrix homeserver")]
    BadHomeserver(String),

    /// The password login failed.
    #[error("invalid username or password")]
    BadPassword,

    /// A key claim was attempted while a member's device list was stale.
    /// Refresh the device list and retry.
    #[error("the device list of a requested user has changed")]
    UserDeviceChanged,

    /// The operation needs a logged in client.
    #[error("the client is not logged in")]
    NotLoggedIn,

    /// The message was cancelled before its final send completed.
    #[error("the send was cancelled")]
    SendCancelled,

    /// No verification flow with the given id is active.
    #[error("unknown verification flow {0}")]
    UnknownVerification(String),

    /// The referenced room is not known to this client.
    #[error("unknown room {0}")]
    UnknownRoom(ruma::OwnedRoomId),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<HttpError> for Error {
    fn from(e: HttpError) -> Self {
        // Surface Matrix errors at the top level so callers can match on
        // the errcode without digging through the transport layer.
        match e {
            HttpError::Api(e) => Error::Matrix(e),
            e => Error::Http(e),
        }
    }
}

impl Error {
    /// True when the sync loop should quietly retry instead of surfacing
    /// the error.
    pub(crate) fn is_recoverable(&self) -> bool {
        match self {
            Error::Http(e) => e.is_recoverable(),
            Error::Json(_) => true,
            _ => false,
        }
    }

    pub(crate) fn as_matrix(&self) -> Option<&MatrixError> {
        match self {
            Error::Matrix(e) => Some(e),
            _ => None,
        }
    }
}
