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

use hkdf::Hkdf;
use rand::RngCore;
use ruma::CanonicalJsonValue;
use serde_json::Value;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Encode bytes as unpadded base64, the encoding Matrix uses for key
/// material.
pub(crate) fn encode(input: impl AsRef<[u8]>) -> String {
    vodozemac::base64_encode(input)
}

/// Decode unpadded (or padded) base64.
pub(crate) fn decode(input: impl AsRef<[u8]>) -> Result<Vec<u8>, vodozemac::Base64DecodeError> {
    vodozemac::base64_decode(input)
}

/// Serialize a JSON value into its canonical form: UTF-8, no insignificant
/// whitespace, object members sorted by key code point.
///
/// This is the one canonical JSON implementation in the crate; both JSON
/// signing and the SAS commitment go through it so the two can never drift
/// apart.
pub(crate) fn canonical_json(value: &Value) -> Result<String, CryptoError> {
    let canonical = CanonicalJsonValue::try_from(value.clone())
        .map_err(|e| CryptoError::NotCanonical(e.to_string()))?;
    Ok(canonical.to_string())
}

/// Generate a fresh pickle passphrase: 64 random bytes, base64 encoded.
pub(crate) fn generate_pickle_passphrase() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; 64]);
    rand::thread_rng().fill_bytes(&mut *bytes);
    Zeroizing::new(encode(&*bytes))
}

/// Expand a pickle passphrase into the 32 byte cipher key vodozemac wants.
pub(crate) fn expand_pickle_key(passphrase: &str) -> Zeroizing<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, passphrase.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(b"session pickle key", key.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Milliseconds since the Unix epoch, for wall-clock columns and rotation
/// accounting.
pub(crate) fn now_millis() -> i64 {
    u64::from(ruma::MilliSecondsSinceUnixEpoch::now().get()) as i64
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn canonical_json_sorts_and_strips_whitespace() {
        let value = json!({
            "b": 1,
            "a": {"y": [3, 2], "x": "ä"},
        });

        let canonical = canonical_json(&value).unwrap();
        assert_eq!(canonical, r#"{"a":{"x":"ä","y":[3,2]},"b":1}"#);
    }

    #[test]
    fn canonical_json_rejects_floats() {
        let value = json!({ "a": 1.5 });
        canonical_json(&value).unwrap_err();
    }

    #[test]
    fn pickle_passphrase_has_64_bytes_of_entropy() {
        let passphrase = generate_pickle_passphrase();
        assert_eq!(decode(passphrase.as_bytes()).unwrap().len(), 64);
        assert_ne!(*passphrase, *generate_pickle_passphrase());
    }

    #[test]
    fn pickle_key_expansion_is_deterministic() {
        let a = expand_pickle_key("secret");
        let b = expand_pickle_key("secret");
        assert_eq!(*a, *b);
        assert_ne!(*a, *expand_pickle_key("other"));
    }
}
