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

//! Encryption and decryption of room message attachments, the `v2`
//! AES-256-CTR scheme.

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes256,
};
use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::CryptoError;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// The key material needed to decrypt one encrypted attachment, cached per
/// MXC URI and persisted in the `encryption_keys` table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileKey {
    /// The `mxc://` URI the ciphertext was uploaded to. Unset until the
    /// upload assigns one.
    pub mxc_uri: Option<String>,
    /// SHA-256 of the ciphertext, unpadded base64.
    pub sha256: String,
    /// AES initialisation vector, unpadded base64.
    pub iv: String,
    /// AES key as base64url without padding, JWK style.
    pub key: String,
    /// JWK algorithm tag, `A256CTR`.
    pub algorithm: String,
    /// Scheme version, `v2`.
    pub version: String,
    /// JWK key type, `oct`.
    pub key_type: String,
    /// JWK `ext` flag.
    pub extractable: bool,
}

impl FileKey {
    /// Parse the `file` object of an encrypted attachment event.
    pub(crate) fn from_content(file: &Value) -> Option<Self> {
        let key = file.get("key")?;

        Some(Self {
            mxc_uri: file.get("url").and_then(Value::as_str).map(ToOwned::to_owned),
            sha256: file.get("hashes")?.get("sha256")?.as_str()?.to_owned(),
            iv: file.get("iv")?.as_str()?.to_owned(),
            key: key.get("k")?.as_str()?.to_owned(),
            algorithm: key.get("alg")?.as_str()?.to_owned(),
            version: file.get("v").and_then(Value::as_str).unwrap_or("v2").to_owned(),
            key_type: key.get("kty").and_then(Value::as_str).unwrap_or("oct").to_owned(),
            extractable: key.get("ext").and_then(Value::as_bool).unwrap_or(true),
        })
    }

    /// Render the `file` object for an outgoing encrypted attachment event.
    pub(crate) fn to_content(&self) -> Value {
        json!({
            "url": &self.mxc_uri,
            "v": self.version.as_str(),
            "iv": self.iv.as_str(),
            "hashes": { "sha256": self.sha256.as_str() },
            "key": {
                "kty": self.key_type.as_str(),
                "key_ops": ["encrypt", "decrypt"],
                "alg": self.algorithm.as_str(),
                "k": self.key.as_str(),
                "ext": self.extractable,
            },
        })
    }
}

/// Encrypt attachment bytes in place and return the key material that has
/// to travel inside the (Megolm encrypted) room event.
pub(crate) fn encrypt_attachment(data: &mut [u8]) -> FileKey {
    let mut key = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(key.as_mut());

    // Only the first half of the IV is random; the second half is the
    // block counter starting at zero.
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv[..8]);

    let mut cipher = Aes256Ctr::new(key.as_ref().into(), &iv.into());
    cipher.apply_keystream(data);

    let sha256 = Sha256::digest(&*data);

    FileKey {
        mxc_uri: None,
        sha256: STANDARD_NO_PAD.encode(sha256),
        iv: STANDARD_NO_PAD.encode(iv),
        key: URL_SAFE_NO_PAD.encode(key.as_ref()),
        algorithm: "A256CTR".to_owned(),
        version: "v2".to_owned(),
        key_type: "oct".to_owned(),
        extractable: true,
    }
}

/// Decrypt attachment bytes in place after checking the ciphertext hash.
pub(crate) fn decrypt_attachment(data: &mut [u8], info: &FileKey) -> Result<(), CryptoError> {
    let expected = STANDARD_NO_PAD
        .decode(&info.sha256)
        .map_err(|_| CryptoError::MalformedEvent("undecodable attachment hash"))?;
    if Sha256::digest(&*data).as_slice() != expected {
        return Err(CryptoError::AttachmentHash);
    }

    let key = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(&info.key)
            .map_err(|_| CryptoError::MalformedEvent("undecodable attachment key"))?,
    );
    let iv = STANDARD_NO_PAD
        .decode(&info.iv)
        .map_err(|_| CryptoError::MalformedEvent("undecodable attachment iv"))?;
    if key.len() != 32 || iv.len() != 16 {
        return Err(CryptoError::MalformedEvent("attachment key material has the wrong size"));
    }

    let mut cipher = Aes256Ctr::new(key.as_slice().into(), iv.as_slice().into());
    cipher.apply_keystream(data);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let plaintext = b"totally an image".to_vec();
        let mut data = plaintext.clone();

        let info = encrypt_attachment(&mut data);
        assert_ne!(data, plaintext);
        assert_eq!(info.algorithm, "A256CTR");
        assert_eq!(info.version, "v2");

        decrypt_attachment(&mut data, &info).unwrap();
        assert_eq!(data, plaintext);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let mut data = b"payload".to_vec();
        let info = encrypt_attachment(&mut data);

        data[0] ^= 0x01;
        assert_matches::assert_matches!(
            decrypt_attachment(&mut data, &info),
            Err(CryptoError::AttachmentHash)
        );
    }

    #[test]
    fn content_round_trip() {
        let mut data = b"bytes".to_vec();
        let mut info = encrypt_attachment(&mut data);
        info.mxc_uri = Some("mxc://example.org/abc".to_owned());

        let content = info.to_content();
        let parsed = FileKey::from_content(&content).unwrap();
        assert_eq!(parsed, info);
    }
}
