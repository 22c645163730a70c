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

//! Wiring between incoming verification events, the per-flow state
//! machines, and `/sendToDevice`.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId, TransactionId};
use serde_json::Value;
use tracing::{debug, warn};

use super::{Client, ClientEvent};
use crate::{
    api::keys::SendToDeviceRequest,
    crypto::verification::{
        CancelCode, OutgoingVerification, VerificationPhase, VerificationSession,
    },
    error::{Error, Result},
    events::{Event, EventType},
    users::DeviceVerification,
};

/// A read-only snapshot of one verification flow, for display.
#[derive(Clone, Debug)]
pub struct VerificationInfo {
    pub flow_id: String,
    pub their_user: OwnedUserId,
    /// The peer's profile display name, when the directory knows it.
    pub their_display_name: Option<String>,
    pub their_device: OwnedDeviceId,
    pub phase: VerificationPhase,
    pub emoji: Option<[(&'static str, &'static str); 7]>,
    pub decimals: Option<(u16, u16, u16)>,
}

impl Client {
    /// Snapshot a running verification flow.
    pub async fn verification(&self, flow_id: &str) -> Option<VerificationInfo> {
        let info = {
            let sessions = self.inner.verifications.lock().await;
            let session = sessions.get(flow_id)?;
            VerificationInfo {
                flow_id: session.flow_id().to_owned(),
                their_user: session.their_user().clone(),
                their_display_name: None,
                their_device: session.their_device().clone(),
                phase: session.phase(),
                emoji: session.emoji(),
                decimals: session.decimals(),
            }
        };

        let their_display_name = match self.directory().await {
            Ok(directory) => directory.display_name(&info.their_user).await,
            Err(_) => None,
        };

        Some(VerificationInfo { their_display_name, ..info })
    }

    /// Accept an incoming verification request (send `ready`).
    pub async fn accept_verification(&self, flow_id: &str) -> Result<()> {
        let outgoing = {
            let mut sessions = self.inner.verifications.lock().await;
            let session = sessions.get_mut(flow_id).ok_or_else(|| Error::UnknownVerification(flow_id.to_owned()))?;
            match session.accept_request() {
                Ok(outgoing) => vec![outgoing],
                Err(code) => vec![session.cancel(code)],
            }
        };
        self.flush_verification(flow_id, outgoing).await
    }

    /// The user compared the short authentication strings and they match.
    pub async fn confirm_verification(&self, flow_id: &str) -> Result<()> {
        let (outgoing, failed) = {
            let mut sessions = self.inner.verifications.lock().await;
            let session = sessions.get_mut(flow_id).ok_or_else(|| Error::UnknownVerification(flow_id.to_owned()))?;
            match session.confirm() {
                Ok(outgoing) => (outgoing, false),
                Err(code) => (vec![session.cancel(code)], true),
            }
        };

        self.flush_verification(flow_id, outgoing).await?;
        if !failed {
            self.finish_if_done(flow_id).await?;
        }
        Ok(())
    }

    /// Abort a flow from our side (`m.user`).
    pub async fn cancel_verification(&self, flow_id: &str) -> Result<()> {
        let outgoing = {
            let mut sessions = self.inner.verifications.lock().await;
            let Some(session) = sessions.get_mut(flow_id) else {
                return Ok(());
            };
            vec![session.cancel(CancelCode::User)]
        };
        self.flush_verification(flow_id, outgoing).await
    }

    /// Route one incoming `m.key.verification.*` event.
    pub(super) async fn handle_verification_event(&self, event: &Event) {
        let Some(flow_id) = flow_id_of(event) else {
            warn!("Dropping a verification event with no transaction id");
            return;
        };

        if event.event_type == EventType::KeyVerificationRequest {
            self.handle_verification_request(event, flow_id).await;
            return;
        }

        let outgoing = {
            let mut sessions = self.inner.verifications.lock().await;
            let Some(session) = sessions.get_mut(&flow_id) else {
                debug!(flow_id = flow_id.as_str(), "Ignoring a verification event for an unknown flow");
                return;
            };

            match session.handle_event(&event.event_type, &event.content) {
                Ok(outgoing) => outgoing,
                Err(code) => vec![session.cancel(code)],
            }
        };

        if let Err(e) = self.flush_verification(&flow_id, outgoing).await {
            warn!(flow_id = flow_id.as_str(), "Failed to send a verification event: {e}");
        }
        if let Err(e) = self.finish_if_done(&flow_id).await {
            warn!(flow_id = flow_id.as_str(), "Failed to finish a verification flow: {e}");
        }
    }

    async fn handle_verification_request(&self, event: &Event, flow_id: String) {
        let Some(sender) = event.sender.clone() else { return };
        let Some(their_device) = event
            .content
            .get("from_device")
            .and_then(Value::as_str)
            .map(OwnedDeviceId::from)
        else {
            warn!(flow_id = flow_id.as_str(), "A verification request without a from_device");
            return;
        };

        let (our_user, our_device, our_ed25519) = {
            let machine = self.inner.machine.lock().await;
            let Some(machine) = machine.as_ref() else { return };
            (machine.user_id().to_owned(), machine.device_id().to_owned(), machine.ed25519_key())
        };

        // The fingerprint of the peer device, if we already track it.
        let their_ed25519 = match self.directory().await {
            Ok(directory) => directory
                .device(&sender, &their_device)
                .await
                .and_then(|d| d.ed25519),
            Err(_) => None,
        };

        let timestamp = event
            .content
            .get("timestamp")
            .and_then(Value::as_i64)
            .or(event.origin_server_ts);

        let session = VerificationSession::from_request(
            our_user,
            our_device,
            our_ed25519,
            sender.clone(),
            their_device.clone(),
            their_ed25519,
            flow_id.clone(),
            timestamp,
        );

        match session {
            Ok(session) => {
                debug!(
                    flow_id = flow_id.as_str(),
                    user_id = sender.as_str(),
                    device_id = their_device.as_str(),
                    "Received a verification request"
                );
                self.inner.verifications.lock().await.insert(flow_id.clone(), session);
                self.emit(ClientEvent::KeyVerification { flow_id });
            }
            Err(code) => {
                // Stale request; answer with a cancel without keeping any
                // state around.
                let content = serde_json::json!({
                    "transaction_id": flow_id.as_str(),
                    "code": code.as_str(),
                    "reason": "The request is outside the freshness window",
                });
                if let Err(e) = self
                    .send_to_device(
                        &sender,
                        &their_device,
                        EventType::KeyVerificationCancel.as_str(),
                        content,
                    )
                    .await
                {
                    warn!(flow_id = flow_id.as_str(), "Failed to cancel a stale verification request: {e}");
                }
            }
        }
    }

    /// Send the queued outgoing events of a flow and emit a progress
    /// notification. Terminal states drop the session from the active
    /// list (after the cancel or done made it out).
    async fn flush_verification(
        &self,
        flow_id: &str,
        outgoing: Vec<OutgoingVerification>,
    ) -> Result<()> {
        let (their_user, their_device, phase) = {
            let sessions = self.inner.verifications.lock().await;
            let Some(session) = sessions.get(flow_id) else {
                return Ok(());
            };
            (session.their_user().clone(), session.their_device().clone(), session.phase())
        };

        for event in outgoing {
            self.send_to_device(
                &their_user,
                &their_device,
                event.event_type.as_str(),
                event.content,
            )
            .await?;
        }

        self.emit(ClientEvent::KeyVerification { flow_id: flow_id.to_owned() });

        if let VerificationPhase::Cancelled(code) = phase {
            debug!(flow_id, code = code.as_str(), "Verification cancelled");
            self.inner.verifications.lock().await.remove(flow_id);
        }

        Ok(())
    }

    /// When a flow reached `Done`, record the trust and retire it.
    async fn finish_if_done(&self, flow_id: &str) -> Result<()> {
        let done = {
            let sessions = self.inner.verifications.lock().await;
            sessions.get(flow_id).is_some_and(|s| s.is_verified())
        };
        if !done {
            return Ok(());
        }

        let session = self.inner.verifications.lock().await.remove(flow_id);
        let Some(session) = session else {
            return Ok(());
        };

        debug!(
            flow_id = flow_id,
            user_id = session.their_user().as_str(),
            device_id = session.their_device().as_str(),
            "Device verified"
        );

        let directory = self.directory().await?;
        directory
            .set_device_verification(
                session.their_user(),
                session.their_device(),
                DeviceVerification::Verified,
            )
            .await?;

        self.emit(ClientEvent::KeyVerification { flow_id: flow_id.to_owned() });
        Ok(())
    }

    /// PUT a single to-device event to one device.
    pub(crate) async fn send_to_device(
        &self,
        user: &ruma::UserId,
        device: &ruma::DeviceId,
        event_type: &str,
        content: Value,
    ) -> Result<()> {
        let mut messages: BTreeMap<OwnedUserId, BTreeMap<String, Value>> = BTreeMap::new();
        messages
            .entry(user.to_owned())
            .or_default()
            .insert(device.to_string(), content);

        let txn = TransactionId::new();
        let _: serde_json::Value = self
            .inner
            .http
            .put(
                &format!("/_matrix/client/r0/sendToDevice/{event_type}/{txn}"),
                &SendToDeviceRequest { messages },
            )
            .await?;

        Ok(())
    }
}

fn flow_id_of(event: &Event) -> Option<String> {
    event
        .content
        .get("transaction_id")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .or_else(|| {
            event
                .content
                .get("m.relates_to")
                .and_then(|r| r.get("event_id"))
                .and_then(Value::as_str)
                .map(ToOwned::to_owned)
        })
}
