//! Voice call controller.
//!
//! Two call-control chains drive every call. Outbound: staff initiates, the
//! gateway rings the staff device carrying a signed bridge token, and the
//! bridge webhook dials the client. Inbound: the owner's device is dialed
//! and a miss falls back to live support, then voicemail, then hangup. All
//! transitions arrive as asynchronous provider webhooks and are applied
//! last-write-wins; the one no-answer support escalation per call is
//! guarded by an atomic metadata claim.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::agency::AgencyConfig;
use crate::error::{DatabaseError, Error, RoutingError, TransportError};
use crate::gateway::{CallRequest, VoiceGateway};
use crate::markup::{DialRecord, VoiceAction, VoiceResponse};
use crate::phone;
use crate::routing;
use crate::store::{
    CallLog, CallLogPatch, CallStatus, Direction, NewCallLog, Store, User, UserCallSettings,
};
use crate::voice::token::{BridgeClaims, TokenSigner};

const VOICEMAIL_MAX_SECONDS: u32 = 180;
const VOICEMAIL_SILENCE_TIMEOUT_SECONDS: u32 = 5;
const DEFAULT_VOICEMAIL_GREETING: &str =
    "Sorry we missed your call. Please leave a message after the tone.";

const APOLOGY_UNVERIFIED: &str = "We could not verify this call session.";
const APOLOGY_GONE: &str = "This call is no longer available.";
const APOLOGY_MISSING_ROUTING: &str =
    "We could not place this call due to missing routing information.";
const APOLOGY_CANNOT_PROCESS: &str = "We could not process your call.";
const APOLOGY_NOT_CONFIGURED: &str = "This number is not configured for voice calls.";
const APOLOGY_NOT_ACCEPTING: &str =
    "The person you are trying to reach is not accepting calls right now.";
const APOLOGY_UNAVAILABLE: &str = "The person you are trying to reach is unavailable.";

/// Why starting an outbound call was refused.
#[derive(Debug, thiserror::Error)]
pub enum StartCallError {
    #[error("User not found")]
    UserNotFound,

    #[error("Client not found")]
    ClientNotFound,

    #[error("Client does not have a contact phone assigned")]
    ClientHasNoPhone,

    #[error("Outbound calls are disabled in your call settings")]
    OutboundDisabled,

    #[error("No staff forwarding phone is set")]
    NoForwardingPhone,

    #[error(transparent)]
    Routing(RoutingError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("Call creation failed: {0}")]
    Transport(TransportError),
}

/// Status fields a provider webhook may carry.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub provider_call_id: Option<String>,
    pub parent_call_id: Option<String>,
    pub status: Option<String>,
    pub duration_seconds: Option<i64>,
}

/// Recording fields from the voicemail-complete webhook.
#[derive(Debug, Clone, Default)]
pub struct RecordingComplete {
    pub recording_id: Option<String>,
    pub recording_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub status: Option<String>,
    pub transcription: Option<String>,
}

pub struct VoiceCallController {
    store: Arc<Store>,
    voice: Arc<dyn VoiceGateway>,
    signer: TokenSigner,
    /// Public base under which the voice webhooks are reachable,
    /// e.g. `https://host.example.com/webhooks/voice`.
    webhook_base: String,
}

impl VoiceCallController {
    pub fn new(
        store: Arc<Store>,
        voice: Arc<dyn VoiceGateway>,
        signer: TokenSigner,
        webhook_base: String,
    ) -> Self {
        Self {
            store,
            voice,
            signer,
            webhook_base: webhook_base.trim_end_matches('/').to_string(),
        }
    }

    fn webhook_url(&self, path: &str, call_log_id: &str) -> String {
        format!("{}/{path}?callLogId={call_log_id}", self.webhook_base)
    }

    async fn agency_voice_config(&self, agency_id: Option<&str>) -> Result<AgencyConfig, DatabaseError> {
        match agency_id {
            Some(id) => self.store.agency_config(id).await,
            None => Ok(AgencyConfig::default()),
        }
    }

    fn support_phone(&self, config: &AgencyConfig, agency_phone: Option<&str>) -> Option<String> {
        config
            .voice_support_fallback_phone
            .as_deref()
            .or(agency_phone)
            .and_then(phone::normalize)
    }

    fn staff_target_phone(user: &User, settings: &UserCallSettings) -> Option<String> {
        settings
            .forward_to_phone
            .as_deref()
            .or_else(|| user.contact_phone())
            .and_then(phone::normalize)
    }

    // ── Outbound chain ──────────────────────────────────────────────

    /// Staff-initiated call: ring the staff device first, carrying the
    /// signed token the bridge step validates before dialing the client.
    pub async fn start_outbound_call(
        &self,
        user_id: &str,
        client_id: &str,
        requested_number_id: Option<&str>,
    ) -> Result<CallLog, StartCallError> {
        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or(StartCallError::UserNotFound)?;
        let client = self
            .store
            .find_client(client_id)
            .await?
            .ok_or(StartCallError::ClientNotFound)?;
        let client_phone = client
            .contact_phone
            .as_deref()
            .and_then(phone::normalize)
            .ok_or(StartCallError::ClientHasNoPhone)?;

        let settings = self.store.user_call_settings(user_id).await?;
        if !settings.outbound_enabled {
            return Err(StartCallError::OutboundDisabled);
        }
        let staff_phone =
            Self::staff_target_phone(&user, &settings).ok_or(StartCallError::NoForwardingPhone)?;

        let resolved = routing::resolve_outbound_number(
            &self.store,
            user_id,
            Some(client_id),
            requested_number_id,
        )
        .await
        .map_err(|e| match e {
            Error::Routing(r) => StartCallError::Routing(r),
            Error::Database(d) => StartCallError::Database(d),
            other => {
                warn!(error = %other, "Unexpected resolver failure");
                StartCallError::Routing(RoutingError::NoNumberAvailable)
            }
        })?;

        let call_id = self
            .store
            .insert_call_log(
                Direction::Outbound,
                CallStatus::Initiated,
                NewCallLog {
                    agency_id: client.agency_id.clone(),
                    number_id: Some(resolved.number.id.clone()),
                    user_id: Some(user_id.to_string()),
                    client_id: Some(client_id.to_string()),
                    from_number: Some(resolved.number.phone_number.clone()),
                    to_number: Some(client_phone.clone()),
                    target_phone: Some(staff_phone.clone()),
                    metadata: Some(serde_json::json!({
                        "ownerType": resolved.owner_type.as_str(),
                    })),
                    ..Default::default()
                },
            )
            .await?;

        let token = self.signer.sign(&BridgeClaims {
            call_log_id: call_id.clone(),
            user_id: user_id.to_string(),
            client_id: Some(client_id.to_string()),
            from_number: resolved.number.phone_number.clone(),
            to_number: client_phone,
            issued_at: Utc::now().timestamp(),
        });
        let bridge_url = format!(
            "{}/outbound-bridge?token={}",
            self.webhook_base,
            urlencode(&token)
        );

        match self
            .voice
            .create_call(CallRequest {
                to: staff_phone,
                from: resolved.number.phone_number.clone(),
                webhook_url: bridge_url,
                status_callback_url: Some(self.webhook_url("status", &call_id)),
                record: settings.allow_call_recording,
            })
            .await
        {
            Ok(receipt) => {
                self.store
                    .update_call_log(
                        &call_id,
                        CallLogPatch {
                            provider_call_id: receipt.provider_call_id,
                            status: receipt
                                .status
                                .as_deref()
                                .map(CallStatus::from_provider)
                                .or(Some(CallStatus::Queued)),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            Err(e) => {
                self.store
                    .update_call_log(
                        &call_id,
                        CallLogPatch {
                            status: Some(CallStatus::Failed),
                            ended_at: Some(Utc::now()),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(StartCallError::Transport(e));
            }
        }

        self.store
            .find_call_log(&call_id)
            .await?
            .ok_or_else(|| {
                DatabaseError::NotFound {
                    entity: "call_log".to_string(),
                    id: call_id,
                }
                .into()
            })
    }

    /// Bridge webhook: the staff device answered. Validate the token and
    /// dial the client; any validation failure apologizes and hangs up
    /// without connecting anywhere.
    pub async fn outbound_bridge(&self, token: Option<&str>, provider_call_id: Option<&str>) -> VoiceResponse {
        let Some(claims) = token.and_then(|t| self.signer.verify(t)) else {
            return VoiceResponse::apologize_and_hangup(APOLOGY_UNVERIFIED);
        };
        match self.bridge_with_claims(&claims, provider_call_id).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, call = %claims.call_log_id, "Bridge step failed");
                VoiceResponse::apologize_and_hangup(APOLOGY_GONE)
            }
        }
    }

    async fn bridge_with_claims(
        &self,
        claims: &BridgeClaims,
        provider_call_id: Option<&str>,
    ) -> Result<VoiceResponse, DatabaseError> {
        let Some(call) = self.store.find_call_log(&claims.call_log_id).await? else {
            return Ok(VoiceResponse::apologize_and_hangup(APOLOGY_GONE));
        };
        let (Some(to_number), Some(from_number)) = (
            phone::normalize(&claims.to_number),
            phone::normalize(&claims.from_number),
        ) else {
            return Ok(VoiceResponse::apologize_and_hangup(APOLOGY_MISSING_ROUTING));
        };

        self.store
            .update_call_log(
                &call.id,
                CallLogPatch {
                    status: Some(CallStatus::Bridging),
                    answered_at: Some(Utc::now()),
                    parent_call_id: provider_call_id.map(str::to_string),
                    ..Default::default()
                },
            )
            .await?;

        let settings = match call.user_id.as_deref() {
            Some(user_id) => self.store.user_call_settings(user_id).await?,
            None => UserCallSettings::default(),
        };
        let config = self.agency_voice_config(call.agency_id.as_deref()).await?;

        debug!(call = %call.id, "Bridging to client");
        Ok(VoiceResponse::new()
            .say(config.provider_pre_connect_message())
            .dial(VoiceAction::Dial {
                number: to_number,
                caller_id: Some(from_number),
                action_url: Some(self.webhook_url("dial-complete", &call.id)),
                timeout_seconds: Some(config.ring_timeout_seconds()),
                record: if settings.allow_call_recording {
                    DialRecord::FromAnswer
                } else {
                    DialRecord::Off
                },
            }))
    }

    // ── Inbound chain ───────────────────────────────────────────────

    /// Inbound call webhook: resolve the owner and ring their device.
    pub async fn inbound_call(
        &self,
        from: Option<&str>,
        to: Option<&str>,
        provider_call_id: Option<&str>,
    ) -> VoiceResponse {
        let (Some(from), Some(to)) = (from, to) else {
            return VoiceResponse::apologize_and_hangup(APOLOGY_CANNOT_PROCESS);
        };
        match self.handle_inbound_call(from, to, provider_call_id).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Inbound call handling failed");
                VoiceResponse::apologize_and_hangup(APOLOGY_CANNOT_PROCESS)
            }
        }
    }

    async fn handle_inbound_call(
        &self,
        from: &str,
        to: &str,
        provider_call_id: Option<&str>,
    ) -> Result<VoiceResponse, DatabaseError> {
        let route = routing::resolve_inbound_route(&self.store, to, from).await?;
        let Some(owner) = &route.owner_user else {
            return Ok(VoiceResponse::apologize_and_hangup(APOLOGY_NOT_CONFIGURED));
        };

        let settings = self.store.user_call_settings(&owner.id).await?;
        if !settings.inbound_enabled {
            return Ok(VoiceResponse::apologize_and_hangup(APOLOGY_NOT_ACCEPTING));
        }
        let Some(target_phone) = Self::staff_target_phone(owner, &settings) else {
            return Ok(VoiceResponse::apologize_and_hangup(APOLOGY_UNAVAILABLE));
        };

        let call_id = self
            .store
            .insert_call_log(
                Direction::Inbound,
                CallStatus::InboundReceived,
                NewCallLog {
                    agency_id: route.agency_id.clone(),
                    number_id: route.number_id().map(str::to_string),
                    user_id: Some(owner.id.clone()),
                    client_id: route.client_id().map(str::to_string),
                    from_number: Some(from.to_string()),
                    to_number: Some(to.to_string()),
                    target_phone: Some(target_phone.clone()),
                    provider_call_id: provider_call_id.map(str::to_string),
                    metadata: Some(serde_json::json!({
                        "ownerType": route.owner_type.map(|t| t.as_str()),
                    })),
                },
            )
            .await?;

        let config = self.agency_voice_config(route.agency_id.as_deref()).await?;
        debug!(call = %call_id, owner = %owner.id, "Dialing owner for inbound call");
        Ok(VoiceResponse::new()
            .say(config.provider_pre_connect_message())
            .dial(VoiceAction::Dial {
                number: target_phone,
                caller_id: phone::normalize(to),
                action_url: Some(self.webhook_url("dial-complete", &call_id)),
                timeout_seconds: Some(config.ring_timeout_seconds()),
                record: if settings.allow_call_recording {
                    DialRecord::FromAnswer
                } else {
                    DialRecord::Off
                },
            }))
    }

    // ── Completion & status webhooks ────────────────────────────────

    /// Dial-complete webhook: the dial leg finished. For a missed inbound
    /// call, fall back to live support, then voicemail, then hangup.
    pub async fn dial_complete(&self, call_log_id: Option<&str>, update: StatusUpdate) -> VoiceResponse {
        match self.handle_dial_complete(call_log_id, update).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Dial-complete handling failed");
                VoiceResponse::new().hangup()
            }
        }
    }

    async fn handle_dial_complete(
        &self,
        call_log_id: Option<&str>,
        update: StatusUpdate,
    ) -> Result<VoiceResponse, DatabaseError> {
        let mut call = None;
        let mut status = CallStatus::Other;
        if let Some(id) = call_log_id {
            call = self.store.find_call_log(id).await?;
            if call.is_some() {
                status = update
                    .status
                    .as_deref()
                    .map(CallStatus::from_provider)
                    .unwrap_or(CallStatus::Other);
                self.store
                    .update_call_log(
                        id,
                        CallLogPatch {
                            provider_call_id: update.provider_call_id.clone(),
                            status: Some(status),
                            duration_seconds: update.duration_seconds,
                            ended_at: status.is_terminal().then(Utc::now),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
        }

        let Some(call) = call else {
            return Ok(VoiceResponse::new().hangup());
        };
        if call.direction != Direction::Inbound || !status.is_missed() {
            return Ok(VoiceResponse::new().hangup());
        }

        // Missed inbound call: live support first.
        let config = self.agency_voice_config(call.agency_id.as_deref()).await?;
        let agency_phone = match call.agency_id.as_deref() {
            Some(id) => self.store.find_agency(id).await?.and_then(|a| a.phone_number),
            None => None,
        };
        if let Some(support_phone) = self.support_phone(&config, agency_phone.as_deref()) {
            debug!(call = %call.id, "Connecting missed inbound call to support");
            return Ok(VoiceResponse::new()
                .say(config.support_pre_connect_message())
                .dial(VoiceAction::Dial {
                    number: support_phone,
                    caller_id: call.to_number.clone(),
                    action_url: None,
                    timeout_seconds: None,
                    record: DialRecord::Off,
                }));
        }

        // Then the owner's voicemail.
        let settings = match call.user_id.as_deref() {
            Some(user_id) => self.store.user_call_settings(user_id).await?,
            None => UserCallSettings::default(),
        };
        if settings.voicemail_enabled {
            let greeting = settings
                .voicemail_message
                .as_deref()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_VOICEMAIL_GREETING);
            debug!(call = %call.id, "Recording voicemail for missed inbound call");
            return Ok(VoiceResponse::new()
                .say(greeting)
                .record(
                    &self.webhook_url("voicemail-complete", &call.id),
                    VOICEMAIL_MAX_SECONDS,
                    VOICEMAIL_SILENCE_TIMEOUT_SECONDS,
                )
                .hangup());
        }

        Ok(VoiceResponse::new().hangup())
    }

    /// Pure status callback. Applies the update last-write-wins and, for an
    /// outbound call that ended `no-answer`, places the one-shot follow-up
    /// call to support.
    pub async fn status_update(&self, call_log_id: Option<&str>, update: StatusUpdate) {
        if let Err(e) = self.handle_status_update(call_log_id, update).await {
            warn!(error = %e, "Status webhook handling failed");
        }
    }

    async fn handle_status_update(
        &self,
        call_log_id: Option<&str>,
        update: StatusUpdate,
    ) -> Result<(), DatabaseError> {
        let mut target = None;
        if let Some(id) = call_log_id {
            target = self.store.find_call_log(id).await?;
        }
        if target.is_none() {
            if let Some(sid) = update.provider_call_id.as_deref() {
                target = self.store.find_call_by_provider_id(sid).await?;
            }
        }
        if target.is_none() {
            if let Some(parent) = update.parent_call_id.as_deref() {
                target = self.store.find_call_by_provider_id(parent).await?;
            }
        }
        let Some(call) = target else {
            return Ok(());
        };

        let status = update.status.as_deref().map(CallStatus::from_provider);
        self.store
            .update_call_log(
                &call.id,
                CallLogPatch {
                    provider_call_id: update.provider_call_id,
                    parent_call_id: update.parent_call_id,
                    status,
                    duration_seconds: update.duration_seconds,
                    ended_at: status
                        .map(|s| s.is_terminal())
                        .unwrap_or(false)
                        .then(Utc::now),
                    ..Default::default()
                },
            )
            .await?;

        if call.direction == Direction::Outbound && status == Some(CallStatus::NoAnswer) {
            self.escalate_missed_outbound(&call).await?;
        }
        Ok(())
    }

    /// Exactly once per call: the atomic metadata claim wins over duplicate
    /// status webhooks; a lost claim means someone else already escalated.
    async fn escalate_missed_outbound(&self, call: &CallLog) -> Result<(), DatabaseError> {
        let config = self.agency_voice_config(call.agency_id.as_deref()).await?;
        let agency_phone = match call.agency_id.as_deref() {
            Some(id) => self.store.find_agency(id).await?.and_then(|a| a.phone_number),
            None => None,
        };
        let Some(support_phone) = self.support_phone(&config, agency_phone.as_deref()) else {
            return Ok(());
        };
        let Some(from_number) = call.from_number.clone() else {
            return Ok(());
        };

        if !self.store.claim_support_escalation(&call.id).await? {
            debug!(call = %call.id, "Support escalation already triggered");
            return Ok(());
        }

        match self
            .voice
            .create_call(CallRequest {
                to: support_phone,
                from: from_number,
                webhook_url: self.webhook_url("support-notice", &call.id),
                status_callback_url: Some(self.webhook_url("status", &call.id)),
                record: false,
            })
            .await
        {
            Ok(_) => debug!(call = %call.id, "Support follow-up call placed"),
            Err(e) => warn!(error = %e, call = %call.id, "Support follow-up call failed"),
        }
        Ok(())
    }

    /// Support-notice webhook: speak the pre-recorded notice to support.
    pub async fn support_notice(&self, call_log_id: Option<&str>) -> VoiceResponse {
        let agency_id = match call_log_id {
            Some(id) => match self.store.find_call_log(id).await {
                Ok(call) => call.and_then(|c| c.agency_id),
                Err(e) => {
                    warn!(error = %e, "Support-notice lookup failed");
                    None
                }
            },
            None => None,
        };
        let config = self
            .agency_voice_config(agency_id.as_deref())
            .await
            .unwrap_or_default();
        VoiceResponse::new().say(config.support_notice_message()).hangup()
    }

    /// Recording-complete webhook: persist the voicemail and mark the call.
    pub async fn voicemail_complete(
        &self,
        call_log_id: Option<&str>,
        recording: RecordingComplete,
    ) -> VoiceResponse {
        if let Err(e) = self.handle_voicemail_complete(call_log_id, recording).await {
            warn!(error = %e, "Voicemail-complete handling failed");
        }
        VoiceResponse::new().hangup()
    }

    async fn handle_voicemail_complete(
        &self,
        call_log_id: Option<&str>,
        recording: RecordingComplete,
    ) -> Result<(), DatabaseError> {
        let (Some(id), Some(recording_id)) = (call_log_id, recording.recording_id.as_deref())
        else {
            return Ok(());
        };
        let Some(call) = self.store.find_call_log(id).await? else {
            return Ok(());
        };

        let voicemail_id = self
            .store
            .insert_voicemail(
                &call,
                Some(recording_id),
                recording.recording_url.as_deref(),
                recording.duration_seconds,
                recording.status.as_deref().unwrap_or("completed"),
            )
            .await?;
        if let Some(transcription) = recording
            .transcription
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            self.store
                .set_voicemail_transcription(&voicemail_id, transcription)
                .await?;
        }
        self.store
            .update_call_log(
                &call.id,
                CallLogPatch {
                    status: Some(CallStatus::VoicemailRecorded),
                    ended_at: Some(Utc::now()),
                    metadata: Some(serde_json::json!({
                        "voicemailId": voicemail_id,
                        "voicemailRecordingId": recording_id,
                    })),
                    ..Default::default()
                },
            )
            .await?;
        debug!(call = %call.id, voicemail = %voicemail_id, "Voicemail recorded");
        Ok(())
    }
}

/// Percent-encode a token for use in a query string. Tokens are base64url
/// plus `.`, so only a handful of characters ever need escaping.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::CallReceipt;
    use async_trait::async_trait;
    use secrecy::SecretString;
    use tokio::sync::Mutex;

    struct StubVoice {
        calls: Mutex<Vec<CallRequest>>,
        fail: bool,
    }

    impl StubVoice {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl VoiceGateway for StubVoice {
        async fn create_call(&self, request: CallRequest) -> Result<CallReceipt, TransportError> {
            if self.fail {
                return Err(TransportError::CallCreateFailed {
                    to: request.to.clone(),
                    reason: "stub".into(),
                });
            }
            self.calls.lock().await.push(request);
            Ok(CallReceipt {
                provider_call_id: Some("CA1".into()),
                status: Some("queued".into()),
            })
        }
    }

    struct Fixture {
        store: Arc<Store>,
        voice: Arc<StubVoice>,
        controller: VoiceCallController,
        agency: String,
        user: String,
        client: String,
    }

    async fn fixture(fail_calls: bool) -> Fixture {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let agency = store.insert_agency("A", None, None).await.unwrap();
        let number = store.insert_number(&agency, "4155550100").await.unwrap();
        let user = store
            .insert_user("Ana", Some("Reed"), "provider", Some("4155550002"), None)
            .await
            .unwrap();
        store.add_user_to_agency(&user, &agency).await.unwrap();
        store.assign_number(&number, &user, true).await.unwrap();
        let client = store
            .insert_client(Some(&agency), Some(&user), Some("C.D."), Some("4155550001"))
            .await
            .unwrap();

        let voice = StubVoice::new(fail_calls);
        let controller = VoiceCallController::new(
            Arc::clone(&store),
            voice.clone(),
            TokenSigner::new(SecretString::from("test-secret")),
            "https://x.test/webhooks/voice".to_string(),
        );
        Fixture {
            store,
            voice,
            controller,
            agency,
            user,
            client,
        }
    }

    #[tokio::test]
    async fn outbound_call_rings_staff_with_signed_bridge_url() {
        let f = fixture(false).await;
        let call = f
            .controller
            .start_outbound_call(&f.user, &f.client, None)
            .await
            .unwrap();
        assert_eq!(call.status, CallStatus::Queued);
        assert_eq!(call.target_phone.as_deref(), Some("+14155550002"));
        assert_eq!(call.provider_call_id.as_deref(), Some("CA1"));

        let placed = f.voice.calls.lock().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].to, "+14155550002");
        assert!(placed[0].webhook_url.contains("/outbound-bridge?token="));
    }

    #[tokio::test]
    async fn outbound_disabled_is_refused() {
        let f = fixture(false).await;
        let mut settings = UserCallSettings::default();
        settings.outbound_enabled = false;
        f.store.upsert_user_call_settings(&f.user, &settings).await.unwrap();

        let err = f
            .controller
            .start_outbound_call(&f.user, &f.client, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StartCallError::OutboundDisabled));
    }

    #[tokio::test]
    async fn bridge_requires_a_valid_token() {
        let f = fixture(false).await;
        let xml = f.controller.outbound_bridge(None, None).await.to_xml();
        assert!(xml.contains(APOLOGY_UNVERIFIED));
        assert!(xml.contains("<Hangup/>"));

        let xml = f
            .controller
            .outbound_bridge(Some("bogus.token"), None)
            .await
            .to_xml();
        assert!(xml.contains(APOLOGY_UNVERIFIED));
    }

    #[tokio::test]
    async fn bridge_dials_client_and_marks_bridging() {
        let f = fixture(false).await;
        let call = f
            .controller
            .start_outbound_call(&f.user, &f.client, None)
            .await
            .unwrap();
        let placed = f.voice.calls.lock().await;
        let token = placed[0]
            .webhook_url
            .split("token=")
            .nth(1)
            .unwrap()
            .to_string();
        drop(placed);

        let xml = f
            .controller
            .outbound_bridge(Some(&token), Some("CAparent"))
            .await
            .to_xml();
        assert!(xml.contains("<Number>+14155550001</Number>"));
        assert!(xml.contains("callerId=\"+14155550100\""));
        assert!(xml.contains(&format!("dial-complete?callLogId={}", call.id)));

        let updated = f.store.find_call_log(&call.id).await.unwrap().unwrap();
        assert_eq!(updated.status, CallStatus::Bridging);
        assert_eq!(updated.parent_call_id.as_deref(), Some("CAparent"));
        assert!(updated.answered_at.is_some());
    }

    #[tokio::test]
    async fn no_answer_escalates_to_support_exactly_once() {
        let f = fixture(false).await;
        f.store
            .set_agency_flags(&f.agency, r#"{"voiceSupportFallbackPhone": "4155550888"}"#)
            .await
            .unwrap();
        let call = f
            .controller
            .start_outbound_call(&f.user, &f.client, None)
            .await
            .unwrap();
        f.voice.calls.lock().await.clear();

        let update = StatusUpdate {
            status: Some("no-answer".to_string()),
            duration_seconds: Some(0),
            ..Default::default()
        };
        f.controller.status_update(Some(&call.id), update.clone()).await;

        let placed = f.voice.calls.lock().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].to, "+14155550888");
        assert!(placed[0].webhook_url.contains("support-notice"));
        drop(placed);

        // A duplicate no-answer webhook does not place a second call.
        f.controller.status_update(Some(&call.id), update).await;
        assert_eq!(f.voice.calls.lock().await.len(), 1);

        let updated = f.store.find_call_log(&call.id).await.unwrap().unwrap();
        assert_eq!(updated.status, CallStatus::NoAnswer);
        assert!(updated.ended_at.is_some());
    }

    #[tokio::test]
    async fn no_answer_without_support_phone_does_not_escalate() {
        let f = fixture(false).await;
        let call = f
            .controller
            .start_outbound_call(&f.user, &f.client, None)
            .await
            .unwrap();
        f.voice.calls.lock().await.clear();

        f.controller
            .status_update(
                Some(&call.id),
                StatusUpdate {
                    status: Some("no-answer".to_string()),
                    ..Default::default()
                },
            )
            .await;
        assert!(f.voice.calls.lock().await.is_empty());
        // No claim burned: a support number configured later could still
        // escalate on a retry.
        assert!(f.store.claim_support_escalation(&call.id).await.unwrap());
    }

    #[tokio::test]
    async fn inbound_call_dials_owner() {
        let f = fixture(false).await;
        let xml = f
            .controller
            .inbound_call(Some("4155550001"), Some("4155550100"), Some("CAin"))
            .await
            .to_xml();
        assert!(xml.contains("<Number>+14155550002</Number>"));
        assert!(xml.contains("dial-complete?callLogId="));
    }

    #[tokio::test]
    async fn inbound_call_without_owner_apologizes() {
        let f = fixture(false).await;
        let xml = f
            .controller
            .inbound_call(Some("4155550001"), Some("4155559999"), None)
            .await
            .to_xml();
        assert!(xml.contains(APOLOGY_NOT_CONFIGURED));
        assert!(xml.contains("<Hangup/>"));
    }

    #[tokio::test]
    async fn inbound_disabled_apologizes() {
        let f = fixture(false).await;
        let mut settings = UserCallSettings::default();
        settings.inbound_enabled = false;
        f.store.upsert_user_call_settings(&f.user, &settings).await.unwrap();

        let xml = f
            .controller
            .inbound_call(Some("4155550001"), Some("4155550100"), None)
            .await
            .to_xml();
        assert!(xml.contains(APOLOGY_NOT_ACCEPTING));
    }

    async fn inbound_call_id(f: &Fixture) -> String {
        f.controller
            .inbound_call(Some("4155550001"), Some("4155550100"), Some("CAin"))
            .await;
        // The freshly created inbound call is the only one.
        let call = f.store.find_call_by_provider_id("CAin").await.unwrap().unwrap();
        call.id
    }

    #[tokio::test]
    async fn missed_inbound_connects_to_support_when_configured() {
        let f = fixture(false).await;
        f.store
            .set_agency_flags(&f.agency, r#"{"voiceSupportFallbackPhone": "4155550888"}"#)
            .await
            .unwrap();
        let call_id = inbound_call_id(&f).await;

        let xml = f
            .controller
            .dial_complete(
                Some(&call_id),
                StatusUpdate {
                    status: Some("no-answer".to_string()),
                    ..Default::default()
                },
            )
            .await
            .to_xml();
        assert!(xml.contains("<Number>+14155550888</Number>"));
        assert!(xml.contains("Please hold while we connect you to support."));
    }

    #[tokio::test]
    async fn missed_inbound_falls_back_to_voicemail() {
        let f = fixture(false).await;
        let mut settings = UserCallSettings::default();
        settings.voicemail_enabled = true;
        settings.voicemail_message = Some("Leave a message for Ana.".to_string());
        f.store.upsert_user_call_settings(&f.user, &settings).await.unwrap();
        let call_id = inbound_call_id(&f).await;

        let xml = f
            .controller
            .dial_complete(
                Some(&call_id),
                StatusUpdate {
                    status: Some("busy".to_string()),
                    ..Default::default()
                },
            )
            .await
            .to_xml();
        assert!(xml.contains("Leave a message for Ana."));
        assert!(xml.contains("maxLength=\"180\""));
        assert!(xml.contains(&format!("voicemail-complete?callLogId={call_id}")));
    }

    #[tokio::test]
    async fn missed_inbound_without_fallbacks_hangs_up() {
        let f = fixture(false).await;
        let call_id = inbound_call_id(&f).await;

        let xml = f
            .controller
            .dial_complete(
                Some(&call_id),
                StatusUpdate {
                    status: Some("failed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .to_xml();
        assert_eq!(
            xml,
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Hangup/></Response>"
        );
    }

    #[tokio::test]
    async fn answered_inbound_just_hangs_up() {
        let f = fixture(false).await;
        f.store
            .set_agency_flags(&f.agency, r#"{"voiceSupportFallbackPhone": "4155550888"}"#)
            .await
            .unwrap();
        let call_id = inbound_call_id(&f).await;

        let xml = f
            .controller
            .dial_complete(
                Some(&call_id),
                StatusUpdate {
                    status: Some("completed".to_string()),
                    duration_seconds: Some(95),
                    ..Default::default()
                },
            )
            .await
            .to_xml();
        assert!(!xml.contains("<Number>"));
        let call = f.store.find_call_log(&call_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Completed);
        assert_eq!(call.duration_seconds, Some(95));
    }

    #[tokio::test]
    async fn voicemail_complete_creates_row_and_marks_call() {
        let f = fixture(false).await;
        let call_id = inbound_call_id(&f).await;

        let xml = f
            .controller
            .voicemail_complete(
                Some(&call_id),
                RecordingComplete {
                    recording_id: Some("RE1".to_string()),
                    recording_url: Some("https://r.test/RE1".to_string()),
                    duration_seconds: Some(42),
                    status: Some("completed".to_string()),
                    transcription: Some("call me back".to_string()),
                },
            )
            .await
            .to_xml();
        assert!(xml.contains("<Hangup/>"));

        let call = f.store.find_call_log(&call_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::VoicemailRecorded);
        let vm = f.store.find_voicemail_for_call(&call_id).await.unwrap().unwrap();
        assert_eq!(vm.recording_id.as_deref(), Some("RE1"));
        assert_eq!(vm.transcription.as_deref(), Some("call me back"));
    }

    #[tokio::test]
    async fn support_notice_speaks_agency_message() {
        let f = fixture(false).await;
        f.store
            .set_agency_flags(
                &f.agency,
                r#"{"voiceSupportFallbackMessage": "A callback was missed. Call the client back."}"#,
            )
            .await
            .unwrap();
        let call = f
            .controller
            .start_outbound_call(&f.user, &f.client, None)
            .await
            .unwrap();

        let xml = f.controller.support_notice(Some(&call.id)).await.to_xml();
        assert!(xml.contains("A callback was missed. Call the client back."));
        assert!(xml.contains("<Hangup/>"));
    }

    #[tokio::test]
    async fn failed_call_creation_marks_log_failed() {
        let f = fixture(true).await;
        let err = f
            .controller
            .start_outbound_call(&f.user, &f.client, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StartCallError::Transport(_)));
    }

    #[test]
    fn urlencode_escapes_non_unreserved() {
        assert_eq!(urlencode("abc.DEF-123_~"), "abc.DEF-123_~");
        assert_eq!(urlencode("a+b/c="), "a%2Bb%2Fc%3D");
    }
}
