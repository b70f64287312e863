//! Webhook and REST surface.
//!
//! Provider webhooks answer call-control markup and, by contract, always
//! HTTP 200 (a non-2xx triggers provider retries and duplicate side
//! effects). The only 400 is a malformed SMS webhook missing `From`/`To`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Form, Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::error::RoutingError;
use crate::gateway::{SmsGateway, VoiceGateway};
use crate::markup;
use crate::notify::NotificationDispatcher;
use crate::sms::inbound::{InboundMessageRouter, InboundSms};
use crate::sms::outbound::{self, SendError};
use crate::store::Store;
use crate::voice::controller::{
    RecordingComplete, StartCallError, StatusUpdate, VoiceCallController,
};
use crate::voice::token::TokenSigner;

pub struct AppState {
    pub store: Arc<Store>,
    pub sms_gateway: Arc<dyn SmsGateway>,
    pub sms_router: InboundMessageRouter,
    pub voice: VoiceCallController,
    pub dispatcher: Arc<NotificationDispatcher>,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        sms_gateway: Arc<dyn SmsGateway>,
        voice_gateway: Arc<dyn VoiceGateway>,
        signer: TokenSigner,
        voice_webhook_base: String,
        notifications_from: Option<String>,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&sms_gateway),
            notifications_from,
        ));
        let sms_router = InboundMessageRouter::new(
            Arc::clone(&store),
            Arc::clone(&sms_gateway),
            Arc::clone(&dispatcher),
        );
        let voice = VoiceCallController::new(
            Arc::clone(&store),
            voice_gateway,
            signer,
            voice_webhook_base,
        );
        Arc::new(Self {
            store,
            sms_gateway,
            sms_router,
            voice,
            dispatcher,
        })
    }
}

/// Build the full router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/sms/inbound", post(inbound_sms))
        .route("/webhooks/voice/inbound", post(inbound_voice))
        .route("/webhooks/voice/outbound-bridge", post(outbound_bridge))
        .route("/webhooks/voice/dial-complete", post(dial_complete))
        .route("/webhooks/voice/status", post(voice_status))
        .route("/webhooks/voice/support-notice", post(support_notice))
        .route("/webhooks/voice/voicemail-complete", post(voicemail_complete))
        .route("/api/messages/send", post(send_message))
        .route("/api/calls/start", post(start_call))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn xml_response(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

// ── SMS webhook ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SmsWebhookForm {
    #[serde(rename = "From")]
    from: Option<String>,
    #[serde(rename = "To")]
    to: Option<String>,
    #[serde(rename = "Body")]
    body: Option<String>,
    #[serde(rename = "MessageSid")]
    message_sid: Option<String>,
}

async fn inbound_sms(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SmsWebhookForm>,
) -> Response {
    let (Some(from), Some(to)) = (form.from, form.to) else {
        return (StatusCode::BAD_REQUEST, "Missing From/To").into_response();
    };
    let reply = state
        .sms_router
        .handle(&InboundSms {
            from,
            to,
            body: form.body.unwrap_or_default(),
            provider_message_id: form.message_sid,
        })
        .await;
    xml_response(markup::sms_reply(&reply))
}

// ── Voice webhooks ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VoiceCallForm {
    #[serde(rename = "From")]
    from: Option<String>,
    #[serde(rename = "To")]
    to: Option<String>,
    #[serde(rename = "CallSid")]
    call_sid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallLogQuery {
    #[serde(rename = "callLogId")]
    call_log_id: Option<String>,
}

/// Dial-outcome and status fields; the provider reports the dialed leg
/// under `Dial*` keys and the parent leg without the prefix.
#[derive(Debug, Deserialize)]
struct CallStatusForm {
    #[serde(rename = "CallSid")]
    call_sid: Option<String>,
    #[serde(rename = "ParentCallSid")]
    parent_call_sid: Option<String>,
    #[serde(rename = "CallStatus")]
    call_status: Option<String>,
    #[serde(rename = "DialCallStatus")]
    dial_call_status: Option<String>,
    #[serde(rename = "CallDuration")]
    call_duration: Option<String>,
    #[serde(rename = "DialCallDuration")]
    dial_call_duration: Option<String>,
    #[serde(rename = "DialCallSid")]
    dial_call_sid: Option<String>,
}

impl CallStatusForm {
    fn dial_update(&self) -> StatusUpdate {
        StatusUpdate {
            provider_call_id: self.dial_call_sid.clone().or_else(|| self.call_sid.clone()),
            parent_call_id: self.parent_call_sid.clone(),
            status: self.dial_call_status.clone().or_else(|| self.call_status.clone()),
            duration_seconds: parse_seconds(
                self.dial_call_duration.as_deref().or(self.call_duration.as_deref()),
            ),
        }
    }

    fn status_update(&self) -> StatusUpdate {
        StatusUpdate {
            provider_call_id: self.call_sid.clone(),
            parent_call_id: self.parent_call_sid.clone(),
            status: self.call_status.clone().or_else(|| self.dial_call_status.clone()),
            duration_seconds: parse_seconds(
                self.call_duration.as_deref().or(self.dial_call_duration.as_deref()),
            ),
        }
    }
}

fn parse_seconds(raw: Option<&str>) -> Option<i64> {
    raw.and_then(|s| s.trim().parse().ok())
}

async fn inbound_voice(
    State(state): State<Arc<AppState>>,
    Form(form): Form<VoiceCallForm>,
) -> Response {
    let response = state
        .voice
        .inbound_call(form.from.as_deref(), form.to.as_deref(), form.call_sid.as_deref())
        .await;
    xml_response(response.to_xml())
}

async fn outbound_bridge(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    Form(form): Form<VoiceCallForm>,
) -> Response {
    let response = state
        .voice
        .outbound_bridge(query.token.as_deref(), form.call_sid.as_deref())
        .await;
    xml_response(response.to_xml())
}

async fn dial_complete(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallLogQuery>,
    Form(form): Form<CallStatusForm>,
) -> Response {
    let response = state
        .voice
        .dial_complete(query.call_log_id.as_deref(), form.dial_update())
        .await;
    xml_response(response.to_xml())
}

async fn voice_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallLogQuery>,
    Form(form): Form<CallStatusForm>,
) -> Response {
    state
        .voice
        .status_update(query.call_log_id.as_deref(), form.status_update())
        .await;
    "ok".into_response()
}

async fn support_notice(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallLogQuery>,
) -> Response {
    let response = state.voice.support_notice(query.call_log_id.as_deref()).await;
    xml_response(response.to_xml())
}

#[derive(Debug, Deserialize)]
struct VoicemailForm {
    #[serde(rename = "RecordingSid")]
    recording_sid: Option<String>,
    #[serde(rename = "RecordingUrl")]
    recording_url: Option<String>,
    #[serde(rename = "RecordingDuration")]
    recording_duration: Option<String>,
    #[serde(rename = "RecordingStatus")]
    recording_status: Option<String>,
    #[serde(rename = "TranscriptionText")]
    transcription_text: Option<String>,
}

async fn voicemail_complete(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallLogQuery>,
    Form(form): Form<VoicemailForm>,
) -> Response {
    let response = state
        .voice
        .voicemail_complete(
            query.call_log_id.as_deref(),
            RecordingComplete {
                recording_id: form.recording_sid,
                recording_url: form.recording_url,
                duration_seconds: parse_seconds(form.recording_duration.as_deref()),
                status: form.recording_status,
                transcription: form.transcription_text,
            },
        )
        .await;
    xml_response(response.to_xml())
}

// ── Thin REST surface ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    user_id: String,
    client_id: String,
    body: String,
    number_id: Option<String>,
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({"error": {"message": message}}))).into_response()
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SendMessageRequest>,
) -> Response {
    let result = outbound::send_message(
        &state.store,
        state.sms_gateway.as_ref(),
        &request.user_id,
        &request.client_id,
        &request.body,
        request.number_id.as_deref(),
    )
    .await;

    match result {
        Ok(log) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": log.id,
                "deliveryStatus": log.delivery_status.as_str(),
                "fromNumber": log.from_number,
                "toNumber": log.to_number,
            })),
        )
            .into_response(),
        Err(e) => {
            let status = match &e {
                SendError::UserNotFound | SendError::ClientNotFound => StatusCode::NOT_FOUND,
                SendError::ClientHasNoPhone => StatusCode::BAD_REQUEST,
                SendError::Routing(RoutingError::NumberUnavailable) => StatusCode::NOT_FOUND,
                SendError::Routing(RoutingError::NoNumberAvailable) => StatusCode::BAD_REQUEST,
                SendError::Routing(_) => StatusCode::FORBIDDEN,
                SendError::ThreadReadOnly
                | SendError::ClientOptedOut
                | SendError::OptInRequired => StatusCode::FORBIDDEN,
                SendError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
                SendError::Transport(_) => StatusCode::BAD_GATEWAY,
            };
            error_json(status, &e.to_string())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartCallRequest {
    user_id: String,
    client_id: String,
    number_id: Option<String>,
}

async fn start_call(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartCallRequest>,
) -> Response {
    let result = state
        .voice
        .start_outbound_call(&request.user_id, &request.client_id, request.number_id.as_deref())
        .await;

    match result {
        Ok(call) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "id": call.id,
                "status": call.status.as_str(),
                "targetPhone": call.target_phone,
                "providerCallId": call.provider_call_id,
            })),
        )
            .into_response(),
        Err(e) => {
            let status = match &e {
                StartCallError::UserNotFound | StartCallError::ClientNotFound => {
                    StatusCode::NOT_FOUND
                }
                StartCallError::ClientHasNoPhone | StartCallError::NoForwardingPhone => {
                    StatusCode::BAD_REQUEST
                }
                StartCallError::OutboundDisabled => StatusCode::FORBIDDEN,
                StartCallError::Routing(RoutingError::NoNumberAvailable) => StatusCode::BAD_REQUEST,
                StartCallError::Routing(RoutingError::NumberUnavailable) => StatusCode::NOT_FOUND,
                StartCallError::Routing(_) => StatusCode::FORBIDDEN,
                StartCallError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
                StartCallError::Transport(_) => StatusCode::BAD_GATEWAY,
            };
            error_json(status, &e.to_string())
        }
    }
}
