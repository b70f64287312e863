//! Integration tests for the webhook + REST surface.
//!
//! Each test spins up an Axum server on a random port with recording
//! gateway stubs and drives the real provider-webhook contract with
//! reqwest: form-encoded SMS/voice callbacks in, call-control markup out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

use switchboard::error::TransportError;
use switchboard::gateway::{
    CallReceipt, CallRequest, SmsGateway, SmsReceipt, SmsRequest, VoiceGateway,
};
use switchboard::http::{AppState, build_router};
use switchboard::store::{CallStatus, OptInSource, OptInStatus, Store, UserCallSettings};
use switchboard::voice::TokenSigner;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Records outbound SMS instead of calling a provider.
struct RecordingSms {
    sent: Mutex<Vec<SmsRequest>>,
}

#[async_trait]
impl SmsGateway for RecordingSms {
    async fn send_sms(&self, request: SmsRequest) -> Result<SmsReceipt, TransportError> {
        self.sent.lock().await.push(request);
        Ok(SmsReceipt {
            provider_message_id: Some("SMtest".into()),
            status: Some("queued".into()),
        })
    }
}

/// Records call-leg creation instead of calling a provider.
struct RecordingVoice {
    calls: Mutex<Vec<CallRequest>>,
}

#[async_trait]
impl VoiceGateway for RecordingVoice {
    async fn create_call(&self, request: CallRequest) -> Result<CallReceipt, TransportError> {
        self.calls.lock().await.push(request);
        Ok(CallReceipt {
            provider_call_id: Some("CAtest".into()),
            status: Some("queued".into()),
        })
    }
}

struct TestServer {
    base: String,
    store: Arc<Store>,
    sms: Arc<RecordingSms>,
    voice: Arc<RecordingVoice>,
}

/// Start the full router on a random port against an in-memory store.
async fn start_server() -> TestServer {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let sms = Arc::new(RecordingSms {
        sent: Mutex::new(Vec::new()),
    });
    let voice = Arc::new(RecordingVoice {
        calls: Mutex::new(Vec::new()),
    });

    let state = AppState::new(
        Arc::clone(&store),
        sms.clone() as Arc<dyn SmsGateway>,
        voice.clone() as Arc<dyn VoiceGateway>,
        TokenSigner::new(SecretString::from("integration-secret")),
        "https://hooks.test/webhooks/voice".to_string(),
        Some("+14155550199".to_string()),
    );
    let app = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        base: format!("http://127.0.0.1:{port}"),
        store,
        sms,
        voice,
    }
}

struct Directory {
    agency: String,
    number: String,
    owner: String,
    client: String,
}

/// One agency with one number assigned to one provider and one client.
async fn seed_directory(store: &Store) -> Directory {
    let agency = store.insert_agency("Bridgepoint", None, None).await.unwrap();
    let number = store.insert_number(&agency, "4155550100").await.unwrap();
    let owner = store
        .insert_user("Ana", Some("Reed"), "provider", Some("4155550002"), None)
        .await
        .unwrap();
    store.add_user_to_agency(&owner, &agency).await.unwrap();
    store.assign_number(&number, &owner, true).await.unwrap();
    let client = store
        .insert_client(Some(&agency), Some(&owner), Some("C.D."), Some("4155550001"))
        .await
        .unwrap();
    Directory {
        agency,
        number,
        owner,
        client,
    }
}

// ── SMS Webhook Tests ────────────────────────────────────────────────

#[tokio::test]
async fn sms_webhook_acknowledges_and_logs() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;
        let d = seed_directory(&srv.store).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/webhooks/sms/inbound", srv.base))
            .form(&[
                ("From", "4155550001"),
                ("To", "4155550100"),
                ("Body", "running late"),
                ("MessageSid", "SMin1"),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers()[reqwest::header::CONTENT_TYPE], "text/xml");
        let body = resp.text().await.unwrap();
        assert!(body.contains("<Message>Thanks. Your message was received.</Message>"));

        // The inbound row is persisted with normalized numbers.
        let thread = srv.store.list_thread(&d.owner, &d.client, 10).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].from_number, "+14155550001");
        assert_eq!(thread[0].provider_message_id.as_deref(), Some("SMin1"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn stop_keyword_flips_consent_over_http() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;
        let d = seed_directory(&srv.store).await;
        srv.store
            .upsert_opt_in_state(
                &d.agency,
                &d.client,
                &d.number,
                OptInStatus::OptedIn,
                OptInSource::InboundMessage,
            )
            .await
            .unwrap();

        let resp = reqwest::Client::new()
            .post(format!("{}/webhooks/sms/inbound", srv.base))
            .form(&[("From", "4155550001"), ("To", "4155550100"), ("Body", "STOP")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.text().await.unwrap().contains("unsubscribed"));

        let state = srv
            .store
            .find_opt_in_state(&d.client, &d.number)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, OptInStatus::OptedOut);
        assert_eq!(state.source, "client_stop");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn sms_webhook_missing_from_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;

        let resp = reqwest::Client::new()
            .post(format!("{}/webhooks/sms/inbound", srv.base))
            .form(&[("Body", "hello")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn campaign_short_code_records_one_response_per_user() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;
        let agency = srv
            .store
            .insert_agency(
                "Bridgepoint",
                None,
                Some(r#"{"agency_campaigns_short_code": "55512"}"#),
            )
            .await
            .unwrap();
        let staff = srv
            .store
            .insert_user("Sam", None, "staff", Some("4155550031"), None)
            .await
            .unwrap();
        srv.store.add_user_to_agency(&staff, &agency).await.unwrap();
        let campaign = srv
            .store
            .insert_campaign(&agency, "sent", "all", None)
            .await
            .unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/webhooks/sms/inbound", srv.base))
            .form(&[("From", "4155550031"), ("To", "55512"), ("Body", "Y")])
            .send()
            .await
            .unwrap();
        assert!(resp.text().await.unwrap().contains("Thanks for your response."));
        let recorded = srv
            .store
            .find_campaign_response(&campaign, &staff)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.response_key, "Y");

        // A second reply updates the same row instead of duplicating it.
        client
            .post(format!("{}/webhooks/sms/inbound", srv.base))
            .form(&[("From", "4155550031"), ("To", "55512"), ("Body", "no")])
            .send()
            .await
            .unwrap();
        assert_eq!(srv.store.count_campaign_responses(&campaign).await.unwrap(), 1);
        let recorded = srv
            .store
            .find_campaign_response(&campaign, &staff)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorded.response_key, "N");
    })
    .await
    .expect("test timed out");
}

// ── Voice Webhook Tests ──────────────────────────────────────────────

#[tokio::test]
async fn inbound_voice_rings_the_owner() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;
        seed_directory(&srv.store).await;

        let resp = reqwest::Client::new()
            .post(format!("{}/webhooks/voice/inbound", srv.base))
            .form(&[
                ("From", "4155550001"),
                ("To", "4155550100"),
                ("CallSid", "CAin1"),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.text().await.unwrap();
        assert!(body.contains("<Number>+14155550002</Number>"));
        assert!(body.contains("dial-complete?callLogId="));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn bridge_without_valid_token_hangs_up() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;

        let resp = reqwest::Client::new()
            .post(format!("{}/webhooks/voice/outbound-bridge", srv.base))
            .query(&[("token", "bogus.token")])
            .form(&[("CallSid", "CAx")])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body = resp.text().await.unwrap();
        assert!(body.contains("We could not verify this call session."));
        assert!(body.contains("<Hangup/>"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn start_call_api_then_bridge_dials_the_client() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;
        let d = seed_directory(&srv.store).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/calls/start", srv.base))
            .json(&serde_json::json!({"userId": d.owner, "clientId": d.client}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "queued");
        assert_eq!(body["providerCallId"], "CAtest");
        let call_id = body["id"].as_str().unwrap().to_string();

        // The staff leg was placed with a signed bridge URL.
        let placed = srv.voice.calls.lock().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].to, "+14155550002");
        let token = placed[0]
            .webhook_url
            .split("token=")
            .nth(1)
            .expect("bridge URL carries a token")
            .to_string();
        drop(placed);

        // The bridge webhook validates the token and dials the client.
        let resp = client
            .post(format!("{}/webhooks/voice/outbound-bridge", srv.base))
            .query(&[("token", token.as_str())])
            .form(&[("CallSid", "CAparent")])
            .send()
            .await
            .unwrap();
        let body = resp.text().await.unwrap();
        assert!(body.contains("<Number>+14155550001</Number>"));
        assert!(body.contains("callerId=\"+14155550100\""));

        let call = srv.store.find_call_log(&call_id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::Bridging);
        assert_eq!(call.parent_call_id.as_deref(), Some("CAparent"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn duplicate_no_answer_webhooks_escalate_support_once() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;
        let d = seed_directory(&srv.store).await;
        srv.store
            .set_agency_flags(&d.agency, r#"{"voiceSupportFallbackPhone": "4155550888"}"#)
            .await
            .unwrap();
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/calls/start", srv.base))
            .json(&serde_json::json!({"userId": d.owner, "clientId": d.client}))
            .send()
            .await
            .unwrap();
        let body: Value = resp.json().await.unwrap();
        let call_id = body["id"].as_str().unwrap().to_string();
        srv.voice.calls.lock().await.clear();

        for _ in 0..2 {
            let resp = client
                .post(format!("{}/webhooks/voice/status", srv.base))
                .query(&[("callLogId", call_id.as_str())])
                .form(&[("CallStatus", "no-answer")])
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }

        // Exactly one follow-up call to support despite the duplicate webhook.
        let placed = srv.voice.calls.lock().await;
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].to, "+14155550888");
        assert!(placed[0].webhook_url.contains("support-notice"));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn missed_inbound_call_records_a_voicemail() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;
        let d = seed_directory(&srv.store).await;
        let settings = UserCallSettings {
            voicemail_enabled: true,
            voicemail_message: Some("Leave a message for Ana.".to_string()),
            ..UserCallSettings::default()
        };
        srv.store
            .upsert_user_call_settings(&d.owner, &settings)
            .await
            .unwrap();
        let client = reqwest::Client::new();

        client
            .post(format!("{}/webhooks/voice/inbound", srv.base))
            .form(&[
                ("From", "4155550001"),
                ("To", "4155550100"),
                ("CallSid", "CAvm"),
            ])
            .send()
            .await
            .unwrap();
        let call = srv
            .store
            .find_call_by_provider_id("CAvm")
            .await
            .unwrap()
            .unwrap();

        // The owner missed the call; no support fallback, so voicemail.
        let resp = client
            .post(format!("{}/webhooks/voice/dial-complete", srv.base))
            .query(&[("callLogId", call.id.as_str())])
            .form(&[("DialCallStatus", "busy")])
            .send()
            .await
            .unwrap();
        let body = resp.text().await.unwrap();
        assert!(body.contains("Leave a message for Ana."));
        assert!(body.contains("<Record"));

        let resp = client
            .post(format!("{}/webhooks/voice/voicemail-complete", srv.base))
            .query(&[("callLogId", call.id.as_str())])
            .form(&[
                ("RecordingSid", "RE1"),
                ("RecordingUrl", "https://r.test/RE1"),
                ("RecordingDuration", "42"),
                ("RecordingStatus", "completed"),
            ])
            .send()
            .await
            .unwrap();
        assert!(resp.text().await.unwrap().contains("<Hangup/>"));

        let call = srv.store.find_call_log(&call.id).await.unwrap().unwrap();
        assert_eq!(call.status, CallStatus::VoicemailRecorded);
        let vm = srv
            .store
            .find_voicemail_for_call(&call.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vm.recording_id.as_deref(), Some("RE1"));
        assert_eq!(vm.duration_seconds, Some(42));
    })
    .await
    .expect("test timed out");
}

// ── REST Endpoint Tests ──────────────────────────────────────────────

#[tokio::test]
async fn send_message_api_sends_and_logs() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;
        let d = seed_directory(&srv.store).await;
        srv.store
            .upsert_opt_in_state(
                &d.agency,
                &d.client,
                &d.number,
                OptInStatus::OptedIn,
                OptInSource::InboundMessage,
            )
            .await
            .unwrap();

        let resp = reqwest::Client::new()
            .post(format!("{}/api/messages/send", srv.base))
            .json(&serde_json::json!({
                "userId": d.owner,
                "clientId": d.client,
                "body": "See you at 3pm",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["deliveryStatus"], "sent");
        assert_eq!(body["toNumber"], "+14155550001");

        let sent = srv.sms.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "See you at 3pm");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn send_message_api_refuses_opted_out_client() {
    timeout(TEST_TIMEOUT, async {
        let srv = start_server().await;
        let d = seed_directory(&srv.store).await;
        srv.store
            .upsert_opt_in_state(
                &d.agency,
                &d.client,
                &d.number,
                OptInStatus::OptedOut,
                OptInSource::ClientStop,
            )
            .await
            .unwrap();

        let resp = reqwest::Client::new()
            .post(format!("{}/api/messages/send", srv.base))
            .json(&serde_json::json!({
                "userId": d.owner,
                "clientId": d.client,
                "body": "hello?",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 403);
        assert!(srv.sms.sent.lock().await.is_empty());
    })
    .await
    .expect("test timed out");
}
