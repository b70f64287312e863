//! SMS/voice transport gateway.
//!
//! The provider's REST API is behind two narrow traits so the routing and
//! state-machine code never touches HTTP directly, and tests can substitute
//! recording stubs. All provider calls are synchronous, time-bounded requests;
//! failures surface as [`TransportError`] and are handled at the call site.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::TransportError;

/// One outbound SMS.
#[derive(Debug, Clone)]
pub struct SmsRequest {
    pub to: String,
    pub from: String,
    pub body: String,
}

/// Provider acknowledgement for a sent SMS.
#[derive(Debug, Clone, Default)]
pub struct SmsReceipt {
    pub provider_message_id: Option<String>,
    pub status: Option<String>,
}

/// One outbound call-leg creation.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub to: String,
    pub from: String,
    /// Webhook the provider fetches for call-control markup once the leg answers.
    pub webhook_url: String,
    pub status_callback_url: Option<String>,
    pub record: bool,
}

/// Provider acknowledgement for a created call.
#[derive(Debug, Clone, Default)]
pub struct CallReceipt {
    pub provider_call_id: Option<String>,
    pub status: Option<String>,
}

#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send_sms(&self, request: SmsRequest) -> Result<SmsReceipt, TransportError>;
}

#[async_trait]
pub trait VoiceGateway: Send + Sync {
    async fn create_call(&self, request: CallRequest) -> Result<CallReceipt, TransportError>;
}

#[derive(Debug, Deserialize)]
struct ProviderMessageResponse {
    sid: Option<String>,
    status: Option<String>,
}

/// HTTP client for the provider's REST API.
///
/// Implements both gateway traits against the account-scoped Messages and
/// Calls endpoints, form-encoded with basic auth, per-request timeout from
/// configuration.
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    account_id: String,
    auth_token: SecretString,
}

impl ProviderClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            account_id: config.account_id.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn endpoint(&self, resource: &str) -> String {
        format!("{}/Accounts/{}/{resource}", self.base_url, self.account_id)
    }

    async fn post_form(
        &self,
        resource: &str,
        form: &[(&str, &str)],
    ) -> Result<ProviderMessageResponse, TransportError> {
        let response = self
            .http
            .post(self.endpoint(resource))
            .basic_auth(&self.account_id, Some(self.auth_token.expose_secret()))
            .form(form)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::InvalidResponse(format!(
                "{resource} returned {status}: {body}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl SmsGateway for ProviderClient {
    async fn send_sms(&self, request: SmsRequest) -> Result<SmsReceipt, TransportError> {
        let form = [
            ("To", request.to.as_str()),
            ("From", request.from.as_str()),
            ("Body", request.body.as_str()),
        ];
        let parsed = self
            .post_form("Messages", &form)
            .await
            .map_err(|e| TransportError::SmsSendFailed {
                to: request.to.clone(),
                reason: e.to_string(),
            })?;
        debug!(to = %request.to, sid = ?parsed.sid, "SMS accepted by provider");
        Ok(SmsReceipt {
            provider_message_id: parsed.sid,
            status: parsed.status,
        })
    }
}

#[async_trait]
impl VoiceGateway for ProviderClient {
    async fn create_call(&self, request: CallRequest) -> Result<CallReceipt, TransportError> {
        let record = if request.record { "true" } else { "false" };
        let mut form = vec![
            ("To", request.to.as_str()),
            ("From", request.from.as_str()),
            ("Url", request.webhook_url.as_str()),
            ("Record", record),
        ];
        if let Some(cb) = request.status_callback_url.as_deref() {
            form.push(("StatusCallback", cb));
        }
        let parsed = self
            .post_form("Calls", &form)
            .await
            .map_err(|e| TransportError::CallCreateFailed {
                to: request.to.clone(),
                reason: e.to_string(),
            })?;
        debug!(to = %request.to, sid = ?parsed.sid, "Call accepted by provider");
        Ok(CallReceipt {
            provider_call_id: parsed.sid,
            status: parsed.status,
        })
    }
}
