//! Typed per-agency configuration.
//!
//! Agencies carry a JSON feature-flag bag (managed by external configuration
//! screens, consumed read-only here). It is parsed once at the boundary into
//! this struct with named, defaulted fields instead of scattering
//! parse-or-default logic through every component.

use serde::Deserialize;

/// Compliance mode for outbound SMS to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceMode {
    /// Clients must have an explicit `opted_in` state before staff may text them.
    OptInRequired,
    /// Opt-out is honored but prior opt-in is not required.
    Relaxed,
}

/// Which number reminder SMS is sent from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderSenderMode {
    /// Always the agency's shared number.
    AgencyDefault,
    /// Providers who opted in via preference use their own number.
    ProviderOptional,
}

const DEFAULT_RING_TIMEOUT_SECS: u32 = 20;
const DEFAULT_ESCALATION_HOURS: i64 = 12;

/// Parsed agency feature flags with defaults applied.
///
/// Unknown keys are ignored; a missing or malformed bag yields
/// `AgencyConfig::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgencyConfig {
    pub sms_numbers_enabled: bool,
    pub sms_compliance_mode: Option<ComplianceMode>,
    pub sms_reminder_sender_mode: Option<ReminderSenderMode>,
    /// Agency-level default routing user for otherwise-unowned inbound SMS.
    pub sms_default_user_id: Option<String>,
    pub sms_support_fallback_phone: Option<String>,
    sms_support_escalation_hours: Option<i64>,
    pub sms_stop_reply: Option<String>,
    pub sms_start_reply: Option<String>,
    pub sms_help_reply: Option<String>,
    pub sms_opt_out_notice: Option<String>,
    #[serde(alias = "agency_campaigns_short_code")]
    pub campaign_short_code: Option<String>,
    #[serde(alias = "company_events_short_code")]
    pub event_short_code: Option<String>,
    pub voice_support_fallback_phone: Option<String>,
    pub voice_support_fallback_message: Option<String>,
    pub voice_support_pre_connect_message: Option<String>,
    pub voice_provider_pre_connect_message: Option<String>,
    voice_provider_ring_timeout_seconds: Option<i64>,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            sms_numbers_enabled: false,
            sms_compliance_mode: None,
            sms_reminder_sender_mode: None,
            sms_default_user_id: None,
            sms_support_fallback_phone: None,
            sms_support_escalation_hours: None,
            sms_stop_reply: None,
            sms_start_reply: None,
            sms_help_reply: None,
            sms_opt_out_notice: None,
            campaign_short_code: None,
            event_short_code: None,
            voice_support_fallback_phone: None,
            voice_support_fallback_message: None,
            voice_support_pre_connect_message: None,
            voice_provider_pre_connect_message: None,
            voice_provider_ring_timeout_seconds: None,
        }
    }
}

impl AgencyConfig {
    /// Parse a raw feature-flag bag. Malformed JSON yields defaults.
    pub fn from_flags(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        serde_json::from_str(raw).unwrap_or_default()
    }

    pub fn compliance_mode(&self) -> ComplianceMode {
        self.sms_compliance_mode.unwrap_or(ComplianceMode::OptInRequired)
    }

    pub fn reminder_sender_mode(&self) -> ReminderSenderMode {
        self.sms_reminder_sender_mode.unwrap_or(ReminderSenderMode::AgencyDefault)
    }

    /// SLA escalation threshold, clamped to 1–168 hours.
    pub fn escalation_hours(&self) -> i64 {
        self.sms_support_escalation_hours
            .unwrap_or(DEFAULT_ESCALATION_HOURS)
            .clamp(1, 168)
    }

    /// Ring timeout for dialing a staff device, clamped to 10–60 seconds.
    pub fn ring_timeout_seconds(&self) -> u32 {
        let raw = self
            .voice_provider_ring_timeout_seconds
            .unwrap_or(DEFAULT_RING_TIMEOUT_SECS as i64);
        raw.clamp(10, 60) as u32
    }

    pub fn stop_reply(&self) -> &str {
        self.sms_stop_reply
            .as_deref()
            .unwrap_or("You have been unsubscribed and will receive no further messages. Reply START to re-subscribe.")
    }

    pub fn start_reply(&self) -> &str {
        self.sms_start_reply
            .as_deref()
            .unwrap_or("You are re-subscribed and may receive messages again. Reply STOP to unsubscribe.")
    }

    pub fn help_reply(&self) -> &str {
        self.sms_help_reply
            .as_deref()
            .unwrap_or("Reply STOP to unsubscribe or START to re-subscribe. For assistance, contact your care team.")
    }

    /// Message used when the compliance gate suppresses a reply to an
    /// opted-out sender.
    pub fn opt_out_notice(&self) -> &str {
        self.sms_opt_out_notice
            .as_deref()
            .unwrap_or("You are currently unsubscribed. Reply START to receive messages again.")
    }

    pub fn support_pre_connect_message(&self) -> &str {
        self.voice_support_pre_connect_message
            .as_deref()
            .unwrap_or("Please hold while we connect you to support.")
    }

    pub fn provider_pre_connect_message(&self) -> &str {
        self.voice_provider_pre_connect_message
            .as_deref()
            .unwrap_or("Please hold while we connect your call.")
    }

    pub fn support_notice_message(&self) -> &str {
        self.voice_support_fallback_message
            .as_deref()
            .unwrap_or("A staff member missed a callback attempt. Please follow up with the client.")
    }
}
