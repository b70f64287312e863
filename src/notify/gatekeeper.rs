//! Channel gatekeeper — single source of truth for outbound delivery.
//!
//! Decides which channels (in-app / email / SMS) an event may use for a
//! user. In-app is a safety and audit floor and can never be disabled.
//! The decision is a pure function of the preferences, role, context, and
//! clock; it must be computed fresh for every dispatch since quiet-hours
//! state is time-dependent.

use chrono::{NaiveDateTime, Timelike};

use crate::error::DatabaseError;
use crate::store::{Store, UserPreferences};

/// Roles that default to SMS-enabled when no preferences row exists.
const EMPLOYEE_LIKE_ROLES: &[&str] = &[
    "staff",
    "clinician",
    "facilitator",
    "intern",
    "supervisor",
    "clinical_practice_assistant",
];

/// Event context influencing the decision.
#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    pub severity: Option<String>,
    pub is_urgent: bool,
    pub is_emergency_broadcast: bool,
    pub is_blocking_compliance: bool,
}

impl DecisionContext {
    pub fn urgent() -> Self {
        Self {
            is_urgent: true,
            ..Default::default()
        }
    }

    fn effective_urgency(&self) -> bool {
        self.is_urgent || self.severity.as_deref() == Some("urgent")
    }
}

/// The gatekeeper's verdict. `reason_codes` records why channels were
/// blocked or bypassed, for audit and tests.
#[derive(Debug, Clone)]
pub struct ChannelDecision {
    pub in_app: bool,
    pub email: bool,
    pub sms: bool,
    pub reason_codes: Vec<String>,
}

impl ChannelDecision {
    pub fn has_reason(&self, code: &str) -> bool {
        self.reason_codes.iter().any(|c| c == code)
    }
}

/// Default preferences for a user with no stored row.
pub fn default_preferences(role: &str) -> UserPreferences {
    UserPreferences {
        email_enabled: true,
        sms_enabled: EMPLOYEE_LIKE_ROLES.contains(&role),
        in_app_enabled: true,
        sms_use_own_number_for_reminders: true,
        sms_support_thread_mode: "respondable".to_string(),
        ..Default::default()
    }
}

/// Decide channels for a user, reading current preferences from the store.
pub async fn decide_channels(
    store: &Store,
    user_id: &str,
    context: &DecisionContext,
    now: NaiveDateTime,
) -> Result<ChannelDecision, DatabaseError> {
    let role = store
        .find_user(user_id)
        .await?
        .map(|u| u.role)
        .unwrap_or_else(|| "staff".to_string());
    let prefs = store
        .user_preferences(user_id)
        .await?
        .unwrap_or_else(|| default_preferences(&role));
    Ok(decide_channels_with(&prefs, context, now))
}

/// Pure decision given resolved preferences. Rules, in order:
/// 1. emergency broadcast / blocking compliance → all channels, bypass all
/// 2. quiet hours block external channels outside the working window,
///    lifted by urgency or the user's emergency-override preference
/// 3. final email/sms = toggle AND NOT blocked
pub fn decide_channels_with(
    prefs: &UserPreferences,
    context: &DecisionContext,
    now: NaiveDateTime,
) -> ChannelDecision {
    let mut reason_codes = Vec::new();

    if context.is_emergency_broadcast {
        reason_codes.push("bypass_emergency_broadcast".to_string());
        return ChannelDecision {
            in_app: true,
            email: true,
            sms: true,
            reason_codes,
        };
    }
    if context.is_blocking_compliance {
        reason_codes.push("bypass_blocking_compliance".to_string());
        return ChannelDecision {
            in_app: true,
            email: true,
            sms: true,
            reason_codes,
        };
    }

    let mut quiet_hours_blocks = false;
    if prefs.quiet_hours_enabled {
        let allowed_days = parse_allowed_days(prefs.quiet_hours_allowed_days.as_deref());
        let start = parse_time_minutes(prefs.quiet_hours_start_time.as_deref());
        let end = parse_time_minutes(prefs.quiet_hours_end_time.as_deref());
        quiet_hours_blocks = !inside_working_window(now, allowed_days.as_deref(), start, end);
        if quiet_hours_blocks {
            reason_codes.push("quiet_hours_outside_window".to_string());
        }
    }

    if quiet_hours_blocks && (context.effective_urgency() || prefs.emergency_override) {
        quiet_hours_blocks = false;
        reason_codes.push(
            if context.effective_urgency() {
                "quiet_hours_bypass_urgent"
            } else {
                "quiet_hours_bypass_emergency_override"
            }
            .to_string(),
        );
    }

    let email = prefs.email_enabled && !quiet_hours_blocks;
    let sms = prefs.sms_enabled && !quiet_hours_blocks;

    if !prefs.email_enabled {
        reason_codes.push("email_disabled".to_string());
    }
    if !prefs.sms_enabled {
        reason_codes.push("sms_disabled".to_string());
    }
    if !quiet_hours_blocks {
        reason_codes.push("within_delivery_window".to_string());
    }

    ChannelDecision {
        in_app: true,
        email,
        sms,
        reason_codes,
    }
}

fn parse_allowed_days(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?;
    serde_json::from_str::<Vec<String>>(raw).ok()
}

/// Parse "HH:MM" or "HH:MM:SS" into minutes from midnight.
fn parse_time_minutes(raw: Option<&str>) -> Option<u32> {
    let raw = raw?;
    let mut parts = raw.split(':');
    let hours: u32 = parts.next()?.trim().parse().ok()?;
    let minutes: u32 = parts.next()?.trim().parse().ok()?;
    if hours > 23 || minutes > 59 {
        return None;
    }
    Some(hours * 60 + minutes)
}

/// Whether `now` falls inside the configured working window.
///
/// A window missing days or times is treated as always-inside (no
/// quiet-hours restriction). `start > end` is an overnight window
/// (e.g. 22:00–06:00).
fn inside_working_window(
    now: NaiveDateTime,
    allowed_days: Option<&[String]>,
    start_minutes: Option<u32>,
    end_minutes: Option<u32>,
) -> bool {
    let Some(days) = allowed_days.filter(|d| !d.is_empty()) else {
        return true;
    };
    let (Some(start), Some(end)) = (start_minutes, end_minutes) else {
        return true;
    };

    let day_name = now.format("%A").to_string();
    if !days.iter().any(|d| d == &day_name) {
        return false;
    }

    let now_minutes = now.hour() * 60 + now.minute();
    if start <= end {
        now_minutes >= start && now_minutes < end
    } else {
        now_minutes >= start || now_minutes < end
    }
}
