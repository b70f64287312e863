//! Notification dispatcher.
//!
//! Creates the in-app record first (audit floor, never skipped), then fans
//! out to SMS when the type is allowlisted, the user's role is eligible,
//! the category is enabled, a phone number exists, and the gatekeeper says
//! `sms = true`. Every attempt is logged; failures never raise past the
//! dispatcher.

use std::sync::Arc;

use chrono::Local;
use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::gateway::{SmsGateway, SmsRequest};
use crate::notify::gatekeeper::{self, DecisionContext};
use crate::phone;
use crate::store::{NewNotification, Notification, Store};

/// Notification types that may fan out to SMS, mapped to the preference
/// category that governs them. Anything not listed is in-app only.
const SMS_CATEGORY_BY_TYPE: &[(&str, &str)] = &[
    ("inbound_client_message", "messaging_new_inbound_client_text"),
    ("support_safety_net_alert", "messaging_support_safety_net_alerts"),
    ("client_note", "messaging_client_notes"),
    ("kiosk_checkin", "surveys_client_checked_in"),
    ("survey_completed", "surveys_survey_completed"),
    ("credential_expiring", "compliance_credential_expiration_reminders"),
    ("credential_expired_blocking", "compliance_access_restriction_warnings"),
    ("program_reminder", "program_reminders"),
];

/// Users table includes all portal users; only staff-like roles may ever
/// receive SMS notifications.
const SMS_ELIGIBLE_ROLES: &[&str] = &[
    "admin",
    "super_admin",
    "support",
    "supervisor",
    "clinical_practice_assistant",
    "staff",
    "provider",
    "school_staff",
    "facilitator",
    "intern",
];

const MAX_SMS_BODY: usize = 480;

/// Why a dispatch did or did not reach SMS. Returned for tests and audit;
/// callers treat every outcome as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Skipped(&'static str),
    Failed(String),
}

pub struct NotificationDispatcher {
    store: Arc<Store>,
    sms: Arc<dyn SmsGateway>,
    /// Default sender for notification SMS when no agency number applies.
    notifications_from: Option<String>,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<Store>, sms: Arc<dyn SmsGateway>, notifications_from: Option<String>) -> Self {
        Self {
            store,
            sms,
            notifications_from,
        }
    }

    /// Create the in-app record and attempt SMS fan-out.
    ///
    /// The in-app insert is the only fallible part; SMS dispatch is
    /// fire-and-forget from the caller's perspective.
    pub async fn create_and_dispatch(
        &self,
        new: NewNotification,
        context: &DecisionContext,
    ) -> Result<Notification, DatabaseError> {
        let created = self.store.insert_notification(new).await?;
        let outcome = self.dispatch_sms(&created, context).await;
        match &outcome {
            DispatchOutcome::Sent => {
                debug!(notification = %created.id, user = %created.user_id, "Notification SMS sent");
            }
            DispatchOutcome::Skipped(reason) => {
                debug!(notification = %created.id, reason, "Notification SMS skipped");
            }
            DispatchOutcome::Failed(error) => {
                warn!(notification = %created.id, error = %error, "Notification SMS failed");
            }
        }
        Ok(created)
    }

    /// SMS fan-out for an existing in-app record.
    pub async fn dispatch_sms(
        &self,
        notification: &Notification,
        context: &DecisionContext,
    ) -> DispatchOutcome {
        let Some(category) = SMS_CATEGORY_BY_TYPE
            .iter()
            .find(|(t, _)| *t == notification.notification_type)
            .map(|(_, c)| *c)
        else {
            return DispatchOutcome::Skipped("type_not_allowlisted");
        };
        let Some(agency_id) = notification.agency_id.as_deref() else {
            return DispatchOutcome::Skipped("missing_agency");
        };

        let user = match self.store.find_user(&notification.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => return DispatchOutcome::Skipped("user_not_found"),
            Err(e) => return DispatchOutcome::Failed(e.to_string()),
        };
        if !SMS_ELIGIBLE_ROLES.contains(&user.role.as_str()) {
            return DispatchOutcome::Skipped("role_not_eligible");
        }

        match self.category_enabled(&notification.user_id, agency_id, category).await {
            Ok(true) => {}
            Ok(false) => return DispatchOutcome::Skipped("category_disabled"),
            Err(e) => return DispatchOutcome::Failed(e.to_string()),
        }

        let body = build_sms_body(&notification.title, &notification.message);
        let Some(to) = user.contact_phone().and_then(phone::normalize) else {
            let _ = self
                .store
                .insert_notification_sms_log(
                    &notification.user_id,
                    Some(agency_id),
                    Some(&notification.id),
                    user.contact_phone().unwrap_or(""),
                    "",
                    &body,
                    "failed",
                    Some("Missing/invalid user phone number"),
                )
                .await;
            return DispatchOutcome::Skipped("missing_phone");
        };
        let Some(from) = self.notifications_from.as_deref().map(phone::normalize_or_raw) else {
            let _ = self
                .store
                .insert_notification_sms_log(
                    &notification.user_id,
                    Some(agency_id),
                    Some(&notification.id),
                    &to,
                    "",
                    &body,
                    "failed",
                    Some("No notification sender number configured"),
                )
                .await;
            return DispatchOutcome::Skipped("missing_from_number");
        };

        let decision_context = DecisionContext {
            severity: Some(notification.severity.clone()).filter(|s| !s.is_empty()),
            is_urgent: context.is_urgent || notification.severity == "urgent",
            is_emergency_broadcast: context.is_emergency_broadcast,
            is_blocking_compliance: context.is_blocking_compliance
                || notification.notification_type == "credential_expired_blocking",
        };
        let decision = match gatekeeper::decide_channels(
            &self.store,
            &notification.user_id,
            &decision_context,
            Local::now().naive_local(),
        )
        .await
        {
            Ok(decision) => decision,
            Err(e) => return DispatchOutcome::Failed(e.to_string()),
        };
        if !decision.sms {
            return DispatchOutcome::Skipped("gatekeeper_sms_false");
        }

        let log_id = match self
            .store
            .insert_notification_sms_log(
                &notification.user_id,
                Some(agency_id),
                Some(&notification.id),
                &to,
                &from,
                &body,
                "pending",
                None,
            )
            .await
        {
            Ok(id) => id,
            Err(e) => return DispatchOutcome::Failed(e.to_string()),
        };

        match self
            .sms
            .send_sms(SmsRequest {
                to: to.clone(),
                from,
                body,
            })
            .await
        {
            Ok(receipt) => {
                let _ = self
                    .store
                    .update_notification_sms_log(
                        &log_id,
                        "sent",
                        receipt.provider_message_id.as_deref(),
                        None,
                    )
                    .await;
                DispatchOutcome::Sent
            }
            Err(e) => {
                let _ = self
                    .store
                    .update_notification_sms_log(&log_id, "failed", None, Some(&e.to_string()))
                    .await;
                DispatchOutcome::Failed(e.to_string())
            }
        }
    }

    /// Whether a category is enabled for a user: agency defaults win when
    /// enforced (or when the user never chose anything); a missing key
    /// defaults to on.
    async fn category_enabled(
        &self,
        user_id: &str,
        agency_id: &str,
        category: &str,
    ) -> Result<bool, DatabaseError> {
        let user_categories: serde_json::Value = self
            .store
            .user_preferences(user_id)
            .await?
            .and_then(|p| p.notification_categories)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        let agency_defaults = self.store.agency_notification_defaults(agency_id).await?;
        let categories = match agency_defaults {
            Some(defaults)
                if defaults.enforce_defaults
                    || user_categories.as_object().is_none_or(|m| m.is_empty()) =>
            {
                defaults.defaults
            }
            _ => user_categories,
        };
        Ok(categories.get(category) != Some(&serde_json::Value::Bool(false)))
    }
}

/// "title: message", truncated to keep the segment count sane.
fn build_sms_body(title: &str, message: &str) -> String {
    let title = title.trim();
    let message = message.trim();
    let combined = match (title.is_empty(), message.is_empty()) {
        (false, false) => format!("{title}: {message}"),
        (false, true) => title.to_string(),
        _ => message.to_string(),
    };
    if combined.chars().count() > MAX_SMS_BODY {
        let truncated: String = combined.chars().take(MAX_SMS_BODY - 3).collect();
        format!("{truncated}...")
    } else {
        combined
    }
}
