//! SLA escalation sweep.
//!
//! A periodic task, independent of any request path, that scans for inbound
//! threads a provider has left unanswered past the agency's threshold and
//! escalates them to the support fallback number. Bounded batch per tick;
//! safe to run concurrently with itself and with webhook-triggered
//! escalation creation because both share the same uniqueness constraints.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::gateway::{SmsGateway, SmsRequest};
use crate::phone;
use crate::store::{EscalationType, Store, ThreadMode};

/// Upper bound on threads examined per tick.
pub const SWEEP_BATCH_LIMIT: usize = 200;

const EXCERPT_LIMIT: usize = 180;

/// Run one sweep pass. Returns how many threads were escalated.
pub async fn run_tick(store: &Store, sms: &dyn SmsGateway) -> Result<usize, DatabaseError> {
    let candidates = store.stale_unanswered_inbound(SWEEP_BATCH_LIMIT).await?;
    let mut escalated = 0;

    for thread in candidates {
        let Some(agency_id) = thread.agency_id.as_deref() else {
            continue;
        };
        let Some(agency) = store.find_agency(agency_id).await? else {
            continue;
        };
        let config = agency.config();

        let threshold_hours = config.escalation_hours();
        let age = Utc::now() - thread.created_at;
        if age.num_hours() < threshold_hours {
            continue;
        }

        let support_phone = config
            .sms_support_fallback_phone
            .as_deref()
            .or(agency.phone_number.as_deref())
            .and_then(phone::normalize);
        let Some(support_phone) = support_phone else {
            continue;
        };

        let client_label = thread
            .client_initials
            .clone()
            .unwrap_or_else(|| format!("#{}", thread.client_id));
        let excerpt: String = thread.body.chars().take(EXCERPT_LIMIT).collect();
        let body = format!(
            "Support escalation: staff has not replied in {threshold_hours}h. Client {client_label} sent: \"{excerpt}\""
        );

        // Send first; a failed send leaves no escalation row so the next
        // tick retries.
        if let Err(e) = sms
            .send_sms(SmsRequest {
                to: support_phone.clone(),
                from: phone::normalize_or_raw(&thread.to_number),
                body,
            })
            .await
        {
            warn!(error = %e, thread = %thread.log_id, "Escalation SMS failed; will retry next tick");
            continue;
        }

        let mode = store
            .user_preferences(&thread.user_id)
            .await?
            .map(|p| ThreadMode::from_str(&p.sms_support_thread_mode))
            .unwrap_or(ThreadMode::Respondable);
        let created = store
            .create_escalation_if_absent(
                Some(agency_id),
                &thread.user_id,
                &thread.client_id,
                Some(&thread.log_id),
                Some(&support_phone),
                EscalationType::SlaTimeout,
                mode,
                Some(&serde_json::json!({"thresholdHours": threshold_hours})),
            )
            .await?;
        if created {
            escalated += 1;
            debug!(thread = %thread.log_id, user = %thread.user_id, "Thread escalated to support");
        }
    }
    Ok(escalated)
}

/// Spawn the sweep on a fixed interval.
pub fn spawn_sweep_task(
    store: Arc<Store>,
    sms: Arc<dyn SmsGateway>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            match run_tick(&store, sms.as_ref()).await {
                Ok(0) => {}
                Ok(count) => info!(count, "SLA sweep escalated threads"),
                Err(e) => warn!(error = %e, "SLA sweep tick failed"),
            }
        }
    })
}
