//! Staff-initiated outbound SMS.
//!
//! Resolves the sending number, refuses read-only escalated threads,
//! enforces the agency's opt-in compliance gate, and logs the attempt
//! pending → sent/failed. A successful reply resolves any active thread
//! escalation.

use tracing::{debug, warn};

use crate::error::{DatabaseError, Error, RoutingError, TransportError};
use crate::gateway::{SmsGateway, SmsRequest};
use crate::phone;
use crate::routing::{self, OwnerType};
use crate::store::{
    DeliveryStatus, Direction, MessageLog, NewMessageLog, OptInStatus, Store, ThreadMode,
};

/// Why an outbound send was refused or failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("User not found")]
    UserNotFound,

    #[error("Client not found")]
    ClientNotFound,

    #[error("Client does not have a contact phone assigned")]
    ClientHasNoPhone,

    #[error(transparent)]
    Routing(RoutingError),

    #[error("This thread is escalated to support in read-only mode")]
    ThreadReadOnly,

    #[error("Client has opted out of SMS")]
    ClientOptedOut,

    #[error("Client has not opted in to SMS yet")]
    OptInRequired,

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("SMS send failed: {0}")]
    Transport(TransportError),
}

/// Send a staff SMS to a client. Returns the final message log row.
pub async fn send_message(
    store: &Store,
    sms: &dyn SmsGateway,
    user_id: &str,
    client_id: &str,
    body: &str,
    requested_number_id: Option<&str>,
) -> Result<MessageLog, SendError> {
    let user = store.find_user(user_id).await?.ok_or(SendError::UserNotFound)?;
    let client = store.find_client(client_id).await?.ok_or(SendError::ClientNotFound)?;
    let to_number = client.contact_phone.clone().ok_or(SendError::ClientHasNoPhone)?;

    // Legacy direct binding backstop: a user with a system phone can send
    // even when the resolver finds no number.
    let resolved =
        match routing::resolve_outbound_number(store, user_id, Some(client_id), requested_number_id)
            .await
        {
            Ok(resolved) => Some(resolved),
            Err(Error::Routing(RoutingError::NoNumberAvailable))
                if user.system_phone_number.is_some() =>
            {
                None
            }
            Err(Error::Routing(e)) => return Err(SendError::Routing(e)),
            Err(Error::Database(e)) => return Err(SendError::Database(e)),
            Err(e) => {
                warn!(error = %e, "Unexpected resolver failure");
                return Err(SendError::Routing(RoutingError::NoNumberAvailable));
            }
        };

    if let Some(escalation) = store.find_active_escalation(user_id, client_id).await? {
        if escalation.thread_mode == ThreadMode::ReadOnly {
            return Err(SendError::ThreadReadOnly);
        }
    }

    let (from_number, number_id, owner_type, assigned_user_id) = match &resolved {
        Some(r) => (
            r.number.phone_number.clone(),
            Some(r.number.id.clone()),
            r.owner_type,
            r.assignment
                .as_ref()
                .map(|a| a.user_id.clone())
                .unwrap_or_else(|| user_id.to_string()),
        ),
        None => (
            user.system_phone_number.clone().unwrap_or_default(),
            None,
            OwnerType::Staff,
            user_id.to_string(),
        ),
    };

    // Compliance gate against the client's consent state on this number.
    if let (Some(number_id), Some(agency_id)) = (number_id.as_deref(), client.agency_id.as_deref())
    {
        let config = store.agency_config(agency_id).await?;
        let status = store
            .find_opt_in_state(client_id, number_id)
            .await?
            .map(|s| s.status)
            .unwrap_or(OptInStatus::Pending);
        if status == OptInStatus::OptedOut {
            return Err(SendError::ClientOptedOut);
        }
        if config.compliance_mode() == crate::agency::ComplianceMode::OptInRequired
            && status != OptInStatus::OptedIn
        {
            return Err(SendError::OptInRequired);
        }
    }

    let log_id = store
        .insert_message_log(
            Direction::Outbound,
            DeliveryStatus::Pending,
            NewMessageLog {
                agency_id: client.agency_id.clone(),
                number_id: number_id.clone(),
                user_id: Some(user_id.to_string()),
                assigned_user_id: Some(assigned_user_id),
                owner_type: Some(owner_type.as_str().to_string()),
                client_id: Some(client_id.to_string()),
                body: body.to_string(),
                from_number: from_number.clone(),
                to_number: to_number.clone(),
                ..Default::default()
            },
        )
        .await?;

    match sms
        .send_sms(SmsRequest {
            to: phone::normalize_or_raw(&to_number),
            from: phone::normalize_or_raw(&from_number),
            body: body.to_string(),
        })
        .await
    {
        Ok(receipt) => {
            store
                .mark_message_sent(
                    &log_id,
                    receipt.provider_message_id.as_deref(),
                    Some(&serde_json::json!({"status": receipt.status})),
                )
                .await?;
            let resolved_count = store.resolve_active_escalation(user_id, client_id).await?;
            if resolved_count > 0 {
                debug!(user = user_id, client = client_id, "Thread escalation resolved by reply");
            }
            Ok(store
                .find_message_log(&log_id)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "message_log".to_string(),
                    id: log_id,
                })?)
        }
        Err(e) => {
            store.mark_message_failed(&log_id, &e.to_string()).await?;
            Err(SendError::Transport(e))
        }
    }
}
