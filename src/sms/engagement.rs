//! Short-code engagement flows.
//!
//! When an inbound SMS hits an agency's configured short code it is routed
//! entirely to a campaign-response or event-voting flow and never reaches
//! general routing. Both flows match the sender against agency staff by
//! phone, check the audience, and upsert a single response row per
//! responder (latest wins).

use serde::Deserialize;
use tracing::debug;

use crate::error::DatabaseError;
use crate::notify::{DecisionContext, NotificationDispatcher};
use crate::phone;
use crate::store::{CompanyEvent, NewNotification, Store, User};

/// One selectable response option.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseOption {
    pub key: String,
    pub label: String,
}

fn default_campaign_options() -> Vec<ResponseOption> {
    vec![
        ResponseOption { key: "Y".into(), label: "Yes".into() },
        ResponseOption { key: "N".into(), label: "No".into() },
        ResponseOption { key: "OPTOUT".into(), label: "Opt Out".into() },
    ]
}

fn parse_options(raw: Option<&str>, fallback: Vec<ResponseOption>) -> Vec<ResponseOption> {
    raw.and_then(|s| serde_json::from_str::<Vec<ResponseOption>>(s).ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(fallback)
}

/// A matched response: the canonical key/label plus the raw text.
#[derive(Debug, Clone)]
struct MatchedResponse {
    key: String,
    label: String,
    raw: String,
}

/// Map free-form reply text onto an option. Compliance opt-out synonyms
/// always map to OPTOUT regardless of the configured options.
fn normalize_response(body: &str, options: &[ResponseOption]) -> Option<MatchedResponse> {
    let raw = body.trim();
    if raw.is_empty() {
        return None;
    }
    let upper = raw.to_uppercase();
    if ["OPT OUT", "OPTOUT", "STOP", "UNSUBSCRIBE"].contains(&upper.as_str()) {
        return Some(MatchedResponse {
            key: "OPTOUT".into(),
            label: "Opt Out".into(),
            raw: raw.to_string(),
        });
    }
    if ["YES", "Y"].contains(&upper.as_str()) {
        return Some(MatchedResponse { key: "Y".into(), label: "Yes".into(), raw: raw.to_string() });
    }
    if ["NO", "N"].contains(&upper.as_str()) {
        return Some(MatchedResponse { key: "N".into(), label: "No".into(), raw: raw.to_string() });
    }
    options
        .iter()
        .find(|o| {
            upper == o.key.trim().to_uppercase() || upper == o.label.trim().to_uppercase()
        })
        .map(|o| MatchedResponse {
            key: o.key.clone(),
            label: o.label.clone(),
            raw: raw.to_string(),
        })
}

/// Match the sender against agency staff by any of their phone numbers.
async fn find_agency_user_by_phone(
    store: &Store,
    agency_id: &str,
    from: &str,
) -> Result<Option<User>, DatabaseError> {
    let Some(normalized) = phone::normalize(from) else {
        return Ok(None);
    };
    let staff = store.list_agency_staff(agency_id).await?;
    Ok(staff.into_iter().find(|u| {
        [&u.phone_number, &u.personal_phone, &u.work_phone]
            .into_iter()
            .flatten()
            .any(|p| phone::normalize(p).as_deref() == Some(normalized.as_str()))
    }))
}

fn short_code_matches(code: Option<&str>, to_number: &str) -> bool {
    match (code.and_then(phone::digits_only), phone::digits_only(to_number)) {
        (Some(code), Some(to)) => code == to,
        _ => false,
    }
}

/// Try to handle an inbound SMS as a short-code flow.
///
/// Returns the reply message when a short code matched (the message is the
/// flow's whole response), or `None` to continue with general routing.
/// Campaign codes are checked before event codes, per agency scan order.
pub async fn handle_short_code(
    store: &Store,
    dispatcher: &NotificationDispatcher,
    from: &str,
    to: &str,
    body: &str,
) -> Result<Option<String>, DatabaseError> {
    for agency in store.list_active_agencies().await? {
        let config = agency.config();
        if short_code_matches(config.campaign_short_code.as_deref(), to) {
            debug!(agency = %agency.id, "Inbound SMS matched campaign short code");
            return Ok(Some(
                handle_campaign_reply(store, dispatcher, &agency.id, from, body).await?,
            ));
        }
        if short_code_matches(config.event_short_code.as_deref(), to) {
            debug!(agency = %agency.id, "Inbound SMS matched event short code");
            return Ok(Some(handle_event_vote(store, &agency.id, from, body).await?));
        }
    }
    Ok(None)
}

async fn handle_campaign_reply(
    store: &Store,
    dispatcher: &NotificationDispatcher,
    agency_id: &str,
    from: &str,
    body: &str,
) -> Result<String, DatabaseError> {
    let Some(campaign) = store.find_active_campaign(agency_id).await? else {
        return Ok("Thanks! There is no active campaign right now.".to_string());
    };
    let Some(user) = find_agency_user_by_phone(store, agency_id, from).await? else {
        return Ok("Thanks! We could not match your number.".to_string());
    };
    if campaign.audience_mode == "selected"
        && !store.is_campaign_recipient(&campaign.id, &user.id).await?
    {
        return Ok("Thanks! You are not in this campaign audience.".to_string());
    }

    let options = parse_options(campaign.response_options.as_deref(), default_campaign_options());
    let Some(matched) = normalize_response(body, &options) else {
        return Ok("Reply with Y, N, or OPT OUT.".to_string());
    };

    if matched.key == "OPTOUT" {
        store.upsert_campaign_opt_out(agency_id, &user.id, "sms").await?;
        notify_supervisors_of_opt_out(store, dispatcher, agency_id, &user).await?;
        return Ok(
            "You are opted out of engagement campaigns. Your supervisor has been notified."
                .to_string(),
        );
    }
    if store.has_campaign_opt_out(agency_id, &user.id).await? {
        return Ok("You are opted out of engagement campaigns.".to_string());
    }

    store
        .upsert_campaign_response(
            &campaign.id,
            &user.id,
            &matched.key,
            &matched.label,
            &matched.raw,
            from,
        )
        .await?;
    Ok("Thanks for your response.".to_string())
}

async fn notify_supervisors_of_opt_out(
    store: &Store,
    dispatcher: &NotificationDispatcher,
    agency_id: &str,
    user: &User,
) -> Result<(), DatabaseError> {
    let name = match &user.last_name {
        Some(last) => format!("{} {}.", user.first_name, last.chars().next().unwrap_or('?')),
        None => user.first_name.clone(),
    };
    for supervisor_id in store.supervisor_ids_for(&user.id, agency_id).await? {
        dispatcher
            .create_and_dispatch(
                NewNotification {
                    notification_type: "campaign_opt_out".to_string(),
                    severity: "info".to_string(),
                    title: "Campaign opt-out".to_string(),
                    message: format!("{name} opted out of engagement campaigns via SMS."),
                    user_id: supervisor_id,
                    agency_id: Some(agency_id.to_string()),
                    related_entity_type: Some("campaign".to_string()),
                    related_entity_id: None,
                },
                &DecisionContext::default(),
            )
            .await?;
    }
    Ok(())
}

fn event_instructions(event: &CompanyEvent, options: &[ResponseOption]) -> String {
    let opts = options
        .iter()
        .map(|o| o.key.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    match &event.sms_code {
        Some(code) => format!("Reply with \"{code} <option>\". Options: {opts}."),
        None => format!("Reply with one of: {opts}."),
    }
}

async fn handle_event_vote(
    store: &Store,
    agency_id: &str,
    from: &str,
    body: &str,
) -> Result<String, DatabaseError> {
    let Some(user) = find_agency_user_by_phone(store, agency_id, from).await? else {
        return Ok("Thanks! We could not match your number.".to_string());
    };
    let open_events = store.list_open_voting_events(agency_id).await?;
    if open_events.is_empty() {
        return Ok("Thanks! There is no active event vote right now.".to_string());
    }

    // "<code> <option>"; with a single open event the code may be omitted.
    let raw = body.trim();
    let mut tokens = raw.splitn(2, char::is_whitespace);
    let first = tokens.next().unwrap_or_default();
    let rest = tokens.next().unwrap_or_default().trim();

    let mut target: Option<&CompanyEvent> = None;
    let mut response_text = "";
    for event in &open_events {
        if let Some(code) = &event.sms_code {
            if first.eq_ignore_ascii_case(code) {
                target = Some(event);
                response_text = rest;
                break;
            }
        }
    }
    if target.is_none() && open_events.len() == 1 {
        target = Some(&open_events[0]);
        response_text = raw;
    }
    let Some(event) = target else {
        let codes = open_events
            .iter()
            .filter_map(|e| e.sms_code.as_deref())
            .collect::<Vec<_>>()
            .join(", ");
        return Ok(format!("Reply with \"<code> <option>\". Active codes: {codes}"));
    };

    if event.audience_mode == "selected" && !store.is_event_recipient(&event.id, &user.id).await? {
        return Ok("Thanks! You are not in this event audience.".to_string());
    }

    let options = parse_options(event.voting_options.as_deref(), Vec::new());
    let Some(matched) = normalize_response(response_text, &options) else {
        return Ok(event_instructions(event, &options));
    };

    store
        .upsert_event_response(&event.id, &user.id, &matched.key, &matched.label, &matched.raw, from)
        .await?;
    Ok(format!("Thanks! Recorded: {}.", matched.label))
}
