//! Number and owner resolution.
//!
//! Three fallback chains decide which phone number and which staff member
//! owns an outbound or inbound call/message. Each chain is an ordered list
//! of steps evaluated lazily; the first step that resolves wins. Inbound
//! resolution trades precision for guaranteed delivery: a message is never
//! silently dropped while the agency has any viable human to notify.

use tracing::debug;

use crate::agency::ReminderSenderMode;
use crate::error::{DatabaseError, Error, RoutingError};
use crate::store::{Client, NumberAssignment, PhoneNumber, Store, User};

/// Who a resolved number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerType {
    Staff,
    Agency,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerType::Staff => "staff",
            OwnerType::Agency => "agency",
        }
    }
}

/// Result of outbound number resolution. Transient; recomputed per send.
#[derive(Debug, Clone)]
pub struct OutboundResolution {
    pub number: PhoneNumber,
    pub assignment: Option<NumberAssignment>,
    pub owner_type: OwnerType,
}

/// Result of inbound route resolution. Transient; recomputed per webhook.
#[derive(Debug, Clone, Default)]
pub struct InboundRoute {
    pub number: Option<PhoneNumber>,
    pub assignment: Option<NumberAssignment>,
    pub owner_user: Option<User>,
    pub owner_type: Option<OwnerType>,
    /// Every staff member who should be notified. For shared numbers this
    /// can be several users; otherwise it mirrors the owner.
    pub eligible_user_ids: Vec<String>,
    pub agency_id: Option<String>,
    pub client: Option<Client>,
}

impl InboundRoute {
    pub fn client_id(&self) -> Option<&str> {
        self.client.as_ref().map(|c| c.id.as_str())
    }

    pub fn number_id(&self) -> Option<&str> {
        self.number.as_ref().map(|n| n.id.as_str())
    }
}

/// Resolve the number a staff member sends from.
///
/// Order, first match wins:
/// 1. an explicitly requested number, after access checks
/// 2. the caller's primary assignment, if its number is still usable
/// 3. the first active number of the target agency (from the client, or
///    the caller's own agency when no client is given)
///
/// Failures are [`RoutingError`] variants; callers must treat
/// [`RoutingError::NoNumberAvailable`] as a hard stop.
pub async fn resolve_outbound_number(
    store: &Store,
    user_id: &str,
    client_id: Option<&str>,
    requested_number_id: Option<&str>,
) -> Result<OutboundResolution, Error> {
    if let Some(number_id) = requested_number_id {
        return resolve_requested_number(store, user_id, number_id).await;
    }

    if let Some(primary) = store.find_primary_assignment(user_id).await? {
        if let Some(number) = store.find_number(&primary.number_id).await? {
            if number.is_usable() {
                return Ok(OutboundResolution {
                    number,
                    assignment: Some(primary),
                    owner_type: OwnerType::Staff,
                });
            }
        }
    }

    let agency_id = match client_id {
        Some(cid) => store.find_client(cid).await?.and_then(|c| c.agency_id),
        None => store.first_agency_id_for_user(user_id).await?,
    };
    if let Some(agency_id) = agency_id {
        if let Some(number) = store
            .list_active_agency_numbers(&agency_id)
            .await?
            .into_iter()
            .next()
        {
            return Ok(OutboundResolution {
                number,
                assignment: None,
                owner_type: OwnerType::Agency,
            });
        }
    }

    Err(RoutingError::NoNumberAvailable.into())
}

async fn resolve_requested_number(
    store: &Store,
    user_id: &str,
    number_id: &str,
) -> Result<OutboundResolution, Error> {
    let number = store
        .find_number(number_id)
        .await?
        .filter(PhoneNumber::is_usable)
        .ok_or(RoutingError::NumberUnavailable)?;

    let assignment = store.find_assignment_for_number(&number.id).await?;
    let eligible = store.list_eligible_user_ids(&number.id).await?;
    let user_in_pool = eligible.iter().any(|id| id == user_id);

    if let Some(holder) = &assignment {
        if holder.user_id != user_id && !user_in_pool {
            return Err(RoutingError::NumberNotAssigned.into());
        }
    } else if !user_in_pool && !store.user_has_agency(user_id, &number.agency_id).await? {
        return Err(RoutingError::NumberNotAccessible.into());
    }

    let owner_type = if assignment.is_some() || user_in_pool {
        OwnerType::Staff
    } else {
        OwnerType::Agency
    };
    Ok(OutboundResolution {
        number,
        assignment,
        owner_type,
    })
}

/// Resolve the number reminder SMS is sent from.
///
/// Agency policy decides: in `agency_default` mode reminders always go out
/// from the agency's shared number; in `provider_optional` mode a provider
/// who has opted in via preference uses the regular outbound chain.
pub async fn resolve_reminder_number(
    store: &Store,
    provider_user_id: &str,
    client_id: Option<&str>,
) -> Result<OutboundResolution, Error> {
    let agency_id = match client_id {
        Some(cid) => store.find_client(cid).await?.and_then(|c| c.agency_id),
        None => store.first_agency_id_for_user(provider_user_id).await?,
    };
    let config = match &agency_id {
        Some(id) => store.agency_config(id).await?,
        None => Default::default(),
    };

    let use_own_number = store
        .user_preferences(provider_user_id)
        .await?
        .map(|p| p.sms_use_own_number_for_reminders)
        .unwrap_or(true);

    if config.reminder_sender_mode() == ReminderSenderMode::ProviderOptional && use_own_number {
        return resolve_outbound_number(store, provider_user_id, client_id, None).await;
    }

    if let Some(agency_id) = agency_id {
        if let Some(number) = store
            .list_active_agency_numbers(&agency_id)
            .await?
            .into_iter()
            .next()
        {
            return Ok(OutboundResolution {
                number,
                assignment: None,
                owner_type: OwnerType::Agency,
            });
        }
    }
    Err(RoutingError::NoNumberAvailable.into())
}

/// Resolve who an inbound SMS/call belongs to.
///
/// Steps, first match wins:
/// 1. the destination number's eligible-recipient pool (or its single
///    assignment), else the legacy user `system_phone_number` binding
/// 2. the sending client's named staff member, if they share the agency
/// 3. the agency's configured default routing user
/// 4. the agency's support staff (all of them), else any admin-capable user
pub async fn resolve_inbound_route(
    store: &Store,
    to_number: &str,
    from_number: &str,
) -> Result<InboundRoute, DatabaseError> {
    let mut route = InboundRoute::default();

    route.number = store.find_number_by_phone(to_number).await?;
    if let Some(number) = &route.number {
        let eligible = store.list_eligible_user_ids(&number.id).await?;
        route.assignment = store.find_assignment_for_number(&number.id).await?;
        if let Some(first) = eligible.first() {
            route.owner_user = store.find_user(first).await?;
            route.owner_type = Some(OwnerType::Staff);
            route.eligible_user_ids = eligible;
        } else if let Some(assignment) = &route.assignment {
            route.owner_user = store.find_user(&assignment.user_id).await?;
            route.owner_type = Some(OwnerType::Staff);
        } else {
            route.owner_type = Some(OwnerType::Agency);
        }
    } else {
        route.owner_user = store.find_user_by_system_phone(to_number).await?;
        route.owner_type = route.owner_user.as_ref().map(|_| OwnerType::Staff);
        if let Some(owner) = &route.owner_user {
            route.eligible_user_ids = vec![owner.id.clone()];
        }
    }

    route.client = store.find_client_by_contact_phone(from_number).await?;
    route.agency_id = match (&route.number, &route.client) {
        (Some(n), _) => Some(n.agency_id.clone()),
        (None, Some(c)) if c.agency_id.is_some() => c.agency_id.clone(),
        _ => match &route.owner_user {
            Some(owner) => store.first_agency_id_for_user(&owner.id).await?,
            None => None,
        },
    };

    if route.owner_user.is_none() && route.number.is_some() {
        resolve_client_provider(store, &mut route).await?;
    }
    if route.owner_user.is_none() && route.number.is_some() {
        resolve_agency_default_user(store, &mut route).await?;
    }
    if route.owner_user.is_none() && route.number.is_some() {
        resolve_support_or_admin(store, &mut route).await?;
    }

    if route.eligible_user_ids.is_empty() {
        if let Some(owner) = &route.owner_user {
            route.eligible_user_ids = vec![owner.id.clone()];
        }
    }

    debug!(
        to = to_number,
        owner = route.owner_user.as_ref().map(|u| u.id.as_str()),
        owner_type = route.owner_type.map(|t| t.as_str()),
        recipients = route.eligible_user_ids.len(),
        "Inbound route resolved"
    );
    Ok(route)
}

/// Step 2: the client's record names a staff member sharing the agency.
async fn resolve_client_provider(
    store: &Store,
    route: &mut InboundRoute,
) -> Result<(), DatabaseError> {
    let Some(provider_id) = route.client.as_ref().and_then(|c| c.provider_id.clone()) else {
        return Ok(());
    };
    let Some(agency_id) = route.agency_id.clone() else {
        return Ok(());
    };
    if store.user_has_agency(&provider_id, &agency_id).await? {
        route.owner_user = store.find_user(&provider_id).await?;
        if route.owner_user.is_some() {
            route.owner_type = Some(OwnerType::Staff);
            route.eligible_user_ids = vec![provider_id];
        }
    }
    Ok(())
}

/// Step 3: an agency-level configured default routing user.
async fn resolve_agency_default_user(
    store: &Store,
    route: &mut InboundRoute,
) -> Result<(), DatabaseError> {
    let Some(agency_id) = route.agency_id.clone() else {
        return Ok(());
    };
    let config = store.agency_config(&agency_id).await?;
    let Some(default_user_id) = config.sms_default_user_id else {
        return Ok(());
    };
    if store.user_has_agency(&default_user_id, &agency_id).await? {
        route.owner_user = store.find_user(&default_user_id).await?;
        if route.owner_user.is_some() {
            route.owner_type = Some(OwnerType::Agency);
            route.eligible_user_ids = vec![default_user_id];
        }
    }
    Ok(())
}

/// Step 4: all support staff, else any admin-capable user.
async fn resolve_support_or_admin(
    store: &Store,
    route: &mut InboundRoute,
) -> Result<(), DatabaseError> {
    let Some(agency_id) = route.agency_id.clone() else {
        return Ok(());
    };
    let support_ids = store.list_support_user_ids(&agency_id).await?;
    if let Some(first) = support_ids.first() {
        route.owner_user = store.find_user(first).await?;
        route.owner_type = Some(OwnerType::Agency);
        route.eligible_user_ids = support_ids;
        return Ok(());
    }
    if let Some(admin_id) = store.find_any_admin_id(&agency_id).await? {
        route.owner_user = store.find_user(&admin_id).await?;
        if route.owner_user.is_some() {
            route.owner_type = Some(OwnerType::Agency);
            route.eligible_user_ids = vec![admin_id];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn requested_number_checks_access() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        let number = s.insert_number(&agency, "4155550100").await.unwrap();
        let owner = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        let outsider = s.insert_user("Zed", None, "provider", None, None).await.unwrap();
        s.assign_number(&number, &owner, true).await.unwrap();

        let resolved = resolve_outbound_number(&s, &owner, None, Some(&number)).await.unwrap();
        assert_eq!(resolved.number.id, number);
        assert_eq!(resolved.owner_type, OwnerType::Staff);

        let err = resolve_outbound_number(&s, &outsider, None, Some(&number))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::NumberNotAssigned)));
    }

    #[tokio::test]
    async fn requested_number_must_be_usable() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        let number = s.insert_number(&agency, "4155550100").await.unwrap();
        let user = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        s.mark_number_released(&number).await.unwrap();

        let err = resolve_outbound_number(&s, &user, None, Some(&number)).await.unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::NumberUnavailable)));
    }

    #[tokio::test]
    async fn unassigned_number_requires_shared_agency() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        let number = s.insert_number(&agency, "4155550100").await.unwrap();
        let member = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        let outsider = s.insert_user("Zed", None, "provider", None, None).await.unwrap();
        s.add_user_to_agency(&member, &agency).await.unwrap();

        let resolved = resolve_outbound_number(&s, &member, None, Some(&number)).await.unwrap();
        assert_eq!(resolved.owner_type, OwnerType::Agency);

        let err = resolve_outbound_number(&s, &outsider, None, Some(&number))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::NumberNotAccessible)));
    }

    #[tokio::test]
    async fn falls_back_to_agency_number_without_primary() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        let number = s.insert_number(&agency, "4155550100").await.unwrap();
        let user = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        s.add_user_to_agency(&user, &agency).await.unwrap();

        let resolved = resolve_outbound_number(&s, &user, None, None).await.unwrap();
        assert_eq!(resolved.number.id, number);
        assert_eq!(resolved.owner_type, OwnerType::Agency);
        assert!(resolved.assignment.is_none());
    }

    #[tokio::test]
    async fn no_number_is_a_hard_stop() {
        let s = store().await;
        let user = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        let err = resolve_outbound_number(&s, &user, None, None).await.unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::NoNumberAvailable)));
    }

    #[tokio::test]
    async fn primary_assignment_wins_when_usable() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        let shared = s.insert_number(&agency, "4155550100").await.unwrap();
        let own = s.insert_number(&agency, "4155550101").await.unwrap();
        let user = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        s.add_user_to_agency(&user, &agency).await.unwrap();
        s.assign_number(&own, &user, true).await.unwrap();
        let _ = shared;

        let resolved = resolve_outbound_number(&s, &user, None, None).await.unwrap();
        assert_eq!(resolved.number.id, own);
        assert_eq!(resolved.owner_type, OwnerType::Staff);
    }

    #[tokio::test]
    async fn reminder_number_honors_agency_default_mode() {
        let s = store().await;
        let agency = s
            .insert_agency("A", None, Some(r#"{"smsReminderSenderMode": "agency_default"}"#))
            .await
            .unwrap();
        let shared = s.insert_number(&agency, "4155550100").await.unwrap();
        let own = s.insert_number(&agency, "4155550101").await.unwrap();
        let user = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        s.add_user_to_agency(&user, &agency).await.unwrap();
        s.assign_number(&own, &user, true).await.unwrap();

        // Agency-default mode ignores the provider's own number.
        let resolved = resolve_reminder_number(&s, &user, None).await.unwrap();
        assert_eq!(resolved.number.id, shared);
        assert_eq!(resolved.owner_type, OwnerType::Agency);

        s.set_agency_flags(&agency, r#"{"smsReminderSenderMode": "provider_optional"}"#)
            .await
            .unwrap();
        let resolved = resolve_reminder_number(&s, &user, None).await.unwrap();
        assert_eq!(resolved.number.id, own);
    }

    #[tokio::test]
    async fn inbound_owner_from_assignment_pool() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        let number = s.insert_number(&agency, "4155550100").await.unwrap();
        let u1 = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        let u2 = s.insert_user("Ben", None, "provider", None, None).await.unwrap();
        s.assign_number(&number, &u1, true).await.unwrap();
        s.assign_number(&number, &u2, false).await.unwrap();

        let route = resolve_inbound_route(&s, "4155550100", "4155550001").await.unwrap();
        assert_eq!(route.owner_user.unwrap().id, u1);
        assert_eq!(route.owner_type, Some(OwnerType::Staff));
        assert_eq!(route.eligible_user_ids, vec![u1, u2]);
        assert_eq!(route.agency_id.as_deref(), Some(agency.as_str()));
    }

    #[tokio::test]
    async fn inbound_legacy_system_phone_binding() {
        let s = store().await;
        let user = s
            .insert_user("Ana", None, "provider", None, Some("4155550177"))
            .await
            .unwrap();

        let route = resolve_inbound_route(&s, "(415) 555-0177", "4155550001").await.unwrap();
        assert_eq!(route.owner_user.unwrap().id, user.clone());
        assert!(route.number.is_none());
        assert_eq!(route.eligible_user_ids, vec![user]);
    }

    #[tokio::test]
    async fn inbound_falls_back_to_client_provider() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        s.insert_number(&agency, "4155550100").await.unwrap();
        let provider = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        s.add_user_to_agency(&provider, &agency).await.unwrap();
        s.insert_client(Some(&agency), Some(&provider), Some("C.D."), Some("4155550001"))
            .await
            .unwrap();

        let route = resolve_inbound_route(&s, "4155550100", "4155550001").await.unwrap();
        assert_eq!(route.owner_user.unwrap().id, provider.clone());
        assert_eq!(route.owner_type, Some(OwnerType::Staff));
        assert_eq!(route.eligible_user_ids, vec![provider]);
    }

    #[tokio::test]
    async fn inbound_falls_back_to_default_user_then_support() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        s.insert_number(&agency, "4155550100").await.unwrap();
        let support_a = s.insert_user("Sam", None, "support", None, None).await.unwrap();
        let support_b = s.insert_user("Sue", None, "support", None, None).await.unwrap();
        s.add_user_to_agency(&support_a, &agency).await.unwrap();
        s.add_user_to_agency(&support_b, &agency).await.unwrap();

        // No default user configured: all support staff are notified.
        let route = resolve_inbound_route(&s, "4155550100", "4155559999").await.unwrap();
        assert_eq!(route.owner_type, Some(OwnerType::Agency));
        assert_eq!(route.eligible_user_ids.len(), 2);

        // A configured default user takes precedence over support.
        let default_user = s.insert_user("Dee", None, "provider", None, None).await.unwrap();
        s.add_user_to_agency(&default_user, &agency).await.unwrap();
        s.set_agency_flags(&agency, &format!(r#"{{"smsDefaultUserId": "{default_user}"}}"#))
            .await
            .unwrap();
        let route = resolve_inbound_route(&s, "4155550100", "4155559999").await.unwrap();
        assert_eq!(route.owner_user.unwrap().id, default_user.clone());
        assert_eq!(route.eligible_user_ids, vec![default_user]);
    }

    #[tokio::test]
    async fn inbound_unknown_number_has_no_owner() {
        let s = store().await;
        let route = resolve_inbound_route(&s, "4155550199", "4155550001").await.unwrap();
        assert!(route.owner_user.is_none());
        assert!(route.eligible_user_ids.is_empty());
        assert!(route.owner_type.is_none());
    }
}
