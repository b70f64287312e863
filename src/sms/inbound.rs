//! Inbound SMS conversational state machine.
//!
//! One webhook event runs through an ordered pipeline: short-code
//! interception, route resolution, keyword handling, unconditional logging,
//! support mirroring, forwarding, safety-net fan-out, throttled after-hours
//! auto-reply, the compliance gate, and emergency forwarding. Any stage's
//! transport failure is recorded and the pipeline continues; the webhook
//! always gets a reply.

use std::sync::Arc;

use chrono::{Duration, Local, Utc};
use tracing::{debug, warn};

use crate::agency::{AgencyConfig, ComplianceMode};
use crate::error::Error;
use crate::gateway::{SmsGateway, SmsRequest};
use crate::notify::{DecisionContext, NotificationDispatcher, gatekeeper};
use crate::phone;
use crate::routing::{self, InboundRoute};
use crate::sms::{engagement, keywords, keywords::Keyword};
use crate::store::{
    DeliveryStatus, Direction, EscalationType, NewMessageLog, NewNotification, OptInSource,
    OptInStatus, Store, ThreadMode, User, RULE_AFTER_HOURS, RULE_EMERGENCY_FORWARD, RULE_FORWARD,
};

const REPLY_RECEIVED: &str = "Thanks. Your message was received.";
const REPLY_UNROUTED: &str = "Thanks. We could not route your message.";
const MIRROR_BODY_LIMIT: usize = 180;
const AUTO_REPLY_WINDOW_HOURS: i64 = 4;

/// One inbound SMS event.
#[derive(Debug, Clone)]
pub struct InboundSms {
    pub from: String,
    pub to: String,
    pub body: String,
    pub provider_message_id: Option<String>,
}

pub struct InboundMessageRouter {
    store: Arc<Store>,
    sms: Arc<dyn SmsGateway>,
    dispatcher: Arc<NotificationDispatcher>,
}

impl InboundMessageRouter {
    pub fn new(
        store: Arc<Store>,
        sms: Arc<dyn SmsGateway>,
        dispatcher: Arc<NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            sms,
            dispatcher,
        }
    }

    /// Process one inbound SMS and produce the reply message.
    ///
    /// Never fails: internal errors are logged and degrade to the generic
    /// acknowledgement so the transport provider does not retry.
    pub async fn handle(&self, inbound: &InboundSms) -> String {
        match self.process(inbound).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, from = %inbound.from, "Inbound SMS processing failed");
                REPLY_RECEIVED.to_string()
            }
        }
    }

    async fn process(&self, inbound: &InboundSms) -> Result<String, Error> {
        // Short codes take priority over all general routing.
        if let Some(reply) = engagement::handle_short_code(
            &self.store,
            &self.dispatcher,
            &inbound.from,
            &inbound.to,
            &inbound.body,
        )
        .await?
        {
            return Ok(reply);
        }

        let route = routing::resolve_inbound_route(&self.store, &inbound.to, &inbound.from).await?;
        let Some(owner) = route.owner_user.clone() else {
            debug!(to = %inbound.to, "Inbound SMS could not be routed");
            return Ok(REPLY_UNROUTED.to_string());
        };

        let config = match route.agency_id.as_deref() {
            Some(agency_id) => self.store.agency_config(agency_id).await?,
            None => AgencyConfig::default(),
        };
        let keyword = keywords::detect_keyword(&inbound.body);

        self.record_consent(&route, keyword).await?;

        // Compliance/audit requirement: the inbound row exists before any
        // reply logic runs.
        let inbound_log_id = self
            .store
            .insert_message_log(
                Direction::Inbound,
                DeliveryStatus::Received,
                NewMessageLog {
                    agency_id: route.agency_id.clone(),
                    number_id: route.number_id().map(str::to_string),
                    user_id: Some(owner.id.clone()),
                    assigned_user_id: route.assignment.as_ref().map(|a| a.user_id.clone()),
                    owner_type: route.owner_type.map(|t| t.as_str().to_string()),
                    client_id: route.client_id().map(str::to_string),
                    body: inbound.body.clone(),
                    from_number: inbound.from.clone(),
                    to_number: inbound.to.clone(),
                    provider_message_id: inbound.provider_message_id.clone(),
                    metadata: None,
                },
            )
            .await?;

        self.mirror_to_support(inbound, &route, &owner, &config, &inbound_log_id)
            .await?;

        let mut reply = match keyword {
            Some(Keyword::Stop) => config.stop_reply().to_string(),
            Some(Keyword::Start) => config.start_reply().to_string(),
            Some(Keyword::Help) => config.help_reply().to_string(),
            None => {
                self.forward_per_rule(inbound, &route, &owner).await?;
                self.fan_out_alerts(&route, &owner, &inbound_log_id).await?;
                self.maybe_auto_reply(inbound, &route, &owner).await?;
                REPLY_RECEIVED.to_string()
            }
        };

        // Compliance gate: an opted-out sender only ever hears the opt-out
        // notice, whatever was decided above.
        if config.compliance_mode() == ComplianceMode::OptInRequired {
            if let (Some(client_id), Some(number_id)) = (route.client_id(), route.number_id()) {
                let state = self.store.find_opt_in_state(client_id, number_id).await?;
                if state.map(|s| s.status) == Some(OptInStatus::OptedOut) {
                    reply = config.opt_out_notice().to_string();
                }
            }
        }

        self.forward_emergency(inbound, &route, &owner, &inbound_log_id)
            .await?;

        Ok(reply)
    }

    /// Upsert consent for the (agency, client, number) tuple. Any inbound
    /// message from a known client implies opt-in unless it is an explicit
    /// STOP; this is a deliberate business rule.
    async fn record_consent(
        &self,
        route: &InboundRoute,
        keyword: Option<Keyword>,
    ) -> Result<(), Error> {
        let (Some(agency_id), Some(client_id), Some(number_id)) =
            (route.agency_id.as_deref(), route.client_id(), route.number_id())
        else {
            return Ok(());
        };
        let (status, source) = match keyword {
            Some(Keyword::Stop) => (OptInStatus::OptedOut, OptInSource::ClientStop),
            Some(Keyword::Start) => (OptInStatus::OptedIn, OptInSource::ClientStart),
            // HELP asks a question; it does not change consent.
            Some(Keyword::Help) => return Ok(()),
            None => (OptInStatus::OptedIn, OptInSource::InboundMessage),
        };
        self.store
            .upsert_opt_in_state(agency_id, client_id, number_id, status, source)
            .await?;
        Ok(())
    }

    /// Relay a truncated copy of the message to the agency's support
    /// fallback number when the owner has mirroring enabled, and keep a
    /// `provider_mirror` escalation open for the thread.
    async fn mirror_to_support(
        &self,
        inbound: &InboundSms,
        route: &InboundRoute,
        owner: &User,
        config: &AgencyConfig,
        inbound_log_id: &str,
    ) -> Result<(), Error> {
        let Some(support_phone) = config.sms_support_fallback_phone.as_deref() else {
            return Ok(());
        };
        let prefs = self.store.user_preferences(&owner.id).await?;
        let Some(prefs) = prefs.filter(|p| p.support_mirror_enabled) else {
            return Ok(());
        };

        let excerpt: String = inbound.body.chars().take(MIRROR_BODY_LIMIT).collect();
        let body = format!("Mirror: inbound to {}: \"{excerpt}\"", inbound.to);
        let sent = self
            .relay(inbound, route, owner, support_phone, &body, serde_json::json!({"mirror": true}))
            .await;
        if !sent {
            return Ok(());
        }

        if let Some(client_id) = route.client_id() {
            self.store
                .create_escalation_if_absent(
                    route.agency_id.as_deref(),
                    &owner.id,
                    client_id,
                    Some(inbound_log_id),
                    phone::normalize(support_phone).as_deref(),
                    EscalationType::ProviderMirror,
                    ThreadMode::from_str(&prefs.sms_support_thread_mode),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// Configured forwarding: relay the message to a user and/or an
    /// external phone. Best-effort; never blocks the rest of the flow.
    async fn forward_per_rule(
        &self,
        inbound: &InboundSms,
        route: &InboundRoute,
        owner: &User,
    ) -> Result<(), Error> {
        let Some(number_id) = route.number_id() else {
            return Ok(());
        };
        let Some(rule) = self.store.find_number_rule(number_id, RULE_FORWARD).await? else {
            return Ok(());
        };
        let body = format!("Fwd from {}: {}", inbound.from, inbound.body);

        if let Some(phone) = rule.forward_to_phone.as_deref() {
            self.relay(inbound, route, owner, phone, &body, serde_json::json!({"forwarded": true}))
                .await;
        }
        if let Some(user_id) = rule.forward_to_user_id.as_deref() {
            if let Some(target) = self.store.find_user(user_id).await? {
                if let Some(phone) = target.contact_phone() {
                    let phone = phone.to_string();
                    self.relay(
                        inbound,
                        route,
                        &target,
                        &phone,
                        &body,
                        serde_json::json!({"forwarded": true}),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Safety-net fan-out: in-app alerts for every eligible recipient plus
    /// every support-role user. SMS fan-out stays gated by the dispatcher.
    async fn fan_out_alerts(
        &self,
        route: &InboundRoute,
        owner: &User,
        inbound_log_id: &str,
    ) -> Result<(), Error> {
        let Some(agency_id) = route.agency_id.clone() else {
            return Ok(());
        };
        let client_label = route
            .client
            .as_ref()
            .and_then(|c| c.initials.clone());
        let message = match &client_label {
            Some(initials) => format!("New message from client {initials}."),
            None => "New inbound message received.".to_string(),
        };

        for user_id in &route.eligible_user_ids {
            self.dispatcher
                .create_and_dispatch(
                    NewNotification {
                        notification_type: "inbound_client_message".to_string(),
                        severity: "urgent".to_string(),
                        title: "New inbound client message".to_string(),
                        message: message.clone(),
                        user_id: user_id.clone(),
                        agency_id: Some(agency_id.clone()),
                        related_entity_type: Some("message_log".to_string()),
                        related_entity_id: Some(inbound_log_id.to_string()),
                    },
                    &DecisionContext::urgent(),
                )
                .await?;
        }

        let owner_label = match &owner.last_name {
            Some(last) => format!("{} {}.", owner.first_name, last.chars().next().unwrap_or('?')),
            None => owner.first_name.clone(),
        };
        let support_message = match &client_label {
            Some(initials) => {
                format!("Inbound message from {initials} (assigned staff: {owner_label})")
            }
            None => format!("Inbound message (assigned staff: {owner_label})"),
        };
        for support_id in self.store.list_support_user_ids(&agency_id).await? {
            self.dispatcher
                .create_and_dispatch(
                    NewNotification {
                        notification_type: "support_safety_net_alert".to_string(),
                        severity: "urgent".to_string(),
                        title: "Safety Net: inbound client message".to_string(),
                        message: support_message.clone(),
                        user_id: support_id,
                        agency_id: Some(agency_id.clone()),
                        related_entity_type: Some("message_log".to_string()),
                        related_entity_id: Some(inbound_log_id.to_string()),
                    },
                    &DecisionContext::urgent(),
                )
                .await?;
        }
        Ok(())
    }

    /// After-hours auto-reply, at most once per (user, client-phone) pair
    /// per rolling 4-hour window.
    async fn maybe_auto_reply(
        &self,
        inbound: &InboundSms,
        route: &InboundRoute,
        owner: &User,
    ) -> Result<(), Error> {
        let prefs = self.store.user_preferences(&owner.id).await?;
        let user_message = prefs
            .as_ref()
            .filter(|p| p.auto_reply_enabled)
            .and_then(|p| p.auto_reply_message.clone());
        let rule_message = match route.number_id() {
            Some(number_id) => self
                .store
                .find_number_rule(number_id, RULE_AFTER_HOURS)
                .await?
                .and_then(|r| r.auto_reply_text),
            None => None,
        };
        let Some(message) = user_message.or(rule_message) else {
            return Ok(());
        };

        // Only outside the owner's working window; bypass reasons do not
        // matter here, the auto-reply is for the client, not the owner.
        let decision = gatekeeper::decide_channels(
            &self.store,
            &owner.id,
            &DecisionContext::default(),
            Local::now().naive_local(),
        )
        .await?;
        if !decision.has_reason("quiet_hours_outside_window") {
            return Ok(());
        }

        if let Some(last) = self.store.auto_reply_last_sent(&owner.id, &inbound.from).await? {
            if Utc::now() - last < Duration::hours(AUTO_REPLY_WINDOW_HOURS) {
                debug!(user = %owner.id, "Auto-reply suppressed by throttle");
                return Ok(());
            }
        }

        let from = route
            .number
            .as_ref()
            .map(|n| n.phone_number.clone())
            .or_else(|| owner.system_phone_number.clone());
        let Some(from) = from else {
            return Ok(());
        };

        let log_id = self
            .store
            .insert_message_log(
                Direction::Outbound,
                DeliveryStatus::Pending,
                NewMessageLog {
                    agency_id: route.agency_id.clone(),
                    number_id: route.number_id().map(str::to_string),
                    user_id: Some(owner.id.clone()),
                    client_id: route.client_id().map(str::to_string),
                    body: message.clone(),
                    from_number: from.clone(),
                    to_number: inbound.from.clone(),
                    metadata: Some(serde_json::json!({"autoReply": true})),
                    ..Default::default()
                },
            )
            .await?;

        match self
            .sms
            .send_sms(SmsRequest {
                to: phone::normalize_or_raw(&inbound.from),
                from: phone::normalize_or_raw(&from),
                body: message,
            })
            .await
        {
            Ok(receipt) => {
                self.store
                    .mark_message_sent(
                        &log_id,
                        receipt.provider_message_id.as_deref(),
                        Some(&serde_json::json!({"autoReply": true, "status": receipt.status})),
                    )
                    .await?;
                self.store
                    .touch_auto_reply_throttle(&owner.id, &inbound.from)
                    .await?;
            }
            Err(e) => {
                warn!(error = %e, "Auto-reply send failed");
                self.store.mark_message_failed(&log_id, &e.to_string()).await?;
            }
        }
        Ok(())
    }

    /// Emergency-keyword forward: always attempted last, independent of
    /// everything above.
    async fn forward_emergency(
        &self,
        inbound: &InboundSms,
        route: &InboundRoute,
        owner: &User,
        inbound_log_id: &str,
    ) -> Result<(), Error> {
        if !keywords::contains_emergency_term(&inbound.body) {
            return Ok(());
        }
        let Some(number_id) = route.number_id() else {
            return Ok(());
        };
        let Some(rule) = self
            .store
            .find_number_rule(number_id, RULE_EMERGENCY_FORWARD)
            .await?
        else {
            return Ok(());
        };

        if let Some(phone) = rule.forward_to_phone.as_deref() {
            let body = format!("EMERGENCY from {}: {}", inbound.from, inbound.body);
            self.relay(inbound, route, owner, phone, &body, serde_json::json!({"emergency": true}))
                .await;
        }
        let alert_user = rule.forward_to_user_id.clone().unwrap_or_else(|| owner.id.clone());
        self.dispatcher
            .create_and_dispatch(
                NewNotification {
                    notification_type: "emergency_inbound_message".to_string(),
                    severity: "urgent".to_string(),
                    title: "Emergency keyword in inbound message".to_string(),
                    message: format!("Inbound message from {} contains an emergency term.", inbound.from),
                    user_id: alert_user,
                    agency_id: route.agency_id.clone(),
                    related_entity_type: Some("message_log".to_string()),
                    related_entity_id: Some(inbound_log_id.to_string()),
                },
                &DecisionContext::urgent(),
            )
            .await?;
        Ok(())
    }

    /// Send a relay SMS and log the attempt. Returns whether the send
    /// succeeded; failures are recorded on the log row and swallowed.
    async fn relay(
        &self,
        inbound: &InboundSms,
        route: &InboundRoute,
        as_user: &User,
        to: &str,
        body: &str,
        metadata: serde_json::Value,
    ) -> bool {
        let from = route
            .number
            .as_ref()
            .map(|n| n.phone_number.clone())
            .unwrap_or_else(|| inbound.to.clone());

        let log_id = match self
            .store
            .insert_message_log(
                Direction::Outbound,
                DeliveryStatus::Pending,
                NewMessageLog {
                    agency_id: route.agency_id.clone(),
                    number_id: route.number_id().map(str::to_string),
                    user_id: Some(as_user.id.clone()),
                    client_id: route.client_id().map(str::to_string),
                    body: body.to_string(),
                    from_number: from.clone(),
                    to_number: to.to_string(),
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "Relay log insert failed");
                return false;
            }
        };

        match self
            .sms
            .send_sms(SmsRequest {
                to: phone::normalize_or_raw(to),
                from: phone::normalize_or_raw(&from),
                body: body.to_string(),
            })
            .await
        {
            Ok(receipt) => {
                let _ = self
                    .store
                    .mark_message_sent(&log_id, receipt.provider_message_id.as_deref(), None)
                    .await;
                true
            }
            Err(e) => {
                warn!(error = %e, to, "Relay send failed");
                let _ = self.store.mark_message_failed(&log_id, &e.to_string()).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::gateway::SmsReceipt;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct StubSms {
        sent: Mutex<Vec<SmsRequest>>,
        fail: bool,
    }

    impl StubSms {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl SmsGateway for StubSms {
        async fn send_sms(&self, request: SmsRequest) -> Result<SmsReceipt, TransportError> {
            if self.fail {
                return Err(TransportError::SmsSendFailed {
                    to: request.to.clone(),
                    reason: "stub".into(),
                });
            }
            self.sent.lock().await.push(request);
            Ok(SmsReceipt {
                provider_message_id: Some("SM1".into()),
                status: Some("queued".into()),
            })
        }
    }

    struct Fixture {
        store: Arc<Store>,
        sms: Arc<StubSms>,
        router: InboundMessageRouter,
        agency: String,
        owner: String,
        client: String,
        number: String,
    }

    async fn fixture(fail_sends: bool) -> Fixture {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let agency = store.insert_agency("A", None, None).await.unwrap();
        let number = store.insert_number(&agency, "4155550100").await.unwrap();
        let owner = store
            .insert_user("Ana", Some("Reed"), "provider", None, None)
            .await
            .unwrap();
        store.add_user_to_agency(&owner, &agency).await.unwrap();
        store.assign_number(&number, &owner, true).await.unwrap();
        let client = store
            .insert_client(Some(&agency), Some(&owner), Some("C.D."), Some("4155550001"))
            .await
            .unwrap();

        let sms = StubSms::new(fail_sends);
        let dispatcher = Arc::new(NotificationDispatcher::new(
            Arc::clone(&store),
            sms.clone(),
            None,
        ));
        let router = InboundMessageRouter::new(Arc::clone(&store), sms.clone(), dispatcher);
        Fixture {
            store,
            sms,
            router,
            agency,
            owner,
            client,
            number,
        }
    }

    fn inbound(body: &str) -> InboundSms {
        InboundSms {
            from: "4155550001".to_string(),
            to: "4155550100".to_string(),
            body: body.to_string(),
            provider_message_id: Some("SMin".to_string()),
        }
    }

    #[tokio::test]
    async fn stop_flips_consent_and_returns_opt_out_notice() {
        let f = fixture(false).await;
        f.store
            .upsert_opt_in_state(
                &f.agency,
                &f.client,
                &f.number,
                OptInStatus::OptedIn,
                OptInSource::InboundMessage,
            )
            .await
            .unwrap();

        let reply = f.router.handle(&inbound("STOP")).await;
        assert!(reply.contains("unsubscribed"));

        let state = f.store.find_opt_in_state(&f.client, &f.number).await.unwrap().unwrap();
        assert_eq!(state.status, OptInStatus::OptedOut);
        assert_eq!(state.source, "client_stop");
        assert_eq!(f.store.count_opt_in_rows(&f.client, &f.number).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn start_restores_consent() {
        let f = fixture(false).await;
        f.router.handle(&inbound("STOP")).await;
        let reply = f.router.handle(&inbound("START")).await;
        assert!(reply.contains("re-subscribed"));

        let state = f.store.find_opt_in_state(&f.client, &f.number).await.unwrap().unwrap();
        assert_eq!(state.status, OptInStatus::OptedIn);
        assert_eq!(state.source, "client_start");
    }

    #[tokio::test]
    async fn plain_message_implies_opt_in_and_fans_out() {
        let f = fixture(false).await;
        let support = f.store.insert_user("Sam", None, "support", None, None).await.unwrap();
        f.store.add_user_to_agency(&support, &f.agency).await.unwrap();

        let reply = f.router.handle(&inbound("hi, running late")).await;
        assert_eq!(reply, REPLY_RECEIVED);

        let state = f.store.find_opt_in_state(&f.client, &f.number).await.unwrap().unwrap();
        assert_eq!(state.status, OptInStatus::OptedIn);
        assert_eq!(state.source, "inbound_message");

        // Owner gets the inbound alert, support gets the safety net alert.
        let owner_alerts = f.store.list_notifications_for_user(&f.owner, 10).await.unwrap();
        assert_eq!(owner_alerts.len(), 1);
        assert_eq!(owner_alerts[0].notification_type, "inbound_client_message");
        let support_alerts = f.store.list_notifications_for_user(&support, 10).await.unwrap();
        assert_eq!(support_alerts.len(), 1);
        assert_eq!(support_alerts[0].notification_type, "support_safety_net_alert");
    }

    #[tokio::test]
    async fn unrouted_message_is_acknowledged_without_state() {
        let f = fixture(false).await;
        let reply = f
            .router
            .handle(&InboundSms {
                from: "4155550001".to_string(),
                to: "4155559999".to_string(),
                body: "hello".to_string(),
                provider_message_id: None,
            })
            .await;
        assert_eq!(reply, REPLY_UNROUTED);
    }

    #[tokio::test]
    async fn keyword_skips_fan_out() {
        let f = fixture(false).await;
        f.router.handle(&inbound("HELP")).await;
        assert!(f.store.list_notifications_for_user(&f.owner, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_reply_respects_window_and_throttle() {
        let f = fixture(false).await;
        // Quiet hours that block at any plausible test time: an impossible
        // window on every day.
        let mut prefs = gatekeeper::default_preferences("provider");
        prefs.auto_reply_enabled = true;
        prefs.auto_reply_message = Some("We are closed. We will reply tomorrow.".to_string());
        prefs.quiet_hours_enabled = true;
        prefs.quiet_hours_allowed_days = Some(
            r#"["Monday","Tuesday","Wednesday","Thursday","Friday","Saturday","Sunday"]"#
                .to_string(),
        );
        prefs.quiet_hours_start_time = Some("00:00".to_string());
        prefs.quiet_hours_end_time = Some("00:00".to_string());
        f.store.upsert_user_preferences(&f.owner, &prefs).await.unwrap();

        f.router.handle(&inbound("anyone there?")).await;
        assert_eq!(f.sms.sent.lock().await.len(), 1);
        assert_eq!(
            f.store.count_auto_replies_to(&f.owner, "4155550001").await.unwrap(),
            1
        );

        // Second message within the window: throttled.
        f.router.handle(&inbound("hello??")).await;
        assert_eq!(
            f.store.count_auto_replies_to(&f.owner, "4155550001").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn auto_reply_send_failure_never_fails_the_webhook() {
        let f = fixture(true).await;
        let mut prefs = gatekeeper::default_preferences("provider");
        prefs.auto_reply_enabled = true;
        prefs.auto_reply_message = Some("Closed.".to_string());
        prefs.quiet_hours_enabled = true;
        prefs.quiet_hours_allowed_days = Some(
            r#"["Monday","Tuesday","Wednesday","Thursday","Friday","Saturday","Sunday"]"#
                .to_string(),
        );
        prefs.quiet_hours_start_time = Some("00:00".to_string());
        prefs.quiet_hours_end_time = Some("00:00".to_string());
        f.store.upsert_user_preferences(&f.owner, &prefs).await.unwrap();

        let reply = f.router.handle(&inbound("hi")).await;
        assert_eq!(reply, REPLY_RECEIVED);
        // Failed send leaves the throttle untouched so the next tick can retry.
        assert!(f.store.auto_reply_last_sent(&f.owner, "4155550001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn opted_out_sender_only_hears_the_opt_out_notice() {
        let f = fixture(false).await;
        f.router.handle(&inbound("STOP")).await;

        // HELP does not change consent, so the compliance gate overrides
        // the canned help reply with the opt-out notice.
        let reply = f.router.handle(&inbound("HELP")).await;
        assert!(reply.contains("currently unsubscribed"));

        // A plain message re-implies consent and normal replies resume.
        let reply = f.router.handle(&inbound("hello again")).await;
        assert_eq!(reply, REPLY_RECEIVED);
    }

    #[tokio::test]
    async fn forwarding_rule_relays_message() {
        let f = fixture(false).await;
        f.store
            .upsert_number_rule(&f.number, RULE_FORWARD, None, None, Some("4155550777"))
            .await
            .unwrap();

        f.router.handle(&inbound("see you at 3")).await;
        let sent = f.sms.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "+14155550777");
        assert!(sent[0].body.contains("see you at 3"));
    }

    #[tokio::test]
    async fn emergency_term_triggers_forward_and_alert() {
        let f = fixture(false).await;
        f.store
            .upsert_number_rule(&f.number, RULE_EMERGENCY_FORWARD, None, None, Some("4155550911"))
            .await
            .unwrap();

        f.router.handle(&inbound("this is an emergency")).await;
        let sent = f.sms.sent.lock().await;
        assert!(sent.iter().any(|r| r.to == "+14155550911" && r.body.starts_with("EMERGENCY")));

        let alerts = f.store.list_notifications_for_user(&f.owner, 10).await.unwrap();
        assert!(alerts
            .iter()
            .any(|n| n.notification_type == "emergency_inbound_message"));
    }

    #[tokio::test]
    async fn support_mirror_opens_escalation() {
        let f = fixture(false).await;
        f.store
            .set_agency_flags(&f.agency, r#"{"smsSupportFallbackPhone": "4155550888"}"#)
            .await
            .unwrap();
        let mut prefs = gatekeeper::default_preferences("provider");
        prefs.support_mirror_enabled = true;
        prefs.sms_support_thread_mode = "read_only".to_string();
        f.store.upsert_user_preferences(&f.owner, &prefs).await.unwrap();

        f.router.handle(&inbound("hello")).await;

        let sent = f.sms.sent.lock().await;
        assert!(sent.iter().any(|r| r.to == "+14155550888"));
        let escalation = f
            .store
            .find_active_escalation(&f.owner, &f.client)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(escalation.escalation_type, "provider_mirror");
        assert_eq!(escalation.thread_mode, ThreadMode::ReadOnly);
    }

    #[tokio::test]
    async fn inbound_is_always_logged() {
        let f = fixture(false).await;
        f.router.handle(&inbound("STOP")).await;
        let thread = f.store.list_thread(&f.owner, &f.client, 10).await.unwrap();
        assert_eq!(thread.len(), 1);
        assert_eq!(thread[0].direction, Direction::Inbound);
        assert_eq!(thread[0].delivery_status, DeliveryStatus::Received);
        assert_eq!(thread[0].from_number, "+14155550001");
    }
}
