//! SMS persistence — message logs, opt-in state, auto-reply throttle, and
//! thread escalations.

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::phone;
use crate::store::db::{
    Store, opt_integer, opt_text, parse_datetime, query_err, text_param, text_param_owned,
};

/// Message direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "INBOUND",
            Direction::Outbound => "OUTBOUND",
        }
    }

    pub fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("OUTBOUND") {
            Direction::Outbound
        } else {
            Direction::Inbound
        }
    }
}

/// Delivery state of a message log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Received,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::Received => "received",
            DeliveryStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "sent" => DeliveryStatus::Sent,
            "failed" => DeliveryStatus::Failed,
            "received" => DeliveryStatus::Received,
            "skipped" => DeliveryStatus::Skipped,
            _ => DeliveryStatus::Pending,
        }
    }
}

/// Per-client consent state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptInStatus {
    OptedIn,
    OptedOut,
    Pending,
}

impl OptInStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptInStatus::OptedIn => "opted_in",
            OptInStatus::OptedOut => "opted_out",
            OptInStatus::Pending => "pending",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "opted_in" => OptInStatus::OptedIn,
            "opted_out" => OptInStatus::OptedOut,
            _ => OptInStatus::Pending,
        }
    }
}

/// What caused the most recent opt-in transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptInSource {
    ClientStop,
    ClientStart,
    InboundMessage,
    ManualUpdate,
}

impl OptInSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptInSource::ClientStop => "client_stop",
            OptInSource::ClientStart => "client_start",
            OptInSource::InboundMessage => "inbound_message",
            OptInSource::ManualUpdate => "manual_update",
        }
    }
}

/// A persisted opt-in state row.
#[derive(Debug, Clone)]
pub struct OptInState {
    pub status: OptInStatus,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

/// One SMS sent or received.
#[derive(Debug, Clone)]
pub struct MessageLog {
    pub id: String,
    pub agency_id: Option<String>,
    pub number_id: Option<String>,
    pub user_id: Option<String>,
    pub assigned_user_id: Option<String>,
    pub owner_type: Option<String>,
    pub client_id: Option<String>,
    pub direction: Direction,
    pub body: String,
    pub from_number: String,
    pub to_number: String,
    pub provider_message_id: Option<String>,
    pub delivery_status: DeliveryStatus,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new message log row. Numbers are normalized on insert.
#[derive(Debug, Clone, Default)]
pub struct NewMessageLog {
    pub agency_id: Option<String>,
    pub number_id: Option<String>,
    pub user_id: Option<String>,
    pub assigned_user_id: Option<String>,
    pub owner_type: Option<String>,
    pub client_id: Option<String>,
    pub body: String,
    pub from_number: String,
    pub to_number: String,
    pub provider_message_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Escalation kind for a mirrored/stalled thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationType {
    ProviderMirror,
    SlaTimeout,
}

impl EscalationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationType::ProviderMirror => "provider_mirror",
            EscalationType::SlaTimeout => "sla_timeout",
        }
    }
}

/// Whether the provider may still reply on an escalated thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    Respondable,
    ReadOnly,
}

impl ThreadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadMode::Respondable => "respondable",
            ThreadMode::ReadOnly => "read_only",
        }
    }

    pub fn from_str(s: &str) -> Self {
        if s == "read_only" { ThreadMode::ReadOnly } else { ThreadMode::Respondable }
    }
}

/// An active or resolved thread escalation.
#[derive(Debug, Clone)]
pub struct ThreadEscalation {
    pub id: String,
    pub user_id: String,
    pub client_id: String,
    pub escalation_type: String,
    pub thread_mode: ThreadMode,
    pub escalated_to_phone: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stalled inbound thread candidate returned by the sweep query.
#[derive(Debug, Clone)]
pub struct StaleInboundThread {
    pub log_id: String,
    pub agency_id: Option<String>,
    pub user_id: String,
    pub client_id: String,
    pub body: String,
    pub from_number: String,
    pub to_number: String,
    pub created_at: DateTime<Utc>,
    pub client_initials: Option<String>,
}

const MESSAGE_COLUMNS: &str = "id, agency_id, number_id, user_id, assigned_user_id, owner_type, client_id, direction, body, from_number, to_number, provider_message_id, delivery_status, metadata, created_at";

fn row_to_message(row: &libsql::Row) -> MessageLog {
    MessageLog {
        id: opt_text(row, 0).unwrap_or_default(),
        agency_id: opt_text(row, 1),
        number_id: opt_text(row, 2),
        user_id: opt_text(row, 3),
        assigned_user_id: opt_text(row, 4),
        owner_type: opt_text(row, 5),
        client_id: opt_text(row, 6),
        direction: Direction::from_str(&opt_text(row, 7).unwrap_or_default()),
        body: opt_text(row, 8).unwrap_or_default(),
        from_number: opt_text(row, 9).unwrap_or_default(),
        to_number: opt_text(row, 10).unwrap_or_default(),
        provider_message_id: opt_text(row, 11),
        delivery_status: DeliveryStatus::from_str(&opt_text(row, 12).unwrap_or_default()),
        metadata: opt_text(row, 13).and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&opt_text(row, 14).unwrap_or_default()),
    }
}

impl Store {
    // ── Message logs ────────────────────────────────────────────────

    /// Insert a message log row. Returns the generated id.
    pub async fn insert_message_log(
        &self,
        direction: Direction,
        status: DeliveryStatus,
        new: NewMessageLog,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let metadata = new
            .metadata
            .map(|m| serde_json::to_string(&m))
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO message_logs ({MESSAGE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
                ),
                libsql::params![
                    id.clone(),
                    text_param_owned(new.agency_id),
                    text_param_owned(new.number_id),
                    text_param_owned(new.user_id),
                    text_param_owned(new.assigned_user_id),
                    text_param_owned(new.owner_type),
                    text_param_owned(new.client_id),
                    direction.as_str(),
                    new.body,
                    phone::normalize_or_raw(&new.from_number),
                    phone::normalize_or_raw(&new.to_number),
                    text_param_owned(new.provider_message_id),
                    status.as_str(),
                    text_param_owned(metadata),
                    now
                ],
            )
            .await
            .map_err(query_err)?;
        debug!(id = %id, direction = direction.as_str(), "Message log inserted");
        Ok(id)
    }

    pub async fn find_message_log(&self, id: &str) -> Result<Option<MessageLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM message_logs WHERE id = ?1"),
                libsql::params![id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_message(&r)))
    }

    /// Advance a pending row to `sent`, recording the provider message id and
    /// merging metadata.
    pub async fn mark_message_sent(
        &self,
        id: &str,
        provider_message_id: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), DatabaseError> {
        let metadata = metadata
            .map(|m| serde_json::to_string(m))
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "UPDATE message_logs
                 SET delivery_status = 'sent',
                     provider_message_id = COALESCE(?1, provider_message_id),
                     metadata = COALESCE(?2, metadata)
                 WHERE id = ?3",
                libsql::params![text_param(provider_message_id), text_param_owned(metadata), id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn mark_message_failed(&self, id: &str, error: &str) -> Result<(), DatabaseError> {
        let metadata = serde_json::json!({ "error": error }).to_string();
        self.conn()
            .execute(
                "UPDATE message_logs SET delivery_status = 'failed', metadata = ?1 WHERE id = ?2",
                libsql::params![metadata, id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Recent messages between a user and client, newest first.
    pub async fn list_thread(
        &self,
        user_id: &str,
        client_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM message_logs
                     WHERE user_id = ?1 AND client_id = ?2
                     ORDER BY created_at DESC LIMIT ?3"
                ),
                libsql::params![user_id, client_id, limit as i64],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_message(&row));
        }
        Ok(out)
    }

    // ── Opt-in state ────────────────────────────────────────────────

    /// Insert-or-update the consent state for an (agency, client, number)
    /// tuple. Last writer wins; exactly one row per tuple.
    pub async fn upsert_opt_in_state(
        &self,
        agency_id: &str,
        client_id: &str,
        number_id: &str,
        status: OptInStatus,
        source: OptInSource,
    ) -> Result<(), DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO opt_in_states (id, agency_id, client_id, number_id, status, source, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (agency_id, client_id, number_id) DO UPDATE SET
                   status = excluded.status,
                   source = excluded.source,
                   updated_at = excluded.updated_at",
                libsql::params![id, agency_id, client_id, number_id, status.as_str(), source.as_str(), now],
            )
            .await
            .map_err(query_err)?;
        debug!(client_id, number_id, status = status.as_str(), "Opt-in state upserted");
        Ok(())
    }

    pub async fn find_opt_in_state(
        &self,
        client_id: &str,
        number_id: &str,
    ) -> Result<Option<OptInState>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status, source, updated_at FROM opt_in_states
                 WHERE client_id = ?1 AND number_id = ?2 LIMIT 1",
                libsql::params![client_id, number_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|row| OptInState {
            status: OptInStatus::from_str(&opt_text(&row, 0).unwrap_or_default()),
            source: opt_text(&row, 1).unwrap_or_default(),
            updated_at: parse_datetime(&opt_text(&row, 2).unwrap_or_default()),
        }))
    }

    /// Count of rows for a tuple — used by invariant tests.
    pub async fn count_opt_in_rows(
        &self,
        client_id: &str,
        number_id: &str,
    ) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM opt_in_states WHERE client_id = ?1 AND number_id = ?2",
                libsql::params![client_id, number_id],
            )
            .await
            .map_err(query_err)?;
        let row = rows.next().await.map_err(query_err)?;
        Ok(row.map(|r| opt_integer(&r, 0).unwrap_or(0)).unwrap_or(0))
    }

    // ── Auto-reply throttle ─────────────────────────────────────────

    pub async fn auto_reply_last_sent(
        &self,
        user_id: &str,
        client_phone: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let key = phone::normalize_or_raw(client_phone);
        let mut rows = self
            .conn()
            .query(
                "SELECT last_sent_at FROM auto_reply_throttles WHERE user_id = ?1 AND client_phone = ?2",
                libsql::params![user_id, key],
            )
            .await
            .map_err(query_err)?;
        Ok(rows
            .next()
            .await
            .map_err(query_err)?
            .and_then(|row| opt_text(&row, 0))
            .map(|s| parse_datetime(&s)))
    }

    /// Record that an automatic reply was just sent to this pair.
    pub async fn touch_auto_reply_throttle(
        &self,
        user_id: &str,
        client_phone: &str,
    ) -> Result<(), DatabaseError> {
        let key = phone::normalize_or_raw(client_phone);
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO auto_reply_throttles (user_id, client_phone, last_sent_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (user_id, client_phone) DO UPDATE SET last_sent_at = excluded.last_sent_at",
                libsql::params![user_id, key, now],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Thread escalations ──────────────────────────────────────────

    /// Idempotently create an escalation. Returns `true` when a new row was
    /// inserted, `false` when the thread already had one (same inbound log or
    /// an existing active escalation for the pair).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_escalation_if_absent(
        &self,
        agency_id: Option<&str>,
        user_id: &str,
        client_id: &str,
        inbound_log_id: Option<&str>,
        escalated_to_phone: Option<&str>,
        escalation_type: EscalationType,
        thread_mode: ThreadMode,
        metadata: Option<&serde_json::Value>,
    ) -> Result<bool, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let metadata = metadata
            .map(|m| serde_json::to_string(m))
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO thread_escalations
                   (id, agency_id, user_id, client_id, inbound_log_id, escalated_to_phone,
                    escalation_type, thread_mode, status, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'active', ?9, ?10)",
                libsql::params![
                    id,
                    text_param(agency_id),
                    user_id,
                    client_id,
                    text_param(inbound_log_id),
                    text_param(escalated_to_phone),
                    escalation_type.as_str(),
                    thread_mode.as_str(),
                    text_param_owned(metadata),
                    now
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    pub async fn find_active_escalation(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<Option<ThreadEscalation>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_id, client_id, escalation_type, thread_mode, escalated_to_phone, created_at
                 FROM thread_escalations
                 WHERE user_id = ?1 AND client_id = ?2 AND status = 'active' LIMIT 1",
                libsql::params![user_id, client_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|row| ThreadEscalation {
            id: opt_text(&row, 0).unwrap_or_default(),
            user_id: opt_text(&row, 1).unwrap_or_default(),
            client_id: opt_text(&row, 2).unwrap_or_default(),
            escalation_type: opt_text(&row, 3).unwrap_or_default(),
            thread_mode: ThreadMode::from_str(&opt_text(&row, 4).unwrap_or_default()),
            escalated_to_phone: opt_text(&row, 5),
            created_at: parse_datetime(&opt_text(&row, 6).unwrap_or_default()),
        }))
    }

    /// Mark any active escalation for the pair resolved (the staff member
    /// replied). Returns the number of rows resolved.
    pub async fn resolve_active_escalation(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "UPDATE thread_escalations SET status = 'resolved'
                 WHERE user_id = ?1 AND client_id = ?2 AND status = 'active'",
                libsql::params![user_id, client_id],
            )
            .await
            .map_err(query_err)
    }

    /// Candidate threads for the SLA sweep: the latest inbound message per
    /// (provider, client) with no newer inbound or outbound and no escalation
    /// row yet. Bounded batch; age filtering happens in the caller since the
    /// threshold is per-agency.
    pub async fn stale_unanswered_inbound(
        &self,
        limit: usize,
    ) -> Result<Vec<StaleInboundThread>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT ml.id, ml.agency_id, ml.user_id, ml.client_id, ml.body,
                        ml.from_number, ml.to_number, ml.created_at, c.initials
                 FROM message_logs ml
                 JOIN users u ON u.id = ml.user_id
                 LEFT JOIN clients c ON c.id = ml.client_id
                 WHERE ml.direction = 'INBOUND'
                   AND ml.client_id IS NOT NULL
                   AND u.role = 'provider'
                   AND NOT EXISTS (
                     SELECT 1 FROM message_logs newer_in
                     WHERE newer_in.user_id = ml.user_id
                       AND newer_in.client_id = ml.client_id
                       AND newer_in.direction = 'INBOUND'
                       AND newer_in.created_at > ml.created_at
                   )
                   AND NOT EXISTS (
                     SELECT 1 FROM message_logs out_msg
                     WHERE out_msg.user_id = ml.user_id
                       AND out_msg.client_id = ml.client_id
                       AND out_msg.direction = 'OUTBOUND'
                       AND out_msg.created_at > ml.created_at
                   )
                   AND NOT EXISTS (
                     SELECT 1 FROM thread_escalations se WHERE se.inbound_log_id = ml.id
                   )
                 ORDER BY ml.created_at ASC
                 LIMIT ?1",
                libsql::params![limit as i64],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(StaleInboundThread {
                log_id: opt_text(&row, 0).unwrap_or_default(),
                agency_id: opt_text(&row, 1),
                user_id: opt_text(&row, 2).unwrap_or_default(),
                client_id: opt_text(&row, 3).unwrap_or_default(),
                body: opt_text(&row, 4).unwrap_or_default(),
                from_number: opt_text(&row, 5).unwrap_or_default(),
                to_number: opt_text(&row, 6).unwrap_or_default(),
                created_at: parse_datetime(&opt_text(&row, 7).unwrap_or_default()),
                client_initials: opt_text(&row, 8),
            });
        }
        Ok(out)
    }

    /// Backdate a message log row (test support for SLA-age scenarios).
    #[doc(hidden)]
    pub async fn set_message_created_at(
        &self,
        id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE message_logs SET created_at = ?1 WHERE id = ?2",
                libsql::params![created_at.to_rfc3339(), id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Count message logs matching a direction and metadata flag — test and
    /// audit support for throttle invariants.
    pub async fn count_auto_replies_to(
        &self,
        user_id: &str,
        to_number: &str,
    ) -> Result<i64, DatabaseError> {
        let to = phone::normalize_or_raw(to_number);
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM message_logs
                 WHERE user_id = ?1 AND to_number = ?2 AND direction = 'OUTBOUND'
                   AND metadata LIKE '%\"autoReply\":true%'",
                libsql::params![user_id, to],
            )
            .await
            .map_err(query_err)?;
        let row = rows.next().await.map_err(query_err)?;
        Ok(row.map(|r| opt_integer(&r, 0).unwrap_or(0)).unwrap_or(0))
    }
}
