//! Voice persistence — call logs, voicemails, and the one-shot escalation
//! claim used by the no-answer fallback.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::phone;
use crate::store::db::{
    Store, int_param, opt_integer, opt_text, parse_datetime, parse_optional_datetime, query_err,
    text_param, text_param_owned,
};
use crate::store::messages::Direction;

/// Internal call state. Provider status strings are translated here at the
/// boundary so the rest of the engine never pattern-matches vendor strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Queued,
    Initiated,
    InboundReceived,
    Bridging,
    Ringing,
    InProgress,
    Completed,
    Busy,
    Failed,
    NoAnswer,
    Canceled,
    VoicemailRecorded,
    /// Unknown provider status; non-terminal, preserved for audit.
    Other,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Queued => "queued",
            CallStatus::Initiated => "initiated",
            CallStatus::InboundReceived => "inbound_received",
            CallStatus::Bridging => "bridging",
            CallStatus::Ringing => "ringing",
            CallStatus::InProgress => "in_progress",
            CallStatus::Completed => "completed",
            CallStatus::Busy => "busy",
            CallStatus::Failed => "failed",
            CallStatus::NoAnswer => "no_answer",
            CallStatus::Canceled => "canceled",
            CallStatus::VoicemailRecorded => "voicemail_recorded",
            CallStatus::Other => "other",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => CallStatus::Queued,
            "initiated" => CallStatus::Initiated,
            "inbound_received" => CallStatus::InboundReceived,
            "bridging" => CallStatus::Bridging,
            "ringing" => CallStatus::Ringing,
            "in_progress" => CallStatus::InProgress,
            "completed" => CallStatus::Completed,
            "busy" => CallStatus::Busy,
            "failed" => CallStatus::Failed,
            "no_answer" => CallStatus::NoAnswer,
            "canceled" => CallStatus::Canceled,
            "voicemail_recorded" => CallStatus::VoicemailRecorded,
            _ => CallStatus::Other,
        }
    }

    /// Translate a raw provider status string.
    pub fn from_provider(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => CallStatus::Queued,
            "initiated" => CallStatus::Initiated,
            "ringing" => CallStatus::Ringing,
            "in-progress" | "answered" => CallStatus::InProgress,
            "completed" => CallStatus::Completed,
            "busy" => CallStatus::Busy,
            "failed" => CallStatus::Failed,
            "no-answer" => CallStatus::NoAnswer,
            "canceled" | "cancelled" => CallStatus::Canceled,
            other => {
                warn!(status = other, "Unknown provider call status");
                CallStatus::Other
            }
        }
    }

    /// States after which the leg is over and `ended_at` is stamped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Completed
                | CallStatus::Busy
                | CallStatus::Failed
                | CallStatus::NoAnswer
                | CallStatus::Canceled
                | CallStatus::VoicemailRecorded
        )
    }

    /// Outcomes that trigger the support/voicemail fallback branch.
    pub fn is_missed(&self) -> bool {
        matches!(self, CallStatus::NoAnswer | CallStatus::Busy | CallStatus::Failed)
    }
}

/// One call attempt.
#[derive(Debug, Clone)]
pub struct CallLog {
    pub id: String,
    pub agency_id: Option<String>,
    pub number_id: Option<String>,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub direction: Direction,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub target_phone: Option<String>,
    pub provider_call_id: Option<String>,
    pub parent_call_id: Option<String>,
    pub status: CallStatus,
    pub duration_seconds: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// Fields for a new call log row.
#[derive(Debug, Clone, Default)]
pub struct NewCallLog {
    pub agency_id: Option<String>,
    pub number_id: Option<String>,
    pub user_id: Option<String>,
    pub client_id: Option<String>,
    pub from_number: Option<String>,
    pub to_number: Option<String>,
    pub target_phone: Option<String>,
    pub provider_call_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Partial update for a call log; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct CallLogPatch {
    pub provider_call_id: Option<String>,
    pub parent_call_id: Option<String>,
    pub status: Option<CallStatus>,
    pub duration_seconds: Option<i64>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

/// A recorded voicemail.
#[derive(Debug, Clone)]
pub struct CallVoicemail {
    pub id: String,
    pub call_log_id: String,
    pub recording_id: Option<String>,
    pub recording_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub transcription: Option<String>,
    pub status: String,
}

const CALL_COLUMNS: &str = "id, agency_id, number_id, user_id, client_id, direction, from_number, to_number, target_phone, provider_call_id, parent_call_id, status, duration_seconds, started_at, answered_at, ended_at, metadata";

fn row_to_call(row: &libsql::Row) -> CallLog {
    CallLog {
        id: opt_text(row, 0).unwrap_or_default(),
        agency_id: opt_text(row, 1),
        number_id: opt_text(row, 2),
        user_id: opt_text(row, 3),
        client_id: opt_text(row, 4),
        direction: Direction::from_str(&opt_text(row, 5).unwrap_or_default()),
        from_number: opt_text(row, 6),
        to_number: opt_text(row, 7),
        target_phone: opt_text(row, 8),
        provider_call_id: opt_text(row, 9),
        parent_call_id: opt_text(row, 10),
        status: CallStatus::from_str(&opt_text(row, 11).unwrap_or_default()),
        duration_seconds: opt_integer(row, 12),
        started_at: parse_optional_datetime(&opt_text(row, 13)),
        answered_at: parse_optional_datetime(&opt_text(row, 14)),
        ended_at: parse_optional_datetime(&opt_text(row, 15)),
        metadata: opt_text(row, 16).and_then(|s| serde_json::from_str(&s).ok()),
    }
}

impl Store {
    /// Insert a call log row in the given initial status.
    pub async fn insert_call_log(
        &self,
        direction: Direction,
        status: CallStatus,
        new: NewCallLog,
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
                    "INSERT INTO call_logs ({CALL_COLUMNS}, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, NULL, ?11, NULL, ?12, NULL, NULL, ?13, ?12, ?12)"
                ),
                libsql::params![
                    id.clone(),
                    text_param_owned(new.agency_id),
                    text_param_owned(new.number_id),
                    text_param_owned(new.user_id),
                    text_param_owned(new.client_id),
                    direction.as_str(),
                    text_param_owned(new.from_number.as_deref().map(phone::normalize_or_raw)),
                    text_param_owned(new.to_number.as_deref().map(phone::normalize_or_raw)),
                    text_param_owned(new.target_phone.as_deref().map(phone::normalize_or_raw)),
                    text_param_owned(new.provider_call_id),
                    status.as_str(),
                    now,
                    text_param_owned(metadata)
                ],
            )
            .await
            .map_err(query_err)?;
        debug!(id = %id, direction = direction.as_str(), status = status.as_str(), "Call log inserted");
        Ok(id)
    }

    pub async fn find_call_log(&self, id: &str) -> Result<Option<CallLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CALL_COLUMNS} FROM call_logs WHERE id = ?1"),
                libsql::params![id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_call(&r)))
    }

    /// Look a call up by provider id, matching either leg.
    pub async fn find_call_by_provider_id(&self, provider_id: &str) -> Result<Option<CallLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CALL_COLUMNS} FROM call_logs
                     WHERE provider_call_id = ?1 OR parent_call_id = ?1
                     ORDER BY created_at DESC LIMIT 1"
                ),
                libsql::params![provider_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_call(&r)))
    }

    /// Apply a partial update. Last write wins; out-of-order webhooks are
    /// tolerated because every field set is absolute.
    pub async fn update_call_log(&self, id: &str, patch: CallLogPatch) -> Result<(), DatabaseError> {
        let metadata = patch
            .metadata
            .map(|m| serde_json::to_string(&m))
            .transpose()
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "UPDATE call_logs SET
                   provider_call_id = COALESCE(?1, provider_call_id),
                   parent_call_id = COALESCE(?2, parent_call_id),
                   status = COALESCE(?3, status),
                   duration_seconds = COALESCE(?4, duration_seconds),
                   answered_at = COALESCE(?5, answered_at),
                   ended_at = COALESCE(?6, ended_at),
                   metadata = COALESCE(?7, metadata),
                   updated_at = ?8
                 WHERE id = ?9",
                libsql::params![
                    text_param_owned(patch.provider_call_id),
                    text_param_owned(patch.parent_call_id),
                    text_param(patch.status.map(|s| s.as_str())),
                    int_param(patch.duration_seconds),
                    text_param_owned(patch.answered_at.map(|t| t.to_rfc3339())),
                    text_param_owned(patch.ended_at.map(|t| t.to_rfc3339())),
                    text_param_owned(metadata),
                    Utc::now().to_rfc3339(),
                    id
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Atomically claim the one-shot support escalation for a call.
    ///
    /// Returns `true` exactly once per call; repeated status webhooks see the
    /// metadata flag already set and get `false`.
    pub async fn claim_support_escalation(&self, call_id: &str) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE call_logs
                 SET metadata = json_set(
                       COALESCE(metadata, '{}'),
                       '$.supportEscalationTriggered', json('true'),
                       '$.supportEscalationAt', ?1
                     ),
                     updated_at = ?1
                 WHERE id = ?2
                   AND (metadata IS NULL
                        OR json_extract(metadata, '$.supportEscalationTriggered') IS NULL)",
                libsql::params![now, call_id],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    // ── Voicemails ──────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_voicemail(
        &self,
        call: &CallLog,
        recording_id: Option<&str>,
        recording_url: Option<&str>,
        duration_seconds: Option<i64>,
        status: &str,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO call_voicemails
                   (id, call_log_id, agency_id, user_id, client_id, from_number, to_number,
                    recording_id, recording_url, duration_seconds, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                libsql::params![
                    id.clone(),
                    call.id.as_str(),
                    text_param(call.agency_id.as_deref()),
                    text_param(call.user_id.as_deref()),
                    text_param(call.client_id.as_deref()),
                    text_param(call.from_number.as_deref()),
                    text_param(call.to_number.as_deref()),
                    text_param(recording_id),
                    text_param(recording_url),
                    int_param(duration_seconds),
                    status,
                    now
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    /// Append a transcription once speech-to-text finishes (asynchronous,
    /// arrives after the recording itself).
    pub async fn set_voicemail_transcription(
        &self,
        voicemail_id: &str,
        transcription: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE call_voicemails SET transcription = ?1 WHERE id = ?2",
                libsql::params![transcription, voicemail_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn find_voicemail_for_call(&self, call_log_id: &str) -> Result<Option<CallVoicemail>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, call_log_id, recording_id, recording_url, duration_seconds, transcription, status
                 FROM call_voicemails WHERE call_log_id = ?1 LIMIT 1",
                libsql::params![call_log_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|row| CallVoicemail {
            id: opt_text(&row, 0).unwrap_or_default(),
            call_log_id: opt_text(&row, 1).unwrap_or_default(),
            recording_id: opt_text(&row, 2),
            recording_url: opt_text(&row, 3),
            duration_seconds: opt_integer(&row, 4),
            transcription: opt_text(&row, 5),
            status: opt_text(&row, 6).unwrap_or_default(),
        }))
    }
}
