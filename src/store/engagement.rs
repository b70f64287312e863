//! Engagement persistence — staff campaigns and company-event voting,
//! the two short-code flows.

use chrono::Utc;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::phone;
use crate::store::db::{Store, flag, opt_text, query_err, text_param};

/// A staff engagement campaign.
#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: String,
    pub agency_id: String,
    pub status: String,
    pub audience_mode: String,
    pub response_options: Option<String>,
}

/// A company event with optional SMS voting.
#[derive(Debug, Clone)]
pub struct CompanyEvent {
    pub id: String,
    pub agency_id: String,
    pub title: String,
    pub sms_code: Option<String>,
    pub voting_options: Option<String>,
    pub voting_open: bool,
    pub audience_mode: String,
}

/// A recorded campaign or event response (one per responder, latest wins).
#[derive(Debug, Clone)]
pub struct RecordedResponse {
    pub response_key: String,
    pub response_label: String,
    pub response_body: String,
}

impl Store {
    // ── Campaigns ───────────────────────────────────────────────────

    pub async fn insert_campaign(
        &self,
        agency_id: &str,
        status: &str,
        audience_mode: &str,
        response_options: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO campaigns (id, agency_id, status, audience_mode, response_options, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                libsql::params![
                    id.clone(),
                    agency_id,
                    status,
                    audience_mode,
                    text_param(response_options),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    /// The most recently started campaign currently accepting responses.
    pub async fn find_active_campaign(&self, agency_id: &str) -> Result<Option<Campaign>, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn()
            .query(
                "SELECT id, agency_id, status, audience_mode, response_options
                 FROM campaigns
                 WHERE agency_id = ?1
                   AND status = 'sent'
                   AND (starts_at IS NULL OR starts_at <= ?2)
                   AND (ends_at IS NULL OR ends_at >= ?2)
                 ORDER BY created_at DESC LIMIT 1",
                libsql::params![agency_id, now],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|row| Campaign {
            id: opt_text(&row, 0).unwrap_or_default(),
            agency_id: opt_text(&row, 1).unwrap_or_default(),
            status: opt_text(&row, 2).unwrap_or_default(),
            audience_mode: opt_text(&row, 3).unwrap_or_default(),
            response_options: opt_text(&row, 4),
        }))
    }

    pub async fn add_campaign_recipient(&self, campaign_id: &str, user_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO campaign_recipients (campaign_id, user_id) VALUES (?1, ?2)",
                libsql::params![campaign_id, user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn is_campaign_recipient(&self, campaign_id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM campaign_recipients WHERE campaign_id = ?1 AND user_id = ?2 LIMIT 1",
                libsql::params![campaign_id, user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.is_some())
    }

    pub async fn upsert_campaign_opt_out(
        &self,
        agency_id: &str,
        user_id: &str,
        source: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO campaign_opt_outs (agency_id, user_id, opted_out_at, source)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (agency_id, user_id) DO UPDATE SET
                   opted_out_at = excluded.opted_out_at,
                   source = excluded.source",
                libsql::params![agency_id, user_id, Utc::now().to_rfc3339(), source],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn has_campaign_opt_out(&self, agency_id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM campaign_opt_outs WHERE agency_id = ?1 AND user_id = ?2 LIMIT 1",
                libsql::params![agency_id, user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.is_some())
    }

    /// Record (or replace) a user's response to a campaign.
    pub async fn upsert_campaign_response(
        &self,
        campaign_id: &str,
        user_id: &str,
        key: &str,
        label: &str,
        body: &str,
        from_number: &str,
    ) -> Result<(), DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO campaign_responses
                   (id, campaign_id, user_id, response_key, response_label, response_body, from_number, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (campaign_id, user_id) DO UPDATE SET
                   response_key = excluded.response_key,
                   response_label = excluded.response_label,
                   response_body = excluded.response_body,
                   from_number = excluded.from_number,
                   received_at = excluded.received_at",
                libsql::params![
                    id,
                    campaign_id,
                    user_id,
                    key,
                    label,
                    body,
                    phone::normalize_or_raw(from_number),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn find_campaign_response(
        &self,
        campaign_id: &str,
        user_id: &str,
    ) -> Result<Option<RecordedResponse>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT response_key, response_label, response_body
                 FROM campaign_responses WHERE campaign_id = ?1 AND user_id = ?2",
                libsql::params![campaign_id, user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(row_to_response))
    }

    pub async fn count_campaign_responses(&self, campaign_id: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM campaign_responses WHERE campaign_id = ?1",
                libsql::params![campaign_id],
            )
            .await
            .map_err(query_err)?;
        let row = rows.next().await.map_err(query_err)?;
        Ok(row.and_then(|r| r.get(0).ok()).unwrap_or(0))
    }

    // ── Company events ──────────────────────────────────────────────

    pub async fn insert_company_event(
        &self,
        agency_id: &str,
        title: &str,
        sms_code: Option<&str>,
        voting_options: Option<&str>,
        audience_mode: &str,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO company_events (id, agency_id, title, sms_code, voting_options, voting_open, audience_mode, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
                libsql::params![
                    id.clone(),
                    agency_id,
                    title,
                    text_param(sms_code),
                    text_param(voting_options),
                    audience_mode,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    pub async fn list_open_voting_events(&self, agency_id: &str) -> Result<Vec<CompanyEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, agency_id, title, sms_code, voting_options, voting_open, audience_mode
                 FROM company_events
                 WHERE agency_id = ?1 AND voting_open = 1
                 ORDER BY created_at DESC",
                libsql::params![agency_id],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(CompanyEvent {
                id: opt_text(&row, 0).unwrap_or_default(),
                agency_id: opt_text(&row, 1).unwrap_or_default(),
                title: opt_text(&row, 2).unwrap_or_default(),
                sms_code: opt_text(&row, 3),
                voting_options: opt_text(&row, 4),
                voting_open: flag(&row, 5, true),
                audience_mode: opt_text(&row, 6).unwrap_or_else(|| "all".to_string()),
            });
        }
        Ok(out)
    }

    pub async fn add_event_recipient(&self, event_id: &str, user_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO event_recipients (event_id, user_id) VALUES (?1, ?2)",
                libsql::params![event_id, user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn is_event_recipient(&self, event_id: &str, user_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM event_recipients WHERE event_id = ?1 AND user_id = ?2 LIMIT 1",
                libsql::params![event_id, user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.is_some())
    }

    pub async fn upsert_event_response(
        &self,
        event_id: &str,
        user_id: &str,
        key: &str,
        label: &str,
        body: &str,
        from_number: &str,
    ) -> Result<(), DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO event_responses
                   (id, event_id, user_id, response_key, response_label, response_body, source, from_number, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'sms', ?7, ?8)
                 ON CONFLICT (event_id, user_id) DO UPDATE SET
                   response_key = excluded.response_key,
                   response_label = excluded.response_label,
                   response_body = excluded.response_body,
                   source = excluded.source,
                   from_number = excluded.from_number,
                   received_at = excluded.received_at",
                libsql::params![
                    id,
                    event_id,
                    user_id,
                    key,
                    label,
                    body,
                    phone::normalize_or_raw(from_number),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn find_event_response(
        &self,
        event_id: &str,
        user_id: &str,
    ) -> Result<Option<RecordedResponse>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT response_key, response_label, response_body
                 FROM event_responses WHERE event_id = ?1 AND user_id = ?2",
                libsql::params![event_id, user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(row_to_response))
    }
}

fn row_to_response(row: libsql::Row) -> RecordedResponse {
    RecordedResponse {
        response_key: opt_text(&row, 0).unwrap_or_default(),
        response_label: opt_text(&row, 1).unwrap_or_default(),
        response_body: opt_text(&row, 2).unwrap_or_default(),
    }
}
