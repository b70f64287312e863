//! Directory records — agencies, users, clients, numbers, assignments.
//!
//! These rows are owned by external provisioning/HR workflows; this engine
//! reads them to resolve routing. Minimal insert/upsert helpers exist so
//! provisioning imports (and tests) can populate the tables.

use uuid::Uuid;

use crate::agency::AgencyConfig;
use crate::error::DatabaseError;
use crate::phone;
use crate::store::db::{Store, flag, opt_text, query_err, text_param, text_param_owned};

/// A tenant organization.
#[derive(Debug, Clone)]
pub struct Agency {
    pub id: String,
    pub name: String,
    pub phone_number: Option<String>,
    pub feature_flags: Option<String>,
    pub is_active: bool,
}

impl Agency {
    /// Parse the feature-flag bag once into the typed config.
    pub fn config(&self) -> AgencyConfig {
        AgencyConfig::from_flags(self.feature_flags.as_deref())
    }
}

/// A staff or portal user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub role: String,
    pub phone_number: Option<String>,
    pub personal_phone: Option<String>,
    pub work_phone: Option<String>,
    pub system_phone_number: Option<String>,
    pub is_active: bool,
    pub is_archived: bool,
}

impl User {
    /// First non-empty personal contact number, used for SMS notifications
    /// and as the dial fallback when no forwarding number is set.
    pub fn contact_phone(&self) -> Option<&str> {
        self.personal_phone
            .as_deref()
            .or(self.work_phone.as_deref())
            .or(self.phone_number.as_deref())
    }
}

/// A client (recipient of staff SMS/calls).
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub agency_id: Option<String>,
    pub provider_id: Option<String>,
    pub initials: Option<String>,
    pub contact_phone: Option<String>,
}

/// A provisioned phone number owned by an agency.
#[derive(Debug, Clone)]
pub struct PhoneNumber {
    pub id: String,
    pub agency_id: String,
    pub phone_number: String,
    pub friendly_name: Option<String>,
    pub is_active: bool,
    pub released: bool,
}

impl PhoneNumber {
    pub fn is_usable(&self) -> bool {
        self.is_active && !self.released
    }
}

/// Binding of a number to a staff user.
#[derive(Debug, Clone)]
pub struct NumberAssignment {
    pub id: String,
    pub number_id: String,
    pub user_id: String,
    pub is_primary: bool,
    pub sms_access_enabled: bool,
}

/// A per-number routing rule (forwarding, after-hours reply, emergency).
#[derive(Debug, Clone)]
pub struct NumberRule {
    pub id: String,
    pub number_id: String,
    pub rule_type: String,
    pub auto_reply_text: Option<String>,
    pub forward_to_user_id: Option<String>,
    pub forward_to_phone: Option<String>,
    pub enabled: bool,
}

pub const RULE_FORWARD: &str = "forward";
pub const RULE_AFTER_HOURS: &str = "after_hours";
pub const RULE_EMERGENCY_FORWARD: &str = "emergency_forward";

/// Per-user notification/auto-reply preferences row (raw; channel defaults
/// are applied by the gatekeeper).
#[derive(Debug, Clone, Default)]
pub struct UserPreferences {
    pub email_enabled: bool,
    pub sms_enabled: bool,
    pub in_app_enabled: bool,
    pub quiet_hours_enabled: bool,
    pub quiet_hours_allowed_days: Option<String>,
    pub quiet_hours_start_time: Option<String>,
    pub quiet_hours_end_time: Option<String>,
    pub auto_reply_enabled: bool,
    pub auto_reply_message: Option<String>,
    pub emergency_override: bool,
    pub notification_categories: Option<String>,
    pub sms_use_own_number_for_reminders: bool,
    pub sms_support_thread_mode: String,
    pub support_mirror_enabled: bool,
}

/// Per-user voice call toggles.
#[derive(Debug, Clone)]
pub struct UserCallSettings {
    pub inbound_enabled: bool,
    pub outbound_enabled: bool,
    pub forward_to_phone: Option<String>,
    pub allow_call_recording: bool,
    pub voicemail_enabled: bool,
    pub voicemail_message: Option<String>,
}

impl Default for UserCallSettings {
    fn default() -> Self {
        Self {
            inbound_enabled: true,
            outbound_enabled: true,
            forward_to_phone: None,
            allow_call_recording: false,
            voicemail_enabled: false,
            voicemail_message: None,
        }
    }
}

const AGENCY_COLUMNS: &str = "id, name, phone_number, feature_flags, is_active";
const USER_COLUMNS: &str = "id, first_name, last_name, role, phone_number, personal_phone, work_phone, system_phone_number, is_active, is_archived";
const NUMBER_COLUMNS: &str = "id, agency_id, phone_number, friendly_name, is_active, status";
const ASSIGNMENT_COLUMNS: &str = "id, number_id, user_id, is_primary, sms_access_enabled";

fn row_to_agency(row: &libsql::Row) -> Agency {
    Agency {
        id: opt_text(row, 0).unwrap_or_default(),
        name: opt_text(row, 1).unwrap_or_default(),
        phone_number: opt_text(row, 2),
        feature_flags: opt_text(row, 3),
        is_active: flag(row, 4, true),
    }
}

fn row_to_user(row: &libsql::Row) -> User {
    User {
        id: opt_text(row, 0).unwrap_or_default(),
        first_name: opt_text(row, 1).unwrap_or_default(),
        last_name: opt_text(row, 2),
        role: opt_text(row, 3).unwrap_or_else(|| "staff".to_string()),
        phone_number: opt_text(row, 4),
        personal_phone: opt_text(row, 5),
        work_phone: opt_text(row, 6),
        system_phone_number: opt_text(row, 7),
        is_active: flag(row, 8, true),
        is_archived: flag(row, 9, false),
    }
}

fn row_to_number(row: &libsql::Row) -> PhoneNumber {
    PhoneNumber {
        id: opt_text(row, 0).unwrap_or_default(),
        agency_id: opt_text(row, 1).unwrap_or_default(),
        phone_number: opt_text(row, 2).unwrap_or_default(),
        friendly_name: opt_text(row, 3),
        is_active: flag(row, 4, true),
        released: opt_text(row, 5).as_deref() == Some("released"),
    }
}

fn row_to_assignment(row: &libsql::Row) -> NumberAssignment {
    NumberAssignment {
        id: opt_text(row, 0).unwrap_or_default(),
        number_id: opt_text(row, 1).unwrap_or_default(),
        user_id: opt_text(row, 2).unwrap_or_default(),
        is_primary: flag(row, 3, false),
        sms_access_enabled: flag(row, 4, true),
    }
}

impl Store {
    // ── Agencies ────────────────────────────────────────────────────

    pub async fn find_agency(&self, id: &str) -> Result<Option<Agency>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENCY_COLUMNS} FROM agencies WHERE id = ?1"),
                libsql::params![id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_agency(&r)))
    }

    /// Parsed config for an agency, defaults when the agency is unknown.
    pub async fn agency_config(&self, agency_id: &str) -> Result<AgencyConfig, DatabaseError> {
        Ok(self
            .find_agency(agency_id)
            .await?
            .map(|a| a.config())
            .unwrap_or_default())
    }

    /// All active agencies. Used for short-code scans; tenant counts are small.
    pub async fn list_active_agencies(&self) -> Result<Vec<Agency>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENCY_COLUMNS} FROM agencies WHERE is_active = 1"),
                (),
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_agency(&row));
        }
        Ok(out)
    }

    pub async fn insert_agency(
        &self,
        name: &str,
        phone_number: Option<&str>,
        feature_flags: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO agencies (id, name, phone_number, feature_flags, is_active)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                libsql::params![
                    id.clone(),
                    name,
                    text_param_owned(phone_number.and_then(phone::normalize)),
                    text_param(feature_flags)
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    pub async fn set_agency_flags(&self, agency_id: &str, flags: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE agencies SET feature_flags = ?1 WHERE id = ?2",
                libsql::params![flags, agency_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Users & memberships ─────────────────────────────────────────

    pub async fn find_user(&self, id: &str) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                libsql::params![id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_user(&r)))
    }

    /// Legacy direct binding: a user whose `system_phone_number` equals the
    /// inbound destination.
    pub async fn find_user_by_system_phone(&self, raw: &str) -> Result<Option<User>, DatabaseError> {
        let Some(normalized) = phone::normalize(raw) else {
            return Ok(None);
        };
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE system_phone_number = ?1 LIMIT 1"),
                libsql::params![normalized],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_user(&r)))
    }

    pub async fn user_agency_ids(&self, user_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT agency_id FROM user_agencies WHERE user_id = ?1",
                libsql::params![user_id],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            if let Some(id) = opt_text(&row, 0) {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub async fn user_has_agency(&self, user_id: &str, agency_id: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .user_agency_ids(user_id)
            .await?
            .iter()
            .any(|a| a == agency_id))
    }

    pub async fn first_agency_id_for_user(&self, user_id: &str) -> Result<Option<String>, DatabaseError> {
        Ok(self.user_agency_ids(user_id).await?.into_iter().next())
    }

    /// All active support-role staff in an agency.
    pub async fn list_support_user_ids(&self, agency_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT u.id
                 FROM users u
                 JOIN user_agencies ua ON u.id = ua.user_id
                 WHERE ua.agency_id = ?1
                   AND u.role = 'support'
                   AND u.is_archived = 0",
                libsql::params![agency_id],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            if let Some(id) = opt_text(&row, 0) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Any admin-capable user in the agency, preferring role `admin`.
    pub async fn find_any_admin_id(&self, agency_id: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT u.id
                 FROM users u
                 JOIN user_agencies ua ON u.id = ua.user_id
                 WHERE ua.agency_id = ?1
                   AND u.role IN ('admin', 'support', 'super_admin', 'clinical_practice_assistant')
                   AND u.is_active = 1
                   AND u.is_archived = 0
                 ORDER BY u.role = 'admin' DESC
                 LIMIT 1",
                libsql::params![agency_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.and_then(|r| opt_text(&r, 0)))
    }

    /// Active, non-archived staff of an agency (campaign/event phone matching).
    pub async fn list_agency_staff(&self, agency_id: &str) -> Result<Vec<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {} FROM users u
                     JOIN user_agencies ua ON u.id = ua.user_id
                     WHERE ua.agency_id = ?1 AND u.is_active = 1 AND u.is_archived = 0
                     ORDER BY u.last_name, u.first_name",
                    USER_COLUMNS
                        .split(", ")
                        .map(|c| format!("u.{c}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
                libsql::params![agency_id],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_user(&row));
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_user(
        &self,
        first_name: &str,
        last_name: Option<&str>,
        role: &str,
        phone_number: Option<&str>,
        system_phone_number: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO users (id, first_name, last_name, role, phone_number, system_phone_number)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                libsql::params![
                    id.clone(),
                    first_name,
                    text_param(last_name),
                    role,
                    text_param_owned(phone_number.and_then(phone::normalize)),
                    text_param_owned(system_phone_number.and_then(phone::normalize))
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    pub async fn add_user_to_agency(&self, user_id: &str, agency_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO user_agencies (user_id, agency_id) VALUES (?1, ?2)",
                libsql::params![user_id, agency_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Clients ─────────────────────────────────────────────────────

    pub async fn find_client(&self, id: &str) -> Result<Option<Client>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, agency_id, provider_id, initials, contact_phone FROM clients WHERE id = ?1",
                libsql::params![id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_client(&r)))
    }

    /// Find a client by contact phone, comparing normalized forms.
    pub async fn find_client_by_contact_phone(&self, raw: &str) -> Result<Option<Client>, DatabaseError> {
        let Some(normalized) = phone::normalize(raw) else {
            return Ok(None);
        };
        let mut rows = self
            .conn()
            .query(
                "SELECT id, agency_id, provider_id, initials, contact_phone
                 FROM clients WHERE contact_phone = ?1 LIMIT 1",
                libsql::params![normalized.clone()],
            )
            .await
            .map_err(query_err)?;
        if let Some(row) = rows.next().await.map_err(query_err)? {
            return Ok(Some(row_to_client(&row)));
        }

        // Directory rows provisioned before normalization was centralized may
        // hold raw formatting; compare normalized forms as a fallback.
        let mut rows = self
            .conn()
            .query(
                "SELECT id, agency_id, provider_id, initials, contact_phone
                 FROM clients WHERE contact_phone IS NOT NULL",
                (),
            )
            .await
            .map_err(query_err)?;
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let client = row_to_client(&row);
            if client
                .contact_phone
                .as_deref()
                .and_then(phone::normalize)
                .as_deref()
                == Some(normalized.as_str())
            {
                return Ok(Some(client));
            }
        }
        Ok(None)
    }

    pub async fn insert_client(
        &self,
        agency_id: Option<&str>,
        provider_id: Option<&str>,
        initials: Option<&str>,
        contact_phone: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO clients (id, agency_id, provider_id, initials, contact_phone)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                libsql::params![
                    id.clone(),
                    text_param(agency_id),
                    text_param(provider_id),
                    text_param(initials),
                    text_param_owned(contact_phone.and_then(phone::normalize))
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    // ── Numbers, assignments, rules ─────────────────────────────────

    pub async fn find_number(&self, id: &str) -> Result<Option<PhoneNumber>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {NUMBER_COLUMNS} FROM phone_numbers WHERE id = ?1"),
                libsql::params![id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_number(&r)))
    }

    pub async fn find_number_by_phone(&self, raw: &str) -> Result<Option<PhoneNumber>, DatabaseError> {
        let Some(normalized) = phone::normalize(raw) else {
            return Ok(None);
        };
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {NUMBER_COLUMNS} FROM phone_numbers WHERE phone_number = ?1 LIMIT 1"),
                libsql::params![normalized],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_number(&r)))
    }

    /// Active, non-released numbers for an agency, stable order.
    pub async fn list_active_agency_numbers(&self, agency_id: &str) -> Result<Vec<PhoneNumber>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {NUMBER_COLUMNS} FROM phone_numbers
                     WHERE agency_id = ?1 AND is_active = 1 AND status != 'released'
                     ORDER BY rowid"
                ),
                libsql::params![agency_id],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(row_to_number(&row));
        }
        Ok(out)
    }

    pub async fn insert_number(&self, agency_id: &str, raw_phone: &str) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO phone_numbers (id, agency_id, phone_number) VALUES (?1, ?2, ?3)",
                libsql::params![id.clone(), agency_id, phone::normalize_or_raw(raw_phone)],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    pub async fn mark_number_released(&self, number_id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE phone_numbers SET status = 'released', is_active = 0 WHERE id = ?1",
                libsql::params![number_id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn assign_number(
        &self,
        number_id: &str,
        user_id: &str,
        is_primary: bool,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO number_assignments (id, number_id, user_id, is_primary)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (number_id, user_id)
                 DO UPDATE SET is_primary = excluded.is_primary",
                libsql::params![id.clone(), number_id, user_id, is_primary as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    /// The user's primary assignment, if any.
    pub async fn find_primary_assignment(&self, user_id: &str) -> Result<Option<NumberAssignment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM number_assignments
                     WHERE user_id = ?1 AND is_primary = 1 LIMIT 1"
                ),
                libsql::params![user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_assignment(&r)))
    }

    /// First assignment holding a number, primary holders first.
    pub async fn find_assignment_for_number(&self, number_id: &str) -> Result<Option<NumberAssignment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM number_assignments
                     WHERE number_id = ?1 ORDER BY is_primary DESC, rowid LIMIT 1"
                ),
                libsql::params![number_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|r| row_to_assignment(&r)))
    }

    /// User ids with SMS access on a number (multi-recipient pools).
    pub async fn list_eligible_user_ids(&self, number_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id FROM number_assignments
                 WHERE number_id = ?1 AND sms_access_enabled = 1
                 ORDER BY is_primary DESC, rowid",
                libsql::params![number_id],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            if let Some(id) = opt_text(&row, 0) {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub async fn upsert_number_rule(
        &self,
        number_id: &str,
        rule_type: &str,
        auto_reply_text: Option<&str>,
        forward_to_user_id: Option<&str>,
        forward_to_phone: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO number_rules
                   (id, number_id, rule_type, auto_reply_text, forward_to_user_id, forward_to_phone, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
                 ON CONFLICT (number_id, rule_type) DO UPDATE SET
                   auto_reply_text = excluded.auto_reply_text,
                   forward_to_user_id = excluded.forward_to_user_id,
                   forward_to_phone = excluded.forward_to_phone,
                   enabled = excluded.enabled",
                libsql::params![
                    id.clone(),
                    number_id,
                    rule_type,
                    text_param(auto_reply_text),
                    text_param(forward_to_user_id),
                    text_param_owned(forward_to_phone.and_then(phone::normalize))
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    pub async fn find_number_rule(
        &self,
        number_id: &str,
        rule_type: &str,
    ) -> Result<Option<NumberRule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, number_id, rule_type, auto_reply_text, forward_to_user_id, forward_to_phone, enabled
                 FROM number_rules WHERE number_id = ?1 AND rule_type = ?2 AND enabled = 1 LIMIT 1",
                libsql::params![number_id, rule_type],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|row| NumberRule {
            id: opt_text(&row, 0).unwrap_or_default(),
            number_id: opt_text(&row, 1).unwrap_or_default(),
            rule_type: opt_text(&row, 2).unwrap_or_default(),
            auto_reply_text: opt_text(&row, 3),
            forward_to_user_id: opt_text(&row, 4),
            forward_to_phone: opt_text(&row, 5),
            enabled: flag(&row, 6, true),
        }))
    }

    // ── Preferences & call settings ─────────────────────────────────

    pub async fn user_preferences(&self, user_id: &str) -> Result<Option<UserPreferences>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT email_enabled, sms_enabled, in_app_enabled, quiet_hours_enabled,
                        quiet_hours_allowed_days, quiet_hours_start_time, quiet_hours_end_time,
                        auto_reply_enabled, auto_reply_message, emergency_override,
                        notification_categories, sms_use_own_number_for_reminders,
                        sms_support_thread_mode, support_mirror_enabled
                 FROM user_preferences WHERE user_id = ?1",
                libsql::params![user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.map(|row| UserPreferences {
            email_enabled: flag(&row, 0, true),
            sms_enabled: flag(&row, 1, false),
            in_app_enabled: flag(&row, 2, true),
            quiet_hours_enabled: flag(&row, 3, false),
            quiet_hours_allowed_days: opt_text(&row, 4),
            quiet_hours_start_time: opt_text(&row, 5),
            quiet_hours_end_time: opt_text(&row, 6),
            auto_reply_enabled: flag(&row, 7, false),
            auto_reply_message: opt_text(&row, 8),
            emergency_override: flag(&row, 9, false),
            notification_categories: opt_text(&row, 10),
            sms_use_own_number_for_reminders: flag(&row, 11, true),
            sms_support_thread_mode: opt_text(&row, 12).unwrap_or_else(|| "respondable".to_string()),
            support_mirror_enabled: flag(&row, 13, false),
        }))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_user_preferences(
        &self,
        user_id: &str,
        prefs: &UserPreferences,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO user_preferences
                   (user_id, email_enabled, sms_enabled, in_app_enabled, quiet_hours_enabled,
                    quiet_hours_allowed_days, quiet_hours_start_time, quiet_hours_end_time,
                    auto_reply_enabled, auto_reply_message, emergency_override,
                    notification_categories, sms_use_own_number_for_reminders,
                    sms_support_thread_mode, support_mirror_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT (user_id) DO UPDATE SET
                   email_enabled = excluded.email_enabled,
                   sms_enabled = excluded.sms_enabled,
                   in_app_enabled = excluded.in_app_enabled,
                   quiet_hours_enabled = excluded.quiet_hours_enabled,
                   quiet_hours_allowed_days = excluded.quiet_hours_allowed_days,
                   quiet_hours_start_time = excluded.quiet_hours_start_time,
                   quiet_hours_end_time = excluded.quiet_hours_end_time,
                   auto_reply_enabled = excluded.auto_reply_enabled,
                   auto_reply_message = excluded.auto_reply_message,
                   emergency_override = excluded.emergency_override,
                   notification_categories = excluded.notification_categories,
                   sms_use_own_number_for_reminders = excluded.sms_use_own_number_for_reminders,
                   sms_support_thread_mode = excluded.sms_support_thread_mode,
                   support_mirror_enabled = excluded.support_mirror_enabled",
                libsql::params![
                    user_id,
                    prefs.email_enabled as i64,
                    prefs.sms_enabled as i64,
                    prefs.in_app_enabled as i64,
                    prefs.quiet_hours_enabled as i64,
                    text_param(prefs.quiet_hours_allowed_days.as_deref()),
                    text_param(prefs.quiet_hours_start_time.as_deref()),
                    text_param(prefs.quiet_hours_end_time.as_deref()),
                    prefs.auto_reply_enabled as i64,
                    text_param(prefs.auto_reply_message.as_deref()),
                    prefs.emergency_override as i64,
                    text_param(prefs.notification_categories.as_deref()),
                    prefs.sms_use_own_number_for_reminders as i64,
                    prefs.sms_support_thread_mode.as_str(),
                    prefs.support_mirror_enabled as i64
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Call settings for a user, defaults when no row exists.
    pub async fn user_call_settings(&self, user_id: &str) -> Result<UserCallSettings, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT inbound_enabled, outbound_enabled, forward_to_phone,
                        allow_call_recording, voicemail_enabled, voicemail_message
                 FROM user_call_settings WHERE user_id = ?1",
                libsql::params![user_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows
            .next()
            .await
            .map_err(query_err)?
            .map(|row| UserCallSettings {
                inbound_enabled: flag(&row, 0, true),
                outbound_enabled: flag(&row, 1, true),
                forward_to_phone: opt_text(&row, 2),
                allow_call_recording: flag(&row, 3, false),
                voicemail_enabled: flag(&row, 4, false),
                voicemail_message: opt_text(&row, 5),
            })
            .unwrap_or_default())
    }

    pub async fn upsert_user_call_settings(
        &self,
        user_id: &str,
        settings: &UserCallSettings,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO user_call_settings
                   (user_id, inbound_enabled, outbound_enabled, forward_to_phone,
                    allow_call_recording, voicemail_enabled, voicemail_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (user_id) DO UPDATE SET
                   inbound_enabled = excluded.inbound_enabled,
                   outbound_enabled = excluded.outbound_enabled,
                   forward_to_phone = excluded.forward_to_phone,
                   allow_call_recording = excluded.allow_call_recording,
                   voicemail_enabled = excluded.voicemail_enabled,
                   voicemail_message = excluded.voicemail_message",
                libsql::params![
                    user_id,
                    settings.inbound_enabled as i64,
                    settings.outbound_enabled as i64,
                    text_param_owned(settings.forward_to_phone.as_deref().map(phone::normalize_or_raw)),
                    settings.allow_call_recording as i64,
                    settings.voicemail_enabled as i64,
                    text_param(settings.voicemail_message.as_deref())
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ── Supervisors ─────────────────────────────────────────────────

    /// Supervisor ids for a user within an agency, primaries first; when any
    /// primary exists only primaries are returned.
    pub async fn supervisor_ids_for(&self, user_id: &str, agency_id: &str) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT supervisor_id, is_primary FROM supervisor_assignments
                 WHERE user_id = ?1 AND agency_id = ?2
                 ORDER BY is_primary DESC",
                libsql::params![user_id, agency_id],
            )
            .await
            .map_err(query_err)?;
        let mut primaries = Vec::new();
        let mut all = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            if let Some(id) = opt_text(&row, 0) {
                if flag(&row, 1, false) {
                    primaries.push(id.clone());
                }
                all.push(id);
            }
        }
        Ok(if primaries.is_empty() { all } else { primaries })
    }

    pub async fn assign_supervisor(
        &self,
        user_id: &str,
        supervisor_id: &str,
        agency_id: &str,
        is_primary: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO supervisor_assignments (user_id, supervisor_id, agency_id, is_primary)
                 VALUES (?1, ?2, ?3, ?4)",
                libsql::params![user_id, supervisor_id, agency_id, is_primary as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

fn row_to_client(row: &libsql::Row) -> Client {
    Client {
        id: opt_text(row, 0).unwrap_or_default(),
        agency_id: opt_text(row, 1),
        provider_id: opt_text(row, 2),
        initials: opt_text(row, 3),
        contact_phone: opt_text(row, 4),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn client_lookup_compares_normalized_phones() {
        let s = store().await;
        let agency = s.insert_agency("North Agency", None, None).await.unwrap();
        let client = s
            .insert_client(Some(&agency), None, Some("A.B."), Some("(415) 555-0001"))
            .await
            .unwrap();

        let found = s.find_client_by_contact_phone("+14155550001").await.unwrap().unwrap();
        assert_eq!(found.id, client);
        let found = s.find_client_by_contact_phone("415-555-0001").await.unwrap().unwrap();
        assert_eq!(found.id, client);
        assert!(s.find_client_by_contact_phone("415-555-9999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn released_numbers_are_excluded_from_active_list() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        let n1 = s.insert_number(&agency, "4155550100").await.unwrap();
        let n2 = s.insert_number(&agency, "4155550101").await.unwrap();
        s.mark_number_released(&n1).await.unwrap();

        let active = s.list_active_agency_numbers(&agency).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, n2);
        assert!(s.find_number(&n1).await.unwrap().unwrap().released);
    }

    #[tokio::test]
    async fn eligible_pool_orders_primary_first() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        let number = s.insert_number(&agency, "4155550100").await.unwrap();
        let u1 = s.insert_user("Ana", None, "provider", None, None).await.unwrap();
        let u2 = s.insert_user("Ben", None, "provider", None, None).await.unwrap();
        s.assign_number(&number, &u1, false).await.unwrap();
        s.assign_number(&number, &u2, true).await.unwrap();

        let pool = s.list_eligible_user_ids(&number).await.unwrap();
        assert_eq!(pool, vec![u2.clone(), u1.clone()]);
        let assignment = s.find_assignment_for_number(&number).await.unwrap().unwrap();
        assert_eq!(assignment.user_id, u2);
    }

    #[tokio::test]
    async fn number_rule_upsert_replaces_by_type() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        let number = s.insert_number(&agency, "4155550100").await.unwrap();
        s.upsert_number_rule(&number, RULE_FORWARD, None, None, Some("4155550199"))
            .await
            .unwrap();
        s.upsert_number_rule(&number, RULE_FORWARD, None, None, Some("4155550198"))
            .await
            .unwrap();

        let rule = s.find_number_rule(&number, RULE_FORWARD).await.unwrap().unwrap();
        assert_eq!(rule.forward_to_phone.as_deref(), Some("+14155550198"));
        assert!(s.find_number_rule(&number, RULE_AFTER_HOURS).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn call_settings_default_when_absent() {
        let s = store().await;
        let settings = s.user_call_settings("missing").await.unwrap();
        assert!(settings.inbound_enabled);
        assert!(!settings.voicemail_enabled);
    }

    #[tokio::test]
    async fn supervisors_prefer_primaries() {
        let s = store().await;
        let agency = s.insert_agency("A", None, None).await.unwrap();
        s.assign_supervisor("u1", "sup1", &agency, false).await.unwrap();
        s.assign_supervisor("u1", "sup2", &agency, true).await.unwrap();
        assert_eq!(s.supervisor_ids_for("u1", &agency).await.unwrap(), vec!["sup2"]);
    }
}
