//! Notification persistence — in-app records, SMS attempt logs, and
//! agency-level category defaults.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::db::{Store, flag, opt_text, parse_datetime, query_err, text_param};

/// An in-app notification record. Created unconditionally before any
/// external fan-out is attempted.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub notification_type: String,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub user_id: String,
    pub agency_id: Option<String>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for a new in-app notification.
#[derive(Debug, Clone, Default)]
pub struct NewNotification {
    pub notification_type: String,
    pub severity: String,
    pub title: String,
    pub message: String,
    pub user_id: String,
    pub agency_id: Option<String>,
    pub related_entity_type: Option<String>,
    pub related_entity_id: Option<String>,
}

/// One SMS dispatch attempt for a notification.
#[derive(Debug, Clone)]
pub struct NotificationSmsLog {
    pub id: String,
    pub user_id: String,
    pub to_number: String,
    pub from_number: String,
    pub body: String,
    pub status: String,
    pub error_message: Option<String>,
}

/// Agency-wide category defaults, optionally enforced over user choices.
#[derive(Debug, Clone)]
pub struct AgencyNotificationDefaults {
    pub defaults: serde_json::Value,
    pub enforce_defaults: bool,
}

impl Store {
    pub async fn insert_notification(&self, new: NewNotification) -> Result<Notification, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.conn()
            .execute(
                "INSERT INTO notifications
                   (id, type, severity, title, message, user_id, agency_id,
                    related_entity_type, related_entity_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                libsql::params![
                    id.clone(),
                    new.notification_type.as_str(),
                    new.severity.as_str(),
                    new.title.as_str(),
                    new.message.as_str(),
                    new.user_id.as_str(),
                    text_param(new.agency_id.as_deref()),
                    text_param(new.related_entity_type.as_deref()),
                    text_param(new.related_entity_id.as_deref()),
                    now.to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(Notification {
            id,
            notification_type: new.notification_type,
            severity: new.severity,
            title: new.title,
            message: new.message,
            user_id: new.user_id,
            agency_id: new.agency_id,
            related_entity_type: new.related_entity_type,
            related_entity_id: new.related_entity_id,
            created_at: now,
        })
    }

    /// Notifications for a user, newest first.
    pub async fn list_notifications_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<Notification>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, type, severity, title, message, user_id, agency_id,
                        related_entity_type, related_entity_id, created_at
                 FROM notifications WHERE user_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
                libsql::params![user_id, limit as i64],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(Notification {
                id: opt_text(&row, 0).unwrap_or_default(),
                notification_type: opt_text(&row, 1).unwrap_or_default(),
                severity: opt_text(&row, 2).unwrap_or_default(),
                title: opt_text(&row, 3).unwrap_or_default(),
                message: opt_text(&row, 4).unwrap_or_default(),
                user_id: opt_text(&row, 5).unwrap_or_default(),
                agency_id: opt_text(&row, 6),
                related_entity_type: opt_text(&row, 7),
                related_entity_id: opt_text(&row, 8),
                created_at: parse_datetime(&opt_text(&row, 9).unwrap_or_default()),
            });
        }
        Ok(out)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_notification_sms_log(
        &self,
        user_id: &str,
        agency_id: Option<&str>,
        notification_id: Option<&str>,
        to_number: &str,
        from_number: &str,
        body: &str,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        self.conn()
            .execute(
                "INSERT INTO notification_sms_logs
                   (id, user_id, agency_id, notification_id, to_number, from_number,
                    body, status, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                libsql::params![
                    id.clone(),
                    user_id,
                    text_param(agency_id),
                    text_param(notification_id),
                    to_number,
                    from_number,
                    body,
                    status,
                    text_param(error_message),
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(id)
    }

    pub async fn update_notification_sms_log(
        &self,
        id: &str,
        status: &str,
        provider_message_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE notification_sms_logs
                 SET status = ?1,
                     provider_message_id = COALESCE(?2, provider_message_id),
                     error_message = ?3
                 WHERE id = ?4",
                libsql::params![status, text_param(provider_message_id), text_param(error_message), id],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn list_notification_sms_logs(
        &self,
        user_id: &str,
    ) -> Result<Vec<NotificationSmsLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, user_id, to_number, from_number, body, status, error_message
                 FROM notification_sms_logs WHERE user_id = ?1 ORDER BY created_at",
                libsql::params![user_id],
            )
            .await
            .map_err(query_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            out.push(NotificationSmsLog {
                id: opt_text(&row, 0).unwrap_or_default(),
                user_id: opt_text(&row, 1).unwrap_or_default(),
                to_number: opt_text(&row, 2).unwrap_or_default(),
                from_number: opt_text(&row, 3).unwrap_or_default(),
                body: opt_text(&row, 4).unwrap_or_default(),
                status: opt_text(&row, 5).unwrap_or_default(),
                error_message: opt_text(&row, 6),
            });
        }
        Ok(out)
    }

    pub async fn agency_notification_defaults(
        &self,
        agency_id: &str,
    ) -> Result<Option<AgencyNotificationDefaults>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT defaults, enforce_defaults FROM agency_notification_defaults WHERE agency_id = ?1",
                libsql::params![agency_id],
            )
            .await
            .map_err(query_err)?;
        Ok(rows.next().await.map_err(query_err)?.and_then(|row| {
            let defaults = opt_text(&row, 0).and_then(|s| serde_json::from_str(&s).ok())?;
            Some(AgencyNotificationDefaults {
                defaults,
                enforce_defaults: flag(&row, 1, true),
            })
        }))
    }

    pub async fn set_agency_notification_defaults(
        &self,
        agency_id: &str,
        defaults: &serde_json::Value,
        enforce: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO agency_notification_defaults (agency_id, defaults, enforce_defaults)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT (agency_id) DO UPDATE SET
                   defaults = excluded.defaults,
                   enforce_defaults = excluded.enforce_defaults",
                libsql::params![agency_id, defaults.to_string(), enforce as i64],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }
}
