//! Version-tracked database migrations.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "telephony_core",
        sql: r#"
            CREATE TABLE IF NOT EXISTS agencies (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                phone_number TEXT,
                feature_flags TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                first_name TEXT NOT NULL,
                last_name TEXT,
                role TEXT NOT NULL DEFAULT 'staff',
                phone_number TEXT,
                personal_phone TEXT,
                work_phone TEXT,
                system_phone_number TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_archived INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_users_system_phone ON users(system_phone_number);

            CREATE TABLE IF NOT EXISTS user_agencies (
                user_id TEXT NOT NULL REFERENCES users(id),
                agency_id TEXT NOT NULL REFERENCES agencies(id),
                PRIMARY KEY (user_id, agency_id)
            );

            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                agency_id TEXT REFERENCES agencies(id),
                provider_id TEXT REFERENCES users(id),
                initials TEXT,
                contact_phone TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_clients_contact_phone ON clients(contact_phone);

            CREATE TABLE IF NOT EXISTS phone_numbers (
                id TEXT PRIMARY KEY,
                agency_id TEXT NOT NULL REFERENCES agencies(id),
                phone_number TEXT NOT NULL UNIQUE,
                friendly_name TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'active'
            );
            CREATE INDEX IF NOT EXISTS idx_phone_numbers_agency ON phone_numbers(agency_id);

            CREATE TABLE IF NOT EXISTS number_assignments (
                id TEXT PRIMARY KEY,
                number_id TEXT NOT NULL REFERENCES phone_numbers(id),
                user_id TEXT NOT NULL REFERENCES users(id),
                is_primary INTEGER NOT NULL DEFAULT 0,
                sms_access_enabled INTEGER NOT NULL DEFAULT 1,
                UNIQUE (number_id, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_number_assignments_user ON number_assignments(user_id);

            CREATE TABLE IF NOT EXISTS number_rules (
                id TEXT PRIMARY KEY,
                number_id TEXT NOT NULL REFERENCES phone_numbers(id),
                rule_type TEXT NOT NULL,
                auto_reply_text TEXT,
                forward_to_user_id TEXT,
                forward_to_phone TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                UNIQUE (number_id, rule_type)
            );

            CREATE TABLE IF NOT EXISTS opt_in_states (
                id TEXT PRIMARY KEY,
                agency_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                number_id TEXT NOT NULL,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (agency_id, client_id, number_id)
            );

            CREATE TABLE IF NOT EXISTS message_logs (
                id TEXT PRIMARY KEY,
                agency_id TEXT,
                number_id TEXT,
                user_id TEXT,
                assigned_user_id TEXT,
                owner_type TEXT,
                client_id TEXT,
                direction TEXT NOT NULL,
                body TEXT NOT NULL,
                from_number TEXT NOT NULL,
                to_number TEXT NOT NULL,
                provider_message_id TEXT,
                delivery_status TEXT NOT NULL,
                metadata TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_message_logs_thread
                ON message_logs(user_id, client_id, direction, created_at);
            CREATE INDEX IF NOT EXISTS idx_message_logs_agency ON message_logs(agency_id);

            CREATE TABLE IF NOT EXISTS auto_reply_throttles (
                user_id TEXT NOT NULL,
                client_phone TEXT NOT NULL,
                last_sent_at TEXT NOT NULL,
                PRIMARY KEY (user_id, client_phone)
            );

            CREATE TABLE IF NOT EXISTS thread_escalations (
                id TEXT PRIMARY KEY,
                agency_id TEXT,
                user_id TEXT NOT NULL,
                client_id TEXT NOT NULL,
                inbound_log_id TEXT UNIQUE,
                escalated_to_phone TEXT,
                escalation_type TEXT NOT NULL,
                thread_mode TEXT NOT NULL DEFAULT 'respondable',
                status TEXT NOT NULL DEFAULT 'active',
                metadata TEXT,
                created_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_thread_escalations_active
                ON thread_escalations(user_id, client_id) WHERE status = 'active';

            CREATE TABLE IF NOT EXISTS call_logs (
                id TEXT PRIMARY KEY,
                agency_id TEXT,
                number_id TEXT,
                user_id TEXT,
                client_id TEXT,
                direction TEXT NOT NULL,
                from_number TEXT,
                to_number TEXT,
                target_phone TEXT,
                provider_call_id TEXT,
                parent_call_id TEXT,
                status TEXT,
                duration_seconds INTEGER,
                started_at TEXT,
                answered_at TEXT,
                ended_at TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_call_logs_provider ON call_logs(provider_call_id);
            CREATE INDEX IF NOT EXISTS idx_call_logs_parent ON call_logs(parent_call_id);

            CREATE TABLE IF NOT EXISTS call_voicemails (
                id TEXT PRIMARY KEY,
                call_log_id TEXT NOT NULL REFERENCES call_logs(id),
                agency_id TEXT,
                user_id TEXT,
                client_id TEXT,
                from_number TEXT,
                to_number TEXT,
                recording_id TEXT,
                recording_url TEXT,
                duration_seconds INTEGER,
                transcription TEXT,
                status TEXT NOT NULL DEFAULT 'completed',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_call_settings (
                user_id TEXT PRIMARY KEY,
                inbound_enabled INTEGER NOT NULL DEFAULT 1,
                outbound_enabled INTEGER NOT NULL DEFAULT 1,
                forward_to_phone TEXT,
                allow_call_recording INTEGER NOT NULL DEFAULT 0,
                voicemail_enabled INTEGER NOT NULL DEFAULT 0,
                voicemail_message TEXT
            );

            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id TEXT PRIMARY KEY,
                email_enabled INTEGER NOT NULL DEFAULT 1,
                sms_enabled INTEGER NOT NULL DEFAULT 0,
                in_app_enabled INTEGER NOT NULL DEFAULT 1,
                quiet_hours_enabled INTEGER NOT NULL DEFAULT 0,
                quiet_hours_allowed_days TEXT,
                quiet_hours_start_time TEXT,
                quiet_hours_end_time TEXT,
                auto_reply_enabled INTEGER NOT NULL DEFAULT 0,
                auto_reply_message TEXT,
                emergency_override INTEGER NOT NULL DEFAULT 0,
                notification_categories TEXT,
                sms_use_own_number_for_reminders INTEGER NOT NULL DEFAULT 1,
                sms_support_thread_mode TEXT NOT NULL DEFAULT 'respondable',
                support_mirror_enabled INTEGER NOT NULL DEFAULT 0
            );
        "#,
    },
    Migration {
        version: 2,
        name: "notifications",
        sql: r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                severity TEXT NOT NULL DEFAULT 'info',
                title TEXT NOT NULL,
                message TEXT NOT NULL,
                user_id TEXT NOT NULL,
                agency_id TEXT,
                related_entity_type TEXT,
                related_entity_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id);

            CREATE TABLE IF NOT EXISTS notification_sms_logs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                agency_id TEXT,
                notification_id TEXT,
                to_number TEXT NOT NULL,
                from_number TEXT NOT NULL,
                body TEXT NOT NULL,
                status TEXT NOT NULL,
                error_message TEXT,
                provider_message_id TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notification_sms_logs_user ON notification_sms_logs(user_id);

            CREATE TABLE IF NOT EXISTS agency_notification_defaults (
                agency_id TEXT PRIMARY KEY,
                defaults TEXT NOT NULL,
                enforce_defaults INTEGER NOT NULL DEFAULT 1
            );
        "#,
    },
    Migration {
        version: 3,
        name: "engagement",
        sql: r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                agency_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                audience_mode TEXT NOT NULL DEFAULT 'all',
                response_options TEXT,
                starts_at TEXT,
                ends_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaigns_agency ON campaigns(agency_id, status);

            CREATE TABLE IF NOT EXISTS campaign_recipients (
                campaign_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (campaign_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS campaign_opt_outs (
                agency_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                opted_out_at TEXT NOT NULL,
                source TEXT NOT NULL,
                PRIMARY KEY (agency_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS campaign_responses (
                id TEXT PRIMARY KEY,
                campaign_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                response_key TEXT NOT NULL,
                response_label TEXT NOT NULL,
                response_body TEXT NOT NULL,
                from_number TEXT,
                received_at TEXT NOT NULL,
                UNIQUE (campaign_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS company_events (
                id TEXT PRIMARY KEY,
                agency_id TEXT NOT NULL,
                title TEXT NOT NULL,
                sms_code TEXT,
                voting_options TEXT,
                voting_open INTEGER NOT NULL DEFAULT 1,
                audience_mode TEXT NOT NULL DEFAULT 'all',
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_company_events_agency ON company_events(agency_id, voting_open);

            CREATE TABLE IF NOT EXISTS event_recipients (
                event_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (event_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS event_responses (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                response_key TEXT NOT NULL,
                response_label TEXT NOT NULL,
                response_body TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT 'sms',
                from_number TEXT,
                received_at TEXT NOT NULL,
                UNIQUE (event_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS supervisor_assignments (
                user_id TEXT NOT NULL,
                supervisor_id TEXT NOT NULL,
                agency_id TEXT NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, supervisor_id, agency_id)
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            conn.execute(
                "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
                libsql::params![migration.version, migration.name],
            )
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "Failed to record migration V{}: {e}",
                    migration.version
                ))
            })?;
        }
    }

    tracing::info!("Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "agencies",
            "users",
            "user_agencies",
            "clients",
            "phone_numbers",
            "number_assignments",
            "number_rules",
            "opt_in_states",
            "message_logs",
            "auto_reply_throttles",
            "thread_escalations",
            "call_logs",
            "call_voicemails",
            "user_call_settings",
            "user_preferences",
            "notifications",
            "notification_sms_logs",
            "agency_notification_defaults",
            "campaigns",
            "campaign_responses",
            "campaign_opt_outs",
            "company_events",
            "event_responses",
            "supervisor_assignments",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn active_escalation_uniqueness_is_enforced() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO thread_escalations (id, user_id, client_id, escalation_type, status, created_at)
             VALUES ('e1', 'u1', 'c1', 'sla_timeout', 'active', '2026-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();

        // Second active escalation for the same (user, client) must be rejected.
        let dup = conn
            .execute(
                "INSERT INTO thread_escalations (id, user_id, client_id, escalation_type, status, created_at)
                 VALUES ('e2', 'u1', 'c1', 'provider_mirror', 'active', '2026-01-01T00:00:00Z')",
                (),
            )
            .await;
        assert!(dup.is_err());

        // A resolved one may coexist with a new active one.
        conn.execute("UPDATE thread_escalations SET status = 'resolved' WHERE id = 'e1'", ())
            .await
            .unwrap();
        conn.execute(
            "INSERT INTO thread_escalations (id, user_id, client_id, escalation_type, status, created_at)
             VALUES ('e3', 'u1', 'c1', 'sla_timeout', 'active', '2026-01-02T00:00:00Z')",
            (),
        )
        .await
        .unwrap();
    }
}
