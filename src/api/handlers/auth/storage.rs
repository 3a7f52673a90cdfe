//! Storage seam for principals, sessions, OTP challenges, rate-limit counters
//! and the audit trail.
//!
//! Handlers never hold process-global state: everything goes through an
//! injected [`AuthStore`]. [`PgStore`] is the production backend; the
//! in-memory backend lives in `memory.rs`.
//!
//! Session state sits on the principal's own row, so "one authoritative session
//! per principal" is a single-row update and needs no extra locking.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::principal::{Principal, PrincipalKind};

/// Fields accepted when creating a principal.
#[derive(Clone, Debug, Default)]
pub struct NewPrincipal {
    pub identifier: String,
    pub display_name: Option<String>,
    pub phone: Option<String>,
    pub password_hash: Option<String>,
}

#[derive(Debug)]
pub enum CreateOutcome {
    Created(Principal),
    Conflict,
}

/// Principal plus its stored password hash (absent for passwordless senders).
#[derive(Clone, Debug)]
pub struct Credentials {
    pub principal: Principal,
    pub password_hash: Option<String>,
}

/// Session state written on login or refresh; overwrites any previous session.
#[derive(Clone, Debug)]
pub struct SessionWrite {
    pub access_hash: Vec<u8>,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_hash: Option<Vec<u8>>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
    /// Stamped into `last_login` when present (login, not refresh).
    pub login_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default)]
pub struct ProfileUpdate {
    pub display_name: Option<String>,
    pub phone: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OtpChallenge {
    pub email: String,
    pub code_hash: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub failed_attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEvent {
    pub kind: Option<PrincipalKind>,
    pub principal_id: Option<Uuid>,
    pub action: String,
    pub client_ip: Option<String>,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait AuthStore: Send + Sync {
    /// Cheap liveness probe for `/health`.
    async fn ping(&self) -> Result<()>;

    async fn find_credentials(
        &self,
        kind: PrincipalKind,
        identifier: &str,
    ) -> Result<Option<Credentials>>;

    async fn find_principal(&self, kind: PrincipalKind, id: Uuid) -> Result<Option<Principal>>;

    async fn create_principal(
        &self,
        kind: PrincipalKind,
        new: NewPrincipal,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome>;

    /// Fill the given profile fields; `None` leaves a field untouched.
    async fn update_profile(
        &self,
        kind: PrincipalKind,
        id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<Option<Principal>>;

    /// Mark the principal inactive and clear its session. `false` if unknown.
    async fn deactivate_principal(&self, kind: PrincipalKind, id: Uuid) -> Result<bool>;

    /// Persist a session for an active principal. `None` if the principal is
    /// unknown or inactive.
    async fn write_session(
        &self,
        kind: PrincipalKind,
        id: Uuid,
        session: &SessionWrite,
    ) -> Result<Option<Principal>>;

    /// Active principal whose unexpired access hash matches.
    async fn principal_by_access_hash(
        &self,
        kind: PrincipalKind,
        access_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<Principal>>;

    /// Active principal whose unexpired refresh hash matches, with the refresh expiry.
    async fn principal_by_refresh_hash(
        &self,
        kind: PrincipalKind,
        refresh_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<(Principal, DateTime<Utc>)>>;

    async fn clear_session(&self, kind: PrincipalKind, id: Uuid) -> Result<()>;

    /// Store a challenge, replacing any previous one for the same email.
    async fn put_otp(&self, challenge: &OtpChallenge) -> Result<()>;

    async fn get_otp(&self, email: &str) -> Result<Option<OtpChallenge>>;

    /// Increment and return the failed-attempt counter (0 if no challenge).
    async fn record_otp_failure(&self, email: &str) -> Result<u32>;

    /// Delete the challenge only if it still carries `code_hash`.
    /// Exactly one concurrent caller observes `true`.
    async fn take_otp(&self, email: &str, code_hash: &[u8]) -> Result<bool>;

    async fn delete_otp(&self, email: &str) -> Result<()>;

    /// Fixed-window hit: reset to 1 if `window` elapsed since the window start,
    /// otherwise increment. Returns the count after this hit.
    async fn hit_rate_counter(
        &self,
        client_key: &str,
        action: &str,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u32>;

    async fn record_audit(&self, event: &AuditEvent) -> Result<()>;
}

/// Postgres backend; the schema lives in `sql/schema.sql`.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PRINCIPAL_COLUMNS: &str =
    "id, identifier, display_name, phone, is_active, created_at, last_login";

fn principal_from_row(kind: PrincipalKind, row: &PgRow) -> Principal {
    Principal {
        id: row.get("id"),
        kind,
        identifier: row.get("identifier"),
        display_name: row.get("display_name"),
        phone: row.get("phone"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        last_login: row.get("last_login"),
    }
}

fn otp_from_row(row: &PgRow) -> OtpChallenge {
    let failed_attempts: i32 = row.get("failed_attempts");
    OtpChallenge {
        email: row.get("email"),
        code_hash: row.get("code_hash"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        failed_attempts: u32::try_from(failed_attempts).unwrap_or(0),
    }
}

fn db_span(operation: &'static str, statement: &str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

pub(super) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[async_trait]
impl AuthStore for PgStore {
    async fn ping(&self) -> Result<()> {
        let query = "SELECT 1";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to ping database")?;
        Ok(())
    }

    async fn find_credentials(
        &self,
        kind: PrincipalKind,
        identifier: &str,
    ) -> Result<Option<Credentials>> {
        let query = format!(
            "SELECT {PRINCIPAL_COLUMNS}, password_hash FROM {} WHERE identifier = $1",
            kind.table()
        );
        let row = sqlx::query(&query)
            .bind(identifier)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup credentials")?;

        Ok(row.map(|row| Credentials {
            principal: principal_from_row(kind, &row),
            password_hash: row.get("password_hash"),
        }))
    }

    async fn find_principal(&self, kind: PrincipalKind, id: Uuid) -> Result<Option<Principal>> {
        let query = format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM {} WHERE id = $1",
            kind.table()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup principal")?;
        Ok(row.map(|row| principal_from_row(kind, &row)))
    }

    async fn create_principal(
        &self,
        kind: PrincipalKind,
        new: NewPrincipal,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        let query = format!(
            r"
            INSERT INTO {}
                (identifier, display_name, phone, password_hash, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {PRINCIPAL_COLUMNS}
            ",
            kind.table()
        );
        let result = sqlx::query(&query)
            .bind(&new.identifier)
            .bind(&new.display_name)
            .bind(&new.phone)
            .bind(&new.password_hash)
            .bind(now)
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", &query))
            .await;

        match result {
            Ok(row) => Ok(CreateOutcome::Created(principal_from_row(kind, &row))),
            Err(err) if is_unique_violation(&err) => Ok(CreateOutcome::Conflict),
            Err(err) => Err(err).context("failed to insert principal"),
        }
    }

    async fn update_profile(
        &self,
        kind: PrincipalKind,
        id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<Option<Principal>> {
        let query = format!(
            r"
            UPDATE {}
            SET display_name = COALESCE($2, display_name),
                phone = COALESCE($3, phone)
            WHERE id = $1
            RETURNING {PRINCIPAL_COLUMNS}
            ",
            kind.table()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(&update.display_name)
            .bind(&update.phone)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .context("failed to update profile")?;
        Ok(row.map(|row| principal_from_row(kind, &row)))
    }

    async fn deactivate_principal(&self, kind: PrincipalKind, id: Uuid) -> Result<bool> {
        // Deactivation also drops the session so outstanding tokens stop working.
        let query = format!(
            r"
            UPDATE {}
            SET is_active = FALSE,
                session_token_hash = NULL,
                session_expires_at = NULL,
                refresh_token_hash = NULL,
                refresh_expires_at = NULL
            WHERE id = $1
            ",
            kind.table()
        );
        let result = sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .context("failed to deactivate principal")?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_session(
        &self,
        kind: PrincipalKind,
        id: Uuid,
        session: &SessionWrite,
    ) -> Result<Option<Principal>> {
        let query = format!(
            r"
            UPDATE {}
            SET session_token_hash = $2,
                session_expires_at = $3,
                refresh_token_hash = $4,
                refresh_expires_at = $5,
                last_login = COALESCE($6, last_login)
            WHERE id = $1
              AND is_active
            RETURNING {PRINCIPAL_COLUMNS}
            ",
            kind.table()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .bind(&session.access_hash)
            .bind(session.access_expires_at)
            .bind(&session.refresh_hash)
            .bind(session.refresh_expires_at)
            .bind(session.login_at)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .context("failed to write session")?;
        Ok(row.map(|row| principal_from_row(kind, &row)))
    }

    async fn principal_by_access_hash(
        &self,
        kind: PrincipalKind,
        access_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<Principal>> {
        // Only accept active principals and unexpired sessions.
        let query = format!(
            r"
            SELECT {PRINCIPAL_COLUMNS}
            FROM {}
            WHERE session_token_hash = $1
              AND session_expires_at > $2
              AND is_active
            LIMIT 1
            ",
            kind.table()
        );
        let row = sqlx::query(&query)
            .bind(access_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup session")?;
        Ok(row.map(|row| principal_from_row(kind, &row)))
    }

    async fn principal_by_refresh_hash(
        &self,
        kind: PrincipalKind,
        refresh_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<(Principal, DateTime<Utc>)>> {
        let query = format!(
            r"
            SELECT {PRINCIPAL_COLUMNS}, refresh_expires_at
            FROM {}
            WHERE refresh_token_hash = $1
              AND refresh_expires_at > $2
              AND is_active
            LIMIT 1
            ",
            kind.table()
        );
        let row = sqlx::query(&query)
            .bind(refresh_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", &query))
            .await
            .context("failed to lookup refresh token")?;
        Ok(row.map(|row| {
            let expires_at: DateTime<Utc> = row.get("refresh_expires_at");
            (principal_from_row(kind, &row), expires_at)
        }))
    }

    async fn clear_session(&self, kind: PrincipalKind, id: Uuid) -> Result<()> {
        // Logout is idempotent; it's fine if the session was already cleared.
        let query = format!(
            r"
            UPDATE {}
            SET session_token_hash = NULL,
                session_expires_at = NULL,
                refresh_token_hash = NULL,
                refresh_expires_at = NULL
            WHERE id = $1
            ",
            kind.table()
        );
        sqlx::query(&query)
            .bind(id)
            .execute(&self.pool)
            .instrument(db_span("UPDATE", &query))
            .await
            .context("failed to clear session")?;
        Ok(())
    }

    async fn put_otp(&self, challenge: &OtpChallenge) -> Result<()> {
        let query = r"
            INSERT INTO otp_challenges (email, code_hash, created_at, expires_at, failed_attempts)
            VALUES ($1, $2, $3, $4, 0)
            ON CONFLICT (email) DO UPDATE
            SET code_hash = EXCLUDED.code_hash,
                created_at = EXCLUDED.created_at,
                expires_at = EXCLUDED.expires_at,
                failed_attempts = 0
        ";
        sqlx::query(query)
            .bind(&challenge.email)
            .bind(&challenge.code_hash)
            .bind(challenge.created_at)
            .bind(challenge.expires_at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to store otp challenge")?;
        Ok(())
    }

    async fn get_otp(&self, email: &str) -> Result<Option<OtpChallenge>> {
        let query = r"
            SELECT email, code_hash, created_at, expires_at, failed_attempts
            FROM otp_challenges
            WHERE email = $1
        ";
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("SELECT", query))
            .await
            .context("failed to lookup otp challenge")?;
        Ok(row.as_ref().map(otp_from_row))
    }

    async fn record_otp_failure(&self, email: &str) -> Result<u32> {
        let query = r"
            UPDATE otp_challenges
            SET failed_attempts = failed_attempts + 1
            WHERE email = $1
            RETURNING failed_attempts
        ";
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span("UPDATE", query))
            .await
            .context("failed to record otp failure")?;
        Ok(row
            .map(|row| row.get::<i32, _>("failed_attempts"))
            .and_then(|attempts| u32::try_from(attempts).ok())
            .unwrap_or(0))
    }

    async fn take_otp(&self, email: &str, code_hash: &[u8]) -> Result<bool> {
        let query = "DELETE FROM otp_challenges WHERE email = $1 AND code_hash = $2";
        let result = sqlx::query(query)
            .bind(email)
            .bind(code_hash)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to consume otp challenge")?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_otp(&self, email: &str) -> Result<()> {
        let query = "DELETE FROM otp_challenges WHERE email = $1";
        sqlx::query(query)
            .bind(email)
            .execute(&self.pool)
            .instrument(db_span("DELETE", query))
            .await
            .context("failed to delete otp challenge")?;
        Ok(())
    }

    async fn hit_rate_counter(
        &self,
        client_key: &str,
        action: &str,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        // Single upsert so concurrent hits from several instances stay atomic.
        let query = r"
            INSERT INTO rate_limit_counters (client_key, action, hits, window_start)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (client_key, action) DO UPDATE
            SET hits = CASE
                    WHEN rate_limit_counters.window_start <= $3 - ($4 * INTERVAL '1 millisecond')
                    THEN 1
                    ELSE rate_limit_counters.hits + 1
                END,
                window_start = CASE
                    WHEN rate_limit_counters.window_start <= $3 - ($4 * INTERVAL '1 millisecond')
                    THEN $3
                    ELSE rate_limit_counters.window_start
                END
            RETURNING hits
        ";
        let row = sqlx::query(query)
            .bind(client_key)
            .bind(action)
            .bind(now)
            .bind(window.num_milliseconds())
            .fetch_one(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to hit rate limit counter")?;
        let hits: i32 = row.get("hits");
        Ok(u32::try_from(hits).unwrap_or(u32::MAX))
    }

    async fn record_audit(&self, event: &AuditEvent) -> Result<()> {
        let query = r"
            INSERT INTO auth_audit (principal_kind, principal_id, action, client_ip, created_at)
            VALUES ($1, $2, $3, $4, $5)
        ";
        sqlx::query(query)
            .bind(event.kind.map(PrincipalKind::as_str))
            .bind(event.principal_id)
            .bind(&event.action)
            .bind(&event.client_ip)
            .bind(event.at)
            .execute(&self.pool)
            .instrument(db_span("INSERT", query))
            .await
            .context("failed to record audit event")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn is_unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
