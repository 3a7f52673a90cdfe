//! In-memory `AuthStore` for development runs without a DSN and for tests.
//!
//! One mutex guards all tables, which gives the same atomicity the Postgres
//! backend gets from single-statement updates. Nothing survives a restart.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::principal::{Principal, PrincipalKind};
use super::rate_limit::WindowCounter;
use super::storage::{
    AuditEvent, AuthStore, CreateOutcome, Credentials, NewPrincipal, OtpChallenge, ProfileUpdate,
    SessionWrite,
};

#[derive(Clone, Debug)]
struct StoredPrincipal {
    principal: Principal,
    password_hash: Option<String>,
    access_hash: Option<Vec<u8>>,
    access_expires_at: Option<DateTime<Utc>>,
    refresh_hash: Option<Vec<u8>>,
    refresh_expires_at: Option<DateTime<Utc>>,
}

impl StoredPrincipal {
    fn clear_session(&mut self) {
        self.access_hash = None;
        self.access_expires_at = None;
        self.refresh_hash = None;
        self.refresh_expires_at = None;
    }
}

#[derive(Debug, Default)]
struct Tables {
    principals: HashMap<PrincipalKind, HashMap<Uuid, StoredPrincipal>>,
    otps: HashMap<String, OtpChallenge>,
    counters: HashMap<(String, String), WindowCounter>,
    audit: Vec<AuditEvent>,
}

impl Tables {
    fn kind(&mut self, kind: PrincipalKind) -> &mut HashMap<Uuid, StoredPrincipal> {
        self.principals.entry(kind).or_default()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the audit trail, oldest first.
    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.tables.lock().await.audit.clone()
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn find_credentials(
        &self,
        kind: PrincipalKind,
        identifier: &str,
    ) -> Result<Option<Credentials>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .kind(kind)
            .values()
            .find(|stored| stored.principal.identifier == identifier)
            .map(|stored| Credentials {
                principal: stored.principal.clone(),
                password_hash: stored.password_hash.clone(),
            }))
    }

    async fn find_principal(&self, kind: PrincipalKind, id: Uuid) -> Result<Option<Principal>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.kind(kind).get(&id).map(|s| s.principal.clone()))
    }

    async fn create_principal(
        &self,
        kind: PrincipalKind,
        new: NewPrincipal,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        let mut tables = self.tables.lock().await;
        let table = tables.kind(kind);
        if table
            .values()
            .any(|stored| stored.principal.identifier == new.identifier)
        {
            return Ok(CreateOutcome::Conflict);
        }

        let principal = Principal {
            id: Uuid::new_v4(),
            kind,
            identifier: new.identifier,
            display_name: new.display_name,
            phone: new.phone,
            is_active: true,
            created_at: now,
            last_login: None,
        };
        table.insert(
            principal.id,
            StoredPrincipal {
                principal: principal.clone(),
                password_hash: new.password_hash,
                access_hash: None,
                access_expires_at: None,
                refresh_hash: None,
                refresh_expires_at: None,
            },
        );
        Ok(CreateOutcome::Created(principal))
    }

    async fn update_profile(
        &self,
        kind: PrincipalKind,
        id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<Option<Principal>> {
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables.kind(kind).get_mut(&id) else {
            return Ok(None);
        };
        if let Some(display_name) = &update.display_name {
            stored.principal.display_name = Some(display_name.clone());
        }
        if let Some(phone) = &update.phone {
            stored.principal.phone = Some(phone.clone());
        }
        Ok(Some(stored.principal.clone()))
    }

    async fn deactivate_principal(&self, kind: PrincipalKind, id: Uuid) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables.kind(kind).get_mut(&id) else {
            return Ok(false);
        };
        stored.principal.is_active = false;
        stored.clear_session();
        Ok(true)
    }

    async fn write_session(
        &self,
        kind: PrincipalKind,
        id: Uuid,
        session: &SessionWrite,
    ) -> Result<Option<Principal>> {
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables
            .kind(kind)
            .get_mut(&id)
            .filter(|stored| stored.principal.is_active)
        else {
            return Ok(None);
        };
        stored.access_hash = Some(session.access_hash.clone());
        stored.access_expires_at = Some(session.access_expires_at);
        stored.refresh_hash = session.refresh_hash.clone();
        stored.refresh_expires_at = session.refresh_expires_at;
        if let Some(login_at) = session.login_at {
            stored.principal.last_login = Some(login_at);
        }
        Ok(Some(stored.principal.clone()))
    }

    async fn principal_by_access_hash(
        &self,
        kind: PrincipalKind,
        access_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<Principal>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .kind(kind)
            .values()
            .find(|stored| {
                stored.principal.is_active
                    && stored.access_hash.as_deref() == Some(access_hash)
                    && stored.access_expires_at.is_some_and(|expires| expires > now)
            })
            .map(|stored| stored.principal.clone()))
    }

    async fn principal_by_refresh_hash(
        &self,
        kind: PrincipalKind,
        refresh_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<(Principal, DateTime<Utc>)>> {
        let mut tables = self.tables.lock().await;
        Ok(tables.kind(kind).values().find_map(|stored| {
            let expires_at = stored.refresh_expires_at?;
            (stored.principal.is_active
                && stored.refresh_hash.as_deref() == Some(refresh_hash)
                && expires_at > now)
                .then(|| (stored.principal.clone(), expires_at))
        }))
    }

    async fn clear_session(&self, kind: PrincipalKind, id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(stored) = tables.kind(kind).get_mut(&id) {
            stored.clear_session();
        }
        Ok(())
    }

    async fn put_otp(&self, challenge: &OtpChallenge) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let mut challenge = challenge.clone();
        challenge.failed_attempts = 0;
        tables.otps.insert(challenge.email.clone(), challenge);
        Ok(())
    }

    async fn get_otp(&self, email: &str) -> Result<Option<OtpChallenge>> {
        Ok(self.tables.lock().await.otps.get(email).cloned())
    }

    async fn record_otp_failure(&self, email: &str) -> Result<u32> {
        let mut tables = self.tables.lock().await;
        Ok(tables.otps.get_mut(email).map_or(0, |challenge| {
            challenge.failed_attempts = challenge.failed_attempts.saturating_add(1);
            challenge.failed_attempts
        }))
    }

    async fn take_otp(&self, email: &str, code_hash: &[u8]) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let matches = tables
            .otps
            .get(email)
            .is_some_and(|challenge| challenge.code_hash == code_hash);
        if matches {
            tables.otps.remove(email);
        }
        Ok(matches)
    }

    async fn delete_otp(&self, email: &str) -> Result<()> {
        self.tables.lock().await.otps.remove(email);
        Ok(())
    }

    async fn hit_rate_counter(
        &self,
        client_key: &str,
        action: &str,
        window: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u32> {
        let mut tables = self.tables.lock().await;
        let key = (client_key.to_string(), action.to_string());
        let counter = WindowCounter::hit(tables.counters.get(&key).copied(), window, now);
        tables.counters.insert(key, counter);
        Ok(counter.hits)
    }

    async fn record_audit(&self, event: &AuditEvent) -> Result<()> {
        self.tables.lock().await.audit.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};

    async fn create(
        store: &MemoryStore,
        kind: PrincipalKind,
        identifier: &str,
    ) -> Result<Principal> {
        let new = NewPrincipal {
            identifier: identifier.to_string(),
            ..NewPrincipal::default()
        };
        match store.create_principal(kind, new, Utc::now()).await? {
            CreateOutcome::Created(principal) => Ok(principal),
            CreateOutcome::Conflict => bail!("unexpected conflict"),
        }
    }

    #[tokio::test]
    async fn identifiers_are_unique_per_kind_only() -> Result<()> {
        let store = MemoryStore::new();
        create(&store, PrincipalKind::Sender, "a@example.com").await?;
        create(&store, PrincipalKind::Receiver, "a@example.com").await?;

        let again = NewPrincipal {
            identifier: "a@example.com".to_string(),
            ..NewPrincipal::default()
        };
        assert!(matches!(
            store
                .create_principal(PrincipalKind::Sender, again, Utc::now())
                .await?,
            CreateOutcome::Conflict
        ));
        Ok(())
    }

    #[tokio::test]
    async fn session_lookup_respects_expiry_and_kind() -> Result<()> {
        let store = MemoryStore::new();
        let principal = create(&store, PrincipalKind::Sender, "b@example.com").await?;
        let now = Utc::now();
        let write = SessionWrite {
            access_hash: vec![1; 32],
            access_expires_at: now + TimeDelta::minutes(5),
            refresh_hash: None,
            refresh_expires_at: None,
            login_at: Some(now),
        };
        let updated = store
            .write_session(PrincipalKind::Sender, principal.id, &write)
            .await?;
        assert_eq!(updated.and_then(|p| p.last_login), Some(now));

        let found = store
            .principal_by_access_hash(PrincipalKind::Sender, &[1; 32], now)
            .await?;
        assert_eq!(found.map(|p| p.id), Some(principal.id));

        let other_kind = store
            .principal_by_access_hash(PrincipalKind::Receiver, &[1; 32], now)
            .await?;
        assert!(other_kind.is_none());

        let expired = store
            .principal_by_access_hash(PrincipalKind::Sender, &[1; 32], now + TimeDelta::minutes(5))
            .await?;
        assert!(expired.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn deactivated_principals_cannot_hold_sessions() -> Result<()> {
        let store = MemoryStore::new();
        let principal = create(&store, PrincipalKind::Receiver, "c@example.com").await?;
        assert!(
            store
                .deactivate_principal(PrincipalKind::Receiver, principal.id)
                .await?
        );
        let write = SessionWrite {
            access_hash: vec![2; 32],
            access_expires_at: Utc::now() + TimeDelta::minutes(5),
            refresh_hash: None,
            refresh_expires_at: None,
            login_at: None,
        };
        assert!(store
            .write_session(PrincipalKind::Receiver, principal.id, &write)
            .await?
            .is_none());
        assert!(
            !store
                .deactivate_principal(PrincipalKind::Receiver, Uuid::new_v4())
                .await?
        );
        Ok(())
    }

    #[tokio::test]
    async fn take_otp_is_single_use() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .put_otp(&OtpChallenge {
                email: "d@example.com".to_string(),
                code_hash: vec![3; 32],
                created_at: now,
                expires_at: now + TimeDelta::minutes(10),
                failed_attempts: 0,
            })
            .await?;
        assert!(!store.take_otp("d@example.com", &[4; 32]).await?);
        assert_eq!(store.record_otp_failure("d@example.com").await?, 1);
        assert!(store.take_otp("d@example.com", &[3; 32]).await?);
        assert!(!store.take_otp("d@example.com", &[3; 32]).await?);
        assert_eq!(store.record_otp_failure("d@example.com").await?, 0);
        Ok(())
    }
}
