//! SQLite ledger storage

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::crypto::timestamp_preimage;
use crate::domain::{
    parse_hash256, Actor, ActorKind, AnonymizationLevel, AuditAction, AuditEntry, AuditPayload,
    BuyerId, ChainHead, ConsentGrant, DataCategory, DataPackage, GrantId, PackageId,
    PayloadDescriptor, RequestId, TrustProfile, UserId,
};
use crate::infra::{LedgerError, LedgerMutation, LedgerStorage, Result};

/// SQLite-backed ledger storage
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create storage over an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a database URL, creating the file if missing.
    ///
    /// In-memory databases are limited to one connection so every query
    /// sees the same database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Initialize the database schema
    pub async fn initialize(&self) -> Result<()> {
        crate::migrations::run_sqlite(&self.pool)
            .await
            .map_err(|e| LedgerError::Internal(format!("migration failed: {e}")))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn head_in(tx: &mut Transaction<'_, Sqlite>) -> Result<ChainHead> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT sequence, entry_hash FROM audit_entries ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut **tx)
        .await?;
        head_from_row(row)
    }

    async fn insert_entry(tx: &mut Transaction<'_, Sqlite>, entry: &AuditEntry) -> Result<()> {
        let payload_json = serde_json::to_string(&entry.payload)?;
        sqlx::query(
            r#"
            INSERT INTO audit_entries (
                sequence, prev_hash, entry_hash,
                actor_kind, actor_id, action,
                recorded_at, payload,
                buyer_id, user_id, grant_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.sequence as i64)
        .bind(hex::encode(entry.prev_hash))
        .bind(hex::encode(entry.entry_hash))
        .bind(entry.actor.kind.as_str())
        .bind(&entry.actor.id)
        .bind(entry.action.as_str())
        .bind(timestamp_preimage(&entry.recorded_at))
        .bind(&payload_json)
        .bind(entry.payload.buyer_id().map(|b| b.0.clone()))
        .bind(entry.payload.user_id().map(|u| u.0.clone()))
        .bind(entry.payload.grant_id().map(|g| g.0.to_string()))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn apply_mutation(
        tx: &mut Transaction<'_, Sqlite>,
        sequence: u64,
        mutation: &LedgerMutation,
    ) -> Result<()> {
        match mutation {
            LedgerMutation::None => {}
            LedgerMutation::Grant(grant) => {
                let scope_json = serde_json::to_string(&grant.scope)?;
                let method_json = serde_json::to_string(&grant.consent_method)?;
                sqlx::query(
                    r#"
                    INSERT INTO consent_grants (
                        grant_id, user_id, buyer_id, category, purpose,
                        scope, requested_level, granted_at, expires_at,
                        policy_version, consent_method, audit_sequence
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(grant.grant_id.0.to_string())
                .bind(&grant.user_id.0)
                .bind(&grant.buyer_id.0)
                .bind(&grant.category.0)
                .bind(&grant.purpose)
                .bind(&scope_json)
                .bind(grant.requested_level.as_str())
                .bind(grant.granted_at.to_rfc3339())
                .bind(grant.expires_at.map(|t| t.to_rfc3339()))
                .bind(&grant.policy_version)
                .bind(&method_json)
                .bind(sequence as i64)
                .execute(&mut **tx)
                .await?;
            }
            LedgerMutation::Revocation(revocation) => {
                let grant_key = revocation.grant_id.0.to_string();
                let exists: Option<(String,)> =
                    sqlx::query_as("SELECT grant_id FROM consent_grants WHERE grant_id = ?")
                        .bind(&grant_key)
                        .fetch_optional(&mut **tx)
                        .await?;
                if exists.is_none() {
                    return Err(LedgerError::GrantNotFound(revocation.grant_id));
                }
                let revoked: Option<(String,)> =
                    sqlx::query_as("SELECT grant_id FROM grant_revocations WHERE grant_id = ?")
                        .bind(&grant_key)
                        .fetch_optional(&mut **tx)
                        .await?;
                if revoked.is_some() {
                    return Err(LedgerError::AlreadyRevoked(revocation.grant_id));
                }

                let reason_json = serde_json::to_string(&revocation.reason)?;
                sqlx::query(
                    r#"
                    INSERT INTO grant_revocations (
                        grant_id, revoked_at, actor_kind, actor_id, reason, audit_sequence
                    ) VALUES (?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&grant_key)
                .bind(revocation.revoked_at.to_rfc3339())
                .bind(revocation.actor.kind.as_str())
                .bind(&revocation.actor.id)
                .bind(&reason_json)
                .bind(sequence as i64)
                .execute(&mut **tx)
                .await?;
            }
            LedgerMutation::Package(package) => {
                sqlx::query(
                    r#"
                    INSERT INTO data_packages (
                        package_id, request_id, grant_id, buyer_id, user_id, applied_level,
                        payload_ref, payload_digest, field_count, token_hash,
                        issued_at, token_expires_at, audit_sequence
                    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(package.package_id.0.to_string())
                .bind(package.request_id.0.to_string())
                .bind(package.grant_id.0.to_string())
                .bind(&package.buyer_id.0)
                .bind(&package.user_id.0)
                .bind(package.applied_level.as_str())
                .bind(&package.payload.payload_ref)
                .bind(hex::encode(package.payload.digest))
                .bind(package.payload.field_count as i64)
                .bind(&package.token_hash)
                .bind(package.issued_at.to_rfc3339())
                .bind(package.token_expires_at.to_rfc3339())
                .bind(sequence as i64)
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }
}

const GRANT_COLUMNS: &str = r#"
    g.grant_id, g.user_id, g.buyer_id, g.category, g.purpose,
    g.scope, g.requested_level, g.granted_at, g.expires_at,
    g.policy_version, g.consent_method, r.revoked_at
"#;

const AUDIT_COLUMNS: &str = r#"
    sequence, prev_hash, entry_hash, actor_kind, actor_id,
    action, recorded_at, payload
"#;

#[async_trait]
impl LedgerStorage for SqliteStorage {
    #[instrument(skip(self, entry, mutation), fields(sequence = entry.sequence, action = %entry.action))]
    async fn commit(&self, entry: &AuditEntry, mutation: &LedgerMutation) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let head = Self::head_in(&mut tx).await?;
        if entry.sequence != head.sequence + 1 || entry.prev_hash != head.hash {
            return Err(LedgerError::SequenceConflict {
                expected: head.sequence + 1,
                actual: entry.sequence,
            });
        }

        Self::insert_entry(&mut tx, entry).await?;
        Self::apply_mutation(&mut tx, entry.sequence, mutation).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn audit_head(&self) -> Result<ChainHead> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT sequence, entry_hash FROM audit_entries ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        head_from_row(row)
    }

    async fn read_audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditEntry>> {
        let query = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE sequence >= ? AND sequence <= ? ORDER BY sequence ASC"
        );
        let rows = sqlx::query_as::<_, AuditEntryRow>(&query)
            .bind(from.max(1) as i64)
            .bind(to.min(i64::MAX as u64) as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AuditEntry::try_from).collect()
    }

    async fn read_buyer_audit(
        &self,
        buyer_id: &BuyerId,
        up_to: Option<u64>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>> {
        let query = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_entries WHERE buyer_id = ? AND sequence <= ? ORDER BY sequence DESC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, AuditEntryRow>(&query)
            .bind(&buyer_id.0)
            .bind(up_to.unwrap_or(i64::MAX as u64).min(i64::MAX as u64) as i64)
            .bind(limit.min(i64::MAX as usize) as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut entries = rows
            .into_iter()
            .map(AuditEntry::try_from)
            .collect::<Result<Vec<_>>>()?;
        entries.reverse();
        Ok(entries)
    }

    async fn get_grant(&self, grant_id: &GrantId) -> Result<Option<ConsentGrant>> {
        let query = format!(
            "SELECT {GRANT_COLUMNS} FROM consent_grants g \
             LEFT JOIN grant_revocations r ON r.grant_id = g.grant_id \
             WHERE g.grant_id = ?"
        );
        let row = sqlx::query_as::<_, GrantRow>(&query)
            .bind(grant_id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(ConsentGrant::try_from).transpose()
    }

    async fn grants_for(
        &self,
        user_id: &UserId,
        buyer_id: &BuyerId,
        category: &DataCategory,
    ) -> Result<Vec<ConsentGrant>> {
        let query = format!(
            "SELECT {GRANT_COLUMNS} FROM consent_grants g \
             LEFT JOIN grant_revocations r ON r.grant_id = g.grant_id \
             WHERE g.user_id = ? AND g.buyer_id = ? AND g.category = ? \
             ORDER BY g.audit_sequence ASC"
        );
        let rows = sqlx::query_as::<_, GrantRow>(&query)
            .bind(&user_id.0)
            .bind(&buyer_id.0)
            .bind(&category.0)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(ConsentGrant::try_from).collect()
    }

    async fn get_package(&self, package_id: &PackageId) -> Result<Option<DataPackage>> {
        let row = sqlx::query_as::<_, PackageRow>(
            r#"
            SELECT package_id, request_id, grant_id, buyer_id, user_id, applied_level,
                   payload_ref, payload_digest, field_count, token_hash,
                   issued_at, token_expires_at
            FROM data_packages
            WHERE package_id = ?
            "#,
        )
        .bind(package_id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DataPackage::try_from).transpose()
    }

    async fn list_buyers(&self) -> Result<Vec<BuyerId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT buyer_id FROM audit_entries WHERE action = ? AND buyer_id IS NOT NULL ORDER BY buyer_id",
        )
        .bind(AuditAction::BuyerOnboarded.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(b,)| BuyerId(b)).collect())
    }

    async fn store_trust_profile(&self, profile: &TrustProfile) -> Result<()> {
        let json = serde_json::to_string(profile)?;
        sqlx::query(
            r#"
            INSERT INTO trust_profiles (buyer_id, as_of_sequence, profile)
            VALUES (?, ?, ?)
            ON CONFLICT(buyer_id, as_of_sequence) DO UPDATE SET profile = excluded.profile
            "#,
        )
        .bind(&profile.buyer_id.0)
        .bind(profile.as_of_sequence as i64)
        .bind(&json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_trust_profiles(&self) -> Result<Vec<TrustProfile>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT t.profile FROM trust_profiles t
            WHERE t.as_of_sequence = (
                SELECT MAX(as_of_sequence) FROM trust_profiles WHERE buyer_id = t.buyer_id
            )
            ORDER BY t.buyer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(json,)| serde_json::from_str(&json).map_err(LedgerError::from))
            .collect()
    }
}

fn head_from_row(row: Option<(i64, String)>) -> Result<ChainHead> {
    match row {
        None => Ok(ChainHead::genesis()),
        Some((sequence, hash)) => Ok(ChainHead {
            sequence: sequence as u64,
            hash: parse_hash256(&hash)
                .ok_or_else(|| LedgerError::Internal(format!("bad hash at sequence {sequence}")))?,
        }),
    }
}

fn parse_time(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Internal(format!("invalid {column} timestamp: {e}")))
}

fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| LedgerError::Internal(format!("invalid {column}: {e}")))
}

/// Database row for audit entries
#[derive(Debug, FromRow)]
struct AuditEntryRow {
    sequence: i64,
    prev_hash: String,
    entry_hash: String,
    actor_kind: String,
    actor_id: String,
    action: String,
    recorded_at: String,
    payload: String,
}

impl TryFrom<AuditEntryRow> for AuditEntry {
    type Error = LedgerError;

    fn try_from(row: AuditEntryRow) -> Result<Self> {
        let sequence = row.sequence;
        let bad = |what: &str| LedgerError::Internal(format!("invalid {what} at sequence {sequence}"));

        let kind = ActorKind::parse(&row.actor_kind).ok_or_else(|| bad("actor kind"))?;
        let action = AuditAction::parse(&row.action).ok_or_else(|| bad("action"))?;
        let prev_hash = parse_hash256(&row.prev_hash).ok_or_else(|| bad("prev_hash"))?;
        let entry_hash = parse_hash256(&row.entry_hash).ok_or_else(|| bad("entry_hash"))?;
        let payload: AuditPayload = serde_json::from_str(&row.payload)?;

        Ok(AuditEntry {
            sequence: sequence as u64,
            prev_hash,
            entry_hash,
            actor: Actor {
                kind,
                id: row.actor_id,
            },
            action,
            recorded_at: parse_time("recorded_at", &row.recorded_at)?,
            payload,
        })
    }
}

/// Database row for grants joined with their revocation
#[derive(Debug, FromRow)]
struct GrantRow {
    grant_id: String,
    user_id: String,
    buyer_id: String,
    category: String,
    purpose: String,
    scope: String,
    requested_level: String,
    granted_at: String,
    expires_at: Option<String>,
    policy_version: String,
    consent_method: String,
    revoked_at: Option<String>,
}

impl TryFrom<GrantRow> for ConsentGrant {
    type Error = LedgerError;

    fn try_from(row: GrantRow) -> Result<Self> {
        Ok(ConsentGrant {
            grant_id: GrantId::from_uuid(parse_uuid("grant_id", &row.grant_id)?),
            user_id: UserId(row.user_id),
            buyer_id: BuyerId(row.buyer_id),
            category: DataCategory(row.category),
            purpose: row.purpose,
            scope: serde_json::from_str(&row.scope)?,
            requested_level: AnonymizationLevel::from_str(&row.requested_level)?,
            granted_at: parse_time("granted_at", &row.granted_at)?,
            expires_at: row
                .expires_at
                .as_deref()
                .map(|s| parse_time("expires_at", s))
                .transpose()?,
            revoked_at: row
                .revoked_at
                .as_deref()
                .map(|s| parse_time("revoked_at", s))
                .transpose()?,
            policy_version: row.policy_version,
            consent_method: serde_json::from_str(&row.consent_method)?,
        })
    }
}

/// Database row for released packages
#[derive(Debug, FromRow)]
struct PackageRow {
    package_id: String,
    request_id: String,
    grant_id: String,
    buyer_id: String,
    user_id: String,
    applied_level: String,
    payload_ref: String,
    payload_digest: String,
    field_count: i64,
    token_hash: String,
    issued_at: String,
    token_expires_at: String,
}

impl TryFrom<PackageRow> for DataPackage {
    type Error = LedgerError;

    fn try_from(row: PackageRow) -> Result<Self> {
        Ok(DataPackage {
            package_id: PackageId::from_uuid(parse_uuid("package_id", &row.package_id)?),
            request_id: RequestId::from_uuid(parse_uuid("request_id", &row.request_id)?),
            grant_id: GrantId::from_uuid(parse_uuid("grant_id", &row.grant_id)?),
            buyer_id: BuyerId(row.buyer_id),
            user_id: UserId(row.user_id),
            applied_level: AnonymizationLevel::from_str(&row.applied_level)?,
            payload: PayloadDescriptor {
                payload_ref: row.payload_ref,
                digest: parse_hash256(&row.payload_digest).ok_or_else(|| {
                    LedgerError::Internal("invalid payload digest".to_string())
                })?,
                field_count: row.field_count as u32,
            },
            issued_at: parse_time("issued_at", &row.issued_at)?,
            token_expires_at: parse_time("token_expires_at", &row.token_expires_at)?,
            token_hash: row.token_hash,
        })
    }
}
