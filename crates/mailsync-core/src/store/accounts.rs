//! Account rows: seeding, exclusive claims and cursor updates.

use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info};

use super::{Store, parse_timestamp, timestamp};
use crate::account::{
    Account, AccountId, AccountSeed, AccountStatus, ClaimState, ImapConfig, Security, SmtpConfig,
};
use crate::{Error, Result};

/// Hours the content cursor is pushed back when a worker fails.
const FAILURE_ROLLBACK_HOURS: i64 = 1;

/// Hours the content cursor is pushed back when a stuck claim is released.
const STUCK_ROLLBACK_HOURS: i64 = 2;

const ACCOUNT_COLUMNS: &str = "id, address, username, password, \
     imap_host, imap_port, imap_security, smtp_host, smtp_port, smtp_security, \
     node, status, claim_state, claimed_at, last_list_sync_time, last_content_sync_time";

impl Store {
    /// Creates or updates the account with the seed's address.
    ///
    /// Claim state and cursors of an existing account are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no server settings are known for the
    /// address, or a database error.
    pub async fn upsert_account(&self, seed: &AccountSeed) -> Result<AccountId> {
        let (imap, smtp) = seed.servers().ok_or_else(|| {
            Error::Config(format!("no server settings for {}", seed.address))
        })?;

        let row = sqlx::query(
            r"
            INSERT INTO accounts (
                address, username, password,
                imap_host, imap_port, imap_security,
                smtp_host, smtp_port, smtp_security,
                node, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
                username = excluded.username,
                password = excluded.password,
                imap_host = excluded.imap_host,
                imap_port = excluded.imap_port,
                imap_security = excluded.imap_security,
                smtp_host = excluded.smtp_host,
                smtp_port = excluded.smtp_port,
                smtp_security = excluded.smtp_security,
                node = excluded.node,
                status = excluded.status
            RETURNING id
            ",
        )
        .bind(&seed.address)
        .bind(seed.username())
        .bind(&seed.password)
        .bind(&imap.host)
        .bind(i64::from(imap.port))
        .bind(security_to_string(imap.security))
        .bind(&smtp.host)
        .bind(i64::from(smtp.port))
        .bind(security_to_string(smtp.security))
        .bind(seed.node)
        .bind(seed.status.as_str())
        .fetch_one(&self.pool)
        .await?;

        let id = AccountId::new(row.get("id"));
        debug!(account = %id, address = %seed.address, "account upserted");
        Ok(id)
    }

    /// Get account by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(row_to_account))
    }

    /// Get all accounts ordered by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_account).collect())
    }

    /// Enables or disables scheduling for an account.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] or a database error.
    pub async fn set_account_status(&self, id: AccountId, status: AccountStatus) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::AccountNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Claims up to `limit` idle active accounts, oldest content cursor first
    /// and never-synced accounts before all others.
    ///
    /// Selection and marking are one statement, so concurrent callers never
    /// receive the same account. `node` restricts the selection to one shard.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn claim_accounts(
        &self,
        node: Option<i64>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r"
            UPDATE accounts
            SET claim_state = 1, claimed_at = ?
            WHERE claim_state = 0 AND id IN (
                SELECT id FROM accounts
                WHERE status = 'active' AND claim_state = 0 AND (? IS NULL OR node = ?)
                ORDER BY last_content_sync_time IS NOT NULL, last_content_sync_time, id
                LIMIT ?
            )
            RETURNING {ACCOUNT_COLUMNS}
            "
        ))
        .bind(timestamp(now))
        .bind(node)
        .bind(node)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut accounts: Vec<Account> = rows.iter().map(row_to_account).collect();
        accounts.sort_by(|a, b| {
            a.last_content_sync_time
                .cmp(&b.last_content_sync_time)
                .then(a.id.cmp(&b.id))
        });
        if !accounts.is_empty() {
            debug!(count = accounts.len(), ?node, "accounts claimed");
        }
        Ok(accounts)
    }

    /// Releases the claim after a successful run and advances the content cursor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] or a database error.
    pub async fn complete_account(&self, id: AccountId, now: DateTime<Utc>) -> Result<()> {
        self.release_account(id, now).await
    }

    /// Releases the claim after a failed run and rolls the content cursor back
    /// so the account is picked early by the next pass.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccountNotFound`] or a database error.
    pub async fn fail_account(&self, id: AccountId, now: DateTime<Utc>) -> Result<()> {
        self.release_account(id, now - Duration::hours(FAILURE_ROLLBACK_HOURS)).await
    }

    async fn release_account(&self, id: AccountId, cursor: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE accounts
            SET claim_state = 0, claimed_at = NULL, last_content_sync_time = ?
            WHERE id = ?
            ",
        )
        .bind(timestamp(cursor))
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::AccountNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Releases claims taken before `claimed_before`, for workers that never
    /// reported back. Returns the number of accounts released.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn release_stuck_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE accounts
            SET claim_state = 0, claimed_at = NULL, last_content_sync_time = ?
            WHERE claim_state = 1 AND (claimed_at IS NULL OR claimed_at < ?)
            ",
        )
        .bind(timestamp(now - Duration::hours(STUCK_ROLLBACK_HOURS)))
        .bind(timestamp(claimed_before))
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!(released, "released stuck account claims");
        }
        Ok(released)
    }
}

/// Convert a database row to an Account.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn row_to_account(row: &SqliteRow) -> Account {
    Account {
        id: AccountId::new(row.get("id")),
        address: row.get("address"),
        username: row.get("username"),
        password: row.get("password"),
        imap: ImapConfig {
            host: row.get("imap_host"),
            port: row.get::<i64, _>("imap_port") as u16,
            security: string_to_security(row.get("imap_security")),
        },
        smtp: SmtpConfig {
            host: row.get("smtp_host"),
            port: row.get::<i64, _>("smtp_port") as u16,
            security: string_to_security(row.get("smtp_security")),
        },
        node: row.get("node"),
        status: AccountStatus::from_column(row.get("status")),
        claim_state: ClaimState::from_code(row.get("claim_state")),
        claimed_at: parse_timestamp(row.get("claimed_at")),
        last_list_sync_time: parse_timestamp(row.get("last_list_sync_time")),
        last_content_sync_time: parse_timestamp(row.get("last_content_sync_time")),
    }
}

const fn security_to_string(security: Security) -> &'static str {
    match security {
        Security::None => "none",
        Security::Tls => "tls",
        Security::StartTls => "starttls",
    }
}

fn string_to_security(s: &str) -> Security {
    match s {
        "none" => Security::None,
        "starttls" => Security::StartTls,
        _ => Security::Tls,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn seed(address: &str, node: i64) -> AccountSeed {
        AccountSeed {
            node,
            imap: Some(ImapConfig {
                host: "imap.example.org".into(),
                port: 0,
                security: Security::Tls,
            }),
            smtp: Some(SmtpConfig {
                host: "smtp.example.org".into(),
                port: 0,
                security: Security::StartTls,
            }),
            ..AccountSeed::with_email(address, "secret")
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = Store::in_memory().await.unwrap();
        let id = store.upsert_account(&seed("a@example.org", 2)).await.unwrap();

        let account = store.get_account(id).await.unwrap().unwrap();
        assert_eq!(account.address, "a@example.org");
        assert_eq!(account.username, "a@example.org");
        assert_eq!(account.imap.port, 993);
        assert_eq!(account.smtp.port, 587);
        assert_eq!(account.smtp.security, Security::StartTls);
        assert_eq!(account.node, 2);
        assert_eq!(account.claim_state, ClaimState::Idle);
        assert!(account.last_content_sync_time.is_none());

        assert!(store.get_account(AccountId::new(99)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_claim_and_cursor() {
        let store = Store::in_memory().await.unwrap();
        let id = store.upsert_account(&seed("a@example.org", 0)).await.unwrap();
        store.claim_accounts(None, 1, now()).await.unwrap();

        let mut changed = seed("a@example.org", 0);
        changed.password = "rotated".into();
        let same_id = store.upsert_account(&changed).await.unwrap();
        assert_eq!(same_id, id);

        let account = store.get_account(id).await.unwrap().unwrap();
        assert_eq!(account.password, "rotated");
        assert_eq!(account.claim_state, ClaimState::Claimed);
        assert_eq!(store.list_accounts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_without_servers_fails() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .upsert_account(&AccountSeed::with_email("x@unknown.example", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_claim_order_never_synced_first() {
        let store = Store::in_memory().await.unwrap();
        let a = store.upsert_account(&seed("a@example.org", 0)).await.unwrap();
        let b = store.upsert_account(&seed("b@example.org", 0)).await.unwrap();
        let c = store.upsert_account(&seed("c@example.org", 0)).await.unwrap();

        // a synced recently, b long ago, c never.
        store.complete_account(a, now()).await.unwrap();
        store
            .complete_account(b, now() - Duration::days(1))
            .await
            .unwrap();

        let claimed = store.claim_accounts(None, 2, now()).await.unwrap();
        let ids: Vec<AccountId> = claimed.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![c, b]);
        assert!(claimed.iter().all(|a| a.claim_state == ClaimState::Claimed));
        assert_eq!(claimed[0].claimed_at, Some(now()));

        let rest = store.claim_accounts(None, 10, now()).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, a);

        assert!(store.claim_accounts(None, 10, now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_filters_node_and_status() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_account(&seed("a@example.org", 1)).await.unwrap();
        let b = store.upsert_account(&seed("b@example.org", 2)).await.unwrap();
        let c = store.upsert_account(&seed("c@example.org", 2)).await.unwrap();
        store
            .set_account_status(c, AccountStatus::Disabled)
            .await
            .unwrap();

        let claimed = store.claim_accounts(Some(2), 10, now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, b);

        assert!(store.claim_accounts(None, 0, now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_and_fail_move_cursor() {
        let store = Store::in_memory().await.unwrap();
        let a = store.upsert_account(&seed("a@example.org", 0)).await.unwrap();
        let b = store.upsert_account(&seed("b@example.org", 0)).await.unwrap();
        store.claim_accounts(None, 2, now()).await.unwrap();

        store.complete_account(a, now()).await.unwrap();
        store.fail_account(b, now()).await.unwrap();

        let a = store.get_account(a).await.unwrap().unwrap();
        assert_eq!(a.claim_state, ClaimState::Idle);
        assert_eq!(a.claimed_at, None);
        assert_eq!(a.last_content_sync_time, Some(now()));

        let b = store.get_account(b).await.unwrap().unwrap();
        assert_eq!(b.claim_state, ClaimState::Idle);
        assert_eq!(b.last_content_sync_time, Some(now() - Duration::hours(1)));

        let missing = store.complete_account(AccountId::new(42), now()).await;
        assert!(matches!(missing, Err(Error::AccountNotFound(_))));
    }

    #[tokio::test]
    async fn test_release_stuck_claims() {
        let store = Store::in_memory().await.unwrap();
        let old = store.upsert_account(&seed("old@example.org", 0)).await.unwrap();
        store
            .claim_accounts(None, 1, now() - Duration::hours(1))
            .await
            .unwrap();
        let fresh = store.upsert_account(&seed("fresh@example.org", 0)).await.unwrap();
        store.claim_accounts(None, 1, now()).await.unwrap();

        let released = store
            .release_stuck_claims(now() - Duration::minutes(40), now())
            .await
            .unwrap();
        assert_eq!(released, 1);

        let old = store.get_account(old).await.unwrap().unwrap();
        assert_eq!(old.claim_state, ClaimState::Idle);
        assert_eq!(old.last_content_sync_time, Some(now() - Duration::hours(2)));
        let fresh = store.get_account(fresh).await.unwrap().unwrap();
        assert_eq!(fresh.claim_state, ClaimState::Claimed);
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Store::in_memory().await.unwrap();
        store.upsert_account(&seed("only@example.org", 0)).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim_accounts(None, 1, now()).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            winners += handle.await.unwrap().len();
        }
        assert_eq!(winners, 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(24))]

            #[test]
            fn every_account_has_at_most_one_owner(
                accounts in 1usize..12,
                limits in proptest::collection::vec(1usize..5, 1..8),
            ) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                let (claimed, unique) = rt.block_on(async {
                    let store = Store::in_memory().await.unwrap();
                    for i in 0..accounts {
                        store
                            .upsert_account(&seed(&format!("u{i}@example.org"), 0))
                            .await
                            .unwrap();
                    }
                    let handles: Vec<_> = limits
                        .iter()
                        .map(|&limit| {
                            let store = store.clone();
                            tokio::spawn(async move {
                                store.claim_accounts(None, limit, now()).await.unwrap()
                            })
                        })
                        .collect();
                    let mut ids = Vec::new();
                    for handle in handles {
                        ids.extend(handle.await.unwrap().into_iter().map(|a| a.id));
                    }
                    let unique: HashSet<AccountId> = ids.iter().copied().collect();
                    (ids.len(), unique.len())
                });
                prop_assert_eq!(claimed, unique);
                prop_assert_eq!(claimed, accounts.min(limits.iter().sum()));
            }
        }
    }
}
