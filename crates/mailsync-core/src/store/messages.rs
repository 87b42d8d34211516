//! Message rows and their status transitions.
//!
//! Status changes always name the state they leave (`WHERE status = …`), so
//! a message that reached a terminal state is never touched again.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, info, warn};

use super::{Store, parse_timestamp, timestamp};
use crate::AccountId;
use crate::Result;
use crate::message::{
    AttachmentRecord, FetchedContent, MessageId, MessageRecord, MessageStatus, MessageSummary,
    StatusCounts, StoredContent,
};

const MESSAGE_COLUMNS: &str =
    "id, account_id, uid, subject, from_addr, date, has_attachment, status, updated_at";

impl Store {
    /// Inserts newly listed messages as pending, skipping UIDs already known,
    /// and advances the account's list cursor in the same transaction.
    ///
    /// Returns the number of rows actually inserted.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is written then.
    pub async fn insert_new_messages(
        &self,
        account_id: AccountId,
        messages: &[MessageSummary],
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for message in messages {
            let result = sqlx::query(
                r"
                INSERT INTO messages (
                    account_id, uid, subject, from_addr, date, has_attachment, status, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(account_id, uid) DO NOTHING
                ",
            )
            .bind(account_id.0)
            .bind(i64::from(message.uid))
            .bind(&message.subject)
            .bind(&message.from)
            .bind(message.date.map(timestamp))
            .bind(message.has_attachment)
            .bind(MessageStatus::Pending.code())
            .bind(timestamp(now))
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        sqlx::query("UPDATE accounts SET last_list_sync_time = ? WHERE id = ?")
            .bind(timestamp(now))
            .bind(account_id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(account = %account_id, listed = messages.len(), inserted, "list batch persisted");
        Ok(inserted)
    }

    /// Highest UID stored for the account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub async fn last_known_uid(&self, account_id: AccountId) -> Result<Option<u32>> {
        let row = sqlx::query("SELECT MAX(uid) AS uid FROM messages WHERE account_id = ?")
            .bind(account_id.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("uid").map(|uid| uid as u32))
    }

    /// Claims up to `limit` pending messages of the account, lowest UID first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn claim_pending_messages(
        &self,
        account_id: AccountId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            r"
            UPDATE messages
            SET status = ?, updated_at = ?
            WHERE status = ? AND id IN (
                SELECT id FROM messages
                WHERE account_id = ? AND status = ?
                ORDER BY uid
                LIMIT ?
            )
            RETURNING {MESSAGE_COLUMNS}
            "
        ))
        .bind(MessageStatus::Claimed.code())
        .bind(timestamp(now))
        .bind(MessageStatus::Pending.code())
        .bind(account_id.0)
        .bind(MessageStatus::Pending.code())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<MessageRecord> = rows.iter().map(row_to_message).collect();
        messages.sort_by_key(|m| m.uid);
        Ok(messages)
    }

    /// Stores the contents and attachments of a batch and marks each message
    /// done, all in one transaction.
    ///
    /// An attachment row that fails to insert is logged and skipped. Messages
    /// that are no longer claimed are left untouched. Returns the number of
    /// messages marked done.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails; nothing is written then.
    pub async fn save_contents(
        &self,
        contents: &[FetchedContent],
        now: DateTime<Utc>,
    ) -> Result<u64> {
        if contents.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut done = 0;

        for content in contents {
            let updated = sqlx::query(
                "UPDATE messages SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(MessageStatus::Done.code())
            .bind(timestamp(now))
            .bind(content.message_id.0)
            .bind(MessageStatus::Claimed.code())
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                warn!(message = %content.message_id, "message no longer claimed, content dropped");
                continue;
            }
            done += 1;

            sqlx::query(
                r"
                INSERT INTO message_contents (message_id, body, html_body, created_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(message_id) DO NOTHING
                ",
            )
            .bind(content.message_id.0)
            .bind(&content.body)
            .bind(&content.html_body)
            .bind(timestamp(now))
            .execute(&mut *tx)
            .await?;

            for attachment in &content.attachments {
                let inserted = sqlx::query(
                    r"
                    INSERT INTO attachments (message_id, filename, size, mime_type, storage_url)
                    VALUES (?, ?, ?, ?, ?)
                    ",
                )
                .bind(content.message_id.0)
                .bind(&attachment.filename)
                .bind(i64::try_from(attachment.size).unwrap_or(i64::MAX))
                .bind(&attachment.mime_type)
                .bind(attachment.storage_url.as_deref())
                .execute(&mut *tx)
                .await;
                if let Err(e) = inserted {
                    warn!(
                        message = %content.message_id,
                        filename = %attachment.filename,
                        error = %e,
                        "attachment row skipped"
                    );
                }
            }
        }

        tx.commit().await?;
        Ok(done)
    }

    /// Moves a claimed message to `status`. Returns false if the message was
    /// not claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn mark_message(
        &self,
        id: MessageId,
        status: MessageStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(status.code())
        .bind(timestamp(now))
        .bind(id.0)
        .bind(MessageStatus::Claimed.code())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Returns claimed messages to pending, for work a content phase did not
    /// get to. Returns the number of messages re-queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    pub async fn requeue_messages(&self, ids: &[MessageId], now: DateTime<Utc>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut requeued = 0;
        for id in ids {
            let result = sqlx::query(
                "UPDATE messages SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(MessageStatus::Pending.code())
            .bind(timestamp(now))
            .bind(id.0)
            .bind(MessageStatus::Claimed.code())
            .execute(&mut *tx)
            .await?;
            requeued += result.rows_affected();
        }
        tx.commit().await?;
        Ok(requeued)
    }

    /// Returns every message the account has claimed to pending, for a
    /// worker that was cut off before it could do so itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn requeue_claimed_messages(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET status = ?, updated_at = ? WHERE account_id = ? AND status = ?",
        )
        .bind(MessageStatus::Pending.code())
        .bind(timestamp(now))
        .bind(account_id.0)
        .bind(MessageStatus::Claimed.code())
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            warn!(account = %account_id, requeued, "claimed messages returned to pending");
        }
        Ok(requeued)
    }

    /// Returns messages claimed before `claimed_before` to pending, for
    /// workers that died mid-batch. Returns the number released.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn release_stuck_messages(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE messages SET status = ?, updated_at = ? WHERE status = ? AND updated_at < ?",
        )
        .bind(MessageStatus::Pending.code())
        .bind(timestamp(now))
        .bind(MessageStatus::Claimed.code())
        .bind(timestamp(claimed_before))
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!(released, "released stuck message claims");
        }
        Ok(released)
    }

    /// Looks up a message by its fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get_message(
        &self,
        account_id: AccountId,
        uid: u32,
    ) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ? AND uid = ?"
        ))
        .bind(account_id.0)
        .bind(i64::from(uid))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_message))
    }

    /// All messages of an account ordered by UID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list_messages(&self, account_id: AccountId) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE account_id = ? ORDER BY uid"
        ))
        .bind(account_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Message counts per status for an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    #[allow(clippy::cast_sign_loss)]
    pub async fn status_counts(&self, account_id: AccountId) -> Result<StatusCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM messages WHERE account_id = ? GROUP BY status",
        )
        .bind(account_id.0)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in &rows {
            let n = row.get::<i64, _>("n") as u64;
            match MessageStatus::from_code(row.get("status")) {
                Some(MessageStatus::Pending) => counts.pending = n,
                Some(MessageStatus::Claimed) => counts.claimed = n,
                Some(MessageStatus::Done) => counts.done = n,
                Some(MessageStatus::PermanentFailure) => counts.failed = n,
                Some(MessageStatus::Deleted) => counts.deleted = n,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Stored content and attachments of a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    #[allow(clippy::cast_sign_loss)]
    pub async fn get_content(&self, id: MessageId) -> Result<Option<StoredContent>> {
        let Some(row) =
            sqlx::query("SELECT body, html_body FROM message_contents WHERE message_id = ?")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?
        else {
            return Ok(None);
        };

        let attachments = sqlx::query(
            r"
            SELECT filename, size, mime_type, storage_url
            FROM attachments
            WHERE message_id = ?
            ORDER BY id
            ",
        )
        .bind(id.0)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| AttachmentRecord {
            filename: row.get("filename"),
            size: row.get::<i64, _>("size") as u64,
            mime_type: row.get("mime_type"),
            storage_url: row.get("storage_url"),
        })
        .collect();

        Ok(Some(StoredContent {
            body: row.get("body"),
            html_body: row.get("html_body"),
            attachments,
        }))
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn row_to_message(row: &SqliteRow) -> MessageRecord {
    MessageRecord {
        id: MessageId(row.get("id")),
        account_id: AccountId::new(row.get("account_id")),
        uid: row.get::<i64, _>("uid") as u32,
        subject: row.get("subject"),
        from: row.get("from_addr"),
        date: parse_timestamp(row.get("date")),
        has_attachment: row.get::<i64, _>("has_attachment") != 0,
        status: MessageStatus::from_code(row.get("status"))
            .unwrap_or(MessageStatus::PermanentFailure),
        updated_at: parse_timestamp(row.get("updated_at")).unwrap_or_default(),
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
    use crate::account::{AccountSeed, ImapConfig, Security, SmtpConfig};
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn store_with_account() -> (Store, AccountId) {
        let store = Store::in_memory().await.unwrap();
        let seed = AccountSeed {
            imap: Some(ImapConfig {
                host: "imap.example.org".into(),
                port: 993,
                security: Security::Tls,
            }),
            smtp: Some(SmtpConfig {
                host: "smtp.example.org".into(),
                port: 587,
                security: Security::StartTls,
            }),
            ..AccountSeed::with_email("a@example.org", "pw")
        };
        let id = store.upsert_account(&seed).await.unwrap();
        (store, id)
    }

    fn summary(uid: u32) -> MessageSummary {
        MessageSummary {
            uid,
            subject: format!("message {uid}"),
            from: "sender@example.org".into(),
            date: Some(now() - Duration::days(1)),
            has_attachment: uid % 2 == 0,
            size: 100,
        }
    }

    fn content(id: MessageId) -> FetchedContent {
        FetchedContent {
            message_id: id,
            body: "hello".into(),
            html_body: "<p>hello</p>".into(),
            attachments: vec![AttachmentRecord {
                filename: "a.pdf".into(),
                size: 3,
                mime_type: "application/pdf".into(),
                storage_url: Some("file:///tmp/a.pdf".into()),
            }],
        }
    }

    #[tokio::test]
    async fn test_listing_is_idempotent() {
        let (store, account) = store_with_account().await;
        let batch = vec![summary(101), summary(102), summary(103)];

        assert_eq!(store.insert_new_messages(account, &batch, now()).await.unwrap(), 3);
        assert_eq!(store.insert_new_messages(account, &batch, now()).await.unwrap(), 0);

        let messages = store.list_messages(account).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.status == MessageStatus::Pending));
        assert!(messages[1].has_attachment);
        assert_eq!(store.last_known_uid(account).await.unwrap(), Some(103));

        let account = store.get_account(account).await.unwrap().unwrap();
        assert_eq!(account.last_list_sync_time, Some(now()));
    }

    #[tokio::test]
    async fn test_last_known_uid_empty() {
        let (store, account) = store_with_account().await;
        assert_eq!(store.last_known_uid(account).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claim_lowest_uids_first() {
        let (store, account) = store_with_account().await;
        let batch = vec![summary(103), summary(101), summary(102)];
        store.insert_new_messages(account, &batch, now()).await.unwrap();

        let claimed = store.claim_pending_messages(account, 2, now()).await.unwrap();
        let uids: Vec<u32> = claimed.iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![101, 102]);
        assert!(claimed.iter().all(|m| m.status == MessageStatus::Claimed));

        let again = store.claim_pending_messages(account, 5, now()).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].uid, 103);
    }

    #[tokio::test]
    async fn test_save_contents_marks_done() {
        let (store, account) = store_with_account().await;
        store
            .insert_new_messages(account, &[summary(1), summary(2)], now())
            .await
            .unwrap();
        let claimed = store.claim_pending_messages(account, 2, now()).await.unwrap();

        let done = store
            .save_contents(&[content(claimed[0].id)], now())
            .await
            .unwrap();
        assert_eq!(done, 1);

        let stored = store.get_content(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(stored.body, "hello");
        assert_eq!(stored.attachments.len(), 1);
        assert_eq!(stored.attachments[0].mime_type, "application/pdf");
        assert!(store.get_content(claimed[1].id).await.unwrap().is_none());

        let first = store.get_message(account, 1).await.unwrap().unwrap();
        assert_eq!(first.status, MessageStatus::Done);
    }

    #[tokio::test]
    async fn test_done_is_final() {
        let (store, account) = store_with_account().await;
        store
            .insert_new_messages(account, &[summary(1)], now())
            .await
            .unwrap();
        let claimed = store.claim_pending_messages(account, 1, now()).await.unwrap();
        let id = claimed[0].id;
        store.save_contents(&[content(id)], now()).await.unwrap();

        assert!(!store
            .mark_message(id, MessageStatus::PermanentFailure, now())
            .await
            .unwrap());
        assert_eq!(store.requeue_messages(&[id], now()).await.unwrap(), 0);
        assert_eq!(store.save_contents(&[content(id)], now()).await.unwrap(), 0);
        store
            .release_stuck_messages(now() + Duration::days(1), now())
            .await
            .unwrap();

        let message = store.get_message(account, 1).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Done);
        let stored = store.get_content(id).await.unwrap().unwrap();
        assert_eq!(stored.attachments.len(), 1);
    }

    #[tokio::test]
    async fn test_mark_and_requeue() {
        let (store, account) = store_with_account().await;
        store
            .insert_new_messages(account, &[summary(1), summary(2), summary(3)], now())
            .await
            .unwrap();
        let claimed = store.claim_pending_messages(account, 3, now()).await.unwrap();

        assert!(store
            .mark_message(claimed[0].id, MessageStatus::Deleted, now())
            .await
            .unwrap());
        let requeued = store
            .requeue_messages(&[claimed[1].id, claimed[2].id], now())
            .await
            .unwrap();
        assert_eq!(requeued, 2);

        let counts = store.status_counts(account).await.unwrap();
        assert_eq!(counts.deleted, 1);
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test]
    async fn test_release_stuck_messages() {
        let (store, account) = store_with_account().await;
        store
            .insert_new_messages(account, &[summary(1), summary(2)], now())
            .await
            .unwrap();
        store
            .claim_pending_messages(account, 1, now() - Duration::hours(2))
            .await
            .unwrap();
        store.claim_pending_messages(account, 1, now()).await.unwrap();

        let released = store
            .release_stuck_messages(now() - Duration::minutes(40), now())
            .await
            .unwrap();
        assert_eq!(released, 1);

        let counts = store.status_counts(account).await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.claimed, 1);
    }

    #[tokio::test]
    async fn test_requeue_claimed_messages_keeps_finished_ones() {
        let (store, account) = store_with_account().await;
        store
            .insert_new_messages(account, &[summary(1), summary(2), summary(3)], now())
            .await
            .unwrap();
        let claimed = store.claim_pending_messages(account, 3, now()).await.unwrap();
        store
            .save_contents(&[content(claimed[0].id)], now())
            .await
            .unwrap();

        let requeued = store.requeue_claimed_messages(account, now()).await.unwrap();
        assert_eq!(requeued, 2);

        let counts = store.status_counts(account).await.unwrap();
        assert_eq!(counts.done, 1);
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.claimed, 0);
    }
}
