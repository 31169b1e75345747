use async_trait::async_trait;
use libsql::params;

use crate::db::{EmailRecord, EmailStore};
use crate::error::DatabaseError;

use super::{LibSqlBackend, fmt_ts, from_doc, get_text, opt_text, to_doc};

fn row_to_email(row: &libsql::Row) -> Result<EmailRecord, DatabaseError> {
    from_doc(&get_text(row, 0), "email")
}

#[async_trait]
impl EmailStore for LibSqlBackend {
    async fn insert_email(&self, record: &EmailRecord) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                "INSERT INTO emails (message_id, thread_id, case_id, internal_date, doc) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (message_id) DO NOTHING",
                params![
                    record.message_id.as_str(),
                    record.thread_id.as_str(),
                    opt_text(record.case_id.as_deref()),
                    fmt_ts(&record.internal_date),
                    to_doc(record)?,
                ],
            )
            .await?;
        Ok(inserted > 0)
    }

    async fn find_email(&self, message_id: &str) -> Result<Option<EmailRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT doc FROM emails WHERE message_id = ?1 LIMIT 1",
                params![message_id],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_email(&row)).transpose()
    }

    async fn find_linked_email_in_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT doc FROM emails \
                 WHERE thread_id = ?1 AND case_id IS NOT NULL \
                 ORDER BY rowid ASC LIMIT 1",
                params![thread_id],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_email(&row)).transpose()
    }
}
