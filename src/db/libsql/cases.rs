use async_trait::async_trait;
use libsql::{TransactionBehavior, params};

use crate::appeal::case::Case;
use crate::db::{CaseCondition, CaseFilter, CaseStore, CaseUpdate};
use crate::error::DatabaseError;

use super::{LibSqlBackend, fmt_ts, from_doc, get_text, opt_text, to_doc};

fn row_to_case(row: &libsql::Row) -> Result<Case, DatabaseError> {
    from_doc(&get_text(row, 0), "case")
}

#[async_trait]
impl CaseStore for LibSqlBackend {
    async fn find_cases(&self, filter: &CaseFilter) -> Result<Vec<Case>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT doc FROM cases \
                 WHERE (?1 IS NULL OR user_id = ?1) \
                 ORDER BY date_created DESC, id ASC",
                params![opt_text(filter.user_id.as_deref())],
            )
            .await?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            let case = row_to_case(&row)?;
            if filter.matches(&case) {
                out.push(case);
            }
        }
        Ok(out)
    }

    async fn find_case(&self, id: &str) -> Result<Option<Case>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query("SELECT doc FROM cases WHERE id = ?1 LIMIT 1", params![id])
            .await?
            .next()
            .await?;
        row.map(|row| row_to_case(&row)).transpose()
    }

    async fn insert_case(&self, case: &Case) -> Result<Case, DatabaseError> {
        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                "INSERT INTO cases (id, user_id, status, files_version, date_created, doc) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT (id) DO NOTHING",
                params![
                    case.id.as_str(),
                    case.user_id.as_str(),
                    case.status.as_str(),
                    case.files_version as i64,
                    fmt_ts(&case.date_created),
                    to_doc(case)?,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(DatabaseError::Duplicate(format!("case {}", case.id)));
        }
        Ok(case.clone())
    }

    async fn find_case_and_update(
        &self,
        id: &str,
        condition: &CaseCondition,
        update: &CaseUpdate,
    ) -> Result<Option<Case>, DatabaseError> {
        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;

        let row = tx
            .query("SELECT doc FROM cases WHERE id = ?1 LIMIT 1", params![id])
            .await?
            .next()
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let mut case = row_to_case(&row)?;
        if !condition.matches(&case) {
            tx.rollback().await?;
            return Ok(None);
        }

        update.apply(&mut case);
        tx.execute(
            "UPDATE cases SET status = ?2, files_version = ?3, doc = ?4 WHERE id = ?1",
            params![
                id,
                case.status.as_str(),
                case.files_version as i64,
                to_doc(&case)?,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(Some(case))
    }

    async fn find_case_and_delete(&self, id: &str) -> Result<Option<Case>, DatabaseError> {
        let conn = self.connect().await?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await?;
        let row = tx
            .query("SELECT doc FROM cases WHERE id = ?1 LIMIT 1", params![id])
            .await?
            .next()
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let case = row_to_case(&row)?;
        tx.execute("DELETE FROM cases WHERE id = ?1", params![id])
            .await?;
        tx.commit().await?;
        Ok(Some(case))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::appeal::case::{Case, CaseStatus, FileRef};
    use crate::db::libsql::test_backend;
    use crate::db::{CaseCondition, CaseFilter, CaseSet, CaseStore, CaseUpdate};
    use crate::error::DatabaseError;
    use crate::services::DenialFacts;

    fn facts(description: &str) -> DenialFacts {
        DenialFacts {
            brief_description: description.to_string(),
            denial_date: Some("2026-01-15".to_string()),
            procedure_name: None,
        }
    }

    fn inline_file(name: &str) -> FileRef {
        FileRef {
            name: name.to_string(),
            size: 3,
            content_type: "application/pdf".to_string(),
            last_modified: None,
            bucket: None,
            path: None,
            data: Some(vec![1, 2, 3]),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let (db, _dir) = test_backend().await;
        db.insert_case(&Case::new("c1", "u1")).await.expect("insert");
        let err = db
            .insert_case(&Case::new("c1", "u2"))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, DatabaseError::Duplicate(_)));
    }

    #[tokio::test]
    async fn conditional_update_respects_files_version() {
        let (db, _dir) = test_backend().await;
        db.insert_case(&Case::new("c1", "u1")).await.expect("insert");

        let uploaded = db
            .find_case_and_update(
                "c1",
                &CaseCondition::any(),
                &CaseUpdate::new()
                    .push_files([inline_file("a.pdf")])
                    .invalidate_cache()
                    .set(CaseSet::Status(CaseStatus::Analyzing)),
            )
            .await
            .expect("update")
            .expect("exists");
        assert_eq!(uploaded.files_version, 1);

        let stale = db
            .find_case_and_update(
                "c1",
                &CaseCondition::files_version(0),
                &CaseUpdate::new().set(CaseSet::DenialFacts(facts("old"))),
            )
            .await
            .expect("update");
        assert!(stale.is_none());

        let fresh = db
            .find_case_and_update(
                "c1",
                &CaseCondition::files_version(1),
                &CaseUpdate::new().set(CaseSet::DenialFacts(facts("new"))),
            )
            .await
            .expect("update")
            .expect("applied");
        assert_eq!(fresh.denial_reason_title.as_deref(), Some("new"));
        assert_eq!(fresh.denial_facts, Some(facts("new")));
        assert_eq!(fresh.denial_files[0].data.as_deref(), Some(&[1u8, 2, 3][..]));
    }

    #[tokio::test]
    async fn update_after_delete_is_a_no_op() {
        let (db, _dir) = test_backend().await;
        db.insert_case(&Case::new("c1", "u1")).await.expect("insert");
        assert!(db.find_case_and_delete("c1").await.expect("delete").is_some());
        let outcome = db
            .find_case_and_update(
                "c1",
                &CaseCondition::any(),
                &CaseUpdate::new().set(CaseSet::HasNewEmail(true)),
            )
            .await
            .expect("update");
        assert!(outcome.is_none());
        assert!(db.find_case("c1").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn concurrent_updates_serialize() {
        let (db, _dir) = test_backend().await;
        let db = Arc::new(db);
        db.insert_case(&Case::new("c1", "u1")).await.expect("insert");

        let mut handles = Vec::new();
        for i in 0..8 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.find_case_and_update(
                    "c1",
                    &CaseCondition::any(),
                    &CaseUpdate::new().push_files([inline_file(&format!("{i}.pdf"))]),
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("update");
        }
        let case = db.find_case("c1").await.expect("find").expect("exists");
        assert_eq!(case.denial_files.len(), 8);
        assert_eq!(case.files_version, 8);
    }

    #[tokio::test]
    async fn find_cases_filters_by_user_and_status() {
        let (db, _dir) = test_backend().await;
        db.insert_case(&Case::new("c1", "u1")).await.expect("insert");
        db.insert_case(&Case::new("c2", "u2")).await.expect("insert");
        db.find_case_and_update(
            "c1",
            &CaseCondition::any(),
            &CaseUpdate::new().set(CaseSet::Status(CaseStatus::AwaitingReply)),
        )
        .await
        .expect("update");

        let mine = db
            .find_cases(&CaseFilter::for_user("u1"))
            .await
            .expect("find");
        assert_eq!(mine.len(), 1);
        let waiting = db
            .find_cases(&CaseFilter::default().with_statuses(&[CaseStatus::AwaitingReply]))
            .await
            .expect("find");
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, "c1");
    }
}
