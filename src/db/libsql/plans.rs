use async_trait::async_trait;
use libsql::params;

use crate::appeal::case::{InsurancePlan, UserRecord};
use crate::db::{PlanStore, UserStore};
use crate::error::DatabaseError;

use super::{LibSqlBackend, fmt_ts, from_doc, get_text, to_doc};

fn row_to_plan(row: &libsql::Row) -> Result<InsurancePlan, DatabaseError> {
    from_doc(&get_text(row, 0), "plan")
}

fn row_to_user(row: &libsql::Row) -> Result<UserRecord, DatabaseError> {
    from_doc(&get_text(row, 0), "user")
}

#[async_trait]
impl PlanStore for LibSqlBackend {
    async fn insert_plan(&self, plan: &InsurancePlan) -> Result<InsurancePlan, DatabaseError> {
        let conn = self.connect().await?;
        let inserted = conn
            .execute(
                "INSERT INTO plans (id, user_id, date_added, doc) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (id) DO NOTHING",
                params![
                    plan.id.as_str(),
                    plan.user_id.as_str(),
                    fmt_ts(&plan.date_added),
                    to_doc(plan)?,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(DatabaseError::Duplicate(format!("plan {}", plan.id)));
        }
        Ok(plan.clone())
    }

    async fn list_plans(&self, user_id: &str) -> Result<Vec<InsurancePlan>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT doc FROM plans WHERE user_id = ?1 ORDER BY date_added DESC",
                params![user_id],
            )
            .await?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().await? {
            out.push(row_to_plan(&row)?);
        }
        Ok(out)
    }

    async fn get_plan(&self, id: &str) -> Result<Option<InsurancePlan>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query("SELECT doc FROM plans WHERE id = ?1 LIMIT 1", params![id])
            .await?
            .next()
            .await?;
        row.map(|row| row_to_plan(&row)).transpose()
    }

    async fn replace_plan(
        &self,
        plan: &InsurancePlan,
    ) -> Result<Option<InsurancePlan>, DatabaseError> {
        let conn = self.connect().await?;
        let updated = conn
            .execute(
                "UPDATE plans SET user_id = ?2, doc = ?3 WHERE id = ?1",
                params![plan.id.as_str(), plan.user_id.as_str(), to_doc(plan)?],
            )
            .await?;
        Ok((updated > 0).then(|| plan.clone()))
    }

    async fn delete_plan(&self, id: &str) -> Result<bool, DatabaseError> {
        let conn = self.connect().await?;
        let deleted = conn
            .execute("DELETE FROM plans WHERE id = ?1", params![id])
            .await?;
        Ok(deleted > 0)
    }
}

#[async_trait]
impl UserStore for LibSqlBackend {
    async fn upsert_user(&self, user: &UserRecord) -> Result<UserRecord, DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            "INSERT INTO users (id, email, doc) VALUES (?1, ?2, ?3) \
             ON CONFLICT (id) DO UPDATE SET email = excluded.email, doc = excluded.doc",
            params![
                user.id.as_str(),
                user.email.trim().to_ascii_lowercase(),
                to_doc(user)?,
            ],
        )
        .await?;
        Ok(user.clone())
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query("SELECT doc FROM users WHERE id = ?1 LIMIT 1", params![id])
            .await?
            .next()
            .await?;
        row.map(|row| row_to_user(&row)).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, DatabaseError> {
        let conn = self.connect().await?;
        let row = conn
            .query(
                "SELECT doc FROM users WHERE email = ?1 LIMIT 1",
                params![email.trim().to_ascii_lowercase()],
            )
            .await?
            .next()
            .await?;
        row.map(|row| row_to_user(&row)).transpose()
    }
}
