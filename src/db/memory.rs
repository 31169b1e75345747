//! In-process backend. Every mutation runs under the write lock of the
//! affected map, which makes `find_case_and_update` atomic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::appeal::case::{Case, InsurancePlan, UserRecord};
use crate::db::{
    CaseCondition, CaseFilter, CaseStore, CaseUpdate, Database, EmailRecord, EmailStore,
    PlanStore, UserStore,
};
use crate::error::DatabaseError;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    cases: RwLock<HashMap<String, Case>>,
    // Insertion order matters for "earliest linked record in thread".
    emails: RwLock<Vec<EmailRecord>>,
    plans: RwLock<HashMap<String, InsurancePlan>>,
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaseStore for MemoryBackend {
    async fn find_cases(&self, filter: &CaseFilter) -> Result<Vec<Case>, DatabaseError> {
        let cases = self.cases.read().await;
        let mut out: Vec<Case> = cases.values().filter(|c| filter.matches(c)).cloned().collect();
        out.sort_by(|a, b| b.date_created.cmp(&a.date_created).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn find_case(&self, id: &str) -> Result<Option<Case>, DatabaseError> {
        Ok(self.cases.read().await.get(id).cloned())
    }

    async fn insert_case(&self, case: &Case) -> Result<Case, DatabaseError> {
        let mut cases = self.cases.write().await;
        if cases.contains_key(&case.id) {
            return Err(DatabaseError::Duplicate(format!("case {}", case.id)));
        }
        cases.insert(case.id.clone(), case.clone());
        Ok(case.clone())
    }

    async fn find_case_and_update(
        &self,
        id: &str,
        condition: &CaseCondition,
        update: &CaseUpdate,
    ) -> Result<Option<Case>, DatabaseError> {
        let mut cases = self.cases.write().await;
        let Some(case) = cases.get_mut(id) else {
            return Ok(None);
        };
        if !condition.matches(case) {
            return Ok(None);
        }
        update.apply(case);
        Ok(Some(case.clone()))
    }

    async fn find_case_and_delete(&self, id: &str) -> Result<Option<Case>, DatabaseError> {
        Ok(self.cases.write().await.remove(id))
    }
}

#[async_trait]
impl EmailStore for MemoryBackend {
    async fn insert_email(&self, record: &EmailRecord) -> Result<bool, DatabaseError> {
        let mut emails = self.emails.write().await;
        if emails.iter().any(|e| e.message_id == record.message_id) {
            return Ok(false);
        }
        emails.push(record.clone());
        Ok(true)
    }

    async fn find_email(&self, message_id: &str) -> Result<Option<EmailRecord>, DatabaseError> {
        Ok(self
            .emails
            .read()
            .await
            .iter()
            .find(|e| e.message_id == message_id)
            .cloned())
    }

    async fn find_linked_email_in_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError> {
        Ok(self
            .emails
            .read()
            .await
            .iter()
            .find(|e| e.thread_id == thread_id && e.case_id.is_some())
            .cloned())
    }
}

#[async_trait]
impl PlanStore for MemoryBackend {
    async fn insert_plan(&self, plan: &InsurancePlan) -> Result<InsurancePlan, DatabaseError> {
        let mut plans = self.plans.write().await;
        if plans.contains_key(&plan.id) {
            return Err(DatabaseError::Duplicate(format!("plan {}", plan.id)));
        }
        plans.insert(plan.id.clone(), plan.clone());
        Ok(plan.clone())
    }

    async fn list_plans(&self, user_id: &str) -> Result<Vec<InsurancePlan>, DatabaseError> {
        let plans = self.plans.read().await;
        let mut out: Vec<InsurancePlan> = plans
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.date_added.cmp(&a.date_added));
        Ok(out)
    }

    async fn get_plan(&self, id: &str) -> Result<Option<InsurancePlan>, DatabaseError> {
        Ok(self.plans.read().await.get(id).cloned())
    }

    async fn replace_plan(
        &self,
        plan: &InsurancePlan,
    ) -> Result<Option<InsurancePlan>, DatabaseError> {
        let mut plans = self.plans.write().await;
        match plans.get_mut(&plan.id) {
            Some(existing) => {
                *existing = plan.clone();
                Ok(Some(plan.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete_plan(&self, id: &str) -> Result<bool, DatabaseError> {
        Ok(self.plans.write().await.remove(id).is_some())
    }
}

#[async_trait]
impl UserStore for MemoryBackend {
    async fn upsert_user(&self, user: &UserRecord) -> Result<UserRecord, DatabaseError> {
        self.users
            .write()
            .await
            .insert(user.id.clone(), user.clone());
        Ok(user.clone())
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, DatabaseError> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, DatabaseError> {
        Ok(self
            .users
            .read()
            .await
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email.trim()))
            .cloned())
    }
}

#[async_trait]
impl Database for MemoryBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::appeal::case::{CaseStatus, EmailMessage, MessageDirection};
    use crate::db::CaseSet;

    fn message(id: &str) -> EmailMessage {
        EmailMessage {
            id: id.to_string(),
            from: "claims@insurer.example".to_string(),
            to: "me@example.com".to_string(),
            subject: "Re: appeal".to_string(),
            body: "body".to_string(),
            date: Utc::now(),
            direction: MessageDirection::Received,
            thread_id: Some("t1".to_string()),
            message_id_header: None,
            analysis: None,
        }
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let db = Arc::new(MemoryBackend::new());
        db.insert_case(&Case::new("c1", "u1")).await.expect("insert");

        let mut handles = Vec::new();
        for i in 0..20 {
            let db = Arc::clone(&db);
            handles.push(tokio::spawn(async move {
                db.find_case_and_update(
                    "c1",
                    &CaseCondition::any(),
                    &CaseUpdate::new().push_message(message(&format!("m{i}"))),
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("update");
        }

        let case = db.find_case("c1").await.expect("find").expect("exists");
        assert_eq!(case.email_thread.len(), 20);
    }

    #[tokio::test]
    async fn failed_condition_leaves_document_untouched() {
        let db = MemoryBackend::new();
        db.insert_case(&Case::new("c1", "u1")).await.expect("insert");

        let outcome = db
            .find_case_and_update(
                "c1",
                &CaseCondition::files_version(7),
                &CaseUpdate::new().set(CaseSet::Status(CaseStatus::ReadyToSend)),
            )
            .await
            .expect("update");
        assert!(outcome.is_none());
        let case = db.find_case("c1").await.expect("find").expect("exists");
        assert_eq!(case.status, CaseStatus::Uploading);
    }

    #[tokio::test]
    async fn duplicate_email_insert_is_reported() {
        let db = MemoryBackend::new();
        let record = EmailRecord {
            message_id: "m1".to_string(),
            thread_id: "t1".to_string(),
            message_id_header: None,
            from: "a@example.com".to_string(),
            to: "b@example.com".to_string(),
            subject: "s".to_string(),
            body: "b".to_string(),
            internal_date: Utc::now(),
            case_id: None,
            label_ids: Vec::new(),
            analysis: None,
        };
        assert!(db.insert_email(&record).await.expect("first"));
        assert!(!db.insert_email(&record).await.expect("second"));
        assert!(db.find_linked_email_in_thread("t1").await.expect("q").is_none());
    }
}
