//! Insurance plans and user records.
//!
//! Plans are owned by users and only referenced by cases, so deleting one
//! never touches a case; the letter composer falls back to placeholders.

use std::sync::Arc;

use chrono::Utc;

use crate::appeal::case::{CoveredPerson, FileRef, InsurancePlan, PolicyType, UserRecord};
use crate::appeal::policy;
use crate::db::Database;
use crate::error::CaseError;
use crate::services::{DocumentExtractor, FileStorage, PlanFacts, stage_documents};

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub user_id: String,
    pub insurance_company: String,
    pub plan_name: String,
    pub policy_number: String,
    pub group_number: Option<String>,
    pub policy_type: PolicyType,
    pub policy_files: Vec<FileRef>,
    pub covered_individuals: Vec<CoveredPerson>,
}

/// Partial plan update; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct PlanChanges {
    pub insurance_company: Option<String>,
    pub plan_name: Option<String>,
    pub policy_number: Option<String>,
    pub group_number: Option<Option<String>>,
    pub policy_type: Option<PolicyType>,
    pub policy_files: Option<Vec<FileRef>>,
    pub covered_individuals: Option<Vec<CoveredPerson>>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: Option<String>,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

pub struct PlanService {
    db: Arc<dyn Database>,
    extractor: Arc<dyn DocumentExtractor>,
    storage: Arc<dyn FileStorage>,
}

fn required(value: &str, field: &str) -> Result<String, CaseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CaseError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Covered people get stable ids so cases can reference them.
fn with_person_ids(people: Vec<CoveredPerson>) -> Result<Vec<CoveredPerson>, CaseError> {
    people
        .into_iter()
        .map(|mut person| {
            person.name = required(&person.name, "covered person name")?;
            if person.id.trim().is_empty() {
                person.id = uuid::Uuid::new_v4().simple().to_string();
            }
            Ok(person)
        })
        .collect()
}

impl PlanService {
    pub fn new(
        db: Arc<dyn Database>,
        extractor: Arc<dyn DocumentExtractor>,
        storage: Arc<dyn FileStorage>,
    ) -> Self {
        Self {
            db,
            extractor,
            storage,
        }
    }

    pub async fn create_plan(&self, new: NewPlan) -> Result<InsurancePlan, CaseError> {
        let plan = InsurancePlan {
            id: uuid::Uuid::new_v4().simple().to_string(),
            user_id: required(&new.user_id, "userId")?,
            insurance_company: required(&new.insurance_company, "insuranceCompany")?,
            plan_name: required(&new.plan_name, "planName")?,
            policy_number: required(&new.policy_number, "policyNumber")?,
            group_number: new.group_number.filter(|g| !g.trim().is_empty()),
            policy_type: new.policy_type,
            policy_files: new.policy_files,
            covered_individuals: with_person_ids(new.covered_individuals)?,
            date_added: Utc::now(),
        };
        let plan = self.db.insert_plan(&plan).await?;
        tracing::info!(plan_id = %plan.id, user_id = %plan.user_id, "Insurance plan created");
        Ok(plan)
    }

    pub async fn list_plans(&self, user_id: &str) -> Result<Vec<InsurancePlan>, CaseError> {
        Ok(self.db.list_plans(user_id).await?)
    }

    pub async fn get_plan(&self, plan_id: &str) -> Result<InsurancePlan, CaseError> {
        self.db
            .get_plan(plan_id)
            .await?
            .ok_or_else(|| CaseError::plan_not_found(plan_id))
    }

    pub async fn update_plan(
        &self,
        plan_id: &str,
        changes: PlanChanges,
    ) -> Result<InsurancePlan, CaseError> {
        let mut plan = self.get_plan(plan_id).await?;
        if let Some(company) = changes.insurance_company {
            plan.insurance_company = required(&company, "insuranceCompany")?;
        }
        if let Some(name) = changes.plan_name {
            plan.plan_name = required(&name, "planName")?;
        }
        if let Some(number) = changes.policy_number {
            plan.policy_number = required(&number, "policyNumber")?;
        }
        if let Some(group) = changes.group_number {
            plan.group_number = group.filter(|g| !g.trim().is_empty());
        }
        if let Some(policy_type) = changes.policy_type {
            plan.policy_type = policy_type;
        }
        if let Some(files) = changes.policy_files {
            plan.policy_files = files;
        }
        if let Some(people) = changes.covered_individuals {
            plan.covered_individuals = with_person_ids(people)?;
        }
        self.db
            .replace_plan(&plan)
            .await?
            .ok_or_else(|| CaseError::plan_not_found(plan_id))
    }

    pub async fn delete_plan(&self, plan_id: &str) -> Result<(), CaseError> {
        if !self.db.delete_plan(plan_id).await? {
            return Err(CaseError::plan_not_found(plan_id));
        }
        tracing::info!(plan_id, "Insurance plan deleted");
        Ok(())
    }

    /// Read plan facts from policy documents.
    pub async fn extract_plan_info(&self, files: &[FileRef]) -> Result<PlanFacts, CaseError> {
        if files.is_empty() {
            return Err(CaseError::InvalidInput("no files supplied".to_string()));
        }
        let staged = stage_documents(self.storage.as_ref(), files)
            .await
            .map_err(|e| CaseError::ExtractionFailed(e.to_string()))?;
        self.extractor
            .extract_plan(&staged)
            .await
            .map_err(|e| CaseError::ExtractionFailed(e.to_string()))
    }

    // ==================== Users ====================

    pub async fn create_user(&self, new: NewUser) -> Result<UserRecord, CaseError> {
        let email = policy::bare_address(&new.email);
        if !policy::looks_like_address(&email) {
            return Err(CaseError::InvalidInput(format!(
                "'{}' is not an email address",
                new.email
            )));
        }
        let id = match new.id.map(|id| id.trim().to_string()) {
            Some(id) if !id.is_empty() => id,
            _ => uuid::Uuid::new_v4().simple().to_string(),
        };
        let user = UserRecord {
            id,
            email,
            first_name: new.first_name.filter(|n| !n.trim().is_empty()),
            last_name: new.last_name.filter(|n| !n.trim().is_empty()),
        };
        let user = self.db.upsert_user(&user).await?;
        tracing::info!(user_id = %user.id, "User saved");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<UserRecord, CaseError> {
        self.db
            .get_user(user_id)
            .await?
            .ok_or_else(|| CaseError::NotFound {
                kind: "user",
                id: user_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::appeal::case::Relationship;
    use crate::testing::{Harness, inline_file};

    fn new_plan(user: &str) -> NewPlan {
        NewPlan {
            user_id: user.to_string(),
            insurance_company: "Acme Health".to_string(),
            plan_name: "Gold PPO".to_string(),
            policy_number: "POL-1".to_string(),
            group_number: Some(" ".to_string()),
            policy_type: PolicyType::Comprehensive,
            policy_files: Vec::new(),
            covered_individuals: vec![CoveredPerson {
                id: String::new(),
                name: "Jamie".to_string(),
                date_of_birth: None,
                relationship: Relationship::Child,
            }],
        }
    }

    #[tokio::test]
    async fn plan_crud_round_trip() {
        let h = Harness::new();
        let plan = h.plans.create_plan(new_plan("u1")).await.expect("create");
        assert!(plan.group_number.is_none());
        assert!(!plan.covered_individuals[0].id.is_empty());

        let updated = h
            .plans
            .update_plan(
                &plan.id,
                PlanChanges {
                    plan_name: Some("Platinum".to_string()),
                    ..PlanChanges::default()
                },
            )
            .await
            .expect("update");
        assert_eq!(updated.plan_name, "Platinum");
        assert_eq!(updated.policy_number, "POL-1");
        assert_eq!(h.plans.list_plans("u1").await.expect("list").len(), 1);

        h.plans.delete_plan(&plan.id).await.expect("delete");
        assert!(matches!(
            h.plans.get_plan(&plan.id).await,
            Err(CaseError::NotFound { kind: "plan", .. })
        ));
    }

    #[tokio::test]
    async fn blank_required_fields_are_rejected() {
        let h = Harness::new();
        let mut plan = new_plan("u1");
        plan.policy_number = "  ".to_string();
        assert!(matches!(
            h.plans.create_plan(plan).await,
            Err(CaseError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn plan_extraction_goes_through_the_extractor() {
        let h = Harness::new();
        let facts = h
            .plans
            .extract_plan_info(&[inline_file("policy.pdf", b"policy")])
            .await
            .expect("extract");
        assert_eq!(facts.insurance_company, "Acme Health");
        assert_eq!(h.extractor.plan_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn users_are_stored_with_normalized_email() {
        let h = Harness::new();
        let user = h
            .plans
            .create_user(NewUser {
                id: Some("u9".to_string()),
                email: "Sam <SAM@Example.com>".to_string(),
                first_name: Some("Sam".to_string()),
                last_name: None,
            })
            .await
            .expect("create");
        assert_eq!(user.email, "sam@example.com");
        assert_eq!(h.plans.get_user("u9").await.expect("get"), user);
        assert!(h
            .plans
            .create_user(NewUser {
                id: None,
                email: "not-an-address".to_string(),
                first_name: None,
                last_name: None,
            })
            .await
            .is_err());
    }
}
