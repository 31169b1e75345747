//! Request and response DTOs for the HTTP API.
//!
//! Field names are camelCase on the wire; the browser client predates this
//! service and its payload shapes are kept.

use serde::{Deserialize, Serialize};

use crate::appeal::case::{
    Case, CaseStep, CoveredPerson, FileRef, InsurancePlan, ParsedData, PolicyType,
};
use crate::appeal::controller::{DenialDetails, NewCase, OutboundMessage};
use crate::appeal::plans::{NewPlan, NewUser, PlanChanges};

// --- Cases ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListCasesQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCaseRequest {
    pub id: Option<String>,
    pub user_id: String,
    pub plan_id: Option<String>,
    pub covered_person_id: Option<String>,
}

impl From<CreateCaseRequest> for NewCase {
    fn from(req: CreateCaseRequest) -> Self {
        Self {
            id: req.id,
            user_id: req.user_id,
            plan_id: req.plan_id,
            covered_person_id: req.covered_person_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CaseListResponse {
    pub cases: Vec<Case>,
}

#[derive(Debug, Deserialize)]
pub struct UploadFilesRequest {
    pub files: Vec<FileRef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveDenialInfoRequest {
    pub parsed_data: ParsedData,
    /// Files version the caller reviewed; stale reviews are rejected.
    pub files_version: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseActionRequest {
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateEmailRequest {
    pub user_id: Option<String>,
    pub denial_date: Option<String>,
    pub procedure_name: Option<String>,
}

impl GenerateEmailRequest {
    pub fn details(&self) -> DenialDetails {
        DenialDetails {
            denial_date: self.denial_date.clone(),
            procedure_name: self.procedure_name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailRequest {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
}

impl From<SendEmailRequest> for OutboundMessage {
    fn from(req: SendEmailRequest) -> Self {
        Self {
            to: req.to,
            subject: req.subject,
            body: req.body,
            thread_id: req.thread_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdvanceStepRequest {
    pub step: CaseStep,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignPlanRequest {
    pub plan_id: Option<String>,
    pub covered_person_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveCaseRequest {
    pub feedback: Option<String>,
}

// --- Plans ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPlansQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct PlanListResponse {
    pub plans: Vec<InsurancePlan>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePlanRequest {
    pub user_id: String,
    pub insurance_company: String,
    pub plan_name: String,
    pub policy_number: String,
    pub group_number: Option<String>,
    #[serde(rename = "type", alias = "policyType")]
    pub policy_type: PolicyType,
    #[serde(default)]
    pub policy_files: Vec<FileRef>,
    #[serde(default)]
    pub covered_individuals: Vec<CoveredPerson>,
}

impl From<CreatePlanRequest> for NewPlan {
    fn from(req: CreatePlanRequest) -> Self {
        Self {
            user_id: req.user_id,
            insurance_company: req.insurance_company,
            plan_name: req.plan_name,
            policy_number: req.policy_number,
            group_number: req.group_number,
            policy_type: req.policy_type,
            policy_files: req.policy_files,
            covered_individuals: req.covered_individuals,
        }
    }
}

/// Partial update. An explicit `"groupNumber": null` clears the group number.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlanRequest {
    pub insurance_company: Option<String>,
    pub plan_name: Option<String>,
    pub policy_number: Option<String>,
    #[serde(default, with = "double_option")]
    pub group_number: Option<Option<String>>,
    #[serde(rename = "type", alias = "policyType", default)]
    pub policy_type: Option<PolicyType>,
    pub policy_files: Option<Vec<FileRef>>,
    pub covered_individuals: Option<Vec<CoveredPerson>>,
}

impl From<UpdatePlanRequest> for PlanChanges {
    fn from(req: UpdatePlanRequest) -> Self {
        Self {
            insurance_company: req.insurance_company,
            plan_name: req.plan_name,
            policy_number: req.policy_number,
            group_number: req.group_number,
            policy_type: req.policy_type,
            policy_files: req.policy_files,
            covered_individuals: req.covered_individuals,
        }
    }
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Option<String>>, D::Error> {
        Option::<String>::deserialize(d).map(Some)
    }
}

#[derive(Debug, Deserialize)]
pub struct ExtractPlanRequest {
    pub files: Vec<FileRef>,
}

// --- Users ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    pub id: Option<String>,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl From<CreateUserRequest> for NewUser {
    fn from(req: CreateUserRequest) -> Self {
        Self {
            id: req.id,
            email: req.email,
            first_name: req.first_name,
            last_name: req.last_name,
        }
    }
}

// --- Files ---

#[derive(Debug, Deserialize)]
pub struct SignedUrlRequest {
    pub bucket: Option<String>,
    pub path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlResponse {
    pub signed_url: String,
}

// --- Inbound mail ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub processed_count: usize,
    pub linked: usize,
    pub parked: usize,
    pub failed: usize,
}

// --- Health ---

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_update_distinguishes_absent_from_null_group() {
        let absent: UpdatePlanRequest = serde_json::from_str(r#"{"planName":"Gold"}"#).unwrap();
        assert_eq!(absent.group_number, None);
        assert_eq!(absent.plan_name.as_deref(), Some("Gold"));

        let cleared: UpdatePlanRequest =
            serde_json::from_str(r#"{"groupNumber":null}"#).unwrap();
        assert_eq!(cleared.group_number, Some(None));

        let set: UpdatePlanRequest = serde_json::from_str(r#"{"groupNumber":"G-1"}"#).unwrap();
        assert_eq!(set.group_number, Some(Some("G-1".to_string())));
    }

    #[test]
    fn create_plan_reads_type_field() {
        let json = r#"{
            "userId": "u1",
            "insuranceCompany": "Acme",
            "planName": "Gold",
            "policyNumber": "P-1",
            "type": "comprehensive"
        }"#;
        let req: CreatePlanRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.policy_type, PolicyType::Comprehensive);
        assert!(req.covered_individuals.is_empty());
    }

    #[test]
    fn step_request_uses_kebab_case() {
        let req: AdvanceStepRequest =
            serde_json::from_str(r#"{"step":"denial-extracted-info"}"#).unwrap();
        assert_eq!(req.step, CaseStep::DenialExtractedInfo);
    }

    #[test]
    fn send_request_converts_to_outbound_message() {
        let req: SendEmailRequest = serde_json::from_str(
            r#"{"to":"claims@insurer.example","subject":"Appeal","body":"Hi","threadId":"t1"}"#,
        )
        .unwrap();
        let msg = OutboundMessage::from(req);
        assert_eq!(msg.thread_id.as_deref(), Some("t1"));
    }
}
