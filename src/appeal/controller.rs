//! Case lifecycle controller.
//!
//! Owns the status/step state machine, the cache-or-compute plumbing around
//! the extraction and analysis services, outbound sends and the inbound
//! reply path. Every case mutation is a single field-level store update;
//! nothing is held across an external call except the per-stage flight
//! guard, which lives in process memory and never touches the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;

use crate::appeal::audit::{self, AppealEvent};
use crate::appeal::case::{
    Case, CaseAnalysis, CaseStatus, CaseStep, EmailDraft, EmailMessage, FileRef,
    InsurancePlan, MessageDirection, ParsedData, PolicyType, ReplyAnalysis, UserRecord,
};
use crate::appeal::composer::{self, LetterFacts};
use crate::appeal::correlator::{Correlation, Signal, ThreadCorrelator, strip_quoted_reply};
use crate::appeal::flight::{SingleFlight, Stage};
use crate::appeal::policy;
use crate::channels::email::{EmailTransport, InboundEmail, OutboundEmail};
use crate::config::AppealConfig;
use crate::db::{CaseCondition, CaseFilter, CaseSet, CaseUpdate, Database, EmailRecord};
use crate::error::{CaseError, DatabaseError, StorageError, TransportError};
use crate::services::{
    ArgumentRequest, CaseAnalyzer, DenialFacts, DocumentExtractor, FileStorage, FollowupRequest,
    stage_documents,
};

/// Addresses the controller puts on outbound mail.
#[derive(Debug, Clone, Default)]
pub struct MailIdentity {
    /// Sender recorded on sent messages.
    pub agent_address: Option<String>,
    /// Domain for `case-{id}@domain` reply addresses.
    pub inbound_domain: Option<String>,
}

/// Everything the controller depends on.
pub struct ControllerParts {
    pub db: Arc<dyn Database>,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub analyzer: Arc<dyn CaseAnalyzer>,
    pub storage: Arc<dyn FileStorage>,
    pub transport: Arc<dyn EmailTransport>,
    pub appeal: AppealConfig,
    pub mail: MailIdentity,
    pub denial_bucket: String,
    pub signed_url_ttl: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct NewCase {
    /// Caller-assigned id; generated when absent.
    pub id: Option<String>,
    pub user_id: String,
    pub plan_id: Option<String>,
    pub covered_person_id: Option<String>,
}

/// Denial details the caller already knows, used by the letter template.
#[derive(Debug, Clone, Default)]
pub struct DenialDetails {
    pub denial_date: Option<String>,
    pub procedure_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
    pub thread_id: String,
    pub case: Case,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub files_removed: usize,
    pub files_failed: usize,
}

/// Result of processing one inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum InboundOutcome {
    /// Already processed earlier; nothing changed.
    #[serde(rename_all = "camelCase")]
    Duplicate { message_id: String },
    #[serde(rename_all = "camelCase")]
    Linked {
        message_id: String,
        case_id: String,
        signal: String,
    },
    /// Stored without a case.
    #[serde(rename_all = "camelCase")]
    Parked { message_id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub processed: usize,
    pub linked: usize,
    pub parked: usize,
    pub duplicates: usize,
    pub failed: usize,
}

pub struct CaseController {
    db: Arc<dyn Database>,
    extractor: Arc<dyn DocumentExtractor>,
    analyzer: Arc<dyn CaseAnalyzer>,
    storage: Arc<dyn FileStorage>,
    transport: Arc<dyn EmailTransport>,
    correlator: ThreadCorrelator,
    flights: SingleFlight,
    config: AppealConfig,
    mail: MailIdentity,
    denial_bucket: String,
    signed_url_ttl: Duration,
}

fn stale_write(case_id: &str, stage: Stage) {
    tracing::debug!(case_id, stage = stage.as_str(), "Dropping result computed from stale inputs");
    audit::record(AppealEvent::StaleWriteDropped {
        case_id,
        stage: stage.as_str(),
    });
}

fn require_text(value: &str, field: &str) -> Result<(), CaseError> {
    if value.trim().is_empty() {
        return Err(CaseError::InvalidInput(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Policy context handed to the analysis service.
fn policy_context(plan: Option<&InsurancePlan>) -> String {
    let Some(plan) = plan else {
        return String::new();
    };
    let mut lines = vec![
        format!("Insurance company: {}", plan.insurance_company),
        format!("Plan name: {}", plan.plan_name),
        format!("Policy number: {}", plan.policy_number),
    ];
    if let Some(group) = plan.group_number.as_deref().filter(|g| !g.is_empty()) {
        lines.push(format!("Group number: {group}"));
    }
    lines.push(format!(
        "Policy type: {}",
        match plan.policy_type {
            PolicyType::Comprehensive => "comprehensive",
            PolicyType::Supplementary => "supplementary",
        }
    ));
    if !plan.policy_files.is_empty() {
        let names: Vec<&str> = plan.policy_files.iter().map(|f| f.name.as_str()).collect();
        lines.push(format!("Policy documents: {}", names.join(", ")));
    }
    lines.join("\n")
}

fn forward_body(email: &InboundEmail, body: &str) -> String {
    format!(
        "---------- Forwarded message ----------\nFrom: {}\nDate: {}\nSubject: {}\nTo: {}\n\n{}",
        email.from,
        email.date.to_rfc2822(),
        email.subject,
        email.to,
        body
    )
}

impl CaseController {
    pub fn new(parts: ControllerParts) -> Self {
        let correlator =
            ThreadCorrelator::standard(Arc::clone(&parts.db), Arc::clone(&parts.transport));
        Self {
            db: parts.db,
            extractor: parts.extractor,
            analyzer: parts.analyzer,
            storage: parts.storage,
            transport: parts.transport,
            correlator,
            flights: SingleFlight::new(),
            config: parts.appeal,
            mail: parts.mail,
            denial_bucket: parts.denial_bucket,
            signed_url_ttl: parts.signed_url_ttl,
        }
    }

    /// Replace the default correlation chain.
    pub fn with_correlator(mut self, correlator: ThreadCorrelator) -> Self {
        self.correlator = correlator;
        self
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    async fn load(&self, case_id: &str) -> Result<Case, CaseError> {
        self.db
            .find_case(case_id)
            .await?
            .ok_or_else(|| CaseError::case_not_found(case_id))
    }

    async fn plan_for(&self, case: &Case) -> Result<Option<InsurancePlan>, CaseError> {
        let Some(plan_id) = case.plan_id.as_deref() else {
            return Ok(None);
        };
        let plan = self.db.get_plan(plan_id).await?;
        if plan.is_none() {
            tracing::warn!(case_id = %case.id, plan_id, "Case references a deleted plan; using placeholders");
        }
        Ok(plan)
    }

    async fn owner_of(&self, case: &Case) -> Result<Option<UserRecord>, CaseError> {
        Ok(self.db.get_user(&case.user_id).await?)
    }

    // ==================== Case CRUD ====================

    pub async fn create_case(&self, new: NewCase) -> Result<Case, CaseError> {
        require_text(&new.user_id, "userId")?;
        let id = match new.id.as_deref().map(policy::sanitize_case_id) {
            Some(id) if !id.is_empty() => id,
            Some(_) => return Err(CaseError::InvalidInput("case id is not usable".to_string())),
            None => uuid::Uuid::new_v4().simple().to_string(),
        };
        let mut case = Case::new(id, new.user_id.trim());
        case.plan_id = new.plan_id.filter(|p| !p.is_empty());
        case.covered_person_id = new.covered_person_id.filter(|p| !p.is_empty());

        let case = self.db.insert_case(&case).await.map_err(|e| match e {
            DatabaseError::Duplicate(_) => {
                CaseError::InvalidInput(format!("case '{}' already exists", case.id))
            }
            other => CaseError::Storage(other),
        })?;
        tracing::info!(case_id = %case.id, user_id = %case.user_id, "Case created");
        audit::record(AppealEvent::CaseCreated {
            case_id: &case.id,
            user_id: &case.user_id,
        });
        Ok(case)
    }

    pub async fn get_case(&self, case_id: &str) -> Result<Case, CaseError> {
        self.load(case_id).await
    }

    pub async fn list_cases(&self, user_id: Option<&str>) -> Result<Vec<Case>, CaseError> {
        let filter = match user_id {
            Some(user) => CaseFilter::for_user(user),
            None => CaseFilter::default(),
        };
        Ok(self.db.find_cases(&filter).await?)
    }

    // ==================== Denial files ====================

    /// Append denial files, clear every cached AI output and restart
    /// analysis, all in one store update.
    pub async fn upload_files(
        self: &Arc<Self>,
        case_id: &str,
        files: Vec<FileRef>,
    ) -> Result<Case, CaseError> {
        if files.is_empty() {
            return Err(CaseError::InvalidInput("no files supplied".to_string()));
        }
        if let Some(bad) = files
            .iter()
            .find(|f| f.data.is_none() && f.storage_location().is_none())
        {
            return Err(CaseError::InvalidInput(format!(
                "file '{}' has neither inline data nor a storage path",
                bad.name
            )));
        }
        let count = files.len();
        let update = CaseUpdate::new()
            .push_files(files)
            .invalidate_cache()
            .set(CaseSet::Status(CaseStatus::Analyzing))
            .set(CaseSet::CurrentStep(CaseStep::DenialUpload));
        let case = self
            .db
            .find_case_and_update(case_id, &CaseCondition::any(), &update)
            .await?
            .ok_or_else(|| CaseError::case_not_found(case_id))?;

        tracing::info!(case_id, count, files_version = case.files_version, "Denial files uploaded");
        audit::record(AppealEvent::FilesUploaded {
            case_id,
            count,
            files_version: case.files_version,
        });

        if self.config.extract_on_upload {
            let this = Arc::clone(self);
            let id = case_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = this.extract_denial_info(&id).await {
                    tracing::warn!(case_id = %id, "Background denial extraction failed: {}", e);
                }
            });
        }
        Ok(case)
    }

    /// Denial summary for the case's current files, computed at most once
    /// per files version.
    pub async fn extract_denial_info(&self, case_id: &str) -> Result<DenialFacts, CaseError> {
        let _flight = self.flights.enter(case_id, Stage::ExtractDenial).await;
        let case = self.load(case_id).await?;
        if let Some(facts) = case.denial_facts.clone() {
            tracing::debug!(case_id, "Denial extraction cache hit");
            return Ok(facts);
        }
        if case.denial_files.is_empty() {
            return Err(CaseError::InvalidInput(
                "case has no denial files to extract from".to_string(),
            ));
        }

        let version = case.files_version;
        let mut facts = {
            // Staged copies are removed when `staged` drops, on every path.
            let staged = stage_documents(self.storage.as_ref(), &case.denial_files)
                .await
                .map_err(|e| CaseError::ExtractionFailed(e.to_string()))?;
            self.extractor
                .extract_denial(&staged)
                .await
                .map_err(|e| CaseError::ExtractionFailed(e.to_string()))?
        };
        facts.brief_description = facts.brief_description.trim().to_string();
        if facts.brief_description.is_empty() {
            return Err(CaseError::ExtractionFailed(
                "extraction returned an empty description".to_string(),
            ));
        }

        let written = self
            .db
            .find_case_and_update(
                case_id,
                &CaseCondition::files_version(version),
                &CaseUpdate::new().set(CaseSet::DenialFacts(facts.clone())),
            )
            .await?;
        if written.is_none() {
            stale_write(case_id, Stage::ExtractDenial);
        }
        Ok(facts)
    }

    /// The user confirms or edits the extracted facts. `files_version`, when
    /// given, must still match: facts reviewed against an older file set are
    /// rejected.
    pub async fn save_denial_info(
        &self,
        case_id: &str,
        parsed: ParsedData,
        files_version: Option<u64>,
    ) -> Result<Case, CaseError> {
        require_text(&parsed.denial_reason, "denialReason")?;
        let case = self.load(case_id).await?;
        if !case.status.can_transition_to(CaseStatus::ReadyToSend) {
            return Err(CaseError::InvalidTransition {
                from: case.status.to_string(),
                to: CaseStatus::ReadyToSend.to_string(),
            });
        }
        let condition = CaseCondition::status_in(&[CaseStatus::Analyzing, CaseStatus::ReadyToSend])
            .and_files_version(files_version);
        let update = CaseUpdate::new()
            .set(CaseSet::ParsedData(parsed))
            .set(CaseSet::Status(CaseStatus::ReadyToSend))
            .set(CaseSet::CurrentStep(CaseStep::Strategy));
        if let Some(updated) = self
            .db
            .find_case_and_update(case_id, &condition, &update)
            .await?
        {
            return Ok(updated);
        }

        let current = self.load(case_id).await?;
        if files_version.is_some_and(|v| v != current.files_version) {
            return Err(CaseError::InvalidInput(format!(
                "denial files changed (version {} is now {}); review the new extraction",
                files_version.unwrap_or_default(),
                current.files_version
            )));
        }
        Err(CaseError::InvalidTransition {
            from: current.status.to_string(),
            to: CaseStatus::ReadyToSend.to_string(),
        })
    }

    // ==================== Analysis and drafting ====================

    /// Appeal strategy, computed at most once per files version.
    pub async fn analyze_case(
        &self,
        case_id: &str,
        user_id: Option<&str>,
    ) -> Result<CaseAnalysis, CaseError> {
        let _flight = self.flights.enter(case_id, Stage::Analyze).await;
        let case = self.load(case_id).await?;
        if user_id.is_some_and(|u| u != case.user_id) {
            return Err(CaseError::case_not_found(case_id));
        }
        if let Some(analysis) = case.analysis.clone() {
            tracing::debug!(case_id, "Analysis cache hit");
            return Ok(analysis);
        }
        let denial_reason = case.denial_reason().map(str::to_string).ok_or_else(|| {
            CaseError::InvalidInput("no denial reason yet; extract or save denial info first".to_string())
        })?;

        let plan = self.plan_for(&case).await?;
        let version = case.files_version;
        let analysis = self
            .analyzer
            .analyze(&denial_reason, &policy_context(plan.as_ref()))
            .await
            .map_err(|e| CaseError::AnalysisFailed(e.to_string()))?;

        let written = self
            .db
            .find_case_and_update(
                case_id,
                &CaseCondition::files_version(version),
                &CaseUpdate::new().set(CaseSet::Analysis(analysis.clone())),
            )
            .await?;
        if written.is_none() {
            stale_write(case_id, Stage::Analyze);
        }
        Ok(analysis)
    }

    /// Initial appeal letter, computed at most once per files version. The
    /// model writes only the argument; subject, salutation and signature come
    /// from the letter template.
    pub async fn generate_email_draft(
        &self,
        case_id: &str,
        user_id: Option<&str>,
        details: DenialDetails,
    ) -> Result<EmailDraft, CaseError> {
        let _flight = self.flights.enter(case_id, Stage::DraftEmail).await;
        let case = self.load(case_id).await?;
        if user_id.is_some_and(|u| u != case.user_id) {
            return Err(CaseError::case_not_found(case_id));
        }
        if let Some(draft) = case.email_draft.clone() {
            tracing::debug!(case_id, "Email draft cache hit");
            return Ok(draft);
        }
        let version = case.files_version;
        let analysis = match case.analysis.clone() {
            Some(analysis) => analysis,
            None => self.analyze_case(case_id, user_id).await?,
        };
        let denial_reason = case.denial_reason().unwrap_or_default().to_string();

        let plan = self.plan_for(&case).await?;
        let owner = self.owner_of(&case).await?;
        let facts = LetterFacts::gather(&case, plan.as_ref(), owner.as_ref()).with_denial_details(
            details.denial_date.as_deref(),
            details.procedure_name.as_deref(),
        );
        let argument = self
            .analyzer
            .draft_appeal_argument(&ArgumentRequest {
                case_id,
                denial_reason: &denial_reason,
                insurer: facts.insurer.as_deref(),
                policy_number: facts.policy_number.as_deref(),
                analysis: &analysis,
            })
            .await
            .map_err(|e| CaseError::AnalysisFailed(e.to_string()))?;
        let draft = composer::compose_appeal(&facts, &argument).map_err(CaseError::Internal)?;

        let written = self
            .db
            .find_case_and_update(
                case_id,
                &CaseCondition::files_version(version),
                &CaseUpdate::new().set(CaseSet::EmailDraft(draft.clone())),
            )
            .await?;
        if written.is_none() {
            stale_write(case_id, Stage::DraftEmail);
        }
        Ok(draft)
    }

    /// Follow-up letter answering the latest insurer reply. Never cached:
    /// every reply changes the input.
    pub async fn generate_followup(&self, case_id: &str) -> Result<EmailDraft, CaseError> {
        let case = self.load(case_id).await?;
        let last = case.last_received().cloned().ok_or_else(|| {
            CaseError::InvalidInput("no reply has been received for this case".to_string())
        })?;
        let history = composer::format_thread_history(&case.email_thread);
        let argument = self
            .analyzer
            .draft_followup_argument(&FollowupRequest {
                case_id,
                denial_reason: case.denial_reason(),
                thread_history: &history,
            })
            .await
            .map_err(|e| CaseError::AnalysisFailed(e.to_string()))?;

        let plan = self.plan_for(&case).await?;
        let owner = self.owner_of(&case).await?;
        let facts = LetterFacts::gather(&case, plan.as_ref(), owner.as_ref());
        let draft = composer::compose_followup(&facts, &argument, Some(&last.subject))
            .map_err(CaseError::Internal)?;

        if case.status.permits_step(CaseStep::FollowupReview) {
            // Losing this race to a concurrent send only leaves the step where it was.
            let _ = self
                .db
                .find_case_and_update(
                    case_id,
                    &CaseCondition::status_in(&[case.status]),
                    &CaseUpdate::new().set(CaseSet::CurrentStep(CaseStep::FollowupReview)),
                )
                .await?;
        }
        Ok(draft)
    }

    // ==================== Workflow helpers ====================

    pub async fn advance_step(&self, case_id: &str, step: CaseStep) -> Result<Case, CaseError> {
        let case = self.load(case_id).await?;
        let reject = |case: &Case| CaseError::InvalidTransition {
            from: format!("{} ({})", case.current_step, case.status),
            to: step.to_string(),
        };
        if !case.status.permits_step(step) || !case.has_prerequisites_for(step) {
            return Err(reject(&case));
        }
        match self
            .db
            .find_case_and_update(
                case_id,
                &CaseCondition::status_in(&[case.status]),
                &CaseUpdate::new().set(CaseSet::CurrentStep(step)),
            )
            .await?
        {
            Some(updated) => Ok(updated),
            None => Err(reject(&self.load(case_id).await?)),
        }
    }

    pub async fn mark_emails_read(&self, case_id: &str) -> Result<Case, CaseError> {
        self.db
            .find_case_and_update(
                case_id,
                &CaseCondition::any(),
                &CaseUpdate::new().set(CaseSet::HasNewEmail(false)),
            )
            .await?
            .ok_or_else(|| CaseError::case_not_found(case_id))
    }

    pub async fn assign_plan(
        &self,
        case_id: &str,
        plan_id: Option<String>,
        covered_person_id: Option<String>,
    ) -> Result<Case, CaseError> {
        let case = self.load(case_id).await?;
        if let Some(plan_id) = plan_id.as_deref() {
            let plan = self
                .db
                .get_plan(plan_id)
                .await?
                .ok_or_else(|| CaseError::plan_not_found(plan_id))?;
            if plan.user_id != case.user_id {
                return Err(CaseError::InvalidInput(
                    "plan belongs to a different user".to_string(),
                ));
            }
            if let Some(person) = covered_person_id.as_deref()
                && plan.covered_person(person).is_none()
            {
                return Err(CaseError::InvalidInput(format!(
                    "'{person}' is not covered by plan '{plan_id}'"
                )));
            }
        } else if covered_person_id.is_some() {
            return Err(CaseError::InvalidInput(
                "a covered person requires a plan".to_string(),
            ));
        }
        self.db
            .find_case_and_update(
                case_id,
                &CaseCondition::any(),
                &CaseUpdate::new()
                    .set(CaseSet::PlanId(plan_id))
                    .set(CaseSet::CoveredPersonId(covered_person_id)),
            )
            .await?
            .ok_or_else(|| CaseError::case_not_found(case_id))
    }

    /// Close out a case. Independent of the status machine.
    pub async fn resolve_case(
        &self,
        case_id: &str,
        feedback: Option<String>,
    ) -> Result<Case, CaseError> {
        let case = self
            .db
            .find_case_and_update(
                case_id,
                &CaseCondition::any(),
                &CaseUpdate::new().set(CaseSet::Resolved {
                    resolved_date: Utc::now(),
                    feedback: feedback.filter(|f| !f.trim().is_empty()),
                }),
            )
            .await?
            .ok_or_else(|| CaseError::case_not_found(case_id))?;
        tracing::info!(case_id, "Case resolved");
        audit::record(AppealEvent::CaseResolved { case_id });
        Ok(case)
    }

    /// Delete the case, then remove its stored files best-effort.
    pub async fn delete_case(&self, case_id: &str) -> Result<DeleteReport, CaseError> {
        let case = self
            .db
            .find_case_and_delete(case_id)
            .await?
            .ok_or_else(|| CaseError::case_not_found(case_id))?;

        let mut by_bucket: HashMap<&str, Vec<String>> = HashMap::new();
        for (bucket, path) in case.denial_files.iter().filter_map(FileRef::storage_location) {
            by_bucket.entry(bucket).or_default().push(path.to_string());
        }
        let mut report = DeleteReport {
            files_removed: 0,
            files_failed: 0,
        };
        let removals = by_bucket.into_iter().map(|(bucket, paths)| async move {
            let result = self.storage.remove(bucket, &paths).await;
            (bucket, paths.len(), result)
        });
        for (bucket, count, result) in join_all(removals).await {
            match result {
                Ok(()) => report.files_removed += count,
                Err(e) => {
                    tracing::warn!(case_id, bucket, count, "Failed to remove case files: {}", e);
                    report.files_failed += count;
                }
            }
        }

        tracing::info!(case_id, removed = report.files_removed, failed = report.files_failed, "Case deleted");
        audit::record(AppealEvent::CaseDeleted {
            case_id,
            files_removed: report.files_removed,
            files_failed: report.files_failed,
        });
        Ok(report)
    }

    /// Time-limited URL for a stored file; the denial bucket by default.
    pub async fn signed_url(&self, bucket: Option<&str>, path: &str) -> Result<String, CaseError> {
        require_text(path, "path")?;
        let bucket = bucket.filter(|b| !b.is_empty()).unwrap_or(&self.denial_bucket);
        self.storage
            .signed_url(bucket, path, self.signed_url_ttl)
            .await
            .map_err(|e| match e {
                StorageError::NotFound { bucket, path } => CaseError::NotFound {
                    kind: "file",
                    id: format!("{bucket}/{path}"),
                },
                StorageError::InvalidPath(reason) => CaseError::InvalidInput(reason),
                other => CaseError::Internal(other.to_string()),
            })
    }

    // ==================== Outbound mail ====================

    /// Send an appeal or follow-up. A transport failure leaves the case
    /// untouched and is never retried here.
    pub async fn send_email(
        &self,
        case_id: &str,
        message: OutboundMessage,
    ) -> Result<SendReceipt, CaseError> {
        if !policy::looks_like_address(&policy::bare_address(&message.to)) {
            return Err(CaseError::InvalidInput(format!(
                "'{}' is not an email address",
                message.to
            )));
        }
        require_text(&message.subject, "subject")?;
        require_text(&message.body, "body")?;

        let case = self.load(case_id).await?;
        if !CaseStatus::SENDABLE.contains(&case.status) {
            return Err(CaseError::InvalidTransition {
                from: case.status.to_string(),
                to: CaseStatus::AwaitingReply.to_string(),
            });
        }

        let owner = self.owner_of(&case).await?;
        let mut tags = vec![policy::case_tag(&case.id)];
        if let Some(owner) = &owner {
            tags.push(owner.email.to_ascii_lowercase());
        }
        let outbound = OutboundEmail {
            to: message.to.trim().to_string(),
            subject: message.subject.clone(),
            body: message.body.clone(),
            thread_id: message
                .thread_id
                .filter(|t| !t.is_empty())
                .or_else(|| case.latest_thread_id().map(str::to_string)),
            in_reply_to: case.last_received().and_then(|m| m.message_id_header.clone()),
            reply_to: self
                .mail
                .inbound_domain
                .as_deref()
                .map(|domain| policy::reply_address(&case.id, domain)),
            tags,
        };

        let sent = self
            .transport
            .send(&outbound)
            .await
            .map_err(|e| CaseError::SendFailed(e.to_string()))?;
        tracing::info!(case_id, message_id = %sent.message_id, thread_id = %sent.thread_id, "Appeal email sent");

        let now = Utc::now();
        let from = self
            .mail
            .agent_address
            .clone()
            .unwrap_or_else(|| "me".to_string());
        let record = EmailRecord {
            message_id: sent.message_id.clone(),
            thread_id: sent.thread_id.clone(),
            message_id_header: sent.message_id_header.clone(),
            from: from.clone(),
            to: outbound.to.clone(),
            subject: outbound.subject.clone(),
            body: outbound.body.clone(),
            internal_date: now,
            case_id: Some(case.id.clone()),
            label_ids: sent.label_ids.clone(),
            analysis: None,
        };
        // The mail is already out; a failed record only weakens later correlation.
        if let Err(e) = self.db.insert_email(&record).await {
            tracing::error!(case_id, message_id = %sent.message_id, "Failed to store sent email record: {}", e);
        }

        let entry = EmailMessage {
            id: sent.message_id.clone(),
            from,
            to: outbound.to,
            subject: outbound.subject,
            body: outbound.body,
            date: now,
            direction: MessageDirection::Sent,
            thread_id: Some(sent.thread_id.clone()),
            message_id_header: sent.message_id_header.clone(),
            analysis: None,
        };
        let update = CaseUpdate::new()
            .push_message(entry)
            .set(CaseSet::Status(CaseStatus::AwaitingReply))
            .set(CaseSet::CurrentStep(CaseStep::EmailSent));
        let case = self
            .db
            .find_case_and_update(case_id, &CaseCondition::any(), &update)
            .await?
            .ok_or_else(|| CaseError::case_not_found(case_id))?;

        audit::record(AppealEvent::EmailSent {
            case_id,
            message_id: &sent.message_id,
            thread_id: &sent.thread_id,
        });
        Ok(SendReceipt {
            message_id: sent.message_id,
            thread_id: sent.thread_id,
            case,
        })
    }

    // ==================== Inbound mail ====================

    /// Correlate, analyse and apply one inbound message. A message that
    /// matches no case is stored unlinked and reported as parked; that is
    /// not an error.
    ///
    /// The case thread is updated before the Email record is written, so a
    /// failure anywhere leaves no record behind and redelivery processes the
    /// message again. The thread append is guarded by message id, which
    /// keeps a retry from adding the reply twice.
    pub async fn ingest_inbound(&self, email: InboundEmail) -> Result<InboundOutcome, CaseError> {
        if self.db.find_email(&email.message_id).await?.is_some() {
            tracing::debug!(message_id = %email.message_id, "Inbound message already processed");
            return Ok(InboundOutcome::Duplicate {
                message_id: email.message_id,
            });
        }

        let body = strip_quoted_reply(&email.body);
        let email = InboundEmail { body, ..email };
        let correlation = self.correlator.correlate(&email).await?;
        let case_id = correlation.case().map(|c| c.id.clone());

        let analysis = if self.config.analyze_replies {
            let history = correlation
                .case()
                .map(|c| composer::format_thread_history(&c.email_thread))
                .unwrap_or_default();
            match self.analyzer.analyze_reply(&email.body, &history).await {
                Ok(analysis) => Some(analysis),
                Err(e) => {
                    tracing::warn!(message_id = %email.message_id, "Reply analysis failed: {}", e);
                    None
                }
            }
        } else {
            None
        };

        if let Correlation::Linked { case, signal, .. } = &correlation {
            self.apply_reply(&case.id, &email, analysis.clone(), *signal)
                .await?;
        }

        let record = EmailRecord {
            message_id: email.message_id.clone(),
            thread_id: email.thread_id.clone(),
            message_id_header: email.message_id_header.clone(),
            from: email.from.clone(),
            to: email.to.clone(),
            subject: email.subject.clone(),
            body: email.body.clone(),
            internal_date: email.date,
            case_id,
            label_ids: email.labels.clone(),
            analysis,
        };
        if !self.db.insert_email(&record).await? {
            return Ok(InboundOutcome::Duplicate {
                message_id: email.message_id,
            });
        }

        let outcome = match &correlation {
            Correlation::Linked { case, signal, .. } => InboundOutcome::Linked {
                message_id: email.message_id.clone(),
                case_id: case.id.clone(),
                signal: signal.as_str().to_string(),
            },
            Correlation::Parked { .. } => {
                tracing::info!(message_id = %email.message_id, thread_id = %email.thread_id, "Inbound message matched no case; parked");
                audit::record(AppealEvent::ReplyParked {
                    message_id: &email.message_id,
                    thread_id: &email.thread_id,
                });
                InboundOutcome::Parked {
                    message_id: email.message_id.clone(),
                }
            }
        };

        if self.config.forward_replies {
            self.forward_to_user(&correlation, &email).await;
        }
        Ok(outcome)
    }

    async fn apply_reply(
        &self,
        case_id: &str,
        email: &InboundEmail,
        analysis: Option<ReplyAnalysis>,
        signal: Signal,
    ) -> Result<(), CaseError> {
        let entry = EmailMessage {
            id: email.message_id.clone(),
            from: email.from.clone(),
            to: email.to.clone(),
            subject: email.subject.clone(),
            body: email.body.clone(),
            date: email.date,
            direction: MessageDirection::Received,
            thread_id: Some(email.thread_id.clone()).filter(|t| !t.is_empty()),
            message_id_header: email.message_id_header.clone(),
            analysis,
        };

        let advancing = CaseUpdate::new()
            .push_message(entry.clone())
            .set(CaseSet::Status(CaseStatus::ReplyReceived))
            .set(CaseSet::CurrentStep(CaseStep::ReplyReceived))
            .set(CaseSet::HasNewEmail(true));
        let mut applied = self
            .db
            .find_case_and_update(
                case_id,
                &CaseCondition::status_in(CaseStatus::REPLYABLE)
                    .and_without_message(&email.message_id),
                &advancing,
            )
            .await?;
        if applied.is_none() {
            // Not yet sent from here: keep the message, leave the lifecycle alone.
            let append_only = CaseUpdate::new()
                .push_message(entry)
                .set(CaseSet::HasNewEmail(true));
            applied = self
                .db
                .find_case_and_update(
                    case_id,
                    &CaseCondition::any().and_without_message(&email.message_id),
                    &append_only,
                )
                .await?;
        }
        if applied.is_none() {
            tracing::debug!(
                case_id,
                message_id = %email.message_id,
                "Case deleted or reply already on its thread"
            );
            return Ok(());
        }

        tracing::info!(case_id, message_id = %email.message_id, signal = signal.as_str(), "Inbound reply linked to case");
        audit::record(AppealEvent::ReplyLinked {
            case_id,
            message_id: &email.message_id,
            signal: signal.as_str(),
        });
        Ok(())
    }

    async fn forward_to_user(&self, correlation: &Correlation, email: &InboundEmail) {
        let target = match correlation.user_address() {
            Some(address) => Some(address.to_string()),
            None => match correlation.case() {
                Some(case) => match self.db.get_user(&case.user_id).await {
                    Ok(user) => user.map(|u| u.email),
                    Err(e) => {
                        tracing::warn!(case_id = %case.id, "Owner lookup for forwarding failed: {}", e);
                        None
                    }
                },
                None => None,
            },
        };
        let Some(target) = target.filter(|t| policy::looks_like_address(t)) else {
            tracing::debug!(message_id = %email.message_id, "No user to forward the reply to");
            return;
        };
        if policy::bare_address(&email.from) == policy::bare_address(&target) {
            return;
        }

        let forward = OutboundEmail {
            to: target.clone(),
            subject: format!("Fwd: {}", email.subject),
            body: forward_body(email, &email.body),
            ..OutboundEmail::default()
        };
        match self.transport.send(&forward).await {
            Ok(_) => tracing::info!(message_id = %email.message_id, to = %target, "Forwarded reply to user"),
            Err(e) => tracing::warn!(message_id = %email.message_id, "Forwarding reply failed: {}", e),
        }
    }

    /// Poll unread mail through the transport and ingest each message.
    pub async fn sync_inbox(&self) -> Result<SyncReport, CaseError> {
        let ids = self.transport.list_unread().await.map_err(|e| match e {
            TransportError::Unsupported(_) | TransportError::NotConfigured(_) => {
                CaseError::InvalidInput(format!("inbox polling unavailable: {e}"))
            }
            other => CaseError::Internal(format!("listing unread mail failed: {other}")),
        })?;

        let mut report = SyncReport::default();
        for id in ids {
            let email = match self.transport.get(&id).await {
                Ok(email) => email,
                Err(e) => {
                    tracing::warn!(message_id = %id, "Fetching message failed: {}", e);
                    report.failed += 1;
                    continue;
                }
            };
            match self.ingest_inbound(email).await {
                Ok(outcome) => {
                    report.processed += 1;
                    match outcome {
                        InboundOutcome::Linked { .. } => report.linked += 1,
                        InboundOutcome::Parked { .. } => report.parked += 1,
                        InboundOutcome::Duplicate { .. } => report.duplicates += 1,
                    }
                }
                Err(e) => {
                    tracing::warn!(message_id = %id, "Processing message failed: {}", e);
                    report.failed += 1;
                    continue;
                }
            }
            if let Err(e) = self.transport.mark_read(&id).await {
                tracing::warn!(message_id = %id, "Marking message read failed: {}", e);
            }
        }
        tracing::info!(processed = report.processed, linked = report.linked, parked = report.parked, "Inbox sync finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::appeal::case::{CoveredPerson, Relationship};
    use crate::testing::{Harness, inline_file};

    async fn ready_case(h: &Harness, id: &str) -> Case {
        h.controller
            .create_case(NewCase {
                id: Some(id.to_string()),
                user_id: "u1".to_string(),
                ..NewCase::default()
            })
            .await
            .expect("create");
        h.controller
            .upload_files(id, vec![inline_file("denial.pdf", b"letter")])
            .await
            .expect("upload");
        h.controller
            .save_denial_info(
                id,
                ParsedData {
                    insurer: "Acme Health".to_string(),
                    policy_number: "POL-12345".to_string(),
                    denial_reason: "Not medically necessary".to_string(),
                },
                None,
            )
            .await
            .expect("save")
    }

    #[tokio::test]
    async fn upload_clears_the_whole_cache_group_and_bumps_version() {
        let h = Harness::new();
        ready_case(&h, "c1").await;
        h.controller.analyze_case("c1", None).await.expect("analyze");
        h.controller
            .generate_email_draft("c1", None, DenialDetails::default())
            .await
            .expect("draft");

        let case = h
            .controller
            .upload_files("c1", vec![inline_file("second.pdf", b"more")])
            .await
            .expect("upload");
        assert_eq!(case.status, CaseStatus::Analyzing);
        assert_eq!(case.current_step, CaseStep::DenialUpload);
        assert_eq!(case.files_version, 2);
        assert_eq!(case.denial_files.len(), 2);
        assert!(case.parsed_data.is_none());
        assert!(case.denial_reason_title.is_none());
        assert!(case.denial_facts.is_none());
        assert!(case.analysis.is_none());
        assert!(case.email_draft.is_none());
    }

    #[tokio::test]
    async fn upload_to_missing_case_is_not_found() {
        let h = Harness::new();
        let err = h
            .controller
            .upload_files("ghost", vec![inline_file("a.pdf", b"x")])
            .await
            .expect_err("missing");
        assert!(matches!(err, CaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn extraction_is_cached_per_files_version() {
        let h = Harness::new();
        h.controller
            .create_case(NewCase {
                id: Some("c2".to_string()),
                user_id: "u1".to_string(),
                ..NewCase::default()
            })
            .await
            .expect("create");
        h.controller
            .upload_files("c2", vec![inline_file("denial.pdf", b"letter")])
            .await
            .expect("upload");

        let first = h.controller.extract_denial_info("c2").await.expect("extract");
        let second = h.controller.extract_denial_info("c2").await.expect("extract");
        assert_eq!(first, second);
        assert_eq!(first.denial_date.as_deref(), Some("2026-01-15"));
        assert_eq!(first.procedure_name.as_deref(), Some("Lumbar MRI"));
        assert_eq!(h.extractor.denial_calls.load(Ordering::SeqCst), 1);
        let case = h.controller.get_case("c2").await.expect("case");
        assert_eq!(case.denial_reason_title.as_deref(), Some(first.brief_description.as_str()));
        assert_eq!(case.denial_facts, Some(first));

        let case = h
            .controller
            .upload_files("c2", vec![inline_file("second.pdf", b"more")])
            .await
            .expect("upload");
        assert!(case.denial_facts.is_none());
    }

    #[tokio::test]
    async fn draft_uses_extracted_denial_date_unless_caller_overrides() {
        let h = Harness::new();
        ready_case(&h, "c2d").await;
        h.controller.extract_denial_info("c2d").await.expect("extract");
        let draft = h
            .controller
            .generate_email_draft("c2d", None, DenialDetails::default())
            .await
            .expect("draft");
        assert!(draft.body.contains("Date of Denial Letter: 2026-01-15"));
        assert!(draft.body.contains("Procedure/Service: Lumbar MRI"));
        assert!(!draft.body.contains(composer::DENIAL_DATE_PLACEHOLDER));

        let h = Harness::new();
        ready_case(&h, "c2e").await;
        h.controller.extract_denial_info("c2e").await.expect("extract");
        let draft = h
            .controller
            .generate_email_draft(
                "c2e",
                None,
                DenialDetails {
                    denial_date: Some("2026-02-01".to_string()),
                    procedure_name: None,
                },
            )
            .await
            .expect("draft");
        assert!(draft.body.contains("Date of Denial Letter: 2026-02-01"));
        assert!(draft.body.contains("Procedure/Service: Lumbar MRI"));
    }

    #[tokio::test]
    async fn extraction_failure_leaves_case_unchanged_and_is_retryable() {
        let h = Harness::new();
        h.controller
            .create_case(NewCase {
                id: Some("c3".to_string()),
                user_id: "u1".to_string(),
                ..NewCase::default()
            })
            .await
            .expect("create");
        let before = h
            .controller
            .upload_files("c3", vec![inline_file("denial.pdf", b"letter")])
            .await
            .expect("upload");
        h.extractor.fail.store(true, Ordering::SeqCst);
        let err = h.controller.extract_denial_info("c3").await.expect_err("fails");
        assert!(matches!(err, CaseError::ExtractionFailed(_)));
        assert!(err.is_retryable());
        assert_eq!(h.controller.get_case("c3").await.expect("case"), before);

        h.extractor.fail.store(false, Ordering::SeqCst);
        h.controller.extract_denial_info("c3").await.expect("retry");
    }

    #[tokio::test]
    async fn extraction_against_replaced_files_is_dropped() {
        let h = Harness::new();
        h.controller
            .create_case(NewCase {
                id: Some("c4".to_string()),
                user_id: "u1".to_string(),
                ..NewCase::default()
            })
            .await
            .expect("create");
        h.controller
            .upload_files("c4", vec![inline_file("old.pdf", b"old")])
            .await
            .expect("upload");

        let gate = h.extractor.hold();
        let controller = Arc::clone(&h.controller);
        let in_flight = tokio::spawn(async move { controller.extract_denial_info("c4").await });
        gate.entered.notified().await;

        h.controller
            .upload_files("c4", vec![inline_file("new.pdf", b"new")])
            .await
            .expect("second upload");
        gate.release.notify_one();
        in_flight.await.expect("join").expect("extraction result still returned");

        let case = h.controller.get_case("c4").await.expect("case");
        assert!(case.denial_reason_title.is_none());
        assert_eq!(case.files_version, 2);
        let events = audit::test_events_for("c4");
        assert!(events.iter().any(|e| e.event_type == "stale_write_dropped"));
    }

    #[tokio::test]
    async fn concurrent_analysis_calls_share_one_service_call() {
        let h = Harness::new();
        ready_case(&h, "c5").await;
        let (a, b) = tokio::join!(
            h.controller.analyze_case("c5", None),
            h.controller.analyze_case("c5", Some("u1"))
        );
        assert_eq!(a.expect("a"), b.expect("b"));
        assert_eq!(h.analyzer.analyze_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn analysis_for_another_user_is_not_found() {
        let h = Harness::new();
        ready_case(&h, "c6").await;
        let err = h
            .controller
            .analyze_case("c6", Some("intruder"))
            .await
            .expect_err("other user");
        assert!(matches!(err, CaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn draft_uses_template_and_placeholders() {
        let h = Harness::new();
        ready_case(&h, "c7").await;
        let draft = h
            .controller
            .generate_email_draft("c7", Some("u1"), DenialDetails::default())
            .await
            .expect("draft");
        assert_eq!(
            draft.subject,
            "Appeal for Claim Denial - [YOUR NAME] - Policy #POL-12345"
        );
        assert!(draft.body.contains(composer::PATIENT_NAME_PLACEHOLDER));
        assert!(draft.body.contains(composer::DENIAL_DATE_PLACEHOLDER));
        assert!(draft.body.contains(crate::testing::FAKE_ARGUMENT));

        let again = h
            .controller
            .generate_email_draft("c7", None, DenialDetails::default())
            .await
            .expect("cached");
        assert_eq!(draft, again);
        assert_eq!(h.analyzer.draft_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn draft_fills_patient_from_plan_and_survives_plan_deletion() {
        let h = Harness::new();
        ready_case(&h, "c8").await;
        let plan = InsurancePlan {
            id: "p1".to_string(),
            user_id: "u1".to_string(),
            insurance_company: "Acme Health".to_string(),
            plan_name: "Gold".to_string(),
            policy_number: "POL-12345".to_string(),
            group_number: None,
            policy_type: PolicyType::Comprehensive,
            policy_files: Vec::new(),
            covered_individuals: vec![CoveredPerson {
                id: "pp1".to_string(),
                name: "Jamie Rivera".to_string(),
                date_of_birth: Some("1990-02-03".to_string()),
                relationship: Relationship::SelfInsured,
            }],
            date_added: Utc::now(),
        };
        h.db.insert_plan(&plan).await.expect("plan");
        h.controller
            .assign_plan("c8", Some("p1".to_string()), Some("pp1".to_string()))
            .await
            .expect("assign");
        let draft = h
            .controller
            .generate_email_draft("c8", None, DenialDetails::default())
            .await
            .expect("draft");
        assert!(draft.body.contains("Jamie Rivera"));

        h.db.delete_plan("p1").await.expect("delete");
        let followup_case = h.controller.get_case("c8").await.expect("case");
        assert_eq!(followup_case.plan_id.as_deref(), Some("p1"));
        h.controller.analyze_case("c8", None).await.expect("still analyzable");
    }

    #[tokio::test]
    async fn send_moves_case_to_awaiting_reply_and_records_thread() {
        let h = Harness::new();
        ready_case(&h, "c9").await;
        let receipt = h
            .controller
            .send_email(
                "c9",
                OutboundMessage {
                    to: "claims@insurer.example".to_string(),
                    subject: "Appeal".to_string(),
                    body: "Body".to_string(),
                    thread_id: None,
                },
            )
            .await
            .expect("send");
        assert_eq!(receipt.case.status, CaseStatus::AwaitingReply);
        assert_eq!(receipt.case.current_step, CaseStep::EmailSent);
        assert_eq!(receipt.case.email_thread.len(), 1);

        let record = h
            .db
            .find_email(&receipt.message_id)
            .await
            .expect("lookup")
            .expect("record");
        assert_eq!(record.case_id.as_deref(), Some("c9"));
        assert_eq!(record.thread_id, receipt.thread_id);
        let sent = h.transport.sent();
        assert!(sent[0].tags.contains(&"case-c9".to_string()));
    }

    #[tokio::test]
    async fn failed_send_leaves_case_untouched() {
        let h = Harness::new();
        let before = ready_case(&h, "c10").await;
        h.transport.fail_sends.store(true, Ordering::SeqCst);
        let err = h
            .controller
            .send_email(
                "c10",
                OutboundMessage {
                    to: "claims@insurer.example".to_string(),
                    subject: "Appeal".to_string(),
                    body: "Body".to_string(),
                    thread_id: None,
                },
            )
            .await
            .expect_err("send fails");
        assert!(matches!(err, CaseError::SendFailed(_)));
        assert_eq!(h.controller.get_case("c10").await.expect("case"), before);
    }

    #[tokio::test]
    async fn sending_before_denial_is_confirmed_is_rejected() {
        let h = Harness::new();
        h.controller
            .create_case(NewCase {
                id: Some("c11".to_string()),
                user_id: "u1".to_string(),
                ..NewCase::default()
            })
            .await
            .expect("create");
        let err = h
            .controller
            .send_email(
                "c11",
                OutboundMessage {
                    to: "claims@insurer.example".to_string(),
                    subject: "Appeal".to_string(),
                    body: "Body".to_string(),
                    thread_id: None,
                },
            )
            .await
            .expect_err("not sendable");
        assert!(matches!(err, CaseError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn reply_in_known_thread_advances_case_once() {
        let h = Harness::new();
        ready_case(&h, "c12").await;
        let receipt = h
            .controller
            .send_email(
                "c12",
                OutboundMessage {
                    to: "claims@insurer.example".to_string(),
                    subject: "Appeal".to_string(),
                    body: "Body".to_string(),
                    thread_id: None,
                },
            )
            .await
            .expect("send");

        let reply = crate::testing::reply("r1", &receipt.thread_id, "Denial upheld.\n\nOn Mon, Jan 5, 2026 at 9:00 AM Agent wrote:\n> Body");
        let outcome = h.controller.ingest_inbound(reply.clone()).await.expect("ingest");
        assert!(matches!(outcome, InboundOutcome::Linked { ref case_id, .. } if case_id == "c12"));

        let case = h.controller.get_case("c12").await.expect("case");
        assert_eq!(case.status, CaseStatus::ReplyReceived);
        assert_eq!(case.current_step, CaseStep::ReplyReceived);
        assert!(case.has_new_email);
        assert_eq!(case.email_thread.len(), 2);
        let received = case.last_received().expect("received");
        assert_eq!(received.body, "Denial upheld.");
        assert!(received.analysis.is_some());

        let again = h.controller.ingest_inbound(reply).await.expect("dup");
        assert!(matches!(again, InboundOutcome::Duplicate { .. }));
        assert_eq!(h.controller.get_case("c12").await.expect("case").email_thread.len(), 2);
    }

    async fn sent_case_over(store: Arc<crate::testing::FlakyStore>, id: &str) -> (Harness, String) {
        let h = Harness::with_database(AppealConfig::for_tests(), store);
        ready_case(&h, id).await;
        let receipt = h
            .controller
            .send_email(
                id,
                OutboundMessage {
                    to: "claims@insurer.example".to_string(),
                    subject: "Appeal".to_string(),
                    body: "Body".to_string(),
                    thread_id: None,
                },
            )
            .await
            .expect("send");
        (h, receipt.thread_id)
    }

    #[tokio::test]
    async fn reply_lost_to_a_store_error_is_applied_on_redelivery() {
        let store = Arc::new(crate::testing::FlakyStore::default());
        let (h, thread_id) = sent_case_over(Arc::clone(&store), "c12f").await;
        let reply = crate::testing::reply("r1", &thread_id, "Denial upheld.");

        store.fail_next_case_update();
        let err = h
            .controller
            .ingest_inbound(reply.clone())
            .await
            .expect_err("store failure surfaces");
        assert!(matches!(err, CaseError::Storage(_)));
        assert!(h.db.find_email("r1").await.expect("lookup").is_none());
        assert_eq!(h.controller.get_case("c12f").await.expect("case").email_thread.len(), 1);

        let outcome = h.controller.ingest_inbound(reply.clone()).await.expect("redelivery");
        assert!(matches!(outcome, InboundOutcome::Linked { ref case_id, .. } if case_id == "c12f"));
        let case = h.controller.get_case("c12f").await.expect("case");
        assert_eq!(case.email_thread.len(), 2);
        assert_eq!(case.status, CaseStatus::ReplyReceived);
        let record = h.db.find_email("r1").await.expect("lookup").expect("stored");
        assert_eq!(record.case_id.as_deref(), Some("c12f"));
        assert!(record.analysis.is_some());

        let again = h.controller.ingest_inbound(reply).await.expect("dup");
        assert!(matches!(again, InboundOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn redelivery_after_failed_record_write_does_not_repeat_the_reply() {
        let store = Arc::new(crate::testing::FlakyStore::default());
        let (h, thread_id) = sent_case_over(Arc::clone(&store), "c12g").await;
        let reply = crate::testing::reply("r2", &thread_id, "Please send records.");

        store.fail_next_email_insert();
        h.controller
            .ingest_inbound(reply.clone())
            .await
            .expect_err("record write fails");
        assert_eq!(h.controller.get_case("c12g").await.expect("case").email_thread.len(), 2);

        let outcome = h.controller.ingest_inbound(reply).await.expect("redelivery");
        assert!(matches!(outcome, InboundOutcome::Linked { .. }));
        let case = h.controller.get_case("c12g").await.expect("case");
        assert_eq!(case.email_thread.len(), 2);
        assert_eq!(
            case.email_thread.iter().filter(|m| m.id == "r2").count(),
            1
        );
        assert!(h.db.find_email("r2").await.expect("lookup").is_some());
    }

    #[tokio::test]
    async fn unmatched_reply_is_parked_without_touching_cases() {
        let h = Harness::new();
        let before = ready_case(&h, "c13").await;
        let outcome = h
            .controller
            .ingest_inbound(crate::testing::reply("r9", "unknown-thread", "Hello"))
            .await
            .expect("ingest");
        assert!(matches!(outcome, InboundOutcome::Parked { .. }));
        let record = h.db.find_email("r9").await.expect("lookup").expect("stored");
        assert!(record.case_id.is_none());
        assert_eq!(h.controller.get_case("c13").await.expect("case"), before);
    }

    #[tokio::test]
    async fn linked_reply_is_forwarded_to_owner() {
        let h = Harness::new();
        h.db.upsert_user(&UserRecord {
            id: "u1".to_string(),
            email: "owner@example.com".to_string(),
            first_name: Some("Sam".to_string()),
            last_name: None,
        })
        .await
        .expect("user");
        ready_case(&h, "c14").await;
        let receipt = h
            .controller
            .send_email(
                "c14",
                OutboundMessage {
                    to: "claims@insurer.example".to_string(),
                    subject: "Appeal".to_string(),
                    body: "Body".to_string(),
                    thread_id: None,
                },
            )
            .await
            .expect("send");
        h.controller
            .ingest_inbound(crate::testing::reply("r2", &receipt.thread_id, "Decision"))
            .await
            .expect("ingest");
        let sent = h.transport.sent();
        let forward = sent.last().expect("forward");
        assert_eq!(forward.to, "owner@example.com");
        assert!(forward.subject.starts_with("Fwd: "));
        assert!(forward.body.contains("---------- Forwarded message ----------"));
    }

    #[tokio::test]
    async fn followup_requires_a_reply_and_moves_to_review() {
        let h = Harness::new();
        ready_case(&h, "c15").await;
        let err = h.controller.generate_followup("c15").await.expect_err("no reply");
        assert!(matches!(err, CaseError::InvalidInput(_)));

        let receipt = h
            .controller
            .send_email(
                "c15",
                OutboundMessage {
                    to: "claims@insurer.example".to_string(),
                    subject: "Appeal for Claim Denial".to_string(),
                    body: "Body".to_string(),
                    thread_id: None,
                },
            )
            .await
            .expect("send");
        let mut reply = crate::testing::reply("r3", &receipt.thread_id, "Upheld");
        reply.subject = "RE: Appeal for Claim Denial".to_string();
        h.controller.ingest_inbound(reply).await.expect("ingest");

        let draft = h.controller.generate_followup("c15").await.expect("followup");
        assert_eq!(draft.subject, "RE: Appeal for Claim Denial");
        let case = h.controller.get_case("c15").await.expect("case");
        assert_eq!(case.current_step, CaseStep::FollowupReview);
    }

    #[tokio::test]
    async fn step_changes_respect_status_and_prerequisites() {
        let h = Harness::new();
        h.controller
            .create_case(NewCase {
                id: Some("c16".to_string()),
                user_id: "u1".to_string(),
                ..NewCase::default()
            })
            .await
            .expect("create");
        let err = h
            .controller
            .advance_step("c16", CaseStep::EmailReview)
            .await
            .expect_err("skips steps");
        assert!(matches!(err, CaseError::InvalidTransition { .. }));

        h.controller
            .upload_files("c16", vec![inline_file("a.pdf", b"x")])
            .await
            .expect("upload");
        let case = h
            .controller
            .advance_step("c16", CaseStep::DenialExtractedInfo)
            .await
            .expect("advance");
        assert_eq!(case.current_step, CaseStep::DenialExtractedInfo);
    }

    #[tokio::test]
    async fn resolve_keeps_lifecycle_fields() {
        let h = Harness::new();
        let before = ready_case(&h, "c17").await;
        let case = h
            .controller
            .resolve_case("c17", Some("Approved on appeal".to_string()))
            .await
            .expect("resolve");
        assert!(case.resolved);
        assert!(case.resolved_date.is_some());
        assert_eq!(case.feedback.as_deref(), Some("Approved on appeal"));
        assert_eq!(case.status, before.status);
        assert_eq!(case.current_step, before.current_step);
    }

    #[tokio::test]
    async fn delete_removes_stored_files_best_effort() {
        let h = Harness::new();
        h.controller
            .create_case(NewCase {
                id: Some("c18".to_string()),
                user_id: "u1".to_string(),
                ..NewCase::default()
            })
            .await
            .expect("create");
        let stored = h.store_denial_file("c18", "letter.pdf", b"pdf").await;
        h.controller
            .upload_files("c18", vec![stored, inline_file("inline.pdf", b"x")])
            .await
            .expect("upload");

        let report = h.controller.delete_case("c18").await.expect("delete");
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.files_failed, 0);
        assert!(matches!(
            h.controller.get_case("c18").await,
            Err(CaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn cache_write_after_delete_is_dropped_silently() {
        let h = Harness::new();
        ready_case(&h, "c19").await;
        let gate = h.analyzer.hold();
        let controller = Arc::clone(&h.controller);
        let in_flight = tokio::spawn(async move { controller.analyze_case("c19", None).await });
        gate.entered.notified().await;
        h.controller.delete_case("c19").await.expect("delete");
        gate.release.notify_one();
        assert!(in_flight.await.expect("join").is_ok());
        assert!(h.db.find_case("c19").await.expect("lookup").is_none());
    }
}
