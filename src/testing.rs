//! Deterministic stand-ins for every external collaborator, plus a harness
//! wiring them into a controller over the in-memory store.
//!
//! Used by the unit tests and by the HTTP integration tests under `tests/`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Notify;

use crate::appeal::case::{
    Case, CaseAnalysis, FileRef, InsurancePlan, ReplyAnalysis, TermDefinition, UserRecord,
};
use crate::appeal::controller::{CaseController, ControllerParts, MailIdentity};
use crate::appeal::plans::PlanService;
use crate::appeal::policy;
use crate::channels::email::{EmailTransport, InboundEmail, OutboundEmail, SentEmail};
use crate::config::AppealConfig;
use crate::db::memory::MemoryBackend;
use crate::db::{
    CaseCondition, CaseFilter, CaseStore, CaseUpdate, Database, EmailRecord, EmailStore,
    PlanStore, UserStore,
};
use crate::error::{DatabaseError, ServiceError, StorageError, TransportError};
use crate::services::{
    ArgumentRequest, CaseAnalyzer, DenialFacts, DocumentExtractor, FileStorage, FollowupRequest,
    PlanFacts, StagedDocuments, StoredObject,
};

/// Argument paragraph every fake appeal draft contains.
pub const FAKE_ARGUMENT: &str =
    "The requested treatment meets every medical necessity criterion in the plan documents.";
/// Argument paragraph every fake follow-up contains.
pub const FAKE_FOLLOWUP_ARGUMENT: &str =
    "Your reply does not address the clinical evidence submitted with the original appeal.";

pub const DENIAL_BUCKET: &str = "denial-files";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Pauses one fake call: the call signals `entered` and waits for `release`.
#[derive(Debug, Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

#[derive(Debug, Default)]
struct GateSlot(Mutex<Option<Arc<Gate>>>);

impl GateSlot {
    fn arm(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *lock(&self.0) = Some(Arc::clone(&gate));
        gate
    }

    async fn pass(&self) {
        let gate = lock(&self.0).take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }
}

fn fake_failure(endpoint: &str) -> ServiceError {
    ServiceError::Remote {
        endpoint: endpoint.to_string(),
        message: "simulated outage".to_string(),
    }
}

// ==================== Extraction ====================

#[derive(Debug, Default)]
pub struct FakeExtractor {
    pub denial_calls: AtomicUsize,
    pub plan_calls: AtomicUsize,
    pub fail: AtomicBool,
    gate: GateSlot,
}

impl FakeExtractor {
    /// Pause the next extraction call until released.
    pub fn hold(&self) -> Arc<Gate> {
        self.gate.arm()
    }
}

#[async_trait]
impl DocumentExtractor for FakeExtractor {
    async fn extract_denial(&self, docs: &StagedDocuments) -> Result<DenialFacts, ServiceError> {
        self.denial_calls.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;
        if self.fail.load(Ordering::SeqCst) {
            return Err(fake_failure("extract-denial"));
        }
        Ok(DenialFacts {
            brief_description: format!(
                "MRI denied as not medically necessary ({} document(s))",
                docs.documents().len()
            ),
            denial_date: Some("2026-01-15".to_string()),
            procedure_name: Some("Lumbar MRI".to_string()),
        })
    }

    async fn extract_plan(&self, _docs: &StagedDocuments) -> Result<PlanFacts, ServiceError> {
        self.plan_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(fake_failure("extract-plan"));
        }
        Ok(PlanFacts {
            insurance_company: "Acme Health".to_string(),
            plan_name: "Gold PPO".to_string(),
            policy_number: "POL-12345".to_string(),
            group_number: Some("GRP-9".to_string()),
        })
    }
}

// ==================== Analysis ====================

#[derive(Debug, Default)]
pub struct FakeAnalyzer {
    pub analyze_calls: AtomicUsize,
    pub draft_calls: AtomicUsize,
    pub reply_calls: AtomicUsize,
    pub followup_calls: AtomicUsize,
    pub fail: AtomicBool,
    gate: GateSlot,
}

impl FakeAnalyzer {
    /// Pause the next `analyze` call until released.
    pub fn hold(&self) -> Arc<Gate> {
        self.gate.arm()
    }

    fn check(&self, endpoint: &str) -> Result<(), ServiceError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(fake_failure(endpoint))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CaseAnalyzer for FakeAnalyzer {
    async fn analyze(
        &self,
        denial_reason: &str,
        policy_context: &str,
    ) -> Result<CaseAnalysis, ServiceError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        self.gate.pass().await;
        self.check("analyze-case")?;
        Ok(CaseAnalysis {
            analysis: format!("Contest the denial: {denial_reason}"),
            terms: vec![TermDefinition {
                term: "Medical necessity".to_string(),
                definition: "Care a prudent clinician would provide.".to_string(),
            }],
            context_used: policy_context.lines().map(str::to_string).collect(),
        })
    }

    async fn draft_appeal_argument(
        &self,
        _request: &ArgumentRequest<'_>,
    ) -> Result<String, ServiceError> {
        self.draft_calls.fetch_add(1, Ordering::SeqCst);
        self.check("generate-email")?;
        Ok(format!("Dear Claims Reviewer,\n\n{FAKE_ARGUMENT}\n\nSincerely,\nAI"))
    }

    async fn analyze_reply(
        &self,
        _reply_body: &str,
        _thread_history: &str,
    ) -> Result<ReplyAnalysis, ServiceError> {
        self.reply_calls.fetch_add(1, Ordering::SeqCst);
        self.check("analyze-reply")?;
        Ok(ReplyAnalysis {
            summary: "The insurer upheld the denial.".to_string(),
            weaknesses: vec!["No clinical rationale cited".to_string()],
            terms: Vec::new(),
            action_items: vec!["Request the clinical criteria used".to_string()],
        })
    }

    async fn draft_followup_argument(
        &self,
        _request: &FollowupRequest<'_>,
    ) -> Result<String, ServiceError> {
        self.followup_calls.fetch_add(1, Ordering::SeqCst);
        self.check("generate-followup")?;
        Ok(FAKE_FOLLOWUP_ARGUMENT.to_string())
    }
}

// ==================== Transport ====================

/// Records sends and serves a scripted inbox. Message ids are `m{n}`,
/// fresh threads `t{n}`.
#[derive(Debug, Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<OutboundEmail>>,
    counter: AtomicUsize,
    pub fail_sends: AtomicBool,
    inbox: Mutex<Vec<InboundEmail>>,
    read: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn sent(&self) -> Vec<OutboundEmail> {
        lock(&self.sent).clone()
    }

    /// Put a message into the unread inbox.
    pub fn deliver(&self, email: InboundEmail) {
        lock(&self.inbox).push(email);
    }

    pub fn read_ids(&self) -> Vec<String> {
        lock(&self.read).clone()
    }
}

#[async_trait]
impl EmailTransport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Api {
                status: 503,
                message: "simulated outage".to_string(),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.sent).push(email.clone());
        Ok(SentEmail {
            message_id: format!("m{n}"),
            thread_id: email
                .thread_id
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| format!("t{n}")),
            label_ids: email.tags.clone(),
            message_id_header: Some(format!("<m{n}@fake.test>")),
        })
    }

    async fn list_unread(&self) -> Result<Vec<String>, TransportError> {
        let read = lock(&self.read).clone();
        Ok(lock(&self.inbox)
            .iter()
            .map(|m| m.message_id.clone())
            .filter(|id| !read.contains(id))
            .collect())
    }

    async fn get(&self, message_id: &str) -> Result<InboundEmail, TransportError> {
        lock(&self.inbox)
            .iter()
            .find(|m| m.message_id == message_id)
            .cloned()
            .ok_or_else(|| TransportError::Api {
                status: 404,
                message: format!("no message {message_id}"),
            })
    }

    async fn thread_messages(&self, thread_id: &str) -> Result<Vec<InboundEmail>, TransportError> {
        Ok(lock(&self.inbox)
            .iter()
            .filter(|m| m.thread_id == thread_id)
            .cloned()
            .collect())
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), TransportError> {
        lock(&self.read).push(message_id.to_string());
        Ok(())
    }
}

// ==================== Storage ====================

#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<(String, String), Bytes>>,
    pub fail_removals: AtomicBool,
}

impl MemoryStorage {
    pub fn contains(&self, bucket: &str, path: &str) -> bool {
        lock(&self.objects).contains_key(&(bucket.to_string(), path.to_string()))
    }
}

#[async_trait]
impl FileStorage for MemoryStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        lock(&self.objects).insert((bucket.to_string(), path.to_string()), bytes);
        Ok(StoredObject {
            bucket: bucket.to_string(),
            path: path.to_string(),
        })
    }

    async fn download(&self, bucket: &str, path: &str) -> Result<Bytes, StorageError> {
        lock(&self.objects)
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            })
    }

    async fn signed_url(
        &self,
        bucket: &str,
        path: &str,
        ttl: Duration,
    ) -> Result<String, StorageError> {
        if !self.contains(bucket, path) {
            return Err(StorageError::NotFound {
                bucket: bucket.to_string(),
                path: path.to_string(),
            });
        }
        Ok(format!("memory://{bucket}/{path}?expires_in={}", ttl.as_secs()))
    }

    async fn remove(&self, bucket: &str, paths: &[String]) -> Result<(), StorageError> {
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(StorageError::Request("simulated outage".to_string()));
        }
        let mut objects = lock(&self.objects);
        for path in paths {
            objects.remove(&(bucket.to_string(), path.clone()));
        }
        Ok(())
    }
}

// ==================== Builders ====================

pub fn inline_file(name: &str, data: &[u8]) -> FileRef {
    FileRef {
        name: name.to_string(),
        size: data.len() as u64,
        content_type: "application/pdf".to_string(),
        last_modified: None,
        bucket: None,
        path: None,
        data: Some(data.to_vec()),
    }
}

/// Insurer reply in `thread_id`.
pub fn reply(message_id: &str, thread_id: &str, body: &str) -> InboundEmail {
    InboundEmail {
        message_id: message_id.to_string(),
        thread_id: thread_id.to_string(),
        message_id_header: Some(format!("<{message_id}@insurer.example>")),
        from: "Claims <claims@insurer.example>".to_string(),
        to: "agent@policypilot.test".to_string(),
        subject: "Re: Appeal for Claim Denial".to_string(),
        body: body.to_string(),
        date: Utc::now(),
        labels: vec!["INBOX".to_string(), "UNREAD".to_string()],
    }
}

/// In-memory store that can fail the next case update or the next email
/// insert, once each.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryBackend,
    fail_case_update: AtomicBool,
    fail_email_insert: AtomicBool,
}

impl FlakyStore {
    pub fn fail_next_case_update(&self) {
        self.fail_case_update.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_email_insert(&self) {
        self.fail_email_insert.store(true, Ordering::SeqCst);
    }

    fn injected(flag: &AtomicBool, what: &str) -> Result<(), DatabaseError> {
        if flag.swap(false, Ordering::SeqCst) {
            return Err(DatabaseError::Query(format!("injected {what} failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl CaseStore for FlakyStore {
    async fn find_cases(&self, filter: &CaseFilter) -> Result<Vec<Case>, DatabaseError> {
        self.inner.find_cases(filter).await
    }

    async fn find_case(&self, id: &str) -> Result<Option<Case>, DatabaseError> {
        self.inner.find_case(id).await
    }

    async fn insert_case(&self, case: &Case) -> Result<Case, DatabaseError> {
        self.inner.insert_case(case).await
    }

    async fn find_case_and_update(
        &self,
        id: &str,
        condition: &CaseCondition,
        update: &CaseUpdate,
    ) -> Result<Option<Case>, DatabaseError> {
        Self::injected(&self.fail_case_update, "case update")?;
        self.inner.find_case_and_update(id, condition, update).await
    }

    async fn find_case_and_delete(&self, id: &str) -> Result<Option<Case>, DatabaseError> {
        self.inner.find_case_and_delete(id).await
    }
}

#[async_trait]
impl EmailStore for FlakyStore {
    async fn insert_email(&self, record: &EmailRecord) -> Result<bool, DatabaseError> {
        Self::injected(&self.fail_email_insert, "email insert")?;
        self.inner.insert_email(record).await
    }

    async fn find_email(&self, message_id: &str) -> Result<Option<EmailRecord>, DatabaseError> {
        self.inner.find_email(message_id).await
    }

    async fn find_linked_email_in_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<EmailRecord>, DatabaseError> {
        self.inner.find_linked_email_in_thread(thread_id).await
    }
}

#[async_trait]
impl PlanStore for FlakyStore {
    async fn insert_plan(&self, plan: &InsurancePlan) -> Result<InsurancePlan, DatabaseError> {
        self.inner.insert_plan(plan).await
    }

    async fn list_plans(&self, user_id: &str) -> Result<Vec<InsurancePlan>, DatabaseError> {
        self.inner.list_plans(user_id).await
    }

    async fn get_plan(&self, id: &str) -> Result<Option<InsurancePlan>, DatabaseError> {
        self.inner.get_plan(id).await
    }

    async fn replace_plan(
        &self,
        plan: &InsurancePlan,
    ) -> Result<Option<InsurancePlan>, DatabaseError> {
        self.inner.replace_plan(plan).await
    }

    async fn delete_plan(&self, id: &str) -> Result<bool, DatabaseError> {
        self.inner.delete_plan(id).await
    }
}

#[async_trait]
impl UserStore for FlakyStore {
    async fn upsert_user(&self, user: &UserRecord) -> Result<UserRecord, DatabaseError> {
        self.inner.upsert_user(user).await
    }

    async fn get_user(&self, id: &str) -> Result<Option<UserRecord>, DatabaseError> {
        self.inner.get_user(id).await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<UserRecord>, DatabaseError> {
        self.inner.find_user_by_email(email).await
    }
}

#[async_trait]
impl Database for FlakyStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }
}

/// Controller and plan service over the in-memory store and the fakes.
pub struct Harness {
    pub db: Arc<dyn Database>,
    pub controller: Arc<CaseController>,
    pub plans: Arc<PlanService>,
    pub extractor: Arc<FakeExtractor>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub transport: Arc<FakeTransport>,
    pub storage: Arc<MemoryStorage>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AppealConfig::for_tests())
    }

    pub fn with_config(appeal: AppealConfig) -> Self {
        Self::with_database(appeal, Arc::new(MemoryBackend::new()))
    }

    /// Harness over a caller-supplied store, for fault injection.
    pub fn with_database(appeal: AppealConfig, db: Arc<dyn Database>) -> Self {
        let extractor = Arc::new(FakeExtractor::default());
        let analyzer = Arc::new(FakeAnalyzer::default());
        let transport = Arc::new(FakeTransport::default());
        let storage = Arc::new(MemoryStorage::default());
        let controller = Arc::new(CaseController::new(ControllerParts {
            db: Arc::clone(&db),
            extractor: extractor.clone(),
            analyzer: analyzer.clone(),
            storage: storage.clone(),
            transport: transport.clone(),
            appeal,
            mail: MailIdentity {
                agent_address: Some("agent@policypilot.test".to_string()),
                inbound_domain: Some("in.policypilot.test".to_string()),
            },
            denial_bucket: DENIAL_BUCKET.to_string(),
            signed_url_ttl: Duration::from_secs(600),
        }));
        let plans = Arc::new(PlanService::new(
            Arc::clone(&db),
            extractor.clone(),
            storage.clone(),
        ));
        Self {
            db,
            controller,
            plans,
            extractor,
            analyzer,
            transport,
            storage,
        }
    }

    /// Upload bytes to the denial bucket and return a reference to them.
    pub async fn store_denial_file(&self, case_id: &str, name: &str, data: &[u8]) -> FileRef {
        let path = policy::storage_path(case_id, name);
        let stored = self
            .storage
            .upload(
                DENIAL_BUCKET,
                &path,
                Bytes::copy_from_slice(data),
                "application/pdf",
            )
            .await
            .unwrap_or_else(|e| panic!("memory upload cannot fail: {e}"));
        FileRef {
            name: name.to_string(),
            size: data.len() as u64,
            content_type: "application/pdf".to_string(),
            last_modified: None,
            bucket: Some(stored.bucket),
            path: Some(stored.path),
            data: None,
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
