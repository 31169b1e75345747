//! Thread correlation: which case does an inbound message belong to?
//!
//! No single signal is reliable, so the correlator walks an ordered chain
//! and takes the first hit:
//!
//! 1. a stored email record in the same provider thread already linked to a
//!    case ([`ThreadIndex`]),
//! 2. a `case-{id}` label or `case-{id}@` recipient on the message itself,
//! 3. the same label signal on earlier messages of the thread
//!    ([`LabelIndex`]),
//! 4. a user identity from the labels, narrowed to one of that user's open
//!    cases ([`UserCaseHeuristic`]).
//!
//! Anything else is parked: stored for audit, linked to nothing.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;

use crate::appeal::case::{Case, CaseStatus, MessageDirection, UserRecord};
use crate::appeal::policy;
use crate::channels::email::{EmailTransport, InboundEmail};
use crate::db::{CaseFilter, Database};
use crate::error::DatabaseError;

static QUOTE_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)On\s+.*,\s+.*at\s+.*wrote:",
        r"(?i)-----Original Message-----",
        r"_{30,}",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Cut the body at the earliest quoted-history marker.
pub fn strip_quoted_reply(body: &str) -> String {
    let cut = QUOTE_MARKERS
        .iter()
        .filter_map(|re| re.find(body).map(|m| m.start()))
        .min();
    match cut {
        Some(idx) => body[..idx].trim().to_string(),
        None => body.to_string(),
    }
}

/// Which link in the chain produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Thread,
    Label,
    ThreadHistory,
    OwnerHeuristic,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Label => "label",
            Self::ThreadHistory => "thread-history",
            Self::OwnerHeuristic => "owner-heuristic",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Correlation {
    Linked {
        case: Box<Case>,
        signal: Signal,
        /// User address found on the labels, if any.
        user_address: Option<String>,
    },
    Parked {
        user_address: Option<String>,
    },
}

impl Correlation {
    pub fn case(&self) -> Option<&Case> {
        match self {
            Self::Linked { case, .. } => Some(case),
            Self::Parked { .. } => None,
        }
    }

    pub fn user_address(&self) -> Option<&str> {
        match self {
            Self::Linked { user_address, .. } | Self::Parked { user_address } => {
                user_address.as_deref()
            }
        }
    }
}

/// What the labels and recipients of one message say.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSignal {
    pub case_id: Option<String>,
    pub user_address: Option<String>,
}

impl LabelSignal {
    pub fn read(email: &InboundEmail) -> Self {
        let case_id = email
            .labels
            .iter()
            .find_map(|l| policy::case_id_from_tag(l))
            .or_else(|| policy::case_id_from_address(&email.to));
        let user_address = email
            .labels
            .iter()
            .find(|l| policy::looks_like_address(l))
            .map(|l| policy::bare_address(l));
        Self {
            case_id,
            user_address,
        }
    }

    fn merge(&mut self, other: LabelSignal) {
        if self.case_id.is_none() {
            self.case_id = other.case_id;
        }
        if self.user_address.is_none() {
            self.user_address = other.user_address;
        }
    }
}

// ==================== Signal sources ====================

#[async_trait]
pub trait ThreadIndex: Send + Sync {
    /// Case already associated with `thread_id`, if any.
    async fn linked_case(&self, thread_id: &str) -> Result<Option<String>, DatabaseError>;
}

#[async_trait]
pub trait LabelIndex: Send + Sync {
    /// Earlier messages of the thread, each with its label names.
    async fn thread_history(&self, thread_id: &str) -> Vec<InboundEmail>;
}

#[async_trait]
pub trait UserCaseHeuristic: Send + Sync {
    /// Pick the one case of `user` the message most plausibly answers.
    async fn pick(
        &self,
        user: &UserRecord,
        email: &InboundEmail,
    ) -> Result<Option<Case>, DatabaseError>;
}

/// Thread index over the stored email records.
pub struct StoredThreads {
    db: Arc<dyn Database>,
}

impl StoredThreads {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ThreadIndex for StoredThreads {
    async fn linked_case(&self, thread_id: &str) -> Result<Option<String>, DatabaseError> {
        if thread_id.is_empty() {
            return Ok(None);
        }
        Ok(self
            .db
            .find_linked_email_in_thread(thread_id)
            .await?
            .and_then(|record| record.case_id))
    }
}

/// Label history read back from the mail provider.
pub struct TransportLabels {
    transport: Arc<dyn EmailTransport>,
}

impl TransportLabels {
    pub fn new(transport: Arc<dyn EmailTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl LabelIndex for TransportLabels {
    async fn thread_history(&self, thread_id: &str) -> Vec<InboundEmail> {
        if thread_id.is_empty() {
            return Vec::new();
        }
        match self.transport.thread_messages(thread_id).await {
            Ok(messages) => messages,
            Err(crate::error::TransportError::Unsupported(_)) => Vec::new(),
            Err(e) => {
                tracing::warn!(thread_id, "Could not read thread history: {}", e);
                Vec::new()
            }
        }
    }
}

/// Owner fallback: the user's open cases (awaiting or having received a
/// reply), newest first. One candidate wins outright; several must be
/// singled out by policy number or subject, otherwise nothing is picked.
pub struct RecentOpenCase {
    db: Arc<dyn Database>,
}

impl RecentOpenCase {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let lower = s.to_ascii_lowercase();
        let stripped = ["re:", "fwd:", "fw:", "aw:"]
            .iter()
            .find(|p| lower.starts_with(*p))
            .map(|p| s[p.len()..].trim_start());
        match stripped {
            Some(rest) => s = rest,
            None => break,
        }
    }
    s.to_lowercase()
}

fn mentions_policy(case: &Case, email: &InboundEmail) -> bool {
    case.parsed_data
        .as_ref()
        .map(|p| p.policy_number.trim())
        .filter(|n| n.len() >= 4)
        .is_some_and(|n| email.subject.contains(n) || email.body.contains(n))
}

fn shares_subject(case: &Case, email: &InboundEmail) -> bool {
    let inbound = normalize_subject(&email.subject);
    !inbound.is_empty()
        && case
            .email_thread
            .iter()
            .filter(|m| m.direction == MessageDirection::Sent)
            .any(|m| normalize_subject(&m.subject) == inbound)
}

fn single<'a>(cases: impl Iterator<Item = &'a Case>) -> Option<&'a Case> {
    let mut it = cases;
    let first = it.next()?;
    it.next().is_none().then_some(first)
}

#[async_trait]
impl UserCaseHeuristic for RecentOpenCase {
    async fn pick(
        &self,
        user: &UserRecord,
        email: &InboundEmail,
    ) -> Result<Option<Case>, DatabaseError> {
        let filter = CaseFilter::for_user(&user.id).with_statuses(&[
            CaseStatus::Sent,
            CaseStatus::AwaitingReply,
            CaseStatus::ReplyReceived,
        ]);
        let candidates: Vec<Case> = self
            .db
            .find_cases(&filter)
            .await?
            .into_iter()
            .filter(|c| !c.resolved)
            .collect();
        if candidates.len() <= 1 {
            return Ok(candidates.into_iter().next());
        }
        let picked = single(candidates.iter().filter(|c| mentions_policy(c, email)))
            .or_else(|| single(candidates.iter().filter(|c| shares_subject(c, email))));
        Ok(picked.cloned())
    }
}

// ==================== Correlator ====================

pub struct ThreadCorrelator {
    db: Arc<dyn Database>,
    threads: Arc<dyn ThreadIndex>,
    labels: Arc<dyn LabelIndex>,
    owner: Arc<dyn UserCaseHeuristic>,
}

impl ThreadCorrelator {
    pub fn new(
        db: Arc<dyn Database>,
        threads: Arc<dyn ThreadIndex>,
        labels: Arc<dyn LabelIndex>,
        owner: Arc<dyn UserCaseHeuristic>,
    ) -> Self {
        Self {
            db,
            threads,
            labels,
            owner,
        }
    }

    /// Default chain over the stored records and the given transport.
    pub fn standard(db: Arc<dyn Database>, transport: Arc<dyn EmailTransport>) -> Self {
        Self::new(
            Arc::clone(&db),
            Arc::new(StoredThreads::new(Arc::clone(&db))),
            Arc::new(TransportLabels::new(transport)),
            Arc::new(RecentOpenCase::new(db)),
        )
    }

    async fn existing(&self, case_id: &str) -> Result<Option<Case>, DatabaseError> {
        self.db.find_case(case_id).await
    }

    pub async fn correlate(&self, email: &InboundEmail) -> Result<Correlation, DatabaseError> {
        let mut signal = LabelSignal::read(email);

        if let Some(case_id) = self.threads.linked_case(&email.thread_id).await? {
            if let Some(case) = self.existing(&case_id).await? {
                return Ok(linked(case, Signal::Thread, signal.user_address));
            }
            tracing::debug!(case_id = %case_id, "Thread is linked to a case that no longer exists");
        }

        if let Some(case_id) = signal.case_id.clone() {
            if let Some(case) = self.existing(&case_id).await? {
                return Ok(linked(case, Signal::Label, signal.user_address));
            }
            tracing::debug!(case_id = %case_id, "Label names an unknown case");
        }

        for earlier in self
            .labels
            .thread_history(&email.thread_id)
            .await
            .into_iter()
            .filter(|m| m.message_id != email.message_id)
        {
            let found = LabelSignal::read(&earlier);
            if let Some(case_id) = &found.case_id
                && let Some(case) = self.existing(case_id).await?
            {
                signal.merge(found);
                return Ok(linked(case, Signal::ThreadHistory, signal.user_address));
            }
            signal.merge(found);
        }

        if let Some(address) = signal.user_address.as_deref() {
            match self.db.find_user_by_email(address).await? {
                Some(user) => {
                    if let Some(case) = self.owner.pick(&user, email).await? {
                        return Ok(linked(case, Signal::OwnerHeuristic, signal.user_address));
                    }
                    tracing::info!(user_id = %user.id, "Owner has no single matching open case");
                }
                None => tracing::debug!(address, "Label address matches no user"),
            }
        }

        Ok(Correlation::Parked {
            user_address: signal.user_address,
        })
    }
}

fn linked(case: Case, signal: Signal, user_address: Option<String>) -> Correlation {
    Correlation::Linked {
        case: Box::new(case),
        signal,
        user_address,
    }
}
