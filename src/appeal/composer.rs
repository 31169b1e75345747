//! Draft composer: wraps AI-written argument paragraphs in a fixed letter.
//!
//! The analysis service only ever supplies the argument. Subject, header
//! block, salutation and signature come from the templates below, and every
//! unknown fact renders as a bracketed placeholder so a human can spot it.

use tera::Context;

use crate::appeal::case::{
    Case, EmailDraft, EmailMessage, InsurancePlan, MessageDirection, UserRecord,
};

pub const PATIENT_NAME_PLACEHOLDER: &str = "[PATIENT NAME]";
pub const DATE_OF_BIRTH_PLACEHOLDER: &str = "[DATE OF BIRTH]";
pub const POLICY_NUMBER_PLACEHOLDER: &str = "[POLICY NUMBER]";
pub const DENIAL_DATE_PLACEHOLDER: &str = "[Date of Denial Letter]";
pub const PROCEDURE_PLACEHOLDER: &str = "[PROCEDURE NAME]";
pub const INSURER_PLACEHOLDER: &str = "[INSURANCE COMPANY]";
pub const SENDER_PLACEHOLDER: &str = "[YOUR NAME]";

const DEFAULT_FOLLOWUP_SUBJECT: &str = "Re: Appeal for Claim Denial";

const APPEAL_SUBJECT: &str = "Appeal for Claim Denial - {{ sender_name }} - Policy #{{ policy_number }}";

const APPEAL_BODY: &str = "\
RE: Appeal of Claim Denial
Patient Name: {{ patient_name }}
Date of Birth: {{ date_of_birth }}
Policy Number: {{ policy_number }}
Date of Denial Letter: {{ denial_date }}
Procedure/Service: {{ procedure_name }}

Dear {{ insurer }} Claims Department,

{{ argument }}

Please confirm receipt of this appeal and advise if any additional information is needed to complete your review.

Sincerely,
{{ sender_name }}";

const FOLLOWUP_BODY: &str = "\
RE: Follow-up on Appeal of Claim Denial
Patient Name: {{ patient_name }}
Policy Number: {{ policy_number }}

Dear {{ insurer }} Claims Department,

{{ argument }}

Sincerely,
{{ sender_name }}";

/// Facts the letter templates draw on. `None` renders as a placeholder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LetterFacts {
    pub patient_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub policy_number: Option<String>,
    pub insurer: Option<String>,
    pub sender_name: Option<String>,
    pub denial_date: Option<String>,
    pub procedure_name: Option<String>,
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl LetterFacts {
    /// Gather facts from the case, its plan (if it still exists) and the
    /// owning user. Confirmed denial facts win over plan data; the denial
    /// date and procedure come from the cached extraction, if any.
    pub fn gather(case: &Case, plan: Option<&InsurancePlan>, user: Option<&UserRecord>) -> Self {
        let parsed = case.parsed_data.as_ref();
        let person = plan.and_then(|p| {
            case.covered_person_id
                .as_deref()
                .and_then(|id| p.covered_person(id))
        });
        let sender_name = user.and_then(UserRecord::display_name);
        let extracted = case.denial_facts.as_ref();
        Self {
            patient_name: non_blank(person.map(|p| p.name.as_str())),
            date_of_birth: non_blank(person.and_then(|p| p.date_of_birth.as_deref())),
            policy_number: non_blank(parsed.map(|p| p.policy_number.as_str()))
                .or_else(|| non_blank(plan.map(|p| p.policy_number.as_str()))),
            insurer: non_blank(parsed.map(|p| p.insurer.as_str()))
                .or_else(|| non_blank(plan.map(|p| p.insurance_company.as_str()))),
            sender_name,
            denial_date: non_blank(extracted.and_then(|f| f.denial_date.as_deref())),
            procedure_name: non_blank(extracted.and_then(|f| f.procedure_name.as_deref())),
        }
    }

    pub fn with_denial_details(
        mut self,
        denial_date: Option<&str>,
        procedure_name: Option<&str>,
    ) -> Self {
        self.denial_date = non_blank(denial_date).or(self.denial_date);
        self.procedure_name = non_blank(procedure_name).or(self.procedure_name);
        self
    }

    fn context(&self, argument: &str) -> serde_json::Value {
        let or = |value: &Option<String>, placeholder: &str| {
            value.clone().unwrap_or_else(|| placeholder.to_string())
        };
        serde_json::json!({
            "patient_name": or(&self.patient_name, PATIENT_NAME_PLACEHOLDER),
            "date_of_birth": or(&self.date_of_birth, DATE_OF_BIRTH_PLACEHOLDER),
            "policy_number": or(&self.policy_number, POLICY_NUMBER_PLACEHOLDER),
            "insurer": or(&self.insurer, INSURER_PLACEHOLDER),
            "sender_name": or(&self.sender_name, SENDER_PLACEHOLDER),
            "denial_date": or(&self.denial_date, DENIAL_DATE_PLACEHOLDER),
            "procedure_name": or(&self.procedure_name, PROCEDURE_PLACEHOLDER),
            "argument": argument,
        })
    }
}

pub fn render_template(body: &str, context: &serde_json::Value) -> Result<String, String> {
    let map = context
        .as_object()
        .ok_or_else(|| "template context must be a JSON object at the root".to_string())?;
    let mut tera_context = Context::new();
    for (key, value) in map {
        tera_context.insert(key, value);
    }

    tera::Tera::one_off(body, &tera_context, false)
        .map_err(|err| format!("failed to render template: {}", err))
}

fn is_salutation(line: &str) -> bool {
    let lower = line.trim().to_ascii_lowercase();
    lower.starts_with("dear ") || lower.starts_with("subject:") || lower.starts_with("to whom")
}

fn is_closing(line: &str) -> bool {
    let lower = line.trim().trim_end_matches(',').to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "sincerely" | "regards" | "best regards" | "kind regards" | "respectfully" | "thank you"
    )
}

/// Argument paragraphs from free-form model output: any salutation the model
/// wrote before the first paragraph and any sign-off it appended are dropped,
/// everything between is kept verbatim.
pub fn argument_paragraphs(raw: &str) -> String {
    let lines: Vec<&str> = raw.trim().lines().collect();
    let mut start = 0;
    while start < lines.len() && (is_salutation(lines[start]) || lines[start].trim().is_empty()) {
        start += 1;
    }
    let end = lines[start..]
        .iter()
        .rposition(|line| is_closing(line))
        .map(|pos| start + pos)
        .unwrap_or(lines.len());
    lines[start..end].join("\n").trim().to_string()
}

/// Assemble the initial appeal letter. The subject is never taken from
/// model output.
pub fn compose_appeal(facts: &LetterFacts, argument: &str) -> Result<EmailDraft, String> {
    let context = facts.context(&argument_paragraphs(argument));
    Ok(EmailDraft {
        subject: render_template(APPEAL_SUBJECT, &context)?,
        body: render_template(APPEAL_BODY, &context)?,
    })
}

/// `Re:` subject for a reply, without stacking prefixes.
pub fn followup_subject(last_subject: Option<&str>) -> String {
    match last_subject.map(str::trim).filter(|s| !s.is_empty()) {
        None => DEFAULT_FOLLOWUP_SUBJECT.to_string(),
        Some(subject)
            if subject
                .get(..3)
                .is_some_and(|prefix| prefix.eq_ignore_ascii_case("re:")) =>
        {
            subject.to_string()
        }
        Some(subject) => format!("Re: {subject}"),
    }
}

/// Assemble a follow-up letter answering the latest insurer reply.
pub fn compose_followup(
    facts: &LetterFacts,
    argument: &str,
    last_subject: Option<&str>,
) -> Result<EmailDraft, String> {
    let context = facts.context(&argument_paragraphs(argument));
    Ok(EmailDraft {
        subject: followup_subject(last_subject),
        body: render_template(FOLLOWUP_BODY, &context)?,
    })
}

/// Thread history as analysis input: one block per message, reply analysis
/// included where present.
pub fn format_thread_history(thread: &[EmailMessage]) -> String {
    thread
        .iter()
        .map(|message| {
            let kind = match message.direction {
                MessageDirection::Sent => "SENT",
                MessageDirection::Received => "RECEIVED",
            };
            let mut block = format!(
                "[{kind}] {}\nFrom: {}\nTo: {}\nSubject: {}\n\n{}",
                message.date.to_rfc3339(),
                message.from,
                message.to,
                message.subject,
                message.body.trim()
            );
            if let Some(analysis) = &message.analysis {
                block.push_str("\n\nAnalysis:\n");
                block.push_str(&analysis.summary);
                for weakness in &analysis.weaknesses {
                    block.push_str("\n- Weakness: ");
                    block.push_str(weakness);
                }
                for item in &analysis.action_items {
                    block.push_str("\n- Action: ");
                    block.push_str(item);
                }
            }
            block
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
