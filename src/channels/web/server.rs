//! Axum HTTP server for the appeal API.
//!
//! Handles case lifecycle, plan, user, file and inbound-mail routes.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderValue, Method, StatusCode, header},
    routing::{get, post},
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tower::ServiceBuilder;
use tower_http::cors::{AllowHeaders, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::appeal::case::{Case, CaseAnalysis, EmailDraft, FileRef, InsurancePlan, UserRecord};
use crate::appeal::controller::{CaseController, DeleteReport, InboundOutcome, SendReceipt};
use crate::appeal::plans::PlanService;
use crate::channels::email::inbound;
use crate::channels::web::types::*;
use crate::error::{CaseError, ChannelError};
use crate::services::{DenialFacts, PlanFacts};

type ApiError = (StatusCode, String);

/// Shared state for all handlers.
pub struct GatewayState {
    pub controller: Arc<CaseController>,
    pub plans: Arc<PlanService>,
    /// Request body cap; multipart uploads count against it.
    pub max_body_bytes: usize,
    shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
}

impl GatewayState {
    pub fn new(
        controller: Arc<CaseController>,
        plans: Arc<PlanService>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            controller,
            plans,
            max_body_bytes,
            shutdown_tx: tokio::sync::RwLock::new(None),
        }
    }

    /// Stop accepting connections and let in-flight requests finish.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

/// Start the HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0).
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
) -> Result<SocketAddr, ChannelError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to bind to {}: {}", addr, e),
        })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ChannelError::StartupFailed {
            name: "gateway".to_string(),
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let cases = Router::new()
        .route("/api/cases", get(cases_list_handler).post(cases_create_handler))
        .route(
            "/api/cases/{id}",
            get(cases_get_handler).delete(cases_delete_handler),
        )
        .route("/api/cases/{id}/files", post(cases_files_handler))
        .route("/api/cases/{id}/files/upload", post(cases_upload_handler))
        .route("/api/cases/{id}/extract-denial", post(cases_extract_handler))
        .route("/api/cases/{id}/denial-info", post(cases_denial_info_handler))
        .route("/api/cases/{id}/analyze", post(cases_analyze_handler))
        .route("/api/cases/{id}/generate-email", post(cases_generate_email_handler))
        .route(
            "/api/cases/{id}/generate-followup",
            post(cases_generate_followup_handler),
        )
        .route("/api/cases/{id}/send", post(cases_send_handler))
        .route("/api/cases/{id}/step", post(cases_step_handler))
        .route("/api/cases/{id}/plan", post(cases_plan_handler))
        .route("/api/cases/{id}/read", post(cases_read_handler))
        .route("/api/cases/{id}/resolve", post(cases_resolve_handler));

    let plans = Router::new()
        .route("/api/plans", get(plans_list_handler).post(plans_create_handler))
        .route("/api/plans/extract", post(plans_extract_handler))
        .route(
            "/api/plans/{id}",
            get(plans_get_handler)
                .put(plans_update_handler)
                .delete(plans_delete_handler),
        )
        .route("/api/users", post(users_create_handler))
        .route("/api/users/{id}", get(users_get_handler))
        .route("/api/files/signed-url", post(files_signed_url_handler));

    let mail = Router::new()
        .route("/api/inbound", post(inbound_handler))
        .route("/api/gmail/webhook", post(gmail_webhook_handler))
        .route("/api/gmail/sync", post(gmail_sync_handler));

    // Browser clients are served from the same host during development.
    let origins: Vec<HeaderValue> = [
        format!("http://{}:{}", addr.ip(), addr.port()),
        format!("http://localhost:{}", addr.port()),
        "http://localhost:3000".to_string(),
    ]
    .iter()
    .filter_map(|origin| origin.parse().ok())
    .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]));

    let app = Router::new()
        .route("/api/health", get(health_handler))
        .merge(cases)
        .merge(plans)
        .merge(mail)
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::X_CONTENT_TYPE_OPTIONS,
                    HeaderValue::from_static("nosniff"),
                ))
                .layer(SetResponseHeaderLayer::if_not_present(
                    header::X_FRAME_OPTIONS,
                    HeaderValue::from_static("DENY"),
                )),
        )
        .with_state(Arc::clone(&state));

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("HTTP gateway shutting down");
            })
            .await
        {
            tracing::error!("HTTP gateway server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "HTTP gateway listening");
    Ok(bound_addr)
}

// --- Plumbing ---

fn error_response(err: CaseError) -> ApiError {
    let status = match &err {
        CaseError::NotFound { .. } => StatusCode::NOT_FOUND,
        CaseError::ExtractionFailed(_)
        | CaseError::AnalysisFailed(_)
        | CaseError::SendFailed(_) => StatusCode::BAD_GATEWAY,
        CaseError::InvalidTransition { .. } => StatusCode::CONFLICT,
        CaseError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        CaseError::Storage(_) | CaseError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed: {}", err);
    }
    (status, err.to_string())
}

/// Run a controller call on its own task. A client that disconnects drops
/// the handler future, not the computation whose result gets cached.
async fn detached<T, F>(fut: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, CaseError>> + Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| {
            tracing::error!("Request task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "request task failed".to_string())
        })?
        .map_err(error_response)
}

/// Parse an optional JSON body; an empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")))
}

/// File name reduced to its basename with a conservative character set.
fn safe_file_name(raw: &str) -> String {
    let name: String = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let name = name.trim();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        "document".to_string()
    } else {
        name.to_string()
    }
}

// --- Health ---

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "policypilot",
    })
}

// --- Case handlers ---

async fn cases_list_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ListCasesQuery>,
) -> Result<Json<CaseListResponse>, ApiError> {
    let cases = state
        .controller
        .list_cases(query.user_id.as_deref())
        .await
        .map_err(error_response)?;
    Ok(Json(CaseListResponse { cases }))
}

async fn cases_create_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CreateCaseRequest>,
) -> Result<(StatusCode, Json<Case>), ApiError> {
    let case = state
        .controller
        .create_case(req.into())
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(case)))
}

async fn cases_get_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<Case>, ApiError> {
    state
        .controller
        .get_case(&id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn cases_delete_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<DeleteReport>, ApiError> {
    let controller = Arc::clone(&state.controller);
    let report = detached(async move { controller.delete_case(&id).await }).await?;
    Ok(Json(report))
}

async fn cases_files_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<UploadFilesRequest>,
) -> Result<Json<Case>, ApiError> {
    let controller = Arc::clone(&state.controller);
    let case = detached(async move { controller.upload_files(&id, req.files).await }).await?;
    Ok(Json(case))
}

/// Multipart upload: every file part is stored inline on the case.
async fn cases_upload_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<Case>, ApiError> {
    let mut files: Vec<FileRef> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            format!("Multipart read error: {e}"),
        )
    })? {
        let Some(raw_name) = field.file_name().map(str::to_string) else {
            // Plain form fields carry nothing we store.
            continue;
        };
        let name = safe_file_name(&raw_name);
        let content_type = field
            .content_type()
            .map(str::to_string)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| mime_guess::from_path(&name).first_or_octet_stream().to_string());
        let data = field.bytes().await.map_err(|e| {
            (
                StatusCode::BAD_REQUEST,
                format!("Failed to read upload body: {e}"),
            )
        })?;
        files.push(FileRef {
            name,
            size: data.len() as u64,
            content_type,
            last_modified: Some(chrono::Utc::now().timestamp_millis()),
            bucket: None,
            path: None,
            data: Some(data.to_vec()),
        });
    }

    let controller = Arc::clone(&state.controller);
    let case = detached(async move { controller.upload_files(&id, files).await }).await?;
    Ok(Json(case))
}

async fn cases_extract_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<DenialFacts>, ApiError> {
    let controller = Arc::clone(&state.controller);
    let facts = detached(async move { controller.extract_denial_info(&id).await }).await?;
    Ok(Json(facts))
}

async fn cases_denial_info_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<SaveDenialInfoRequest>,
) -> Result<Json<Case>, ApiError> {
    state
        .controller
        .save_denial_info(&id, req.parsed_data, req.files_version)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn cases_analyze_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<CaseAnalysis>, ApiError> {
    let req: CaseActionRequest = optional_body(&body)?;
    let controller = Arc::clone(&state.controller);
    let analysis = detached(async move {
        controller
            .analyze_case(&id, req.user_id.as_deref())
            .await
    })
    .await?;
    Ok(Json(analysis))
}

async fn cases_generate_email_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<EmailDraft>, ApiError> {
    let req: GenerateEmailRequest = optional_body(&body)?;
    let controller = Arc::clone(&state.controller);
    let draft = detached(async move {
        controller
            .generate_email_draft(&id, req.user_id.as_deref(), req.details())
            .await
    })
    .await?;
    Ok(Json(draft))
}

async fn cases_generate_followup_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<EmailDraft>, ApiError> {
    let controller = Arc::clone(&state.controller);
    let draft = detached(async move { controller.generate_followup(&id).await }).await?;
    Ok(Json(draft))
}

async fn cases_send_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<SendEmailRequest>,
) -> Result<Json<SendReceipt>, ApiError> {
    let controller = Arc::clone(&state.controller);
    let receipt = detached(async move { controller.send_email(&id, req.into()).await }).await?;
    Ok(Json(receipt))
}

async fn cases_step_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<AdvanceStepRequest>,
) -> Result<Json<Case>, ApiError> {
    state
        .controller
        .advance_step(&id, req.step)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn cases_plan_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<AssignPlanRequest>,
) -> Result<Json<Case>, ApiError> {
    state
        .controller
        .assign_plan(&id, req.plan_id, req.covered_person_id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn cases_read_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<Case>, ApiError> {
    state
        .controller
        .mark_emails_read(&id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn cases_resolve_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Case>, ApiError> {
    let req: ResolveCaseRequest = optional_body(&body)?;
    state
        .controller
        .resolve_case(&id, req.feedback)
        .await
        .map(Json)
        .map_err(error_response)
}

// --- Plan and user handlers ---

async fn plans_list_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ListPlansQuery>,
) -> Result<Json<PlanListResponse>, ApiError> {
    let plans = state
        .plans
        .list_plans(&query.user_id)
        .await
        .map_err(error_response)?;
    Ok(Json(PlanListResponse { plans }))
}

async fn plans_create_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CreatePlanRequest>,
) -> Result<(StatusCode, Json<InsurancePlan>), ApiError> {
    let plan = state
        .plans
        .create_plan(req.into())
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn plans_get_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<InsurancePlan>, ApiError> {
    state
        .plans
        .get_plan(&id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn plans_update_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdatePlanRequest>,
) -> Result<Json<InsurancePlan>, ApiError> {
    state
        .plans
        .update_plan(&id, req.into())
        .await
        .map(Json)
        .map_err(error_response)
}

async fn plans_delete_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .plans
        .delete_plan(&id)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn plans_extract_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<ExtractPlanRequest>,
) -> Result<Json<PlanFacts>, ApiError> {
    let plans = Arc::clone(&state.plans);
    let facts = detached(async move { plans.extract_plan_info(&req.files).await }).await?;
    Ok(Json(facts))
}

async fn users_create_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserRecord>), ApiError> {
    let user = state
        .plans
        .create_user(req.into())
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn users_get_handler(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Result<Json<UserRecord>, ApiError> {
    state
        .plans
        .get_user(&id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn files_signed_url_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<SignedUrlRequest>,
) -> Result<Json<SignedUrlResponse>, ApiError> {
    let signed_url = state
        .controller
        .signed_url(req.bucket.as_deref(), &req.path)
        .await
        .map_err(error_response)?;
    Ok(Json(SignedUrlResponse { signed_url }))
}

// --- Inbound mail ---

async fn inbound_handler(
    State(state): State<Arc<GatewayState>>,
    Json(payload): Json<Value>,
) -> Result<Json<InboundOutcome>, ApiError> {
    let email = inbound::parse_webhook(&payload).ok_or((
        StatusCode::BAD_REQUEST,
        "Inbound payload has no sender".to_string(),
    ))?;
    tracing::debug!(message_id = %email.message_id, "Inbound webhook received");
    let controller = Arc::clone(&state.controller);
    let outcome = detached(async move { controller.ingest_inbound(email).await }).await?;
    Ok(Json(outcome))
}

/// Mailbox push notification. The payload only says "something changed",
/// so it triggers a full unread sync.
async fn gmail_webhook_handler(
    State(state): State<Arc<GatewayState>>,
    Json(payload): Json<Value>,
) -> Result<Json<SyncResponse>, ApiError> {
    match inbound::decode_push_notification(&payload) {
        Some(notification) => {
            let history_id = push_history_id(&notification).unwrap_or_default();
            tracing::debug!(%history_id, "Mailbox push notification");
        }
        None => tracing::debug!("Push notification without a decodable envelope"),
    }
    sync_inbox(&state).await
}

/// History id from a decoded push notification; the mailbox sends it as a
/// number or a string depending on the client library.
fn push_history_id(notification: &Value) -> Option<String> {
    match notification.get("historyId")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

async fn gmail_sync_handler(
    State(state): State<Arc<GatewayState>>,
) -> Result<Json<SyncResponse>, ApiError> {
    sync_inbox(&state).await
}

async fn sync_inbox(state: &GatewayState) -> Result<Json<SyncResponse>, ApiError> {
    let controller = Arc::clone(&state.controller);
    let report = detached(async move { controller.sync_inbox().await }).await?;
    Ok(Json(SyncResponse {
        success: report.failed == 0,
        processed_count: report.processed,
        linked: report.linked,
        parked: report.parked,
        failed: report.failed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DatabaseError;

    #[test]
    fn case_errors_map_to_status_codes() {
        let cases = [
            (CaseError::case_not_found("c1"), StatusCode::NOT_FOUND),
            (
                CaseError::ExtractionFailed("down".to_string()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                CaseError::AnalysisFailed("down".to_string()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                CaseError::SendFailed("down".to_string()),
                StatusCode::BAD_GATEWAY,
            ),
            (
                CaseError::InvalidTransition {
                    from: "uploading".to_string(),
                    to: "sent".to_string(),
                },
                StatusCode::CONFLICT,
            ),
            (
                CaseError::InvalidInput("bad".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                CaseError::Storage(DatabaseError::Query("boom".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(err).0, expected);
        }
    }

    #[test]
    fn empty_body_yields_default_request() {
        let req: CaseActionRequest = optional_body(&Bytes::from_static(b"  ")).unwrap();
        assert!(req.user_id.is_none());
        let req: CaseActionRequest =
            optional_body(&Bytes::from_static(br#"{"userId":"u1"}"#)).unwrap();
        assert_eq!(req.user_id.as_deref(), Some("u1"));
        let err = optional_body::<CaseActionRequest>(&Bytes::from_static(b"{")).unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn upload_names_are_reduced_to_basenames() {
        assert_eq!(safe_file_name("../../etc/passwd"), "passwd");
        assert_eq!(safe_file_name("C:\\scans\\denial letter.pdf"), "denial letter.pdf");
        assert_eq!(safe_file_name(".."), "document");
        assert_eq!(safe_file_name("<script>.pdf"), "script.pdf");
    }

    #[test]
    fn push_history_id_accepts_numbers_and_strings() {
        let numeric = serde_json::json!({ "historyId": 1234 });
        assert_eq!(push_history_id(&numeric).as_deref(), Some("1234"));
        let text = serde_json::json!({ "historyId": "98765" });
        assert_eq!(push_history_id(&text).as_deref(), Some("98765"));
        assert_eq!(push_history_id(&serde_json::json!({})), None);
        assert_eq!(push_history_id(&serde_json::json!({ "historyId": null })), None);
    }
}
