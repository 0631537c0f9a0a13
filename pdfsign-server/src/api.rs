// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! HTTP API of a `serve` service

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pdfsign_core::{
    dispatcher::Dispatcher,
    model::{Job, JobKind, Priority},
    params::SignParams,
    protocol::{
        ErrorResponse, HealthResponse, HealthStatus, JobCreated, JobStatusResponse, QueueSize,
        VersionInfo,
    },
    Error, VERIFY_UNIT,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Largest accepted upload
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    /// Signers this service exposes
    pub signers: Arc<Vec<String>>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, signers: Vec<String>) -> Self {
        Self {
            dispatcher,
            signers: Arc::new(signers),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sign", post(submit_sign))
        .route("/sign/:job_id", get(sign_status).delete(delete_job))
        .route("/sign/:job_id/:task_id/download", get(download))
        .route("/verify", post(submit_verify))
        .route("/verify/:job_id", get(verify_status))
        .route("/queue/:unit", get(queue_size))
        .route("/version", get(version))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Core error rendered as `{"message","code"}`
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(Error::Validation(message.into()))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            Error::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        let body = ErrorResponse {
            message: self.0.to_string(),
            code: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Multipart body: text fields plus uploaded documents stored under the
/// dispatcher's files directory
#[derive(Default)]
struct Upload {
    fields: HashMap<String, String>,
    files: Vec<(PathBuf, String)>,
}

impl Upload {
    async fn receive(dispatcher: &Dispatcher, mut multipart: Multipart) -> ApiResult<Self> {
        let mut upload = Upload::default();
        if let Err(e) = upload.read_fields(dispatcher, &mut multipart).await {
            upload.discard();
            return Err(e);
        }
        Ok(upload)
    }

    async fn read_fields(&mut self, dispatcher: &Dispatcher, multipart: &mut Multipart) -> ApiResult<()> {
        while let Some(field) = multipart.next_field().await.map_err(invalid_body)? {
            let name = field.name().unwrap_or_default().to_string();
            match field.file_name().map(base_name) {
                Some(file_name) => {
                    let data = field.bytes().await.map_err(invalid_body)?;
                    let path = dispatcher.new_file_path("pdf");
                    tokio::fs::write(&path, &data).await.map_err(Error::from)?;
                    self.files.push((path, file_name));
                }
                None => {
                    let value = field.text().await.map_err(invalid_body)?;
                    self.fields.insert(name, value);
                }
            }
        }
        Ok(())
    }

    fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or_default()
    }

    fn sign_params(&self) -> ApiResult<SignParams> {
        let number = |name: &str| -> ApiResult<u32> {
            match self.field(name).trim() {
                "" => Ok(0),
                v => v
                    .parse()
                    .map_err(|_| ApiError::bad_request(format!("{} must be a number, got '{}'", name, v))),
            }
        };

        let params = SignParams {
            name: self.field("name").to_string(),
            location: self.field("location").to_string(),
            reason: self.field("reason").to_string(),
            contact_info: self.field("contactInfo").to_string(),
            cert_type: number("certType")?,
            doc_mdp: number("docMdp")?,
            approval: matches!(self.field("approval").trim(), "true" | "1" | "on"),
            ..SignParams::default()
        };
        params.validate()?;
        Ok(params)
    }

    /// Remove stored files that never became tasks
    fn discard(&self) {
        for (path, _) in &self.files {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn invalid_body(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::bad_request(format!("invalid multipart body: {}", e))
}

/// Client-supplied names may carry directories
fn base_name(name: &str) -> String {
    name.rsplit(['/', '\\'])
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("document.pdf")
        .to_string()
}

fn created(prefix: &str, job_id: String) -> Response {
    let location = format!("{}/{}", prefix, job_id);
    let mut response = (StatusCode::CREATED, Json(JobCreated { job_id })).into_response();
    if let Ok(value) = HeaderValue::from_str(&location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

async fn submit_sign(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Response> {
    let dispatcher = &state.dispatcher;
    let upload = Upload::receive(dispatcher, multipart).await?;

    let result = async {
        let signer = upload.field("signer").trim().to_string();
        if signer.is_empty() {
            return Err(ApiError::bad_request("signer is required"));
        }
        if !state.signers.contains(&signer) || !dispatcher.has_unit(&signer) {
            return Err(Error::UnknownUnit(signer).into());
        }
        if upload.files.is_empty() {
            return Err(ApiError::bad_request("no PDF documents in request"));
        }
        let params = upload.sign_params()?;

        let job_id = dispatcher.add_sign_job(params);
        let priority = Priority::for_upload(upload.files.len());
        let tasks = dispatcher
            .add_batch_persistent_tasks(&signer, &job_id, upload.files.clone(), priority)
            .await?;
        info!(job = %job_id, signer = %signer, tasks = tasks.len(), %priority, "Sign job submitted");
        Ok(job_id)
    }
    .await;

    match result {
        Ok(job_id) => Ok(created("/sign", job_id)),
        Err(e) => {
            upload.discard();
            Err(e)
        }
    }
}

async fn submit_verify(State(state): State<AppState>, multipart: Multipart) -> ApiResult<Response> {
    let dispatcher = &state.dispatcher;
    let upload = Upload::receive(dispatcher, multipart).await?;
    if upload.files.is_empty() {
        return Err(ApiError::bad_request("no PDF documents in request"));
    }

    let job_id = dispatcher.add_verify_job();
    let priority = Priority::for_upload(upload.files.len());
    if let Err(e) = dispatcher
        .add_batch_persistent_tasks(VERIFY_UNIT, &job_id, upload.files.clone(), priority)
        .await
    {
        upload.discard();
        return Err(e.into());
    }
    info!(job = %job_id, files = upload.files.len(), "Verify job submitted");
    Ok(created("/verify", job_id))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    status: Option<String>,
}

/// Completed tasks unless another status is asked for
async fn sign_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<JobStatusResponse>> {
    job_status(&state.dispatcher, &job_id, JobKind::Sign, Some(query.status.as_deref().unwrap_or_default()))
}

/// Every task unless a status is asked for
async fn verify_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<JobStatusResponse>> {
    job_status(&state.dispatcher, &job_id, JobKind::Verify, query.status.as_deref())
}

/// A job of another kind is reported as unknown on this route
fn job_of_kind(dispatcher: &Dispatcher, job_id: &str, kind: JobKind) -> ApiResult<Job> {
    let job = dispatcher.get_job_by_id(job_id)?;
    if job.kind != kind {
        return Err(Error::UnknownJob(job_id.to_string()).into());
    }
    Ok(job)
}

/// `None` selects every task, oldest first
fn job_status(
    dispatcher: &Dispatcher,
    job_id: &str,
    kind: JobKind,
    filter: Option<&str>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = job_of_kind(dispatcher, job_id, kind)?;
    let tasks = match filter {
        Some(filter) => dispatcher.get_tasks(job_id, filter)?,
        None => {
            let mut tasks: Vec<_> = job.tasks.values().cloned().collect();
            tasks.sort_by(|a, b| a.id.cmp(&b.id));
            tasks
        }
    };
    Ok(Json(JobStatusResponse::new(&job, tasks)))
}

async fn download(
    State(state): State<AppState>,
    Path((job_id, task_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    job_of_kind(&state.dispatcher, &job_id, JobKind::Sign)?;
    let task = state.dispatcher.get_completed_task(&job_id, &task_id)?;
    let bytes = tokio::fs::read(&task.output_path).await.map_err(Error::from)?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        task.file_name.replace(['"', '\\', '\r', '\n'], "_")
    );
    let mut response = bytes.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/pdf"));
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn delete_job(State(state): State<AppState>, Path(job_id): Path<String>) -> ApiResult<StatusCode> {
    state.dispatcher.delete_job(&job_id)?;
    Ok(StatusCode::OK)
}

async fn queue_size(State(state): State<AppState>, Path(unit): Path<String>) -> ApiResult<Json<QueueSize>> {
    Ok(Json(state.dispatcher.get_queue_size_by_unit(&unit)?))
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo::default())
}

async fn metrics(State(state): State<AppState>) -> String {
    let dispatcher = &state.dispatcher;
    dispatcher.metrics().prometheus_format(&dispatcher.queue_depths())
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let dispatcher = &state.dispatcher;
    let error = dispatcher.fatal_error();
    let (code, status) = match error {
        None => (StatusCode::OK, HealthStatus::Healthy),
        Some(_) => (StatusCode::SERVICE_UNAVAILABLE, HealthStatus::Unhealthy),
    };
    (
        code,
        Json(HealthResponse {
            status,
            uptime_seconds: dispatcher.metrics().uptime_seconds(),
            units: dispatcher.unit_names(),
            error,
        }),
    )
}
