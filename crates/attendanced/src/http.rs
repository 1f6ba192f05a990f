//! HTTP surface of the daemon.
//!
//! Routes:
//! - `GET  /`                     service banner
//! - `GET  /api/health`           liveness probe
//! - `POST /api/mark-attendance`  submit an image for recognition
//! - `GET  /api/mark-attendance`  405 with usage
//! - `GET  /api/diagnostics`      interpreter probes, module imports and limits (operators)
//! - `GET  /api/attendance`       recent ledger records (operators)

use attendance_core::SuccessDetails;
use attendance_runner::interpreter::{self, PROBE_TIMEOUT};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Query, State,
    },
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        request, HeaderValue, Method, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::error::{ApiError, DebugInfo};
use crate::ledger::Identity;
use crate::relay::{Upload, Verdict};
use crate::state::AppState;

/// Multipart framing allowance on top of the image size limit.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn build_router(state: Arc<AppState>) -> Router {
    let expose = state.config.expose_debug;
    let body_limit = state.relay.max_upload_bytes() + MULTIPART_OVERHEAD;

    Router::new()
        .route("/", get(banner_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .route("/api/health", get(health_handler))
        .route(
            "/api/mark-attendance",
            get(mark_attendance_usage).post(mark_attendance_handler),
        )
        .route("/api/diagnostics", get(diagnostics_handler))
        .route("/api/attendance", get(attendance_list_handler))
        .fallback(not_found_handler)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CatchPanicLayer::custom(
            move |err: Box<dyn Any + Send + 'static>| panic_response(err, expose),
        ))
        .layer(cors_layer(&state.config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let allowed = config.allowed_origins.clone();
    let widen = config.is_cloud();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &request::Parts| {
                origin
                    .to_str()
                    .is_ok_and(|o| origin_allowed(o, &allowed, widen))
            },
        ))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
        .allow_credentials(true)
        .max_age(Duration::from_secs(60 * 60))
}

/// Exact allow-list match; hosted deployments also accept any Vercel
/// preview domain.
pub fn origin_allowed(origin: &str, allowed: &[String], widen: bool) -> bool {
    if allowed.iter().any(|a| a == origin) {
        return true;
    }
    widen
        && origin
            .strip_prefix("https://")
            .is_some_and(|host| host.ends_with(".vercel.app"))
}

fn panic_response(err: Box<dyn Any + Send + 'static>, expose: bool) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!(panic = %detail, "request handler panicked");

    let error = if expose {
        detail
    } else {
        "Something went wrong".to_string()
    };
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "success": false,
            "message": "Internal server error",
            "error": error,
        })),
    )
        .into_response()
}

async fn banner_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "message": "Attendance Marking System API",
        "status": "Running",
        "version": env!("CARGO_PKG_VERSION"),
        "environment": config.environment,
        "platform": config.platform.as_deref().unwrap_or("Local"),
        "apiUrl": config.public_api_url,
        "endpoints": {
            "health": "/api/health",
            "markAttendance": "/api/mark-attendance",
            "diagnostics": "/api/diagnostics",
            "attendance": "/api/attendance",
        },
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let runner = state.relay.runner();
    Json(json!({
        "status": "Server is running",
        "timestamp": Utc::now().to_rfc3339(),
        "startedAt": state.started_at.to_rfc3339(),
        "environment": state.config.environment,
        "port": state.config.port,
        "pythonAvailable": true,
        "interpreter": runner.interpreter().version,
        "inFlight": runner.in_flight(),
    }))
}

async fn mark_attendance_usage() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(json!({
            "success": false,
            "message": "This endpoint only accepts POST requests",
            "error": "method_not_allowed",
            "instructions": "Please use POST with a multipart form carrying an `image` field (JPG/PNG, up to 10 MiB)",
        })),
    )
        .into_response()
}

/// Fields read from one submission form.
#[derive(Default)]
struct SubmissionForm {
    image: Option<Upload>,
    identity: Identity,
}

fn malformed(e: MultipartError) -> ApiError {
    ApiError::InvalidImage(format!("malformed upload: {}", e.body_text()))
}

async fn read_form(mut multipart: Multipart) -> Result<SubmissionForm, ApiError> {
    let mut form = SubmissionForm::default();

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("image") => {
                if form.image.is_some() {
                    return Err(ApiError::InvalidImage("more than one image part".into()));
                }
                // A plain text field named `image` is not a file upload.
                let Some(file_name) = field.file_name().map(str::to_string) else {
                    continue;
                };
                let content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(malformed)?;
                form.image = Some(Upload {
                    file_name: Some(file_name),
                    content_type,
                    bytes,
                });
            }
            Some("user_email") => {
                form.identity.user_email = Some(field.text().await.map_err(malformed)?);
            }
            Some("user_name") => {
                form.identity.user_name = Some(field.text().await.map_err(malformed)?);
            }
            _ => {}
        }
    }

    Ok(form)
}

#[derive(Serialize)]
struct SuccessBody {
    success: bool,
    message: &'static str,
    status: &'static str,
    output: String,
    details: SuccessDetails,
}

async fn mark_attendance_handler(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<SuccessBody>, ApiError> {
    // Anything that is not a multipart form cannot carry an image part.
    let multipart = multipart.map_err(|_| ApiError::MissingImage)?;
    let form = read_form(multipart).await?;
    let upload = form.image.ok_or(ApiError::MissingImage)?;

    let Verdict {
        report,
        classification,
    } = state.relay.submit(&upload).await?;
    let kind = classification.kind;

    if let Err(e) = state.ledger.record(&form.identity, kind).await {
        tracing::warn!(error = %e, "failed to record attendance");
    }

    if kind.is_success() {
        return Ok(Json(SuccessBody {
            success: true,
            message: kind.message(),
            status: "present",
            details: SuccessDetails::from_stdout(&report.stdout),
            output: report.stdout,
        }));
    }

    let debug = state.config.expose_debug.then(|| {
        let runner = state.relay.runner();
        Box::new(DebugInfo {
            exit_code: report.exit_code,
            command: runner.interpreter().program.clone(),
            script_path: runner.script().display().to_string(),
            output: report.stdout,
            error: report.spawn_error.unwrap_or(report.stderr),
            timed_out: report.timed_out,
            reason: classification.reason,
        })
    });
    Err(ApiError::Recognition { kind, debug })
}

async fn diagnostics_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    if !state.config.expose_debug {
        return Err(ApiError::DebugDisabled);
    }
    let runner = state.relay.runner();
    let modules = interpreter::check_imports(
        &runner.interpreter().program,
        &state.config.required_modules,
        PROBE_TIMEOUT,
    )
    .await;
    Ok(Json(json!({
        "success": true,
        "interpreter": runner.interpreter(),
        "probes": state.probes,
        "modulesReady": modules.iter().all(|m| m.available),
        "modules": modules,
        "command": runner.command_line(),
        "scriptPath": runner.script().display().to_string(),
        "scriptExists": runner.script().is_file(),
        "timeoutMs": runner.timeout().as_millis() as u64,
        "maxConcurrent": runner.max_concurrent(),
        "inFlight": runner.in_flight(),
        "spawnCount": runner.spawn_count(),
        "serverMode": state.config.is_cloud(),
    })))
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn attendance_list_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    if !state.config.expose_debug {
        return Err(ApiError::DebugDisabled);
    }
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let records = state
        .ledger
        .recent(limit)
        .await
        .map_err(|e| ApiError::Internal {
            detail: e.to_string(),
            expose: state.config.expose_debug,
        })?;
    Ok(Json(json!({ "success": true, "records": records })))
}

async fn not_found_handler() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "success": false,
            "message": "Endpoint not found",
            "availableEndpoints": [
                "GET /",
                "GET /api/health",
                "POST /api/mark-attendance",
                "GET /api/diagnostics",
                "GET /api/attendance",
            ],
        })),
    )
        .into_response()
}
