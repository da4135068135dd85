use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use tracing::warn;

use crate::{
    application::error::HttpError,
    cache::CacheManager,
    domain::reports::{ReportData, ReportName},
};

use super::{
    db_health_response,
    middleware::{cors_layer, log_responses, set_request_context},
};

/// Set to `degraded` when a report endpoint answers `[]` because the
/// computation failed.
pub const REPORT_STATUS_HEADER: HeaderName = HeaderName::from_static("x-report-status");

#[derive(Clone)]
pub struct ReportsState {
    pub manager: Arc<CacheManager>,
}

pub fn build_router(state: ReportsState) -> Router {
    let mut report_routes: Router<ReportsState> = Router::new();
    for report in ReportName::ALL {
        report_routes = report_routes.route(
            report.endpoint(),
            get(move |State(state): State<ReportsState>| serve_report(state, report)),
        );
    }

    let ops_routes = Router::new()
        .route("/_health/db", get(db_health))
        .route("/_cache/reports", get(cache_status))
        .route("/_cache/reports/{report}", delete(invalidate_report));

    report_routes
        .merge(ops_routes)
        .fallback(not_found)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
        .layer(cors_layer())
}

async fn serve_report(state: ReportsState, report: ReportName) -> Response {
    match state.manager.fetch(report).await {
        Ok(data) => Json(data).into_response(),
        Err(err) => {
            warn!(
                target = "h1b_insights::http::reports",
                report = %report,
                error = %err,
                "serving degraded report"
            );
            let mut response = Json(ReportData::empty()).into_response();
            response
                .headers_mut()
                .insert(REPORT_STATUS_HEADER, HeaderValue::from_static("degraded"));
            response
        }
    }
}

async fn db_health(State(state): State<ReportsState>) -> Response {
    db_health_response(state.manager.health_check().await)
}

async fn cache_status(State(state): State<ReportsState>) -> Response {
    Json(state.manager.status()).into_response()
}

async fn invalidate_report(
    State(state): State<ReportsState>,
    Path(report): Path<String>,
) -> Result<StatusCode, HttpError> {
    let report: ReportName = report.parse()?;
    state.manager.invalidate(report);
    Ok(StatusCode::NO_CONTENT)
}

async fn not_found(uri: Uri) -> HttpError {
    HttpError::new(
        "infra::http::reports::not_found",
        StatusCode::NOT_FOUND,
        "Not found",
        format!("no route for `{}`", uri.path()),
    )
}
