// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/`. `/health` requires no authentication.
// Every other endpoint requires a valid Bearer token checked via the
// `Identity` extractor; the admin NAV-refresh trigger additionally requires
// `AdminIdentity`.
//
// Response shape follows the wire protocol used throughout:
// `{ success: true, data: ... }` on success, `{ success: false, message,
// errors? }` on failure. Failures are surfaced through `AppError`'s own
// `IntoResponse` impl, so handlers simply return `Result<_, AppError>`.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::auth::{AdminIdentity, Identity};
use crate::app_state::AppState;
use crate::errors::{AppError, AppResult};
use crate::nav_refresh;
use crate::types::{SchemeCode, TransactionType};

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/portfolio/add", post(portfolio_add))
        .route("/api/portfolio/sell", post(portfolio_sell))
        .route("/api/portfolio/remove/:schemeCode", delete(portfolio_remove))
        .route("/api/portfolio/value", get(portfolio_value))
        .route("/api/portfolio/list", get(portfolio_list))
        .route("/api/portfolio/history", get(portfolio_history))
        .route("/api/transactions", get(transactions))
        .route("/api/admin/cron/run-nav-update", post(admin_run_nav_update))
        .layer(cors)
        .with_state(state)
}

fn ok<T: Serialize>(data: T) -> impl IntoResponse {
    Json(serde_json::json!({ "success": true, "data": data }))
}

/// §3: `schemeCode` is an integer in `[100000, 999999]`.
fn validate_scheme_code(scheme_code: SchemeCode) -> AppResult<()> {
    if !(100_000..=999_999).contains(&scheme_code) {
        return Err(AppError::Validation(format!(
            "schemeCode must be in [100000, 999999], got {scheme_code}"
        )));
    }
    Ok(())
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        server_time: Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// POST /api/portfolio/add
// =============================================================================

#[derive(Deserialize)]
struct AddRequest {
    #[serde(rename = "schemeCode")]
    scheme_code: SchemeCode,
    units: Decimal,
}

async fn portfolio_add(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<AddRequest>,
) -> AppResult<impl IntoResponse> {
    validate_scheme_code(req.scheme_code)?;
    if req.units <= Decimal::ZERO {
        return Err(AppError::Validation("units must be > 0".into()));
    }

    let nav_row = state.nav_store.get_latest(req.scheme_code).await?;

    // Serialize this portfolio's BUY: the lock is acquired by portfolio id,
    // discovered from the (user, scheme) index if it already exists, else
    // the first call creates it — so the very first BUY on a new portfolio
    // races only with other concurrent first BUYs for the same scheme,
    // which the position engine's own locked `index` entry resolves.
    let portfolio_id = state
        .positions
        .find_portfolio_id(&identity.user_id, req.scheme_code);
    let guard_lock = portfolio_id.map(|id| state.portfolio_lock(id));
    let _guard = match &guard_lock {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    let position = state.positions.buy(
        &identity.user_id,
        req.scheme_code,
        req.units,
        nav_row.nav,
        Utc::now(),
    )?;

    info!(user_id = %identity.user_id, scheme_code = req.scheme_code, units = %req.units, "BUY executed");
    Ok(ok(position))
}

// =============================================================================
// POST /api/portfolio/sell
// =============================================================================

#[derive(Deserialize)]
struct SellRequest {
    #[serde(rename = "schemeCode")]
    scheme_code: SchemeCode,
    units: Decimal,
}

async fn portfolio_sell(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(req): Json<SellRequest>,
) -> AppResult<impl IntoResponse> {
    validate_scheme_code(req.scheme_code)?;
    if req.units <= Decimal::ZERO {
        return Err(AppError::Validation("units must be > 0".into()));
    }

    let portfolio_id = state
        .positions
        .find_portfolio_id(&identity.user_id, req.scheme_code)
        .ok_or(AppError::NoPosition)?;
    let lock = state.portfolio_lock(portfolio_id);
    let _guard = lock.lock().await;

    let nav_row = state.nav_store.get_latest(req.scheme_code).await?;
    let outcome = state.positions.sell(
        &identity.user_id,
        req.scheme_code,
        req.units,
        nav_row.nav,
        Utc::now(),
    )?;

    info!(
        user_id = %identity.user_id,
        scheme_code = req.scheme_code,
        units = %req.units,
        realized_pl = %outcome.realized_pl,
        "SELL executed"
    );
    Ok(ok(serde_json::json!({
        "realizedPL": outcome.realized_pl,
        "position": outcome.remaining_position,
    })))
}

// =============================================================================
// DELETE /api/portfolio/remove/{schemeCode}
// =============================================================================

async fn portfolio_remove(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(scheme_code): Path<SchemeCode>,
) -> AppResult<impl IntoResponse> {
    validate_scheme_code(scheme_code)?;
    let portfolio_id = state.positions.find_portfolio_id(&identity.user_id, scheme_code);
    if let Some(id) = portfolio_id {
        let lock = state.portfolio_lock(id);
        let _guard = lock.lock().await;
        state.positions.remove(&identity.user_id, scheme_code)?;
    } else {
        return Err(AppError::NoPosition);
    }

    Ok(ok(serde_json::json!({ "removed": true })))
}

// =============================================================================
// GET /api/portfolio/value
// =============================================================================

async fn portfolio_value(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> AppResult<impl IntoResponse> {
    let valuation = crate::valuation::ValuationService::new(state.positions.clone(), state.nav_store.clone());
    Ok(ok(valuation.portfolio_value(&identity.user_id).await))
}

// =============================================================================
// GET /api/portfolio/list
// =============================================================================

async fn portfolio_list(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> AppResult<impl IntoResponse> {
    let portfolios = state.positions.portfolios_for_user(&identity.user_id);
    let entries: Vec<_> = portfolios
        .into_iter()
        .filter_map(|p| {
            state.positions.get_position(p.portfolio_id).map(|position| {
                let latest_nav = state.nav_store.get_latest_cached(p.scheme_code);
                let scheme = state.catalog.get(p.scheme_code);
                serde_json::json!({
                    "portfolio": p,
                    "position": position,
                    "latestNav": latest_nav,
                    "scheme": scheme,
                })
            })
        })
        .collect();
    Ok(ok(entries))
}

// =============================================================================
// GET /api/portfolio/history?days=30
// =============================================================================

#[derive(Deserialize)]
struct HistoryQuery {
    days: Option<i64>,
}

async fn portfolio_history(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<HistoryQuery>,
) -> AppResult<impl IntoResponse> {
    let valuation = crate::valuation::ValuationService::new(state.positions.clone(), state.nav_store.clone());
    Ok(ok(valuation.portfolio_history(&identity.user_id, query.days)))
}

// =============================================================================
// GET /api/transactions?schemeCode?&page?&limit?&type?
// =============================================================================

#[derive(Deserialize)]
struct TransactionsQuery {
    #[serde(rename = "schemeCode")]
    scheme_code: Option<SchemeCode>,
    page: Option<usize>,
    limit: Option<usize>,
    #[serde(rename = "type")]
    tx_type: Option<TransactionType>,
}

async fn transactions(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Query(query): Query<TransactionsQuery>,
) -> AppResult<impl IntoResponse> {
    let page = query.page.unwrap_or(0);
    let limit = query.limit.unwrap_or(20).clamp(1, 100);

    // `schemeCode` is optional (§6): when given, filter to that one
    // portfolio's log; otherwise aggregate across every portfolio the user
    // holds, merged newest-first by `(time, txId)`.
    let (items, total) = if let Some(scheme_code) = query.scheme_code {
        validate_scheme_code(scheme_code)?;
        let portfolio_id = state
            .positions
            .find_portfolio_id(&identity.user_id, scheme_code)
            .ok_or(AppError::NoPosition)?;
        state.log.page(portfolio_id, query.tx_type, page, limit)
    } else {
        let portfolio_ids: Vec<_> = state
            .positions
            .portfolios_for_user(&identity.user_id)
            .into_iter()
            .map(|p| p.portfolio_id)
            .collect();
        state.log.page_across(&portfolio_ids, query.tx_type, page, limit)
    };

    Ok(ok(serde_json::json!({
        "items": items,
        "total": total,
        "page": page,
        "limit": limit,
    })))
}

// =============================================================================
// POST /api/admin/cron/run-nav-update
// =============================================================================

/// §6: "Triggers NAV refresh asynchronously; returns 202." The run itself
/// happens on a detached task so the caller doesn't wait out a full batch
/// sweep; the single-run sentinel (§4.6) still rejects a second trigger
/// while one is in flight, logged rather than surfaced as a response error
/// since the caller has already moved on by the time that's known.
async fn admin_run_nav_update(
    State(state): State<Arc<AppState>>,
    _admin: AdminIdentity,
) -> impl IntoResponse {
    let task_state = state.clone();
    tokio::spawn(async move {
        if nav_refresh::run_once(&task_state).await.is_none() {
            tracing::warn!("admin-triggered NAV refresh ignored — a run was already in flight");
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "success": true, "message": "NAV refresh triggered" })),
    )
}
