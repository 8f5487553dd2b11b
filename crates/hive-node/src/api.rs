// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BEEHIVE NODE - REST API
//
// Collaborator events, member commands and read views over warp.
// Engine calls are synchronous sled work and run on the blocking pool.
// Errors carry a machine-readable kind:
//   {"status": "error", "code": 409, "kind": "cooldown_active", "error": "..."}
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use hive_core::{ActivationEvent, ClaimRejection, HiveError, UpgradeEvent, Wallet, MAX_LAYER};
use hive_engine::{unix_now, HiveEngine};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

use crate::metrics::HiveMetrics;

type ApiReply = WithStatus<Json>;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<HiveEngine>,
    pub metrics: Arc<HiveMetrics>,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub claimant: Wallet,
}

#[derive(Debug, Default, Deserialize)]
pub struct MatrixQuery {
    pub depth: Option<u8>,
}

/// HTTP status for an engine error.
pub fn status_for(err: &HiveError) -> StatusCode {
    match err {
        HiveError::InvalidLevel(_)
        | HiveError::InvalidWallet(_)
        | HiveError::NonSequentialLevel { .. }
        | HiveError::Underpaid { .. }
        | HiveError::IneligibleClaim {
            reason: ClaimRejection::WrongClaimant,
            ..
        } => StatusCode::BAD_REQUEST,
        HiveError::UnknownMember(_) | HiveError::UnknownReferrer(_) | HiveError::UnknownReward(_) => {
            StatusCode::NOT_FOUND
        }
        HiveError::DuplicateActivation { .. }
        | HiveError::DuplicateEvent { .. }
        | HiveError::SlotConflict { .. }
        | HiveError::ReferrerNotPlaced(_)
        | HiveError::IneligibleClaim { .. }
        | HiveError::CooldownActive { .. }
        | HiveError::InsufficientLocked { .. } => StatusCode::CONFLICT,
        HiveError::TreeExhausted { .. }
        | HiveError::IntegrityFault(_)
        | HiveError::Storage(_)
        | HiveError::Codec(_)
        | HiveError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_ok<T: Serialize>(value: &T) -> ApiReply {
    warp::reply::with_status(warp::reply::json(value), StatusCode::OK)
}

fn api_error(err: &HiveError) -> ApiReply {
    let status = status_for(err);
    let mut body = serde_json::json!({
        "status": "error",
        "code": status.as_u16(),
        "kind": err.kind(),
        "error": err.to_string(),
    });
    if let HiveError::CooldownActive { remaining_secs, .. } = err {
        body["remaining_secs"] = serde_json::json!(remaining_secs);
    }
    warp::reply::with_status(warp::reply::json(&body), status)
}

/// Run an engine call on the blocking pool and fold a panicked worker into a storage error.
async fn run_blocking<T, F>(engine: Arc<HiveEngine>, f: F) -> Result<T, HiveError>
where
    T: Send + 'static,
    F: FnOnce(&HiveEngine) -> Result<T, HiveError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&engine))
        .await
        .map_err(|e| HiveError::Storage(format!("engine worker failed: {}", e)))?
}

fn respond<T: Serialize>(metrics: &HiveMetrics, result: Result<T, HiveError>) -> ApiReply {
    match result {
        Ok(value) => api_ok(&value),
        Err(e) => {
            metrics.observe_error(&e);
            match status_for(&e) {
                StatusCode::INTERNAL_SERVER_ERROR => error!("api: {} ({})", e, e.kind()),
                _ => warn!("api: {} ({})", e, e.kind()),
            }
            api_error(&e)
        }
    }
}

fn with_state(
    state: ApiState,
) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

// ─────────────────────────────────────────────────────────────────
// HANDLERS
// ─────────────────────────────────────────────────────────────────

async fn post_activation(event: ActivationEvent, state: ApiState) -> Result<ApiReply, Infallible> {
    state.metrics.api_requests_total.inc();
    let result = run_blocking(state.engine.clone(), move |engine| {
        engine.handle_activation(&event, unix_now())
    })
    .await;
    if let Ok(outcome) = &result {
        state.metrics.observe_activation(outcome);
    }
    Ok(respond(&state.metrics, result))
}

async fn post_upgrade(event: UpgradeEvent, state: ApiState) -> Result<ApiReply, Infallible> {
    state.metrics.api_requests_total.inc();
    let result = run_blocking(state.engine.clone(), move |engine| {
        engine.handle_upgrade(&event, unix_now())
    })
    .await;
    if let Ok(outcome) = &result {
        state.metrics.observe_upgrade(outcome);
    }
    Ok(respond(&state.metrics, result))
}

async fn post_claim(
    reward_id: u64,
    request: ClaimRequest,
    state: ApiState,
) -> Result<ApiReply, Infallible> {
    state.metrics.api_requests_total.inc();
    let result = run_blocking(state.engine.clone(), move |engine| {
        engine.claim(reward_id, &request.claimant, unix_now())
    })
    .await;
    if result.is_ok() {
        state.metrics.claims_total.inc();
    }
    Ok(respond(&state.metrics, result))
}

async fn post_release(wallet: String, state: ApiState) -> Result<ApiReply, Infallible> {
    state.metrics.api_requests_total.inc();
    let result = run_blocking(state.engine.clone(), move |engine| {
        engine.release_locked(&Wallet::parse(&wallet)?, unix_now())
    })
    .await;
    if result.is_ok() {
        state.metrics.releases_total.inc();
    }
    Ok(respond(&state.metrics, result))
}

async fn get_matrix(
    root: String,
    query: MatrixQuery,
    state: ApiState,
) -> Result<ApiReply, Infallible> {
    state.metrics.api_requests_total.inc();
    let depth = query.depth.unwrap_or(MAX_LAYER);
    let result = run_blocking(state.engine.clone(), move |engine| {
        engine.matrix_view(&Wallet::parse(&root)?, depth)
    })
    .await;
    Ok(respond(&state.metrics, result))
}

async fn get_rewards(wallet: String, state: ApiState) -> Result<ApiReply, Infallible> {
    state.metrics.api_requests_total.inc();
    let result = run_blocking(state.engine.clone(), move |engine| {
        let wallet = Wallet::parse(&wallet)?;
        engine.store().require_member(&wallet)?;
        engine.reward_book(&wallet, unix_now())
    })
    .await;
    Ok(respond(&state.metrics, result))
}

async fn get_balance(wallet: String, state: ApiState) -> Result<ApiReply, Infallible> {
    state.metrics.api_requests_total.inc();
    let result = run_blocking(state.engine.clone(), move |engine| {
        engine.balance_snapshot(&Wallet::parse(&wallet)?, unix_now())
    })
    .await;
    Ok(respond(&state.metrics, result))
}

async fn get_member(wallet: String, state: ApiState) -> Result<ApiReply, Infallible> {
    state.metrics.api_requests_total.inc();
    let result = run_blocking(state.engine.clone(), move |engine| {
        engine.member_view(&Wallet::parse(&wallet)?)
    })
    .await;
    Ok(respond(&state.metrics, result))
}

async fn get_health(state: ApiState) -> Result<ApiReply, Infallible> {
    let stats = state.engine.store().stats();
    Ok(api_ok(&serde_json::json!({
        "status": "ok",
        "members": stats.members,
        "slots": stats.slots,
        "rewards": stats.rewards,
        "timestamp": unix_now(),
    })))
}

async fn get_metrics(state: ApiState) -> Result<impl warp::Reply, Infallible> {
    state.metrics.update_db_metrics(&state.engine.store().stats());
    let reply = match state.metrics.export() {
        Ok(output) => warp::reply::with_header(output, "Content-Type", "text/plain; version=0.0.4"),
        Err(e) => warp::reply::with_header(
            format!("# Error exporting metrics: {}", e),
            "Content-Type",
            "text/plain",
        ),
    };
    Ok(reply)
}

/// Turn warp rejections into the same JSON error shape.
async fn handle_rejection(err: warp::Rejection) -> Result<ApiReply, Infallible> {
    let (status, kind, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found", "Endpoint not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (
            StatusCode::BAD_REQUEST,
            "invalid_body",
            format!("Invalid request body: {}", e),
        )
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (
            StatusCode::BAD_REQUEST,
            "invalid_query",
            format!("Invalid query: {}", e),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method_not_allowed",
            "Method not allowed".to_string(),
        )
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("Unhandled rejection: {:?}", err),
        )
    };
    let body = serde_json::json!({
        "status": "error",
        "code": status.as_u16(),
        "kind": kind,
        "error": message,
    });
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}

// ─────────────────────────────────────────────────────────────────
// ROUTES
// ─────────────────────────────────────────────────────────────────

pub fn routes(
    state: ApiState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Infallible> + Clone {
    let body_limit = warp::body::content_length_limit(16 * 1024);

    let activation = warp::path!("events" / "activation")
        .and(warp::post())
        .and(body_limit)
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(post_activation);

    let upgrade = warp::path!("events" / "upgrade")
        .and(warp::post())
        .and(body_limit)
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(post_upgrade);

    let claim = warp::path!("rewards" / u64 / "claim")
        .and(warp::post())
        .and(body_limit)
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(post_claim);

    let release = warp::path!("balances" / String / "release")
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(post_release);

    let matrix = warp::path!("matrix" / String)
        .and(warp::get())
        .and(warp::query::<MatrixQuery>())
        .and(with_state(state.clone()))
        .and_then(get_matrix);

    let rewards = warp::path!("rewards" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_rewards);

    let balance = warp::path!("balances" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_balance);

    let member = warp::path!("members" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_member);

    let health = warp::path!("health")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_health);

    let metrics = warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_metrics);

    // Boxed groups keep the combined filter type shallow.
    let commands = activation
        .boxed()
        .or(upgrade.boxed())
        .or(claim.boxed())
        .or(release.boxed())
        .boxed();

    let views = matrix
        .boxed()
        .or(rewards.boxed())
        .or(balance.boxed())
        .or(member.boxed())
        .boxed();

    commands
        .or(views)
        .or(health.boxed())
        .or(metrics.boxed())
        .with(warp::log("hive::api"))
        .recover(handle_rejection)
}
