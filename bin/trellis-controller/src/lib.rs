// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The controller: subnet leases, policy-group tags, and policy
//! publication over HTTP.

#![deny(unused_must_use)]

pub mod tags;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::routing::put;
use slog::Logger;
use slog::error;
use slog::info;
use slog::warn;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tags::TagError;
use tags::TagStore;
use tokio_util::sync::CancellationToken;
use trellis::leaser::LeaseError;
use trellis::leaser::LeaseStore;
use trellis::poller::Poller;
use trellis_api::AcquireLeaseReq;
use trellis_api::ErrorResp;
use trellis_api::Lease;
use trellis_api::LeasesResp;
use trellis_api::PinLeaseReq;
use trellis_api::PoliciesResp;
use trellis_api::ReleaseLeaseReq;
use trellis_api::RenewLeaseReq;
use trellis_api::Tag;
use trellis_api::TagReq;

pub struct ApiError(StatusCode, ErrorResp);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

impl From<LeaseError> for ApiError {
    fn from(e: LeaseError) -> Self {
        let resp = ErrorResp::new(e.to_string());
        match e {
            LeaseError::NonRenewable(_) | LeaseError::NotInPool(_) | LeaseError::NotFound(_) => {
                Self(StatusCode::NOT_FOUND, resp)
            }
            LeaseError::PoolMismatch { .. } => Self(
                StatusCode::CONFLICT,
                resp.with_suggestion(
                    "release the existing lease or change single_overlay_ip to match it",
                ),
            ),
            LeaseError::Exhausted(_) => Self(
                StatusCode::SERVICE_UNAVAILABLE,
                resp.with_suggestion("enlarge the overlay network or retire cells"),
            ),
            LeaseError::Transient(_) | LeaseError::Corrupt(_) => {
                Self(StatusCode::INTERNAL_SERVER_ERROR, resp)
            }
        }
    }
}

impl From<TagError> for ApiError {
    fn from(e: TagError) -> Self {
        let status = match e {
            TagError::Exhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            TagError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, ErrorResp::new(e.to_string()))
    }
}

fn internal(msg: impl Into<String>) -> ApiError {
    ApiError(StatusCode::INTERNAL_SERVER_ERROR, ErrorResp::new(msg))
}

pub struct Controller {
    pub leases: Arc<LeaseStore>,
    pub tags: Arc<TagStore>,
    pub policy_file: Option<PathBuf>,
    pub log: Logger,
}

type Shared = State<Arc<Controller>>;

/// Run a database call off the async workers.
async fn blocking<T, E, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    ApiError: From<E>,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(res) => res.map_err(ApiError::from),
        Err(e) => Err(internal(format!("database task: {e}"))),
    }
}

pub fn router(ctl: Arc<Controller>) -> Router {
    Router::new()
        .route("/leases", get(list_leases))
        .route("/leases/acquire", post(acquire))
        .route("/leases/renew", put(renew))
        .route("/leases/release", post(release))
        .route("/leases/pin", post(pin))
        .route("/policies", get(policies))
        .route("/tags", post(create_or_get_tag))
        .with_state(ctl)
}

async fn list_leases(State(ctl): Shared) -> Result<Json<LeasesResp>, ApiError> {
    let store = ctl.leases.clone();
    let leases = blocking(move || store.routable_leases()).await?;
    Ok(Json(LeasesResp { leases }))
}

async fn acquire(
    State(ctl): Shared,
    Json(req): Json<AcquireLeaseReq>,
) -> Result<Json<Lease>, ApiError> {
    let store = ctl.leases.clone();
    let AcquireLeaseReq { underlay_ip, single_overlay_ip } = req;
    let res = blocking(move || store.acquire_subnet_lease(underlay_ip, single_overlay_ip)).await;
    match &res {
        Ok(lease) => info!(ctl.log, "lease acquired"; "lease" => %lease),
        Err(e) => warn!(ctl.log, "lease acquisition failed";
            "underlay_ip" => %underlay_ip, "error" => %e.1),
    }
    res.map(Json)
}

async fn renew(
    State(ctl): Shared,
    Json(req): Json<RenewLeaseReq>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = ctl.leases.clone();
    blocking(move || store.renew_subnet_lease(&req.lease)).await?;
    Ok(Json(serde_json::json!({})))
}

async fn release(
    State(ctl): Shared,
    Json(req): Json<ReleaseLeaseReq>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = ctl.leases.clone();
    let underlay_ip = req.underlay_ip;
    blocking(move || store.release_subnet_lease(underlay_ip)).await?;
    info!(ctl.log, "lease released"; "underlay_ip" => %underlay_ip);
    Ok(Json(serde_json::json!({})))
}

async fn pin(
    State(ctl): Shared,
    Json(req): Json<PinLeaseReq>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let store = ctl.leases.clone();
    let PinLeaseReq { underlay_ip, pinned } = req;
    blocking(move || store.pin_lease(underlay_ip, pinned)).await?;
    info!(ctl.log, "lease pin changed"; "underlay_ip" => %underlay_ip, "pinned" => pinned);
    Ok(Json(serde_json::json!({})))
}

async fn policies(State(ctl): Shared) -> Result<Json<PoliciesResp>, ApiError> {
    let Some(path) = &ctl.policy_file else {
        return Ok(Json(PoliciesResp::default()));
    };
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| internal(format!("reading {}: {e}", path.display())))?;
    let resp = serde_json::from_slice(&raw)
        .map_err(|e| internal(format!("parsing {}: {e}", path.display())))?;
    Ok(Json(resp))
}

async fn create_or_get_tag(
    State(ctl): Shared,
    Json(req): Json<TagReq>,
) -> Result<Json<Tag>, ApiError> {
    let tags = ctl.tags.clone();
    let tag = blocking(move || tags.create_or_get(&req.id, &req.tag_type)).await?;
    Ok(Json(tag))
}

/// Remove stale leases every `interval` until cancelled.
pub async fn run_sweeper(
    leases: Arc<LeaseStore>,
    interval: Duration,
    cancel: CancellationToken,
    log: Logger,
) {
    Poller::new("staleness-sweep", interval, &log)
        .run(cancel, || {
            let leases = leases.clone();
            let log = log.clone();
            async move {
                match tokio::task::spawn_blocking(move || leases.staleness_sweep()).await {
                    Ok(res) => res.map(|_| ()),
                    Err(e) => {
                        error!(log, "sweep task"; "error" => %e);
                        Ok(())
                    }
                }
            }
        })
        .await;
}
