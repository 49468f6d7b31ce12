// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The health and debug HTTP servers.

use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde::Serialize;
use slog::Logger;
use slog::info;
use slog::warn;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use trellis::log::LevelHandle;
use trellis::log::level_name;
use trellis::log::parse_level;
use trellis::metrics::Metrics;
use trellis::metrics::Snapshot;
use trellis::policy::PolicyConverger;
use trellis_api::ErrorResp;
use trellis_api::Lease;

struct ApiError(StatusCode, ErrorResp);

impl ApiError {
    fn bad_request(msg: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, ErrorResp::new(msg))
    }

    fn internal(e: impl std::fmt::Display) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, ErrorResp::new(e.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(self.1)).into_response()
    }
}

/// `GET /` answers with the lease this cell runs with.
pub fn health_router(lease: Lease) -> Router {
    Router::new().route("/", get(move || async move { Json(lease) }))
}

/// What the debug routes act on.
pub struct DebugState {
    pub level: LevelHandle,
    pub c2c_logging: Arc<AtomicBool>,
    pub converger: Arc<PolicyConverger>,
    pub metrics: Arc<Metrics>,
    pub log: Logger,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LogLevel {
    pub level: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct C2cLogging {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ContainerQuery {
    container: Option<String>,
}

impl ContainerQuery {
    fn handle(self) -> Result<String, ApiError> {
        self.container
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ApiError::bad_request("missing container query parameter"))
    }
}

type Shared = State<Arc<DebugState>>;

pub fn debug_router(state: Arc<DebugState>) -> Router {
    Router::new()
        .route("/log-level", get(get_log_level).post(set_log_level))
        .route("/iptables-c2c-logging", get(get_c2c_logging).post(set_c2c_logging))
        .route("/force-policy-poll-cycle", post(force_policy_cycle))
        .route("/force-asgs-for-container", get(force_asgs))
        .route("/force-orphaned-asgs-cleanup", get(force_orphan_cleanup))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn get_log_level(State(s): Shared) -> Json<LogLevel> {
    Json(LogLevel { level: level_name(s.level.get()).to_string() })
}

async fn set_log_level(
    State(s): Shared,
    Json(req): Json<LogLevel>,
) -> Result<Json<LogLevel>, ApiError> {
    let level = parse_level(&req.level)
        .ok_or_else(|| ApiError::bad_request(format!("unknown level {:?}", req.level)))?;
    s.level.set(level);
    info!(s.log, "log level changed"; "level" => level_name(level));
    Ok(Json(LogLevel { level: level_name(level).to_string() }))
}

async fn get_c2c_logging(State(s): Shared) -> Json<C2cLogging> {
    Json(C2cLogging { enabled: s.c2c_logging.load(Ordering::SeqCst) })
}

async fn set_c2c_logging(State(s): Shared, Json(req): Json<C2cLogging>) -> Json<C2cLogging> {
    s.c2c_logging.store(req.enabled, Ordering::SeqCst);
    info!(s.log, "container-to-container logging changed"; "enabled" => req.enabled);
    Json(req)
}

async fn force_policy_cycle(State(s): Shared) -> Result<Json<serde_json::Value>, ApiError> {
    s.converger.poll_policies().await.map_err(|e| {
        warn!(s.log, "forced policy cycle failed"; "error" => %e);
        ApiError::internal(e)
    })?;
    Ok(Json(serde_json::json!({})))
}

async fn force_asgs(
    State(s): Shared,
    Query(q): Query<ContainerQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let handle = q.handle()?;
    s.converger
        .sync_asgs_for_containers(&[handle])
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(serde_json::json!({})))
}

async fn force_orphan_cleanup(
    State(s): Shared,
    Query(q): Query<ContainerQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let handle = q.handle()?;
    s.converger
        .cleanup_orphaned_asg_chains(&handle)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(serde_json::json!({})))
}

async fn metrics(State(s): Shared) -> Json<Snapshot> {
    Json(s.metrics.snapshot())
}

/// Serve `app` on `listener` until `cancel` fires, then drain.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::net::SocketAddr;
    use std::path::Path;
    use trellis::config::Config;
    use trellis::config::DaemonConfig;
    use trellis::datastore::Store;
    use trellis::fakes::FakeIptables;
    use trellis::fakes::FakePolicySource;
    use trellis::iptables::FILTER;
    use trellis::log::null_logger;
    use trellis::policy::Enforcer;
    use trellis::policy::Planner;
    use trellis_api::PoliciesResp;

    fn planner_config() -> trellis::policy::PlannerConfig {
        DaemonConfig::from_json(
            Path::new("test.json"),
            r#"{
                "underlay_ip": "10.0.0.1",
                "overlay_network": "10.255.0.0/16",
                "subnet_prefix_length": 24,
                "controller_url": "https://controller:4003",
                "ca_cert_file": "/ca.pem",
                "client_cert_file": "/client.pem",
                "client_key_file": "/client.key",
                "health_check_port": 4004,
                "debug_server_port": 8721,
                "datastore": "/tmp/unused",
                "iptables_lock_file": "/tmp/unused.lock"
            }"#,
        )
        .unwrap()
        .planner_config("eth0")
    }

    struct Running {
        _dir: tempfile::TempDir,
        addr: SocketAddr,
        ipt: Arc<FakeIptables>,
        store: Arc<Store>,
        state: Arc<DebugState>,
        cancel: CancellationToken,
    }

    async fn start(router: impl FnOnce(Arc<DebugState>) -> Router) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let log = null_logger();
        let ipt = Arc::new(FakeIptables::new());
        let store = Arc::new(Store::new(dir.path().join("store.json")));
        let c2c = Arc::new(AtomicBool::new(false));
        let metrics = Metrics::new();
        let converger = Arc::new(PolicyConverger::new(
            Planner::new(planner_config(), c2c.clone(), &log),
            Enforcer::new(ipt.clone(), &log),
            store.clone(),
            Arc::new(FakePolicySource::new(PoliciesResp::default())),
            metrics.clone(),
            &log,
        ));
        let state = Arc::new(DebugState {
            level: LevelHandle::new(slog::Level::Info),
            c2c_logging: c2c,
            converger,
            metrics,
            log,
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, router(state.clone()), cancel.clone()));
        Running { _dir: dir, addr, ipt, store, state, cancel }
    }

    fn url(r: &Running, path: &str) -> String {
        format!("http://{}{path}", r.addr)
    }

    #[tokio::test]
    async fn health_returns_lease() {
        let lease = Lease::new(Ipv4Addr::new(10, 0, 0, 1), "10.255.7.0/24".parse().unwrap());
        let r = start(|_| health_router(lease)).await;
        let got: Lease = reqwest::get(url(&r, "/")).await.unwrap().json().await.unwrap();
        assert_eq!(got, lease);
        r.cancel.cancel();
    }

    #[tokio::test]
    async fn log_level_round_trip() {
        let r = start(debug_router).await;
        let c = reqwest::Client::new();

        let got: LogLevel = c.get(url(&r, "/log-level")).send().await.unwrap().json().await.unwrap();
        assert_eq!(got.level, "info");

        let resp = c
            .post(url(&r, "/log-level"))
            .json(&serde_json::json!({"level": "debug"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(r.state.level.get(), slog::Level::Debug);

        let resp = c
            .post(url(&r, "/log-level"))
            .json(&serde_json::json!({"level": "shouty"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        assert_eq!(r.state.level.get(), slog::Level::Debug);
    }

    #[tokio::test]
    async fn c2c_toggle_changes_next_cycle() {
        let r = start(debug_router).await;
        let c = reqwest::Client::new();
        let resp = c
            .post(url(&r, "/iptables-c2c-logging"))
            .json(&serde_json::json!({"enabled": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert!(r.state.converger.planner().c2c_logging());

        let got: C2cLogging = c
            .get(url(&r, "/iptables-c2c-logging"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(got.enabled);
    }

    #[tokio::test]
    async fn forced_policy_cycle_installs_chains() {
        let r = start(debug_router).await;
        r.store.add("c1", Ipv4Addr::new(10, 255, 7, 2), Default::default()).unwrap();

        let resp = reqwest::Client::new()
            .post(url(&r, "/force-policy-poll-cycle"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert!(r.ipt.chains(FILTER).iter().any(|c| c.starts_with("vpa--")));
        assert!(r.ipt.chains(FILTER).iter().any(|c| c.starts_with("in-")));
    }

    #[tokio::test]
    async fn targeted_routes_need_container() {
        let r = start(debug_router).await;
        for path in ["/force-asgs-for-container", "/force-orphaned-asgs-cleanup?container="] {
            let resp = reqwest::get(url(&r, path)).await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST, "{path}");
            let body: ErrorResp = resp.json().await.unwrap();
            assert!(body.error.contains("container"));
        }

        r.store.add("c1", Ipv4Addr::new(10, 255, 7, 2), Default::default()).unwrap();
        let resp = reqwest::get(url(&r, "/force-asgs-for-container?container=c1")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert!(r.ipt.chains(FILTER).iter().any(|c| c.starts_with("no-")));

        let resp = reqwest::get(url(&r, "/force-orphaned-asgs-cleanup?container=c1")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert!(!r.ipt.chains(FILTER).iter().any(|c| c.starts_with("no-")));
    }

    #[tokio::test]
    async fn metrics_snapshot() {
        let r = start(debug_router).await;
        r.state.metrics.vxlan_errors.incr();
        let snap: serde_json::Value =
            reqwest::get(url(&r, "/metrics")).await.unwrap().json().await.unwrap();
        assert_eq!(snap["vxlan_errors"], 1);
    }
}
