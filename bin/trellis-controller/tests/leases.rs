// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Drive the controller's HTTP surface with the daemon's client.

use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use trellis::client::ClientError;
use trellis::client::ControllerClient;
use trellis::client::LeaseSource;
use trellis::client::PolicySource;
use trellis::leaser::CidrPool;
use trellis::leaser::LeaseStore;
use trellis::log::null_logger;
use trellis_api::Lease;
use trellis_controller::Controller;
use trellis_controller::router;
use trellis_controller::tags::TagStore;

struct Server {
    _dir: tempfile::TempDir,
    addr: SocketAddr,
    leases: Arc<LeaseStore>,
}

async fn start(policies: Option<&str>) -> Server {
    let dir = tempfile::tempdir().unwrap();
    let log = null_logger();
    let pool = CidrPool::new("10.255.0.0/16".parse().unwrap(), 24).unwrap();
    let leases =
        Arc::new(LeaseStore::open(dir.path().join("leases.db"), pool, Duration::from_secs(60), &log).unwrap());
    let tags = Arc::new(TagStore::open(dir.path().join("leases.db"), 2).unwrap());

    let policy_file = policies.map(|p| {
        let path = dir.path().join("policies.json");
        std::fs::write(&path, p).unwrap();
        path
    });

    let ctl = Arc::new(Controller { leases: leases.clone(), tags, policy_file, log });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router(ctl)).await });
    Server { _dir: dir, addr, leases }
}

fn client(s: &Server) -> ControllerClient {
    ControllerClient::plain(&format!("http://{}", s.addr), Duration::from_secs(5)).unwrap()
}

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

#[tokio::test]
async fn acquire_then_renew() {
    let s = start(None).await;
    let c = client(&s);

    let lease = c.acquire_lease(ip("10.0.0.1"), false).await.unwrap();
    assert_eq!(lease.underlay_ip, ip("10.0.0.1"));
    assert_eq!(lease.overlay_subnet.prefix(), 24);
    let octets = lease.overlay_subnet.network().octets();
    assert_eq!(&octets[..2], &[10, 255]);
    assert!(octets[2] >= 1);
    assert_eq!(octets[3], 0);

    c.renew_lease(&lease).await.unwrap();
    assert_eq!(c.routable_leases().await.unwrap(), vec![lease]);
}

#[tokio::test]
async fn acquire_is_idempotent() {
    let s = start(None).await;
    let c = client(&s);

    let first = c.acquire_lease(ip("10.0.0.1"), false).await.unwrap();
    let second = c.acquire_lease(ip("10.0.0.1"), false).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(c.routable_leases().await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_acquisitions_are_disjoint() {
    let s = start(None).await;
    let mut set = JoinSet::new();
    for i in 1..=20u8 {
        let c = client(&s);
        set.spawn(async move { c.acquire_lease(Ipv4Addr::new(10, 0, 1, i), false).await });
    }
    let mut subnets = std::collections::BTreeSet::new();
    while let Some(res) = set.join_next().await {
        let lease = res.unwrap().unwrap();
        assert!(subnets.insert(lease.overlay_subnet), "{lease} granted twice");
    }
    assert_eq!(subnets.len(), 20);
}

#[tokio::test]
async fn renewing_a_lost_lease_is_non_renewable() {
    let s = start(None).await;
    let c = client(&s);

    let stale = Lease::new(ip("10.0.0.1"), "10.255.7.0/24".parse().unwrap());
    assert!(matches!(c.renew_lease(&stale).await, Err(ClientError::NonRenewable)));

    let held = c.acquire_lease(ip("10.0.0.1"), false).await.unwrap();
    c.release_lease(ip("10.0.0.1")).await.unwrap();
    assert!(matches!(c.renew_lease(&held).await, Err(ClientError::NonRenewable)));
    // Releasing again is fine.
    c.release_lease(ip("10.0.0.1")).await.unwrap();
}

#[tokio::test]
async fn pool_mismatch_is_a_conflict() {
    let s = start(None).await;
    let c = client(&s);

    c.acquire_lease(ip("10.0.0.1"), false).await.unwrap();
    match c.acquire_lease(ip("10.0.0.1"), true).await {
        Err(ClientError::Conflict(resp)) => assert!(resp.suggestion.is_some()),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn pins_reach_the_store() {
    let s = start(None).await;
    let c = client(&s);

    c.acquire_lease(ip("10.0.0.1"), false).await.unwrap();
    c.pin_lease(ip("10.0.0.1"), true).await.unwrap();
    assert!(s.leases.records().unwrap()[0].pinned);

    match c.pin_lease(ip("10.0.0.9"), true).await {
        Err(ClientError::Status { status: 404, .. }) => {}
        other => panic!("expected 404, got {other:?}"),
    }
}

#[tokio::test]
async fn policies_and_tags() {
    let s = start(Some(
        r#"{"policies": [{
            "source": {"id": "app-a", "tag": "0001"},
            "destination": {"id": "app-b", "tag": "0002", "protocol": "tcp",
                            "ports": {"start": 8080, "end": 8080}}
        }]}"#,
    ))
    .await;
    let c = client(&s);

    let resp = c.policies().await.unwrap();
    assert_eq!(resp.policies.len(), 1);
    assert!(resp.egress_policies.is_empty());

    let t1 = c.create_or_get_tag("INGRESS_ROUTER", "router").await.unwrap();
    let t2 = c.create_or_get_tag("INGRESS_ROUTER", "router").await.unwrap();
    assert_eq!(t1, t2);
    assert_eq!(t1.tag.len(), 4);
}

#[tokio::test]
async fn no_policy_file_serves_nothing() {
    let s = start(None).await;
    let resp = client(&s).policies().await.unwrap();
    assert!(resp.policies.is_empty());
}
