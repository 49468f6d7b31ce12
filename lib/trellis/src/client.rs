// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The controller's HTTP client.
//!
//! The convergers never see HTTP: they consume [`LeaseSource`] and
//! [`PolicySource`], which [`ControllerClient`] implements over
//! `reqwest` and the fakes implement in memory.

use async_trait::async_trait;
use reqwest::Certificate;
use reqwest::Client;
use reqwest::Identity;
use reqwest::Method;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
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

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("controller returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decoding {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("lease is not renewable")]
    NonRenewable,

    #[error("controller refused: {0}")]
    Conflict(ErrorResp),

    #[error("tls setup: {0}")]
    Tls(String),
}

/// Where the convergers and the bootstrap get leases from.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    async fn acquire_lease(
        &self,
        underlay_ip: Ipv4Addr,
        single_overlay_ip: bool,
    ) -> Result<Lease, ClientError>;

    /// Fails with [`ClientError::NonRenewable`] when the controller no
    /// longer holds exactly this binding.
    async fn renew_lease(&self, lease: &Lease) -> Result<(), ClientError>;

    async fn routable_leases(&self) -> Result<Vec<Lease>, ClientError>;
}

/// Where the policy converger gets policies and tags from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn policies(&self) -> Result<PoliciesResp, ClientError>;

    /// Return the tag for `(id, tag_type)`, creating it if needed.
    async fn create_or_get_tag(&self, id: &str, tag_type: &str) -> Result<Tag, ClientError>;
}

/// The mutual-TLS material for talking to the controller.
#[derive(Clone, Debug)]
pub struct TlsFiles {
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

fn read(path: &PathBuf) -> Result<Vec<u8>, ClientError> {
    std::fs::read(path).map_err(|e| ClientError::Tls(format!("{}: {e}", path.display())))
}

#[derive(Clone, Debug)]
pub struct ControllerClient {
    client: Client,
    base_url: String,
}

impl ControllerClient {
    /// A client authenticating with `tls`.
    pub fn new(base_url: &str, tls: &TlsFiles, timeout: Duration) -> Result<Self, ClientError> {
        let ca = Certificate::from_pem(&read(&tls.ca_cert)?)
            .map_err(|e| ClientError::Tls(format!("ca cert: {e}")))?;
        let mut pem = read(&tls.client_cert)?;
        pem.push(b'\n');
        pem.extend(read(&tls.client_key)?);
        let identity =
            Identity::from_pem(&pem).map_err(|e| ClientError::Tls(format!("identity: {e}")))?;

        let client = Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        Ok(Self::with_client(base_url, client))
    }

    /// A client without TLS, for tooling on the controller host and tests.
    pub fn plain(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base_url, client))
    }

    fn with_client(base_url: &str, client: Client) -> Self {
        Self { client, base_url: base_url.trim_end_matches('/').to_string() }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call<B, R>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        what: &'static str,
    ) -> Result<R, ClientError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        match status {
            s if s.is_success() => serde_json::from_slice(&bytes)
                .map_err(|source| ClientError::Decode { what, source }),
            StatusCode::CONFLICT => match serde_json::from_slice::<ErrorResp>(&bytes) {
                Ok(e) => Err(ClientError::Conflict(e)),
                Err(_) => Err(ClientError::Conflict(ErrorResp::new(
                    String::from_utf8_lossy(&bytes).into_owned(),
                ))),
            },
            s => Err(ClientError::Status {
                status: s.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }),
        }
    }

    pub async fn release_lease(&self, underlay_ip: Ipv4Addr) -> Result<(), ClientError> {
        let _: serde_json::Value = self
            .call(Method::POST, "/leases/release", Some(&ReleaseLeaseReq { underlay_ip }), "release")
            .await?;
        Ok(())
    }

    pub async fn pin_lease(&self, underlay_ip: Ipv4Addr, pinned: bool) -> Result<(), ClientError> {
        let _: serde_json::Value = self
            .call(Method::POST, "/leases/pin", Some(&PinLeaseReq { underlay_ip, pinned }), "pin")
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseSource for ControllerClient {
    async fn acquire_lease(
        &self,
        underlay_ip: Ipv4Addr,
        single_overlay_ip: bool,
    ) -> Result<Lease, ClientError> {
        let req = AcquireLeaseReq { underlay_ip, single_overlay_ip };
        self.call(Method::POST, "/leases/acquire", Some(&req), "lease").await
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<(), ClientError> {
        let req = RenewLeaseReq { lease: *lease };
        let res: Result<serde_json::Value, _> =
            self.call(Method::PUT, "/leases/renew", Some(&req), "renew").await;
        match res {
            Ok(_) => Ok(()),
            Err(ClientError::Status { status: 404, .. }) => Err(ClientError::NonRenewable),
            Err(e) => Err(e),
        }
    }

    async fn routable_leases(&self) -> Result<Vec<Lease>, ClientError> {
        let resp: LeasesResp = self.call::<(), _>(Method::GET, "/leases", None, "leases").await?;
        Ok(resp.leases)
    }
}

#[async_trait]
impl PolicySource for ControllerClient {
    async fn policies(&self) -> Result<PoliciesResp, ClientError> {
        self.call::<(), _>(Method::GET, "/policies", None, "policies").await
    }

    async fn create_or_get_tag(&self, id: &str, tag_type: &str) -> Result<Tag, ClientError> {
        let req = TagReq { id: id.to_string(), tag_type: tag_type.to_string() };
        self.call(Method::POST, "/tags", Some(&req), "tag").await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trims_trailing_slash() {
        let c = ControllerClient::plain("http://127.0.0.1:4242/", Duration::from_secs(1)).unwrap();
        assert_eq!(c.base_url(), "http://127.0.0.1:4242");
    }

    #[test]
    fn missing_tls_material() {
        let tls = TlsFiles {
            ca_cert: "/nonexistent/ca.pem".into(),
            client_cert: "/nonexistent/cert.pem".into(),
            client_key: "/nonexistent/key.pem".into(),
        };
        let err = ControllerClient::new("https://x", &tls, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ClientError::Tls(_)));
    }

    #[tokio::test]
    async fn unreachable_controller_is_transport() {
        // Nothing listens on the discard port of the loopback.
        let c = ControllerClient::plain("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = c.routable_leases().await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }
}
