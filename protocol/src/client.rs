use reqwest::StatusCode;
use std::time::Duration;

use crate::error::{MeshError, Result};
use crate::persist::PeerAddress;
use crate::types::{Identifier, NodeId, ResolveResponse, ResolveStatus, SkipList};

/// Outbound side of the peer protocol. Every call is bounded by a timeout
/// and a peer that cannot be reached surfaces as [`MeshError::Unreachable`].
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    probe_timeout: Duration,
}

fn unreachable(peer: &str, err: reqwest::Error) -> MeshError {
    MeshError::Unreachable {
        peer: peer.to_string(),
        reason: err.to_string(),
    }
}

async fn read_identity(base_url: &str, resp: reqwest::Response) -> Result<NodeId> {
    if !resp.status().is_success() {
        return Err(MeshError::Protocol(format!(
            "identity request returned HTTP {}",
            resp.status()
        )));
    }
    let body = resp.text().await.map_err(|e| unreachable(base_url, e))?;
    NodeId::parse_str(body.trim())
        .map_err(|_| MeshError::Protocol(format!("broken identity '{}'", body.trim())))
}

impl PeerClient {
    pub fn new(request_timeout: Duration, probe_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            probe_timeout,
        })
    }

    /// Ask a peer for its server identity.
    pub async fn identity(&self, base_url: &str) -> Result<NodeId> {
        let url = format!("{}/identity", base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| unreachable(base_url, e))?;
        read_identity(base_url, resp).await
    }

    /// Ask a peer for its server identity and have it register `callback`
    /// as one of its own peers.
    pub async fn introduce(&self, base_url: &str, callback: &PeerAddress) -> Result<NodeId> {
        let url = format!("{}/identity", base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .timeout(self.probe_timeout)
            .json(callback)
            .send()
            .await
            .map_err(|e| unreachable(base_url, e))?;
        read_identity(base_url, resp).await
    }

    /// Send a location query carrying the current skip list.
    pub async fn resolve(
        &self,
        base_url: &str,
        id: &Identifier,
        skip: &SkipList,
    ) -> Result<ResolveResponse> {
        let url = format!("{}/resolve", base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .query(&[("id", id.to_string()), ("skip", skip.to_query_param())])
            .send()
            .await
            .map_err(|e| unreachable(base_url, e))?;

        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::NOT_FOUND {
            return Err(MeshError::Protocol(format!("resolve returned HTTP {status}")));
        }
        let answer: ResolveResponse = resp
            .json()
            .await
            .map_err(|e| MeshError::Protocol(format!("malformed resolve answer: {e}")))?;

        if answer.skip.len() < skip.len() {
            return Err(MeshError::Protocol(format!(
                "peer shrank the skip list from {} to {}",
                skip.len(),
                answer.skip.len()
            )));
        }
        if answer.status == ResolveStatus::Found && answer.url.is_none() {
            return Err(MeshError::Protocol("found answer without url".into()));
        }
        Ok(answer)
    }

    /// Download a staged container.
    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| unreachable(url, e))?;
        if !resp.status().is_success() {
            return Err(MeshError::Protocol(format!(
                "download of '{url}' returned HTTP {}",
                resp.status()
            )));
        }
        let bytes = resp.bytes().await.map_err(|e| unreachable(url, e))?;
        Ok(bytes.to_vec())
    }
}
