// src/core/failsafe.rs

//! Failsafe mode (§4.6): when DCS is unreachable but the leader can still
//! reach every known member directly over HTTP and each one confirms "you
//! are still my leader", the leader retains primary status despite its
//! lease having expired in DCS. Members that cannot reach the leader
//! demote on their own once their cached view of the leader goes stale.
//! The HTTP leg uses `reqwest`, the same crate already used elsewhere for
//! outbound calls, kept behind a trait so the control loop's decision is
//! exercised in tests without a live network.

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait FailsafeClient: Send + Sync {
    /// Asks a peer's API whether it still considers `leader_name` its
    /// leader. Returns `false` on any network failure, not only a negative
    /// answer — an unreachable peer cannot vouch for anything.
    async fn confirm_leader(&self, member_api_url: &str, leader_name: &str) -> bool;
}

/// Production implementation: POSTs to `<api_url>/failsafe` with the
/// candidate leader's name; any non-success response or transport error
/// counts as "did not confirm".
pub struct ReqwestFailsafeClient {
    client: reqwest::Client,
}

impl ReqwestFailsafeClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestFailsafeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FailsafeClient for ReqwestFailsafeClient {
    async fn confirm_leader(&self, member_api_url: &str, leader_name: &str) -> bool {
        let url = format!("{member_api_url}/failsafe");
        match self
            .client
            .post(&url)
            .json(&serde_json::json!({ "name": leader_name }))
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), %member_api_url, "member rejected failsafe leader confirmation");
                false
            }
            Err(e) => {
                warn!(error = %e, %member_api_url, "failsafe ping failed");
                false
            }
        }
    }
}

/// Retains leadership iff every given member confirms. An empty member list
/// (a single-node cluster, or one where every peer has already expired out
/// of the local cache) trivially passes.
pub async fn confirm_all(
    client: &dyn FailsafeClient,
    members: &[(String, String)],
    leader_name: &str,
) -> bool {
    for (name, api_url) in members {
        if !client.confirm_leader(api_url, leader_name).await {
            warn!(member = %name, "failsafe check failed, member did not confirm leadership");
            return false;
        }
    }
    true
}
