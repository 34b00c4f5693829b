// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeMap, time::Duration};

use {
    log::{debug, info, warn},
    serde::Deserialize,
    tokio::process::Command,
    tokio_util::sync::CancellationToken,
};

use crate::{config::VerifyOptions, error::VerificationError};

/// Reports whether each node of a running cluster is Ready.
#[allow(async_fn_in_trait)]
pub trait ClusterStatus {
    /// Map of node name to readiness, for every node the cluster knows about.
    async fn node_readiness(&self) -> Result<BTreeMap<String, bool>, String>;
}

/// Bounded, exponentially growing delays between readiness polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_options(options: &VerifyOptions) -> Self {
        Self {
            attempts: options.attempts.max(1),
            initial: Duration::from_secs(options.initial_backoff_secs),
            max: Duration::from_secs(options.max_backoff_secs),
        }
    }

    /// The delay after failed attempt number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

pub struct Verifier<S> {
    status: S,
    backoff: Backoff,
}

impl<S: ClusterStatus> Verifier<S> {
    pub fn new(status: S, backoff: Backoff) -> Self {
        Self { status, backoff }
    }

    pub fn status(&self) -> &S {
        &self.status
    }

    /// Poll until every node in `expected` reports Ready, or the attempts run out.
    ///
    /// A failed status query counts as a failed attempt. If no query ever succeeded, the last
    /// query error is returned instead of a timeout.
    pub async fn wait_ready(
        &self,
        expected: &[&str],
        cancel: &CancellationToken,
    ) -> Result<(), VerificationError> {
        let mut not_ready: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        let mut last_error = None;
        let mut answered = false;

        for attempt in 0..self.backoff.attempts {
            if cancel.is_cancelled() {
                return Err(VerificationError::Canceled);
            }

            match self.status.node_readiness().await {
                Ok(readiness) => {
                    answered = true;
                    not_ready = unready_nodes(expected, &readiness);
                    if not_ready.is_empty() {
                        info!("all {} nodes are ready", expected.len());
                        return Ok(());
                    }
                    debug!(
                        "attempt {}: waiting on {}",
                        attempt + 1,
                        not_ready.join(", ")
                    );
                }
                Err(e) => {
                    warn!("attempt {}: could not get node status: {e}", attempt + 1);
                    last_error = Some(e);
                }
            }

            if attempt + 1 < self.backoff.attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(VerificationError::Canceled),
                    _ = tokio::time::sleep(self.backoff.delay(attempt)) => {}
                }
            }
        }

        match last_error {
            Some(e) if !answered => Err(VerificationError::Status(e)),
            _ => Err(VerificationError::Timeout {
                attempts: self.backoff.attempts,
                not_ready,
            }),
        }
    }
}

/// Expected nodes that are missing from `readiness` or not Ready, in the order given.
fn unready_nodes(expected: &[&str], readiness: &BTreeMap<String, bool>) -> Vec<String> {
    expected
        .iter()
        .filter(|name| !readiness.get(**name).copied().unwrap_or(false))
        .map(|name| name.to_string())
        .collect()
}

/// Queries node status with `kubectl get nodes -o json`.
#[derive(Debug, Clone)]
pub struct KubectlStatus {
    kubeconfig: String,
    api_endpoint: Option<String>,
}

impl KubectlStatus {
    pub fn new(options: &VerifyOptions) -> Self {
        Self {
            kubeconfig: options
                .kubeconfig
                .clone()
                .unwrap_or_else(crate::default_kubeconfig),
            api_endpoint: options.api_endpoint.clone(),
        }
    }
}

impl ClusterStatus for KubectlStatus {
    async fn node_readiness(&self) -> Result<BTreeMap<String, bool>, String> {
        let mut command = Command::new("kubectl");
        command.arg("--kubeconfig").arg(&self.kubeconfig);
        if let Some(server) = &self.api_endpoint {
            command.arg("--server").arg(server);
        }
        let output = command
            .args(["get", "nodes", "-o", "json"])
            .output()
            .await
            .map_err(|e| format!("could not run kubectl: {e}"))?;

        if !output.status.success() {
            return Err(format!(
                "kubectl failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        parse_node_readiness(&String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Deserialize)]
struct NodeList {
    items: Vec<KubeNode>,
}

#[derive(Deserialize)]
struct KubeNode {
    metadata: Metadata,
    #[serde(default)]
    status: Option<NodeStatus>,
}

#[derive(Deserialize)]
struct Metadata {
    name: String,
}

#[derive(Deserialize)]
struct NodeStatus {
    #[serde(default)]
    conditions: Vec<Condition>,
}

#[derive(Deserialize)]
struct Condition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

/// Parse `kubectl get nodes -o json` output into node readiness.
pub fn parse_node_readiness(json: &str) -> Result<BTreeMap<String, bool>, String> {
    let list: NodeList =
        serde_json::from_str(json).map_err(|e| format!("bad node list from kubectl: {e}"))?;
    Ok(list
        .items
        .into_iter()
        .map(|node| {
            let ready = node.status.is_some_and(|status| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.kind == "Ready" && c.status == "True")
            });
            (node.metadata.name, ready)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff = Backoff {
            attempts: 6,
            initial: Duration::from_secs(5),
            max: Duration::from_secs(30),
        };
        let delays: Vec<u64> = (0..5).map(|i| backoff.delay(i).as_secs()).collect();
        assert_eq!(delays, vec![5, 10, 20, 30, 30]);
        assert_eq!(backoff.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn kubectl_output() {
        let json = r#"{
            "apiVersion": "v1",
            "items": [
                {"metadata": {"name": "knode01"},
                 "status": {"conditions": [
                    {"type": "MemoryPressure", "status": "False"},
                    {"type": "Ready", "status": "True"}]}},
                {"metadata": {"name": "knode02"},
                 "status": {"conditions": [{"type": "Ready", "status": "False"}]}},
                {"metadata": {"name": "knode03"}}
            ]
        }"#;
        let readiness = parse_node_readiness(json).unwrap();
        assert_eq!(readiness.get("knode01"), Some(&true));
        assert_eq!(readiness.get("knode02"), Some(&false));
        assert_eq!(readiness.get("knode03"), Some(&false));

        assert!(parse_node_readiness("not json").is_err());
    }

    #[test]
    fn missing_nodes_are_not_ready() {
        let readiness = BTreeMap::from([("knode01".to_string(), true)]);
        assert_eq!(
            unready_nodes(&["knode01", "knode02"], &readiness),
            vec!["knode02"]
        );
    }
}
