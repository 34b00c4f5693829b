// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use serde::{Deserialize, Serialize};

/// Config, along with its children, is the model for a cluster used in the kubeboot
/// configuration file. The config file is deserialized into a Config object.
///
/// The model used in the config file is intentionally different from the validated model used at
/// run time (`cluster::ClusterSpec`). Addresses and roles are plain strings here and are parsed
/// and checked when the ClusterSpec is built, so that the file format can stay forgiving.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterOptions,
    #[serde(default)]
    pub playbook: PlaybookOptions,
    #[serde(default)]
    pub preflight: PreflightOptions,
    #[serde(default)]
    pub verify: VerifyOptions,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a Node to the given Config.
    pub fn add_node(&mut self, n: Node) {
        self.nodes.push(n);
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Node {
    pub hostname: String,
    /// Management address.
    pub address: String,
    /// Address used to reach the node, if different from `address`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_address: Option<String>,
    pub roles: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClusterOptions {
    pub cluster_name: Option<String>,
    pub kube_version: Option<String>,
    pub pod_network_cidr: Option<String>,
    pub service_cidr: Option<String>,
    pub etcd_colocated: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            cluster_name: None,
            kube_version: None,
            pod_network_cidr: None,
            service_cidr: None,
            etcd_colocated: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct PlaybookOptions {
    /// Directory containing `cluster.yml` and `reset.yml`.
    pub dir: Option<String>,
    /// Program used to run a playbook, `ansible-playbook` by default.
    pub program: Option<String>,
    pub inventory_path: Option<String>,
    pub fact_cache_dir: Option<String>,
    /// Run with privilege escalation (`--become`).
    #[serde(rename = "become")]
    pub elevate: bool,
    pub become_user: Option<String>,
    /// Extra output fragments that identify a failure caused by a stale fact cache.
    pub stale_cache_markers: Vec<String>,
    /// Run the reset playbook when a deploy fails after the playbook was started.
    pub reset_on_failure: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PreflightOptions {
    pub concurrency: usize,
    pub ssh_port: u16,
    pub ssh_user: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for PreflightOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            ssh_port: 22,
            ssh_user: None,
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct VerifyOptions {
    pub attempts: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub kubeconfig: Option<String>,
    pub api_endpoint: Option<String>,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial_backoff_secs: 5,
            max_backoff_secs: 60,
            kubeconfig: None,
            api_endpoint: None,
        }
    }
}
