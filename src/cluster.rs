// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{error::Error, net::IpAddr};

use cidr::IpCidr;

use crate::{
    config::{self, Config},
    error::ValidationError,
    node::{NodeSpec, Registry, Role},
};

pub const DEFAULT_CLUSTER_NAME: &str = "cluster.local";

/// ClusterSpec is the validated, in-memory model of the cluster to deploy. It is built once per
/// run from the configuration file and is not modified afterwards.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    nodes: Registry,
    pub options: ClusterOptions,
}

/// Cluster-wide options, parsed out of `config::ClusterOptions`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOptions {
    pub cluster_name: Option<String>,
    pub kube_version: Option<String>,
    pub pod_network_cidr: Option<IpCidr>,
    pub service_cidr: Option<IpCidr>,
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

/// Read and parse the config file at `path`, or the default config path.
pub fn read_config(path: Option<&str>) -> Result<Config, Box<dyn Error>> {
    let path = match path {
        Some(path) => path.to_string(),
        None => crate::default_config_path(),
    };
    let config = std::fs::read_to_string(&path).inspect_err(|e| {
        eprintln!("Could not open config file \"{path}\": {e}");
    })?;
    let config: Config = toml::from_str(&config).inspect_err(|e| {
        eprintln!("Could not parse config file \"{path}\": {e}");
    })?;
    Ok(config)
}

impl ClusterSpec {
    pub fn new(nodes: Registry, options: ClusterOptions) -> Self {
        ClusterSpec { nodes, options }
    }

    /// Build a ClusterSpec from a parsed config file.
    ///
    /// This checks everything that can be checked about a single node (addresses, roles,
    /// duplicate hostnames) and the network options. Whole-cluster rules like quorum are left to
    /// `validate()`, so that a cluster description can be loaded and inspected even when it could
    /// not be deployed.
    pub fn from_config(conf: &Config) -> Result<Self, ValidationError> {
        let mut nodes = Registry::new();
        for node in conf.nodes.iter() {
            nodes.add(node_from_config(node)?)?;
        }

        let options = ClusterOptions {
            cluster_name: conf.cluster.cluster_name.clone(),
            kube_version: conf.cluster.kube_version.clone(),
            pod_network_cidr: parse_cidr("pod_network_cidr", &conf.cluster.pod_network_cidr)?,
            service_cidr: parse_cidr("service_cidr", &conf.cluster.service_cidr)?,
            etcd_colocated: conf.cluster.etcd_colocated,
        };

        if let (Some(pod), Some(service)) = (&options.pod_network_cidr, &options.service_cidr) {
            if cidrs_overlap(pod, service) {
                return Err(ValidationError::OverlappingCidrs {
                    pod: pod.to_string(),
                    service: service.to_string(),
                });
            }
        }

        Ok(Self::new(nodes, options))
    }

    pub fn nodes(&self) -> &Registry {
        &self.nodes
    }

    /// The cluster's name, used to identify it in logs and the journal.
    pub fn name(&self) -> &str {
        self.options
            .cluster_name
            .as_deref()
            .unwrap_or(DEFAULT_CLUSTER_NAME)
    }

    /// The nodes that will run etcd. With colocated etcd this is every control-plane node, plus
    /// any node that was explicitly given the etcd role.
    pub fn etcd_members(&self) -> Vec<&NodeSpec> {
        self.nodes
            .all()
            .iter()
            .filter(|node| {
                node.has_role(Role::Etcd)
                    || (self.options.etcd_colocated && node.has_role(Role::ControlPlane))
            })
            .collect()
    }

    /// Check the whole-cluster invariants: the cluster is not empty, has a control plane, and
    /// the etcd membership can form a quorum.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.nodes.is_empty() {
            return Err(ValidationError::EmptyCluster);
        }

        let etcd_count = self.etcd_members().len();
        if etcd_count > 0 && etcd_count % 2 == 0 {
            return Err(ValidationError::Quorum { count: etcd_count });
        }

        if self.nodes.by_role(Role::ControlPlane).next().is_none() {
            return Err(ValidationError::NoControlPlane);
        }

        Ok(())
    }

    pub fn print_summary(&self) {
        println!("Cluster has {} nodes:", self.nodes.len());
        for node in self.nodes.all() {
            let roles: Vec<String> = node.roles().map(|r| r.to_string()).collect();
            println!("    {node}: [{}]", roles.join(", "));
        }
        for role in Role::ALL {
            println!("{role}: {}", self.nodes.by_role(role).count());
        }
        println!(
            "etcd members: {}{}",
            self.etcd_members().len(),
            if self.options.etcd_colocated {
                " (colocated)"
            } else {
                ""
            }
        );
        if let Some(version) = &self.options.kube_version {
            println!("kubernetes version: {version}");
        }
    }
}

fn node_from_config(node: &config::Node) -> Result<NodeSpec, ValidationError> {
    let parse_addr = |address: &str| -> Result<IpAddr, ValidationError> {
        address
            .parse::<IpAddr>()
            .map_err(|_| ValidationError::InvalidAddress {
                hostname: node.hostname.clone(),
                address: address.to_string(),
            })
    };

    let address = parse_addr(&node.address)?;
    let access_address = node
        .access_address
        .as_deref()
        .map(parse_addr)
        .transpose()?;
    let roles = node
        .roles
        .iter()
        .map(|role| Role::try_from(role.as_str()))
        .collect::<Result<Vec<Role>, ValidationError>>()?;

    NodeSpec::new(&node.hostname, address, access_address, roles)
}

fn parse_cidr(
    field: &'static str,
    value: &Option<String>,
) -> Result<Option<IpCidr>, ValidationError> {
    value
        .as_deref()
        .map(|v| {
            v.parse::<IpCidr>()
                .map_err(|e| ValidationError::InvalidCidr {
                    field,
                    value: v.to_string(),
                    reason: e.to_string(),
                })
        })
        .transpose()
}

/// Two CIDR blocks overlap exactly when one contains the other's first address.
fn cidrs_overlap(a: &IpCidr, b: &IpCidr) -> bool {
    a.contains(&b.first_address()) || b.contains(&a.first_address())
}
