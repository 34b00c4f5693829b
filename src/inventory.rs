// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Renders a ClusterSpec into the YAML inventory consumed by the Kubespray playbooks.
//!
//! Rendering is a pure function of the ClusterSpec. Maps are built in registry order, so the same
//! spec always yields the same bytes and a re-render never produces a diff.

use std::fmt;

use serde_yaml::{Mapping, Value};

use crate::{
    cluster::ClusterSpec,
    error::ValidationError,
    node::{NodeSpec, Role},
};

pub const CONTROL_PLANE_GROUP: &str = "kube_control_plane";
pub const WORKER_GROUP: &str = "kube_node";
pub const ETCD_GROUP: &str = "etcd";
pub const LOAD_BALANCER_GROUP: &str = "load_balancer";
/// Umbrella group over the control-plane and worker groups.
pub const CLUSTER_GROUP: &str = "k8s_cluster";
/// Route reflector group. The playbooks expect it to exist even when it is empty.
pub const CALICO_RR_GROUP: &str = "calico_rr";

/// A rendered inventory. Two documents are equal exactly when their bytes are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryDocument {
    text: String,
}

impl InventoryDocument {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }
}

impl fmt::Display for InventoryDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn key(s: &str) -> Value {
    Value::String(s.to_string())
}

fn host_vars(node: &NodeSpec) -> Value {
    let mut vars = Mapping::new();
    vars.insert(key("ansible_host"), key(&node.address().to_string()));
    vars.insert(key("ip"), key(&node.address().to_string()));
    vars.insert(key("access_ip"), key(&node.access_address().to_string()));
    Value::Mapping(vars)
}

/// A group listing `members` by hostname.
fn group<'a>(members: impl Iterator<Item = &'a NodeSpec>) -> Value {
    let mut hosts = Mapping::new();
    for node in members {
        hosts.insert(key(node.hostname()), Value::Mapping(Mapping::new()));
    }
    let mut group = Mapping::new();
    group.insert(key("hosts"), Value::Mapping(hosts));
    Value::Mapping(group)
}

fn cluster_vars(spec: &ClusterSpec) -> Mapping {
    let opts = &spec.options;
    let mut vars = Mapping::new();
    if let Some(version) = &opts.kube_version {
        vars.insert(key("kube_version"), key(version));
    }
    if let Some(cidr) = &opts.pod_network_cidr {
        vars.insert(key("kube_pods_subnet"), key(&cidr.to_string()));
    }
    if let Some(cidr) = &opts.service_cidr {
        vars.insert(key("kube_service_addresses"), key(&cidr.to_string()));
    }
    if let Some(name) = &opts.cluster_name {
        vars.insert(key("cluster_name"), key(name));
    }
    if !opts.etcd_colocated {
        vars.insert(key("etcd_deployment_type"), key("host"));
    }
    vars
}

/// Render the inventory for `spec`.
///
/// Each role becomes a group, and a node with several roles is listed in each of them. Fails if
/// the cluster is empty, has no control plane, or its etcd membership is even.
pub fn render(spec: &ClusterSpec) -> Result<InventoryDocument, ValidationError> {
    spec.validate()?;
    let nodes = spec.nodes();

    let mut hosts = Mapping::new();
    for node in nodes.all() {
        hosts.insert(key(node.hostname()), host_vars(node));
    }

    let mut children = Mapping::new();
    children.insert(
        key(CONTROL_PLANE_GROUP),
        group(nodes.by_role(Role::ControlPlane)),
    );
    children.insert(key(WORKER_GROUP), group(nodes.by_role(Role::Worker)));
    children.insert(key(ETCD_GROUP), group(spec.etcd_members().into_iter()));
    if nodes.by_role(Role::LoadBalancer).next().is_some() {
        children.insert(
            key(LOAD_BALANCER_GROUP),
            group(nodes.by_role(Role::LoadBalancer)),
        );
    }

    let mut umbrella = Mapping::new();
    umbrella.insert(key(CONTROL_PLANE_GROUP), Value::Mapping(Mapping::new()));
    umbrella.insert(key(WORKER_GROUP), Value::Mapping(Mapping::new()));
    let mut cluster_group = Mapping::new();
    cluster_group.insert(key("children"), Value::Mapping(umbrella));
    children.insert(key(CLUSTER_GROUP), Value::Mapping(cluster_group));
    children.insert(key(CALICO_RR_GROUP), group(std::iter::empty()));

    let mut all = Mapping::new();
    all.insert(key("hosts"), Value::Mapping(hosts));
    all.insert(key("children"), Value::Mapping(children));
    let vars = cluster_vars(spec);
    if !vars.is_empty() {
        all.insert(key("vars"), Value::Mapping(vars));
    }

    let mut root = Mapping::new();
    root.insert(key("all"), Value::Mapping(all));

    let text = serde_yaml::to_string(&Value::Mapping(root))
        .map_err(|e| ValidationError::Serialize(e.to_string()))?;
    Ok(InventoryDocument { text })
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::{
        cluster::ClusterOptions,
        node::{NodeSpec, Registry},
    };

    fn spec(nodes: &[(&str, &[Role])]) -> ClusterSpec {
        let mut registry = Registry::new();
        for (i, (name, roles)) in nodes.iter().enumerate() {
            registry
                .add(
                    NodeSpec::new(
                        name,
                        IpAddr::from([10, 255, 0, 51 + i as u8]),
                        None,
                        roles.iter().copied(),
                    )
                    .unwrap(),
                )
                .unwrap();
        }
        ClusterSpec::new(registry, ClusterOptions::default())
    }

    const ALL: &[Role] = &[Role::ControlPlane, Role::Worker, Role::Etcd];

    fn groups_of(doc: &InventoryDocument) -> Mapping {
        let parsed: Value = serde_yaml::from_str(doc.as_str()).unwrap();
        parsed["all"]["children"].as_mapping().unwrap().clone()
    }

    fn members(groups: &Mapping, name: &str) -> Vec<String> {
        groups[name]["hosts"]
            .as_mapping()
            .unwrap()
            .keys()
            .map(|k| k.as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn empty_cluster_fails() {
        assert_eq!(
            render(&spec(&[])).unwrap_err(),
            ValidationError::EmptyCluster
        );
    }

    #[test]
    fn even_control_plane_fails_odd_renders() {
        let two = spec(&[("knode01", ALL), ("knode02", ALL)]);
        assert_eq!(
            render(&two).unwrap_err(),
            ValidationError::Quorum { count: 2 }
        );

        let three = spec(&[("knode01", ALL), ("knode02", ALL), ("knode03", ALL)]);
        let doc = render(&three).unwrap();
        let groups = groups_of(&doc);
        for name in [CONTROL_PLANE_GROUP, WORKER_GROUP, ETCD_GROUP] {
            assert_eq!(members(&groups, name), vec!["knode01", "knode02", "knode03"]);
        }
    }

    #[test]
    fn rendering_is_byte_identical() {
        let s = spec(&[
            ("knode01", ALL),
            ("knode02", &[Role::Worker]),
            ("knode03", &[Role::Worker, Role::LoadBalancer]),
        ]);
        let first = render(&s).unwrap();
        let second = render(&s.clone()).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn multi_role_nodes_and_umbrella_group() {
        let s = spec(&[
            ("knode01", ALL),
            ("knode02", &[Role::Worker]),
            ("lb01", &[Role::LoadBalancer]),
        ]);
        let doc = render(&s).unwrap();
        let groups = groups_of(&doc);

        assert_eq!(members(&groups, CONTROL_PLANE_GROUP), vec!["knode01"]);
        assert_eq!(members(&groups, WORKER_GROUP), vec!["knode01", "knode02"]);
        assert_eq!(members(&groups, ETCD_GROUP), vec!["knode01"]);
        assert_eq!(members(&groups, LOAD_BALANCER_GROUP), vec!["lb01"]);
        assert!(members(&groups, CALICO_RR_GROUP).is_empty());

        let umbrella: Vec<&str> = groups[CLUSTER_GROUP]["children"]
            .as_mapping()
            .unwrap()
            .keys()
            .map(|k| k.as_str().unwrap())
            .collect();
        assert_eq!(umbrella, vec![CONTROL_PLANE_GROUP, WORKER_GROUP]);
    }

    #[test]
    fn host_and_cluster_vars() {
        let mut registry = Registry::new();
        registry
            .add(
                NodeSpec::new(
                    "knode01",
                    IpAddr::from([10, 255, 0, 51]),
                    Some(IpAddr::from([192, 168, 1, 51])),
                    ALL.iter().copied(),
                )
                .unwrap(),
            )
            .unwrap();
        let options = ClusterOptions {
            kube_version: Some("v1.29.3".to_string()),
            pod_network_cidr: Some("10.233.64.0/18".parse().unwrap()),
            ..ClusterOptions::default()
        };
        let doc = render(&ClusterSpec::new(registry, options)).unwrap();
        let parsed: Value = serde_yaml::from_str(doc.as_str()).unwrap();

        let host = &parsed["all"]["hosts"]["knode01"];
        assert_eq!(host["ansible_host"].as_str(), Some("10.255.0.51"));
        assert_eq!(host["ip"].as_str(), Some("10.255.0.51"));
        assert_eq!(host["access_ip"].as_str(), Some("192.168.1.51"));

        let vars = &parsed["all"]["vars"];
        assert_eq!(vars["kube_version"].as_str(), Some("v1.29.3"));
        assert_eq!(vars["kube_pods_subnet"].as_str(), Some("10.233.64.0/18"));
        assert!(vars.get("kube_service_addresses").is_none());
    }
}
