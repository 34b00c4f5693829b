// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::{collections::BTreeSet, fmt, net::IpAddr};

use crate::error::{DuplicateHostnameError, ValidationError};

/// The parts a node can play in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    ControlPlane,
    Worker,
    Etcd,
    LoadBalancer,
}

impl Role {
    pub const ALL: [Role; 4] = [
        Role::ControlPlane,
        Role::Worker,
        Role::Etcd,
        Role::LoadBalancer,
    ];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::ControlPlane => "control-plane",
                Self::Worker => "worker",
                Self::Etcd => "etcd",
                Self::LoadBalancer => "load-balancer",
            }
        )
    }
}

impl TryFrom<&str> for Role {
    type Error = ValidationError;
    fn try_from(val: &str) -> Result<Self, Self::Error> {
        Ok(match val {
            "control-plane" => Self::ControlPlane,
            "worker" => Self::Worker,
            "etcd" => Self::Etcd,
            "load-balancer" => Self::LoadBalancer,
            _ => return Err(ValidationError::UnknownRole(val.to_string())),
        })
    }
}

/// One member of the cluster. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    hostname: String,
    address: IpAddr,
    access_address: IpAddr,
    roles: BTreeSet<Role>,
}

impl NodeSpec {
    /// Create a node. `access_address` is the address other nodes and the operator use to reach
    /// it; when `None`, the management address is used.
    pub fn new(
        hostname: &str,
        address: IpAddr,
        access_address: Option<IpAddr>,
        roles: impl IntoIterator<Item = Role>,
    ) -> Result<Self, ValidationError> {
        let roles: BTreeSet<Role> = roles.into_iter().collect();
        if roles.is_empty() {
            return Err(ValidationError::NoRoles(hostname.to_string()));
        }
        Ok(NodeSpec {
            hostname: hostname.to_string(),
            address,
            access_address: access_address.unwrap_or(address),
            roles,
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn access_address(&self) -> IpAddr {
        self.access_address
    }

    /// Roles in a stable order.
    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.roles.iter().copied()
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

impl fmt::Display for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.hostname, self.address)
    }
}

/// The set of nodes making up a cluster, in the order they were configured.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    nodes: Vec<NodeSpec>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Fails without changing the registry if the hostname is already present.
    pub fn add(&mut self, node: NodeSpec) -> Result<(), DuplicateHostnameError> {
        if self.get(node.hostname()).is_some() {
            return Err(DuplicateHostnameError(node.hostname().to_string()));
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn all(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn by_role(&self, role: Role) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(move |node| node.has_role(role))
    }

    pub fn get(&self, hostname: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|node| node.hostname() == hostname)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, last_octet: u8, roles: &[Role]) -> NodeSpec {
        NodeSpec::new(
            name,
            IpAddr::from([10, 255, 0, last_octet]),
            None,
            roles.iter().copied(),
        )
        .unwrap()
    }

    #[test]
    fn duplicate_hostname_leaves_registry_unchanged() {
        let mut registry = Registry::new();
        registry
            .add(node("knode01", 51, &[Role::ControlPlane]))
            .unwrap();
        registry.add(node("knode02", 52, &[Role::Worker])).unwrap();

        let err = registry
            .add(node("knode01", 99, &[Role::Worker]))
            .unwrap_err();

        assert_eq!(err, DuplicateHostnameError("knode01".to_string()));
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("knode01").unwrap().address(),
            IpAddr::from([10, 255, 0, 51])
        );
    }

    #[test]
    fn by_role_keeps_insertion_order() {
        let mut registry = Registry::new();
        registry
            .add(node("knode03", 53, &[Role::Worker, Role::Etcd]))
            .unwrap();
        registry
            .add(node("knode01", 51, &[Role::ControlPlane]))
            .unwrap();
        registry.add(node("knode02", 52, &[Role::Worker])).unwrap();

        let workers: Vec<&str> = registry
            .by_role(Role::Worker)
            .map(|n| n.hostname())
            .collect();
        assert_eq!(workers, vec!["knode03", "knode02"]);
        assert_eq!(registry.by_role(Role::LoadBalancer).count(), 0);
    }

    #[test]
    fn node_requires_a_role() {
        let err = NodeSpec::new("knode01", IpAddr::from([10, 0, 0, 1]), None, Vec::new()).unwrap_err();
        assert_eq!(err, ValidationError::NoRoles("knode01".to_string()));
    }

    #[test]
    fn access_address_defaults_to_management_address() {
        let n = node("knode01", 51, &[Role::Worker]);
        assert_eq!(n.access_address(), n.address());

        let n = NodeSpec::new(
            "knode02",
            IpAddr::from([10, 255, 0, 52]),
            Some(IpAddr::from([192, 168, 1, 52])),
            [Role::Worker],
        )
        .unwrap();
        assert_eq!(n.access_address(), IpAddr::from([192, 168, 1, 52]));
    }

    #[test]
    fn role_names_round_trip() {
        for role in Role::ALL {
            assert_eq!(Role::try_from(role.to_string().as_str()), Ok(role));
        }
        assert_eq!(
            Role::try_from("master"),
            Err(ValidationError::UnknownRole("master".to_string()))
        );
    }
}
