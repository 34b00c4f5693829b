// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Read-only readiness checks run against every node before anything is changed.
//!
//! Nothing in this module modifies a node. Turning off swap, enabling forwarding or opening
//! firewall ports are remediation steps for the operator; the checker only reports what is wrong.

use std::{fmt, time::Duration};

use {
    futures::{stream, StreamExt},
    log::{debug, info},
    tokio::process::Command,
};

use crate::{
    config::PreflightOptions,
    node::{NodeSpec, Role},
};

/// The outcome of checking one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightResult {
    Ready,
    /// Every unmet condition, not just the first one found.
    Failed(Vec<String>),
}

impl PreflightResult {
    pub fn is_ready(&self) -> bool {
        matches!(self, PreflightResult::Ready)
    }
}

/// A preflight result for a named node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub hostname: String,
    pub result: PreflightResult,
}

/// The reasons a single node is not ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeFailure {
    pub hostname: String,
    pub reasons: Vec<String>,
}

/// Collect the failed nodes out of a set of reports, keeping their order.
pub fn failures(reports: &[NodeReport]) -> Vec<NodeFailure> {
    reports
        .iter()
        .filter_map(|report| match &report.result {
            PreflightResult::Ready => None,
            PreflightResult::Failed(reasons) => Some(NodeFailure {
                hostname: report.hostname.clone(),
                reasons: reasons.clone(),
            }),
        })
        .collect()
}

/// An inclusive range of TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub const fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Parse one entry of `firewall-cmd --list-ports` output, such as `6443/tcp` or
    /// `30000-32767/tcp`. Entries for other protocols return `None`.
    pub fn from_firewall_entry(entry: &str) -> Option<Self> {
        let (ports, proto) = entry.split_once('/')?;
        if proto != "tcp" {
            return None;
        }
        match ports.split_once('-') {
            Some((start, end)) => Some(Self::range(start.parse().ok()?, end.parse().ok()?)),
            None => Some(Self::single(ports.parse().ok()?)),
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Inbound ports that must be reachable on a node holding `role`.
pub fn role_ports(role: Role) -> &'static [PortRange] {
    const CONTROL_PLANE: [PortRange; 5] = [
        PortRange::single(6443),
        PortRange::range(2379, 2380),
        PortRange::single(10250),
        PortRange::single(10259),
        PortRange::single(10257),
    ];
    const WORKER: [PortRange; 3] = [
        PortRange::single(10250),
        PortRange::single(10256),
        PortRange::range(30000, 32767),
    ];
    match role {
        Role::ControlPlane => &CONTROL_PLANE,
        Role::Worker => &WORKER,
        Role::Etcd | Role::LoadBalancer => &[],
    }
}

/// The deduplicated, sorted set of ports required by all of a node's roles.
pub fn required_ports(node: &NodeSpec) -> Vec<PortRange> {
    let mut ports: Vec<PortRange> = node
        .roles()
        .flat_map(|role| role_ports(role).iter().copied())
        .collect();
    ports.sort();
    ports.dedup();
    ports
}

/// What the node's firewall lets through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallState {
    /// No firewall is running; every port is reachable.
    Inactive,
    Active { open: Vec<PortRange> },
}

impl FirewallState {
    /// Return the members of `required` that are not fully opened by this firewall.
    pub fn blocked(&self, required: &[PortRange]) -> Vec<PortRange> {
        match self {
            FirewallState::Inactive => Vec::new(),
            FirewallState::Active { open } => required
                .iter()
                .filter(|range| !is_covered(range, open))
                .copied()
                .collect(),
        }
    }
}

/// Whether every port in `range` falls inside some member of `open`.
fn is_covered(range: &PortRange, open: &[PortRange]) -> bool {
    let mut next = range.start as u32;
    while next <= range.end as u32 {
        match open
            .iter()
            .find(|o| o.start as u32 <= next && next <= o.end as u32)
        {
            Some(o) => next = o.end as u32 + 1,
            None => return false,
        }
    }
    true
}

/// Read-only queries against a node. Each method reports an error string if the query itself
/// could not be performed.
#[allow(async_fn_in_trait)]
pub trait NodeProbe {
    /// Connect to the node's reachable address.
    async fn connect(&self, node: &NodeSpec) -> Result<(), String>;

    /// Active swap devices; empty when swap is off.
    async fn swap_devices(&self, node: &NodeSpec) -> Result<Vec<String>, String>;

    async fn ipv4_forwarding(&self, node: &NodeSpec) -> Result<bool, String>;

    async fn firewall(&self, node: &NodeSpec) -> Result<FirewallState, String>;
}

pub struct Checker<P> {
    probe: P,
}

impl<P: NodeProbe> Checker<P> {
    pub fn new(probe: P) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Check a single node. Every condition is evaluated, so a failed result lists all problems.
    pub async fn check(&self, node: &NodeSpec) -> PreflightResult {
        let mut reasons = Vec::new();

        if let Err(e) = self.probe.connect(node).await {
            reasons.push(format!("unreachable at {}: {e}", node.access_address()));
        }

        match self.probe.swap_devices(node).await {
            Ok(devices) if devices.is_empty() => {}
            Ok(devices) => reasons.push(format!("swap enabled ({})", devices.join(", "))),
            Err(e) => reasons.push(format!("could not check swap: {e}")),
        }

        match self.probe.ipv4_forwarding(node).await {
            Ok(true) => {}
            Ok(false) => reasons.push("ipv4 forwarding disabled".to_string()),
            Err(e) => reasons.push(format!("could not check ipv4 forwarding: {e}")),
        }

        let required = required_ports(node);
        if !required.is_empty() {
            match self.probe.firewall(node).await {
                Ok(state) => {
                    let blocked = state.blocked(&required);
                    if !blocked.is_empty() {
                        let blocked: Vec<String> = blocked.iter().map(|p| p.to_string()).collect();
                        reasons.push(format!("ports blocked: {}", blocked.join(", ")));
                    }
                }
                Err(e) => reasons.push(format!("could not check firewall: {e}")),
            }
        }

        if reasons.is_empty() {
            debug!("preflight: {} is ready", node.hostname());
            PreflightResult::Ready
        } else {
            info!(
                "preflight: {} is not ready: {}",
                node.hostname(),
                reasons.join("; ")
            );
            PreflightResult::Failed(reasons)
        }
    }

    /// Check every node, at most `concurrency` at a time. Results come back in the order of
    /// `nodes`, regardless of which probe finished first.
    pub async fn check_all(&self, nodes: &[NodeSpec], concurrency: usize) -> Vec<NodeReport> {
        let mut results: Vec<(usize, NodeReport)> = stream::iter(nodes.iter().enumerate())
            .map(|(i, node)| async move {
                let result = self.check(node).await;
                (
                    i,
                    NodeReport {
                        hostname: node.hostname().to_string(),
                        result,
                    },
                )
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, report)| report).collect()
    }
}

/// Probes nodes over ssh, reading kernel state from `/proc` and firewall state from
/// `firewall-cmd`.
#[derive(Debug, Clone)]
pub struct SshProbe {
    ssh_port: u16,
    ssh_user: Option<String>,
    connect_timeout: Duration,
}

impl SshProbe {
    pub fn new(options: &PreflightOptions) -> Self {
        Self {
            ssh_port: options.ssh_port,
            ssh_user: options.ssh_user.clone(),
            connect_timeout: Duration::from_secs(options.connect_timeout_secs),
        }
    }

    fn target(&self, node: &NodeSpec) -> String {
        match &self.ssh_user {
            Some(user) => format!("{user}@{}", node.access_address()),
            None => node.access_address().to_string(),
        }
    }

    /// Run `args` on the node and return (success, stdout).
    async fn remote(&self, node: &NodeSpec, args: &[&str]) -> Result<(bool, String), String> {
        debug!("running on {}: '{}'", node.hostname(), args.join(" "));
        let output = Command::new("ssh")
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs()))
            .arg("-p")
            .arg(self.ssh_port.to_string())
            .arg(self.target(node))
            .args(args)
            .output()
            .await
            .map_err(|e| format!("could not run ssh: {e}"))?;
        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }

    async fn remote_ok(&self, node: &NodeSpec, args: &[&str]) -> Result<String, String> {
        match self.remote(node, args).await? {
            (true, stdout) => Ok(stdout),
            (false, _) => Err(format!("'{}' failed", args.join(" "))),
        }
    }
}

impl NodeProbe for SshProbe {
    async fn connect(&self, node: &NodeSpec) -> Result<(), String> {
        let addr = (node.access_address(), self.ssh_port);
        match tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(addr)).await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "no answer within {}s",
                self.connect_timeout.as_secs()
            )),
        }
    }

    async fn swap_devices(&self, node: &NodeSpec) -> Result<Vec<String>, String> {
        let swaps = self.remote_ok(node, &["cat", "/proc/swaps"]).await?;
        Ok(parse_proc_swaps(&swaps))
    }

    async fn ipv4_forwarding(&self, node: &NodeSpec) -> Result<bool, String> {
        let value = self
            .remote_ok(node, &["cat", "/proc/sys/net/ipv4/ip_forward"])
            .await?;
        Ok(value.trim() == "1")
    }

    async fn firewall(&self, node: &NodeSpec) -> Result<FirewallState, String> {
        // `firewall-cmd --state` exits non-zero when firewalld is not running or not installed.
        let (running, state) = self.remote(node, &["firewall-cmd", "--state"]).await?;
        if !running || state.trim() != "running" {
            return Ok(FirewallState::Inactive);
        }
        let ports = self
            .remote_ok(node, &["firewall-cmd", "--list-ports"])
            .await?;
        Ok(FirewallState::Active {
            open: parse_firewall_ports(&ports),
        })
    }
}

/// Extract the device names from the contents of `/proc/swaps`, skipping the header line.
pub fn parse_proc_swaps(contents: &str) -> Vec<String> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|device| device.to_string())
        .collect()
}

pub fn parse_firewall_ports(output: &str) -> Vec<PortRange> {
    output
        .split_whitespace()
        .filter_map(PortRange::from_firewall_entry)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;

    fn node(roles: &[Role]) -> NodeSpec {
        NodeSpec::new(
            "knode01",
            IpAddr::from([10, 255, 0, 51]),
            None,
            roles.iter().copied(),
        )
        .unwrap()
    }

    #[test]
    fn ports_for_multi_role_node_are_merged() {
        let ports = required_ports(&node(&[Role::ControlPlane, Role::Worker, Role::Etcd]));
        let ports: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
        assert_eq!(
            ports,
            vec![
                "2379-2380",
                "6443",
                "10250",
                "10256",
                "10257",
                "10259",
                "30000-32767"
            ]
        );
        assert!(required_ports(&node(&[Role::Etcd])).is_empty());
    }

    #[test]
    fn firewall_coverage() {
        let open = parse_firewall_ports("6443/tcp 2379-2380/tcp 10250/tcp 30000-31000/tcp 31001-32767/tcp 8472/udp");
        assert_eq!(open.len(), 5);

        let state = FirewallState::Active { open };
        let blocked = state.blocked(&required_ports(&node(&[
            Role::ControlPlane,
            Role::Worker,
        ])));
        assert_eq!(
            blocked,
            vec![
                PortRange::single(10256),
                PortRange::single(10257),
                PortRange::single(10259)
            ]
        );

        assert!(FirewallState::Inactive
            .blocked(&required_ports(&node(&[Role::Worker])))
            .is_empty());
    }

    #[test]
    fn proc_swaps() {
        let empty = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n";
        assert!(parse_proc_swaps(empty).is_empty());

        let one = "Filename\t\t\t\tType\t\tSize\t\tUsed\t\tPriority\n\
                   /dev/dm-1                               partition\t8388604\t\t0\t\t-2\n";
        assert_eq!(parse_proc_swaps(one), vec!["/dev/dm-1"]);
    }

    #[test]
    fn firewall_entries() {
        assert_eq!(
            PortRange::from_firewall_entry("2379-2380/tcp"),
            Some(PortRange::range(2379, 2380))
        );
        assert_eq!(PortRange::from_firewall_entry("53/udp"), None);
        assert_eq!(PortRange::from_firewall_entry("http"), None);
    }
}
