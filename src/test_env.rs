// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Stand-ins for the external collaborators (nodes, the playbook program and the cluster API),
//! used by the unit and integration tests.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    io,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use {tokio::sync::Notify, tokio_util::sync::CancellationToken};

use crate::{
    cluster::{ClusterOptions, ClusterSpec},
    config::PlaybookOptions,
    error::ExecutionError,
    executor::{AnsibleRunner, Completion, Executor, Invocation, ProcessRunner, Procedure},
    inventory::{self, InventoryDocument},
    node::{NodeSpec, Registry, Role},
    orchestrator::{Orchestrator, RunPolicy},
    preflight::{Checker, FirewallState, NodeProbe},
    verify::{Backoff, ClusterStatus, Verifier},
};

/// Given a relative `path` in the test directory, prepend the full path to the test directory.
pub fn test_path(path: &str) -> String {
    env!("CARGO_MANIFEST_DIR").to_string() + "/tests/" + path
}

/// Path to the script that stands in for `ansible-playbook`.
pub fn fake_playbook_program() -> String {
    test_path("fake_bin/ansible-playbook")
}

/// The three node cluster used throughout the tests: knode01..knode03 at 10.255.0.51..53, each
/// holding the control-plane, worker and etcd roles.
pub fn three_node_spec() -> ClusterSpec {
    let mut registry = Registry::new();
    for i in 1..=3u8 {
        let node = NodeSpec::new(
            &format!("knode{i:02}"),
            IpAddr::from([10, 255, 0, 50 + i]),
            None,
            [Role::ControlPlane, Role::Worker, Role::Etcd],
        )
        .unwrap();
        registry.add(node).unwrap();
    }
    ClusterSpec::new(registry, ClusterOptions::default())
}

pub fn three_node_inventory() -> InventoryDocument {
    inventory::render(&three_node_spec()).unwrap()
}

/// The simulated state of one node.
#[derive(Debug, Clone)]
pub struct NodeState {
    pub reachable: bool,
    pub swap_devices: Vec<String>,
    pub ipv4_forwarding: bool,
    pub firewall: FirewallState,
    /// How long each probe of this node takes.
    pub delay: Duration,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            reachable: true,
            swap_devices: Vec::new(),
            ipv4_forwarding: true,
            firewall: FirewallState::Inactive,
            delay: Duration::ZERO,
        }
    }
}

/// A NodeProbe answering from a table of NodeStates. Nodes not in the table are healthy.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    nodes: HashMap<String, NodeState>,
    /// Hostnames in the order their connectivity probe started.
    pub probed: Mutex<Vec<String>>,
    /// Hostnames in the order their last probe, the firewall, finished.
    pub finished: Mutex<Vec<String>>,
    in_flight: Mutex<usize>,
    /// The most nodes that were being checked at once.
    pub max_in_flight: Mutex<usize>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, hostname: &str, state: NodeState) -> Self {
        self.nodes.insert(hostname.to_string(), state);
        self
    }

    pub fn max_in_flight(&self) -> usize {
        *self.max_in_flight.lock().unwrap()
    }

    pub fn finished(&self) -> Vec<String> {
        self.finished.lock().unwrap().clone()
    }

    async fn state(&self, node: &NodeSpec) -> NodeState {
        let state = self.nodes.get(node.hostname()).cloned().unwrap_or_default();
        if !state.delay.is_zero() {
            tokio::time::sleep(state.delay).await;
        }
        state
    }
}

impl NodeProbe for ScriptedProbe {
    async fn connect(&self, node: &NodeSpec) -> Result<(), String> {
        self.probed
            .lock()
            .unwrap()
            .push(node.hostname().to_string());
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight += 1;
            let mut max = self.max_in_flight.lock().unwrap();
            *max = (*max).max(*in_flight);
        }
        if self.state(node).await.reachable {
            Ok(())
        } else {
            Err("connection refused".to_string())
        }
    }

    async fn swap_devices(&self, node: &NodeSpec) -> Result<Vec<String>, String> {
        Ok(self.state(node).await.swap_devices)
    }

    async fn ipv4_forwarding(&self, node: &NodeSpec) -> Result<bool, String> {
        Ok(self.state(node).await.ipv4_forwarding)
    }

    async fn firewall(&self, node: &NodeSpec) -> Result<FirewallState, String> {
        let firewall = self.state(node).await.firewall;
        *self.in_flight.lock().unwrap() -= 1;
        self.finished
            .lock()
            .unwrap()
            .push(node.hostname().to_string());
        Ok(firewall)
    }
}

/// What one scripted playbook run prints and how it ends.
#[derive(Debug, Clone)]
pub struct Script {
    pub lines: Vec<String>,
    pub completion: Completion,
}

impl Script {
    pub fn exit(code: i32, lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| l.to_string()).collect(),
            completion: Completion::Exited(code),
        }
    }

    pub fn stale_cache() -> Self {
        Self::exit(
            2,
            &["fatal: [knode01]: FAILED! => {\"msg\": \"'ansible_default_ipv4' is undefined\"}"],
        )
    }
}

/// A ProcessRunner playing back Scripts in order. Once the scripts run out, runs succeed.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<VecDeque<Script>>,
    /// Every invocation received, in order.
    pub invocations: Mutex<Vec<Invocation>>,
    /// Notified each time a run starts.
    pub started: Arc<Notify>,
    /// When set, each run waits for a notification here (or cancellation) before finishing.
    pub release: Option<Arc<Notify>>,
}

impl ScriptedRunner {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    /// A runner whose runs block until `release` is notified.
    pub fn gated(scripts: Vec<Script>, release: Arc<Notify>) -> Self {
        Self {
            release: Some(release),
            ..Self::new(scripts)
        }
    }

    pub fn run_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        output: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> Result<Completion, ExecutionError> {
        self.invocations.lock().unwrap().push(invocation.clone());
        self.started.notify_one();

        if let Some(release) = &self.release {
            tokio::select! {
                _ = release.notified() => {}
                _ = cancel.cancelled() => return Ok(Completion::Aborted),
            }
        }

        let script = self.scripts.lock().unwrap().pop_front();
        let Some(script) = script else {
            output("PLAY RECAP");
            return Ok(Completion::Exited(0));
        };
        for line in &script.lines {
            output(line);
        }
        Ok(script.completion)
    }

    fn command_line(&self, invocation: &Invocation) -> String {
        format!("scripted {}", invocation.args().join(" "))
    }
}

/// A ClusterStatus answering from a queue of responses. Once the queue is empty, every node in
/// `nodes` reports Ready.
#[derive(Debug, Default)]
pub struct ScriptedStatus {
    responses: Mutex<VecDeque<Result<BTreeMap<String, bool>, String>>>,
    nodes: Vec<String>,
    pub queries: Mutex<usize>,
}

impl ScriptedStatus {
    pub fn all_ready(nodes: &[&str]) -> Self {
        Self {
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Every query answers with `readiness`, forever.
    pub fn never_ready(readiness: &[(&str, bool)]) -> Self {
        let readiness: BTreeMap<String, bool> = readiness
            .iter()
            .map(|(name, ready)| (name.to_string(), *ready))
            .collect();
        let responses = (0..1000).map(|_| Ok(readiness.clone())).collect();
        Self {
            responses: Mutex::new(responses),
            ..Self::default()
        }
    }

    pub fn then(self, response: Result<BTreeMap<String, bool>, String>) -> Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    pub fn query_count(&self) -> usize {
        *self.queries.lock().unwrap()
    }
}

impl ClusterStatus for ScriptedStatus {
    async fn node_readiness(&self) -> Result<BTreeMap<String, bool>, String> {
        *self.queries.lock().unwrap() += 1;
        let response = self.responses.lock().unwrap().pop_front();
        match response {
            Some(response) => response,
            None => Ok(self.nodes.iter().map(|n| (n.clone(), true)).collect()),
        }
    }
}

/// Backoff with no delay, so that verification tests run instantly.
pub fn no_backoff(attempts: u32) -> Backoff {
    Backoff {
        attempts,
        initial: Duration::ZERO,
        max: Duration::ZERO,
    }
}

/// A TestEnvironment holds a test's private working directory, in which the inventory, fact
/// cache and fake playbook state for that test are kept.
pub struct TestEnvironment {
    private_dir_path: PathBuf,
}

impl TestEnvironment {
    /// Set up an environment for a test named `test_id`, clearing anything left from a previous
    /// run of the same test.
    pub fn new(test_id: &str) -> Self {
        let private_dir_path = PathBuf::from(test_path(&format!("test_output/{test_id}")));
        match std::fs::remove_dir_all(&private_dir_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => panic!("Could not clean up test directory: {e}"),
        };
        std::fs::create_dir_all(&private_dir_path).unwrap();
        Self { private_dir_path }
    }

    pub fn dir(&self) -> &Path {
        &self.private_dir_path
    }

    pub fn inventory_path(&self) -> PathBuf {
        self.private_dir_path.join("inventory/hosts.yaml")
    }

    pub fn fact_cache_dir(&self) -> PathBuf {
        self.private_dir_path.join("facts")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.private_dir_path.join("journal")
    }

    /// Playbook options pointing at this environment, running the fake playbook program.
    pub fn playbook_options(&self) -> PlaybookOptions {
        PlaybookOptions {
            dir: Some(self.private_dir_path.display().to_string()),
            program: Some(fake_playbook_program()),
            inventory_path: Some(self.inventory_path().display().to_string()),
            fact_cache_dir: Some(self.fact_cache_dir().display().to_string()),
            ..PlaybookOptions::default()
        }
    }

    /// Tell the fake playbook program how to behave on each successive invocation. Each entry is
    /// one of `ok`, `fail`, `stale`, `hang` or `latin1`.
    pub fn set_playbook_behaviors(&self, behaviors: &[&str]) {
        std::fs::write(
            self.private_dir_path.join("behaviors"),
            behaviors.join("\n") + "\n",
        )
        .unwrap();
    }

    /// The argument lists the fake playbook program was run with.
    pub fn playbook_invocations(&self) -> Vec<String> {
        match std::fs::read_to_string(self.private_dir_path.join("invocations")) {
            Ok(contents) => contents.lines().map(|l| l.to_string()).collect(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => panic!("Could not read invocations: {e}"),
        }
    }

    /// An executor that runs the fake playbook program in this environment.
    pub fn ansible_executor(&self) -> Executor<AnsibleRunner> {
        let options = self.playbook_options();
        Executor::new(AnsibleRunner::new(&options), Procedure::from_options(&options))
    }

    /// An orchestrator for `spec` with scripted collaborators, writing into this environment.
    pub fn orchestrator<R: ProcessRunner>(
        &self,
        spec: ClusterSpec,
        probe: ScriptedProbe,
        runner: R,
        status: ScriptedStatus,
        verify_attempts: u32,
    ) -> Orchestrator<ScriptedProbe, R, ScriptedStatus> {
        Orchestrator::new(
            spec,
            Checker::new(probe),
            Executor::new(runner, Procedure::from_options(&self.playbook_options())),
            Verifier::new(status, no_backoff(verify_attempts)),
            RunPolicy::default(),
        )
    }
}
