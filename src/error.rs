// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Error types shared by the orchestration stages.
//!
//! Each stage of a run has its own error type. `RunError` wraps them so that the orchestrator can
//! record which stage failed and the CLI can pick an exit code.

use std::fmt;

use thiserror::Error;

use crate::{orchestrator::RunState, preflight::NodeFailure};

/// A problem with the cluster description itself. These are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duplicate hostname '{0}'")]
    DuplicateHostname(String),

    #[error("node '{0}' has no roles")]
    NoRoles(String),

    #[error("unknown role '{0}'")]
    UnknownRole(String),

    #[error("invalid address '{address}' for node '{hostname}'")]
    InvalidAddress { hostname: String, address: String },

    #[error("cluster has no nodes")]
    EmptyCluster,

    #[error("cluster has no control-plane nodes")]
    NoControlPlane,

    #[error("etcd quorum requires an odd number of members, found {count}")]
    Quorum { count: usize },

    #[error("invalid {field} '{value}': {reason}")]
    InvalidCidr {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("pod network {pod} overlaps service network {service}")]
    OverlappingCidrs { pod: String, service: String },

    #[error("could not serialize inventory: {0}")]
    Serialize(String),
}

/// Returned by `Registry::add()` when the hostname is already present.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("duplicate hostname '{0}'")]
pub struct DuplicateHostnameError(pub String);

impl From<DuplicateHostnameError> for ValidationError {
    fn from(e: DuplicateHostnameError) -> Self {
        ValidationError::DuplicateHostname(e.0)
    }
}

/// One or more nodes failed preflight. Every failing node is listed along with all of its reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessError {
    pub failures: Vec<NodeFailure>,
}

impl fmt::Display for ReadinessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} node(s) not ready", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.hostname, failure.reasons.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ReadinessError {}

/// Failure of the external automation procedure.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("could not launch '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("I/O error while running playbook: {0}")]
    Io(#[from] std::io::Error),

    #[error("playbook exited with status {exit_code}")]
    Failed { exit_code: i32 },

    /// The playbook failed in a way that indicates the local fact cache no longer matches the
    /// nodes. Recoverable by clearing the cache.
    #[error("playbook failed on a stale fact cache (exit status {exit_code})")]
    StaleCache { exit_code: i32 },

    #[error("playbook was aborted")]
    Aborted,
}

impl ExecutionError {
    pub fn is_stale_cache(&self) -> bool {
        matches!(self, ExecutionError::StaleCache { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("nodes not ready after {attempts} attempts: {}", .not_ready.join(", "))]
    Timeout {
        attempts: u32,
        not_ready: Vec<String>,
    },

    #[error("could not query cluster status: {0}")]
    Status(String),

    #[error("verification canceled")]
    Canceled,
}

/// The structured reason a run ended in `Failed`.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("another run is already in progress")]
    RunInProgress,

    #[error("could not lock '{path}': {source}")]
    Lock {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid cluster: {0}")]
    Validation(#[from] ValidationError),

    #[error("preflight failed: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("verification failed: {0}")]
    Verification(#[from] VerificationError),

    #[error("run canceled during {stage}")]
    Canceled { stage: RunState },

    #[error("reset is not allowed from state {0}")]
    InvalidTransition(RunState),
}

/// Exit codes used by the command line tool.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const PREFLIGHT: i32 = 2;
    pub const RENDER: i32 = 3;
    pub const EXECUTION: i32 = 4;
    pub const VERIFY_TIMEOUT: i32 = 5;
    pub const CANCELED: i32 = 6;
}

impl RunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::RunInProgress | RunError::Lock { .. } | RunError::InvalidTransition(_) => {
                exit_code::GENERAL
            }
            RunError::Validation(_) => exit_code::RENDER,
            RunError::Readiness(_) => exit_code::PREFLIGHT,
            RunError::Execution(_) => exit_code::EXECUTION,
            RunError::Verification(VerificationError::Timeout { .. }) => exit_code::VERIFY_TIMEOUT,
            RunError::Verification(VerificationError::Status(_)) => exit_code::GENERAL,
            RunError::Verification(VerificationError::Canceled) => exit_code::CANCELED,
            RunError::Canceled { .. } => exit_code::CANCELED,
        }
    }
}
