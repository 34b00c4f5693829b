// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod journal;
pub mod node;
pub mod orchestrator;
pub mod preflight;
pub mod test_env;
pub mod verify;

pub fn default_config_path() -> String {
    match std::env::var("KUBEBOOT_CONFIG") {
        Ok(conf) => conf,
        Err(_) => "/etc/kubeboot/cluster.toml".to_string(),
    }
}

pub fn default_journal_path() -> String {
    match std::env::var("KUBEBOOT_JOURNAL") {
        Ok(journal) => journal,
        Err(_) => "/var/lib/kubeboot/journal".to_string(),
    }
}

pub fn default_inventory_path() -> String {
    match std::env::var("KUBEBOOT_INVENTORY") {
        Ok(inventory) => inventory,
        Err(_) => "/var/lib/kubeboot/inventory/hosts.yaml".to_string(),
    }
}

/// The directory holding the Kubespray checkout whose `cluster.yml` and `reset.yml` are run.
pub fn default_playbook_dir() -> String {
    match std::env::var("KUBEBOOT_PLAYBOOK_DIR") {
        Ok(dir) => dir,
        Err(_) => "/opt/kubespray".to_string(),
    }
}

/// Ansible's local fact cache. When stale, playbook runs fail until it is cleared.
pub fn default_fact_cache_dir() -> String {
    match std::env::var("KUBEBOOT_FACT_CACHE") {
        Ok(dir) => dir,
        Err(_) => "/tmp/kubeboot_fact_cache".to_string(),
    }
}

pub fn default_kubeconfig() -> String {
    match std::env::var("KUBECONFIG") {
        Ok(path) => path,
        Err(_) => "/etc/kubernetes/admin.conf".to_string(),
    }
}
