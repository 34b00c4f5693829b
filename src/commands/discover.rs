// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;
use std::io;
use std::net::IpAddr;
use std::process::Command;

use crate::{
    commands::{Handle, HandledResult},
    config,
    error::exit_code,
};

#[derive(Args, Debug)]
pub struct DiscoverArgs {
    #[arg(short, long)]
    verbose: bool,

    /// Role given to every discovered node
    #[arg(short, long, default_value = "worker")]
    role: String,

    #[arg()]
    hostnames: Vec<String>,
}

pub fn discover(args: &DiscoverArgs) -> HandledResult<i32> {
    let mut cluster = config::Config::new();
    for hostname in args.hostnames.iter() {
        let node = discover_one(hostname, &args.role, args.verbose)
            .handle_err(|e| eprintln!("Could not discover host '{hostname}': {e}"))?;
        cluster.add_node(node);
    }
    let toml = toml::to_string_pretty(&cluster)
        .handle_err(|e| eprintln!("Could not serialize config: {e}"))?;
    println!("{toml}");
    Ok(exit_code::SUCCESS)
}

fn discover_one(hostname: &str, role: &str, verbose: bool) -> io::Result<config::Node> {
    if verbose {
        eprintln!("\nDiscovering addresses for host={hostname}");
        eprintln!("Running command on host: 'hostname -I'");
    }
    let output = Command::new("ssh")
        .args(["-o", "BatchMode=yes", hostname, "hostname", "-I"])
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if verbose {
        eprintln!("stdout: {stdout}");
        eprintln!("stderr: {}", String::from_utf8_lossy(&output.stderr));
    }
    if !output.status.success() {
        return Err(io::Error::other(format!("ssh exited with {}", output.status)));
    }

    let addresses = parse_host_addresses(&stdout);
    if verbose {
        eprintln!("addresses: {:?}", addresses);
    }
    let Some(address) = addresses.first() else {
        return Err(io::Error::other("host reported no addresses"));
    };

    Ok(config::Node {
        hostname: hostname.to_string(),
        address: address.to_string(),
        access_address: None,
        roles: vec![role.to_string()],
    })
}

/// Parse the output of `hostname -I`: addresses separated by whitespace, IPv4 addresses first.
fn parse_host_addresses(output: &str) -> Vec<IpAddr> {
    let mut addresses: Vec<IpAddr> = output
        .split_whitespace()
        .filter_map(|word| word.parse().ok())
        .collect();
    addresses.sort_by_key(|addr| addr.is_ipv6());
    addresses
}
