// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Parser;

use kubeboot_lib::commands::{self, Cli};

/// The kubeboot binary deploys, resets and verifies a Kubernetes cluster described by a config file.
fn main() {
    let args = Cli::parse();

    let default_level = if args.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("KUBEBOOT_LOG", default_level))
        .init();

    std::process::exit(commands::main(&args));
}
