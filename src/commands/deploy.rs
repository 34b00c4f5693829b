// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::commands::{
    live_orchestrator, load_cluster, output_printer, report_outcome, with_cancellation, Cli,
    HandledResult,
};

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    /// Don't print the playbook's output as it runs
    #[arg(short, long)]
    quiet: bool,

    /// Run the reset playbook if the deploy fails once the playbook has started
    #[arg(long)]
    reset_on_failure: bool,
}

pub fn deploy(cli: &Cli, args: &DeployArgs) -> HandledResult<i32> {
    let (mut config, spec) = load_cluster(cli)?;
    config.playbook.reset_on_failure |= args.reset_on_failure;
    let orchestrator = live_orchestrator(cli, &config, spec);

    with_cancellation(|cancel| async move {
        let mut printer = output_printer(args.quiet);
        let report = match orchestrator.deploy(&cancel, &mut printer).await {
            Ok(report) => report,
            Err(e) => {
                eprintln!("Could not start deploy: {e}");
                return Ok(e.exit_code());
            }
        };
        Ok(report_outcome("Deploy", orchestrator.spec().name(), &report))
    })
}
