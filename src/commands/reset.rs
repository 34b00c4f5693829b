// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::commands::{
    handled_error, live_orchestrator, load_cluster, output_printer, report_outcome,
    with_cancellation, Cli, HandledResult,
};

#[derive(Args, Debug, Clone)]
pub struct ResetArgs {
    /// Don't print the playbook's output as it runs
    #[arg(short, long)]
    quiet: bool,

    /// Reset without asking for confirmation
    #[arg(short, long)]
    yes: bool,
}

pub fn reset(cli: &Cli, args: &ResetArgs) -> HandledResult<i32> {
    let (config, spec) = load_cluster(cli)?;

    if !args.yes {
        eprintln!(
            "Resetting removes Kubernetes from all {} nodes of '{}'. Pass --yes to go ahead.",
            spec.nodes().len(),
            spec.name()
        );
        return handled_error();
    }

    let orchestrator = live_orchestrator(cli, &config, spec);

    with_cancellation(|cancel| async move {
        let mut printer = output_printer(args.quiet);
        let report = match orchestrator.reset(&cancel, &mut printer).await {
            Ok(report) => report,
            Err(e) => {
                eprintln!("Could not start reset: {e}");
                return Ok(e.exit_code());
            }
        };
        Ok(report_outcome("Reset", orchestrator.spec().name(), &report))
    })
}
