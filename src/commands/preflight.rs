// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    commands::{load_cluster, with_cancellation, Cli, HandledResult},
    error::exit_code,
    preflight::{Checker, NodeReport, PreflightResult, SshProbe},
};

pub fn preflight(cli: &Cli) -> HandledResult<i32> {
    let (config, spec) = load_cluster(cli)?;
    let checker = Checker::new(SshProbe::new(&config.preflight));

    with_cancellation(|cancel| async move {
        let reports = tokio::select! {
            reports = checker.check_all(spec.nodes().all(), config.preflight.concurrency) => reports,
            _ = cancel.cancelled() => return Ok(exit_code::CANCELED),
        };
        print_reports(&reports);

        if reports.iter().all(|r| r.result.is_ready()) {
            Ok(exit_code::SUCCESS)
        } else {
            Ok(exit_code::PREFLIGHT)
        }
    })
}

fn print_reports(reports: &[NodeReport]) {
    for report in reports {
        match &report.result {
            PreflightResult::Ready => println!("{}: ready", report.hostname),
            PreflightResult::Failed(reasons) => {
                println!("{}: NOT READY", report.hostname);
                for reason in reasons {
                    println!("    {reason}");
                }
            }
        }
    }
}
