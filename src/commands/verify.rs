// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::commands::{
    live_orchestrator, load_cluster, report_outcome, with_cancellation, Cli, HandledResult,
};

pub fn verify(cli: &Cli) -> HandledResult<i32> {
    let (config, spec) = load_cluster(cli)?;
    let orchestrator = live_orchestrator(cli, &config, spec);

    with_cancellation(|cancel| async move {
        let report = match orchestrator.verify(&cancel).await {
            Ok(report) => report,
            Err(e) => {
                eprintln!("Could not start verify: {e}");
                return Ok(e.exit_code());
            }
        };
        Ok(report_outcome("Verify", orchestrator.spec().name(), &report))
    })
}
