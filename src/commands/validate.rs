// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use crate::{
    commands::{load_cluster, Cli, HandledResult},
    error::RunError,
};

pub fn validate(cli: &Cli) -> HandledResult<i32> {
    let (_, spec) = load_cluster(cli)?;

    spec.print_summary();

    match spec.validate() {
        Ok(()) => Ok(crate::error::exit_code::SUCCESS),
        Err(e) => {
            eprintln!("Cluster cannot be deployed: {e}");
            Ok(RunError::from(e).exit_code())
        }
    }
}
