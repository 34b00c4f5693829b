// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use std::path::Path;

use crate::{
    commands::{Cli, Handle, HandledResult},
    error::exit_code,
    journal::Journal,
};

pub fn history(cli: &Cli) -> HandledResult<i32> {
    let path = match &cli.journal {
        Some(path) => path.clone(),
        None => crate::default_journal_path(),
    };

    let records = Journal::read_all(Path::new(&path))
        .handle_err(|e| eprintln!("Could not read journal '{path}': {e}"))?;

    for record in records {
        println!("{}", record.as_string());
    }
    Ok(exit_code::SUCCESS)
}
