// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

use clap::Args;

use crate::{
    commands::{load_cluster, Cli, Handle, HandledResult},
    error::exit_code,
    inventory,
};

#[derive(Args, Debug, Clone)]
pub struct RenderArgs {
    /// Write the inventory to this file instead of stdout
    #[arg(short, long)]
    output: Option<String>,
}

pub fn render(cli: &Cli, args: &RenderArgs) -> HandledResult<i32> {
    let (_, spec) = load_cluster(cli)?;

    let inventory = match inventory::render(&spec) {
        Ok(inventory) => inventory,
        Err(e) => {
            eprintln!("Could not render inventory: {e}");
            return Ok(exit_code::RENDER);
        }
    };

    match &args.output {
        Some(path) => std::fs::write(path, inventory.as_bytes())
            .handle_err(|e| eprintln!("Could not write inventory to '{path}': {e}"))?,
        None => print!("{inventory}"),
    }
    Ok(exit_code::SUCCESS)
}
