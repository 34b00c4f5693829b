// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

pub mod deploy;
pub mod discover;
pub mod history;
pub mod preflight;
pub mod render;
pub mod reset;
pub mod validate;
pub mod verify;

use {
    deploy::DeployArgs, discover::DiscoverArgs, render::RenderArgs, reset::ResetArgs,
    std::{future::Future, path::Path},
};

use {
    clap::{Parser, Subcommand},
    log::warn,
    tokio_util::sync::CancellationToken,
};

use crate::{
    cluster::{self, ClusterSpec},
    config::Config,
    error::exit_code,
    journal::Journal,
    orchestrator::{LiveOrchestrator, RunReport},
};

/// A `HandledError` represents an error that has already been handled. When you call a function
/// that returns a `HandledError` or `HandledResult`, you don't need to do anything with that error,
/// other than just be aware that it happened, and return it on to your caller.
///
/// `main()` has a special responsibility: since its "caller" is, in a certain sense, the operating
/// system, `main()` must turn a `HandledError` into a nonzero exit status.
///
/// The primary way to construct a `HandledError` is with the `handle_err()` function, which turns a
/// generic error into a `HandledError`, and also runs some caller-provided code to handle the
/// error. That provided code would normally do something like report the error to stderr.
#[derive(Debug, PartialEq)]
pub struct HandledError {}

pub type HandledResult<T> = std::result::Result<T, HandledError>;

pub fn handled_error<T>() -> HandledResult<T> {
    HandledResult::Err(HandledError {})
}

pub trait Handle<T, F> {
    fn handle_err(self, handler: F) -> HandledResult<T>;
}

impl<T, E, F: FnOnce(E)> Handle<T, F> for std::result::Result<T, E> {
    /// Handle an error by running the provided `handler` code, giving it the error.
    ///
    /// Then, return a `HandledResult`, so that transitive callers of this function know that they
    /// do not need to do anything further to handle the error.
    fn handle_err(self, handler: F) -> HandledResult<T> {
        self.map_err(|e| {
            handler(e);
            HandledError {}
        })
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Journal file that run events are appended to.
    #[arg(long, global = true)]
    pub journal: Option<String>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check every node, then run the deploy playbook and wait for the nodes to be Ready.
    Deploy(DeployArgs),
    /// Run the reset playbook, tearing down the cluster.
    Reset(ResetArgs),
    /// Wait for every node of an already deployed cluster to be Ready.
    Verify,
    /// Load the config file and print a summary of the cluster.
    Validate,
    /// Print the inventory that a deploy would use.
    Render(RenderArgs),
    /// Check every node without deploying.
    Preflight,
    /// Print a starter config file for the given hosts.
    Discover(DiscoverArgs),
    /// Print the run journal.
    History,
}

/// Run the command given on the command line and return the process exit status.
pub fn main(cli: &Cli) -> i32 {
    let result = match &cli.command {
        Commands::Deploy(args) => deploy::deploy(cli, args),
        Commands::Reset(args) => reset::reset(cli, args),
        Commands::Verify => verify::verify(cli),
        Commands::Validate => validate::validate(cli),
        Commands::Render(args) => render::render(cli, args),
        Commands::Preflight => preflight::preflight(cli),
        Commands::Discover(args) => discover::discover(args),
        Commands::History => history::history(cli),
    };

    match result {
        Ok(code) => code,
        Err(HandledError {}) => exit_code::GENERAL,
    }
}

/// Read the config file named on the command line (or the default one) and build the cluster
/// model from it.
fn load_cluster(cli: &Cli) -> HandledResult<(Config, ClusterSpec)> {
    let config = cluster::read_config(cli.config.as_deref()).handle_err(|_| {})?;
    let spec = ClusterSpec::from_config(&config)
        .handle_err(|e| eprintln!("Invalid cluster configuration: {e}"))?;
    Ok((config, spec))
}

/// Build an orchestrator for real nodes. A journal that cannot be opened is reported and the run
/// goes ahead without one.
fn live_orchestrator(cli: &Cli, config: &Config, spec: ClusterSpec) -> LiveOrchestrator {
    let orchestrator = LiveOrchestrator::from_config(config, spec);
    let path = match &cli.journal {
        Some(path) => path.clone(),
        None => crate::default_journal_path(),
    };
    match Journal::open(Path::new(&path)) {
        Ok(journal) => orchestrator.with_journal(journal),
        Err(e) => {
            warn!("could not open journal '{path}': {e}");
            orchestrator
        }
    }
}

/// Run `f` on a new tokio runtime, handing it a token that is canceled on Ctrl-C.
fn with_cancellation<F, Fut>(f: F) -> HandledResult<i32>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = HandledResult<i32>>,
{
    let rt = tokio::runtime::Runtime::new()
        .handle_err(|e| eprintln!("Error launching tokio runtime: {e}"))?;

    rt.block_on(async {
        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Interrupted, stopping...");
                on_interrupt.cancel();
            }
        });
        f(cancel).await
    })
}

/// An observer that echoes playbook output to stdout, unless `quiet`.
fn output_printer(quiet: bool) -> impl FnMut(&str) {
    move |line: &str| {
        if !quiet {
            println!("{line}");
        }
    }
}

/// Tell the operator how a run ended, and return the exit status for it.
fn report_outcome(what: &str, cluster: &str, report: &RunReport) -> i32 {
    let Some(e) = &report.error else {
        eprintln!("{what} of cluster '{cluster}' succeeded.");
        return exit_code::SUCCESS;
    };

    match report.failed_in {
        Some(stage) => eprintln!("{what} of cluster '{cluster}' failed while {stage}: {e}"),
        None => eprintln!("{what} of cluster '{cluster}' failed: {e}"),
    }
    if report.possibly_partial {
        eprintln!(
            "The playbook did not finish; nodes may be partially configured. \
             Run 'kubeboot reset' before deploying again."
        );
    }
    if let Some(rollback) = &report.rollback_error {
        eprintln!("The rollback reset failed too: {rollback}");
    }
    report.exit_code()
}
