mod journal;

use std::io::{self, BufReader};
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use journal::{JournalSource, StdinJournalSource};
use warden_core::{Environment, WorkflowBuilder};

/// Routes system-journal entries through a configured pipeline of
/// filters and actions.
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Restore one module's persistent state (currently `nftBan` /
    /// `ipsetBan`) and exit, instead of running the dispatcher loop.
    #[arg(long, value_name = "MODULE")]
    boot: Option<String>,

    /// Read journal entries as newline-delimited JSON from a file, or
    /// `-` for standard input, instead of the live systemd journal. Used
    /// for local testing; the live journal is the default source in
    /// production.
    #[arg(long, value_name = "PATH")]
    input: Option<String>,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match warden_config::load_default() {
        Ok(config) => config,
        Err(err) => {
            // logging is not yet configured; this is a startup failure.
            eprintln!("warden: failed to load configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.debug);

    let env = Rc::new(Environment::from_config(&config));

    if let Some(module) = cli.boot.as_deref() {
        return run_boot(module, &env);
    }

    let chains = match config.action_chains() {
        Ok(chains) => chains,
        Err(err) => {
            error!(%err, "failed to decode `actions` chains");
            return ExitCode::FAILURE;
        }
    };
    let workflow = match WorkflowBuilder::new(Rc::clone(&env), &chains).build() {
        Ok(workflow) => workflow,
        Err(err) => {
            error!(%err, "failed to compile workflow");
            return ExitCode::FAILURE;
        }
    };

    let mut source: Box<dyn JournalSource> = match cli.input.as_deref() {
        Some("-") => Box::new(StdinJournalSource::new(BufReader::new(io::stdin()))),
        Some(path) => match std::fs::File::open(path) {
            Ok(file) => Box::new(StdinJournalSource::new(BufReader::new(file))),
            Err(err) => {
                error!(%err, path, "failed to open journal input file");
                return ExitCode::FAILURE;
            }
        },
        None => match open_default_source() {
            Ok(source) => source,
            Err(err) => {
                error!(%err, "failed to open journal source");
                return ExitCode::FAILURE;
            }
        },
    };

    info!("warden dispatcher starting");
    loop {
        match source.next_entry() {
            Ok(Some(mut entry)) => workflow.run(&mut entry),
            Ok(None) => {
                info!("journal source exhausted, exiting");
                break;
            }
            Err(err) => {
                error!(%err, "failed to read next journal entry");
                break;
            }
        }
    }
    ExitCode::SUCCESS
}

#[cfg(feature = "systemd-journal")]
fn open_default_source() -> io::Result<Box<dyn JournalSource>> {
    Ok(Box::new(journal::SystemdJournalSource::open()?))
}

#[cfg(not(feature = "systemd-journal"))]
fn open_default_source() -> io::Result<Box<dyn JournalSource>> {
    Ok(Box::new(StdinJournalSource::new(BufReader::new(io::stdin()))))
}

/// `--boot <module>` restores one module's persistent firewall state.
/// Exit 0 on success, nonzero on a configuration error.
fn run_boot(module: &str, env: &Environment) -> ExitCode {
    let now = chrono::Utc::now();
    let result = match module {
        "nftBan" => env.nft_bans.borrow().boot(now),
        "ipsetBan" => env.ipset_bans.borrow().boot(now),
        other => {
            error!(module = other, "unknown boot module");
            return ExitCode::FAILURE;
        }
    };
    match result {
        Ok(()) => {
            info!(module, "boot restore complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(module, %err, "boot restore failed");
            ExitCode::FAILURE
        }
    }
}
