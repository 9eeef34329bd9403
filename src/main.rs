use std::{error::Error, sync::Arc};

use clap::Parser;

use repocache::{
    cli::{
        args::{CliArgs, Command},
        command_handlers::{do_checkout, do_fetch, do_remove, do_reset, LoggingDelegate},
    },
    config::RepocacheConfig,
    git::GitRepositoryProvider,
    manager::RepositoryManager,
};

use tracing_subscriber::EnvFilter;

fn main() {
    // One stdout subscriber for everything: the library logs through the
    // `log` facade and tracing-subscriber picks those records up alongside
    // our own events. RUST_LOG overrides the info default.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(error) = run() {
        tracing::error!("{error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = CliArgs::parse();
    let config = RepocacheConfig::load()?;

    let root_directory = cli_args
        .root_directory
        .map(Into::into)
        .unwrap_or(config.root_dir);
    let cache_directory = cli_args
        .cache_directory
        .map(Into::into)
        .or(config.cache_dir);

    let mut builder = RepositoryManager::builder(root_directory, Arc::new(GitRepositoryProvider::new()))
        .cache_local_packages(config.cache_local_packages)
        .delegate(Arc::new(LoggingDelegate));
    if let Some(cache_directory) = cache_directory {
        builder = builder.cache_path(cache_directory);
    }
    let manager = builder.build()?;

    match cli_args.cmd {
        Command::Fetch {
            location,
            skip_update,
        } => do_fetch(&manager, &location, skip_update),
        Command::Checkout {
            location,
            destination,
            editable,
        } => do_checkout(&manager, &location, &destination, editable),
        Command::Remove { location } => do_remove(&manager, &location),
        Command::Reset => do_reset(&manager),
    }
}
