use std::env;
use std::path::PathBuf;

use anyhow::Result;
use chrono::Local;
use clap::Parser;

use crate::cli::args::Cli;
use crate::config::load::{load_config, resolve_profile};
use crate::progress::LogReceiver;
use crate::signals;
use crate::util::duration::parse_duration;
use crate::wrapper::{ResticWrapper, COMMAND_BACKUP};

pub mod args;

const CONFIG_FILE: &str = "/etc/resticvault.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");
const LICENSE_NAME: &str = "GNU GPL v3 or later";

pub fn run() -> Result<()> {
    let (cli, more_args) = parse_cli();
    init_tracing(cli.verbose);

    print_banner();
    if cli.version {
        println!("License: {}", LICENSE_NAME);
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(|| PathBuf::from(CONFIG_FILE));
    let cfg = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            println!("failed to load config {}: {}", config_path.display(), err);
            std::process::exit(2);
        }
    };
    let profile = match resolve_profile(&cfg, &cli.name) {
        Ok(profile) => profile,
        Err(err) => {
            println!("{}", err);
            std::process::exit(2);
        }
    };
    let command = cli.command.unwrap_or_else(|| COMMAND_BACKUP.to_string());

    let signals = signals::install()?;
    let mut wrapper = ResticWrapper::new(cfg.global, profile, command, more_args, signals);
    wrapper.set_dry_run(cli.dry_run);
    if cli.no_lock {
        wrapper.ignore_lock();
    }
    if let Some(wait) = cli.lock_wait.as_deref() {
        match parse_duration(wait) {
            Ok(duration) => wrapper.max_wait_on_lock(duration),
            Err(err) => {
                println!("invalid --lock-wait value: {}", err);
                std::process::exit(2);
            }
        }
    }
    wrapper.add_progress(Box::new(LogReceiver));

    println!("{}", Local::now().format("%d-%m-%Y %H:%M"));
    if let Err(err) = wrapper.run_profile() {
        let message = err.to_string();
        if message.contains("another process is already running this profile") {
            println!("{}", message);
            std::process::exit(3);
        }
        println!("profile '{}' failed: {}", cli.name, message);
        std::process::exit(1);
    }
    println!("{}", Local::now().format("%d-%m-%Y %H:%M"));
    Ok(())
}

/// Everything after `--` is passed to the engine verbatim.
fn parse_cli() -> (Cli, Vec<String>) {
    let raw: Vec<String> = env::args().collect();
    let (args, more_args) = split_engine_args(raw);
    (Cli::parse_from(args), more_args)
}

fn split_engine_args(raw: Vec<String>) -> (Vec<String>, Vec<String>) {
    let mut args = Vec::new();
    let mut more_args = Vec::new();
    let mut iter = raw.into_iter();
    if let Some(bin) = iter.next() {
        args.push(bin);
    }
    let mut in_engine = false;
    for arg in iter {
        if in_engine {
            more_args.push(arg);
            continue;
        }
        if arg == "--" {
            in_engine = true;
            continue;
        }
        args.push(arg);
    }
    (args, more_args)
}

fn print_banner() {
    println!("resticvault {}", VERSION);
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
