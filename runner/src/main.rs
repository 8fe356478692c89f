mod config;
mod dispatch;
mod executors;
mod job;
mod runner;
mod shell;

use clap::Parser;
use config::{
    check_arguments, check_batch_size, ensure_logs_dir, read_commands, CommandSource, ConfigErrors,
    Overrides, RunnerConfig,
};
use dispatch::{DispatchError, Dispatcher};
use executors::{ExecutorError, Executors};
use itertools::Itertools;
use job::{LogMap, Resources, DEFAULT_LOG_FILE};
use runner::SystemRunner;
use std::{env, num::NonZeroUsize, path::PathBuf, process::exit, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Submit shell commands to docker or LSF and wait for them to finish
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image to run commands in
    image: String,

    /// File with commands to execute. One command per line.
    #[arg(long)]
    commands_file: Option<PathBuf>,

    /// Command to execute
    #[arg(long)]
    command: Option<String>,

    /// Directory to store logs in. Defaults to the working directory.
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Filepath to store job logs at when running a single command.
    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Max memory (in Gb) per job. Must be an integer.
    #[arg(long, default_value_t = 1)]
    max_memory: u32,

    /// Max number of jobs to execute at one time.
    #[arg(long, default_value_t = 10)]
    batch_size: usize,

    /// Set logging level to debug for verbose output
    #[arg(long)]
    verbose: bool,

    /// YAML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Backend to submit to, overrides executor.name (docker or bsub)
    #[arg(long)]
    backend: Option<String>,

    /// LSF queue, overrides bsub.queue
    #[arg(long)]
    queue: Option<String>,

    /// Memory reservation (in Gb) for LSF, overrides bsub.min_memory
    #[arg(long)]
    min_memory: Option<u32>,

    /// Number of hosts for LSF, overrides bsub.processes
    #[arg(long)]
    processes: Option<u32>,

    /// Seconds between polls, overrides the configured wait time
    #[arg(long)]
    wait_time: Option<u64>,

    /// Write a bsub submission script to this path instead of submitting
    #[arg(long)]
    emit_script: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            backend: self.backend.clone(),
            queue: self.queue.clone(),
            min_memory: self.min_memory,
            processes: self.processes,
            wait_time: self.wait_time,
        }
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    // RUST_LOG wins over --verbose
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run(args: Args) -> Result<(), RunError> {
    let source = check_arguments(args.command.as_deref(), args.commands_file.as_deref())?;

    let batch_size = check_batch_size(args.batch_size)?;

    let mut config = RunnerConfig::load(args.config.as_deref())?;
    config.apply_overrides(&args.overrides());
    config.preflight_checks()?;
    debug!(config = ?config, "Loaded config");

    let logs_dir = match &args.logs_dir {
        Some(path) => path.clone(),
        None => env::current_dir().map_err(ConfigErrors::WorkingDir)?,
    };
    ensure_logs_dir(&logs_dir)?;

    let resources = Resources {
        max_memory: args.max_memory,
        min_memory: config.bsub.min_memory,
        processes: config.bsub.processes,
    };
    let executor = Executors::load(&config, &args.image, &logs_dir, SystemRunner)?;
    info!(executor = executor.name(), image = %args.image, "Loaded executor");

    let jobs = match &source {
        CommandSource::File(path) => read_commands(path)?
            .into_iter()
            .enumerate()
            .map(|(index, command)| executor.batch_job(index, command, resources, &logs_dir))
            .collect_vec(),
        CommandSource::Inline(command) => {
            vec![executor.single_job(command.clone(), resources, &args.log_file)]
        }
    };

    if let Some(script) = &args.emit_script {
        executor.script_writer()?.write_submission_script(&jobs, script)?;
        return Ok(());
    }

    let logs = match source {
        CommandSource::File(_) => {
            let dispatcher = Dispatcher::new(
                executor,
                batch_size,
                Duration::from_secs(config.wait.batch),
                logs_dir,
            );
            let logs = dispatcher.execute_commands(jobs)?;
            let written = dispatcher.collect_logs(&logs);
            info!(written, "jobs finished");
            logs
        }
        CommandSource::Inline(_) => {
            let dispatcher = Dispatcher::new(
                executor,
                NonZeroUsize::MIN,
                Duration::from_secs(config.wait.single),
                logs_dir,
            );
            let mut logs = LogMap::new();

            for job in jobs {
                logs.extend(dispatcher.execute_command(job)?);
            }
            let written = dispatcher.collect_logs(&logs);
            info!(written, "job finished");
            logs
        }
    };

    for (path, handle) in logs.iter() {
        debug!(handle = %handle, path = ?path, "Job logs");
    }

    Ok(())
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(error) = run(args) {
        error!("{error}");

        let mut source = std::error::Error::source(&error);
        while let Some(cause) = source {
            error!("caused by: {cause}");
            source = cause.source();
        }

        exit(1)
    }
}
