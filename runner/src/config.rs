use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::{self, ErrorKind},
    num::NonZeroUsize,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

pub const SUPPORTED_EXECUTORS: [&str; 2] = ["docker", "bsub"];

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Command file and command cannot both be specified. Provide either --command or --commands-file")]
    ArgumentConflict,
    #[error("Either a commands file or a command must be specified. Provide either --command or --commands-file")]
    MissingCommand,
    #[error("Failed to read config file {path:?}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Config file is invalid")]
    ParseConfig(#[from] serde_yaml::Error),
    #[error("Failed to read commands file {path:?}")]
    ReadCommands {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to create logs directory {path:?}")]
    LogsDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to determine the working directory")]
    WorkingDir(#[source] io::Error),
    #[error("Batch size must be at least 1")]
    InvalidBatchSize,
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("Submission scripts can only be written for bsub, not {0}")]
    ScriptUnsupported(String),
    #[error("Config failed preflight checks")]
    Preflight,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    // which backend jobs are submitted to
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub docker: DockerConfig,
    #[serde(default)]
    pub bsub: BsubConfig,
    #[serde(default)]
    pub wait: WaitConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection proccess
    #[serde(default = "default_executor_name")]
    pub name: String,
    // override for the submission tool, e.g. a wrapper around docker
    pub binary: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: default_executor_name(),
            binary: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DockerConfig {
    #[serde(default = "default_container_prefix")]
    pub container_prefix: PathBuf,
    // host -> container mounts added to every job
    #[serde(default)]
    pub volumes: BTreeMap<PathBuf, PathBuf>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            container_prefix: default_container_prefix(),
            volumes: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BsubConfig {
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_min_memory")]
    pub min_memory: u32,
    #[serde(default = "default_processes")]
    pub processes: u32,
    // where pipe wrapper scripts go, falls back to the logs directory
    pub scripts_dir: Option<PathBuf>,
    #[serde(default = "default_status_binary")]
    pub status_binary: String,
}

impl Default for BsubConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            min_memory: default_min_memory(),
            processes: default_processes(),
            scripts_dir: None,
            status_binary: default_status_binary(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WaitConfig {
    // seconds between polls while a batch is at capacity or draining
    #[serde(default = "default_batch_wait")]
    pub batch: u64,
    // seconds between polls for a single inline command
    #[serde(default = "default_single_wait")]
    pub single: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            batch: default_batch_wait(),
            single: default_single_wait(),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Values given on the command line, each one replaces its config file counterpart
pub struct Overrides {
    pub backend: Option<String>,
    pub queue: Option<String>,
    pub min_memory: Option<u32>,
    pub processes: Option<u32>,
    /// applies to both `wait.batch` and `wait.single`
    pub wait_time: Option<u64>,
}

impl RunnerConfig {
    /// load the config file if one was given, defaults otherwise
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigErrors> {
        match path {
            Some(path) => {
                let content =
                    fs::read_to_string(path).map_err(|source| ConfigErrors::ReadConfig {
                        path: path.to_path_buf(),
                        source,
                    })?;

                Self::parse(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(backend) = &overrides.backend {
            self.executor.name = backend.clone();
        }
        if let Some(queue) = &overrides.queue {
            self.bsub.queue = queue.clone();
        }
        if let Some(min_memory) = overrides.min_memory {
            self.bsub.min_memory = min_memory;
        }
        if let Some(processes) = overrides.processes {
            self.bsub.processes = processes;
        }
        if let Some(wait_time) = overrides.wait_time {
            self.wait.batch = wait_time;
            self.wait.single = wait_time;
        }
    }

    /// Normalize and validate the config, reporting every problem at once
    pub fn preflight_checks(&mut self) -> Result<(), ConfigErrors> {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        self.executor.name = self.executor.name.to_lowercase();

        if !SUPPORTED_EXECUTORS.contains(&self.executor.name.as_str()) {
            error!(
                "executor.name ({}) is not supported, please use one of {SUPPORTED_EXECUTORS:?}",
                self.executor.name
            );
            contains_error = true;
        }

        if !self.docker.container_prefix.is_absolute() {
            error!(
                "docker.container_prefix must be an absolute path, got {}",
                self.docker.container_prefix.display()
            );
            contains_error = true;
        }

        for (host, container) in self.docker.volumes.iter() {
            if !host.is_absolute() || !container.is_absolute() {
                error!(
                    "docker.volumes entry {}:{} must map absolute paths",
                    host.display(),
                    container.display()
                );
                contains_error = true;
            }
        }

        if self.bsub.processes == 0 {
            error!("bsub.processes cannot be 0, a job needs at least one host");
            contains_error = true;
        }

        if self.bsub.min_memory == 0 {
            warn!("bsub.min_memory is 0, jobs will be scheduled without a memory reservation");
        }

        if self.wait.batch == 0 || self.wait.single == 0 {
            warn!("A wait time of 0 polls the backend continuously");
        }

        if contains_error {
            Err(ConfigErrors::Preflight)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Where the commands of a run come from
pub enum CommandSource {
    Inline(String),
    File(PathBuf),
}

/// a batch of 0 could never admit a job
pub fn check_batch_size(batch_size: usize) -> Result<NonZeroUsize, ConfigErrors> {
    NonZeroUsize::new(batch_size).ok_or(ConfigErrors::InvalidBatchSize)
}

/// Reject missing or conflicting command sources before any work starts
pub fn check_arguments(
    command: Option<&str>,
    commands_file: Option<&Path>,
) -> Result<CommandSource, ConfigErrors> {
    match (command, commands_file) {
        (Some(_), Some(_)) => Err(ConfigErrors::ArgumentConflict),
        (None, None) => Err(ConfigErrors::MissingCommand),
        (Some(command), None) => Ok(CommandSource::Inline(command.to_owned())),
        (None, Some(path)) => Ok(CommandSource::File(path.to_path_buf())),
    }
}

/// read one command per line, blank lines are skipped
pub fn read_commands(path: &Path) -> Result<Vec<String>, ConfigErrors> {
    let content = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadCommands {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// create the logs directory, an existing directory is fine
pub fn ensure_logs_dir(path: &Path) -> Result<(), ConfigErrors> {
    match fs::create_dir_all(path) {
        Ok(()) => {
            debug!(path = ?path, "Logs directory ready");
            Ok(())
        }
        Err(error) if error.kind() == ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(source) => Err(ConfigErrors::LogsDir {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn default_executor_name() -> String {
    "docker".to_owned()
}

fn default_container_prefix() -> PathBuf {
    PathBuf::from("/inputs")
}

fn default_queue() -> String {
    "research-hpc".to_owned()
}

fn default_min_memory() -> u32 {
    1
}

fn default_processes() -> u32 {
    1
}

fn default_status_binary() -> String {
    "bjobs".to_owned()
}

fn default_batch_wait() -> u64 {
    100
}

fn default_single_wait() -> u64 {
    10
}
