pub mod bsub;
pub mod docker;

use crate::{
    config::{ConfigErrors, RunnerConfig},
    job::{JobHandle, LogicalJob, Resources, DEFAULT_OUTPUT_FILE},
    runner::{CommandRunner, RunOutput},
};
use std::{
    collections::BTreeSet,
    fmt::Debug,
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[cfg(test)]
#[path = "executors_test.rs"]
mod executors_test;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("Submission exited with status {status}: {stderr}")]
    Submission { status: i32, stderr: String },
    #[error("No job handle in submission output: {0:?}")]
    MissingHandle(String),
    #[error("Status query exited with status {status}: {stderr}")]
    Poll { status: i32, stderr: String },
    #[error("Log retrieval for {handle} exited with status {status}")]
    LogFetch { handle: JobHandle, status: i32 },
    #[error("Failed to write script {path:?}")]
    Script {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Everything the dispatch loop needs from a job execution backend
pub trait Backend: Debug {
    /// submit a job and return the handle the backend assigned to it
    fn submit(&self, job: &LogicalJob) -> Result<JobHandle, ExecutorError>;

    /// snapshot of all handles the backend currently considers active
    fn running(&self) -> Result<BTreeSet<JobHandle>, ExecutorError>;

    /// output of a finished job, `None` if the backend already wrote it to disk
    fn fetch_logs(&self, handle: &JobHandle) -> Result<Option<String>, ExecutorError>;
}

impl<B: Backend + ?Sized> Backend for &B {
    fn submit(&self, job: &LogicalJob) -> Result<JobHandle, ExecutorError> {
        (**self).submit(job)
    }

    fn running(&self) -> Result<BTreeSet<JobHandle>, ExecutorError> {
        (**self).running()
    }

    fn fetch_logs(&self, handle: &JobHandle) -> Result<Option<String>, ExecutorError> {
        (**self).fetch_logs(handle)
    }
}

/// run a backend command, turning spawn failures into `ExecutorError::Spawn`
pub(crate) fn invoke<R: CommandRunner>(
    runner: &R,
    args: &[String],
) -> Result<RunOutput, ExecutorError> {
    runner.run(args).map_err(|source| ExecutorError::Spawn {
        program: args.first().cloned().unwrap_or_default(),
        source,
    })
}

#[derive(Debug)]
pub enum Executors<R: CommandRunner> {
    Docker(docker::DockerExecutor<R>),
    Bsub(bsub::BsubExecutor<R>),
}

impl<R: CommandRunner> Executors<R> {
    pub fn load(
        config: &RunnerConfig,
        image: &str,
        logs_dir: &Path,
        runner: R,
    ) -> Result<Self, ConfigErrors> {
        match config.executor.name.as_str() {
            "docker" => Ok(Self::Docker(docker::DockerExecutor::load(
                config, image, runner,
            )?)),
            "bsub" => Ok(Self::Bsub(bsub::BsubExecutor::load(
                config, image, logs_dir, runner,
            ))),
            _ => Err(ConfigErrors::UnsupportedExecutor(
                config.executor.name.clone(),
            )),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker(_) => "docker",
            Self::Bsub(_) => "bsub",
        }
    }

    /// only the scheduler can replay a run from a script
    pub fn script_writer(&self) -> Result<&bsub::BsubExecutor<R>, ConfigErrors> {
        match self {
            Self::Bsub(executor) => Ok(executor),
            other => Err(ConfigErrors::ScriptUnsupported(other.name().to_owned())),
        }
    }

    /// Create the `index`th job of a batch
    ///
    /// Docker logs are named after the container once it exists, so only
    /// scheduler jobs get their output files assigned up front.
    pub fn batch_job(
        &self,
        index: usize,
        command: String,
        resources: Resources,
        logs_dir: &Path,
    ) -> LogicalJob {
        let job = LogicalJob::new(command, resources);

        match self {
            Self::Docker(_) => job,
            Self::Bsub(_) => job
                .with_output(logs_dir.join(format!("job.{index}.output")))
                .with_log(logs_dir.join(format!("job.{index}.log"))),
        }
    }

    /// Create the job of a single inline command, logging to `log_file`
    pub fn single_job(&self, command: String, resources: Resources, log_file: &Path) -> LogicalJob {
        let job = LogicalJob::new(command, resources).with_log(log_file);

        match self {
            Self::Docker(_) => job,
            Self::Bsub(_) => job.with_output(DEFAULT_OUTPUT_FILE),
        }
    }
}

impl<R: CommandRunner> Backend for Executors<R> {
    fn submit(&self, job: &LogicalJob) -> Result<JobHandle, ExecutorError> {
        match self {
            Self::Docker(executor) => executor.submit(job),
            Self::Bsub(executor) => executor.submit(job),
        }
    }

    fn running(&self) -> Result<BTreeSet<JobHandle>, ExecutorError> {
        match self {
            Self::Docker(executor) => executor.running(),
            Self::Bsub(executor) => executor.running(),
        }
    }

    fn fetch_logs(&self, handle: &JobHandle) -> Result<Option<String>, ExecutorError> {
        match self {
            Self::Docker(executor) => executor.fetch_logs(handle),
            Self::Bsub(executor) => executor.fetch_logs(handle),
        }
    }
}
