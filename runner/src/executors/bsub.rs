use super::{invoke, Backend, ExecutorError};
use crate::{
    config::RunnerConfig,
    job::{JobHandle, LogicalJob, DEFAULT_LOG_FILE, DEFAULT_OUTPUT_FILE},
    runner::CommandRunner,
    shell,
};
use itertools::Itertools;
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[cfg(test)]
#[path = "bsub_test.rs"]
mod bsub_test;

/// what `bjobs` prints (to stderr) when nothing is queued or running
const NO_UNFINISHED_JOBS: &str = "No unfinished job found";

/// resource requirement string for `bsub -R`, memory in GB
pub fn format_stats(min_memory: u32, processes: u32) -> String {
    let memory = u64::from(min_memory) * 1000;

    format!("select[mem>{memory}] rusage[mem={memory}] span[hosts={processes}]")
}

/// extract the id from `Job <12345> is submitted to queue <research-hpc>.`
pub fn parse_submission(output: &str) -> Option<JobHandle> {
    output
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(id, _)| id.trim())
        .filter(|id| !id.is_empty())
        .map(JobHandle::from)
}

/// parse `bjobs` output, rows without a numeric job id are skipped
pub fn parse_running(output: &str) -> BTreeSet<JobHandle> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
        .map(JobHandle::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A ready to run `bsub` call
pub struct BsubInvocation {
    pub args: Vec<String>,
    /// wrapper script written for piped commands
    pub wrapper: Option<PathBuf>,
}

impl BsubInvocation {
    /// the invocation as a single shell line
    pub fn render(&self) -> String {
        shell::join(&self.args)
    }
}

#[derive(Debug)]
/// Submits jobs to LSF, running each one inside a docker image
pub struct BsubExecutor<R: CommandRunner> {
    binary: String,
    status_binary: String,
    image: String,
    queue: String,
    scripts_dir: PathBuf,
    runner: R,
}

impl<R: CommandRunner> BsubExecutor<R> {
    pub fn load(config: &RunnerConfig, image: &str, logs_dir: &Path, runner: R) -> Self {
        Self {
            binary: config
                .executor
                .binary
                .clone()
                .unwrap_or_else(|| "bsub".to_owned()),
            status_binary: config.bsub.status_binary.clone(),
            image: image.to_owned(),
            queue: config.bsub.queue.clone(),
            scripts_dir: config
                .bsub
                .scripts_dir
                .clone()
                .unwrap_or_else(|| logs_dir.to_path_buf()),
            runner,
        }
    }

    /// `bsub` can't quote multi-stage pipelines, those run from a wrapper script
    fn write_wrapper(&self, command: &str) -> Result<PathBuf, ExecutorError> {
        let path = self.scripts_dir.join(format!("{}.sh", Uuid::new_v4()));

        fs::write(&path, command).map_err(|source| ExecutorError::Script {
            path: path.clone(),
            source,
        })?;
        debug!(path = ?path, "Wrote wrapper script for piped command");

        Ok(path)
    }

    /// the job reads its wrapper at run time, so only rejected submissions drop it
    fn discard_wrapper(&self, invocation: &BsubInvocation) {
        if let Some(path) = &invocation.wrapper {
            if let Err(error) = fs::remove_file(path) {
                warn!(path = ?path, error = %error, "Failed to remove wrapper script");
            }
        }
    }

    /// Build the `bsub` argument vector for `job`
    ///
    /// Writes a wrapper script first if the command contains a pipe.
    pub fn build_command(&self, job: &LogicalJob) -> Result<BsubInvocation, ExecutorError> {
        let (command, wrapper) = if job.command.contains('|') {
            let path = self.write_wrapper(&job.command)?;
            let command = format!("bash {}", shell::quote(&path.to_string_lossy()));

            (command, Some(path))
        } else {
            (job.command.clone(), None)
        };

        let resources = job.resources;
        let output_file = job
            .output_file
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_OUTPUT_FILE));
        let log_file = job
            .log_file
            .as_deref()
            .unwrap_or(Path::new(DEFAULT_LOG_FILE));

        let args = vec![
            self.binary.clone(),
            "-R".to_owned(),
            format_stats(resources.min_memory, resources.processes),
            "-M".to_owned(),
            (u64::from(resources.max_memory) * 1_000_000).to_string(),
            "-q".to_owned(),
            self.queue.clone(),
            "-o".to_owned(),
            output_file.to_string_lossy().into_owned(),
            "-oo".to_owned(),
            log_file.to_string_lossy().into_owned(),
            "-a".to_owned(),
            format!("docker({})", self.image),
            command,
        ];

        Ok(BsubInvocation { args, wrapper })
    }

    /// Write a bash script with one `bsub` line per job instead of submitting
    pub fn write_submission_script(
        &self,
        jobs: &[LogicalJob],
        path: &Path,
    ) -> Result<(), ExecutorError> {
        let lines = jobs
            .iter()
            .map(|job| self.build_command(job).map(|invocation| invocation.render()))
            .collect::<Result<Vec<_>, _>>()?;

        let mut script = lines.into_iter().join("\n");
        script.push('\n');

        fs::write(path, script).map_err(|source| ExecutorError::Script {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = ?path, jobs = jobs.len(), "Wrote submission script");

        Ok(())
    }
}

impl<R: CommandRunner> Backend for BsubExecutor<R> {
    #[instrument(level = "debug", skip(self, job), fields(command = %job.command))]
    fn submit(&self, job: &LogicalJob) -> Result<JobHandle, ExecutorError> {
        let invocation = self.build_command(job)?;
        debug!(
            command = %invocation.render(),
            wrapper = ?invocation.wrapper,
            "bsub command"
        );

        let output = match invoke(&self.runner, &invocation.args) {
            Ok(output) => output,
            Err(error) => {
                self.discard_wrapper(&invocation);
                return Err(error);
            }
        };

        if !output.success() {
            self.discard_wrapper(&invocation);
            return Err(ExecutorError::Submission {
                status: output.status,
                stderr: output.stderr,
            });
        }

        parse_submission(&output.stdout).ok_or(ExecutorError::MissingHandle(output.stdout))
    }

    fn running(&self) -> Result<BTreeSet<JobHandle>, ExecutorError> {
        let output = invoke(&self.runner, &[self.status_binary.clone()])?;

        if output.success() || output.stderr.contains(NO_UNFINISHED_JOBS) {
            Ok(parse_running(&output.stdout))
        } else {
            Err(ExecutorError::Poll {
                status: output.status,
                stderr: output.stderr,
            })
        }
    }

    /// LSF writes `-o`/`-oo` itself, nothing left to fetch
    fn fetch_logs(&self, _handle: &JobHandle) -> Result<Option<String>, ExecutorError> {
        Ok(None)
    }
}
