use super::{invoke, Backend, ExecutorError};
use crate::{
    config::{ConfigErrors, RunnerConfig},
    job::{JobHandle, LogicalJob},
    runner::CommandRunner,
};
use itertools::Itertools;
use std::{
    collections::{BTreeMap, BTreeSet},
    env,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, instrument};
use uuid::Uuid;

#[cfg(test)]
#[path = "docker_test.rs"]
mod docker_test;

/// `docker ps` only prints this many characters of a container id
pub const CONTAINER_ID_LENGTH: usize = 7;

/// map of host path -> mount point inside the container
pub type VolumeMap = BTreeMap<PathBuf, PathBuf>;

#[derive(Debug)]
/// Runs every job as a detached container
pub struct DockerExecutor<R: CommandRunner> {
    binary: String,
    image: String,
    container_prefix: PathBuf,
    volumes: VolumeMap,
    // relative paths in commands are resolved against this
    cwd: PathBuf,
    runner: R,
}

fn is_path_like(piece: &str) -> bool {
    !piece.starts_with('-') && piece.contains(['.', '/'])
}

/// make `piece` absolute and drop `.`/`..` without touching the filesystem
fn absolutize(cwd: &Path, piece: &str) -> PathBuf {
    let mut path = PathBuf::new();

    for component in cwd.join(piece).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                path.pop();
            }
            other => path.push(other.as_os_str()),
        }
    }

    path
}

fn truncate_id(id: &str) -> &str {
    match id.char_indices().nth(CONTAINER_ID_LENGTH) {
        Some((index, _)) => &id[..index],
        None => id,
    }
}

/// Rewrite path-like tokens of `command` to container paths
///
/// Files are mounted through their parent directory, everything else is
/// mounted as is. Each distinct host directory gets exactly one generated
/// mount point below `container_prefix`, repeated references share it.
pub fn remap_command(command: &str, container_prefix: &Path, cwd: &Path) -> (Vec<String>, VolumeMap) {
    let mut volumes = VolumeMap::new();

    let pieces = command
        .split_whitespace()
        .map(|piece| {
            if !is_path_like(piece) {
                return piece.to_owned();
            }

            let host_path = absolutize(cwd, piece);
            let file_name = host_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .filter(|name| name.contains('.'));

            let mount_source = match file_name {
                Some(_) => host_path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("/")),
                None => host_path.clone(),
            };

            let mount_point = volumes
                .entry(mount_source)
                .or_insert_with(|| container_prefix.join(Uuid::new_v4().to_string()));

            let container_path = match file_name {
                Some(name) => mount_point.join(name),
                None => mount_point.clone(),
            };

            container_path.to_string_lossy().into_owned()
        })
        .collect_vec();

    (pieces, volumes)
}

/// parse `docker ps` output into truncated container ids
pub fn parse_running(output: &str) -> BTreeSet<JobHandle> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(|id| JobHandle::from(truncate_id(id)))
        .collect()
}

impl<R: CommandRunner> DockerExecutor<R> {
    pub fn load(config: &RunnerConfig, image: &str, runner: R) -> Result<Self, ConfigErrors> {
        let cwd = env::current_dir().map_err(ConfigErrors::WorkingDir)?;

        Ok(Self::new(config, image, cwd, runner))
    }

    pub fn new(config: &RunnerConfig, image: &str, cwd: PathBuf, runner: R) -> Self {
        Self {
            binary: config
                .executor
                .binary
                .clone()
                .unwrap_or_else(|| "docker".to_owned()),
            image: image.to_owned(),
            container_prefix: config.docker.container_prefix.clone(),
            volumes: config.docker.volumes.clone(),
            cwd,
            runner,
        }
    }

    /// argument vector for `docker run`
    pub fn build_command(&self, job: &LogicalJob) -> Vec<String> {
        let (pieces, mut volumes) = remap_command(&job.command, &self.container_prefix, &self.cwd);
        volumes.extend(
            self.volumes
                .iter()
                .map(|(host, container)| (host.clone(), container.clone())),
        );

        let mut args = vec![self.binary.clone(), "run".to_owned(), "-d".to_owned()];

        for (host, container) in volumes.iter() {
            args.push("-v".to_owned());
            args.push(format!("{}:{}", host.display(), container.display()));
        }

        args.push("-m".to_owned());
        args.push(format!("{}G", job.resources.max_memory));
        args.push(self.image.clone());
        args.extend(pieces);

        args
    }
}

impl<R: CommandRunner> Backend for DockerExecutor<R> {
    #[instrument(level = "debug", skip(self, job), fields(command = %job.command))]
    fn submit(&self, job: &LogicalJob) -> Result<JobHandle, ExecutorError> {
        let args = self.build_command(job);
        debug!(args = ?args, "docker command");

        let output = invoke(&self.runner, &args)?;

        if !output.success() {
            return Err(ExecutorError::Submission {
                status: output.status,
                stderr: output.stderr,
            });
        }

        match output.stdout.trim() {
            "" => Err(ExecutorError::MissingHandle(output.stdout)),
            id => Ok(JobHandle::from(truncate_id(id))),
        }
    }

    fn running(&self) -> Result<BTreeSet<JobHandle>, ExecutorError> {
        let output = invoke(&self.runner, &[self.binary.clone(), "ps".to_owned()])?;

        if output.success() {
            Ok(parse_running(&output.stdout))
        } else {
            Err(ExecutorError::Poll {
                status: output.status,
                stderr: output.stderr,
            })
        }
    }

    fn fetch_logs(&self, handle: &JobHandle) -> Result<Option<String>, ExecutorError> {
        let output = invoke(
            &self.runner,
            &[
                self.binary.clone(),
                "logs".to_owned(),
                handle.as_str().to_owned(),
            ],
        )?;

        if output.success() {
            // job output is interleaved into stderr, stdout is discarded
            Ok(Some(output.stderr))
        } else {
            Err(ExecutorError::LogFetch {
                handle: handle.clone(),
                status: output.status,
            })
        }
    }
}
