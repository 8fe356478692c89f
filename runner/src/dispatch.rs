use crate::{
    executors::{Backend, ExecutorError},
    job::{JobHandle, LogMap, LogicalJob},
};
use std::{
    collections::{BTreeSet, VecDeque},
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "dispatch_test.rs"]
mod dispatch_test;

#[derive(Error, Debug)]
pub enum DispatchError {
    // without backend visibility the loop can't make progress
    #[error("Failed to query running jobs")]
    Poll(#[source] ExecutorError),
    #[error("Failed to submit job")]
    Submission(#[source] ExecutorError),
}

#[derive(Debug)]
/// Keeps at most `batch_size` jobs in flight on a backend and waits for all of them
pub struct Dispatcher<B: Backend> {
    backend: B,
    batch_size: NonZeroUsize,
    wait_time: Duration,
    logs_dir: PathBuf,
}

impl<B: Backend> Dispatcher<B> {
    pub fn new(
        backend: B,
        batch_size: NonZeroUsize,
        wait_time: Duration,
        logs_dir: PathBuf,
    ) -> Self {
        Self {
            backend,
            batch_size,
            wait_time,
            logs_dir,
        }
    }

    fn poll(&self) -> Result<BTreeSet<JobHandle>, DispatchError> {
        self.backend.running().map_err(DispatchError::Poll)
    }

    /// drop every handle the backend no longer reports as running
    fn reconcile(&self, waiting: &mut BTreeSet<JobHandle>) -> Result<(), DispatchError> {
        let running = self.poll()?;
        debug!(running = ?running, "running jobs");

        waiting.retain(|handle| {
            let still_running = running.contains(handle);

            if !still_running {
                info!(handle = %handle, "Job finished");
            }

            still_running
        });

        Ok(())
    }

    fn log_path(&self, job: &LogicalJob, handle: &JobHandle) -> PathBuf {
        job.log_file
            .clone()
            .unwrap_or_else(|| self.logs_dir.join(format!("{handle}.log")))
    }

    /// add `handle` to `logs`, a path claimed by an earlier job is never reassigned
    fn record(&self, logs: &mut LogMap, job: &LogicalJob, handle: JobHandle) {
        let mut path = self.log_path(job, &handle);

        if logs.contains_key(&path) {
            let fallback = self.logs_dir.join(format!("{handle}.log"));
            warn!(handle = %handle, path = ?path, fallback = ?fallback, "Log file already claimed by an earlier job");
            path = fallback;
        }

        logs.entry(path).or_insert(handle);
    }

    /// Submit `jobs` in order and block until every submitted job finished
    ///
    /// Submission failures drop the job, poll failures abort the whole run.
    /// Returns where each job's logs belong.
    #[instrument(skip(self, jobs), fields(batch_size = self.batch_size.get()))]
    pub fn execute_commands(
        &self,
        jobs: impl IntoIterator<Item = LogicalJob>,
    ) -> Result<LogMap, DispatchError> {
        let mut pending: VecDeque<LogicalJob> = jobs.into_iter().collect();
        let mut waiting: BTreeSet<JobHandle> = BTreeSet::new();
        let mut logs = LogMap::new();

        info!(jobs = pending.len(), "Dispatching jobs");

        while !pending.is_empty() {
            if waiting.len() >= self.batch_size.get() {
                info!(
                    "waiting {} seconds for jobs to finish...",
                    self.wait_time.as_secs()
                );
                thread::sleep(self.wait_time);
            } else if let Some(job) = pending.pop_front() {
                match self.backend.submit(&job) {
                    Ok(handle) => {
                        info!(handle = %handle, command = %job.command, "Job submitted");

                        waiting.insert(handle.clone());
                        self.record(&mut logs, &job, handle);
                    }
                    Err(error) => {
                        warn!(error = %error, command = %job.command, "Submission failed, dropping job");
                    }
                }
            }

            self.reconcile(&mut waiting)?;
            debug!(waiting = ?waiting, "currently waiting for");
        }

        while !waiting.is_empty() {
            info!(waiting = ?waiting, "currently waiting for");
            thread::sleep(self.wait_time);
            self.reconcile(&mut waiting)?;
        }

        info!(submitted = logs.len(), "All jobs finished");

        Ok(logs)
    }

    /// Submit a single job and block until it finished
    ///
    /// Unlike a batch, a failed submission is an error since nothing else is left to do.
    #[instrument(skip(self, job), fields(command = %job.command))]
    pub fn execute_command(&self, job: LogicalJob) -> Result<LogMap, DispatchError> {
        let handle = self
            .backend
            .submit(&job)
            .map_err(DispatchError::Submission)?;
        info!(handle = %handle, "Job submitted");

        let mut waiting = BTreeSet::from([handle.clone()]);

        loop {
            self.reconcile(&mut waiting)?;

            if waiting.is_empty() {
                break;
            }

            debug!(handle = %handle, "currently waiting");
            thread::sleep(self.wait_time);
        }

        Ok(LogMap::from([(self.log_path(&job, &handle), handle)]))
    }

    fn write_logs(&self, path: &Path, handle: &JobHandle) -> bool {
        match self.backend.fetch_logs(handle) {
            Ok(Some(content)) => match fs::write(path, content) {
                Ok(()) => {
                    debug!(handle = %handle, path = ?path, "Wrote logs");
                    true
                }
                Err(error) => {
                    warn!(handle = %handle, path = ?path, error = %error, "Failed to write logs");
                    false
                }
            },
            Ok(None) => {
                debug!(handle = %handle, path = ?path, "Logs already written by the backend");
                false
            }
            Err(error) => {
                warn!(handle = %handle, error = %error, "Failed to get logs for job");
                false
            }
        }
    }

    /// Write the logs of every finished job, returns how many files were written
    ///
    /// A job whose logs can't be fetched or written is skipped.
    #[instrument(skip_all, fields(jobs = logs.len()))]
    pub fn collect_logs(&self, logs: &LogMap) -> usize {
        info!("gathering job logs");

        let mut written = 0;

        for (path, handle) in logs.iter() {
            if self.write_logs(path, handle) {
                written += 1;
            }
        }

        written
    }
}
