use indexmap::IndexMap;
use std::{fmt, path::PathBuf};

/// default `-o` target for scheduler jobs without an explicit output file
pub const DEFAULT_OUTPUT_FILE: &str = "job.output";
/// default `-oo` target and single job log file
pub const DEFAULT_LOG_FILE: &str = "job.log";

/// map of log file -> handle of the job whose output belongs there, in submission order
pub type LogMap = IndexMap<PathBuf, JobHandle>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Resource limits attached to every job of a run
pub struct Resources {
    /// upper memory limit in GB
    pub max_memory: u32,
    /// memory reservation in GB, only used by the scheduler
    pub min_memory: u32,
    /// number of hosts to span, only used by the scheduler
    pub processes: u32,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            max_memory: 2,
            min_memory: 1,
            processes: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A shell command together with everything needed to submit it
/// Immutable once handed to an executor
pub struct LogicalJob {
    pub command: String,
    pub resources: Resources,
    pub output_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl LogicalJob {
    pub fn new(command: impl Into<String>, resources: Resources) -> Self {
        Self {
            command: command.into(),
            resources,
            output_file: None,
            log_file: None,
        }
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Opaque identifier the backend assigned at submission time
pub struct JobHandle(String);

impl JobHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobHandle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
