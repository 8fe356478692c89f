use std::{
    fmt::Debug,
    io,
    process::{Command, Stdio},
};
use tracing::trace;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// container for everything a finished backend CLI call left behind
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Runs a full argument vector (program first) to completion
///
/// Executors only talk to `docker`/`bsub`/`bjobs` through this trait, which keeps
/// the formatting and parsing logic testable without the real tools installed.
pub trait CommandRunner: Debug {
    fn run(&self, args: &[String]) -> io::Result<RunOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
/// `CommandRunner` backed by `std::process::Command`
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, args: &[String]) -> io::Result<RunOutput> {
        let (program, rest) = args.split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector")
        })?;

        trace!(args = ?args, "Spawning backend command");

        let output = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .output()?;

        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            // killed by a signal
            status: output.status.code().unwrap_or(-1),
        })
    }
}

#[cfg(test)]
pub mod testing {
    use super::{CommandRunner, RunOutput};
    use std::{cell::RefCell, collections::VecDeque, io};

    #[derive(Debug, Default)]
    /// Replays canned outputs in order and records every call
    pub struct ScriptedRunner {
        responses: RefCell<VecDeque<Result<RunOutput, io::ErrorKind>>>,
        calls: RefCell<Vec<Vec<String>>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, stdout: &str, stderr: &str, status: i32) -> &Self {
            self.responses.borrow_mut().push_back(Ok(RunOutput {
                stdout: stdout.to_owned(),
                stderr: stderr.to_owned(),
                status,
            }));
            self
        }

        pub fn push_err(&self, kind: io::ErrorKind) -> &Self {
            self.responses.borrow_mut().push_back(Err(kind));
            self
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.borrow().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, args: &[String]) -> io::Result<RunOutput> {
            self.calls.borrow_mut().push(args.to_vec());

            match self.responses.borrow_mut().pop_front() {
                Some(Ok(output)) => Ok(output),
                Some(Err(kind)) => Err(io::Error::from(kind)),
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    "no scripted response left",
                )),
            }
        }
    }
}
