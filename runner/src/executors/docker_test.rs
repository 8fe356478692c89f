use super::{parse_running, remap_command, DockerExecutor, CONTAINER_ID_LENGTH};
use crate::{
    config::RunnerConfig,
    executors::{Backend, ExecutorError},
    job::{JobHandle, LogicalJob, Resources},
    runner::testing::ScriptedRunner,
};
use assert_matches::assert_matches;
use std::{
    io,
    path::{Path, PathBuf},
};

const PS_OUTPUT: &str = "\
CONTAINER ID   IMAGE          COMMAND        CREATED         STATUS         PORTS     NAMES
3f4e8a9b1c2d   ubuntu:22.04   \"sleep 60\"     5 seconds ago   Up 4 seconds             eager_babbage
9a8b7c6d5e4f   ubuntu:22.04   \"sleep 90\"     9 seconds ago   Up 8 seconds             calm_turing
";

fn executor(runner: ScriptedRunner) -> DockerExecutor<ScriptedRunner> {
    DockerExecutor::new(
        &RunnerConfig::default(),
        "ubuntu:22.04",
        PathBuf::from("/work"),
        runner,
    )
}

fn job(command: &str) -> LogicalJob {
    LogicalJob::new(
        command,
        Resources {
            max_memory: 4,
            ..Resources::default()
        },
    )
}

#[test]
fn repeated_file_shares_mount_point() {
    let (pieces, volumes) = remap_command(
        "cat /data/in/sample.txt /data/in/sample.txt",
        Path::new("/inputs"),
        Path::new("/work"),
    );

    assert_eq!(volumes.len(), 1);
    let mount = volumes.get(Path::new("/data/in")).unwrap();
    assert!(mount.starts_with("/inputs"));

    assert_eq!(pieces[0], "cat");
    assert_eq!(pieces[1], pieces[2]);
    assert_eq!(Path::new(&pieces[1]), mount.join("sample.txt"));
}

#[test]
fn files_in_one_directory_share_mount_point() {
    let (pieces, volumes) = remap_command(
        "paste /data/in/a.txt /data/in/b.txt /data/other/c.txt",
        Path::new("/inputs"),
        Path::new("/work"),
    );

    assert_eq!(volumes.len(), 2);
    assert_eq!(
        Path::new(&pieces[1]).parent(),
        Path::new(&pieces[2]).parent()
    );
    assert_ne!(
        Path::new(&pieces[1]).parent(),
        Path::new(&pieces[3]).parent()
    );
}

#[test]
fn directories_are_mounted_whole() {
    let (pieces, volumes) =
        remap_command("ls /data/out", Path::new("/inputs"), Path::new("/work"));

    let mount = volumes.get(Path::new("/data/out")).unwrap();
    assert_eq!(Path::new(&pieces[1]), mount.as_path());
}

#[test]
fn flags_and_plain_words_are_untouched() {
    let (pieces, volumes) = remap_command(
        "tool --config=a.yaml -o out.txt run",
        Path::new("/inputs"),
        Path::new("/work"),
    );

    assert_eq!(pieces[0], "tool");
    assert_eq!(pieces[1], "--config=a.yaml");
    assert_eq!(pieces[2], "-o");
    assert_eq!(pieces[4], "run");
    // out.txt is relative to the working directory
    assert!(volumes.contains_key(Path::new("/work")));
}

#[test]
fn relative_paths_are_normalized() {
    let (_, volumes) = remap_command(
        "python ./scripts/../bin/run.py",
        Path::new("/inputs"),
        Path::new("/work"),
    );

    assert!(volumes.contains_key(Path::new("/work/bin")));
}

#[test]
fn mappings_do_not_leak_between_commands() {
    let (_, first) = remap_command("cat /a/x.txt", Path::new("/inputs"), Path::new("/"));
    let (_, second) = remap_command("cat /b/y.txt", Path::new("/inputs"), Path::new("/"));

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert!(!second.contains_key(Path::new("/a")));
}

#[test]
fn build_command_without_paths() {
    let executor = executor(ScriptedRunner::new());
    let args = executor.build_command(&job("echo hello"));

    assert_eq!(
        args,
        vec!["docker", "run", "-d", "-m", "4G", "ubuntu:22.04", "echo", "hello"]
    );
    assert_eq!(args[6..].join(" "), "echo hello");
}

#[test]
fn build_command_mounts_volumes() {
    let executor = executor(ScriptedRunner::new());
    let args = executor.build_command(&job("wc -l /data/in/sample.txt"));

    assert_eq!(&args[..4], &["docker", "run", "-d", "-v"]);
    let (host, container) = args[4].split_once(':').unwrap();
    assert_eq!(host, "/data/in");
    assert_eq!(&args[5..8], &["-m", "4G", "ubuntu:22.04"]);
    assert_eq!(args[10], format!("{container}/sample.txt"));
}

#[test]
fn configured_volumes_are_added() {
    let mut config = RunnerConfig::default();
    config
        .docker
        .volumes
        .insert(PathBuf::from("/ref"), PathBuf::from("/mnt/ref"));
    let executor = DockerExecutor::new(&config, "img", PathBuf::from("/"), ScriptedRunner::new());

    let args = executor.build_command(&job("echo hi"));
    assert!(args.contains(&"/ref:/mnt/ref".to_owned()));
}

#[test]
fn submit_truncates_container_id() {
    let runner = ScriptedRunner::new();
    runner.push("3f4e8a9b1c2d5e6f7a8b9c0d\n", "", 0);
    let executor = executor(runner);

    let handle = executor.submit(&job("echo hello")).unwrap();

    assert_eq!(handle.as_str().len(), CONTAINER_ID_LENGTH);
    assert_eq!(handle, JobHandle::from("3f4e8a9"));
}

#[test]
fn failed_submission_is_reported() {
    let runner = ScriptedRunner::new();
    runner.push("", "Unable to find image", 125);
    let executor = executor(runner);

    assert_matches!(
        executor.submit(&job("echo hello")),
        Err(ExecutorError::Submission { status: 125, .. })
    );
}

#[test]
fn empty_submission_output_has_no_handle() {
    let runner = ScriptedRunner::new();
    runner.push("\n", "", 0);
    let executor = executor(runner);

    assert_matches!(
        executor.submit(&job("echo hello")),
        Err(ExecutorError::MissingHandle(_))
    );
}

#[test]
fn parse_running_truncates_ids() {
    let running = parse_running(PS_OUTPUT);

    assert_eq!(
        running.into_iter().collect::<Vec<_>>(),
        vec![JobHandle::from("3f4e8a9"), JobHandle::from("9a8b7c6")]
    );
}

#[test]
fn no_running_containers() {
    assert!(parse_running("CONTAINER ID   IMAGE   COMMAND\n").is_empty());
    assert!(parse_running("").is_empty());
}

#[test]
fn polling_twice_is_stable() {
    let runner = ScriptedRunner::new();
    runner.push(PS_OUTPUT, "", 0).push(PS_OUTPUT, "", 0);
    let executor = executor(runner);

    assert_eq!(executor.running().unwrap(), executor.running().unwrap());
}

#[test]
fn poll_failures_are_errors() {
    let runner = ScriptedRunner::new();
    runner
        .push("", "Cannot connect to the Docker daemon", 1)
        .push_err(io::ErrorKind::NotFound);
    let executor = executor(runner);

    assert_matches!(executor.running(), Err(ExecutorError::Poll { status: 1, .. }));
    assert_matches!(executor.running(), Err(ExecutorError::Spawn { .. }));
}

#[test]
fn fetch_logs_reads_stderr() {
    let runner = ScriptedRunner::new();
    runner
        .push("ignored", "hello\n", 0)
        .push("", "No such container", 1);
    let executor = executor(runner);
    let handle = JobHandle::from("3f4e8a9");

    assert_eq!(
        executor.fetch_logs(&handle).unwrap().as_deref(),
        Some("hello\n")
    );
    assert_matches!(
        executor.fetch_logs(&handle),
        Err(ExecutorError::LogFetch { status: 1, .. })
    );
    assert_eq!(
        executor.runner.calls()[0],
        vec!["docker", "logs", "3f4e8a9"]
    );
}
