//! Job execution: spawn the build command under the working-directory
//! contract, bounded by the job's timeout and cooperative cancellation.

use cyxmake_protocol::defaults::JOB_TIMED_OUT_MESSAGE;
use cyxmake_protocol::{JobResult, JobSpec};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info};

/// How a job run ended.
#[derive(Debug)]
pub enum ExecOutcome {
    Finished(JobResult),
    Cancelled,
}

/// Output file the spec implies (explicit, or `<source>.o`).
pub fn resolve_output(spec: &JobSpec) -> Option<PathBuf> {
    spec.output_file
        .clone()
        .or_else(|| spec.source_file.as_ref().map(|s| s.with_extension("o")))
}

fn build_command(spec: &JobSpec, default_work_dir: &Path) -> Result<Command, String> {
    let mut command = if let Some(build_command) = &spec.build_command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(build_command);
        cmd
    } else {
        let compiler = spec
            .compiler
            .clone()
            .ok_or_else(|| "job spec has neither build_command nor compiler".to_string())?;
        let source = spec
            .source_file
            .clone()
            .ok_or_else(|| "compile job has no source file".to_string())?;
        let output = resolve_output(spec).expect("source implies an output");

        let mut cmd = Command::new(compiler);
        cmd.args(&spec.compiler_args);
        for include in &spec.include_paths {
            cmd.arg("-I").arg(include);
        }
        cmd.arg("-c").arg(source).arg("-o").arg(output);
        cmd
    };

    let work_dir = spec
        .working_dir
        .clone()
        .unwrap_or_else(|| default_work_dir.to_path_buf());
    command.current_dir(work_dir);
    for (key, value) in &spec.env_vars {
        command.env(key, value);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(command)
}

/// Run the job to completion, timeout, or cancellation.
///
/// The child is killed when its future is dropped (timeout/cancel), so no
/// orphan processes outlive the job.
pub async fn run_job(
    spec: &JobSpec,
    default_work_dir: &Path,
    mut cancel: watch::Receiver<bool>,
) -> ExecOutcome {
    let started = Instant::now();
    let job_id = spec.job_id;

    let mut command = match build_command(spec, default_work_dir) {
        Ok(command) => command,
        Err(error) => {
            return ExecOutcome::Finished(JobResult {
                job_id,
                success: false,
                exit_code: -1,
                duration_secs: 0.0,
                stdout: String::new(),
                stderr: error,
                output_file: None,
                output_hash: None,
                output_size: None,
            });
        }
    };

    debug!("job {} starting: {:?}", job_id, command.as_std());
    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecOutcome::Finished(JobResult {
                job_id,
                success: false,
                exit_code: -1,
                duration_secs: started.elapsed().as_secs_f64(),
                stdout: String::new(),
                stderr: format!("failed to spawn: {}", e),
                output_file: None,
                output_hash: None,
                output_size: None,
            });
        }
    };

    let timeout = Duration::from_secs(spec.timeout_secs.max(1));
    let output = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait_with_output()) => result,
        _ = cancel.changed() => {
            info!("job {} cancelled", job_id);
            return ExecOutcome::Cancelled;
        }
    };

    let duration_secs = started.elapsed().as_secs_f64();
    let result = match output {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            let success = output.status.success();
            let (output_file, output_hash, output_size) = if success {
                describe_output(spec, default_work_dir)
            } else {
                (None, None, None)
            };
            JobResult {
                job_id,
                success,
                exit_code,
                duration_secs,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                output_file,
                output_hash,
                output_size,
            }
        }
        Ok(Err(e)) => JobResult {
            job_id,
            success: false,
            exit_code: -1,
            duration_secs,
            stdout: String::new(),
            stderr: format!("wait failed: {}", e),
            output_file: None,
            output_hash: None,
            output_size: None,
        },
        Err(_elapsed) => JobResult {
            job_id,
            success: false,
            exit_code: -1,
            duration_secs,
            stdout: String::new(),
            stderr: JOB_TIMED_OUT_MESSAGE.to_string(),
            output_file: None,
            output_hash: None,
            output_size: None,
        },
    };

    ExecOutcome::Finished(result)
}

/// Locate and fingerprint the produced artifact, if any.
fn describe_output(
    spec: &JobSpec,
    default_work_dir: &Path,
) -> (Option<PathBuf>, Option<String>, Option<u64>) {
    let Some(output) = resolve_output(spec) else {
        return (None, None, None);
    };
    let base = spec
        .working_dir
        .clone()
        .unwrap_or_else(|| default_work_dir.to_path_buf());
    let path = if output.is_absolute() {
        output
    } else {
        base.join(output)
    };
    match std::fs::read(&path) {
        Ok(bytes) => {
            let hash = cyxmake_cache::hash_bytes(&bytes);
            (Some(path), Some(hash), Some(bytes.len() as u64))
        }
        Err(_) => (None, None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell_spec(command: &str, timeout_secs: u64) -> JobSpec {
        let mut spec = JobSpec::compile("unused.c", "cc");
        spec.build_command = Some(command.to_string());
        spec.timeout_secs = timeout_secs;
        spec
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the test duration.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn test_successful_command_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let spec = shell_spec("echo hello", 10);
        match run_job(&spec, dir.path(), no_cancel()).await {
            ExecOutcome::Finished(result) => {
                assert!(result.success);
                assert_eq!(result.exit_code, 0);
                assert_eq!(result.stdout.trim(), "hello");
                assert!(result.duration_secs >= 0.0);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failing_command_reports_exit_code() {
        let dir = TempDir::new().unwrap();
        let spec = shell_spec("echo oops >&2; exit 3", 10);
        match run_job(&spec, dir.path(), no_cancel()).await {
            ExecOutcome::Finished(result) => {
                assert!(!result.success);
                assert_eq!(result.exit_code, 3);
                assert_eq!(result.stderr.trim(), "oops");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_job() {
        let dir = TempDir::new().unwrap();
        let spec = shell_spec("sleep 30", 1);
        let started = Instant::now();
        match run_job(&spec, dir.path(), no_cancel()).await {
            ExecOutcome::Finished(result) => {
                assert!(!result.success);
                assert_eq!(result.stderr, JOB_TIMED_OUT_MESSAGE);
                assert!(started.elapsed() < Duration::from_secs(10));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_work() {
        let dir = TempDir::new().unwrap();
        let spec = shell_spec("sleep 30", 60);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let spec = spec.clone();
            let dir = dir.path().to_path_buf();
            async move { run_job(&spec, &dir, rx).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        match handle.await.unwrap() {
            ExecOutcome::Cancelled => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_working_directory_contract() {
        let dir = TempDir::new().unwrap();
        let spec = shell_spec("pwd", 10);
        match run_job(&spec, dir.path(), no_cancel()).await {
            ExecOutcome::Finished(result) => {
                let reported = PathBuf::from(result.stdout.trim());
                assert_eq!(
                    reported.canonicalize().unwrap(),
                    dir.path().canonicalize().unwrap()
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spec_without_command_or_compiler_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let mut spec = JobSpec::compile("a.c", "cc");
        spec.compiler = None;
        spec.build_command = None;
        match run_job(&spec, dir.path(), no_cancel()).await {
            ExecOutcome::Finished(result) => {
                assert!(!result.success);
                assert!(result.stderr.contains("neither"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_output_described_after_success() {
        let dir = TempDir::new().unwrap();
        let mut spec = shell_spec("printf OBJ > out.o", 10);
        spec.output_file = Some(PathBuf::from("out.o"));
        match run_job(&spec, dir.path(), no_cancel()).await {
            ExecOutcome::Finished(result) => {
                assert!(result.success);
                assert!(result.output_file.is_some());
                assert_eq!(result.output_size, Some(3));
                assert_eq!(
                    result.output_hash.as_deref(),
                    Some(cyxmake_cache::hash_bytes(b"OBJ").as_str())
                );
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
