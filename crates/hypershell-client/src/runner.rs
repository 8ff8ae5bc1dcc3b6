use std::process::Stdio;

use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, warn};

use hypershell_protocol::TaskDescriptor;
use hypershell_template::{build_task_env, expand, Bindings};

use crate::error::ClientError;

/// Expand the client's own template against the task's raw args, spawn it
/// in the platform shell with stdin from `/dev/null`, and build the
/// RESULT payload (spec section 4.5).
pub async fn run_task(
    descriptor: &TaskDescriptor,
    template: &str,
    host: &str,
    attempt: u32,
    capture: bool,
) -> Result<hypershell_protocol::TaskResult, ClientError> {
    let bindings = Bindings { task_id: descriptor.task_id, attempt, host: Some(host.to_string()) };
    let command = expand(template, &descriptor.command, &bindings).await?;

    let env = build_task_env(std::env::vars(), descriptor.task_id, &descriptor.command, attempt, host);

    let shell = if cfg!(windows) { "cmd" } else { "/bin/sh" };
    let flag = if cfg!(windows) { "/C" } else { "-c" };

    let mut cmd = Command::new(shell);
    cmd.arg(flag).arg(&command).envs(env).stdin(Stdio::null()).kill_on_drop(true);
    if capture {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    }

    let start_time = Utc::now();
    debug!(task_id = descriptor.task_id, %command, "spawning task");
    let output = cmd.output().await?;
    let complete_time = Utc::now();

    let exit_status = output.status.code().unwrap_or(-1);
    if exit_status != 0 {
        warn!(task_id = descriptor.task_id, exit_status, "task exited non-zero");
    }

    Ok(hypershell_protocol::TaskResult {
        task_id: descriptor.task_id,
        exit_status,
        stdout: capture.then_some(output.stdout),
        stderr: capture.then_some(output.stderr),
        start_time,
        complete_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc as ChronoUtc;

    fn descriptor(command: &str) -> TaskDescriptor {
        TaskDescriptor {
            task_id: 1,
            command: command.to_string(),
            attempt: 1,
            env_deltas: Vec::new(),
            lease_deadline: ChronoUtc::now(),
        }
    }

    #[tokio::test]
    async fn runs_successful_command() {
        let result = run_task(&descriptor("0"), "true", "host-a", 1, true).await.unwrap();
        assert_eq!(result.exit_status, 0);
    }

    #[tokio::test]
    async fn captures_stdout_when_requested() {
        let result = run_task(&descriptor("hi"), "echo {}", "host-a", 1, true).await.unwrap();
        assert_eq!(result.exit_status, 0);
        assert_eq!(String::from_utf8_lossy(&result.stdout.unwrap()), "hi\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_recorded_not_errored() {
        let result = run_task(&descriptor("x"), "false", "host-a", 1, true).await.unwrap();
        assert_eq!(result.exit_status, 1);
    }
}
