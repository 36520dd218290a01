use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};

/// Captured result of one external command invocation. Only the exit status
/// is interpreted; stdout may be consumed as data (database dumps) and stderr
/// is kept for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Narrow capability seam for the external collaborators (mysqldump, mysql,
/// php). Tests substitute a scripted fake so no real subprocess runs.
pub trait CommandRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> Result<CommandOutput>;
}

/// Production runner backed by `std::process::Command`.
#[derive(Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[OsString]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to start command: {}", program.display()))?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run a command and fail with its captured stderr on a non-zero exit.
pub fn run_checked(
    runner: &dyn CommandRunner,
    program: &Path,
    args: &[OsString],
    context_message: &str,
) -> Result<CommandOutput> {
    let output = runner.run(program, args)?;
    if output.success() {
        return Ok(output);
    }
    Err(anyhow!(
        "{context_message}: {} exited with status {} stderr='{}'",
        program.display(),
        output.status,
        output.stderr.trim()
    ))
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::path::Path;

    use super::{run_checked, CommandRunner, SystemRunner};

    #[test]
    fn system_runner_captures_exit_status_and_output() {
        let runner = SystemRunner;
        let args = vec![
            OsString::from("-c"),
            OsString::from("echo out; echo err >&2; exit 3"),
        ];
        let output = runner.run(Path::new("/bin/sh"), &args).expect("must run");
        assert_eq!(output.status, 3);
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn run_checked_reports_stderr_on_failure() {
        let runner = SystemRunner;
        let args = vec![OsString::from("-c"), OsString::from("echo boom >&2; exit 1")];
        let err = run_checked(&runner, Path::new("/bin/sh"), &args, "schema upgrade")
            .expect_err("non-zero exit must fail");
        let text = err.to_string();
        assert!(text.contains("schema upgrade"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn run_checked_passes_on_success() {
        let runner = SystemRunner;
        let args = vec![OsString::from("-c"), OsString::from("exit 0")];
        run_checked(&runner, Path::new("/bin/sh"), &args, "noop").expect("zero exit must pass");
    }
}
