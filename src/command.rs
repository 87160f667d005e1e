//! External command execution.
//!
//! All external tools (`blkid`, `arkdep`, `mount`, `umount`) are invoked
//! through the `CommandRunner` trait so that the remount sequence and the
//! pipeline can be driven against a recording runner in dry-run mode and in
//! tests.
//!
//! `SystemRunner` spawns every child through `in_new_process_group()` and
//! registers it with the global `ChildRegistry`, so nothing keeps running if
//! the installer dies.

use crate::error::{DeployError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use log::{debug, error, info};
use std::fmt;
use std::io::{BufRead, BufReader};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long to wait for the output reader to hit EOF once the child is gone
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// An external command: program, arguments and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable on top of the inherited environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .in_new_process_group();
        command
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Receiver of progress messages from long-running commands
pub trait ProgressSink: Send + Sync {
    fn progress(&self, message: &str);
}

/// Default sink: progress goes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn progress(&self, message: &str) {
        info!("{}", message);
    }
}

/// Executes external commands.
pub trait CommandRunner: Send + Sync {
    /// Run to completion; non-zero exit is an error carrying the exit status.
    fn run(&self, cmd: &Cmd) -> Result<()>;

    /// Run to completion and return trimmed stdout.
    fn output(&self, cmd: &Cmd) -> Result<String>;

    /// Run a long command, emitting a progress message to `sink` every
    /// `interval` until the process exits. Blocks until exit.
    fn run_with_progress(
        &self,
        cmd: &Cmd,
        interval: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<()>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<()> {
        info!("Running: {}", cmd);
        let spawn_err = |source| DeployError::CommandSpawn {
            command: cmd.to_string(),
            source,
        };

        let mut child = cmd.to_command().spawn().map_err(spawn_err)?;
        let pid = child.id();
        ChildRegistry::track(pid);
        let status = child.wait();
        ChildRegistry::untrack(pid);
        let status = status.map_err(spawn_err)?;

        if status.success() {
            debug!("Command completed successfully: {}", cmd);
            Ok(())
        } else {
            let code = exit_code(&status);
            error!("Command failed: {} (exit status {})", cmd, code);
            Err(DeployError::CommandFailed {
                command: cmd.to_string(),
                code,
            })
        }
    }

    fn output(&self, cmd: &Cmd) -> Result<String> {
        debug!("Capturing output of: {}", cmd);
        let spawn_err = |source| DeployError::CommandSpawn {
            command: cmd.to_string(),
            source,
        };

        let child = cmd
            .to_command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;
        let pid = child.id();
        ChildRegistry::track(pid);
        let output = child.wait_with_output();
        ChildRegistry::untrack(pid);
        let output = output.map_err(spawn_err)?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                debug!("{} stderr: {}", cmd.program(), stderr.trim());
            }
            Err(DeployError::CommandFailed {
                command: cmd.to_string(),
                code: exit_code(&output.status),
            })
        }
    }

    fn run_with_progress(
        &self,
        cmd: &Cmd,
        interval: Duration,
        sink: &dyn ProgressSink,
    ) -> Result<()> {
        info!("Running with progress: {}", cmd);
        let spawn_err = |source| DeployError::CommandSpawn {
            command: cmd.to_string(),
            source,
        };

        // stdout and stderr share one pipe so the last line reflects both.
        let (reader, writer) = std::io::pipe().map_err(spawn_err)?;
        let mut child = {
            let mut command = cmd.to_command();
            command
                .stdout(writer.try_clone().map_err(spawn_err)?)
                .stderr(writer);
            // Dropping `command` here closes our copies of the write end,
            // otherwise the reader would never see EOF.
            command.spawn().map_err(spawn_err)?
        };
        let pid = child.id();
        ChildRegistry::track(pid);

        let last_line = Arc::new(Mutex::new(String::new()));
        let output_reader = spawn_output_reader(reader, Arc::clone(&last_line));

        let started = Instant::now();
        let (exited_tx, exited_rx) = mpsc::channel::<()>();
        let shared_line = &last_line;
        let status = std::thread::scope(|scope| {
            scope.spawn(move || {
                loop {
                    match exited_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let elapsed = started.elapsed().as_secs();
                            let line = read_last_line(shared_line);
                            if line.is_empty() {
                                sink.progress(&format!("[{}s] Running: {}", elapsed, cmd));
                            } else {
                                sink.progress(&format!("[{}s] {}", elapsed, line));
                            }
                        }
                        // Sender dropped: the child has been reaped.
                        _ => break,
                    }
                }
            });

            let status = child.wait();
            drop(exited_tx);
            status
        });
        ChildRegistry::untrack(pid);
        let status = status.map_err(spawn_err)?;

        drain_reader(output_reader);
        let last_line = read_last_line(&last_line);

        if status.success() {
            debug!("Command completed successfully: {}", cmd);
            Ok(())
        } else {
            let code = exit_code(&status);
            error!(
                "Command failed with code {}. Last output: {}",
                code, last_line
            );
            Err(DeployError::MonitoredCommandFailed {
                command: cmd.to_string(),
                code,
                last_line,
            })
        }
    }
}

/// Keep the most recent non-empty line of `reader` in `last_line`.
///
/// The thread ends at EOF, i.e. once every holder of the write end (the child
/// and anything it forked) has exited.
fn spawn_output_reader(
    reader: std::io::PipeReader,
    last_line: Arc<Mutex<String>>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        for chunk in BufReader::new(reader).split(b'\n').map_while(|r| r.ok()) {
            let line = String::from_utf8_lossy(&chunk);
            let line = line.trim();
            if !line.is_empty() {
                let mut guard = last_line.lock().unwrap_or_else(|p| p.into_inner());
                *guard = line.to_string();
            }
        }
    })
}

fn read_last_line(last_line: &Mutex<String>) -> String {
    last_line
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .clone()
}

/// Give the reader a moment to consume output still buffered in the pipe.
/// A grandchild holding the pipe open must not block us, so after the
/// timeout the reader is left detached.
fn drain_reader(handle: JoinHandle<()>) {
    let deadline = Instant::now() + READER_DRAIN_TIMEOUT;
    while !handle.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        debug!("Output reader still attached to a live pipe, detaching");
    }
}

/// Dry-run mode: logs and records every command, executes nothing.
#[derive(Debug, Default)]
pub struct DryRunRunner {
    recorded: Mutex<Vec<String>>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands that would have been executed, in order
    pub fn commands(&self) -> Vec<String> {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn record(&self, cmd: &Cmd) {
        info!("[DRY RUN] Skipped: {}", cmd);
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(cmd.to_string());
    }
}

impl CommandRunner for DryRunRunner {
    fn run(&self, cmd: &Cmd) -> Result<()> {
        self.record(cmd);
        Ok(())
    }

    fn output(&self, cmd: &Cmd) -> Result<String> {
        self.record(cmd);
        Ok(String::new())
    }

    fn run_with_progress(
        &self,
        cmd: &Cmd,
        _interval: Duration,
        _sink: &dyn ProgressSink,
    ) -> Result<()> {
        self.record(cmd);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        messages: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn messages(&self) -> Vec<String> {
            self.messages.lock().unwrap().clone()
        }
    }

    impl ProgressSink for RecordingSink {
        fn progress(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    fn sh(script: &str) -> Cmd {
        Cmd::new("sh").args(["-c", script])
    }

    #[test]
    fn test_cmd_display() {
        let cmd = Cmd::new("mount")
            .args(["-o", "subvol=/arkdep/shared/home"])
            .arg("/dev/sda2")
            .env("ARKDEP_ROOT", "/mnt");
        assert_eq!(cmd.to_string(), "mount -o subvol=/arkdep/shared/home /dev/sda2");
        assert_eq!(cmd.get_env(), &[("ARKDEP_ROOT".to_string(), "/mnt".to_string())]);
    }

    #[test]
    fn test_run_success_and_failure() {
        assert!(SystemRunner.run(&sh("exit 0")).is_ok());

        match SystemRunner.run(&sh("exit 7")) {
            Err(DeployError::CommandFailed { command, code }) => {
                assert_eq!(command, "sh -c exit 7");
                assert_eq!(code, 7);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_run_missing_program_is_spawn_error() {
        let result = SystemRunner.run(&Cmd::new("/nonexistent/arkdep"));
        assert!(matches!(result, Err(DeployError::CommandSpawn { .. })));
    }

    #[test]
    fn test_run_passes_environment() {
        let cmd = sh("test \"$ARKDEP_NO_BOOTCTL\" = 1").env("ARKDEP_NO_BOOTCTL", "1");
        assert!(SystemRunner.run(&cmd).is_ok());
    }

    #[test]
    fn test_output_is_trimmed() {
        let out = SystemRunner.output(&sh("echo '  4f1c-uuid  '")).unwrap();
        assert_eq!(out, "4f1c-uuid");
    }

    #[test]
    fn test_progress_emitted_while_running_and_stops_after_exit() {
        let sink = RecordingSink::default();
        let result = SystemRunner.run_with_progress(
            &sh("echo fetching image; sleep 1"),
            Duration::from_millis(100),
            &sink,
        );
        assert!(result.is_ok());

        let at_exit = sink.messages();
        assert!(!at_exit.is_empty(), "expected progress before exit");
        assert!(at_exit.iter().any(|m| m.ends_with("fetching image")));

        std::thread::sleep(Duration::from_millis(400));
        assert_eq!(sink.messages().len(), at_exit.len(), "no messages after exit");
    }

    #[test]
    fn test_progress_names_command_before_any_output() {
        let sink = RecordingSink::default();
        SystemRunner
            .run_with_progress(&sh("sleep 0.5"), Duration::from_millis(100), &sink)
            .unwrap();
        let messages = sink.messages();
        assert!(messages.first().is_some_and(|m| m.contains("Running: sh -c sleep 0.5")));
    }

    #[test]
    fn test_progress_failure_reports_code_and_last_line() {
        let sink = RecordingSink::default();
        let result = SystemRunner.run_with_progress(
            &sh("echo step one; echo 'no space left' >&2; exit 4"),
            Duration::from_secs(1),
            &sink,
        );
        match result {
            Err(DeployError::MonitoredCommandFailed { code, last_line, .. }) => {
                assert_eq!(code, 4);
                assert_eq!(last_line, "no space left");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_dry_run_records_without_executing() {
        let runner = DryRunRunner::new();
        runner.run(&Cmd::new("umount").arg("/mnt/boot")).unwrap();
        runner
            .run_with_progress(&Cmd::new("arkdep").arg("deploy"), Duration::from_secs(1), &LogSink)
            .unwrap();
        assert_eq!(runner.output(&Cmd::new("blkid")).unwrap(), "");
        assert_eq!(
            runner.commands(),
            vec!["umount /mnt/boot", "arkdep deploy", "blkid"]
        );
    }
}
