//! External tool invocation: pg_dump, pg_restore, psql, and user-supplied
//! migration commands.
//!
//! Subprocesses get `PGURI` in the environment, run under a deadline, and
//! have stderr captured to a rotating tail that is surfaced on failure.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// How much trailing stderr to keep for error reports.
const STDERR_TAIL: usize = 64 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            timeout: Duration::from_secs(600),
        }
    }

    /// A user-supplied command line, run through the shell.
    pub fn shell(command_line: &str) -> Self {
        let mut cmd = Self::new("sh");
        cmd.args = vec!["-c".to_string(), command_line.to_string()];
        cmd
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run to completion. Non-zero exit, timeout, and a missing binary all
    /// fail with the captured stderr tail attached.
    pub fn run(&self) -> Result<ToolOutput> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    anyhow::anyhow!(
                        "`{}` not found in PATH; install the PostgreSQL client tools",
                        self.program
                    )
                } else {
                    anyhow::anyhow!("spawning `{}`: {}", self.program, e)
                }
            })?;

        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        let stdout_reader = std::thread::spawn(move || read_tail(stdout, STDERR_TAIL));
        let stderr_reader = std::thread::spawn(move || read_tail(stderr, STDERR_TAIL));

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait().context("waiting for subprocess")? {
                Some(status) => break status,
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let tail = join_tail(stderr_reader);
                        bail!(
                            "`{}` timed out after {:?}\n{}",
                            self.describe(),
                            self.timeout,
                            tail
                        );
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        };

        let stdout = join_tail(stdout_reader);
        let stderr = join_tail(stderr_reader);

        if !status.success() {
            bail!(
                "`{}` failed with {}\n{}",
                self.describe(),
                status,
                stderr.trim_end()
            );
        }

        Ok(ToolOutput { stdout, stderr })
    }

    fn describe(&self) -> String {
        if self.program == "sh" && self.args.first().map(|a| a == "-c").unwrap_or(false) {
            self.args.get(1).cloned().unwrap_or_default()
        } else {
            std::iter::once(self.program.clone())
                .chain(self.args.iter().cloned())
                .collect::<Vec<_>>()
                .join(" ")
        }
    }
}

#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Read a pipe to EOF, keeping only the trailing `cap` bytes.
fn read_tail(mut pipe: impl Read, cap: usize) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 8192];
    while let Ok(n) = pipe.read(&mut buf) {
        if n == 0 {
            break;
        }
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > cap {
            let excess = tail.len() - cap;
            tail.drain(..excess);
        }
    }
    tail
}

fn join_tail(handle: std::thread::JoinHandle<Vec<u8>>) -> String {
    handle
        .join()
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
