//! External tool invocation.
//! Every lookup that shells out goes through a [`CommandRunner`], so the
//! parsing and fallback logic can be exercised against scripted output.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::{Result, ShimError};

/// A single external command invocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
    /// Run as this uid (POSIX only; ignored elsewhere).
    pub uid: Option<u32>,
    /// Kill the child once this elapses.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Runs `script` through `/bin/sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn uid(mut self, uid: Option<u32>) -> Self {
        self.uid = uid;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable form for logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Returns stdout when the command exited cleanly.
    pub fn checked_stdout(self, program: &str) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(ShimError::CommandFailed {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs external commands to completion.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Convenience for the common "program + args, capture stdout" case.
    fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run(&CommandSpec::new(program).args(args.iter().copied()))
    }
}

/// Runs commands on the host, optionally prefixing `PATH`.
#[derive(Clone, Debug, Default)]
pub struct SystemRunner {
    env_path: Option<String>,
}

impl SystemRunner {
    pub fn new(env_path: Option<String>) -> Self {
        Self { env_path }
    }

    fn merged_path(&self) -> Option<String> {
        let configured = self.env_path.as_ref()?;
        let merged = match std::env::var("PATH") {
            Ok(current) if !current.is_empty() => {
                format!("{configured}{}{current}", path_separator())
            }
            _ => configured.clone(),
        };
        Some(merged)
    }
}

fn path_separator() -> char {
    if cfg!(windows) { ';' } else { ':' }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running: {}", spec.display());

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(path) = self.merged_path() {
            debug!("Update PATH to: {path}");
            cmd.env("PATH", path);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        #[cfg(unix)]
        if let Some(uid) = spec.uid {
            use std::os::unix::process::CommandExt;
            cmd.uid(uid);
        }

        let mut child = cmd.spawn().map_err(|source| ShimError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Written alongside the readers so neither pipe can fill and stall the child.
        let writer = match (&spec.stdin, child.stdin.take()) {
            (Some(input), Some(stdin)) => Some(spawn_writer(stdin, input.clone(), &spec.program)),
            _ => None,
        };
        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let mut timed_out = false;
        let status = match spec.timeout {
            None => child.wait()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(status) = child.try_wait()? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        debug!("{} timed out after {:?}; killing", spec.program, timeout);
                        timed_out = true;
                        let _ = child.kill();
                        break child.wait()?;
                    }
                    thread::sleep(Duration::from_millis(50));
                }
            }
        };

        if let Some(writer) = writer {
            let _ = writer.join();
        }

        Ok(CommandOutput {
            code: status.code(),
            stdout: stdout.map(join_reader).unwrap_or_default(),
            stderr: stderr.map(join_reader).unwrap_or_default(),
            timed_out,
        })
    }
}

fn spawn_writer<W: Write + Send + 'static>(
    mut pipe: W,
    input: String,
    program: &str,
) -> thread::JoinHandle<()> {
    let program = program.to_string();
    thread::spawn(move || {
        if let Err(e) = pipe.write_all(input.as_bytes()) {
            warn!("Failed to write stdin of {program}: {e}");
        }
        // pipe drops here so the child sees EOF
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Locates a helper binary with `whereis`, the way the desktop helpers are
/// found on POSIX hosts. FreeBSD ports install outside `whereis`' search
/// path, so `/usr/local/bin` is checked as a last resort there.
pub fn find_path(runner: &dyn CommandRunner, app: &str) -> Option<String> {
    let output = runner.output("whereis", &[app]).ok()?;
    let found = parse_whereis(&output.stdout);
    if found.is_none() && cfg!(target_os = "freebsd") {
        let candidate = format!("/usr/local/bin/{app}");
        if std::path::Path::new(&candidate).exists() {
            return Some(candidate);
        }
    }
    found
}

/// `whereis` prints `name: /path/one /path/two` on Linux and a bare path on
/// macOS; either way the first path is the answer.
pub fn parse_whereis(output: &str) -> Option<String> {
    let line = output.lines().next()?.trim();
    let rest = match line.split_once(':') {
        Some((_, rest)) => rest,
        None => line,
    };
    rest.split_whitespace().next().map(str::to_string)
}
