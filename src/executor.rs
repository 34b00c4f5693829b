// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! Runs the external Kubespray playbooks against a rendered inventory.
//!
//! The playbook runs as a child process. Its output is streamed line by line to an observer and
//! kept in the ExecutionRecord for the run's audit trail.

use std::{
    fmt, io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use {
    chrono::{DateTime, Local},
    log::{debug, info, warn},
    nix::{sys::signal, unistd::Pid},
    tokio::{
        io::{AsyncBufReadExt, BufReader},
        process::{Child, Command},
    },
    tokio_util::sync::CancellationToken,
};

use crate::{config::PlaybookOptions, error::ExecutionError, inventory::InventoryDocument};

/// Output fragments that Ansible prints when the cached facts for a host no longer describe it.
pub const DEFAULT_STALE_CACHE_MARKERS: [&str; 3] = [
    "'ansible_default_ipv4' is undefined",
    "'ansible_facts' is undefined",
    "Unable to load fact cache",
];

/// How long a terminated playbook gets to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Which procedure to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Deploy,
    Reset,
}

impl Mode {
    pub fn playbook(&self) -> &'static str {
        match self {
            Mode::Deploy => "cluster.yml",
            Mode::Reset => "reset.yml",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Mode::Deploy => "deploy",
                Mode::Reset => "reset",
            }
        )
    }
}

/// Everything needed to launch one playbook run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Playbook identifier, relative to the playbook directory.
    pub playbook: String,
    pub inventory: PathBuf,
    pub elevate: bool,
    pub become_user: Option<String>,
    pub extra_vars: Vec<(String, String)>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-i".to_string(), self.inventory.display().to_string()];
        if self.elevate {
            args.push("--become".to_string());
        }
        if let Some(user) = &self.become_user {
            args.push("--become-user".to_string());
            args.push(user.clone());
        }
        for (k, v) in &self.extra_vars {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(self.playbook.clone());
        args
    }
}

/// How a playbook process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exited(i32),
    Aborted,
}

/// Launches playbook processes.
#[allow(async_fn_in_trait)]
pub trait ProcessRunner {
    /// Run `invocation` to completion, passing each output line to `output`. When `cancel` fires,
    /// the process is terminated and `Completion::Aborted` is returned.
    async fn run(
        &self,
        invocation: &Invocation,
        output: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> Result<Completion, ExecutionError>;

    /// A printable command line, used to identify the run in its record.
    fn command_line(&self, invocation: &Invocation) -> String;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Succeeded,
    Failed { exit_code: i32 },
    Aborted,
    /// The process could not be launched, or its output could not be read.
    LaunchFailed(String),
}

/// The result of one playbook process.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub mode: Mode,
    pub command: String,
    /// 1 for the first attempt, 2 for the retry after a stale cache.
    pub attempt: u32,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    pub status: ExecutionStatus,
    pub output: Vec<String>,
}

/// Every attempt made for one `execute()` call, and how it ended overall.
#[derive(Debug)]
pub struct Execution {
    /// Oldest first. Holds two records when a stale cache forced a retry.
    pub attempts: Vec<ExecutionRecord>,
    pub result: Result<(), ExecutionError>,
}

impl Execution {
    /// The record of the last attempt, if any process was started.
    pub fn record(&self) -> Option<&ExecutionRecord> {
        self.attempts.last()
    }
}

/// Where and how the playbooks are run.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub inventory_path: PathBuf,
    pub fact_cache_dir: PathBuf,
    pub elevate: bool,
    pub become_user: Option<String>,
    pub stale_cache_markers: Vec<String>,
}

impl Procedure {
    pub fn from_options(options: &PlaybookOptions) -> Self {
        let mut stale_cache_markers: Vec<String> = DEFAULT_STALE_CACHE_MARKERS
            .iter()
            .map(|m| m.to_string())
            .collect();
        stale_cache_markers.extend(options.stale_cache_markers.iter().cloned());
        Self {
            inventory_path: options
                .inventory_path
                .clone()
                .unwrap_or_else(crate::default_inventory_path)
                .into(),
            fact_cache_dir: options
                .fact_cache_dir
                .clone()
                .unwrap_or_else(crate::default_fact_cache_dir)
                .into(),
            elevate: options.elevate,
            become_user: options.become_user.clone(),
            stale_cache_markers,
        }
    }

    pub fn invocation(&self, mode: Mode) -> Invocation {
        let extra_vars = match mode {
            Mode::Deploy => vec![],
            Mode::Reset => vec![("reset_confirmation".to_string(), "yes".to_string())],
        };
        Invocation {
            playbook: mode.playbook().to_string(),
            inventory: self.inventory_path.clone(),
            elevate: self.elevate,
            become_user: self.become_user.clone(),
            extra_vars,
            env: vec![
                ("ANSIBLE_CACHE_PLUGIN".to_string(), "jsonfile".to_string()),
                (
                    "ANSIBLE_CACHE_PLUGIN_CONNECTION".to_string(),
                    self.fact_cache_dir.display().to_string(),
                ),
            ],
        }
    }

    /// The file locked for the length of a run, so that two processes cannot drive the same
    /// inventory at once.
    pub fn lock_path(&self) -> PathBuf {
        let mut path = self.inventory_path.clone().into_os_string();
        path.push(".lock");
        path.into()
    }

    fn is_stale_cache(&self, output: &[String]) -> bool {
        output.iter().any(|line| {
            self.stale_cache_markers
                .iter()
                .any(|marker| line.contains(marker.as_str()))
        })
    }
}

pub struct Executor<R> {
    runner: R,
    procedure: Procedure,
}

impl<R: ProcessRunner> Executor<R> {
    pub fn new(runner: R, procedure: Procedure) -> Self {
        Self { runner, procedure }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn procedure(&self) -> &Procedure {
        &self.procedure
    }

    /// Write `inventory` and run the playbook for `mode` against it.
    ///
    /// A failure caused by a stale fact cache is handled here: the cache is cleared and the
    /// playbook is run exactly once more. Callers never touch the cache themselves.
    pub async fn execute(
        &self,
        inventory: &InventoryDocument,
        mode: Mode,
        observer: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> Execution {
        let mut attempts = Vec::new();

        if let Err(e) = write_inventory(&self.procedure.inventory_path, inventory).await {
            return Execution {
                attempts,
                result: Err(e.into()),
            };
        }

        let (record, result) = self.execute_once(mode, 1, observer, cancel).await;
        attempts.push(record);

        let result = match result {
            Err(e) if e.is_stale_cache() => {
                warn!(
                    "{mode} failed on a stale fact cache; clearing '{}' and retrying once",
                    self.procedure.fact_cache_dir.display()
                );
                if let Err(e) = clear_dir(&self.procedure.fact_cache_dir).await {
                    return Execution {
                        attempts,
                        result: Err(e.into()),
                    };
                }
                if cancel.is_cancelled() {
                    return Execution {
                        attempts,
                        result: Err(ExecutionError::Aborted),
                    };
                }
                let (record, result) = self.execute_once(mode, 2, observer, cancel).await;
                attempts.push(record);
                result
            }
            result => result,
        };

        Execution { attempts, result }
    }

    async fn execute_once(
        &self,
        mode: Mode,
        attempt: u32,
        observer: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> (ExecutionRecord, Result<(), ExecutionError>) {
        let invocation = self.procedure.invocation(mode);
        let command = self.runner.command_line(&invocation);
        info!("running {mode} (attempt {attempt}): {command}");

        let started = Local::now();
        let mut output = Vec::new();
        let completion = self
            .runner
            .run(
                &invocation,
                &mut |line: &str| {
                    observer(line);
                    output.push(line.to_string());
                },
                cancel,
            )
            .await;

        let (status, result) = match completion {
            Ok(Completion::Exited(0)) => (ExecutionStatus::Succeeded, Ok(())),
            Ok(Completion::Exited(exit_code)) => {
                let error = if self.procedure.is_stale_cache(&output) {
                    ExecutionError::StaleCache { exit_code }
                } else {
                    ExecutionError::Failed { exit_code }
                };
                (ExecutionStatus::Failed { exit_code }, Err(error))
            }
            Ok(Completion::Aborted) => (ExecutionStatus::Aborted, Err(ExecutionError::Aborted)),
            Err(e) => (ExecutionStatus::LaunchFailed(e.to_string()), Err(e)),
        };
        debug!("{mode} attempt {attempt} finished: {status:?}");

        let record = ExecutionRecord {
            mode,
            command,
            attempt,
            started,
            finished: Local::now(),
            status,
            output,
        };
        (record, result)
    }
}

/// Write the inventory to `path`, leaving the file untouched if it already has this content.
pub async fn write_inventory(path: &Path, inventory: &InventoryDocument) -> io::Result<()> {
    match tokio::fs::read(path).await {
        Ok(existing) if existing == inventory.as_bytes() => {
            debug!("inventory '{}' is up to date", path.display());
            return Ok(());
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    info!("writing inventory '{}'", path.display());
    tokio::fs::write(path, inventory.as_bytes()).await
}

async fn clear_dir(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Runs playbooks with `ansible-playbook` (or a compatible program) from the playbook directory.
#[derive(Debug, Clone)]
pub struct AnsibleRunner {
    program: String,
    dir: PathBuf,
}

impl AnsibleRunner {
    pub fn new(options: &PlaybookOptions) -> Self {
        Self {
            program: options
                .program
                .clone()
                .unwrap_or_else(|| "ansible-playbook".to_string()),
            dir: options
                .dir
                .clone()
                .unwrap_or_else(crate::default_playbook_dir)
                .into(),
        }
    }
}

impl ProcessRunner for AnsibleRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        output: &mut dyn FnMut(&str),
        cancel: &CancellationToken,
    ) -> Result<Completion, ExecutionError> {
        let mut child = Command::new(&self.program)
            .args(invocation.args())
            .current_dir(&self.dir)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let not_captured = || ExecutionError::Io(io::Error::other("output was not captured"));
        let mut stdout = BufReader::new(child.stdout.take().ok_or_else(not_captured)?);
        let mut stderr = BufReader::new(child.stderr.take().ok_or_else(not_captured)?);
        let (mut stdout_buf, mut stderr_buf) = (Vec::new(), Vec::new());
        let (mut stdout_open, mut stderr_open) = (true, true);

        // Lines are read as bytes: playbook output is not always valid UTF-8.
        while stdout_open || stderr_open {
            tokio::select! {
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    return Ok(Completion::Aborted);
                }
                n = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                    stdout_open = n? > 0;
                    emit_line(&mut stdout_buf, output);
                }
                n = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                    stderr_open = n? > 0;
                    emit_line(&mut stderr_buf, output);
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Ok(Completion::Aborted);
            }
            status = child.wait() => status?,
        };

        // A process killed by a signal has no exit code; report it the way a shell would.
        let code = status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(-1);
        Ok(Completion::Exited(code))
    }

    fn command_line(&self, invocation: &Invocation) -> String {
        let mut line = vec![self.program.clone()];
        line.extend(invocation.args());
        line.join(" ")
    }
}

/// Pass a line read from the playbook to `output`, without its line ending, and empty `buf` for
/// the next one. Bytes that are not valid UTF-8 are replaced with U+FFFD.
fn emit_line(buf: &mut Vec<u8>, output: &mut dyn FnMut(&str)) {
    if buf.is_empty() {
        return;
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    output(&String::from_utf8_lossy(buf));
    buf.clear();
}

/// Ask the child to stop with SIGTERM, then kill it if it has not exited within the grace period.
async fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    warn!("terminating playbook process {pid}");
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGTERM) {
        warn!("could not send SIGTERM to {pid}: {e}");
    }
    if tokio::time::timeout(TERMINATE_GRACE, child.wait())
        .await
        .is_err()
    {
        warn!("playbook process {pid} did not exit, killing it");
        if let Err(e) = child.kill().await {
            warn!("could not kill {pid}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn procedure() -> Procedure {
        Procedure::from_options(&PlaybookOptions {
            inventory_path: Some("/tmp/inv/hosts.yaml".to_string()),
            fact_cache_dir: Some("/tmp/facts".to_string()),
            elevate: true,
            become_user: Some("root".to_string()),
            ..PlaybookOptions::default()
        })
    }

    #[test]
    fn deploy_invocation() {
        let invocation = procedure().invocation(Mode::Deploy);
        assert_eq!(
            invocation.args(),
            vec![
                "-i",
                "/tmp/inv/hosts.yaml",
                "--become",
                "--become-user",
                "root",
                "cluster.yml"
            ]
        );
        assert!(invocation
            .env
            .contains(&("ANSIBLE_CACHE_PLUGIN_CONNECTION".to_string(), "/tmp/facts".to_string())));
    }

    #[test]
    fn reset_invocation_confirms() {
        let args = procedure().invocation(Mode::Reset).args();
        assert_eq!(&args[args.len() - 3..], ["-e", "reset_confirmation=yes", "reset.yml"]);
    }

    #[test]
    fn stale_cache_markers() {
        let mut options = PlaybookOptions::default();
        options.stale_cache_markers = vec!["custom marker".to_string()];
        let procedure = Procedure::from_options(&options);

        assert!(procedure.is_stale_cache(&[
            "TASK [kubernetes/preinstall : Stop if ip var does not match local ips]".to_string(),
            "fatal: [knode01]: FAILED! => {\"msg\": \"'ansible_default_ipv4' is undefined\"}"
                .to_string(),
        ]));
        assert!(procedure.is_stale_cache(&["a custom marker here".to_string()]));
        assert!(!procedure.is_stale_cache(&["fatal: [knode01]: UNREACHABLE!".to_string()]));
    }

    #[test]
    fn line_endings_are_stripped_and_bad_bytes_replaced() {
        let mut lines = Vec::new();
        let mut collect = |line: &str| lines.push(line.to_string());

        let mut buf = b"caf\xe9\r\n".to_vec();
        emit_line(&mut buf, &mut collect);
        assert!(buf.is_empty());

        let mut buf = b"no newline at eof".to_vec();
        emit_line(&mut buf, &mut collect);
        emit_line(&mut buf, &mut collect);

        assert_eq!(lines, vec!["caf\u{FFFD}", "no newline at eof"]);
    }

    #[test]
    fn lock_sits_next_to_the_inventory() {
        assert_eq!(
            procedure().lock_path(),
            PathBuf::from("/tmp/inv/hosts.yaml.lock")
        );
    }

    #[tokio::test]
    async fn inventory_is_only_rewritten_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/hosts.yaml");
        let doc = crate::test_env::three_node_inventory();

        write_inventory(&path, &doc).await.unwrap();
        let first = std::fs::metadata(&path).unwrap().modified().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        write_inventory(&path, &doc).await.unwrap();
        let second = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&path).unwrap(), doc.as_bytes());
    }
}
