//! Sandboxed process runner
//!
//! Runs a whole child agent process inside a process-level sandbox:
//! - the session directory is bound read-write at `/session`
//! - the skills library (`/skills`) and application code (`/app`) read-only
//! - host system directories read-only
//! - PID/IPC/UTS namespaces isolated
//!
//! Run parameters travel as one JSON line in [`SANDBOX_PARAMS_ENV`], set on
//! the spawned process rather than on its argv. The child inherits an
//! otherwise empty environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::{GuardError, GuardResult};

use super::command::{build_sandbox_command, ensure_mount_sources};
use super::config::{
    EnvPolicy, MountMode, Namespaces, SandboxConfig, SandboxMount, DEFAULT_SANDBOX_PATH,
    SYSTEM_RO_PATHS,
};
use super::process_group::ProcessGroupGuard;

/// Environment variable carrying the serialized run parameters
pub const SANDBOX_PARAMS_ENV: &str = "SHADOW_SANDBOX_PARAMS";

/// Exit code reported when a run hits its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// In-sandbox mount points
pub const SESSION_MOUNT: &str = "/session";
pub const SKILLS_MOUNT: &str = "/skills";
pub const APP_MOUNT: &str = "/app";

/// Working directory of the child, inside the sandbox
pub const SANDBOX_WORKDIR: &str = "/session/workspace";

/// Result artifact the child leaves in its workspace
pub const RESULT_ARTIFACT: &str = "result.json";

/// Default overall run timeout (1 hour)
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Time allowed for stream readers to finish after the process is gone
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Bytes of each output stream kept in a [`ProcessRunResult`] (the tail)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Parameters consumed by the child agent's entry point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxedRunParams {
    pub session_id: String,
    pub task: String,
    pub model: String,
    pub max_turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    #[serde(default)]
    pub fork_session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub enable_skills: bool,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

fn default_true() -> bool {
    true
}

fn default_role() -> String {
    "user".to_string()
}

fn default_output_format() -> String {
    "json".to_string()
}

impl SandboxedRunParams {
    pub fn new(
        session_id: impl Into<String>,
        task: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            task: task.into(),
            model: model.into(),
            max_turns: 50,
            system_prompt: None,
            resume_id: None,
            fork_session: false,
            timeout_seconds: None,
            enable_skills: true,
            role: default_role(),
            output_format: default_output_format(),
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_resume(mut self, resume_id: impl Into<String>, fork: bool) -> Self {
        self.resume_id = Some(resume_id.into());
        self.fork_session = fork;
        self
    }

    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Single-line JSON for the params environment variable
    pub fn to_env_value(&self) -> GuardResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_env_value(value: &str) -> GuardResult<Self> {
        Ok(serde_json::from_str(value)?)
    }

    /// Read the parameters from the current process environment (child side)
    pub fn from_env() -> GuardResult<Self> {
        let value = std::env::var(SANDBOX_PARAMS_ENV).map_err(|_| {
            GuardError::InvalidSession(format!("{} is not set", SANDBOX_PARAMS_ENV))
        })?;
        Self::from_env_value(&value)
    }
}

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Callback receiving each output line as it arrives
pub type LineCallback = Arc<dyn Fn(StreamKind, &str) + Send + Sync>;

/// How the runner launches the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    Sandboxed,
    /// Developer-only: the child runs directly on the host
    UnsandboxedDebug,
}

/// Outcome of one sandboxed run
#[derive(Debug, Clone)]
pub struct ProcessRunResult {
    pub run_id: Uuid,
    /// Last bytes of stdout, up to the runner's output cap
    pub stdout: String,
    /// Last bytes of stderr, up to the runner's output cap
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration: Duration,
    /// Raw contents of the result artifact, if the child wrote one
    pub artifact: Option<String>,
    /// Launch failure, if the child never started
    pub error: Option<String>,
}

impl ProcessRunResult {
    fn failure(run_id: Uuid, error: &GuardError, started: Instant) -> Self {
        Self {
            run_id,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            timed_out: false,
            duration: started.elapsed(),
            artifact: None,
            error: Some(error.to_string()),
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none() && !self.timed_out && self.exit_code == 0
    }

    /// Parse the result artifact as JSON
    pub fn artifact_json(&self) -> GuardResult<Option<Value>> {
        match &self.artifact {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}

/// Launches and supervises sandboxed agent processes
#[derive(Debug, Clone)]
pub struct SandboxedProcessRunner {
    session_dir: PathBuf,
    skills_dir: PathBuf,
    app_dir: PathBuf,
    /// Command executed inside the sandbox
    entry_command: Vec<String>,
    sandbox_tool: Option<PathBuf>,
    mode: RunnerMode,
    default_timeout: Duration,
    max_output_bytes: usize,
}

impl SandboxedProcessRunner {
    pub fn new(
        session_dir: impl Into<PathBuf>,
        skills_dir: impl Into<PathBuf>,
        app_dir: impl Into<PathBuf>,
        entry_command: Vec<String>,
    ) -> Self {
        Self {
            session_dir: session_dir.into(),
            skills_dir: skills_dir.into(),
            app_dir: app_dir.into(),
            entry_command,
            sandbox_tool: None,
            mode: RunnerMode::Sandboxed,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Use an explicit sandbox tool binary instead of searching `PATH`
    pub fn with_sandbox_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.sandbox_tool = Some(path.into());
        self
    }

    pub fn with_mode(mut self, mode: RunnerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Cap on the captured bytes of each stream; older output is dropped.
    /// The line callback still sees every line.
    pub fn with_max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }

    pub fn mode(&self) -> RunnerMode {
        self.mode
    }

    /// Host path of the result artifact
    pub fn artifact_path(&self) -> PathBuf {
        self.session_dir.join("workspace").join(RESULT_ARTIFACT)
    }

    /// Locate the sandbox tool binary
    pub fn locate_sandbox_tool(&self) -> GuardResult<PathBuf> {
        match &self.sandbox_tool {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(GuardError::SandboxToolUnavailable(format!(
                "{} does not exist",
                path.display()
            ))),
            None => which::which("bwrap").map_err(|e| {
                GuardError::SandboxToolUnavailable(format!("bwrap not found on PATH: {}", e))
            }),
        }
    }

    /// Sandbox layout for a run
    pub fn sandbox_config(&self, tool: &Path) -> SandboxConfig {
        let system = SYSTEM_RO_PATHS
            .iter()
            .filter(|dir| Path::new(dir).exists())
            .map(|dir| SandboxMount::same_path(*dir, MountMode::Ro));

        SandboxConfig::new()
            .with_tool_path(tool)
            .with_namespaces(Namespaces::all())
            .with_network_sandboxing(true)
            // The child gets its environment from the spawned process
            .with_env(EnvPolicy {
                clear_env: false,
                ..EnvPolicy::default()
            })
            .with_mounts(system)
            .with_mount(SandboxMount::rw(&self.session_dir, SESSION_MOUNT))
            .with_mount(SandboxMount::ro(&self.skills_dir, SKILLS_MOUNT))
            .with_mount(SandboxMount::ro(&self.app_dir, APP_MOUNT))
            .with_working_dir(SANDBOX_WORKDIR)
    }

    fn build_argv(&self) -> GuardResult<(Vec<String>, PathBuf)> {
        match self.mode {
            RunnerMode::UnsandboxedDebug => {
                tracing::warn!(
                    "UNSANDBOXED debug mode: running {:?} directly on the host",
                    self.entry_command
                );
                Ok((self.entry_command.clone(), self.session_dir.join("workspace")))
            }
            RunnerMode::Sandboxed => {
                let tool = self.locate_sandbox_tool()?;
                let config = self.sandbox_config(&tool);
                ensure_mount_sources(&config)?;
                // Network stays shared: the agent talks to its model API
                let argv = build_sandbox_command(&config, &self.entry_command, true)?;
                Ok((argv, self.session_dir.clone()))
            }
        }
    }

    /// Run the child to completion or timeout
    pub async fn run(
        &self,
        params: &SandboxedRunParams,
        on_line: Option<LineCallback>,
    ) -> ProcessRunResult {
        let run_id = Uuid::new_v4();
        let started = Instant::now();

        match self.run_inner(run_id, started, params, on_line).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Sandboxed run {} failed to start: {}", run_id, e);
                ProcessRunResult::failure(run_id, &e, started)
            }
        }
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        started: Instant,
        params: &SandboxedRunParams,
        on_line: Option<LineCallback>,
    ) -> GuardResult<ProcessRunResult> {
        if self.entry_command.is_empty() {
            return Err(GuardError::InvalidToolInput("entry command is empty".into()));
        }

        std::fs::create_dir_all(self.session_dir.join("workspace"))?;
        let artifact_path = self.artifact_path();
        if artifact_path.exists() {
            std::fs::remove_file(&artifact_path)?;
        }

        let (argv, cwd) = self.build_argv()?;
        let params_value = params.to_env_value()?;
        let timeout = params
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        tracing::info!(
            "Starting run {} for session {} ({:?}, timeout {}s)",
            run_id,
            params.session_id,
            self.mode,
            timeout.as_secs()
        );
        tracing::debug!("Run {} argv: {:?}", run_id, argv);

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&cwd)
            .env_clear()
            .env("PATH", DEFAULT_SANDBOX_PATH)
            .env(SANDBOX_PARAMS_ENV, params_value)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if self.mode == RunnerMode::Sandboxed {
            command.env("HOME", SANDBOX_WORKDIR);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        let mut group = ProcessGroupGuard::new(child.id());

        let stdout_buf = Arc::new(Mutex::new(String::new()));
        let stderr_buf = Arc::new(Mutex::new(String::new()));
        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(drain(
                stdout,
                StreamKind::Stdout,
                stdout_buf.clone(),
                self.max_output_bytes,
                on_line.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(drain(
                stderr,
                StreamKind::Stderr,
                stderr_buf.clone(),
                self.max_output_bytes,
                on_line.clone(),
            ));
        }

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status?.code().unwrap_or(-1), false),
            Err(_) => {
                tracing::warn!("Run {} timed out after {}s", run_id, timeout.as_secs());
                (TIMEOUT_EXIT_CODE, true)
            }
        };

        // Descendants may outlive the direct child
        if let Err(e) = group.kill() {
            tracing::warn!("Failed to kill process group of run {}: {}", run_id, e);
        }
        if timed_out {
            let _ = child.wait().await;
        }

        for handle in drains {
            if tokio::time::timeout(DRAIN_GRACE, handle).await.is_err() {
                tracing::warn!("Output reader of run {} did not finish", run_id);
            }
        }

        let artifact = if timed_out {
            None
        } else {
            read_artifact(&artifact_path)
        };

        let result = ProcessRunResult {
            run_id,
            stdout: take_buffer(&stdout_buf),
            stderr: take_buffer(&stderr_buf),
            exit_code,
            timed_out,
            duration: started.elapsed(),
            artifact,
            error: None,
        };

        tracing::info!(
            "Run {} finished: exit {} in {:.1}s{}",
            run_id,
            result.exit_code,
            result.duration.as_secs_f64(),
            if result.artifact.is_some() {
                " (artifact found)"
            } else {
                ""
            }
        );
        Ok(result)
    }
}

fn drain<R>(
    reader: R,
    kind: StreamKind,
    buffer: Arc<Mutex<String>>,
    limit: usize,
    on_line: Option<LineCallback>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(callback) = &on_line {
                        callback(kind, &line);
                    }
                    let mut buf = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                    push_tail(&mut buf, &line, limit);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Stopped reading {:?}: {}", kind, e);
                    break;
                }
            }
        }
    })
}

/// Append a line, then drop the oldest bytes beyond `limit`
fn push_tail(buf: &mut String, line: &str, limit: usize) {
    buf.push_str(line);
    buf.push('\n');
    if buf.len() > limit {
        let mut cut = buf.len() - limit;
        while !buf.is_char_boundary(cut) {
            cut += 1;
        }
        buf.drain(..cut);
    }
}

fn take_buffer(buffer: &Arc<Mutex<String>>) -> String {
    std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner))
}

fn read_artifact(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(contents),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::warn!("Could not read result artifact {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn shell(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    fn runner(dir: &TempDir, script: &str) -> SandboxedProcessRunner {
        SandboxedProcessRunner::new(
            dir.path().join("session"),
            dir.path().join("skills"),
            dir.path().join("app"),
            shell(script),
        )
        .with_mode(RunnerMode::UnsandboxedDebug)
    }

    #[test]
    fn test_params_single_line_json() {
        let params = SandboxedRunParams::new("s-1", "line one\nline two", "claude-sonnet")
            .with_timeout_seconds(30);
        let encoded = params.to_env_value().unwrap();
        assert!(!encoded.contains('\n'));
        assert!(!encoded.contains("resume_id"));
        assert_eq!(SandboxedRunParams::from_env_value(&encoded).unwrap(), params);
    }

    #[tokio::test]
    async fn test_missing_sandbox_tool_fails_without_running() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let runner = runner(&dir, &format!("touch {}", marker.display()))
            .with_mode(RunnerMode::Sandboxed)
            .with_sandbox_tool(dir.path().join("no-bwrap"));

        let result = runner.run(&SandboxedRunParams::new("s", "t", "m"), None).await;
        assert_eq!(result.exit_code, -1);
        assert!(result.error.unwrap().contains("Sandbox tool unavailable"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_missing_mount_source_fails_fast() {
        let dir = TempDir::new().unwrap();
        let tool = dir.path().join("bwrap");
        std::fs::write(&tool, "").unwrap();
        let runner = runner(&dir, "true")
            .with_mode(RunnerMode::Sandboxed)
            .with_sandbox_tool(&tool);

        let result = runner.run(&SandboxedRunParams::new("s", "t", "m"), None).await;
        assert!(!result.success());
        assert!(result.error.unwrap().contains("mount source"));
    }

    #[test]
    fn test_sandbox_layout() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, "true");
        let config = runner.sandbox_config(Path::new("/usr/bin/bwrap"));
        let argv = build_sandbox_command(&config, &shell("true"), true).unwrap();

        let joined = argv.join(" ");
        assert!(joined.starts_with("/usr/bin/bwrap --unshare-all"));
        assert!(joined.contains(&format!(
            "--bind {} /session",
            dir.path().join("session").display()
        )));
        assert!(joined.contains(&format!(
            "--ro-bind {} /skills",
            dir.path().join("skills").display()
        )));
        assert!(joined.contains(&format!("--ro-bind {} /app", dir.path().join("app").display())));
        assert!(joined.contains("--chdir /session/workspace"));
        assert!(!joined.contains("--clearenv"));
        assert!(!joined.contains(SANDBOX_PARAMS_ENV));
    }

    #[tokio::test]
    async fn test_run_captures_streams_and_artifact() {
        let dir = TempDir::new().unwrap();
        let script = r#"echo "params=$SHADOW_SANDBOX_PARAMS"; echo oops >&2; echo '{"status": "done"}' > result.json"#;
        let runner = runner(&dir, script);

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = lines.clone();
        let callback: LineCallback = Arc::new(move |kind: StreamKind, line: &str| {
            sink.lock().unwrap().push((kind, line.to_string()));
        });

        let params = SandboxedRunParams::new("s-42", "do it", "m");
        let result = runner.run(&params, Some(callback)).await;

        assert!(result.success(), "{:?}", result);
        assert!(result.stdout.contains("\"session_id\":\"s-42\""));
        assert_eq!(result.stderr, "oops\n");
        assert_eq!(
            result.artifact_json().unwrap(),
            Some(serde_json::json!({"status": "done"}))
        );
        assert!(lines
            .lock()
            .unwrap()
            .contains(&(StreamKind::Stderr, "oops".to_string())));
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_artifact() {
        let dir = TempDir::new().unwrap();
        let result = runner(&dir, "echo partial; exit 3")
            .run(&SandboxedRunParams::new("s", "t", "m"), None)
            .await;
        assert_eq!(result.exit_code, 3);
        assert!(!result.timed_out);
        assert!(result.artifact.is_none());
        assert_eq!(result.stdout, "partial\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_tree_and_keeps_output() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, "echo started; sleep 30 & sleep 30; wait")
            .with_default_timeout(Duration::from_millis(500));

        let started = Instant::now();
        let result = runner.run(&SandboxedRunParams::new("s", "t", "m"), None).await;

        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stale_artifact_removed_before_run() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, "true");
        std::fs::create_dir_all(dir.path().join("session/workspace")).unwrap();
        std::fs::write(runner.artifact_path(), "{}").unwrap();

        let result = runner.run(&SandboxedRunParams::new("s", "t", "m"), None).await;
        assert!(result.success());
        assert!(result.artifact.is_none());
    }

    #[test]
    fn test_push_tail_keeps_last_bytes() {
        let mut buf = String::new();
        push_tail(&mut buf, "first", 13);
        push_tail(&mut buf, "second", 13);
        assert_eq!(buf, "first\nsecond\n");
        push_tail(&mut buf, "third", 13);
        assert_eq!(buf, "second\nthird\n");

        // Never splits a multi-byte character
        let mut buf = String::new();
        push_tail(&mut buf, "ééé", 4);
        assert_eq!(buf, "é\n");
    }

    #[tokio::test]
    async fn test_output_capped_to_tail() {
        let dir = TempDir::new().unwrap();
        let lines = Arc::new(Mutex::new(0usize));
        let sink = lines.clone();
        let callback: LineCallback = Arc::new(move |_kind: StreamKind, _line: &str| {
            *sink.lock().unwrap() += 1;
        });

        let result = runner(&dir, "for i in 1 2 3 4 5 6 7 8 9; do echo line$i; done")
            .with_max_output_bytes(12)
            .run(&SandboxedRunParams::new("s", "t", "m"), Some(callback))
            .await;

        assert!(result.success(), "{:?}", result);
        assert_eq!(result.stdout, "line8\nline9\n");
        assert_eq!(*lines.lock().unwrap(), 9);
    }
}
