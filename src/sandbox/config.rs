//! Sandbox configuration types
//!
//! A `SandboxConfig` is assembled once per launch and not changed afterwards.
//! Mount sources may be written with `{workspace}` / `{session_id}`
//! placeholders; they must be resolved before the config is built into a
//! command.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{GuardError, GuardResult};
use crate::permissions::{SessionContext, SESSION_ID_PLACEHOLDER, WORKSPACE_PLACEHOLDER};

/// Host directories exposed read-only to sandboxed commands when present
pub const SYSTEM_RO_PATHS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc"];

/// Default `PATH` inside the sandbox
pub const DEFAULT_SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Default `HOME` inside the sandbox
pub const DEFAULT_SANDBOX_HOME: &str = "/tmp";

const DEFAULT_SANDBOX_TOOL: &str = "bwrap";

/// Access mode of a bind mount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    Ro,
    Rw,
}

impl MountMode {
    /// Sandbox-tool flag for this mode
    pub fn bind_flag(self) -> &'static str {
        match self {
            MountMode::Ro => "--ro-bind",
            MountMode::Rw => "--bind",
        }
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountMode::Ro => write!(f, "ro"),
            MountMode::Rw => write!(f, "rw"),
        }
    }
}

impl FromStr for MountMode {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ro" => Ok(MountMode::Ro),
            "rw" => Ok(MountMode::Rw),
            other => Err(GuardError::InvalidMount(format!(
                "mount mode must be 'ro' or 'rw', got '{}'",
                other
            ))),
        }
    }
}

/// One host path exposed inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub mode: MountMode,
}

impl SandboxMount {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>, mode: MountMode) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode,
        }
    }

    pub fn ro(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self::new(source, target, MountMode::Ro)
    }

    pub fn rw(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self::new(source, target, MountMode::Rw)
    }

    /// Same path on both sides
    pub fn same_path(path: impl Into<PathBuf>, mode: MountMode) -> Self {
        let path = path.into();
        Self::new(path.clone(), path, mode)
    }

    /// Parse `source:target[:ro|rw]` (mode defaults to `ro`)
    pub fn parse(spec: &str) -> GuardResult<Self> {
        let parts: Vec<&str> = spec.split(':').collect();
        match parts.as_slice() {
            [source, target] if !source.is_empty() && !target.is_empty() => {
                Ok(Self::ro(*source, *target))
            }
            [source, target, mode] if !source.is_empty() && !target.is_empty() => {
                Ok(Self::new(*source, *target, mode.parse()?))
            }
            _ => Err(GuardError::InvalidMount(format!(
                "expected source:target[:ro|rw], got '{}'",
                spec
            ))),
        }
    }

    /// Substitute session placeholders in source and target
    pub fn resolve(&self, session: &SessionContext) -> Self {
        let substitute = |p: &Path| PathBuf::from(session.substitute(&p.to_string_lossy()));
        Self {
            source: substitute(&self.source),
            target: substitute(&self.target),
            mode: self.mode,
        }
    }

    /// Reject unresolved placeholders and relative targets
    pub fn validate(&self) -> GuardResult<()> {
        for path in [&self.source, &self.target] {
            let text = path.to_string_lossy();
            if text.contains(WORKSPACE_PLACEHOLDER) || text.contains(SESSION_ID_PLACEHOLDER) {
                return Err(GuardError::InvalidMount(format!(
                    "unresolved placeholder in {}",
                    text
                )));
            }
        }
        if !self.target.is_absolute() {
            return Err(GuardError::InvalidMount(format!(
                "mount target {} must be absolute",
                self.target.display()
            )));
        }
        Ok(())
    }
}

/// Namespaces to unshare besides the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
    pub pid: bool,
    pub ipc: bool,
    pub uts: bool,
}

impl Namespaces {
    pub fn all() -> Self {
        Self {
            pid: true,
            ipc: true,
            uts: true,
        }
    }

    pub fn is_all(&self) -> bool {
        self.pid && self.ipc && self.uts
    }
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::all()
    }
}

/// Environment visible inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvPolicy {
    /// Start from an empty environment
    pub clear_env: bool,
    pub home: String,
    pub path: String,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self {
            clear_env: true,
            home: DEFAULT_SANDBOX_HOME.to_string(),
            path: DEFAULT_SANDBOX_PATH.to_string(),
            extra: BTreeMap::new(),
        }
    }
}

/// Sandbox settings for one launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxConfig {
    enabled: bool,
    network_sandboxing_enabled: bool,
    /// Mount an empty tmpfs as `/` before any bind
    empty_root: bool,
    namespaces: Namespaces,
    mounts: Vec<SandboxMount>,
    env: EnvPolicy,
    tmpfs_size_mb: Option<u32>,
    working_dir: Option<PathBuf>,
    tool_path: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            network_sandboxing_enabled: true,
            empty_root: false,
            namespaces: Namespaces::all(),
            mounts: Vec::new(),
            env: EnvPolicy::default(),
            tmpfs_size_mb: None,
            working_dir: None,
            tool_path: PathBuf::from(DEFAULT_SANDBOX_TOOL),
        }
    }
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confine commands to one session workspace
    ///
    /// System directories present on the host are bound read-only, the
    /// workspace read-write at its own path. The workspace also becomes the
    /// working directory and `HOME`.
    pub fn for_session(workspace: impl AsRef<Path>) -> Self {
        let workspace = workspace.as_ref();
        let mut config = Self::default();

        for dir in SYSTEM_RO_PATHS {
            if Path::new(dir).exists() {
                config.mounts.push(SandboxMount::same_path(*dir, MountMode::Ro));
            }
        }
        config
            .mounts
            .push(SandboxMount::same_path(workspace, MountMode::Rw));
        config.working_dir = Some(workspace.to_path_buf());
        config.env.home = workspace.to_string_lossy().into_owned();
        config
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_network_sandboxing(mut self, enabled: bool) -> Self {
        self.network_sandboxing_enabled = enabled;
        self
    }

    pub fn with_empty_root(mut self, empty_root: bool) -> Self {
        self.empty_root = empty_root;
        self
    }

    pub fn with_namespaces(mut self, namespaces: Namespaces) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn with_mount(mut self, mount: SandboxMount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn with_mounts(mut self, mounts: impl IntoIterator<Item = SandboxMount>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    pub fn with_env(mut self, env: EnvPolicy) -> Self {
        self.env = env;
        self
    }

    pub fn with_env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_tmpfs_size_mb(mut self, size_mb: u32) -> Self {
        self.tmpfs_size_mb = Some(size_mb);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_tool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_path = path.into();
        self
    }

    /// Resolve placeholders in every mount and in the working directory
    pub fn resolve(mut self, session: &SessionContext) -> Self {
        self.mounts = self.mounts.iter().map(|m| m.resolve(session)).collect();
        if let Some(dir) = &self.working_dir {
            self.working_dir = Some(PathBuf::from(session.substitute(&dir.to_string_lossy())));
        }
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn network_sandboxing_enabled(&self) -> bool {
        self.network_sandboxing_enabled
    }

    pub fn empty_root(&self) -> bool {
        self.empty_root
    }

    pub fn namespaces(&self) -> Namespaces {
        self.namespaces
    }

    pub fn mounts(&self) -> &[SandboxMount] {
        &self.mounts
    }

    pub fn env(&self) -> &EnvPolicy {
        &self.env
    }

    pub fn tmpfs_size_mb(&self) -> Option<u32> {
        self.tmpfs_size_mb
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn tool_path(&self) -> &Path {
        &self.tool_path
    }
}
