//! Guard configuration
//!
//! Where profiles and rule sets live, how many denials end a run, and how the
//! sandbox tool is found. Built from the environment or with `with_*`
//! methods; every component of a session is constructed from one config.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{GuardError, GuardResult};
use crate::permissions::{
    DangerousPatternStore, DenialTracker, ProfileManager, ProfileStore, DEFAULT_DENIAL_THRESHOLD,
};
use crate::sandbox::{RunnerMode, SandboxedProcessRunner};

pub const ENV_PROFILES_DIR: &str = "SHADOW_SANDBOX_PROFILES_DIR";
pub const ENV_PATTERNS_DIR: &str = "SHADOW_SANDBOX_PATTERNS_DIR";
pub const ENV_DENIAL_THRESHOLD: &str = "SHADOW_SANDBOX_DENIAL_THRESHOLD";
pub const ENV_SANDBOX_TOOL: &str = "SHADOW_SANDBOX_BWRAP";
pub const ENV_UNSANDBOXED_DEBUG: &str = "SHADOW_SANDBOX_UNSANDBOXED_DEBUG";
pub const ENV_LOG_DIR: &str = "SHADOW_SANDBOX_LOG_DIR";

/// Configuration shared by every session of a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Directory holding `system.yaml` and `user.yaml`
    pub profiles_dir: PathBuf,
    /// Directory holding the dangerous-pattern rule sets
    pub patterns_dir: PathBuf,
    /// Rule-set files to load, in order (empty = all, sorted by name)
    pub pattern_sources: Vec<String>,
    /// Denials of one tool that interrupt a run (twice this in total)
    pub denial_threshold: u32,
    /// Explicit sandbox tool binary (None = `bwrap` on `PATH`)
    pub sandbox_tool: Option<PathBuf>,
    /// Developer-only: run agent processes without a sandbox
    pub unsandboxed_debug: bool,
    pub log_dir: PathBuf,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            profiles_dir: PathBuf::from("./profiles"),
            patterns_dir: PathBuf::from("./rules/dangerous"),
            pattern_sources: Vec::new(),
            denial_threshold: DEFAULT_DENIAL_THRESHOLD,
            sandbox_tool: None,
            unsandboxed_debug: false,
            log_dir: PathBuf::from("./logs"),
        }
    }
}

impl GuardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config from environment variables
    ///
    /// Reads from:
    /// - `SHADOW_SANDBOX_PROFILES_DIR` (optional, defaults to `./profiles`)
    /// - `SHADOW_SANDBOX_PATTERNS_DIR` (optional, defaults to `./rules/dangerous`)
    /// - `SHADOW_SANDBOX_DENIAL_THRESHOLD` (optional, defaults to 3)
    /// - `SHADOW_SANDBOX_BWRAP` (optional, defaults to `bwrap` on `PATH`)
    /// - `SHADOW_SANDBOX_UNSANDBOXED_DEBUG` (optional, `1` or `true` to enable)
    /// - `SHADOW_SANDBOX_LOG_DIR` (optional, defaults to `./logs`)
    pub fn from_env() -> GuardResult<Self> {
        tracing::info!("Creating guard config from environment");
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create a config from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> GuardResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_PROFILES_DIR) {
            config.profiles_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ENV_PATTERNS_DIR) {
            config.patterns_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_DENIAL_THRESHOLD) {
            config.denial_threshold = raw.trim().parse().map_err(|_| {
                GuardError::InvalidConfig(format!(
                    "{} must be a positive integer, got '{}'",
                    ENV_DENIAL_THRESHOLD, raw
                ))
            })?;
        }
        if let Some(tool) = lookup(ENV_SANDBOX_TOOL).filter(|t| !t.is_empty()) {
            config.sandbox_tool = Some(PathBuf::from(tool));
        }
        if let Some(flag) = lookup(ENV_UNSANDBOXED_DEBUG) {
            config.unsandboxed_debug = matches!(flag.trim(), "1" | "true");
        }
        config.log_dir = Self::log_dir_from_lookup(&lookup);

        config.validate()?;

        tracing::info!("Profiles: {}", config.profiles_dir.display());
        tracing::info!("Dangerous patterns: {}", config.patterns_dir.display());
        tracing::info!("Denial threshold: {}", config.denial_threshold);
        if config.unsandboxed_debug {
            tracing::warn!("{} is set: agent processes will run UNSANDBOXED", ENV_UNSANDBOXED_DEBUG);
        }

        Ok(config)
    }

    /// Log directory alone, so logging can start before the rest is read
    pub fn log_dir_from_env() -> PathBuf {
        Self::log_dir_from_lookup(|key| env::var(key).ok())
    }

    fn log_dir_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
        lookup(ENV_LOG_DIR)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::default().log_dir)
    }

    pub fn validate(&self) -> GuardResult<()> {
        if self.denial_threshold == 0 {
            return Err(GuardError::InvalidConfig(
                "denial threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn with_profiles_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profiles_dir = dir.into();
        self
    }

    pub fn with_patterns_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.patterns_dir = dir.into();
        self
    }

    pub fn with_pattern_sources(mut self, sources: Vec<String>) -> Self {
        self.pattern_sources = sources;
        self
    }

    pub fn with_denial_threshold(mut self, threshold: u32) -> Self {
        self.denial_threshold = threshold;
        self
    }

    pub fn with_sandbox_tool(mut self, path: impl Into<PathBuf>) -> Self {
        self.sandbox_tool = Some(path.into());
        self
    }

    pub fn with_unsandboxed_debug(mut self, enabled: bool) -> Self {
        self.unsandboxed_debug = enabled;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    // =========================================================================
    // Component construction
    // =========================================================================

    pub fn profile_store(&self) -> ProfileStore {
        ProfileStore::new(&self.profiles_dir)
    }

    /// Load a fresh profile manager for one session
    pub fn profile_manager(&self) -> GuardResult<ProfileManager> {
        ProfileManager::load(self.profile_store())
    }

    /// Pattern store, shareable across sessions
    pub fn pattern_store(&self) -> Arc<DangerousPatternStore> {
        Arc::new(
            DangerousPatternStore::new(&self.patterns_dir)
                .with_sources(self.pattern_sources.clone()),
        )
    }

    /// Denial tracker for one run
    pub fn denial_tracker(&self) -> DenialTracker {
        DenialTracker::new(self.denial_threshold)
    }

    pub fn runner_mode(&self) -> RunnerMode {
        if self.unsandboxed_debug {
            RunnerMode::UnsandboxedDebug
        } else {
            RunnerMode::Sandboxed
        }
    }

    /// Process runner for one session directory
    pub fn process_runner(
        &self,
        session_dir: impl Into<PathBuf>,
        skills_dir: impl Into<PathBuf>,
        app_dir: impl Into<PathBuf>,
        entry_command: Vec<String>,
    ) -> SandboxedProcessRunner {
        let runner = SandboxedProcessRunner::new(session_dir, skills_dir, app_dir, entry_command)
            .with_mode(self.runner_mode());
        match &self.sandbox_tool {
            Some(tool) => runner.with_sandbox_tool(tool),
            None => runner,
        }
    }
}
