//! Permission system for tool execution
//!
//! Every tool call an agent attempts is turned into a canonical tool-call
//! string (`Read(./src/main.rs)`, `Bash(git status)`) and decided against
//! one of two profiles:
//! - **System**: static rules for lifecycle operations
//! - **User**: a `{workspace}` template bound to one session workspace
//!
//! ## Rule evaluation
//!
//! Allow rules are checked first, then deny, then ask. A call matching
//! nothing is denied unless the profile runs in `bypassPermissions` mode.
//! Chained shell commands never match, and `Bash` calls are screened
//! against the dangerous-command corpus before any profile rule.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use shadow_sandbox::permissions::{
//!     DangerousPatternStore, DenialTracker, PermissionCallback, ProfileManager, ProfileStore,
//! };
//!
//! let mut manager = ProfileManager::load(ProfileStore::new("./profiles"))?;
//! manager.set_session_context("s-1", "sessions/s-1", "/data/sessions/s-1")?;
//! manager.activate_user();
//!
//! let patterns = Arc::new(DangerousPatternStore::new("./rules/dangerous"));
//! let mut callback = PermissionCallback::new(Arc::new(manager), patterns, DenialTracker::new(3));
//!
//! let decision = callback.check("Read", &serde_json::json!({"file_path": "notes.md"}));
//! if decision.interrupt { /* stop the run */ }
//! ```

mod callback;
mod dangerous;
mod manager;
mod matcher;
mod profile;
mod tracker;

pub use callback::{PermissionCallback, ToolBehavior, ToolDecision, SANDBOX_BYPASS_KEYS};
pub use dangerous::{DangerousPattern, DangerousPatternStore};
pub use manager::{
    NoopObserver, PermissionChecker, ProfileManager, ProfileSwitchEvent, ProfileSwitchObserver,
    SharedProfileManager,
};
pub use matcher::{
    is_compound_command, is_file_tool, split_call, tool_call_string, PatternMatcher, RuleVerdict,
    BASH_TOOL, FILE_TOOLS, SHELL_CHAIN_TOKENS,
};
pub use profile::{
    PermissionMode, PermissionProfile, PermissionRules, ProfileFormat, ProfileKind, ProfileRules,
    ProfileStore, SessionContext, SessionWorkspaceTemplate, ToolGate, ToolsConfig,
    SESSION_ID_PLACEHOLDER, WORKSPACE_PLACEHOLDER,
};
pub use tracker::{
    DenialObserver, DenialRecord, DenialTracker, NoopDenialObserver, TrackerState,
    DEFAULT_DENIAL_THRESHOLD,
};
