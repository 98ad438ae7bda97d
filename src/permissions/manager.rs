//! Profile manager implementation
//!
//! Holds the system profile and the user template, switches between them,
//! and binds the user template to one session workspace at a time:
//! - System: static rules for lifecycle operations
//! - User: template resolved per session via `set_session_context`
//!
//! One manager belongs to one executing session. When an admin path may
//! reload profiles while checks are in flight, share it through
//! [`SharedProfileManager`].

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::core::{GuardError, GuardResult};

use super::matcher::{split_call, PatternMatcher, RuleVerdict};
use super::profile::{
    PermissionProfile, PermissionRules, ProfileKind, ProfileStore, SessionContext, ToolGate,
};

/// Permission interface consumed by the tool-call callback
pub trait PermissionChecker: Send + Sync {
    /// Decide a tool-call string against one consistent view of the rules
    fn decide(&self, tool_call: &str) -> RuleVerdict;

    /// Whether the call is allowed outright
    fn is_allowed(&self, tool_call: &str) -> bool {
        self.decide(tool_call) == RuleVerdict::Allow
    }

    /// Whether the call matches an ask rule
    fn needs_confirmation(&self, tool_call: &str) -> bool {
        self.decide(tool_call) == RuleVerdict::Ask
    }

    /// Allow patterns of the active profile that apply to `tool_name`
    fn allowed_patterns_for_tool(&self, tool_name: &str) -> Vec<String>;

    /// Name of the active profile
    fn profile_name(&self) -> String;
}

/// Notification emitted on every profile switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSwitchEvent {
    #[serde(rename = "type")]
    pub kind: ProfileKind,
    pub name: String,
    pub tool_count: usize,
    pub allow_count: usize,
    pub deny_count: usize,
    pub source_path: Option<PathBuf>,
}

/// Receives profile-switch notifications (e.g. a console tracer)
pub trait ProfileSwitchObserver: Send + Sync {
    fn on_profile_switch(&self, event: &ProfileSwitchEvent);
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProfileSwitchObserver for NoopObserver {
    fn on_profile_switch(&self, _event: &ProfileSwitchEvent) {}
}

/// Per-session profile manager
pub struct ProfileManager {
    /// Backing store (None for in-memory profiles)
    store: Option<ProfileStore>,
    system: PermissionProfile,
    user_template: PermissionProfile,
    /// User profile bound to the current session, if any
    user_resolved: Option<PermissionProfile>,
    session: Option<SessionContext>,
    active: ProfileKind,
    /// Rules derived from the active profile (None = unbound template)
    active_rules: Option<PermissionRules>,
    matcher: PatternMatcher,
    observer: Arc<dyn ProfileSwitchObserver>,
}

impl ProfileManager {
    /// Load both profiles from a store. The system profile starts active.
    pub fn load(store: ProfileStore) -> GuardResult<Self> {
        let (system, user) = store.load()?;
        let mut manager = Self::new(system, user)?;
        manager.store = Some(store);
        Ok(manager)
    }

    /// Create a manager from in-memory profiles
    pub fn new(system: PermissionProfile, user_template: PermissionProfile) -> GuardResult<Self> {
        Self::check_shapes(&system, &user_template)?;

        let mut manager = Self {
            store: None,
            system,
            user_template,
            user_resolved: None,
            session: None,
            active: ProfileKind::System,
            active_rules: None,
            matcher: PatternMatcher::new(),
            observer: Arc::new(NoopObserver),
        };
        manager.rederive();
        Ok(manager)
    }

    fn check_shapes(system: &PermissionProfile, user: &PermissionProfile) -> GuardResult<()> {
        let location = |p: &PermissionProfile| {
            p.source
                .clone()
                .unwrap_or_else(|| PathBuf::from(&p.name))
        };
        if system.is_template() {
            return Err(GuardError::invalid_profile(
                location(system),
                "system profile must carry static rules",
            ));
        }
        if !user.is_template() {
            return Err(GuardError::invalid_profile(
                location(user),
                "user profile must carry a session workspace template",
            ));
        }
        Ok(())
    }

    /// Set the profile-switch observer
    pub fn with_observer(mut self, observer: Arc<dyn ProfileSwitchObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the pattern matcher (e.g. to pin the default base)
    pub fn with_matcher(mut self, matcher: PatternMatcher) -> Self {
        self.matcher = matcher;
        if let Some(session) = &self.session {
            self.matcher.set_base_dir(Some(session.workspace_abs.clone()));
        }
        self
    }

    // =========================================================================
    // Profile switching
    // =========================================================================

    /// Activate the system profile
    pub fn activate_system(&mut self) {
        self.activate(ProfileKind::System);
    }

    /// Activate the user profile
    ///
    /// Without a session context every check is denied until one is set.
    pub fn activate_user(&mut self) {
        self.activate(ProfileKind::User);
    }

    fn activate(&mut self, kind: ProfileKind) {
        self.active = kind;
        self.rederive();

        let profile = self.active_profile();
        let event = ProfileSwitchEvent {
            kind,
            name: profile.name.clone(),
            tool_count: profile.tools.enabled.len(),
            allow_count: profile.allow_count(),
            deny_count: profile.deny_count(),
            source_path: profile.source.clone(),
        };

        tracing::info!(
            "Switched to {} profile '{}' ({} allow, {} deny)",
            kind,
            event.name,
            event.allow_count,
            event.deny_count
        );
        self.observer.on_profile_switch(&event);
    }

    fn rederive(&mut self) {
        self.active_rules = self.active_profile().static_rules().cloned();
    }

    /// Which profile is active
    pub fn active_kind(&self) -> ProfileKind {
        self.active
    }

    /// The active profile (the bound user profile when a session is set)
    pub fn active_profile(&self) -> &PermissionProfile {
        match self.active {
            ProfileKind::System => &self.system,
            ProfileKind::User => self.user_resolved.as_ref().unwrap_or(&self.user_template),
        }
    }

    /// Rules currently in force, `None` while an unbound template is active
    pub fn active_rules(&self) -> Option<&PermissionRules> {
        self.active_rules.as_ref()
    }

    /// User rules bound to the current session
    pub fn resolved_user_rules(&self) -> Option<&PermissionRules> {
        self.user_resolved.as_ref().and_then(|p| p.static_rules())
    }

    pub fn system_profile(&self) -> &PermissionProfile {
        &self.system
    }

    pub fn user_template(&self) -> &PermissionProfile {
        &self.user_template
    }

    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    // =========================================================================
    // Session context
    // =========================================================================

    /// Bind the user template to a session workspace
    pub fn set_session_context(
        &mut self,
        session_id: &str,
        workspace_rel: impl Into<PathBuf>,
        workspace_abs: impl Into<PathBuf>,
    ) -> GuardResult<()> {
        let session = SessionContext::new(session_id, workspace_rel, workspace_abs)?;
        self.apply_session(session);
        Ok(())
    }

    fn apply_session(&mut self, session: SessionContext) {
        tracing::info!(
            "Binding user profile '{}' to session {} ({})",
            self.user_template.name,
            session.session_id,
            session.workspace_abs.display()
        );
        self.user_resolved = Some(self.user_template.for_session(&session));
        self.matcher
            .set_base_dir(Some(session.workspace_abs.clone()));
        self.session = Some(session);
        self.rederive();
    }

    /// Unbind the session; the user profile reverts to its template
    pub fn clear_session_context(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::info!("Clearing session context {}", session.session_id);
        }
        self.user_resolved = None;
        self.matcher.set_base_dir(None);
        self.rederive();
    }

    pub fn session(&self) -> Option<&SessionContext> {
        self.session.as_ref()
    }

    // =========================================================================
    // Reload
    // =========================================================================

    /// Re-read both profiles from the backing store
    ///
    /// A live session context is re-applied to the fresh user template.
    pub fn reload(&mut self) -> GuardResult<()> {
        let Some(store) = &self.store else {
            tracing::debug!("Profile manager has no backing store, nothing to reload");
            return Ok(());
        };

        let (system, user) = store.load()?;
        Self::check_shapes(&system, &user)?;
        self.system = system;
        self.user_template = user;
        self.user_resolved = None;

        if let Some(session) = self.session.take() {
            self.apply_session(session);
        }
        self.rederive();

        tracing::info!(
            "Reloaded permission profiles (active: {} '{}')",
            self.active,
            self.active_profile().name
        );
        Ok(())
    }
}

impl PermissionChecker for ProfileManager {
    /// Decide a tool-call string against the active profile
    fn decide(&self, tool_call: &str) -> RuleVerdict {
        let Some(rules) = &self.active_rules else {
            tracing::warn!(
                "User profile is not bound to a session, denying {}",
                tool_call
            );
            return RuleVerdict::Deny;
        };

        let profile = self.active_profile();
        let (tool_name, _) = split_call(tool_call);

        match profile.tools.gate(tool_name) {
            ToolGate::Disabled => RuleVerdict::Deny,
            ToolGate::Enabled if self.matcher.always_denied(tool_call, rules) => {
                RuleVerdict::Deny
            }
            ToolGate::Enabled => RuleVerdict::Allow,
            ToolGate::Checked => self.matcher.evaluate(tool_call, rules).resolve(profile.mode),
        }
    }

    fn allowed_patterns_for_tool(&self, tool_name: &str) -> Vec<String> {
        let Some(rules) = &self.active_rules else {
            return Vec::new();
        };
        rules
            .allow
            .iter()
            .filter(|pattern| {
                let (pattern_tool, _) = split_call(pattern);
                pattern_tool == tool_name
            })
            .cloned()
            .collect()
    }

    fn profile_name(&self) -> String {
        self.active_profile().name.clone()
    }
}

impl std::fmt::Debug for ProfileManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileManager")
            .field("active", &self.active)
            .field("profile", &self.active_profile().name)
            .field("session", &self.session.as_ref().map(|s| &s.session_id))
            .finish()
    }
}

/// Profile manager shared between a session's check path and a reload path
#[derive(Clone)]
pub struct SharedProfileManager {
    inner: Arc<Mutex<ProfileManager>>,
}

impl SharedProfileManager {
    pub fn new(manager: ProfileManager) -> Self {
        Self {
            inner: Arc::new(Mutex::new(manager)),
        }
    }

    /// Lock the manager for direct use
    pub fn lock(&self) -> MutexGuard<'_, ProfileManager> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reload(&self) -> GuardResult<()> {
        self.lock().reload()
    }

    pub fn activate_system(&self) {
        self.lock().activate_system();
    }

    pub fn activate_user(&self) {
        self.lock().activate_user();
    }

    pub fn set_session_context(
        &self,
        session_id: &str,
        workspace_rel: impl Into<PathBuf>,
        workspace_abs: impl Into<PathBuf>,
    ) -> GuardResult<()> {
        self.lock()
            .set_session_context(session_id, workspace_rel, workspace_abs)
    }

    pub fn clear_session_context(&self) {
        self.lock().clear_session_context();
    }
}

impl PermissionChecker for SharedProfileManager {
    fn decide(&self, tool_call: &str) -> RuleVerdict {
        self.lock().decide(tool_call)
    }

    fn allowed_patterns_for_tool(&self, tool_name: &str) -> Vec<String> {
        self.lock().allowed_patterns_for_tool(tool_name)
    }

    fn profile_name(&self) -> String {
        self.lock().profile_name()
    }
}
