//! Permission profiles
//!
//! Two profiles exist side by side:
//! - **system**: static rules with broad access, used for lifecycle operations
//! - **user**: a session-workspace template, confined to one task's workspace
//!
//! The user template carries `{workspace}` / `{session_id}` placeholders and is
//! never evaluated as-is. [`PermissionProfile::for_session`] substitutes them
//! and yields a profile with static rules.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{GuardError, GuardResult};

/// Placeholder replaced with the absolute session workspace path
pub const WORKSPACE_PLACEHOLDER: &str = "{workspace}";
/// Placeholder replaced with the session id
pub const SESSION_ID_PLACEHOLDER: &str = "{session_id}";

const PROFILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Which of the two profiles a value refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileKind {
    System,
    User,
}

impl ProfileKind {
    /// File stem of the profile source
    pub fn file_stem(self) -> &'static str {
        match self {
            ProfileKind::System => "system",
            ProfileKind::User => "user",
        }
    }
}

impl std::fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// How calls that match no rule are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    /// Every unmatched call is allowed
    BypassPermissions,
}

impl PermissionMode {
    pub fn bypasses_checks(self) -> bool {
        matches!(self, PermissionMode::BypassPermissions)
    }
}

/// Result of gating a tool name through [`ToolsConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolGate {
    /// Tool is disabled outright
    Disabled,
    /// Tool is enabled and not subject to rule matching
    Enabled,
    /// Tool must go through the rule matcher
    Checked,
}

/// Enabled/disabled tool sets of a profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    #[serde(default)]
    pub enabled: BTreeSet<String>,
    #[serde(default)]
    pub disabled: BTreeSet<String>,
    /// Tools that always go through the matcher, even when enabled
    #[serde(default)]
    pub permission_checked: BTreeSet<String>,
}

impl ToolsConfig {
    /// Gate a tool name. `disabled` always wins over `enabled`.
    pub fn gate(&self, tool_name: &str) -> ToolGate {
        if self.disabled.contains(tool_name) {
            ToolGate::Disabled
        } else if self.enabled.contains(tool_name) && !self.permission_checked.contains(tool_name)
        {
            ToolGate::Enabled
        } else {
            ToolGate::Checked
        }
    }
}

/// Concrete allow/deny/ask rule lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PermissionRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub ask: Vec<String>,
    /// Directories file-oriented tools are confined to (empty = no confinement)
    #[serde(default)]
    pub allowed_dirs: Vec<String>,
}

/// User-profile rules before a session workspace is bound
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionWorkspaceTemplate {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub ask: Vec<String>,
    #[serde(default)]
    pub allowed_dirs: Vec<String>,
}

impl SessionWorkspaceTemplate {
    /// Substitute every placeholder for the given session
    pub fn resolve(&self, session: &SessionContext) -> PermissionRules {
        let substitute = |entries: &[String]| -> Vec<String> {
            entries.iter().map(|e| session.substitute(e)).collect()
        };
        PermissionRules {
            allow: substitute(&self.allow),
            deny: substitute(&self.deny),
            ask: substitute(&self.ask),
            allowed_dirs: substitute(&self.allowed_dirs),
        }
    }
}

/// Rules carried by a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileRules {
    Static(PermissionRules),
    SessionTemplate(SessionWorkspaceTemplate),
}

/// Session a user profile is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: String,
    /// Workspace path relative to the service root (for display and mounts)
    pub workspace_rel: PathBuf,
    /// Absolute workspace path substituted into the template
    pub workspace_abs: PathBuf,
}

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        workspace_rel: impl Into<PathBuf>,
        workspace_abs: impl Into<PathBuf>,
    ) -> GuardResult<Self> {
        let session_id = session_id.into();
        let workspace_abs = workspace_abs.into();

        if session_id.trim().is_empty() {
            return Err(GuardError::InvalidSession("session id is empty".into()));
        }
        if !workspace_abs.is_absolute() {
            return Err(GuardError::InvalidSession(format!(
                "workspace path {} is not absolute",
                workspace_abs.display()
            )));
        }

        Ok(Self {
            session_id,
            workspace_rel: workspace_rel.into(),
            workspace_abs,
        })
    }

    /// Replace `{workspace}` and `{session_id}` in one entry
    pub fn substitute(&self, entry: &str) -> String {
        let workspace = self.workspace_abs.to_string_lossy();
        let workspace = workspace.trim_end_matches('/');
        entry
            .replace(WORKSPACE_PLACEHOLDER, workspace)
            .replace(SESSION_ID_PLACEHOLDER, &self.session_id)
    }
}

/// A named bundle of tool sets and rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionProfile {
    pub name: String,
    pub description: String,
    pub mode: PermissionMode,
    pub tools: ToolsConfig,
    pub rules: ProfileRules,
    /// File the profile was loaded from, if any
    pub source: Option<PathBuf>,
}

impl PermissionProfile {
    /// Static rules, or `None` for an unbound session template
    pub fn static_rules(&self) -> Option<&PermissionRules> {
        match &self.rules {
            ProfileRules::Static(rules) => Some(rules),
            ProfileRules::SessionTemplate(_) => None,
        }
    }

    pub fn is_template(&self) -> bool {
        matches!(self.rules, ProfileRules::SessionTemplate(_))
    }

    /// Derive a profile with static rules for one session.
    ///
    /// Static profiles are returned unchanged.
    pub fn for_session(&self, session: &SessionContext) -> PermissionProfile {
        let rules = match &self.rules {
            ProfileRules::Static(rules) => ProfileRules::Static(rules.clone()),
            ProfileRules::SessionTemplate(template) => {
                ProfileRules::Static(template.resolve(session))
            }
        };
        PermissionProfile {
            rules,
            ..self.clone()
        }
    }

    pub fn allow_count(&self) -> usize {
        match &self.rules {
            ProfileRules::Static(r) => r.allow.len(),
            ProfileRules::SessionTemplate(t) => t.allow.len(),
        }
    }

    pub fn deny_count(&self) -> usize {
        match &self.rules {
            ProfileRules::Static(r) => r.deny.len(),
            ProfileRules::SessionTemplate(t) => t.deny.len(),
        }
    }

    /// Load a profile file, choosing YAML or JSON by extension
    pub fn from_path(path: &Path, kind: ProfileKind) -> GuardResult<Self> {
        let format = ProfileFormat::from_path(path)?;
        let contents = fs::read_to_string(path)?;
        let mut profile = Self::parse(&contents, format, kind, path)?;
        profile.source = Some(path.to_path_buf());
        Ok(profile)
    }

    /// Parse profile text of a known format
    pub fn parse(
        contents: &str,
        format: ProfileFormat,
        kind: ProfileKind,
        path: &Path,
    ) -> GuardResult<Self> {
        let file: ProfileFile = match format {
            ProfileFormat::Yaml => serde_yaml::from_str(contents)?,
            ProfileFormat::Json => serde_json::from_str(contents)?,
        };
        file.into_profile(kind, path)
    }
}

/// Serialization format of a profile source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileFormat {
    Yaml,
    Json,
}

impl ProfileFormat {
    pub fn from_path(path: &Path) -> GuardResult<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Ok(ProfileFormat::Yaml),
            Some("json") => Ok(ProfileFormat::Json),
            _ => Err(GuardError::invalid_profile(
                path,
                "profile files must end in .yaml, .yml or .json",
            )),
        }
    }
}

/// On-disk profile schema
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileFile {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "defaultMode", default)]
    default_mode: PermissionMode,
    #[serde(default)]
    tools: ToolsConfig,
    permissions: Option<PermissionRules>,
    session_workspace: Option<SessionWorkspaceTemplate>,
}

impl ProfileFile {
    fn into_profile(self, kind: ProfileKind, path: &Path) -> GuardResult<PermissionProfile> {
        let rules = match (kind, self.permissions, self.session_workspace) {
            (_, Some(_), Some(_)) => {
                return Err(GuardError::invalid_profile(
                    path,
                    "only one of `permissions` and `session_workspace` may be set",
                ))
            }
            (ProfileKind::System, Some(rules), None) => ProfileRules::Static(rules),
            (ProfileKind::User, None, Some(template)) => ProfileRules::SessionTemplate(template),
            (ProfileKind::System, _, _) => {
                return Err(GuardError::invalid_profile(
                    path,
                    "system profile requires a `permissions` section",
                ))
            }
            (ProfileKind::User, _, _) => {
                return Err(GuardError::invalid_profile(
                    path,
                    "user profile requires a `session_workspace` section",
                ))
            }
        };

        if self.name.trim().is_empty() {
            return Err(GuardError::invalid_profile(path, "profile name is empty"));
        }

        Ok(PermissionProfile {
            name: self.name,
            description: self.description,
            mode: self.default_mode,
            tools: self.tools,
            rules,
            source: None,
        })
    }
}

/// Backing store for the system and user profile files
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// Create a store reading `system.*` and `user.*` from a directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical expected location of a profile (used in error messages)
    pub fn expected_path(&self, kind: ProfileKind) -> PathBuf {
        self.dir.join(format!("{}.yaml", kind.file_stem()))
    }

    /// Locate a profile source, trying each accepted extension in turn
    pub fn find(&self, kind: ProfileKind) -> Option<PathBuf> {
        PROFILE_EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", kind.file_stem(), ext)))
            .find(|p| p.is_file())
    }

    /// Load both profiles. Fails if either source is absent.
    pub fn load(&self) -> GuardResult<(PermissionProfile, PermissionProfile)> {
        let (Some(system_path), Some(user_path)) =
            (self.find(ProfileKind::System), self.find(ProfileKind::User))
        else {
            tracing::error!(
                "Permission profiles missing in {} (system and user are both required)",
                self.dir.display()
            );
            return Err(GuardError::ProfileNotFound {
                system: self.expected_path(ProfileKind::System),
                user: self.expected_path(ProfileKind::User),
            });
        };

        let system = PermissionProfile::from_path(&system_path, ProfileKind::System)?;
        let user = PermissionProfile::from_path(&user_path, ProfileKind::User)?;

        tracing::info!(
            "Loaded permission profiles: system='{}' ({}), user='{}' ({})",
            system.name,
            system_path.display(),
            user.name,
            user_path.display()
        );

        Ok((system, user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SYSTEM_YAML: &str = r#"
name: system
description: Lifecycle operations
defaultMode: default
tools:
  enabled: [Read, Write, Bash]
  disabled: [WebSearch]
  permission_checked: [Bash]
permissions:
  allow: ["Read(./**)", "Bash(git status)"]
  deny: ["Read(**/.env*)"]
"#;

    const USER_YAML: &str = r#"
name: user
defaultMode: default
tools:
  enabled: [Read]
  permission_checked: [Read]
session_workspace:
  allow: ["Read({workspace}/**)", "Write({workspace}/out/{session_id}.md)"]
  deny: ["Read({workspace}/secrets/**)"]
  allowed_dirs: ["{workspace}"]
"#;

    fn session() -> SessionContext {
        SessionContext::new("abc", "sessions/abc", "/srv/sessions/abc/workspace").unwrap()
    }

    #[test]
    fn test_parse_system_profile() {
        let profile = PermissionProfile::parse(
            SYSTEM_YAML,
            ProfileFormat::Yaml,
            ProfileKind::System,
            Path::new("system.yaml"),
        )
        .unwrap();

        assert_eq!(profile.name, "system");
        assert_eq!(profile.mode, PermissionMode::Default);
        assert_eq!(profile.allow_count(), 2);
        assert_eq!(profile.deny_count(), 1);
        assert!(!profile.is_template());
    }

    #[test]
    fn test_tools_gate_disabled_wins() {
        let tools = ToolsConfig {
            enabled: ["Bash".to_string(), "Read".to_string()].into(),
            disabled: ["Bash".to_string()].into(),
            permission_checked: ["Read".to_string()].into(),
        };
        assert_eq!(tools.gate("Bash"), ToolGate::Disabled);
        assert_eq!(tools.gate("Read"), ToolGate::Checked);
        assert_eq!(tools.gate("Grep"), ToolGate::Checked);

        let open = ToolsConfig {
            enabled: ["TodoWrite".to_string()].into(),
            ..Default::default()
        };
        assert_eq!(open.gate("TodoWrite"), ToolGate::Enabled);
    }

    #[test]
    fn test_user_template_substitution() {
        let profile = PermissionProfile::parse(
            USER_YAML,
            ProfileFormat::Yaml,
            ProfileKind::User,
            Path::new("user.yaml"),
        )
        .unwrap();
        assert!(profile.static_rules().is_none());

        let resolved = profile.for_session(&session());
        let rules = resolved.static_rules().unwrap();
        assert_eq!(rules.allow[0], "Read(/srv/sessions/abc/workspace/**)");
        assert_eq!(rules.allow[1], "Write(/srv/sessions/abc/workspace/out/abc.md)");
        assert_eq!(rules.deny[0], "Read(/srv/sessions/abc/workspace/secrets/**)");
        assert_eq!(rules.allowed_dirs, vec!["/srv/sessions/abc/workspace"]);
    }

    #[test]
    fn test_wrong_section_for_kind_rejected() {
        let err = PermissionProfile::parse(
            USER_YAML,
            ProfileFormat::Yaml,
            ProfileKind::System,
            Path::new("system.yaml"),
        )
        .unwrap_err();
        assert!(matches!(err, GuardError::InvalidProfile { .. }));
    }

    #[test]
    fn test_both_sections_rejected() {
        let json = r#"{
            "name": "odd",
            "permissions": {"allow": []},
            "session_workspace": {"allow": []}
        }"#;
        let err = PermissionProfile::parse(
            json,
            ProfileFormat::Json,
            ProfileKind::System,
            Path::new("system.json"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("only one of"));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let yaml = "name: x\npermissions:\n  allow: []\n  alow: []\n";
        let result = PermissionProfile::parse(
            yaml,
            ProfileFormat::Yaml,
            ProfileKind::System,
            Path::new("system.yaml"),
        );
        assert!(matches!(result, Err(GuardError::Yaml(_))));
    }

    #[test]
    fn test_relative_workspace_rejected() {
        let err = SessionContext::new("abc", "ws", "relative/ws").unwrap_err();
        assert!(matches!(err, GuardError::InvalidSession(_)));
    }

    #[test]
    fn test_store_missing_profile_names_both_sources() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("system.yaml"), SYSTEM_YAML).unwrap();

        let store = ProfileStore::new(dir.path());
        match store.load() {
            Err(GuardError::ProfileNotFound { system, user }) => {
                assert_eq!(system, dir.path().join("system.yaml"));
                assert_eq!(user, dir.path().join("user.yaml"));
            }
            other => panic!("expected ProfileNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_store_accepts_json_and_yaml() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("system.yaml"), SYSTEM_YAML).unwrap();
        fs::write(
            dir.path().join("user.json"),
            r#"{"name": "user", "session_workspace": {"allow": ["Read({workspace}/**)"]}}"#,
        )
        .unwrap();

        let (system, user) = ProfileStore::new(dir.path()).load().unwrap();
        assert_eq!(system.source, Some(dir.path().join("system.yaml")));
        assert_eq!(user.source, Some(dir.path().join("user.json")));
        assert!(user.is_template());
    }
}
