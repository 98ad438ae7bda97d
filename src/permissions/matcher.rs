//! Rule pattern matching
//!
//! Every attempted tool invocation is rendered as a canonical *tool-call
//! string* (`Read(./src/main.rs)`, `Bash(git status)`) and matched against
//! rule patterns of the form `Tool` or `Tool(arg-pattern)`.
//!
//! Matching depends on the tool:
//! - file tools resolve both sides to absolute paths and compare by
//!   component-wise containment, so `./skills-extra` never matches `./skills/**`
//! - `Bash` compares whitespace-separated tokens and refuses compound commands
//! - everything else is a plain glob match on the whole call string

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use path_clean::PathClean;
use serde_json::Value;

use super::profile::{PermissionMode, PermissionRules};

/// Tools whose argument is a filesystem path
pub const FILE_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "MultiEdit",
    "Glob",
    "Grep",
    "NotebookEdit",
];

/// Shell command tool name
pub const BASH_TOOL: &str = "Bash";

/// Sequences that chain, pipe or substitute shell commands
pub const SHELL_CHAIN_TOKENS: &[&str] = &["&&", "||", ";", "|", "`", "$(", "&", "\n"];

/// Ordered candidate input keys per tool
const TOOL_INPUT_KEYS: &[(&str, &[&str])] = &[
    ("Read", &["file_path", "path"]),
    ("Write", &["file_path", "path"]),
    ("Edit", &["file_path", "path"]),
    ("MultiEdit", &["file_path", "path"]),
    ("NotebookEdit", &["notebook_path"]),
    ("Glob", &["path", "pattern"]),
    ("Grep", &["path"]),
    ("Bash", &["command"]),
    ("WebFetch", &["url"]),
    ("WebSearch", &["query"]),
    ("Task", &["subagent_type"]),
    ("Skill", &["skill"]),
];

/// Outcome of evaluating one call against a rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleVerdict {
    Allow,
    Deny,
    Ask,
    /// No rule matched
    Unmatched,
}

impl RuleVerdict {
    /// Resolve `Unmatched` according to the profile mode
    pub fn resolve(self, mode: PermissionMode) -> RuleVerdict {
        match self {
            RuleVerdict::Unmatched if mode.bypasses_checks() => RuleVerdict::Allow,
            RuleVerdict::Unmatched => RuleVerdict::Deny,
            other => other,
        }
    }
}

pub fn is_file_tool(tool_name: &str) -> bool {
    FILE_TOOLS.contains(&tool_name)
}

/// Whether a shell command chains, pipes or substitutes other commands
pub fn is_compound_command(command: &str) -> bool {
    SHELL_CHAIN_TOKENS.iter().any(|t| command.contains(t))
}

/// Build the canonical tool-call string for a tool invocation
pub fn tool_call_string(tool_name: &str, input: &Value) -> String {
    let keys = TOOL_INPUT_KEYS
        .iter()
        .find(|(name, _)| *name == tool_name)
        .map(|(_, keys)| *keys)
        .unwrap_or(&[]);

    for key in keys {
        match input.get(*key) {
            None | Some(Value::Null) => continue,
            Some(Value::String(s)) => return format!("{}({})", tool_name, s),
            Some(other) => return format!("{}({})", tool_name, other),
        }
    }

    tool_name.to_string()
}

/// Split `Tool(arg)` into its tool name and argument
pub fn split_call(call: &str) -> (&str, Option<&str>) {
    let call = call.trim();
    match call.find('(') {
        Some(open) if call.ends_with(')') => (&call[..open], Some(&call[open + 1..call.len() - 1])),
        _ => (call, None),
    }
}

fn has_glob_chars(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(candidate),
        Err(_) => pattern == candidate,
    }
}

fn looks_like_path(token: &str) -> bool {
    token.contains("./") || token.contains('/') || token.contains("**")
}

/// Path pattern split into a literal directory prefix and a glob remainder
#[derive(Debug)]
enum PathPattern<'a> {
    /// Literal path: matches itself and anything below it
    Literal,
    /// `dir/**`: the whole subtree
    Subtree,
    /// `dir/*.ext`: direct children whose name matches
    Children(&'a str),
    /// `dir/**/*.ext`: any descendant whose name matches
    Descendants(&'a str),
    /// Anything else, matched as a full-path glob
    Complex(Vec<&'a str>),
}

fn split_path_pattern(pattern: &str) -> (Option<String>, PathPattern<'_>) {
    let segments: Vec<&str> = pattern.split('/').collect();
    let idx = segments
        .iter()
        .position(|s| has_glob_chars(s))
        .unwrap_or(segments.len());

    let mut prefix = segments[..idx].join("/");
    if prefix.is_empty() && pattern.starts_with('/') {
        prefix = "/".to_string();
    }
    let prefix = (!prefix.is_empty()).then_some(prefix);

    let rest = &segments[idx..];
    let kind = match rest {
        [] => PathPattern::Literal,
        ["**"] => PathPattern::Subtree,
        [name] => PathPattern::Children(*name),
        ["**", name] if !name.contains("**") => PathPattern::Descendants(*name),
        _ => PathPattern::Complex(rest.to_vec()),
    };
    (prefix, kind)
}

/// Matches tool-call strings against rule patterns
///
/// Relative paths resolve against the session workspace when one is set,
/// otherwise against the process default base.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    base_dir: Option<PathBuf>,
    default_base: PathBuf,
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternMatcher {
    /// Create a matcher resolving against the current directory
    pub fn new() -> Self {
        let default_base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        Self::with_default_base(default_base)
    }

    /// Create a matcher with an explicit default base
    pub fn with_default_base(default_base: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: None,
            default_base: default_base.into(),
        }
    }

    /// Set (or clear) the session workspace base
    pub fn set_base_dir(&mut self, base_dir: Option<PathBuf>) {
        self.base_dir = base_dir;
    }

    /// Directory relative paths currently resolve against
    pub fn base_dir(&self) -> &Path {
        self.base_dir.as_deref().unwrap_or(&self.default_base)
    }

    pub fn has_session_base(&self) -> bool {
        self.base_dir.is_some()
    }

    /// Resolve a path argument to a lexically normalised absolute path
    pub fn resolve_path(&self, arg: &str) -> PathBuf {
        let path = Path::new(arg.trim());
        if path.is_absolute() {
            path.clean()
        } else {
            self.base_dir().join(path).clean()
        }
    }

    /// Whether `call` matches a single rule `pattern`
    pub fn matches(&self, call: &str, pattern: &str) -> bool {
        let (call_tool, call_arg) = split_call(call);
        let (pattern_tool, pattern_arg) = split_call(pattern);

        let Some(pattern_arg) = pattern_arg else {
            return glob_match(pattern_tool, call_tool);
        };

        if pattern_tool != call_tool {
            return false;
        }
        let Some(call_arg) = call_arg else {
            return false;
        };

        if is_file_tool(call_tool) {
            self.path_matches(call_arg, pattern_arg)
        } else if call_tool == BASH_TOOL {
            self.command_matches(call_arg, pattern_arg)
        } else {
            let normalized = pattern.trim().replace(":*", "*").replace("**", "*");
            glob_match(&normalized, call.trim())
        }
    }

    /// Whether a path argument falls under a path pattern
    pub fn path_matches(&self, path_arg: &str, pattern_arg: &str) -> bool {
        let target = self.resolve_path(path_arg);
        let (prefix, kind) = split_path_pattern(pattern_arg.trim());
        let prefix = prefix.map(|p| self.resolve_path(&p));
        let contained = |p: &Path| prefix.as_ref().map_or(true, |dir| p.starts_with(dir));
        let file_name = || target.file_name().and_then(|n| n.to_str()).unwrap_or("");

        match kind {
            PathPattern::Literal | PathPattern::Subtree => contained(&target),
            PathPattern::Children(name) => {
                let parent_ok = match (&prefix, target.parent()) {
                    (Some(dir), Some(parent)) => parent == dir.as_path(),
                    (None, Some(_)) => true,
                    (_, None) => false,
                };
                parent_ok && glob_match(name, file_name())
            }
            PathPattern::Descendants(name) => contained(&target) && glob_match(name, file_name()),
            PathPattern::Complex(rest) => {
                let base = prefix.unwrap_or_else(|| PathBuf::from("/"));
                let full = base.join(rest.join("/"));
                let options = MatchOptions {
                    require_literal_separator: true,
                    ..MatchOptions::new()
                };
                Pattern::new(&full.to_string_lossy())
                    .map(|p| p.matches_path_with(&target, options))
                    .unwrap_or(false)
            }
        }
    }

    /// Whether a shell command matches a command pattern
    pub fn command_matches(&self, command: &str, pattern_arg: &str) -> bool {
        if is_compound_command(command) {
            return false;
        }

        let normalized = pattern_arg.replace(":*", " *");
        let pattern_tokens: Vec<&str> = normalized.split_whitespace().collect();
        let command_tokens: Vec<&str> = command.split_whitespace().collect();

        match (pattern_tokens.first(), command_tokens.first()) {
            (Some(&"*"), Some(_)) if pattern_tokens.len() == 1 => return true,
            (Some(p), Some(c)) if glob_match(p, c) => {}
            _ => return false,
        }

        if let Some(second) = pattern_tokens.get(1).filter(|t| looks_like_path(t)) {
            return match command_tokens.get(1) {
                Some(path) => {
                    self.path_matches(path, second)
                        && args_match(&pattern_tokens[2..], &command_tokens[2..])
                }
                None => false,
            };
        }

        args_match(&pattern_tokens[1..], &command_tokens[1..])
    }

    /// Whether a file-tool argument lies inside one of `allowed_dirs`
    pub fn within_allowed_dirs(&self, path_arg: &str, allowed_dirs: &[String]) -> bool {
        let target = self.resolve_path(path_arg);
        allowed_dirs.iter().any(|dir| {
            let dir = dir.trim().trim_end_matches("/**");
            let dir = if dir.is_empty() { "/" } else { dir };
            target.starts_with(self.resolve_path(dir))
        })
    }

    /// Checks that deny a call whatever the tool gate or rule lists say:
    /// compound `Bash` commands and file paths outside `allowed_dirs`.
    pub fn always_denied(&self, call: &str, rules: &PermissionRules) -> bool {
        let (tool, arg) = split_call(call);

        if tool == BASH_TOOL && arg.is_some_and(is_compound_command) {
            tracing::debug!("Rejecting compound command: {}", call);
            return true;
        }

        if is_file_tool(tool) && !rules.allowed_dirs.is_empty() {
            if let Some(arg) = arg {
                if !self.within_allowed_dirs(arg, &rules.allowed_dirs) {
                    tracing::debug!("Path outside allowed directories: {}", call);
                    return true;
                }
            }
        }

        false
    }

    /// Evaluate a call against a rule set.
    ///
    /// Order: [`always_denied`](Self::always_denied), then the first matching
    /// allow rule, deny rule, ask rule.
    pub fn evaluate(&self, call: &str, rules: &PermissionRules) -> RuleVerdict {
        if self.always_denied(call, rules) {
            return RuleVerdict::Deny;
        }

        if let Some(rule) = rules.allow.iter().find(|p| self.matches(call, p)) {
            tracing::debug!("{} allowed by rule {}", call, rule);
            return RuleVerdict::Allow;
        }
        if let Some(rule) = rules.deny.iter().find(|p| self.matches(call, p)) {
            tracing::debug!("{} denied by rule {}", call, rule);
            return RuleVerdict::Deny;
        }
        if rules.ask.iter().any(|p| self.matches(call, p)) {
            return RuleVerdict::Ask;
        }

        RuleVerdict::Unmatched
    }
}

/// Match remaining argument tokens; a trailing `*` accepts any arguments
fn args_match(pattern: &[&str], command: &[&str]) -> bool {
    for (i, token) in pattern.iter().enumerate() {
        if *token == "*" && i == pattern.len() - 1 {
            return true;
        }
        match command.get(i) {
            Some(arg) if glob_match(token, arg) => {}
            _ => return false,
        }
    }
    pattern.len() == command.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn matcher() -> PatternMatcher {
        PatternMatcher::with_default_base("/srv/app")
    }

    fn rules(allow: &[&str], deny: &[&str], ask: &[&str]) -> PermissionRules {
        PermissionRules {
            allow: allow.iter().map(|s| s.to_string()).collect(),
            deny: deny.iter().map(|s| s.to_string()).collect(),
            ask: ask.iter().map(|s| s.to_string()).collect(),
            allowed_dirs: Vec::new(),
        }
    }

    #[test]
    fn test_tool_call_string() {
        assert_eq!(
            tool_call_string("Read", &json!({"file_path": "./a/b.py"})),
            "Read(./a/b.py)"
        );
        assert_eq!(
            tool_call_string("Read", &json!({"path": "./a"})),
            "Read(./a)"
        );
        assert_eq!(
            tool_call_string("Bash", &json!({"command": "git status", "timeout": 5})),
            "Bash(git status)"
        );
        assert_eq!(tool_call_string("Bash", &json!({})), "Bash");
        assert_eq!(tool_call_string("TodoWrite", &json!({"todos": []})), "TodoWrite");
        assert_eq!(tool_call_string("Task", &json!({"subagent_type": 3})), "Task(3)");
    }

    #[test]
    fn test_split_call() {
        assert_eq!(split_call("Read(./a)"), ("Read", Some("./a")));
        assert_eq!(split_call("Bash"), ("Bash", None));
        assert_eq!(split_call("Bash(echo (x))"), ("Bash", Some("echo (x)")));
        assert_eq!(split_call("Weird(open"), ("Weird(open", None));
    }

    #[test]
    fn test_tool_name_only_pattern() {
        let m = matcher();
        assert!(m.matches("Read(./a.txt)", "Read"));
        assert!(m.matches("mcp__github__list", "mcp__*"));
        assert!(!m.matches("Write(./a.txt)", "Read"));
    }

    #[test]
    fn test_subtree_pattern() {
        let m = matcher();
        assert!(m.matches("Read(./workspace/a/b.py)", "Read(./workspace/**)"));
        assert!(m.matches("Read(/srv/app/workspace/x)", "Read(./workspace/**)"));
        assert!(!m.matches("Read(./other/x)", "Read(./workspace/**)"));
        assert!(!m.matches("Write(./workspace/x)", "Read(./workspace/**)"));
    }

    #[test]
    fn test_no_prefix_confusion() {
        let m = matcher();
        assert!(!m.matches("Read(./skills-extra/x.md)", "Read(./skills/**)"));
        assert!(m.matches("Read(./skills/x.md)", "Read(./skills/**)"));
    }

    #[test]
    fn test_parent_traversal_is_resolved() {
        let m = matcher();
        assert!(!m.matches("Read(./workspace/../etc/passwd)", "Read(./workspace/**)"));
        assert!(m.matches("Read(./other/../workspace/a)", "Read(./workspace/**)"));
    }

    #[test]
    fn test_file_glob_patterns() {
        let m = matcher();
        assert!(m.matches("Edit(./src/lib.rs)", "Edit(./src/*.rs)"));
        assert!(!m.matches("Edit(./src/nested/lib.rs)", "Edit(./src/*.rs)"));
        assert!(!m.matches("Edit(./src/lib.py)", "Edit(./src/*.rs)"));
        assert!(m.matches("Edit(./src/nested/lib.rs)", "Edit(./src/**/*.rs)"));
        assert!(m.matches("Read(/anywhere/.env.local)", "Read(**/.env*)"));
        assert!(!m.matches("Read(/anywhere/env)", "Read(**/.env*)"));
    }

    #[test]
    fn test_session_base_resolution() {
        let mut m = matcher();
        m.set_base_dir(Some(PathBuf::from("/sessions/s1/workspace")));
        assert!(m.matches(
            "Write(notes.md)",
            "Write(/sessions/s1/workspace/**)"
        ));
        m.set_base_dir(None);
        assert!(!m.matches(
            "Write(notes.md)",
            "Write(/sessions/s1/workspace/**)"
        ));
    }

    #[test]
    fn test_bash_exact_and_wildcards() {
        let m = matcher();
        assert!(m.matches("Bash(git status)", "Bash(git status)"));
        assert!(!m.matches("Bash(git push)", "Bash(git status)"));
        assert!(m.matches("Bash(ls -la)", "Bash(ls *)"));
        assert!(m.matches("Bash(ls)", "Bash(ls *)"));
        assert!(m.matches("Bash(npm run build)", "Bash(npm run:*)"));
        assert!(!m.matches("Bash(npm install x)", "Bash(npm run:*)"));
        assert!(m.matches("Bash(python3)", "Bash(python*)"));
        assert!(!m.matches("Bash(python3 x.py)", "Bash(python*)"));
        assert!(m.matches("Bash(anything at all)", "Bash(*)"));
    }

    #[test]
    fn test_bash_path_argument() {
        let m = matcher();
        assert!(m.matches("Bash(cat ./workspace/a.txt)", "Bash(cat ./workspace/**)"));
        assert!(!m.matches("Bash(cat /etc/shadow)", "Bash(cat ./workspace/**)"));
        assert!(!m.matches("Bash(cat)", "Bash(cat ./workspace/**)"));
    }

    #[test]
    fn test_compound_commands_always_denied() {
        let m = matcher();
        let r = rules(&["Bash(ls *)", "Bash(*)", "Bash"], &[], &[]);
        for cmd in [
            "ls && rm -rf /",
            "ls || true",
            "ls; rm x",
            "ls | sh",
            "ls `whoami`",
            "ls $(whoami)",
            "ls & rm x",
        ] {
            let call = format!("Bash({})", cmd);
            assert_eq!(m.evaluate(&call, &r), RuleVerdict::Deny, "{}", cmd);
        }
        assert_eq!(m.evaluate("Bash(ls -la)", &r), RuleVerdict::Allow);
    }

    #[test]
    fn test_generic_glob() {
        let m = matcher();
        assert!(m.matches(
            "WebFetch(https://docs.rs/serde)",
            "WebFetch(https://docs.rs/**)"
        ));
        assert!(m.matches("Skill(pdf:extract)", "Skill(pdf:*)"));
        assert!(!m.matches("WebFetch(https://evil.test/x)", "WebFetch(https://docs.rs/*)"));
    }

    #[test]
    fn test_allow_wins_over_deny() {
        let m = matcher();
        let r = rules(&["Read(./workspace/**)"], &["Read(**/.env*)"], &[]);
        // The broad allow shadows the narrower deny.
        assert_eq!(m.evaluate("Read(./workspace/.env)", &r), RuleVerdict::Allow);
        assert_eq!(m.evaluate("Read(./elsewhere/.env)", &r), RuleVerdict::Deny);
    }

    #[test]
    fn test_ask_and_unmatched() {
        let m = matcher();
        let r = rules(&[], &["Bash(rm *)"], &["Bash(git push:*)"]);
        assert_eq!(m.evaluate("Bash(git push origin)", &r), RuleVerdict::Ask);
        assert_eq!(m.evaluate("Bash(rm -rf x)", &r), RuleVerdict::Deny);
        assert_eq!(m.evaluate("Bash(whoami)", &r), RuleVerdict::Unmatched);
        assert_eq!(
            RuleVerdict::Unmatched.resolve(PermissionMode::Default),
            RuleVerdict::Deny
        );
        assert_eq!(
            RuleVerdict::Unmatched.resolve(PermissionMode::BypassPermissions),
            RuleVerdict::Allow
        );
        assert_eq!(
            RuleVerdict::Ask.resolve(PermissionMode::BypassPermissions),
            RuleVerdict::Ask
        );
    }

    #[test]
    fn test_allowed_dirs_confinement() {
        let m = matcher();
        let mut r = rules(&["Read"], &[], &[]);
        r.allowed_dirs = vec!["./skills".to_string(), "/data/shared/**".to_string()];

        assert_eq!(m.evaluate("Read(./skills/a.md)", &r), RuleVerdict::Allow);
        assert_eq!(m.evaluate("Read(/data/shared/x)", &r), RuleVerdict::Allow);
        assert_eq!(m.evaluate("Read(./skills-extra/a.md)", &r), RuleVerdict::Deny);
        assert_eq!(m.evaluate("Read(/etc/passwd)", &r), RuleVerdict::Deny);
    }
}
