//! Per-call permission callback
//!
//! The single entry point the tool runtime invokes before executing a tool.
//! Order of checks for one call:
//! 1. Sandbox-bypass flags in the input (security violation, interrupts)
//! 2. Run already interrupted
//! 3. Malformed input
//! 4. Dangerous command patterns (Bash only)
//! 5. Active profile rules

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::dangerous::DangerousPatternStore;
use super::manager::PermissionChecker;
use super::matcher::{is_compound_command, split_call, tool_call_string, RuleVerdict, BASH_TOOL};
use super::tracker::DenialTracker;

/// Input keys that ask for the sandbox to be switched off
pub const SANDBOX_BYPASS_KEYS: &[&str] = &[
    "dangerouslyDisableSandbox",
    "dangerously_disable_sandbox",
    "disable_sandbox",
    "bypass_sandbox",
];

/// What the runtime should do with a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolBehavior {
    Allow,
    Deny,
    /// Ask the human operator before executing
    Ask,
}

/// Decision returned for one tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDecision {
    pub behavior: ToolBehavior,
    pub reason: Option<String>,
    /// The runtime must stop the run after this call
    pub interrupt: bool,
}

impl ToolDecision {
    pub fn allow() -> Self {
        Self {
            behavior: ToolBehavior::Allow,
            reason: None,
            interrupt: false,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            behavior: ToolBehavior::Deny,
            reason: Some(reason.into()),
            interrupt: false,
        }
    }

    pub fn ask(reason: impl Into<String>) -> Self {
        Self {
            behavior: ToolBehavior::Ask,
            reason: Some(reason.into()),
            interrupt: false,
        }
    }

    pub fn with_interrupt(mut self, interrupt: bool) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.behavior == ToolBehavior::Allow
    }
}

/// Permission callback owned by one task execution
pub struct PermissionCallback {
    checker: Arc<dyn PermissionChecker>,
    patterns: Arc<DangerousPatternStore>,
    tracker: DenialTracker,
}

impl PermissionCallback {
    pub fn new(
        checker: Arc<dyn PermissionChecker>,
        patterns: Arc<DangerousPatternStore>,
        tracker: DenialTracker,
    ) -> Self {
        Self {
            checker,
            patterns,
            tracker,
        }
    }

    pub fn tracker(&self) -> &DenialTracker {
        &self.tracker
    }

    /// Reset denial state for a new run
    pub fn reset_run(&mut self) {
        self.tracker.clear();
    }

    /// Decide one tool call
    pub fn check(&mut self, tool_name: &str, tool_input: &Value) -> ToolDecision {
        let call = tool_call_string(tool_name, tool_input);

        if let Some(key) = bypass_flag(tool_input) {
            let message = format!(
                "Security violation: {} attempted to disable the sandbox via '{}'. \
                 The sandbox cannot be turned off from a tool call.",
                tool_name, key
            );
            tracing::error!("{} ({})", message, call);
            self.tracker.record_denial(tool_name, &call, &message, true);
            return ToolDecision::deny(message).with_interrupt(true);
        }

        if self.tracker.was_interrupted() {
            return ToolDecision::deny("The run was stopped after repeated denied tool calls.")
                .with_interrupt(true);
        }

        if !tool_input.is_object() {
            tracing::warn!("Malformed input for {}: {}", tool_name, tool_input);
            return self.deny(tool_name, &call, "Tool input could not be interpreted.".into());
        }

        if tool_name == BASH_TOOL {
            let (_, command) = split_call(&call);
            let command = command.unwrap_or_default();
            match self.patterns.find_match(command) {
                Ok(Some(pattern)) => {
                    tracing::warn!(
                        "Blocked dangerous command {:?} (rule {:?} from {})",
                        command,
                        pattern.as_str(),
                        pattern.origin_file()
                    );
                    return self.deny(
                        tool_name,
                        &call,
                        "This command matches a blocked dangerous-command rule.".into(),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Dangerous-pattern check unavailable: {}", e);
                    return self.deny(
                        tool_name,
                        &call,
                        "Shell commands cannot be checked right now.".into(),
                    );
                }
            }
        }

        match self.checker.decide(&call) {
            RuleVerdict::Allow => {
                tracing::debug!("Allowed {}", call);
                self.tracker.record_allow(tool_name);
                ToolDecision::allow()
            }
            RuleVerdict::Ask => {
                tracing::info!("{} requires confirmation", call);
                ToolDecision::ask(format!("{} requires confirmation.", call))
            }
            RuleVerdict::Deny | RuleVerdict::Unmatched => {
                let message = self.denial_message(tool_name, &call);
                self.deny(tool_name, &call, message)
            }
        }
    }

    fn deny(&mut self, tool_name: &str, call: &str, mut message: String) -> ToolDecision {
        let next = self.tracker.denial_count(tool_name) + 1;
        if next + 1 == self.tracker.threshold() {
            message.push_str(&format!(
                " One more denied {} call will stop the run.",
                tool_name
            ));
        }

        tracing::warn!("Denied {}: {}", call, message);
        let interrupt = self.tracker.record_denial(tool_name, call, &message, false);
        if interrupt {
            message.push_str(" Too many denied tool calls, stopping the run.");
        }
        ToolDecision::deny(message).with_interrupt(interrupt)
    }

    fn denial_message(&self, tool_name: &str, call: &str) -> String {
        let profile = self.checker.profile_name();

        if tool_name == BASH_TOOL {
            let (_, command) = split_call(call);
            if is_compound_command(command.unwrap_or_default()) {
                return "Chained or piped shell commands are not allowed. \
                        Run one command per call."
                    .to_string();
            }
        }

        let allowed = self.checker.allowed_patterns_for_tool(tool_name);
        if allowed.is_empty() {
            format!(
                "Permission denied: {} is not allowed in profile '{}'.",
                tool_name, profile
            )
        } else {
            format!(
                "Permission denied: {} is not allowed in profile '{}'. Allowed: {}.",
                call,
                profile,
                allowed.join(", ")
            )
        }
    }
}

impl std::fmt::Debug for PermissionCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCallback")
            .field("profile", &self.checker.profile_name())
            .field("tracker", &self.tracker)
            .finish()
    }
}

/// First bypass key set to anything but `false`/`null`
fn bypass_flag(input: &Value) -> Option<&'static str> {
    let object = input.as_object()?;
    SANDBOX_BYPASS_KEYS.iter().copied().find(|key| {
        object
            .get(*key)
            .is_some_and(|v| !matches!(v, Value::Null | Value::Bool(false)))
    })
}
