//! `shadow-sandbox` diagnostic CLI
//!
//! ```text
//! shadow-sandbox check <tool> <json-input> [--user <workspace>]
//! shadow-sandbox bwrap <workspace> [--net] -- <command...>
//! shadow-sandbox patterns
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use colored::*;

use shadow_sandbox::logging;
use shadow_sandbox::permissions::{PermissionCallback, ToolBehavior};
use shadow_sandbox::sandbox::{build_sandbox_command, validate_mount_sources, SandboxConfig};
use shadow_sandbox::GuardConfig;

const USAGE: &str = "\
Usage:
  shadow-sandbox check <tool> <json-input> [--user <workspace>]
  shadow-sandbox bwrap <workspace> [--net] -- <command...>
  shadow-sandbox patterns";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Before from_env, which logs the settings it reads
    let _guard = logging::init_logging(&GuardConfig::log_dir_from_env())?;
    let config = GuardConfig::from_env().context("Invalid configuration")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        eprintln!("{}", USAGE);
        return Ok(ExitCode::from(2));
    };

    match command.as_str() {
        "check" => check(&config, rest),
        "bwrap" => bwrap(rest),
        "patterns" => patterns(&config),
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(ExitCode::SUCCESS)
        }
        other => {
            eprintln!("{} unknown command '{}'\n\n{}", "Error:".red().bold(), other, USAGE);
            Ok(ExitCode::from(2))
        }
    }
}

/// Decide one tool call and print the verdict
fn check(config: &GuardConfig, args: &[String]) -> Result<ExitCode> {
    let (tool, input, workspace) = match args {
        [tool, input] => (tool, input, None),
        [tool, input, flag, workspace] if flag == "--user" => (tool, input, Some(workspace)),
        _ => bail!("expected: check <tool> <json-input> [--user <workspace>]"),
    };

    let input: serde_json::Value =
        serde_json::from_str(input).context("Tool input is not valid JSON")?;

    let mut manager = config.profile_manager().context("Failed to load profiles")?;
    if let Some(workspace) = workspace {
        let abs = absolute(Path::new(workspace))?;
        manager.set_session_context("cli", workspace, &abs)?;
        manager.activate_user();
    }
    let profile = manager.active_profile().name.clone();

    let mut callback =
        PermissionCallback::new(Arc::new(manager), config.pattern_store(), config.denial_tracker());
    let decision = callback.check(tool, &input);

    let verdict = match decision.behavior {
        ToolBehavior::Allow => "ALLOW".green().bold(),
        ToolBehavior::Deny => "DENY".red().bold(),
        ToolBehavior::Ask => "ASK".yellow().bold(),
    };
    println!("{} {} {}", verdict, tool.cyan(), format!("[{}]", profile).dimmed());
    if let Some(reason) = &decision.reason {
        println!("  {}", reason);
    }
    if decision.interrupt {
        println!("  {}", "run would be interrupted".red());
    }

    Ok(match decision.behavior {
        ToolBehavior::Allow => ExitCode::SUCCESS,
        ToolBehavior::Deny => ExitCode::from(1),
        ToolBehavior::Ask => ExitCode::from(3),
    })
}

/// Print the sandbox invocation for a command in a workspace
fn bwrap(args: &[String]) -> Result<ExitCode> {
    let Some(sep) = args.iter().position(|a| a == "--") else {
        bail!("expected: bwrap <workspace> [--net] -- <command...>");
    };
    let (options, command) = (&args[..sep], &args[sep + 1..]);
    let (workspace, allow_network) = match options {
        [workspace] => (workspace, false),
        [workspace, flag] if flag == "--net" => (workspace, true),
        _ => bail!("expected: bwrap <workspace> [--net] -- <command...>"),
    };

    let workspace = absolute(Path::new(workspace))?;
    let mut sandbox = SandboxConfig::for_session(&workspace);
    if let Ok(tool) = which::which("bwrap") {
        sandbox = sandbox.with_tool_path(tool);
    }

    let missing = validate_mount_sources(&sandbox);
    for path in &missing {
        eprintln!("{} mount source missing: {}", "Warning:".yellow().bold(), path.display());
    }

    let argv = build_sandbox_command(&sandbox, command, allow_network)?;
    println!("{}", argv.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "));

    Ok(if missing.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Load the dangerous-pattern corpus and verify every rule catches its exploit
fn patterns(config: &GuardConfig) -> Result<ExitCode> {
    let store = config.pattern_store();
    let loaded = store
        .load(false)
        .with_context(|| format!("Failed to load {}", config.patterns_dir.display()))?;

    for (source, count) in store.sources()? {
        println!("{} {}", source.cyan(), format!("({} patterns)", count).dimmed());
    }

    let broken: Vec<_> = loaded
        .iter()
        .filter(|p| !p.is_match(p.test_exploit()))
        .collect();
    for pattern in &broken {
        println!(
            "  {} {} does not match {:?}",
            "FAIL".red().bold(),
            pattern.as_str(),
            pattern.test_exploit()
        );
    }

    if broken.is_empty() {
        println!("{} {} patterns verified", "OK".green().bold(), loaded.len());
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Cannot determine current directory")?;
    Ok(cwd.join(path))
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
