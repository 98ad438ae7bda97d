//! Per-command sandbox invocation builder

use std::path::PathBuf;

use crate::core::{GuardError, GuardResult};

use super::config::SandboxConfig;

/// Wrap `command` in a sandbox-tool invocation
///
/// The network namespace is shared only when `allow_network` is set and the
/// config has network sandboxing enabled.
pub fn build_sandbox_command(
    config: &SandboxConfig,
    command: &[String],
    allow_network: bool,
) -> GuardResult<Vec<String>> {
    if command.is_empty() {
        return Err(GuardError::InvalidToolInput(
            "cannot sandbox an empty command".into(),
        ));
    }

    if !config.enabled() {
        tracing::warn!("Sandbox disabled, running command unwrapped: {:?}", command);
        return Ok(command.to_vec());
    }

    for mount in config.mounts() {
        mount.validate()?;
    }

    let mut args = vec![config.tool_path().to_string_lossy().into_owned()];

    // Namespaces
    let namespaces = config.namespaces();
    if namespaces.is_all() {
        args.push("--unshare-all".into());
    } else {
        if namespaces.pid {
            args.push("--unshare-pid".into());
        }
        if namespaces.ipc {
            args.push("--unshare-ipc".into());
        }
        if namespaces.uts {
            args.push("--unshare-uts".into());
        }
    }
    args.push("--die-with-parent".into());
    args.push("--new-session".into());

    let share_net = allow_network && config.network_sandboxing_enabled();
    args.push(if share_net { "--share-net" } else { "--unshare-net" }.into());

    // Filesystem
    if config.empty_root() {
        args.extend(["--tmpfs".to_string(), "/".to_string()]);
    }
    if let Some(size_mb) = config.tmpfs_size_mb() {
        let bytes = u64::from(size_mb) * 1024 * 1024;
        args.extend(["--size".to_string(), bytes.to_string()]);
    }
    args.extend(["--tmpfs".to_string(), "/tmp".to_string()]);

    for mount in config.mounts() {
        args.push(mount.mode.bind_flag().into());
        args.push(mount.source.to_string_lossy().into_owned());
        args.push(mount.target.to_string_lossy().into_owned());
    }

    args.extend(["--proc".to_string(), "/proc".to_string()]);
    args.extend(["--dev".to_string(), "/dev".to_string()]);

    // Environment
    let env = config.env();
    if env.clear_env {
        args.push("--clearenv".into());
        args.extend(["--setenv".to_string(), "HOME".to_string(), env.home.clone()]);
        args.extend(["--setenv".to_string(), "PATH".to_string(), env.path.clone()]);
    }
    for (key, value) in &env.extra {
        args.extend(["--setenv".to_string(), key.clone(), value.clone()]);
    }

    if let Some(dir) = config.working_dir() {
        args.extend(["--chdir".to_string(), dir.to_string_lossy().into_owned()]);
    }

    args.push("--".into());
    args.extend(command.iter().cloned());

    tracing::debug!("Sandbox argv: {:?}", args);
    Ok(args)
}

/// Mount sources that do not exist on the host
pub fn validate_mount_sources(config: &SandboxConfig) -> Vec<PathBuf> {
    config
        .mounts()
        .iter()
        .filter(|m| !m.source.exists())
        .map(|m| m.source.clone())
        .collect()
}

/// Fail with [`GuardError::MountSourceMissing`] if any mount source is absent
pub fn ensure_mount_sources(config: &SandboxConfig) -> GuardResult<()> {
    let missing = validate_mount_sources(config);
    if missing.is_empty() {
        Ok(())
    } else {
        Err(GuardError::MountSourceMissing(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::config::{EnvPolicy, Namespaces, SandboxMount};
    use tempfile::TempDir;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn position(args: &[String], flag: &str) -> usize {
        args.iter()
            .position(|a| a == flag)
            .unwrap_or_else(|| panic!("{} missing from {:?}", flag, args))
    }

    #[test]
    fn test_network_denied() {
        let config = SandboxConfig::new().with_network_sandboxing(true);
        let args = build_sandbox_command(&config, &cmd(&["ls", "-la"]), false).unwrap();
        assert!(args.contains(&"--unshare-net".to_string()));
        assert!(!args.contains(&"--share-net".to_string()));
    }

    #[test]
    fn test_network_allowed() {
        let config = SandboxConfig::new();
        let args = build_sandbox_command(&config, &cmd(&["curl", "example.com"]), true).unwrap();
        assert!(args.contains(&"--share-net".to_string()));
        assert!(!args.contains(&"--unshare-net".to_string()));

        let config = SandboxConfig::new().with_network_sandboxing(false);
        let args = build_sandbox_command(&config, &cmd(&["curl", "example.com"]), true).unwrap();
        assert!(args.contains(&"--unshare-net".to_string()));
    }

    #[test]
    fn test_argv_layout() {
        let config = SandboxConfig::new()
            .with_empty_root(true)
            .with_tmpfs_size_mb(64)
            .with_mount(SandboxMount::ro("/usr", "/usr"))
            .with_mount(SandboxMount::rw("/data/ws", "/workspace"))
            .with_env_var("LANG", "C.UTF-8")
            .with_working_dir("/workspace");
        let args = build_sandbox_command(&config, &cmd(&["ls", "-la"]), false).unwrap();

        assert_eq!(args[0], "bwrap");
        assert_eq!(args[1], "--unshare-all");
        assert!(position(&args, "--tmpfs") < position(&args, "--ro-bind"));
        assert_eq!(args[position(&args, "--size") + 1], (64u64 * 1024 * 1024).to_string());
        let ro = position(&args, "--ro-bind");
        assert_eq!(&args[ro + 1..ro + 3], &["/usr".to_string(), "/usr".to_string()]);
        let rw = position(&args, "--bind");
        assert_eq!(
            &args[rw + 1..rw + 3],
            &["/data/ws".to_string(), "/workspace".to_string()]
        );
        assert!(position(&args, "--clearenv") < position(&args, "--setenv"));
        assert_eq!(args[position(&args, "--chdir") + 1], "/workspace");

        let sep = position(&args, "--");
        assert_eq!(&args[sep + 1..], &["ls".to_string(), "-la".to_string()]);
    }

    #[test]
    fn test_environment_is_exactly_home_and_path() {
        let config = SandboxConfig::new();
        let args = build_sandbox_command(&config, &cmd(&["env"]), false).unwrap();
        let vars: Vec<&str> = args
            .iter()
            .enumerate()
            .filter(|(_, a)| *a == "--setenv")
            .map(|(i, _)| args[i + 1].as_str())
            .collect();
        assert_eq!(vars, vec!["HOME", "PATH"]);
    }

    #[test]
    fn test_inherited_env_and_partial_namespaces() {
        let config = SandboxConfig::new()
            .with_env(EnvPolicy {
                clear_env: false,
                ..EnvPolicy::default()
            })
            .with_namespaces(Namespaces {
                pid: true,
                ipc: false,
                uts: true,
            });
        let args = build_sandbox_command(&config, &cmd(&["true"]), false).unwrap();
        assert!(!args.contains(&"--clearenv".to_string()));
        assert!(!args.contains(&"--unshare-all".to_string()));
        assert!(args.contains(&"--unshare-pid".to_string()));
        assert!(!args.contains(&"--unshare-ipc".to_string()));
        assert!(args.contains(&"--unshare-uts".to_string()));
    }

    #[test]
    fn test_unresolved_placeholder_rejected() {
        let config = SandboxConfig::new().with_mount(SandboxMount::rw("{workspace}", "/workspace"));
        assert!(matches!(
            build_sandbox_command(&config, &cmd(&["ls"]), false),
            Err(GuardError::InvalidMount(_))
        ));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(build_sandbox_command(&SandboxConfig::new(), &[], false).is_err());
    }

    #[test]
    fn test_disabled_passes_command_through() {
        let config = SandboxConfig::new().with_enabled(false);
        let args = build_sandbox_command(&config, &cmd(&["ls"]), false).unwrap();
        assert_eq!(args, cmd(&["ls"]));
    }

    #[test]
    fn test_missing_mount_sources() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let config = SandboxConfig::new()
            .with_mount(SandboxMount::ro(dir.path(), "/present"))
            .with_mount(SandboxMount::ro(&missing, "/absent"));

        assert_eq!(validate_mount_sources(&config), vec![missing.clone()]);
        match ensure_mount_sources(&config) {
            Err(GuardError::MountSourceMissing(paths)) => assert_eq!(paths, vec![missing]),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
