//! OS-level sandboxing
//!
//! Two granularities, both on top of bubblewrap:
//! - `build_sandbox_command`: wrap a single command
//! - `SandboxedProcessRunner`: wrap and supervise a whole agent process

mod command;
mod config;
mod process;
mod process_group;

pub use command::{build_sandbox_command, ensure_mount_sources, validate_mount_sources};
pub use config::{
    EnvPolicy, MountMode, Namespaces, SandboxConfig, SandboxMount, DEFAULT_SANDBOX_HOME,
    DEFAULT_SANDBOX_PATH, SYSTEM_RO_PATHS,
};
pub use process::{
    LineCallback, ProcessRunResult, RunnerMode, SandboxedProcessRunner, SandboxedRunParams,
    StreamKind, APP_MOUNT, DEFAULT_MAX_OUTPUT_BYTES, RESULT_ARTIFACT, SANDBOX_PARAMS_ENV,
    SANDBOX_WORKDIR, SESSION_MOUNT, SKILLS_MOUNT, TIMEOUT_EXIT_CODE,
};
pub use process_group::{kill_process_group, ProcessGroupGuard};
