//! Renders a `SandboxConfig` into the invocation an isolation backend expects.
//!
//! The kernel only builds the command line; actually running it (and the OS
//! level isolation) belongs to the collaborator and the backend.

use crate::error::SandboxError;
use crate::manager::SandboxConfig;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::Path;

/// Read-only system directories mounted into bubblewrap sandboxes.
const SYSTEM_RO_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc/alternatives"];

/// Isolation backend to render for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationBackend {
    /// Linux bubblewrap.
    Bubblewrap,
    /// macOS `sandbox-exec` with a seatbelt profile.
    Seatbelt,
    /// No isolation: only cwd, environment and rlimits are applied.
    Direct,
}

impl IsolationBackend {
    /// The backend native to the current OS, if any.
    pub fn native() -> Result<Self, SandboxError> {
        if cfg!(target_os = "linux") {
            Ok(Self::Bubblewrap)
        } else if cfg!(target_os = "macos") {
            Ok(Self::Seatbelt)
        } else {
            Err(SandboxError::BackendUnavailable(
                "No isolation backend available on this OS".to_string(),
            ))
        }
    }
}

/// Full argv running `command` under `backend` with the config's limits.
pub fn wrap_command(
    config: &SandboxConfig,
    backend: IsolationBackend,
    command: &[OsString],
) -> Result<Vec<OsString>, SandboxError> {
    if command.is_empty() {
        return Err(SandboxError::BackendUnavailable("empty command".to_string()));
    }

    let mut limited = prlimit_prefix(config);
    limited.extend(command.iter().cloned());

    match backend {
        IsolationBackend::Direct => Ok(limited),
        IsolationBackend::Bubblewrap => {
            let mut argv = vec![OsString::from("bwrap")];
            argv.extend(bwrap_args(config));
            argv.push("--".into());
            argv.extend(limited);
            Ok(argv)
        }
        IsolationBackend::Seatbelt => {
            let mut argv: Vec<OsString> = vec!["sandbox-exec".into(), "-p".into()];
            argv.push(seatbelt_profile(config).into());
            argv.extend(command.iter().cloned());
            Ok(argv)
        }
    }
}

/// `prlimit` prefix applying the CPU and address-space ceilings.
pub fn prlimit_prefix(config: &SandboxConfig) -> Vec<OsString> {
    vec![
        "prlimit".into(),
        format!("--cpu={}", config.cpu_time_limit.as_secs().max(1)).into(),
        format!("--as={}", config.memory_limit_bytes).into(),
        "--".into(),
    ]
}

/// bubblewrap arguments (without the leading `bwrap`).
pub fn bwrap_args(config: &SandboxConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    let mut push = |items: &[&str]| args.extend(items.iter().map(OsString::from));

    push(&["--die-with-parent", "--new-session", "--unshare-pid", "--unshare-ipc"]);
    push(&["--proc", "/proc", "--dev", "/dev", "--tmpfs", "/tmp"]);
    for dir in SYSTEM_RO_DIRS {
        push(&["--ro-bind-try", dir, dir]);
    }

    let bind = if config.writable { "--bind" } else { "--ro-bind" };
    for path in &config.allowed_paths {
        args.push(bind.into());
        args.push(path.as_os_str().to_owned());
        args.push(path.as_os_str().to_owned());
    }

    // Later mounts shadow the binds above.
    for path in &config.masked_paths {
        let path = path.as_os_str();
        if Path::new(path).is_file() {
            args.extend(["--ro-bind".into(), "/dev/null".into(), path.to_owned()]);
        } else {
            args.extend(["--tmpfs".into(), path.to_owned(), "--remount-ro".into(), path.to_owned()]);
        }
    }

    if config.network_isolated {
        args.push("--unshare-net".into());
    }

    args.push("--clearenv".into());
    for (key, value) in &config.env {
        args.push("--setenv".into());
        args.push(key.into());
        args.push(value.into());
    }

    args.push("--chdir".into());
    args.push(config.working_dir.as_os_str().to_owned());
    args
}

/// macOS seatbelt profile granting the config's paths.
pub fn seatbelt_profile(config: &SandboxConfig) -> String {
    let mut profile = String::from(
        "(version 1)\n\
         (deny default)\n\
         (import \"system.sb\")\n\
         (allow process-exec)\n\
         (allow process-fork)\n\
         (allow signal (target self))\n\
         (allow file-read* (subpath \"/usr\") (subpath \"/System\") (subpath \"/Library\"))\n",
    );

    for path in &config.allowed_paths {
        let path = escape_seatbelt_path(path);
        profile.push_str(&format!("(allow file-read* (subpath \"{path}\"))\n"));
        if config.writable {
            profile.push_str(&format!("(allow file-write* (subpath \"{path}\"))\n"));
        }
    }

    for path in &config.masked_paths {
        let path = escape_seatbelt_path(path);
        profile.push_str(&format!("(deny file-read* file-write* (subpath \"{path}\"))\n"));
    }

    if config.network_isolated {
        profile.push_str("(deny network*)\n");
    } else {
        profile.push_str("(allow network*)\n");
    }

    profile
}

fn escape_seatbelt_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "\\\\").replace('"', "\\\"")
}
