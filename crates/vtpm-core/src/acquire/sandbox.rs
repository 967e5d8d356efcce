//! Sandbox policy sub-option.
//!
//! The policy is a syscall deny-list compiled to a seccomp BPF program and
//! applied to every thread of the process right before the command loop
//! starts. Everything the device and the loop need stays allowed; what is
//! denied is the set of calls a TPM emulator never makes (exec, module
//! loading, mounts, tracing other processes and the like).

use crate::error::AcquireError;
use crate::options::parse_optional;
use std::fmt;

const SUBSYSTEM: &str = "seccomp";

/// What happens when a denied syscall is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxAction {
    /// Kill the process
    #[default]
    Kill,
    /// Log the call and let it proceed
    Log,
    /// Install no filter at all
    None,
}

impl fmt::Display for SandboxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kill => write!(f, "kill"),
            Self::Log => write!(f, "log"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Parsed sandbox policy; installed with [`SandboxPolicy::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SandboxPolicy {
    /// Action for denied syscalls
    pub action: SandboxAction,
}

impl SandboxPolicy {
    /// Parse `action=kill|log|none`.
    pub fn parse(input: Option<&str>) -> Result<Self, AcquireError> {
        let opts = parse_optional(SUBSYSTEM, input)?;
        opts.check_keys(SUBSYSTEM, &["action"])?;

        let action = match opts.get("action") {
            None | Some("kill") => SandboxAction::Kill,
            Some("log") => SandboxAction::Log,
            Some("none") => SandboxAction::None,
            Some(other) => {
                return Err(AcquireError::option(
                    SUBSYSTEM,
                    format!("unsupported action '{other}'"),
                ))
            }
        };
        Ok(Self { action })
    }

    /// True if installing this policy changes anything.
    pub fn is_enforced(&self) -> bool {
        self.action != SandboxAction::None
    }

    /// Compile and apply the policy to all threads of this process.
    ///
    /// Irreversible once it succeeds.
    pub fn install(&self) -> Result<(), AcquireError> {
        if !self.is_enforced() {
            tracing::debug!(subsystem = SUBSYSTEM, "No sandbox policy installed");
            return Ok(());
        }
        imp::install(self.action)
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{SandboxAction, SUBSYSTEM};
    use crate::error::AcquireError;
    use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch};
    use std::collections::BTreeMap;

    pub(super) fn denied_syscalls() -> Vec<i64> {
        [
            // process control
            libc::SYS_execve,
            libc::SYS_execveat,
            libc::SYS_ptrace,
            libc::SYS_process_vm_readv,
            libc::SYS_process_vm_writev,
            // system control
            libc::SYS_reboot,
            libc::SYS_kexec_load,
            libc::SYS_acct,
            libc::SYS_settimeofday,
            libc::SYS_sethostname,
            libc::SYS_setdomainname,
            libc::SYS_swapon,
            libc::SYS_swapoff,
            // kernel modules
            libc::SYS_init_module,
            libc::SYS_finit_module,
            libc::SYS_delete_module,
            // filesystem escape
            libc::SYS_mount,
            libc::SYS_umount2,
            libc::SYS_pivot_root,
            libc::SYS_chroot,
            libc::SYS_open_by_handle_at,
            // keyring, bpf, perf
            libc::SYS_add_key,
            libc::SYS_request_key,
            libc::SYS_keyctl,
            libc::SYS_bpf,
            libc::SYS_perf_event_open,
        ]
        .into_iter()
        .map(i64::from)
        .collect()
    }

    pub(super) fn compile(action: SandboxAction) -> Result<BpfProgram, AcquireError> {
        let deny_action = match action {
            SandboxAction::Kill => SeccompAction::KillProcess,
            SandboxAction::Log => SeccompAction::Log,
            SandboxAction::None => SeccompAction::Allow,
        };

        // An empty rule list matches the syscall unconditionally.
        let rules: BTreeMap<i64, Vec<SeccompRule>> = denied_syscalls()
            .into_iter()
            .map(|nr| (nr, vec![]))
            .collect();

        let arch: TargetArch = std::env::consts::ARCH
            .try_into()
            .map_err(|e| AcquireError::Sandbox(format!("unsupported architecture: {e:?}")))?;

        let filter = SeccompFilter::new(rules, SeccompAction::Allow, deny_action, arch)
            .map_err(|e| AcquireError::Sandbox(format!("failed to create filter: {e}")))?;

        filter
            .try_into()
            .map_err(|e: seccompiler::BackendError| {
                AcquireError::Sandbox(format!("failed to compile BPF program: {e}"))
            })
    }

    pub(super) fn install(action: SandboxAction) -> Result<(), AcquireError> {
        let program = compile(action)?;
        seccompiler::apply_filter_all_threads(&program)
            .map_err(|e| AcquireError::Sandbox(format!("failed to apply filter: {e}")))?;

        tracing::info!(
            subsystem = SUBSYSTEM,
            %action,
            denied = denied_syscalls().len(),
            "Sandbox policy installed"
        );
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::SandboxAction;
    use crate::error::AcquireError;

    pub(super) fn install(_action: SandboxAction) -> Result<(), AcquireError> {
        Err(AcquireError::Sandbox(
            "seccomp is only available on Linux; use action=none".into(),
        ))
    }
}
