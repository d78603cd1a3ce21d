//! Syscall deny-list applied to the sandbox before the target starts.
//!
//! The filter allows everything by default and fails the listed syscalls
//! with `EPERM`, so a confined program sees an ordinary permission error
//! instead of being killed. Groups of syscalls are selected with
//! [`FilterOpts`]; the baseline group is always present.

use std::collections::BTreeMap;

use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SetupError};

/// Optional syscall groups denied on top of the baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterOpts(u32);

impl FilterOpts {
    /// Rarely legitimate legacy and hardware access syscalls.
    pub const EXTENDED: Self = Self(1 << 0);
    /// Namespace creation and mount manipulation.
    pub const DENY_NS: Self = Self(1 << 1);
    /// Terminal input injection via `ioctl`.
    pub const DENY_TTY: Self = Self(1 << 2);
    /// Process tracing and inspection.
    pub const DENY_DEVEL: Self = Self(1 << 3);

    /// Baseline only.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Both sets combined.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Whether every group of `other` is selected.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Always denied.
const BASELINE: &[i64] = &[
    libc::SYS_acct,
    libc::SYS_add_key,
    libc::SYS_adjtimex,
    libc::SYS_bpf,
    libc::SYS_clock_adjtime,
    libc::SYS_clock_settime,
    libc::SYS_delete_module,
    libc::SYS_finit_module,
    libc::SYS_init_module,
    libc::SYS_kexec_file_load,
    libc::SYS_kexec_load,
    libc::SYS_keyctl,
    libc::SYS_name_to_handle_at,
    libc::SYS_open_by_handle_at,
    libc::SYS_quotactl,
    libc::SYS_reboot,
    libc::SYS_request_key,
    libc::SYS_settimeofday,
    libc::SYS_swapoff,
    libc::SYS_swapon,
    libc::SYS_syslog,
    libc::SYS_userfaultfd,
];

/// Denied with [`FilterOpts::EXTENDED`].
const EXTENDED: &[i64] = &[
    libc::SYS_fanotify_init,
    libc::SYS_lookup_dcookie,
    libc::SYS_vhangup,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_ioperm,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_iopl,
    #[cfg(target_arch = "x86_64")]
    libc::SYS_modify_ldt,
];

/// Denied with [`FilterOpts::DENY_NS`].
const NAMESPACE: &[i64] = &[
    libc::SYS_chroot,
    libc::SYS_fsconfig,
    libc::SYS_fsmount,
    libc::SYS_fsopen,
    libc::SYS_mount,
    libc::SYS_move_mount,
    libc::SYS_open_tree,
    libc::SYS_pivot_root,
    libc::SYS_setns,
    libc::SYS_umount2,
    libc::SYS_unshare,
];

/// Denied with [`FilterOpts::DENY_DEVEL`].
const DEVEL: &[i64] = &[
    libc::SYS_kcmp,
    libc::SYS_perf_event_open,
    libc::SYS_process_vm_readv,
    libc::SYS_process_vm_writev,
    libc::SYS_ptrace,
];

/// Collects the rule map for `opts`.
fn rules(opts: FilterOpts) -> Result<BTreeMap<i64, Vec<SeccompRule>>> {
    let mut groups = vec![BASELINE];
    if opts.contains(FilterOpts::EXTENDED) {
        groups.push(EXTENDED);
    }
    if opts.contains(FilterOpts::DENY_NS) {
        groups.push(NAMESPACE);
    }
    if opts.contains(FilterOpts::DENY_DEVEL) {
        groups.push(DEVEL);
    }

    // an empty rule list matches the syscall unconditionally
    let mut map: BTreeMap<i64, Vec<SeccompRule>> = groups
        .into_iter()
        .flatten()
        .map(|nr| (*nr, Vec::new()))
        .collect();

    if opts.contains(FilterOpts::DENY_TTY) {
        let mut ioctl = Vec::new();
        for request in [u64::from(libc::TIOCSTI), u64::from(libc::TIOCLINUX)] {
            let cond = SeccompCondition::new(1, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, request)
                .map_err(|e| SetupError::Seccomp(e.to_string()))?;
            ioctl.push(SeccompRule::new(vec![cond]).map_err(|e| SetupError::Seccomp(e.to_string()))?);
        }
        map.insert(libc::SYS_ioctl, ioctl);
    }
    Ok(map)
}

/// Compiles the filter for `opts` for the running architecture.
pub fn build(opts: FilterOpts) -> Result<BpfProgram> {
    let arch = TargetArch::try_from(std::env::consts::ARCH)
        .map_err(|e| SetupError::Seccomp(e.to_string()))?;
    let filter = SeccompFilter::new(
        rules(opts)?,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM.unsigned_abs()),
        arch,
    )
    .map_err(|e| SetupError::Seccomp(e.to_string()))?;
    filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| SetupError::Seccomp(e.to_string()))
}

/// Compiles and installs the filter on the calling thread.
///
/// `no_new_privs` must already be set unless the caller holds
/// `CAP_SYS_ADMIN`. Threads spawned afterwards inherit the filter.
pub fn load(opts: FilterOpts) -> Result<()> {
    let program = build(opts)?;
    seccompiler::apply_filter(&program).map_err(|e| SetupError::Seccomp(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_is_always_denied() {
        let map = rules(FilterOpts::empty()).unwrap();
        assert!(map.contains_key(&libc::SYS_kexec_load));
        assert!(map.contains_key(&libc::SYS_bpf));
        assert!(!map.contains_key(&libc::SYS_ptrace));
        assert!(!map.contains_key(&libc::SYS_unshare));
        assert!(!map.contains_key(&libc::SYS_ioctl));
    }

    #[test]
    fn groups_add_rules() {
        let opts = FilterOpts::DENY_NS
            .union(FilterOpts::DENY_DEVEL)
            .union(FilterOpts::DENY_TTY);
        let map = rules(opts).unwrap();
        assert!(map.contains_key(&libc::SYS_unshare));
        assert!(map.contains_key(&libc::SYS_pivot_root));
        assert!(map.contains_key(&libc::SYS_ptrace));
        assert_eq!(map[&libc::SYS_ioctl].len(), 2);
        // unconditional entries carry no conditions
        assert!(map[&libc::SYS_ptrace].is_empty());
    }

    #[test]
    fn every_combination_compiles() {
        for bits in 0..16 {
            let program = build(FilterOpts(bits)).unwrap();
            assert!(!program.is_empty());
        }
    }
}
