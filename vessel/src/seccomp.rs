//! Seccomp filter presets and installation.
//!
//! The preset tables deny a small set of syscalls on top of an
//! allow-everything default, in the tradition of desktop sandboxes.
//! Denied syscalls fail with an errno instead of killing the process,
//! so probing runtimes keep working.
//!
//! A BPF filter carries a single return action, so the resolved rules
//! are grouped by errno and installed as one stacked filter per
//! distinct errno value.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCondition, SeccompFilter,
};

use vessel_proto::{
    ArgCmp, CmpOp, FLAG_MULTIARCH, PRESET_DENY_DEVEL, PRESET_DENY_MULTI, PRESET_DENY_NS,
    PRESET_DENY_TTY, PRESET_EXT, SeccompRule,
};

use crate::error::{Error, Result};

#[cfg(target_arch = "x86_64")]
const ARCH: seccompiler::TargetArch = seccompiler::TargetArch::x86_64;
#[cfg(target_arch = "aarch64")]
const ARCH: seccompiler::TargetArch = seccompiler::TargetArch::aarch64;

/// personality(2) persona of the native execution domain.
const PER_LINUX: u64 = 0x0000;
/// personality(2) persona of the 32-bit execution domain.
const PER_LINUX32: u64 = 0x0008;

fn deny(syscall: libc::c_long, errno: i32) -> SeccompRule {
    SeccompRule { syscall, errno, arg: None }
}

fn deny_arg(syscall: libc::c_long, errno: i32, arg: ArgCmp) -> SeccompRule {
    SeccompRule { syscall, errno, arg: Some(arg) }
}

/// Resolves preset bits and flags into a concrete rule list.
pub(crate) fn preset(presets: u32, flags: u32) -> Vec<SeccompRule> {
    let allowed_personality =
        if presets & PRESET_DENY_MULTI != 0 { PER_LINUX32 } else { PER_LINUX };

    let mut rules = Vec::new();
    push_common(&mut rules);
    if presets & PRESET_DENY_NS != 0 {
        push_namespace(&mut rules);
    }
    if presets & PRESET_DENY_TTY != 0 {
        push_tty(&mut rules);
    }
    if presets & PRESET_DENY_DEVEL != 0 {
        push_devel(&mut rules, allowed_personality);
    }
    if flags & FLAG_MULTIARCH == 0 {
        push_emulation(&mut rules);
    }
    if presets & PRESET_EXT != 0 {
        push_common_ext(&mut rules);
        if presets & PRESET_DENY_NS != 0 {
            push_namespace_ext(&mut rules);
        }
    }
    rules
}

fn push_common(rules: &mut Vec<SeccompRule>) {
    for nr in [
        // dmesg
        libc::SYS_syslog,
        // don't allow disabling accounting
        libc::SYS_acct,
        // don't allow reading current quota use
        libc::SYS_quotactl,
        // kernel keyring
        libc::SYS_add_key,
        libc::SYS_keyctl,
        libc::SYS_request_key,
        // scary VM/NUMA ops
        libc::SYS_move_pages,
        libc::SYS_mbind,
        libc::SYS_get_mempolicy,
        libc::SYS_set_mempolicy,
        libc::SYS_migrate_pages,
    ] {
        rules.push(deny(nr, libc::EPERM));
    }
    #[cfg(target_arch = "x86_64")]
    rules.push(deny(libc::SYS_uselib, libc::EPERM));
}

fn push_common_ext(rules: &mut Vec<SeccompRule>) {
    for nr in [
        // changing the system clock
        libc::SYS_adjtimex,
        libc::SYS_clock_adjtime,
        libc::SYS_clock_settime,
        libc::SYS_settimeofday,
        // loading and unloading of kernel modules
        libc::SYS_delete_module,
        libc::SYS_finit_module,
        libc::SYS_init_module,
        // rebooting and reboot preparation
        libc::SYS_kexec_file_load,
        libc::SYS_kexec_load,
        libc::SYS_reboot,
        // enabling and disabling swap devices
        libc::SYS_swapoff,
        libc::SYS_swapon,
    ] {
        rules.push(deny(nr, libc::EPERM));
    }
}

fn push_namespace(rules: &mut Vec<SeccompRule>) {
    // don't allow subnamespace setups
    for nr in [
        libc::SYS_unshare,
        libc::SYS_setns,
        libc::SYS_mount,
        libc::SYS_umount2,
        libc::SYS_pivot_root,
        libc::SYS_chroot,
    ] {
        rules.push(deny(nr, libc::EPERM));
    }
    rules.push(deny_arg(
        libc::SYS_clone,
        libc::EPERM,
        ArgCmp {
            arg: 0,
            op: CmpOp::MaskedEq,
            datum_a: libc::CLONE_NEWUSER as u64,
            datum_b: libc::CLONE_NEWUSER as u64,
        },
    ));

    // seccomp can't look into clone3()'s struct clone_args to check
    // whether the flags are OK, so clone3() is blocked outright with
    // ENOSYS so user-space falls back to clone(). (CVE-2021-41133)
    rules.push(deny(libc::SYS_clone3, libc::ENOSYS));

    // the new mount manipulation APIs can also change the VFS; there
    // is no legitimate reason to call these in the container, so all
    // of them are blocked. (CVE-2021-41133)
    for nr in [
        libc::SYS_open_tree,
        libc::SYS_move_mount,
        libc::SYS_fsopen,
        libc::SYS_fsconfig,
        libc::SYS_fsmount,
        libc::SYS_fspick,
        libc::SYS_mount_setattr,
    ] {
        rules.push(deny(nr, libc::ENOSYS));
    }
}

fn push_namespace_ext(rules: &mut Vec<SeccompRule>) {
    // changing file ownership
    for nr in [libc::SYS_fchown, libc::SYS_fchownat] {
        rules.push(deny(nr, libc::EPERM));
    }
    #[cfg(target_arch = "x86_64")]
    for nr in [libc::SYS_chown, libc::SYS_lchown] {
        rules.push(deny(nr, libc::EPERM));
    }

    // changing user and group credentials
    for nr in [
        libc::SYS_setgid,
        libc::SYS_setgroups,
        libc::SYS_setregid,
        libc::SYS_setresgid,
        libc::SYS_setresuid,
        libc::SYS_setreuid,
        libc::SYS_setuid,
    ] {
        rules.push(deny(nr, libc::EPERM));
    }
}

fn push_tty(rules: &mut Vec<SeccompRule>) {
    // don't allow faking input to the controlling tty (CVE-2017-5226)
    rules.push(deny_arg(
        libc::SYS_ioctl,
        libc::EPERM,
        ArgCmp {
            arg: 1,
            op: CmpOp::MaskedEq,
            datum_a: 0xFFFF_FFFF,
            datum_b: libc::TIOCSTI as u64,
        },
    ));
    // on a Linux virtual console, copy/paste operations have an effect
    // similar to TIOCSTI (CVE-2023-28100)
    rules.push(deny_arg(
        libc::SYS_ioctl,
        libc::EPERM,
        ArgCmp {
            arg: 1,
            op: CmpOp::MaskedEq,
            datum_a: 0xFFFF_FFFF,
            datum_b: libc::TIOCLINUX as u64,
        },
    ));
}

fn push_devel(rules: &mut Vec<SeccompRule>, allowed_personality: u64) {
    // perf has been the source of many CVEs; profiling is expected to
    // happen from outside the container
    rules.push(deny(libc::SYS_perf_event_open, libc::EPERM));
    // don't allow switching to bsd emulation or whatnot
    rules.push(deny_arg(
        libc::SYS_personality,
        libc::EPERM,
        ArgCmp { arg: 0, op: CmpOp::Ne, datum_a: allowed_personality, datum_b: 0 },
    ));
    rules.push(deny(libc::SYS_ptrace, libc::EPERM));
}

fn push_emulation(rules: &mut Vec<SeccompRule>) {
    // modify_ldt is a historic source of interesting information
    // leaks, but is required to run old 16-bit applications as well as
    // some Wine patches
    #[cfg(target_arch = "x86_64")]
    rules.push(deny(libc::SYS_modify_ldt, libc::EPERM));
    #[cfg(not(target_arch = "x86_64"))]
    let _ = rules;
}

fn condition(arg: &ArgCmp) -> Result<SeccompCondition> {
    use seccompiler::SeccompCmpOp as Op;
    let (op, value) = match arg.op {
        CmpOp::Ne => (Op::Ne, arg.datum_a),
        CmpOp::Lt => (Op::Lt, arg.datum_a),
        CmpOp::Le => (Op::Le, arg.datum_a),
        CmpOp::Eq => (Op::Eq, arg.datum_a),
        CmpOp::Ge => (Op::Ge, arg.datum_a),
        CmpOp::Gt => (Op::Gt, arg.datum_a),
        CmpOp::MaskedEq => (Op::MaskedEq(arg.datum_a), arg.datum_b),
    };
    SeccompCondition::new(arg.arg, SeccompCmpArgLen::Qword, op, value)
        .map_err(|e| Error::Seccomp(e.into()))
}

/// Compiles `rules` into one allow-default BPF program per distinct
/// errno value.
pub(crate) fn programs(rules: &[SeccompRule]) -> Result<Vec<BpfProgram>> {
    let mut groups: BTreeMap<i32, BTreeMap<i64, Vec<seccompiler::SeccompRule>>> = BTreeMap::new();
    for r in rules {
        let per_errno = groups.entry(r.errno).or_default();
        match &r.arg {
            // an empty rule vector matches the syscall unconditionally
            None => {
                per_errno.insert(r.syscall, Vec::new());
            }
            Some(arg) => match per_errno.entry(r.syscall) {
                Entry::Occupied(mut e) => {
                    // never weaken an unconditional match
                    if !e.get().is_empty() {
                        e.get_mut().push(
                            seccompiler::SeccompRule::new(vec![condition(arg)?])
                                .map_err(|e| Error::Seccomp(e.into()))?,
                        );
                    }
                }
                Entry::Vacant(e) => {
                    e.insert(vec![
                        seccompiler::SeccompRule::new(vec![condition(arg)?])
                            .map_err(|e| Error::Seccomp(e.into()))?,
                    ]);
                }
            },
        }
    }

    let mut out = Vec::with_capacity(groups.len());
    for (errno, map) in groups {
        let filter = SeccompFilter::new(
            map,
            SeccompAction::Allow,
            SeccompAction::Errno(errno as u32),
            ARCH,
        )
        .map_err(|e| Error::Seccomp(e.into()))?;
        let prog: BpfProgram =
            filter.try_into().map_err(|e: seccompiler::BackendError| Error::Seccomp(e.into()))?;
        out.push(prog);
    }
    Ok(out)
}

/// Compiles and installs `rules` on the calling thread.
pub(crate) fn install(rules: &[SeccompRule]) -> Result<()> {
    for prog in programs(rules)? {
        seccompiler::apply_filter(&prog).map_err(Error::Seccomp)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use vessel_proto::PRESET_STRICT;

    fn syscalls(rules: &[SeccompRule]) -> Vec<libc::c_long> {
        rules.iter().map(|r| r.syscall).collect()
    }

    #[test]
    fn strict_preset_composition() {
        let rules = preset(PRESET_STRICT, 0);
        let nrs = syscalls(&rules);
        assert!(nrs.contains(&libc::SYS_syslog));
        assert!(nrs.contains(&libc::SYS_clone3));
        assert!(nrs.contains(&libc::SYS_ioctl));
        assert!(nrs.contains(&libc::SYS_ptrace));
        assert!(nrs.contains(&libc::SYS_swapon));
        assert!(nrs.contains(&libc::SYS_setuid));

        // native persona stays allowed without the multi preset
        let personality = rules
            .iter()
            .find(|r| r.syscall == libc::SYS_personality)
            .unwrap();
        assert_eq!(personality.arg.as_ref().unwrap().datum_a, PER_LINUX);
    }

    #[test]
    fn multi_preset_changes_allowed_persona() {
        let rules = preset(PRESET_STRICT | PRESET_DENY_MULTI, 0);
        let personality = rules
            .iter()
            .find(|r| r.syscall == libc::SYS_personality)
            .unwrap();
        assert_eq!(personality.arg.as_ref().unwrap().datum_a, PER_LINUX32);
    }

    #[test]
    fn base_preset_omits_extensions() {
        let rules = preset(0, 0);
        let nrs = syscalls(&rules);
        assert!(nrs.contains(&libc::SYS_syslog));
        assert!(!nrs.contains(&libc::SYS_swapon));
        assert!(!nrs.contains(&libc::SYS_unshare));
        assert!(!nrs.contains(&libc::SYS_ioctl));
        assert!(!nrs.contains(&libc::SYS_ptrace));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn multiarch_flag_drops_emulation_rules() {
        let with = preset(0, 0);
        let without = preset(0, FLAG_MULTIARCH);
        assert!(syscalls(&with).contains(&libc::SYS_modify_ldt));
        assert!(!syscalls(&without).contains(&libc::SYS_modify_ldt));
    }

    #[test]
    fn preset_rules_compile() {
        let progs = programs(&preset(PRESET_STRICT | PRESET_DENY_MULTI, 0)).unwrap();
        // EPERM and ENOSYS groups
        assert_eq!(progs.len(), 2);
        for prog in progs {
            assert!(!prog.is_empty());
        }
    }

    #[test]
    fn unconditional_rule_dominates() {
        let rules = [
            deny_arg(
                libc::SYS_ioctl,
                libc::EPERM,
                ArgCmp { arg: 1, op: CmpOp::Eq, datum_a: 1, datum_b: 0 },
            ),
            deny(libc::SYS_ioctl, libc::EPERM),
            deny_arg(
                libc::SYS_ioctl,
                libc::EPERM,
                ArgCmp { arg: 1, op: CmpOp::Eq, datum_a: 2, datum_b: 0 },
            ),
        ];
        // a single program, no panic from the merge
        assert_eq!(programs(&rules).unwrap().len(), 1);
    }
}
