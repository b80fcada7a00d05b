//! Landlock scope enforcement.
//!
//! nix does not model landlock, so the two syscalls are made through
//! libc directly. Only the scope facility is used here: restricting
//! signal delivery and abstract unix socket connections to processes
//! inside the landlock domain, which the container parent enters right
//! before cloning the init.

#![allow(unsafe_code)]

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};

use crate::error::{Error, Result};

/// Probe flag returning the kernel landlock ABI version.
const LANDLOCK_CREATE_RULESET_VERSION: libc::c_long = 1;

/// Scope bit restricting connections to abstract unix sockets outside
/// the domain.
const SCOPE_ABSTRACT_UNIX_SOCKET: u64 = 1 << 0;
/// Scope bit restricting signal delivery to processes outside the
/// domain.
const SCOPE_SIGNAL: u64 = 1 << 1;

/// Lowest ABI version with scope support.
const ABI_SCOPE: i64 = 6;

/// include/uapi/linux/landlock.h struct landlock_ruleset_attr
#[repr(C)]
struct RulesetAttr {
    handled_access_fs: u64,
    handled_access_net: u64,
    scoped: u64,
}

fn get_abi() -> io::Result<i64> {
    // SAFETY: a null attr with the version flag performs an ABI probe
    let r = unsafe {
        libc::syscall(
            libc::SYS_landlock_create_ruleset,
            std::ptr::null::<RulesetAttr>(),
            0usize,
            LANDLOCK_CREATE_RULESET_VERSION,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(r)
}

fn create_ruleset(attr: &RulesetAttr) -> io::Result<OwnedFd> {
    // SAFETY: attr is a valid ruleset attr for the size passed
    let r = unsafe {
        libc::syscall(
            libc::SYS_landlock_create_ruleset,
            attr as *const RulesetAttr,
            mem::size_of::<RulesetAttr>(),
            0,
        )
    };
    if r < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: r is a newly created ruleset fd owned by this process
    let fd = unsafe { OwnedFd::from_raw_fd(r as i32) };
    // SAFETY: fd is valid for the duration of the call
    unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    Ok(fd)
}

fn restrict_self(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fd refers to a landlock ruleset
    let r = unsafe { libc::syscall(libc::SYS_landlock_restrict_self, fd.as_raw_fd(), 0) };
    if r != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Confines signal delivery, and unless `host_abstract` is set
/// abstract unix socket connections, to the landlock domain entered by
/// the calling thread.
///
/// The caller must have set no_new_privs beforehand. On kernels
/// without scope support this does nothing, unless abstract socket
/// scoping is required, which cannot be skipped safely.
pub(crate) fn enforce_scopes(host_abstract: bool) -> Result<()> {
    let abi =
        get_abi().map_err(|e| Error::Landlock { step: "get landlock ABI", source: e })?;
    if abi < ABI_SCOPE {
        if !host_abstract {
            return Err(Error::LandlockAbi(abi as i32));
        }
        tracing::debug!("skipping landlock scopes on ABI {abi}");
        return Ok(());
    }

    let mut scoped = SCOPE_SIGNAL;
    if !host_abstract {
        scoped |= SCOPE_ABSTRACT_UNIX_SOCKET;
    }

    let attr = RulesetAttr { handled_access_fs: 0, handled_access_net: 0, scoped };
    let fd = create_ruleset(&attr)
        .map_err(|e| Error::Landlock { step: "create landlock ruleset", source: e })?;
    restrict_self(&fd)
        .map_err(|e| Error::Landlock { step: "enforce landlock ruleset", source: e })?;
    tracing::debug!("enforced landlock scopes {scoped:#x} on ABI {abi}");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn abi_probe_reports_version_or_enosys() {
        match get_abi() {
            Ok(abi) => assert!(abi >= 1),
            Err(e) => {
                assert!(matches!(e.raw_os_error(), Some(libc::ENOSYS | libc::EOPNOTSUPP)));
            }
        }
    }

    #[test]
    fn error_message_forms() {
        let e = Error::Landlock {
            step: "get landlock ABI",
            source: io::Error::from_raw_os_error(libc::ENOSYS),
        };
        assert!(e.message().starts_with("cannot get landlock ABI: "));

        let old = Error::LandlockAbi(4);
        assert_eq!(
            old.message(),
            "kernel version too old for abstract unix socket scoping"
        );
    }
}
