//! Device filesystem op.
//!
//! Builds a minimal /dev out of a tmpfs, a bound subset of the host
//! devtmpfs and a private devpts instance.

use std::fs;
use std::io;

use vessel_proto::MountDev;

use crate::error::{Error, Result};
use crate::mount::{
    FSTYPE_DEVPTS, FSTYPE_MQUEUE, SOURCE_TMPFS_DEVTMPFS, ensure_file, host_proc, mkdir_all,
    mount_call, mount_tmpfs, symlink, to_host, to_sysroot,
};
use crate::ops::{SetupOp, SetupState};

/// Host device nodes bound into the container.
const BIND_DEVICES: [&str; 6] = ["null", "zero", "full", "random", "urandom", "tty"];

impl SetupOp for MountDev {
    fn apply(&mut self, state: &mut SetupState) -> Result<()> {
        let target = to_sysroot(self.target.as_str());
        mount_tmpfs(
            SOURCE_TMPFS_DEVTMPFS,
            &target,
            libc::MS_NOSUID | libc::MS_NODEV,
            0,
            state.parent_perm,
        )?;

        for name in BIND_DEVICES {
            let bound = format!("{target}/{name}");
            ensure_file(&bound, 0o444, state.parent_perm)?;
            host_proc().bind_mount(
                &to_host(&format!("/dev/{name}")),
                &bound,
                0,
                self.target.as_str() == "/dev",
            )?;
        }

        for (dest, name) in [
            ("/proc/self/fd/0", "stdin"),
            ("/proc/self/fd/1", "stdout"),
            ("/proc/self/fd/2", "stderr"),
            ("/proc/self/fd", "fd"),
            ("/proc/kcore", "core"),
            ("pts/ptmx", "ptmx"),
        ] {
            symlink(dest, &format!("{target}/{name}"))?;
        }

        for name in ["shm", "pts"] {
            mkdir_all(format!("{target}/{name}"), state.parent_perm)?;
        }
        mount_call(
            FSTYPE_DEVPTS,
            &format!("{target}/pts"),
            FSTYPE_DEVPTS,
            libc::MS_NOSUID | libc::MS_NOEXEC,
            "newinstance,ptmxmode=0666,mode=620",
        )?;

        // the controlling terminal is only reachable while the init
        // shares the session of its parent
        if state.retain_session && nix::unistd::isatty(io::stdout()).unwrap_or(false) {
            let console = format!("{target}/console");
            ensure_file(&console, 0o444, state.parent_perm)?;

            let stdout = host_proc().stdout();
            let name = fs::read_link(&stdout).map_err(|e| Error::path("readlink", &stdout, e))?;
            let name = name.into_os_string().into_string().map_err(|_| {
                Error::path(
                    "readlink",
                    &stdout,
                    io::Error::new(io::ErrorKind::InvalidData, "non-utf8 terminal name"),
                )
            })?;
            host_proc().bind_mount(&to_host(&name), &console, 0, false)?;
        }

        if self.mqueue {
            let mqueue = format!("{target}/mqueue");
            mkdir_all(&mqueue, state.parent_perm)?;
            mount_call(
                FSTYPE_MQUEUE,
                &mqueue,
                FSTYPE_MQUEUE,
                libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_NODEV,
                "",
            )?;
        }

        if !self.write {
            host_proc().remount(&target, libc::MS_RDONLY)?;
        }
        Ok(())
    }

    fn prefix(&self) -> &'static str {
        "mounting"
    }
}
