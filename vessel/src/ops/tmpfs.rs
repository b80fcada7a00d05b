//! Pseudo-filesystem and tmpfs ops.

use vessel_proto::{MountMqueue, MountProc, MountTmpfs, TMPFS_SIZE_MAX};

use crate::error::{Error, Result};
use crate::mount::{FSTYPE_MQUEUE, FSTYPE_PROC, mkdir_all, mount_call, mount_tmpfs, to_sysroot};
use crate::ops::{SetupOp, SetupState};

impl SetupOp for MountProc {
    fn apply(&mut self, state: &mut SetupState) -> Result<()> {
        let target = to_sysroot(self.target.as_str());
        mkdir_all(&target, state.parent_perm)?;
        mount_call(
            FSTYPE_PROC,
            &target,
            FSTYPE_PROC,
            libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_NODEV,
            "",
        )
    }

    fn prefix(&self) -> &'static str {
        "mounting"
    }
}

impl SetupOp for MountMqueue {
    fn apply(&mut self, state: &mut SetupState) -> Result<()> {
        let target = to_sysroot(self.target.as_str());
        mkdir_all(&target, state.parent_perm)?;
        mount_call(
            FSTYPE_MQUEUE,
            &target,
            FSTYPE_MQUEUE,
            libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_NODEV,
            "",
        )
    }

    fn prefix(&self) -> &'static str {
        "mounting"
    }
}

impl SetupOp for MountTmpfs {
    fn valid(&self) -> bool {
        !self.fs_name.is_empty()
    }

    fn apply(&mut self, _state: &mut SetupState) -> Result<()> {
        if self.size > TMPFS_SIZE_MAX {
            return Err(Error::TmpfsSize(self.size));
        }
        mount_tmpfs(
            &self.fs_name,
            &to_sysroot(self.target.as_str()),
            self.flags,
            self.size,
            self.perm,
        )
    }

    fn prefix(&self) -> &'static str {
        "mounting"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use vessel_proto::Absolute;

    use crate::ops::test_state;

    #[test]
    fn tmpfs_requires_fs_name() {
        let op = MountTmpfs {
            fs_name: String::new(),
            target: Absolute::new("/tmp").unwrap(),
            size: 0,
            perm: 0o755,
            flags: 0,
        };
        assert!(!op.valid());
    }

    #[test]
    fn tmpfs_rejects_oversized() {
        let mut op = MountTmpfs {
            fs_name: "ephemeral".into(),
            target: Absolute::new("/tmp").unwrap(),
            size: TMPFS_SIZE_MAX + 1,
            perm: 0o755,
            flags: 0,
        };
        assert!(matches!(
            op.apply(&mut test_state()),
            Err(Error::TmpfsSize(s)) if s == TMPFS_SIZE_MAX + 1
        ));
    }
}
