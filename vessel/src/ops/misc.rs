//! Directory, symlink, tmpfile placement and remount ops.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use vessel_proto::{Absolute, Mkdir, Place, Remount, Symlink};

use crate::error::{Error, Result};
use crate::mount::{create_file, ensure_file, host_proc, mkdir_all, symlink, to_sysroot};
use crate::ops::{SetupOp, SetupState};

impl SetupOp for Mkdir {
    fn apply(&mut self, _state: &mut SetupState) -> Result<()> {
        mkdir_all(to_sysroot(self.path.as_str()), self.perm)
    }

    fn prefix(&self) -> &'static str {
        "creating"
    }
}

impl SetupOp for Symlink {
    fn early(&mut self, _state: &mut SetupState) -> Result<()> {
        if self.dereference {
            Absolute::new(&self.link_name)?;
            let name = fs::read_link(&self.link_name)
                .map_err(|e| Error::path("readlink", &self.link_name, e))?;
            self.link_name = name.into_os_string().into_string().map_err(|_| {
                Error::path(
                    "readlink",
                    &self.link_name,
                    io::Error::new(io::ErrorKind::InvalidData, "non-utf8 link target"),
                )
            })?;
        }
        Ok(())
    }

    fn apply(&mut self, state: &mut SetupState) -> Result<()> {
        let target = to_sysroot(self.target.as_str());
        if let Some(parent) = Path::new(&target).parent() {
            mkdir_all(parent, state.parent_perm)?;
        }
        symlink(&self.link_name, &target)
    }

    fn prefix(&self) -> &'static str {
        "creating"
    }
}

/// Distinguishes intermediate tmpfiles across [`Place`] ops.
static PLACE_SERIAL: AtomicUsize = AtomicUsize::new(0);

impl SetupOp for Place {
    fn apply(&mut self, state: &mut SetupState) -> Result<()> {
        // written to the intermediate root, which outlives the bind
        let tmp = format!("/tmp.{}", PLACE_SERIAL.fetch_add(1, Ordering::Relaxed));
        create_file(&tmp, 0o600, 0o755, Some(&self.data))?;

        let target = to_sysroot(self.path.as_str());
        ensure_file(&target, 0o444, state.parent_perm)?;
        host_proc().bind_mount(&tmp, &target, libc::MS_RDONLY | libc::MS_NODEV, false)?;
        fs::remove_file(&tmp).map_err(|e| Error::path("remove", &tmp, e))
    }

    fn prefix(&self) -> &'static str {
        "placing"
    }
}

impl SetupOp for Remount {
    fn apply(&mut self, _state: &mut SetupState) -> Result<()> {
        host_proc().remount(&to_sysroot(self.target.as_str()), self.flags)
    }

    fn prefix(&self) -> &'static str {
        "remounting"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ops::test_state;

    fn abs(s: &str) -> Absolute {
        Absolute::new(s).unwrap()
    }

    #[test]
    fn symlink_dereference_requires_absolute() {
        let mut op = Symlink {
            target: abs("/t"),
            link_name: "relative/name".into(),
            dereference: true,
        };
        assert!(matches!(
            op.early(&mut test_state()),
            Err(Error::NotAbsolute(_))
        ));
    }

    #[test]
    fn symlink_dereference_replaces_link_name() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        std::os::unix::fs::symlink("/etc/os-release", format!("{base}/link")).unwrap();

        let mut op = Symlink {
            target: abs("/t"),
            link_name: format!("{base}/link"),
            dereference: true,
        };
        op.early(&mut test_state()).unwrap();
        assert_eq!(op.link_name, "/etc/os-release");
    }

    #[test]
    fn symlink_plain_early_is_noop() {
        let mut op = Symlink {
            target: abs("/t"),
            link_name: "anything goes".into(),
            dereference: false,
        };
        op.early(&mut test_state()).unwrap();
        assert_eq!(op.link_name, "anything goes");
    }
}
