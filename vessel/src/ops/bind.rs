//! Bind mount op.

use std::fs;
use std::io;

use vessel_proto::{Absolute, BIND_DEVICE, BIND_ENSURE, BIND_OPTIONAL, BIND_WRITABLE, BindMount};

use crate::error::{Error, Result};
use crate::mount::{ensure_file, host_proc, mkdir_all, to_host, to_sysroot};
use crate::ops::{SetupOp, SetupState};

impl SetupOp for BindMount {
    fn valid(&self) -> bool {
        self.flags & (BIND_OPTIONAL | BIND_ENSURE) != (BIND_OPTIONAL | BIND_ENSURE)
    }

    fn early(&mut self, _state: &mut SetupState) -> Result<()> {
        if self.flags & BIND_ENSURE != 0 {
            mkdir_all(self.source.as_path(), 0o700)?;
        }

        match fs::canonicalize(self.source.as_path()) {
            Ok(pathname) => {
                let pathname = pathname.into_os_string().into_string().map_err(|_| {
                    Error::path(
                        "resolve",
                        self.source.as_path(),
                        io::Error::new(io::ErrorKind::InvalidData, "non-utf8 source"),
                    )
                })?;
                self.source_final = Some(Absolute::new(pathname)?);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.flags & BIND_OPTIONAL != 0 => {
                // leave source_final unset
                Ok(())
            }
            Err(e) => Err(Error::path("resolve", self.source.as_path(), e)),
        }
    }

    fn apply(&mut self, _state: &mut SetupState) -> Result<()> {
        let Some(source_final) = &self.source_final else {
            if self.flags & BIND_OPTIONAL == 0 {
                // unreachable
                return Err(Error::OpState("impossible bind state reached"));
            }
            return Ok(());
        };

        let source = to_host(source_final.as_str());
        let target = to_sysroot(self.target.as_str());

        // this perm value emulates bwrap behaviour as it clears bits
        // from 0755 based on op->perms which is never set for any bind
        // setup op so always results in 0700
        let fi = fs::metadata(&source).map_err(|e| Error::path("stat", &source, e))?;
        if fi.is_dir() {
            mkdir_all(&target, 0o700)?;
        } else {
            ensure_file(&target, 0o444, 0o700)?;
        }

        let mut flags = libc::MS_REC;
        if self.flags & BIND_WRITABLE == 0 {
            flags |= libc::MS_RDONLY;
        }
        if self.flags & BIND_DEVICE == 0 {
            flags |= libc::MS_NODEV;
        }

        host_proc().bind_mount(&source, &target, flags, *source_final == self.target)
    }

    fn prefix(&self) -> &'static str {
        "mounting"
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
    fn optional_and_ensure_are_exclusive() {
        let op = BindMount {
            source: abs("/a"),
            target: abs("/b"),
            flags: BIND_OPTIONAL | BIND_ENSURE,
            source_final: None,
        };
        assert!(!op.valid());

        let op = BindMount {
            source: abs("/a"),
            target: abs("/b"),
            flags: BIND_OPTIONAL,
            source_final: None,
        };
        assert!(op.valid());
    }

    #[test]
    fn early_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_str().unwrap();
        fs::create_dir(format!("{base}/real")).unwrap();
        std::os::unix::fs::symlink("real", format!("{base}/link")).unwrap();

        let mut op = BindMount {
            source: abs(&format!("{base}/link")),
            target: abs("/r"),
            flags: 0,
            source_final: None,
        };
        op.early(&mut test_state()).unwrap();
        let resolved = op.source_final.unwrap();
        assert_eq!(resolved.as_str(), fs::canonicalize(format!("{base}/real")).unwrap().to_str().unwrap());
    }

    #[test]
    fn early_optional_missing_source() {
        let mut op = BindMount {
            source: abs("/proc/nonexistent"),
            target: abs("/r"),
            flags: BIND_OPTIONAL,
            source_final: None,
        };
        op.early(&mut test_state()).unwrap();
        assert!(op.source_final.is_none());

        let mut op = BindMount {
            source: abs("/proc/nonexistent"),
            target: abs("/r"),
            flags: 0,
            source_final: None,
        };
        assert!(op.early(&mut test_state()).is_err());
    }

    #[test]
    fn early_ensure_creates_source() {
        let dir = tempfile::tempdir().unwrap();
        let source = format!("{}/ensured", dir.path().to_str().unwrap());
        let mut op = BindMount {
            source: abs(&source),
            target: abs("/r"),
            flags: BIND_ENSURE,
            source_final: None,
        };
        op.early(&mut test_state()).unwrap();
        assert!(fs::metadata(&source).unwrap().is_dir());
        assert!(op.source_final.is_some());
    }

    #[test]
    fn apply_without_resolved_source() {
        let mut op = BindMount {
            source: abs("/a"),
            target: abs("/b"),
            flags: BIND_OPTIONAL,
            source_final: None,
        };
        op.apply(&mut test_state()).unwrap();

        let mut op = BindMount {
            source: abs("/a"),
            target: abs("/b"),
            flags: 0,
            source_final: None,
        };
        assert!(matches!(op.apply(&mut test_state()), Err(Error::OpState(_))));
    }

    #[test]
    fn display_forms() {
        let eq = BindMount { source: abs("/x"), target: abs("/x"), flags: 0, source_final: None };
        assert_eq!(eq.to_string(), "\"/x\" flags 0x0");
        let ne = BindMount {
            source: abs("/x"),
            target: abs("/y"),
            flags: BIND_WRITABLE,
            source_final: None,
        };
        assert_eq!(ne.to_string(), "\"/x\" on \"/y\" flags 0x2");
    }
}
