//! Host root mirror op.
//!
//! Mirrors the host root into the container by binding every
//! first-level entry except those the container provides itself.

use vessel_proto::{Absolute, AutoRoot, BindMount};

use crate::error::{Error, Result};
use crate::ops::{NR_AUTOROOT, SetupOp, SetupState, sorted_entries};

/// Whether a first-level host entry takes part in the mirror.
fn bindable(name: &str) -> bool {
    !matches!(name, "" | "proc" | "dev" | "tmp" | "mnt" | "etc")
}

impl SetupOp for AutoRoot {
    fn early(&mut self, state: &mut SetupState) -> Result<()> {
        let entries = sorted_entries(self.host.as_str())?;
        self.resolved = Vec::with_capacity(entries.len());
        for name in entries {
            if !bindable(&name) {
                tracing::debug!("skipping unbindable root entry {name:?}");
                continue;
            }

            let mut op = BindMount {
                source: self.host.append(&name),
                target: Absolute::new("/")?.append(&name),
                flags: self.flags,
                source_final: None,
            };
            op.early(state)?;
            self.resolved.push(op);
        }
        Ok(())
    }

    fn apply(&mut self, state: &mut SetupState) -> Result<()> {
        if state.nonrepeatable & NR_AUTOROOT != 0 {
            return Err(Error::OpRepeat("autoroot"));
        }
        state.nonrepeatable |= NR_AUTOROOT;

        for op in &mut self.resolved {
            if !op.valid() {
                // unreachable
                return Err(Error::OpState("invalid bind in root mirror"));
            }
            tracing::debug!("{} {}", op.prefix(), op);
            op.apply(state)?;
        }
        Ok(())
    }

    fn prefix(&self) -> &'static str {
        "setting up"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::fs;

    use crate::ops::test_state;

    #[test]
    fn bindable_excludes_provided_entries() {
        for name in ["proc", "dev", "tmp", "mnt", "etc", ""] {
            assert!(!bindable(name), "{name:?} must not be bindable");
        }
        for name in ["bin", "usr", "var", "nix", "home"] {
            assert!(bindable(name), "{name:?} must be bindable");
        }
    }

    #[test]
    fn early_constructs_child_binds() {
        let dir = tempfile::tempdir().unwrap();
        let base = fs::canonicalize(dir.path()).unwrap();
        let base = base.to_str().unwrap();
        for name in ["usr", "bin", "proc", "etc"] {
            fs::create_dir(format!("{base}/{name}")).unwrap();
        }

        let mut op = AutoRoot {
            host: Absolute::new(base).unwrap(),
            prefix: "0".into(),
            flags: 0,
            resolved: Vec::new(),
        };
        op.early(&mut test_state()).unwrap();

        let targets: Vec<&str> =
            op.resolved.iter().map(|b| b.target.as_str()).collect();
        assert_eq!(targets, ["/bin", "/usr"]);
        for b in &op.resolved {
            assert!(b.source_final.is_some());
        }
    }

    #[test]
    fn autoroot_is_not_repeatable() {
        let mut state = test_state();
        state.nonrepeatable = NR_AUTOROOT;
        let mut op = AutoRoot {
            host: Absolute::new("/").unwrap(),
            prefix: "0".into(),
            flags: 0,
            resolved: Vec::new(),
        };
        assert!(matches!(op.apply(&mut state), Err(Error::OpRepeat("autoroot"))));
    }
}
