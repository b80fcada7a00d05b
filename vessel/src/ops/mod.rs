//! Behaviour of setup plan ops.
//!
//! Every op runs in two passes. The early pass happens before the init
//! enters the intermediate root, while host pathnames still resolve;
//! it validates arguments and captures resolved state. The apply pass
//! happens inside the intermediate root, where the host is visible at
//! `/host` and the future container root is assembled under
//! `/sysroot`.

mod autoetc;
mod autoroot;
mod bind;
mod dev;
mod misc;
mod overlay;
mod tmpfs;

use std::fs;

use vessel_proto::Op;

use crate::error::{Error, Result};

/// AutoEtc has already run.
pub(crate) const NR_AUTOETC: u32 = 1 << 0;
/// AutoRoot has already run.
pub(crate) const NR_AUTOROOT: u32 = 1 << 1;

/// Mutable state shared by both op passes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SetupState {
    /// Mode bits of implicitly created parent directories.
    pub parent_perm: u32,
    /// Whether the init kept the controlling session.
    pub retain_session: bool,
    /// Bitset of non-repeatable ops that have run.
    pub nonrepeatable: u32,
}

/// The capability set every op variant implements.
pub(crate) trait SetupOp {
    /// Cheap argument validity check, run for the whole plan before
    /// any pass starts.
    fn valid(&self) -> bool {
        true
    }

    /// Early pass, run before entering the intermediate root.
    fn early(&mut self, state: &mut SetupState) -> Result<()> {
        let _ = state;
        Ok(())
    }

    /// Apply pass, run inside the intermediate root.
    fn apply(&mut self, state: &mut SetupState) -> Result<()>;

    /// Verb prefixing the op's log line.
    fn prefix(&self) -> &'static str;
}

impl SetupOp for Op {
    fn valid(&self) -> bool {
        match self {
            Self::Bind(op) => op.valid(),
            Self::Overlay(op) => op.valid(),
            Self::Proc(op) => op.valid(),
            Self::Dev(op) => op.valid(),
            Self::Mqueue(op) => op.valid(),
            Self::Tmpfs(op) => op.valid(),
            Self::Mkdir(op) => op.valid(),
            Self::Symlink(op) => op.valid(),
            Self::Place(op) => op.valid(),
            Self::Remount(op) => op.valid(),
            Self::AutoEtc(op) => op.valid(),
            Self::AutoRoot(op) => op.valid(),
        }
    }

    fn early(&mut self, state: &mut SetupState) -> Result<()> {
        match self {
            Self::Bind(op) => op.early(state),
            Self::Overlay(op) => op.early(state),
            Self::Proc(op) => op.early(state),
            Self::Dev(op) => op.early(state),
            Self::Mqueue(op) => op.early(state),
            Self::Tmpfs(op) => op.early(state),
            Self::Mkdir(op) => op.early(state),
            Self::Symlink(op) => op.early(state),
            Self::Place(op) => op.early(state),
            Self::Remount(op) => op.early(state),
            Self::AutoEtc(op) => op.early(state),
            Self::AutoRoot(op) => op.early(state),
        }
    }

    fn apply(&mut self, state: &mut SetupState) -> Result<()> {
        match self {
            Self::Bind(op) => op.apply(state),
            Self::Overlay(op) => op.apply(state),
            Self::Proc(op) => op.apply(state),
            Self::Dev(op) => op.apply(state),
            Self::Mqueue(op) => op.apply(state),
            Self::Tmpfs(op) => op.apply(state),
            Self::Mkdir(op) => op.apply(state),
            Self::Symlink(op) => op.apply(state),
            Self::Place(op) => op.apply(state),
            Self::Remount(op) => op.apply(state),
            Self::AutoEtc(op) => op.apply(state),
            Self::AutoRoot(op) => op.apply(state),
        }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Self::Bind(op) => op.prefix(),
            Self::Overlay(op) => op.prefix(),
            Self::Proc(op) => op.prefix(),
            Self::Dev(op) => op.prefix(),
            Self::Mqueue(op) => op.prefix(),
            Self::Tmpfs(op) => op.prefix(),
            Self::Mkdir(op) => op.prefix(),
            Self::Symlink(op) => op.prefix(),
            Self::Place(op) => op.prefix(),
            Self::Remount(op) => op.prefix(),
            Self::AutoEtc(op) => op.prefix(),
            Self::AutoRoot(op) => op.prefix(),
        }
    }
}

/// Directory entry names of `path`, sorted by name. Entries with
/// non-unicode names are skipped.
pub(crate) fn sorted_entries(path: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for ent in fs::read_dir(path).map_err(|e| Error::path("readdir", path, e))? {
        let ent = ent.map_err(|e| Error::path("readdir", path, e))?;
        match ent.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => tracing::debug!("skipping non-unicode entry {name:?}"),
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
pub(crate) fn test_state() -> SetupState {
    SetupState { parent_perm: 0o755, retain_session: false, nonrepeatable: 0 }
}
