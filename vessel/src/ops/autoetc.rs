//! Host /etc setup op.
//!
//! The host /etc is expected to have been bound under a hidden prefix
//! inside the container /etc beforehand; this op fills /etc itself
//! with symlinks into that prefix, so the container can carry its own
//! passwd and group while everything else follows the host.

use vessel_proto::AutoEtc;

use crate::error::{Error, Result};
use crate::mount::{mkdir_all, symlink, to_sysroot};
use crate::ops::{NR_AUTOETC, SetupOp, SetupState, sorted_entries};

impl SetupOp for AutoEtc {
    fn apply(&mut self, state: &mut SetupState) -> Result<()> {
        if state.nonrepeatable & NR_AUTOETC != 0 {
            return Err(Error::OpRepeat("autoetc"));
        }
        state.nonrepeatable |= NR_AUTOETC;

        let etc = to_sysroot("/etc");
        mkdir_all(&etc, 0o755)?;

        let rel = self.host_rel();
        for name in sorted_entries(&to_sysroot(self.host_path().as_str()))? {
            match name.as_str() {
                // the hidden bind itself, and entries installed separately
                ".host" | "passwd" | "group" => {}
                "mtab" => symlink("/proc/mounts", &format!("{etc}/{name}"))?,
                _ => symlink(&format!("{rel}/{name}"), &format!("{etc}/{name}"))?,
            }
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
    use vessel_proto::Op;

    use crate::ops::test_state;

    #[test]
    fn autoetc_is_not_repeatable() {
        let mut state = test_state();
        state.nonrepeatable = NR_AUTOETC;
        let mut op = Op::AutoEtc(AutoEtc { prefix: "0".into() });
        assert!(matches!(op.apply(&mut state), Err(Error::OpRepeat("autoetc"))));
    }
}
