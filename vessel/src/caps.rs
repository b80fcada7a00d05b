//! Capability adjustment for the init.

use caps::{CapSet, Capability, CapsHashSet};

use crate::error::{Error, Result};

/// Syscall surface of the capability drop, split out so the drop order
/// stays assertable.
trait CapApi {
    /// Highest capability number the running kernel supports.
    fn last_cap(&self) -> u32;
    /// Clears the ambient set.
    fn clear_ambient(&mut self) -> Result<()>;
    /// Removes one capability from the bounding set.
    fn drop_bounding(&mut self, cap: Capability) -> Result<()>;
    /// Raises one capability in the ambient set.
    fn raise_ambient(&mut self, cap: Capability) -> Result<()>;
    /// Replaces one capability set.
    fn set(&mut self, set: CapSet, caps: &CapsHashSet) -> Result<()>;
}

/// [`CapApi`] over the calling thread.
struct HostCaps;

impl CapApi for HostCaps {
    fn last_cap(&self) -> u32 {
        crate::init::cap_last_cap()
    }

    fn clear_ambient(&mut self) -> Result<()> {
        caps::clear(None, CapSet::Ambient).map_err(Error::Caps)
    }

    fn drop_bounding(&mut self, cap: Capability) -> Result<()> {
        caps::drop(None, CapSet::Bounding, cap).map_err(Error::Caps)
    }

    fn raise_ambient(&mut self, cap: Capability) -> Result<()> {
        caps::raise(None, CapSet::Ambient, cap).map_err(Error::Caps)
    }

    fn set(&mut self, set: CapSet, caps: &CapsHashSet) -> Result<()> {
        caps::set(None, set, caps).map_err(Error::Caps)
    }
}

/// Drops capabilities ahead of spawning the initial process.
///
/// Clears the ambient set, empties the bounding set and leaves every
/// remaining set empty except, when `privileged`, `CAP_SYS_ADMIN`
/// staying permitted, inheritable and ambient so the initial process
/// regains it across execve.
pub(crate) fn drop_all(privileged: bool) -> Result<()> {
    drop_all_with(&mut HostCaps, privileged)
}

/// [`drop_all`] over an explicit [`CapApi`].
fn drop_all_with(api: &mut impl CapApi, privileged: bool) -> Result<()> {
    api.clear_ambient()?;

    let last_cap = api.last_cap();
    for cap in caps::all() {
        if u32::from(cap.index()) > last_cap {
            continue;
        }
        if privileged && cap == Capability::CAP_SYS_ADMIN {
            continue;
        }
        api.drop_bounding(cap)?;
    }

    let mut keep = CapsHashSet::new();
    if privileged {
        keep.insert(Capability::CAP_SYS_ADMIN);
        // the spawning process granted CAP_SYS_ADMIN ambient, so it is
        // still inheritable here and the raise cannot fail
        api.raise_ambient(Capability::CAP_SYS_ADMIN)?;
    }

    // inheritable shrinks first so the ambient set is never left
    // referring to a dropped capability
    api.set(CapSet::Inheritable, &keep)?;
    api.set(CapSet::Permitted, &keep)?;
    api.set(CapSet::Effective, &CapsHashSet::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// [`CapApi`] recording calls instead of touching the kernel.
    struct RecordCaps {
        last_cap: u32,
        calls: Vec<String>,
    }

    impl RecordCaps {
        fn new(last_cap: u32) -> Self {
            Self { last_cap, calls: Vec::new() }
        }
    }

    impl CapApi for RecordCaps {
        fn last_cap(&self) -> u32 {
            self.last_cap
        }

        fn clear_ambient(&mut self) -> Result<()> {
            self.calls.push("clear ambient".into());
            Ok(())
        }

        fn drop_bounding(&mut self, cap: Capability) -> Result<()> {
            self.calls.push(format!("drop {cap}"));
            Ok(())
        }

        fn raise_ambient(&mut self, cap: Capability) -> Result<()> {
            self.calls.push(format!("raise {cap}"));
            Ok(())
        }

        fn set(&mut self, set: CapSet, caps: &CapsHashSet) -> Result<()> {
            let mut names: Vec<String> = caps.iter().map(ToString::to_string).collect();
            names.sort();
            self.calls.push(format!("set {set:?} [{}]", names.join(" ")));
            Ok(())
        }
    }

    #[test]
    fn drop_order_unprivileged() {
        let mut api = RecordCaps::new(40);
        drop_all_with(&mut api, false).unwrap();

        assert_eq!(api.calls[0], "clear ambient");
        assert!(api.calls.contains(&"drop CAP_SYS_ADMIN".to_owned()));
        assert!(!api.calls.iter().any(|c| c.starts_with("raise")));

        let n = api.calls.len();
        assert_eq!(
            &api.calls[n - 3..],
            ["set Inheritable []", "set Permitted []", "set Effective []"],
        );
    }

    #[test]
    fn privileged_retains_sys_admin() {
        let mut api = RecordCaps::new(40);
        drop_all_with(&mut api, true).unwrap();

        assert!(!api.calls.contains(&"drop CAP_SYS_ADMIN".to_owned()));

        // ambient raise happens after the bounding set is emptied
        let raise = api.calls.iter().position(|c| c == "raise CAP_SYS_ADMIN").unwrap();
        let last_drop = api.calls.iter().rposition(|c| c.starts_with("drop ")).unwrap();
        assert!(raise > last_drop);

        let n = api.calls.len();
        assert_eq!(
            &api.calls[n - 3..],
            [
                "set Inheritable [CAP_SYS_ADMIN]",
                "set Permitted [CAP_SYS_ADMIN]",
                "set Effective []",
            ],
        );
    }

    #[test]
    fn bounding_drop_bounded_by_last_cap() {
        let mut api = RecordCaps::new(20);
        drop_all_with(&mut api, false).unwrap();
        for cap in caps::all() {
            let dropped = api.calls.contains(&format!("drop {cap}"));
            assert_eq!(dropped, u32::from(cap.index()) <= 20, "{cap}");
        }
    }
}
