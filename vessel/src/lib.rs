//! Unprivileged Linux application sandbox built on user namespaces.
//!
//! `vessel` assembles a container root out of a plan of filesystem
//! ops, pivots a freshly cloned init into it, drops capabilities,
//! installs seccomp and landlock policies and runs a single program
//! inside, reaping everything the new pid namespace adopts.
//!
//! # Quick start
//!
//! ```no_run
//! use vessel::Container;
//! use vessel::proto::{Absolute, Ops, PRESET_STRICT, Params};
//!
//! let root = Absolute::new("/").unwrap();
//! let mut ops = Ops::new();
//! ops.root(&root, "0", 0)
//!     .procfs(&Absolute::new("/proc").unwrap())
//!     .dev(&Absolute::new("/dev").unwrap(), false)
//!     .tmpfs(&Absolute::new("/tmp").unwrap(), 0, 0o1777);
//!
//! let mut container = Container::new(Params {
//!     path: Some(Absolute::new("/bin/sh").unwrap()),
//!     args: vec!["sh".into(), "-l".into()],
//!     ops: ops.into_vec(),
//!     seccomp_presets: PRESET_STRICT,
//!     ..Params::default()
//! });
//! container.start().unwrap();
//! container.serve().unwrap();
//! container.wait().unwrap();
//! ```
//!
//! The container parent re-executes its own binary as the in-namespace
//! init; every consuming binary must call [`try_argv0`] first thing in
//! its main function.

#[cfg(target_os = "linux")]
mod caps;
#[cfg(target_os = "linux")]
mod container;
mod error;
#[cfg(target_os = "linux")]
mod init;
#[cfg(target_os = "linux")]
mod landlock;
#[cfg(target_os = "linux")]
mod mount;
#[cfg(target_os = "linux")]
mod ops;
pub mod output;
#[cfg(target_os = "linux")]
mod seccomp;
pub mod vfs;

pub use vessel_proto as proto;

/// Wait status of the init, as returned by [`Container::wait`].
#[cfg(target_os = "linux")]
pub use nix::sys::wait::WaitStatus;

#[cfg(target_os = "linux")]
pub use container::Container;
pub use error::{Error, MountError, OverlayError, Result};
#[cfg(target_os = "linux")]
pub use init::try_argv0;
#[cfg(target_os = "linux")]
pub use mount::{HOST_PATH, SYSROOT_PATH};
