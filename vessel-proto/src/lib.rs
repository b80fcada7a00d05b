//! Wire protocol for the vessel parent → init setup channel.
//!
//! The setup plan is serialized with [`postcard`] and framed with a
//! 4-byte big-endian length prefix, suitable for any reliable byte
//! stream (here: a pipe inherited across exec). The container init
//! decodes exactly one frame and never writes back.
//!
//! Every pathname crossing the channel is [`Absolute`]; decoding a
//! relative or empty pathname is a protocol error.

mod codec;
mod path;
mod plan;

pub use codec::{MAX_FRAME, decode, encode};
pub use path::{Absolute, AbsoluteError, sort_compact};
pub use plan::{
    ArgCmp, AutoEtc, AutoRoot, BIND_DEVICE, BIND_ENSURE, BIND_OPTIONAL, BIND_RECURSIVE,
    BIND_WRITABLE, BindMount, CANCEL_SIGNAL, CmpOp, FLAG_MULTIARCH, InitPlan, MS_NODEV, MS_NOEXEC,
    MS_NOSUID, MS_RDONLY, MS_REC, Mkdir, MountDev, MountMqueue, MountOverlay, MountProc,
    MountTmpfs, NONEXISTENT, Op, Ops, OverlayResolved, PRESET_DENY_DEVEL, PRESET_DENY_MULTI,
    PRESET_DENY_NS, PRESET_DENY_TTY, PRESET_EXT, PRESET_STRICT, Params, Place, Remount, SETUP_ENV,
    SeccompRule, Symlink, TMPFS_SIZE_MAX,
};
