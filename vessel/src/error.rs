//! Error types for vessel operations.

use std::io;
use std::path::PathBuf;

use vessel_proto::AbsoluteError;

/// Alias for `Result<T, vessel::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Mount flag value of `MS_BIND`.
const MS_BIND: u64 = 0x1000;
/// Mount flag value of `MS_REMOUNT`.
const MS_REMOUNT: u64 = 0x20;

/// A failed mount(2) call with the arguments it was made with.
///
/// The display form distinguishes bind mounts, remounts, typed mounts
/// and the flagless fallback, matching what an operator would write by
/// hand to reproduce the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountError {
    /// Mount source argument.
    pub source: String,
    /// Mount target argument.
    pub target: String,
    /// Filesystem type argument; empty for bind mounts and remounts.
    pub fstype: String,
    /// `MS_*` flags argument.
    pub flags: u64,
    /// Options data argument.
    pub data: String,
    /// Errno returned by the kernel.
    pub errno: i32,
}

impl std::error::Error for MountError {}

impl std::fmt::Display for MountError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cause = io::Error::from_raw_os_error(self.errno);
        if self.flags & MS_BIND != 0 {
            if self.flags & MS_REMOUNT != 0 {
                return write!(f, "remount {}: {cause}", self.target);
            }
            return write!(f, "bind {} on {}: {cause}", self.source, self.target);
        }
        if !self.fstype.is_empty() {
            return write!(f, "mount {} on {}: {cause}", self.fstype, self.target);
        }
        write!(f, "mount {}: {cause}", self.target)
    }
}

/// Invalid overlay op arguments, detected before touching the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum OverlayError {
    /// An upper layer was given without a work directory and is not `/`.
    #[error("upper layer has no work directory and does not request an ephemeral overlay")]
    UnexpectedUpper,
    /// A read-only overlay needs at least two lower layers.
    #[error("readonly overlay requires at least two lowerdir")]
    ReadonlyLower,
    /// A writable overlay needs at least one lower layer.
    #[error("overlay requires at least one lowerdir")]
    EmptyLower,
}

/// Errors returned by vessel setup and container management.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The init was invoked outside a fresh pid namespace.
    #[error("this process must run as pid 1")]
    NotPid1,

    /// A failed init setup step with the errno it failed with.
    #[cfg(target_os = "linux")]
    #[error("{step}: {source}")]
    Setup {
        /// Name of the failed step.
        step: &'static str,
        /// Errno returned by the kernel.
        #[source]
        source: nix::errno::Errno,
    },

    /// The setup fd environment variable is absent.
    #[error("setup fd environment variable is not set")]
    SetupEnvNotSet,

    /// The setup fd environment variable is not a decimal integer.
    #[error("invalid setup fd index {0:?}")]
    SetupEnvFormat(String),

    /// The setup fd index does not refer to an inherited descriptor.
    #[error("setup fd {0} out of range")]
    SetupFdRange(i64),

    /// Malformed setup payload; always fatal.
    #[error("cannot decode init setup payload: {0}")]
    PlanDecode(#[source] io::Error),

    /// The plan names no initial process.
    #[error("invalid executable path in parameters")]
    NoExecutable,

    /// A pathname was not absolute. Equivalent to `EINVAL`.
    #[error(transparent)]
    NotAbsolute(#[from] AbsoluteError),

    /// A mount(2) call failed.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// Mountinfo could not be read or interpreted.
    #[error("cannot unfold mount hierarchy: {0}")]
    MountInfo(#[from] crate::vfs::DecoderError),

    /// Invalid overlay arguments.
    #[error(transparent)]
    Overlay(#[from] OverlayError),

    /// An op failed its validity check.
    #[error("invalid op at index {0}")]
    OpInvalid(usize),

    /// A non-repeatable op was applied twice.
    #[error("{0} is not repeatable")]
    OpRepeat(&'static str),

    /// Internal op invariant violation; indicates a bug.
    #[error("invalid op state: {0}")]
    OpState(&'static str),

    /// Tmpfs size argument out of bounds.
    #[error("tmpfs size {0} out of bounds")]
    TmpfsSize(usize),

    /// An OS operation failed without yielding a bare errno.
    #[error("{op} {}: {source}", path.display())]
    Path {
        /// Name of the failed operation.
        op: &'static str,
        /// Pathname the operation was applied to.
        path: PathBuf,
        /// Underlying cause.
        #[source]
        source: io::Error,
    },

    /// A raw errno from a syscall wrapper.
    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Os(#[from] nix::errno::Errno),

    /// Seccomp program compilation or installation failure.
    #[cfg(target_os = "linux")]
    #[error("cannot load seccomp filter: {0}")]
    Seccomp(#[source] seccompiler::Error),

    /// Capability set manipulation failure.
    #[cfg(target_os = "linux")]
    #[error("cannot adjust capabilities: {0}")]
    Caps(#[source] caps::errors::CapsError),

    /// Landlock syscall failure.
    #[error("{step}: {source}")]
    Landlock {
        /// Name of the failed step.
        step: &'static str,
        /// Errno returned by the kernel.
        #[source]
        source: io::Error,
    },

    /// The kernel cannot scope abstract unix sockets.
    #[error("kernel version too old for abstract unix socket scoping")]
    LandlockAbi(i32),

    /// An I/O error with no more specific classification.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps an io error with the failing operation and pathname,
    /// passing raw errnos through unchanged.
    pub fn path(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        #[cfg(target_os = "linux")]
        if let Some(code) = source.raw_os_error() {
            return Self::Os(nix::errno::Errno::from_raw(code));
        }
        Self::Path { op, path: path.into(), source }
    }

    /// Single-line operator-facing form, `cannot <step>: <cause>` where
    /// the message does not already read naturally.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::Mount(_) | Self::Path { .. } | Self::Landlock { .. } => {
                format!("cannot {self}")
            }
            #[cfg(target_os = "linux")]
            Self::Setup { .. } => format!("cannot {self}"),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn mount_error_display_forms() {
        let mut e = MountError {
            source: "/etc".into(),
            target: "/sysroot/etc".into(),
            fstype: String::new(),
            flags: MS_BIND,
            data: String::new(),
            errno: libc::ENOENT,
        };
        assert_eq!(
            e.to_string(),
            format!(
                "bind /etc on /sysroot/etc: {}",
                io::Error::from_raw_os_error(libc::ENOENT)
            )
        );

        e.flags = MS_BIND | MS_REMOUNT;
        assert!(e.to_string().starts_with("remount /sysroot/etc: "));

        e.flags = 0;
        e.fstype = "proc".into();
        assert!(e.to_string().starts_with("mount proc on /sysroot/etc: "));

        e.fstype = String::new();
        assert!(e.to_string().starts_with("mount /sysroot/etc: "));
    }

    #[test]
    fn message_prefixes_cannot() {
        let e = Error::Mount(MountError {
            source: "/a".into(),
            target: "/b".into(),
            fstype: String::new(),
            flags: MS_BIND,
            data: String::new(),
            errno: libc::EPERM,
        });
        assert!(e.message().starts_with("cannot bind /a on /b: "));

        let repeat = Error::OpRepeat("autoetc");
        assert_eq!(repeat.message(), "autoetc is not repeatable");
    }

    #[test]
    fn path_wrapper_extracts_errno() {
        let e = Error::path(
            "open",
            "/proc/self/fd",
            io::Error::from_raw_os_error(libc::EACCES),
        );
        assert!(matches!(e, Error::Os(errno) if errno == nix::errno::Errno::EACCES));

        let plain = Error::path("readlink", "/x", io::Error::other("no errno"));
        assert_eq!(plain.message(), "cannot readlink /x: no errno");
    }
}
