//! Setup plan: everything the parent tells the container init to do.
//!
//! The plan travels as a single frame over the setup pipe. Op variants
//! are a tagged enum; postcard assigns stable indices from declaration
//! order, so appending new variants is wire-compatible while reordering
//! is not. Fields marked `serde(skip)` hold state resolved inside the
//! init and never cross the wire.

use serde::{Deserialize, Serialize};

use crate::path::Absolute;

/// Environment variable carrying the setup pipe fd index.
pub const SETUP_ENV: &str = "VESSEL_SETUP";

/// Pathname guaranteed to never exist in a mounted procfs.
pub const NONEXISTENT: &str = "/proc/nonexistent";

/// Upper bound on a tmpfs size option, in bytes.
pub const TMPFS_SIZE_MAX: usize = (isize::MAX as usize) / 2;

/// Signal delivered to the init on cancellation.
pub const CANCEL_SIGNAL: i32 = 15; // SIGTERM

/// Bind flag: skip the mount entirely if the source does not exist.
pub const BIND_OPTIONAL: u32 = 1 << 0;
/// Bind flag: do not remount the target read-only.
pub const BIND_WRITABLE: u32 = 1 << 1;
/// Bind flag: allow access to device nodes under the target.
pub const BIND_DEVICE: u32 = 1 << 2;
/// Bind flag: create the source directory on the host if missing.
/// Mutually exclusive with [`BIND_OPTIONAL`].
pub const BIND_ENSURE: u32 = 1 << 3;
/// Bind flag: accepted for explicitness; bind mounts always recurse.
pub const BIND_RECURSIVE: u32 = 1 << 4;

/// Mount flag values as defined by the Linux vfs ABI.
pub const MS_RDONLY: u64 = 0x1;
/// Disallow setuid/setgid bit interpretation.
pub const MS_NOSUID: u64 = 0x2;
/// Disallow access to device special files.
pub const MS_NODEV: u64 = 0x4;
/// Disallow program execution.
pub const MS_NOEXEC: u64 = 0x8;
/// Apply to the entire subtree.
pub const MS_REC: u64 = 0x4000;

/// Seccomp preset: project-specific extension rules.
pub const PRESET_EXT: u32 = 1 << 0;
/// Seccomp preset: deny namespace setup syscalls.
pub const PRESET_DENY_NS: u32 = 1 << 1;
/// Seccomp preset: deny faking terminal input.
pub const PRESET_DENY_TTY: u32 = 1 << 2;
/// Seccomp preset: deny development-related syscalls.
pub const PRESET_DENY_DEVEL: u32 = 1 << 3;
/// Seccomp preset: restrict the allowed execution domain to PER_LINUX32.
pub const PRESET_DENY_MULTI: u32 = 1 << 4;
/// Seccomp preset: the four deny presets combined.
pub const PRESET_STRICT: u32 = PRESET_EXT | PRESET_DENY_NS | PRESET_DENY_TTY | PRESET_DENY_DEVEL;

/// Seccomp flag: keep rules for the compat architecture and emulation.
pub const FLAG_MULTIARCH: u32 = 1 << 0;

/// Comparison operator of an [`ArgCmp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Equal.
    Eq,
    /// Greater than or equal.
    Ge,
    /// Greater than.
    Gt,
    /// Masked equality: `arg & datum_a == datum_b`.
    MaskedEq,
}

/// Optional argument condition attached to a [`SeccompRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgCmp {
    /// Syscall argument index, 0 through 5.
    pub arg: u8,
    /// Comparison operator.
    pub op: CmpOp,
    /// First operand (value, or mask for [`CmpOp::MaskedEq`]).
    pub datum_a: u64,
    /// Second operand, used by [`CmpOp::MaskedEq`].
    pub datum_b: u64,
}

/// A single deny rule in an allow-default seccomp filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeccompRule {
    /// Syscall number on the native architecture.
    pub syscall: i64,
    /// Errno returned when the rule matches.
    pub errno: i32,
    /// Optional argument condition; `None` matches unconditionally.
    pub arg: Option<ArgCmp>,
}

/// Bind mounts a host path inside the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindMount {
    /// Host source pathname.
    pub source: Absolute,
    /// Container target pathname.
    pub target: Absolute,
    /// `BIND_*` flag bits.
    pub flags: u32,
    /// Symlink-resolved source, filled during the early pass; left
    /// `None` when an optional source is missing.
    #[serde(skip)]
    pub source_final: Option<Absolute>,
}

/// Mounts an overlay filesystem inside the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountOverlay {
    /// Container target pathname.
    pub target: Absolute,
    /// Lower layers, topmost first.
    pub lower: Vec<Absolute>,
    /// Upper (writable) layer; `/` requests an ephemeral upper.
    pub upper: Option<Absolute>,
    /// Work directory; must accompany a non-ephemeral upper.
    pub work: Option<Absolute>,

    /// Escaped, host-prefixed option segments from the early pass.
    #[serde(skip)]
    pub resolved: OverlayResolved,
}

/// Resolved state of a [`MountOverlay`], not transmitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayResolved {
    /// Escaped lower layer pathnames.
    pub lower: Vec<String>,
    /// Escaped upper layer pathname, empty when read-only or ephemeral.
    pub upper: String,
    /// Escaped work directory pathname.
    pub work: String,
    /// Whether the upper and work directories are created at apply time.
    pub ephemeral: bool,
}

/// Mounts a private instance of proc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountProc {
    /// Container target pathname.
    pub target: Absolute,
}

/// Builds a restricted /dev out of host device node binds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountDev {
    /// Container target pathname.
    pub target: Absolute,
    /// Whether to mount a private mqueue under the target.
    pub mqueue: bool,
    /// Whether to leave the tree writable instead of remounting it
    /// read-only.
    pub write: bool,
}

/// Mounts a private mqueue instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountMqueue {
    /// Container target pathname.
    pub target: Absolute,
}

/// Mounts a tmpfs with explicit source name, size, mode and flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTmpfs {
    /// Source name shown in mountinfo.
    pub fs_name: String,
    /// Container target pathname.
    pub target: Absolute,
    /// Size in bytes; zero omits the size option.
    pub size: usize,
    /// Mode bits passed in the mount options.
    pub perm: u32,
    /// `MS_*` mount flags.
    pub flags: u64,
}

/// Creates a directory inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mkdir {
    /// Container pathname.
    pub path: Absolute,
    /// Mode bits of created directories.
    pub perm: u32,
}

/// Creates a symlink inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symlink {
    /// Container pathname of the link itself.
    pub target: Absolute,
    /// Link contents; replaced by its readlink result during the early
    /// pass when `dereference` is set.
    pub link_name: String,
    /// Whether `link_name` names a host symlink to dereference.
    pub dereference: bool,
}

/// Places a byte payload at a container pathname via a read-only bind
/// of an unlinked temporary file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    /// Container pathname.
    pub path: Absolute,
    /// Literal file contents.
    pub data: Vec<u8>,
}

/// Remounts a subtree with new flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remount {
    /// Container target pathname.
    pub target: Absolute,
    /// `MS_*` mount flags.
    pub flags: u64,
}

/// Expands host /etc into a symlink forest under the container's /etc.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoEtc {
    /// Unique per-container prefix of the host directory name.
    pub prefix: String,
}

impl AutoEtc {
    /// Container pathname the host /etc is bound to.
    #[must_use]
    pub fn host_path(&self) -> Absolute {
        Absolute::trusted("/etc").append(&self.host_rel())
    }

    /// Pathname of the bound host /etc relative to the container /etc.
    #[must_use]
    pub fn host_rel(&self) -> String {
        format!(".host/{}", self.prefix)
    }
}

/// Expands a host directory into top-level bind mounts on the container
/// root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoRoot {
    /// Host directory to mirror.
    pub host: Absolute,
    /// Unique per-container prefix, reserved for mirror bookkeeping.
    pub prefix: String,
    /// `BIND_*` flags passed through to every child bind.
    pub flags: u32,

    /// Child binds constructed during the early pass.
    #[serde(skip)]
    pub resolved: Vec<BindMount>,
}

/// One step of container filesystem setup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    /// See [`BindMount`].
    Bind(BindMount),
    /// See [`MountOverlay`].
    Overlay(MountOverlay),
    /// See [`MountProc`].
    Proc(MountProc),
    /// See [`MountDev`].
    Dev(MountDev),
    /// See [`MountMqueue`].
    Mqueue(MountMqueue),
    /// See [`MountTmpfs`].
    Tmpfs(MountTmpfs),
    /// See [`Mkdir`].
    Mkdir(Mkdir),
    /// See [`Symlink`].
    Symlink(Symlink),
    /// See [`Place`].
    Place(Place),
    /// See [`Remount`].
    Remount(Remount),
    /// See [`AutoEtc`].
    AutoEtc(AutoEtc),
    /// See [`AutoRoot`].
    AutoRoot(AutoRoot),
}

impl std::fmt::Display for BindMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.source == self.target {
            write!(f, "{:?} flags {:#x}", self.source.as_str(), self.flags)
        } else {
            write!(
                f,
                "{:?} on {:?} flags {:#x}",
                self.source.as_str(),
                self.target.as_str(),
                self.flags
            )
        }
    }
}

impl std::fmt::Display for MountOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "overlay on {:?} with {} layers", self.target.as_str(), self.lower.len())
    }
}

impl std::fmt::Display for MountProc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proc on {:?}", self.target.as_str())
    }
}

impl std::fmt::Display for MountDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.mqueue {
            write!(f, "dev on {:?} with mqueue", self.target.as_str())
        } else {
            write!(f, "dev on {:?}", self.target.as_str())
        }
    }
}

impl std::fmt::Display for MountMqueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mqueue on {:?}", self.target.as_str())
    }
}

impl std::fmt::Display for MountTmpfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tmpfs on {:?} size {}", self.target.as_str(), self.size)
    }
}

impl std::fmt::Display for Mkdir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "directory {:?} perm 0{:o}", self.path.as_str(), self.perm)
    }
}

impl std::fmt::Display for Symlink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "symlink on {:?} linkname {:?}", self.target.as_str(), self.link_name)
    }
}

impl std::fmt::Display for Place {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tmpfile {:?} ({} bytes)", self.path.as_str(), self.data.len())
    }
}

impl std::fmt::Display for Remount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} flags {:#x}", self.target.as_str(), self.flags)
    }
}

impl std::fmt::Display for AutoEtc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "auto etc {}", self.prefix)
    }
}

impl std::fmt::Display for AutoRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "auto root {:?} prefix {} flags {:#x}",
            self.host.as_str(),
            self.prefix,
            self.flags
        )
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(op) => op.fmt(f),
            Self::Overlay(op) => op.fmt(f),
            Self::Proc(op) => op.fmt(f),
            Self::Dev(op) => op.fmt(f),
            Self::Mqueue(op) => op.fmt(f),
            Self::Tmpfs(op) => op.fmt(f),
            Self::Mkdir(op) => op.fmt(f),
            Self::Symlink(op) => op.fmt(f),
            Self::Place(op) => op.fmt(f),
            Self::Remount(op) => op.fmt(f),
            Self::AutoEtc(op) => op.fmt(f),
            Self::AutoRoot(op) => op.fmt(f),
        }
    }
}

/// Chainable builder over an op list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ops(Vec<Op>);

impl Ops {
    /// Creates an empty op list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw op.
    pub fn push(&mut self, op: Op) -> &mut Self {
        self.0.push(op);
        self
    }

    /// Appends a bind mount of `source` on `target`.
    pub fn bind(&mut self, source: &Absolute, target: &Absolute, flags: u32) -> &mut Self {
        self.push(Op::Bind(BindMount {
            source: source.clone(),
            target: target.clone(),
            flags,
            source_final: None,
        }))
    }

    /// Appends a writable overlay mount.
    pub fn overlay(
        &mut self,
        target: &Absolute,
        upper: &Absolute,
        work: &Absolute,
        lower: &[Absolute],
    ) -> &mut Self {
        self.push(Op::Overlay(MountOverlay {
            target: target.clone(),
            lower: lower.to_vec(),
            upper: Some(upper.clone()),
            work: Some(work.clone()),
            resolved: OverlayResolved::default(),
        }))
    }

    /// Appends an overlay mount with an ephemeral upper layer.
    pub fn overlay_ephemeral(&mut self, target: &Absolute, lower: &[Absolute]) -> &mut Self {
        self.push(Op::Overlay(MountOverlay {
            target: target.clone(),
            lower: lower.to_vec(),
            upper: Some(Absolute::trusted("/")),
            work: None,
            resolved: OverlayResolved::default(),
        }))
    }

    /// Appends a read-only overlay mount; requires at least two lower
    /// layers at apply time.
    pub fn overlay_readonly(&mut self, target: &Absolute, lower: &[Absolute]) -> &mut Self {
        self.push(Op::Overlay(MountOverlay {
            target: target.clone(),
            lower: lower.to_vec(),
            upper: None,
            work: None,
            resolved: OverlayResolved::default(),
        }))
    }

    /// Appends a private proc mount.
    pub fn procfs(&mut self, target: &Absolute) -> &mut Self {
        self.push(Op::Proc(MountProc { target: target.clone() }))
    }

    /// Appends a read-only restricted /dev.
    pub fn dev(&mut self, target: &Absolute, mqueue: bool) -> &mut Self {
        self.push(Op::Dev(MountDev { target: target.clone(), mqueue, write: false }))
    }

    /// Appends a writable restricted /dev.
    pub fn dev_writable(&mut self, target: &Absolute, mqueue: bool) -> &mut Self {
        self.push(Op::Dev(MountDev { target: target.clone(), mqueue, write: true }))
    }

    /// Appends a standalone mqueue mount.
    pub fn mqueue(&mut self, target: &Absolute) -> &mut Self {
        self.push(Op::Mqueue(MountMqueue { target: target.clone() }))
    }

    /// Appends an "ephemeral" tmpfs mount.
    pub fn tmpfs(&mut self, target: &Absolute, size: usize, perm: u32) -> &mut Self {
        self.push(Op::Tmpfs(MountTmpfs {
            fs_name: "ephemeral".into(),
            target: target.clone(),
            size,
            perm,
            flags: MS_NOSUID | MS_NODEV,
        }))
    }

    /// Appends a read-only "readonly" tmpfs mount.
    pub fn readonly(&mut self, target: &Absolute, perm: u32) -> &mut Self {
        self.push(Op::Tmpfs(MountTmpfs {
            fs_name: "readonly".into(),
            target: target.clone(),
            size: 0,
            perm,
            flags: MS_RDONLY | MS_NOSUID | MS_NODEV,
        }))
    }

    /// Appends a directory creation.
    pub fn mkdir(&mut self, path: &Absolute, perm: u32) -> &mut Self {
        self.push(Op::Mkdir(Mkdir { path: path.clone(), perm }))
    }

    /// Appends a symlink creation.
    pub fn symlink(&mut self, target: &Absolute, link_name: &str, dereference: bool) -> &mut Self {
        self.push(Op::Symlink(Symlink {
            target: target.clone(),
            link_name: link_name.into(),
            dereference,
        }))
    }

    /// Appends placement of literal file contents.
    pub fn place(&mut self, path: &Absolute, data: Vec<u8>) -> &mut Self {
        self.push(Op::Place(Place { path: path.clone(), data }))
    }

    /// Appends a remount.
    pub fn remount(&mut self, target: &Absolute, flags: u64) -> &mut Self {
        self.push(Op::Remount(Remount { target: target.clone(), flags }))
    }

    /// Appends the /etc expansion: mkdir, host bind, symlink forest.
    pub fn etc(&mut self, host: &Absolute, prefix: &str) -> &mut Self {
        let e = AutoEtc { prefix: prefix.into() };
        self.mkdir(&Absolute::trusted("/etc"), 0o755);
        self.bind(host, &e.host_path(), 0);
        self.push(Op::AutoEtc(e))
    }

    /// Appends a root mirror of `host`.
    pub fn root(&mut self, host: &Absolute, prefix: &str, flags: u32) -> &mut Self {
        self.push(Op::AutoRoot(AutoRoot {
            host: host.clone(),
            prefix: prefix.into(),
            flags,
            resolved: Vec::new(),
        }))
    }

    /// Consumes the builder into the op list.
    #[must_use]
    pub fn into_vec(self) -> Vec<Op> {
        self.0
    }

    /// Borrows the op list.
    #[must_use]
    pub fn as_slice(&self) -> &[Op] {
        &self.0
    }
}

/// Parent-produced description of the container to set up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    /// Pathname of the initial process; absent is a setup failure.
    pub path: Option<Absolute>,
    /// Argv of the initial process, including argv 0.
    pub args: Vec<String>,
    /// Environment of the initial process, `KEY=value` entries.
    pub env: Vec<String>,
    /// Working directory of the initial process.
    pub dir: Absolute,
    /// Ordered filesystem setup ops.
    pub ops: Vec<Op>,

    /// Container uid; values at or below zero map to the overflow uid.
    pub uid: i32,
    /// Container gid; values at or below zero map to the overflow gid.
    pub gid: i32,
    /// Hostname set in the new UTS namespace, if any.
    pub hostname: Option<String>,

    /// Explicit seccomp rules; when non-empty, presets are ignored.
    pub seccomp_rules: Vec<SeccompRule>,
    /// `FLAG_*` seccomp flag bits.
    pub seccomp_flags: u32,
    /// `PRESET_*` seccomp preset bits.
    pub seccomp_presets: u32,
    /// Disables seccomp filter load entirely.
    pub seccomp_disable: bool,

    /// Mode bits of implicitly created parent directories; zero means
    /// `0755`.
    pub parent_perm: u32,
    /// Grace window in milliseconds for adopted descendants after the
    /// initial child exits; zero means 5000, negative disables.
    pub adopt_wait_delay_ms: i64,

    /// Retain CAP_SYS_ADMIN in the bounding set.
    pub privileged: bool,
    /// Do not call setsid; keeps the controlling terminal reachable.
    pub retain_session: bool,
    /// Share the host network namespace.
    pub host_net: bool,
    /// Do not scope abstract unix sockets via Landlock.
    pub host_abstract: bool,
    /// Translate SIGTERM received by the init into SIGINT to the child.
    pub forward_cancel: bool,
}

impl Default for Params {
    /// An empty plan rooted at `/` with no initial process.
    fn default() -> Self {
        Self {
            path: None,
            args: Vec::new(),
            env: Vec::new(),
            dir: Absolute::trusted("/"),
            ops: Vec::new(),
            uid: 0,
            gid: 0,
            hostname: None,
            seccomp_rules: Vec::new(),
            seccomp_flags: 0,
            seccomp_presets: 0,
            seccomp_disable: false,
            parent_perm: 0,
            adopt_wait_delay_ms: 0,
            privileged: false,
            retain_session: false,
            host_net: false,
            host_abstract: false,
            forward_cancel: false,
        }
    }
}

/// The full record transmitted over the setup pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitPlan {
    /// The setup plan.
    pub params: Params,
    /// Host uid mapped into the user namespace.
    pub host_uid: u32,
    /// Host gid mapped into the user namespace.
    pub host_gid: u32,
    /// Count of extra files passed after the setup pipe.
    pub count: usize,
    /// Enables verbose init logging.
    pub verbose: bool,
}
