//! Mount primitives shared by setup ops and the init state machine.
//!
//! Holding CAP_SYS_ADMIN within the user namespace that owns a mount
//! namespace allows creating bind mounts and mounting proc, sysfs,
//! devpts, tmpfs, ramfs, mqueue and overlayfs instances.
//!
//! A plain `MS_REMOUNT` resets superblock flags the bind inherited, so
//! [`remount`] reads the effective flags of every affected mount point
//! out of mountinfo and ORs them back in.

use std::fs::{self, OpenOptions};
use std::io::{self, BufReader};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::mount::MsFlags;

use crate::error::{Error, MountError, Result};
use crate::vfs;

/// Mount source when the value is ignored, such as when remounting.
pub const SOURCE_NONE: &str = "none";
/// Mount source of the tmpfs backing the intermediate root.
pub const SOURCE_TMPFS_ROOTFS: &str = "rootfs";
/// Mount source of the tmpfs representing a subset of host devtmpfs.
pub const SOURCE_TMPFS_DEVTMPFS: &str = "devtmpfs";

/// The proc pseudo-filesystem; requires a fully visible instance in
/// the mount namespace.
pub const FSTYPE_PROC: &str = "proc";
/// The devpts pseudo-filesystem, usually mounted on /dev/pts.
pub const FSTYPE_DEVPTS: &str = "devpts";
/// The tmpfs filesystem.
pub const FSTYPE_TMPFS: &str = "tmpfs";
/// The mqueue pseudo-filesystem, usually mounted on /dev/mqueue.
pub const FSTYPE_MQUEUE: &str = "mqueue";
/// The overlay filesystem.
pub const FSTYPE_OVERLAY: &str = "overlay";

/// Pathname the host root stays visible at during the apply pass.
pub const HOST_PATH: &str = "/host";
/// Pathname the future container root is assembled under.
pub const SYSROOT_PATH: &str = "/sysroot";

/// Prefixes `name` with the sysroot.
pub(crate) fn to_sysroot(name: &str) -> String {
    join_prefix(SYSROOT_PATH, name)
}

/// Prefixes `name` with the host root.
pub(crate) fn to_host(name: &str) -> String {
    join_prefix(HOST_PATH, name)
}

fn join_prefix(prefix: &str, name: &str) -> String {
    let trimmed = name.trim_start_matches('/');
    if trimmed.is_empty() {
        prefix.to_owned()
    } else {
        format!("{prefix}/{trimmed}")
    }
}

/// mount(2) with [`MountError`] wrapping.
pub(crate) fn mount_call(
    source: &str,
    target: &str,
    fstype: &str,
    flags: u64,
    data: &str,
) -> Result<()> {
    let res = nix::mount::mount(
        Some(source),
        target,
        if fstype.is_empty() { None } else { Some(fstype) },
        MsFlags::from_bits_retain(flags),
        if data.is_empty() { None } else { Some(data) },
    );
    res.map_err(|errno| {
        Error::Mount(MountError {
            source: source.into(),
            target: target.into(),
            fstype: fstype.into(),
            flags,
            data: data.into(),
            errno: errno as i32,
        })
    })
}

/// umount2(2) with `MNT_DETACH`.
pub(crate) fn umount_detach(target: &str) -> Result<()> {
    nix::mount::umount2(target, nix::mount::MntFlags::MNT_DETACH)?;
    Ok(())
}

/// `mkdir -p` with an explicit mode on created directories.
pub(crate) fn mkdir_all(path: impl AsRef<Path>, perm: u32) -> Result<()> {
    let path = path.as_ref();
    fs::DirBuilder::new()
        .recursive(true)
        .mode(perm)
        .create(path)
        .map_err(|e| Error::path("mkdir", path, e))
}

/// Well-known pathnames under a proc mount point.
#[derive(Debug, Clone)]
pub(crate) struct ProcPaths {
    /// The mount point itself.
    prefix: String,
    /// Its `self` symlink directory.
    self_dir: String,
}

/// Proc of the host pid namespace, reachable during the apply pass.
pub(crate) fn host_proc() -> ProcPaths {
    ProcPaths::new(HOST_PATH)
}

impl ProcPaths {
    pub(crate) fn new(prefix: &str) -> Self {
        Self { prefix: format!("{prefix}/proc"), self_dir: format!("{prefix}/proc/self") }
    }

    /// Pathname of the calling process's fd 1.
    pub(crate) fn stdout(&self) -> String {
        format!("{}/fd/1", self.self_dir)
    }

    /// Pathname of an open fd of the calling process.
    pub(crate) fn fd(&self, fd: i32) -> String {
        format!("{}/fd/{fd}", self.self_dir)
    }

    /// Decodes and unfolds the mountinfo of the calling process under
    /// `target`.
    pub(crate) fn mountinfo(&self, target: &str) -> Result<vfs::MountTree> {
        let name = format!("{}/mountinfo", self.self_dir);
        let r = fs::File::open(&name).map_err(|e| Error::path("open", &name, e))?;
        let entries = vfs::decode(BufReader::new(r))?;
        Ok(vfs::unfold(entries, target)?)
    }

    /// Bind mounts `source` on `target` and applies `flags`,
    /// recursively when `MS_REC` is set. `eq` trims the log line when
    /// source and target are the same pathname.
    pub(crate) fn bind_mount(
        &self,
        source: &str,
        target: &str,
        flags: u64,
        eq: bool,
    ) -> Result<()> {
        if eq {
            tracing::debug!("resolved {target:?} flags {flags:#x}");
        } else {
            tracing::debug!("resolved {source:?} on {target:?} flags {flags:#x}");
        }

        mount_call(
            source,
            target,
            "",
            libc::MS_SILENT | libc::MS_BIND | (flags & libc::MS_REC),
            "",
        )?;
        self.remount(target, flags)
    }

    /// Applies `flags` on the mounts at `target`, recursively when
    /// `MS_REC` is set.
    pub(crate) fn remount(&self, target: &str, flags: u64) -> Result<()> {
        let target_final = fs::canonicalize(target)
            .map_err(|e| Error::path("resolve", target, e))?;
        if target_final.as_os_str() != target {
            tracing::debug!("target resolves to {target_final:?}");
        }

        // final target path according to the kernel through proc;
        // the fd closes when the handle leaves scope
        let target_kfinal = {
            let f = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_PATH | libc::O_CLOEXEC)
                .open(&target_final)
                .map_err(|e| Error::path("open", &target_final, e))?;
            let name = self.fd(f.as_raw_fd());
            let link = fs::read_link(&name).map_err(|e| Error::path("readlink", name, e))?;
            link.into_os_string().into_string().map_err(|_| {
                Error::path(
                    "readlink",
                    &target_final,
                    io::Error::new(io::ErrorKind::InvalidData, "non-utf8 mount target"),
                )
            })?
        };

        let mf = libc::MS_NOSUID | flags & libc::MS_NODEV | flags & libc::MS_RDONLY;
        let tree = self.mountinfo(&target_kfinal)?;

        remount_with_flags(&tree.nodes[tree.root], mf)?;
        if flags & libc::MS_REC == 0 {
            return Ok(());
        }

        for i in tree.collective() {
            if let Err(err) = remount_with_flags(&tree.nodes[i], mf) {
                // descendants the caller cannot access stay as they are
                if !matches!(
                    &err,
                    Error::Mount(MountError { errno, .. }) if *errno == libc::EACCES
                ) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// Remounts one mount point, preserving its effective flags.
fn remount_with_flags(n: &vfs::MountInfoNode, mf: u64) -> Result<()> {
    remount_with(n, mf, &mut |target, flags| mount_call(SOURCE_NONE, target, "", flags, ""))
}

/// [`remount_with_flags`] over an explicit mount(2) entry point; the
/// call is elided entirely when the effective flags already satisfy
/// `mf`.
fn remount_with(
    n: &vfs::MountInfoNode,
    mf: u64,
    mount: &mut dyn FnMut(&str, u64) -> Result<()>,
) -> Result<()> {
    let (kf, unmatched) = n.entry.flags();
    if !unmatched.is_empty() {
        tracing::debug!("unmatched vfs options: {unmatched:?}");
    }

    if kf & mf != mf {
        mount(&n.clean, libc::MS_SILENT | libc::MS_BIND | libc::MS_REMOUNT | kf | mf)?;
    }
    Ok(())
}

/// Mounts a tmpfs on `target`; callers who wish to mount to the
/// sysroot must pass a [`to_sysroot`] pathname.
pub(crate) fn mount_tmpfs(
    fsname: &str,
    target: &str,
    flags: u64,
    size: usize,
    perm: u32,
) -> Result<()> {
    mkdir_all(target, parent_perm(perm))?;
    let mut opt = format!("mode=0{perm:o}");
    if size > 0 {
        opt.push_str(&format!(",size={size}"));
    }
    mount_call(fsname, target, FSTYPE_TMPFS, flags, &opt)
}

/// Derives the permission of implicitly created parent directories
/// from the target permission: `0755` with group bits cleared when the
/// target grants no group access, same for other.
pub(crate) fn parent_perm(perm: u32) -> u32 {
    let mut pperm = 0o755;
    if perm & 0o070 == 0 {
        pperm &= !0o050;
    }
    if perm & 0o007 == 0 {
        pperm &= !0o005;
    }
    pperm
}

/// Escapes a pathname for the data argument of an overlay mount call.
/// The kernel accepts no escape for NUL, so the string is truncated at
/// the first one.
pub(crate) fn escape_overlay_data_segment(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    let s = s.split('\0').next().unwrap_or_default();
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str(r"\\"),
            ',' => out.push_str(r"\,"),
            ':' => out.push_str(r"\:"),
            c => out.push(c),
        }
    }
    out
}

/// Creates `name` with permission `perm` and optional contents,
/// creating missing parents with permission `pperm`.
pub(crate) fn create_file(
    name: &str,
    perm: u32,
    pperm: u32,
    content: Option<&[u8]>,
) -> Result<()> {
    if let Some(parent) = Path::new(name).parent() {
        mkdir_all(parent, pperm)?;
    }
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(perm)
        .open(name)
        .map_err(|e| Error::path("create", name, e))?;
    if let Some(content) = content {
        use std::io::Write;
        (&file).write_all(content).map_err(|e| Error::path("write", name, e))?;
    }
    Ok(())
}

/// Ensures a regular file exists at `name`, creating it empty if
/// missing. An existing directory or symlink fails with `EISDIR`.
pub(crate) fn ensure_file(name: &str, perm: u32, pperm: u32) -> Result<()> {
    match fs::symlink_metadata(name) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => create_file(name, perm, pperm, None),
        Err(e) => Err(Error::path("stat", name, e)),
        Ok(fi) => {
            if fi.is_dir() || fi.file_type().is_symlink() {
                tracing::debug!("path {name:?} is a directory");
                return Err(Error::Os(nix::errno::Errno::EISDIR));
            }
            Ok(())
        }
    }
}

/// symlink(2) with pathname error wrapping.
pub(crate) fn symlink(original: &str, link: &str) -> Result<()> {
    std::os::unix::fs::symlink(original, link).map_err(|e| Error::path("symlink", link, e))
}

/// Whether `path` exists and is a directory, following symlinks.
pub(crate) fn is_dir(path: &str) -> Result<bool> {
    match fs::metadata(path) {
        Ok(fi) => Ok(fi.is_dir()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::path("stat", path, e)),
    }
}

/// Reads the permission bits of `path`.
#[cfg(test)]
pub(crate) fn perm_bits(path: &str) -> u32 {
    fs::metadata(path).map(|m| m.permissions().mode() & 0o7777).unwrap_or(0)
}
