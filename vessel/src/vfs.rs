//! Decoder and hierarchy resolver for proc_pid_mountinfo(5).
//!
//! The init consults mountinfo to learn the effective flags of every
//! mount it rebinds, since a bind mount inherits superblock flags that
//! a plain `MS_REMOUNT` would silently clear. [`unfold`] additionally
//! positions each entry in the mount tree and marks entries shadowed
//! by later mounts on the same mount point, so remount passes skip
//! unreachable nodes.

use std::collections::HashMap;
use std::io::{self, BufRead};

use vessel_proto::{MS_NODEV, MS_NOEXEC, MS_NOSUID, MS_RDONLY};

/// Mount flag value of `MS_NOSYMFOLLOW`.
pub const MS_NOSYMFOLLOW: u64 = 0x100;
/// Mount flag value of `MS_NOATIME`.
pub const MS_NOATIME: u64 = 0x400;
/// Mount flag value of `MS_NODIRATIME`.
pub const MS_NODIRATIME: u64 = 0x800;
/// Mount flag value of `MS_RELATIME`.
pub const MS_RELATIME: u64 = 0x20_0000;

/// A failure while reading or interpreting mountinfo.
#[derive(Debug, thiserror::Error)]
pub struct DecoderError {
    /// Failed operation, `scan`, `parse` or `unfold`.
    pub op: &'static str,
    /// Zero-based line index, if attributable to one line.
    pub line: Option<usize>,
    /// Underlying cause.
    #[source]
    pub source: io::Error,
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} mountinfo at line {line}: {}", self.op, self.source),
            None => write!(f, "{} mountinfo: {}", self.op, self.source),
        }
    }
}

impl DecoderError {
    fn parse(line: usize, message: impl Into<String>) -> Self {
        Self {
            op: "parse",
            line: Some(line),
            source: io::Error::new(io::ErrorKind::InvalidData, message.into()),
        }
    }
}

/// One proc_pid_mountinfo(5) entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountInfoEntry {
    /// Unique ID for the mount; may be reused after umount(2).
    pub id: i32,
    /// ID of the parent mount, or of self for the tree root.
    pub parent: i32,
    /// st_dev major and minor for files on this filesystem.
    pub devno: (i32, i32),
    /// Pathname of the directory forming the root of this mount.
    pub root: String,
    /// Mount point relative to the process root.
    pub target: String,
    /// Per-mount options.
    pub vfs_optstr: String,
    /// Optional `tag[:value]` fields.
    pub opt_fields: Vec<String>,
    /// Filesystem type in the form `type[.subtype]`.
    pub fs_type: String,
    /// Filesystem-specific source, possibly empty.
    pub source: String,
    /// Per-superblock options.
    pub fs_optstr: String,
}

impl MountInfoEntry {
    /// Interprets `vfs_optstr`, returning the resulting mount flags
    /// and any options with no flag equivalent.
    #[must_use]
    pub fn flags(&self) -> (u64, Vec<&str>) {
        let mut flags = 0u64;
        let mut unmatched = Vec::new();
        for s in self.vfs_optstr.split(',') {
            match s {
                "rw" => {}
                "ro" => flags |= MS_RDONLY,
                "nosuid" => flags |= MS_NOSUID,
                "nodev" => flags |= MS_NODEV,
                "noexec" => flags |= MS_NOEXEC,
                "nosymfollow" => flags |= MS_NOSYMFOLLOW,
                "noatime" => flags |= MS_NOATIME,
                "nodiratime" => flags |= MS_NODIRATIME,
                "relatime" => flags |= MS_RELATIME,
                other => unmatched.push(other),
            }
        }
        (flags, unmatched)
    }
}

/// Undoes the octal escaping applied to mountinfo fields by the kernel.
#[must_use]
pub fn unmangle(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1].is_ascii_digit()
            && bytes[i + 2].is_ascii_digit()
            && bytes[i + 3].is_ascii_digit()
        {
            let v = (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(v);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses one mountinfo line.
fn parse_line(line_no: usize, s: &str) -> Result<MountInfoEntry, DecoderError> {
    // 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
    // (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
    let f: Vec<&str> = s.split(' ').collect();
    if f.len() < 10 {
        return Err(DecoderError::parse(line_no, "unexpected field count"));
    }

    let mut ent = MountInfoEntry {
        id: f[0]
            .parse()
            .map_err(|e| DecoderError::parse(line_no, format!("numeric field {:?} {e}", f[0])))?,
        parent: f[1]
            .parse()
            .map_err(|e| DecoderError::parse(line_no, format!("numeric field {:?} {e}", f[1])))?,
        ..MountInfoEntry::default()
    };

    let devno = f[2].split_once(':').and_then(|(maj, min)| {
        Some((maj.parse::<i32>().ok()?, min.parse::<i32>().ok()?))
    });
    ent.devno = devno.ok_or_else(|| DecoderError::parse(line_no, "bad maj:min field"))?;

    ent.root = unmangle(f[3]);
    ent.target = unmangle(f[4]);
    ent.vfs_optstr = unmangle(f[5]);
    if ent.root.is_empty() || ent.target.is_empty() || ent.vfs_optstr.is_empty() {
        return Err(DecoderError::parse(line_no, "unexpected empty field"));
    }

    // optional fields run until the single-hyphen separator
    let sep = f.len() - 4;
    ent.opt_fields = f[6..sep].iter().map(|s| (*s).to_owned()).collect();
    if f[sep] != "-" {
        return Err(DecoderError::parse(line_no, "bad optional fields separator"));
    }

    ent.fs_type = unmangle(f[sep + 1]);
    if ent.fs_type.is_empty() {
        return Err(DecoderError::parse(line_no, "unexpected empty field"));
    }
    ent.source = unmangle(f[sep + 2]);
    ent.fs_optstr = unmangle(f[sep + 3]);
    Ok(ent)
}

/// Decodes all mountinfo entries from `r` in document order.
pub fn decode(r: impl BufRead) -> Result<Vec<MountInfoEntry>, DecoderError> {
    let mut entries = Vec::new();
    for (line_no, line) in r.lines().enumerate() {
        let line = line.map_err(|e| DecoderError { op: "scan", line: Some(line_no), source: e })?;
        if line.is_empty() {
            continue;
        }
        entries.push(parse_line(line_no, &line)?);
    }
    Ok(entries)
}

/// A [`MountInfoEntry`] positioned in its mount hierarchy.
///
/// Tree links are indices into the arena returned by [`unfold`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfoNode {
    /// The decoded entry.
    pub entry: MountInfoEntry,
    /// Arena index of the first child, if any.
    pub first_child: Option<usize>,
    /// Arena index of the next sibling, if any.
    pub next_sibling: Option<usize>,
    /// Lexically cleaned target pathname.
    pub clean: String,
    /// Whether a later mount on the same mount point shadows this one.
    pub covered: bool,
}

/// The unfolded mount hierarchy under one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountTree {
    /// Node arena in document order.
    pub nodes: Vec<MountInfoNode>,
    /// Arena index of the target node.
    pub root: usize,
}

impl MountTree {
    /// Returns arena indices of visible nodes under `root`, depth
    /// first, covered nodes excluded but their subtrees retained.
    #[must_use]
    pub fn collective(&self) -> Vec<usize> {
        let mut out = Vec::new();
        self.visit(self.root, &mut out);
        out
    }

    fn visit(&self, i: usize, out: &mut Vec<usize>) {
        if !self.nodes[i].covered {
            out.push(i);
        }
        let mut cur = self.nodes[i].first_child;
        while let Some(c) = cur {
            self.visit(c, out);
            cur = self.nodes[c].next_sibling;
        }
    }
}

/// Lexically cleans a pathname the way the kernel prints mount points.
fn clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    if parts.is_empty() {
        return "/".into();
    }
    let mut out = String::with_capacity(path.len());
    for p in &parts {
        out.push('/');
        out.push_str(p);
    }
    out
}

/// Unfolds the mount hierarchy of `entries` under `target`, resolving
/// covered mount points.
pub fn unfold(entries: Vec<MountInfoEntry>, target: &str) -> Result<MountTree, DecoderError> {
    let target_clean = clean(target);

    let mut nodes: Vec<MountInfoNode> = Vec::with_capacity(entries.len());
    let mut id_index: HashMap<i32, usize> = HashMap::with_capacity(entries.len());
    let mut root = None;
    for (i, entry) in entries.into_iter().enumerate() {
        let node = MountInfoNode {
            clean: clean(&entry.target),
            entry,
            first_child: None,
            next_sibling: None,
            covered: false,
        };
        id_index.insert(node.entry.id, i);
        if node.clean == target_clean {
            root = Some(i);
        }
        nodes.push(node);
    }

    let Some(root) = root else {
        return Err(DecoderError {
            op: "unfold",
            line: None,
            source: io::Error::new(
                io::ErrorKind::NotFound,
                format!("mount point {target_clean} never appeared in mountinfo"),
            ),
        });
    };

    /// Where a node is about to be linked into the child list.
    enum Slot {
        /// `first_child` of the index.
        Child(usize),
        /// `next_sibling` of the index.
        Sibling(usize),
    }

    for cur in 0..nodes.len() {
        let Some(&parent) = id_index.get(&nodes[cur].entry.parent) else {
            continue;
        };
        if !nodes[cur].clean.starts_with(&target_clean) {
            continue;
        }
        if nodes[parent].clean == nodes[cur].clean {
            nodes[parent].covered = true;
        }

        // walk the sibling list: drop subtrees the new node shadows,
        // skip the node entirely when an existing sibling shadows it
        let mut covered = false;
        let mut slot = Slot::Child(parent);
        let mut s = nodes[parent].first_child;
        while let Some(si) = s {
            if nodes[cur].clean.starts_with(&nodes[si].clean) {
                covered = true;
                break;
            }
            let next = nodes[si].next_sibling;
            if nodes[si].clean.starts_with(&nodes[cur].clean) {
                match slot {
                    Slot::Child(p) => nodes[p].first_child = next,
                    Slot::Sibling(x) => nodes[x].next_sibling = next,
                }
            } else {
                slot = Slot::Sibling(si);
            }
            s = next;
        }
        if covered {
            continue;
        }
        match slot {
            Slot::Child(p) => nodes[p].first_child = Some(cur),
            Slot::Sibling(x) => nodes[x].next_sibling = Some(cur),
        }
    }

    Ok(MountTree { nodes, root })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: &str = "\
15 20 0:3 / /proc rw,relatime - proc /proc rw
16 20 0:15 / /sys rw,relatime - sysfs /sys rw
17 20 0:5 / /dev rw,relatime - devtmpfs udev rw,size=10240k,mode=755
20 1 8:2 / / rw,noatime - ext3 /dev/sda2 rw,errors=continue,user_xattr,acl,barrier=0
21 16 0:16 / /sys/fs/cgroup rw,nosuid,nodev,noexec,relatime - tmpfs tmpfs rw,mode=755
";

    #[test]
    fn parses_sample_document() {
        let entries = decode(Cursor::new(SAMPLE)).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].id, 15);
        assert_eq!(entries[0].parent, 20);
        assert_eq!(entries[0].devno, (0, 3));
        assert_eq!(entries[0].target, "/proc");
        assert_eq!(entries[0].fs_type, "proc");
        assert_eq!(entries[3].source, "/dev/sda2");
        assert_eq!(entries[3].fs_optstr, "rw,errors=continue,user_xattr,acl,barrier=0");
        assert!(entries[4].opt_fields.is_empty());
    }

    #[test]
    fn parses_optional_fields() {
        let line = "36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue";
        let ent = parse_line(0, line).unwrap();
        assert_eq!(ent.opt_fields, vec!["master:1".to_owned()]);
        assert_eq!(ent.root, "/mnt1");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line(0, "36 35 98:0 /mnt1 /mnt2").is_err());
        assert!(parse_line(0, "x 35 98:0 / /mnt rw - ext3 /dev/root rw").is_err());
        assert!(parse_line(0, "36 35 98 / /mnt rw - ext3 /dev/root rw").is_err());
        assert!(parse_line(0, "36 35 98:0 / /mnt rw + ext3 /dev/root rw").is_err());
    }

    #[test]
    fn unmangles_octal_escapes() {
        assert_eq!(unmangle(r"/mnt/with\040space"), "/mnt/with space");
        assert_eq!(unmangle(r"\134"), "\\");
        assert_eq!(unmangle(r"no\x escapes"), r"no\x escapes");
        assert_eq!(unmangle(r"trailing\04"), r"trailing\04");
    }

    #[test]
    fn flags_from_options() {
        let ent = MountInfoEntry {
            vfs_optstr: "ro,nosuid,nodev,noexec,relatime,unknown1".into(),
            ..MountInfoEntry::default()
        };
        let (flags, unmatched) = ent.flags();
        assert_eq!(
            flags,
            MS_RDONLY | MS_NOSUID | MS_NODEV | MS_NOEXEC | MS_RELATIME
        );
        assert_eq!(unmatched, vec!["unknown1"]);

        let rw = MountInfoEntry { vfs_optstr: "rw".into(), ..MountInfoEntry::default() };
        assert_eq!(rw.flags(), (0, Vec::new()));
    }

    #[test]
    fn unfold_builds_tree() {
        let entries = decode(Cursor::new(SAMPLE)).unwrap();
        let tree = unfold(entries, "/").unwrap();
        assert_eq!(tree.nodes[tree.root].clean, "/");

        let visible = tree.collective();
        let targets: Vec<&str> =
            visible.iter().map(|&i| tree.nodes[i].clean.as_str()).collect();
        assert_eq!(targets, vec!["/", "/proc", "/sys", "/sys/fs/cgroup", "/dev"]);
    }

    #[test]
    fn unfold_skips_duplicate_siblings() {
        let doc = "\
20 1 8:2 / / rw - ext3 /dev/sda2 rw
21 20 0:10 / /mnt rw - tmpfs tmpfs rw
22 20 0:11 / /mnt rw - tmpfs tmpfs rw
";
        let entries = decode(Cursor::new(doc)).unwrap();
        let tree = unfold(entries, "/").unwrap();
        let ids: Vec<i32> = tree.collective().iter().map(|&i| tree.nodes[i].entry.id).collect();
        assert_eq!(ids, vec![20, 21]);
    }

    #[test]
    fn unfold_marks_covered_mounts() {
        // 22 is mounted over its own parent's mount point
        let doc = "\
20 1 8:2 / / rw - ext3 /dev/sda2 rw
21 20 0:10 / /mnt rw - tmpfs tmpfs rw
22 21 0:11 / /mnt rw - tmpfs tmpfs rw
";
        let entries = decode(Cursor::new(doc)).unwrap();
        let tree = unfold(entries, "/").unwrap();
        let covered: Vec<i32> = tree
            .nodes
            .iter()
            .filter(|n| n.covered)
            .map(|n| n.entry.id)
            .collect();
        assert_eq!(covered, vec![21]);
        let ids: Vec<i32> = tree.collective().iter().map(|&i| tree.nodes[i].entry.id).collect();
        assert_eq!(ids, vec![20, 22]);
    }

    #[test]
    fn unfold_missing_target() {
        let entries = decode(Cursor::new(SAMPLE)).unwrap();
        let err = unfold(entries, "/nonexistent").unwrap_err();
        assert_eq!(err.op, "unfold");
        assert!(err.to_string().contains("never appeared in mountinfo"));
    }
}
