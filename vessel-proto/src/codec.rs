//! Length-prefixed frame codec over any `Read`/`Write` stream.
//!
//! Each frame is: `[u32 big-endian length][postcard payload]`.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Encodes `msg` as a length-prefixed postcard frame and writes it to `w`.
pub fn encode<W: Write>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let payload =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds u32::MAX"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()
}

/// Reads a length-prefixed postcard frame from `r` and decodes it.
pub fn decode<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> io::Result<T> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let len = u32::from_be_bytes(buf);
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    postcard::from_bytes(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{Absolute, InitPlan, Ops, Params};

    fn sample_plan() -> InitPlan {
        let mut ops = Ops::new();
        ops.procfs(&Absolute::new("/proc").unwrap())
            .tmpfs(&Absolute::new("/tmp").unwrap(), 0, 0o1777)
            .etc(&Absolute::new("/etc").unwrap(), "c0ffee");
        InitPlan {
            params: Params {
                path: Some(Absolute::new("/bin/sh").unwrap()),
                args: vec!["sh".into(), "-c".into(), "true".into()],
                env: vec!["PATH=/usr/bin".into()],
                dir: Absolute::new("/").unwrap(),
                ops: ops.into_vec(),
                uid: 1000,
                gid: 100,
                hostname: Some("vessel".into()),
                seccomp_rules: Vec::new(),
                seccomp_flags: 0,
                seccomp_presets: crate::PRESET_STRICT,
                seccomp_disable: false,
                parent_perm: 0o755,
                adopt_wait_delay_ms: 0,
                privileged: false,
                retain_session: false,
                host_net: false,
                host_abstract: false,
                forward_cancel: true,
            },
            host_uid: 1000,
            host_gid: 100,
            count: 2,
            verbose: true,
        }
    }

    #[test]
    fn roundtrip_plan() {
        let plan = sample_plan();
        let mut buf = Vec::new();
        encode(&mut buf, &plan).unwrap();

        let mut cursor = io::Cursor::new(&buf);
        let decoded: InitPlan = decode(&mut cursor).unwrap();
        assert_eq!(decoded, plan);
    }

    #[test]
    fn frame_length_matches_prefix() {
        let plan = sample_plan();
        let mut buf = Vec::new();
        encode(&mut buf, &plan).unwrap();

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len() - 4);
    }

    #[test]
    fn rejects_oversized_frame() {
        // Craft a frame header claiming 32 MiB
        let header = (32u32 * 1024 * 1024).to_be_bytes();
        let mut cursor = io::Cursor::new(&header[..]);
        let result: io::Result<InitPlan> = decode(&mut cursor);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_truncated_frame() {
        let plan = sample_plan();
        let mut buf = Vec::new();
        encode(&mut buf, &plan).unwrap();
        buf.truncate(buf.len() - 1);

        let mut cursor = io::Cursor::new(&buf);
        let result: io::Result<InitPlan> = decode(&mut cursor);
        assert!(result.is_err());
    }
}
