//! `vessel run` — run a program inside a new container.
//!
//! Usage: `vessel run [OPTIONS] PROGRAM [ARG...]`

use anyhow::{Context, Result, bail};
use vessel::proto::{
    Absolute, BIND_DEVICE, BIND_OPTIONAL, BIND_WRITABLE, FLAG_MULTIARCH, Ops, PRESET_DENY_DEVEL,
    PRESET_STRICT, Params,
};
use vessel::{Container, WaitStatus};

/// Arguments for `vessel run`.
#[derive(clap::Args)]
pub struct RunArgs {
    /// Mirror this host directory as the container root.
    #[arg(long, default_value = "/")]
    root: String,

    /// Bind mount a host path (format: host[:target][:flags], flags
    /// from "w" writable, "d" devices, "o" optional).
    #[arg(long = "bind")]
    bind: Vec<String>,

    /// Mount a tmpfs (format: target[:size]).
    #[arg(long = "tmpfs")]
    tmpfs: Vec<String>,

    /// Mount mqueue under /dev.
    #[arg(long)]
    mqueue: bool,

    /// Hostname inside the container.
    #[arg(long)]
    hostname: Option<String>,

    /// Working directory inside the container.
    #[arg(short = 'w', long, default_value = "/")]
    workdir: String,

    /// Environment variables (KEY=value), passed through verbatim.
    #[arg(short = 'e', long = "env")]
    env: Vec<String>,

    /// Container uid; defaults to the overflow uid.
    #[arg(short = 'u', long)]
    uid: Option<i32>,

    /// Container gid; defaults to the overflow gid.
    #[arg(long)]
    gid: Option<i32>,

    /// Retain CAP_SYS_ADMIN inside the container.
    #[arg(long)]
    privileged: bool,

    /// Keep the controlling terminal reachable.
    #[arg(short = 't', long)]
    tty: bool,

    /// Share the host network namespace.
    #[arg(long)]
    net: bool,

    /// Do not scope abstract unix sockets.
    #[arg(long)]
    host_abstract: bool,

    /// Allow development syscalls such as ptrace and perf_event_open.
    #[arg(long)]
    devel: bool,

    /// Keep seccomp rules for the compat architecture and emulation.
    #[arg(long)]
    multiarch: bool,

    /// Disable the syscall filter entirely.
    #[arg(long)]
    seccomp_off: bool,

    /// Translate SIGTERM into SIGINT for the program.
    #[arg(long)]
    forward_cancel: bool,

    /// Grace window in milliseconds for lingering processes after the
    /// program exits; 0 means 5000, negative disables.
    #[arg(long, default_value_t = 0)]
    wait_delay: i64,

    /// Program and arguments; the program path must be absolute.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl RunArgs {
    pub fn run(self, verbose: bool) -> Result<i32> {
        let path = abs(&self.command[0]).context("program path")?;
        let root = abs(&self.root).context("container root")?;
        let dir = abs(&self.workdir).context("working directory")?;

        // one prefix per container keeps /etc/.host entries distinct
        let prefix = format!("{:08x}", std::process::id());

        let mut ops = Ops::new();
        ops.root(&root, &prefix, 0)
            .etc(&abs("/etc")?, &prefix)
            .procfs(&abs("/proc")?)
            .dev(&abs("/dev")?, self.mqueue)
            .tmpfs(&abs("/tmp")?, 0, 0o1777);

        for spec in &self.bind {
            let (source, target, flags) = parse_bind(spec)?;
            ops.bind(&source, &target, flags);
        }
        for spec in &self.tmpfs {
            let (target, size) = parse_tmpfs(spec)?;
            ops.tmpfs(&target, size, 0o755);
        }

        let mut presets = PRESET_STRICT;
        if self.devel {
            presets &= !PRESET_DENY_DEVEL;
        }

        let mut container = Container::new(Params {
            path: Some(path),
            args: self.command.clone(),
            env: self.env,
            dir,
            ops: ops.into_vec(),
            uid: self.uid.unwrap_or(0),
            gid: self.gid.unwrap_or(0),
            hostname: self.hostname,
            seccomp_presets: presets,
            seccomp_flags: if self.multiarch { FLAG_MULTIARCH } else { 0 },
            seccomp_disable: self.seccomp_off,
            adopt_wait_delay_ms: self.wait_delay,
            privileged: self.privileged,
            retain_session: self.tty,
            host_net: self.net,
            host_abstract: self.host_abstract,
            forward_cancel: self.forward_cancel,
            ..Params::default()
        });
        container.verbose = verbose;

        container.start().context("cannot start container")?;
        container.serve().context("cannot serve setup plan")?;
        match container.wait().context("cannot wait for container")? {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, sig, _) => Ok(128 + sig as i32),
            _ => Ok(255),
        }
    }
}

fn abs(s: &str) -> Result<Absolute> {
    Ok(Absolute::new(s)?)
}

/// Parses a bind spec: `host[:target][:flags]`.
fn parse_bind(spec: &str) -> Result<(Absolute, Absolute, u32)> {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    let (host, target, opts) = match parts.as_slice() {
        [host] => (*host, *host, ""),
        [host, target] => (*host, *target, ""),
        [host, target, opts] => (*host, *target, *opts),
        _ => unreachable!("splitn yields 1..=3 parts"),
    };

    let mut flags = 0;
    for c in opts.chars() {
        flags |= match c {
            'w' => BIND_WRITABLE,
            'd' => BIND_DEVICE,
            'o' => BIND_OPTIONAL,
            _ => bail!("unknown bind flag {c:?} in {spec:?}"),
        };
    }
    Ok((abs(host).context("bind source")?, abs(target).context("bind target")?, flags))
}

/// Parses a tmpfs spec: `target[:size]`.
fn parse_tmpfs(spec: &str) -> Result<(Absolute, usize)> {
    match spec.split_once(':') {
        None => Ok((abs(spec).context("tmpfs target")?, 0)),
        Some((target, size)) => {
            let size = size.parse().with_context(|| format!("invalid tmpfs size in {spec:?}"))?;
            Ok((abs(target).context("tmpfs target")?, size))
        }
    }
}
