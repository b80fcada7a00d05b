//! Parent-side container launcher.
//!
//! [`Container`] owns the plan and the process plumbing around the
//! init: it clones the init into fresh namespaces, serves the plan
//! over the setup pipe and waits for the init to collect the process
//! tree. The pinned start thread enters no_new_privs and the landlock
//! domain before cloning so the init inherits both.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::mpsc;
use std::thread;

use caps::{CapSet, Capability};
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{self, Pid};
use vessel_proto::{CANCEL_SIGNAL, InitPlan, PRESET_DENY_TTY, Params, SETUP_ENV};

use crate::error::{Error, Result};
use crate::{init, landlock};

/// Stack handed to clone(2); only used up to execve.
const CLONE_STACK_SIZE: usize = 1 << 20;

/// Lowest fd index handed to the init; the setup pipe lands here.
const SETUP_FD: RawFd = 3;

/// Ambient capabilities the init needs for filesystem setup. All of
/// them are dropped again before the initial process starts.
const AMBIENT_CAPS: [Capability; 3] = [
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SETPCAP,
    Capability::CAP_DAC_OVERRIDE,
];

/// A container assembled from a [`Params`] plan, spanning the full
/// lifecycle from clone to reaped process tree.
pub struct Container {
    /// The setup plan served to the init. Frozen once started.
    pub params: Params,
    /// Enables verbose init logging.
    pub verbose: bool,

    extra_files: Vec<OwnedFd>,
    cgroup: Option<OwnedFd>,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,

    setup: Option<File>,
    pid: Option<Pid>,
    waiter: Option<mpsc::Receiver<nix::Result<WaitStatus>>>,
    status: Option<WaitStatus>,
}

/// Everything the cloned child needs before execve, gathered ahead of
/// time so the callback does no setup work of its own.
struct ChildConfig {
    /// Executable pathname; always the parent's own binary.
    exe: CString,
    /// Argv; always `["init"]`.
    argv: Vec<CString>,
    /// Environment; only the setup fd variable.
    envp: Vec<CString>,
    /// Skips setsid when set.
    retain_session: bool,
    /// Pipe end replacing fd 0, if any.
    stdin: Option<RawFd>,
    /// Pipe end replacing fd 1, if any.
    stdout: Option<RawFd>,
    /// Pipe end replacing fd 2, if any.
    stderr: Option<RawFd>,
    /// Cgroup directory fd to join, if any.
    cgroup: Option<RawFd>,
    /// Descriptors moved down to [`SETUP_FD`] and up; setup pipe first.
    inherit: Vec<RawFd>,
}

impl Container {
    /// Creates a container from a plan. Nothing happens until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(params: Params) -> Self {
        Self {
            params,
            verbose: false,
            extra_files: Vec::new(),
            cgroup: None,
            stdin: None,
            stdout: None,
            stderr: None,
            setup: None,
            pid: None,
            waiter: None,
            status: None,
        }
    }

    /// Passes an extra file to the initial process. Files appear in
    /// order starting at fd 3.
    pub fn push_extra_file(&mut self, file: OwnedFd) {
        self.extra_files.push(file);
    }

    /// Places the init into the cgroup behind this directory fd before
    /// execve.
    pub fn set_cgroup(&mut self, dir: OwnedFd) {
        self.cgroup = Some(dir);
    }

    /// Pid of the init, once started.
    #[must_use]
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    /// Connects a pipe to the initial process stdin and returns the
    /// write end. Without one the parent's stdin is inherited.
    pub fn stdin_pipe(&mut self) -> Result<File> {
        let (rd, wr) = unistd::pipe()?;
        self.stdin = Some(rd);
        Ok(File::from(wr))
    }

    /// Connects a pipe to the initial process stdout and returns the
    /// read end.
    pub fn stdout_pipe(&mut self) -> Result<File> {
        let (rd, wr) = unistd::pipe()?;
        self.stdout = Some(wr);
        Ok(File::from(rd))
    }

    /// Connects a pipe to the initial process stderr and returns the
    /// read end.
    pub fn stderr_pipe(&mut self) -> Result<File> {
        let (rd, wr) = unistd::pipe()?;
        self.stderr = Some(wr);
        Ok(File::from(rd))
    }

    /// Clones the init into fresh namespaces.
    ///
    /// Spawns the start thread, which sets no_new_privs, enters the
    /// landlock domain and performs the clone; the thread stays around
    /// to wait on the child. Returns once the init is running.
    pub fn start(&mut self) -> Result<()> {
        if self.pid.is_some() {
            return Err(Error::OpState("container already started"));
        }

        if self.params.uid < 1 {
            self.params.uid = init::overflow_uid() as i32;
        }
        if self.params.gid < 1 {
            self.params.gid = init::overflow_gid() as i32;
        }
        // a reachable controlling terminal defeats the sandbox
        if !self.params.retain_session {
            self.params.seccomp_presets |= PRESET_DENY_TTY;
        }

        let (setup_rd, setup_wr) = unistd::pipe()?;
        self.setup = Some(File::from(setup_wr));

        let mut flags = CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWCGROUP;
        if !self.params.host_net {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        let mut inherit = vec![setup_rd.as_raw_fd()];
        inherit.extend(self.extra_files.iter().map(AsRawFd::as_raw_fd));

        let cfg = ChildConfig {
            exe: c_string("/proc/self/exe")?,
            argv: vec![c_string("init")?],
            envp: vec![c_string(&format!("{SETUP_ENV}={SETUP_FD}"))?],
            retain_session: self.params.retain_session,
            stdin: self.stdin.as_ref().map(AsRawFd::as_raw_fd),
            stdout: self.stdout.as_ref().map(AsRawFd::as_raw_fd),
            stderr: self.stderr.as_ref().map(AsRawFd::as_raw_fd),
            cgroup: self.cgroup.as_ref().map(AsRawFd::as_raw_fd),
            inherit,
        };
        let host_abstract = self.params.host_abstract;

        let (ready_tx, ready_rx) = mpsc::channel();
        let (wait_tx, wait_rx) = mpsc::channel();
        thread::Builder::new().name("container-start".into()).spawn(move || {
            let pid = match start_on_thread(&cfg, flags, host_abstract) {
                Ok(pid) => pid,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            drop(setup_rd);
            let _ = ready_tx.send(Ok(pid));

            // the landlock domain entered by this thread covers the
            // child; stay around until it is gone
            let status = loop {
                match waitpid(pid, None) {
                    Err(Errno::EINTR) => continue,
                    other => break other,
                }
            };
            let _ = wait_tx.send(status);
        })?;

        let pid = ready_rx
            .recv()
            .map_err(|_| Error::OpState("start thread terminated before clone"))??;
        self.pid = Some(pid);
        self.waiter = Some(wait_rx);

        // child ends stay open in the init; close our copies so pipe
        // reads observe termination
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
        tracing::debug!("cloned init as pid {pid}");
        Ok(())
    }

    /// Encodes the plan onto the setup pipe. Must be called exactly
    /// once after [`start`](Self::start); the init blocks until it
    /// does.
    pub fn serve(&mut self) -> Result<()> {
        if self.params.path.is_none() {
            return Err(Error::NoExecutable);
        }
        let Some(mut setup) = self.setup.take() else {
            return Err(Error::OpState("setup pipe not open"));
        };

        let plan = InitPlan {
            params: self.params.clone(),
            host_uid: unistd::getuid().as_raw(),
            host_gid: unistd::getgid().as_raw(),
            count: self.extra_files.len(),
            verbose: self.verbose,
        };
        vessel_proto::encode(&mut setup, &plan)?;
        setup.flush()?;
        Ok(())
    }

    /// Waits for the init and returns its wait status. Idempotent
    /// after the first return.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let rx = self.waiter.take().ok_or(Error::OpState("container not started"))?;
        // an unserved init blocks on the pipe forever; closing our end
        // fails its decode instead
        drop(self.setup.take());

        let status = rx
            .recv()
            .map_err(|_| Error::OpState("start thread terminated before wait"))?
            .map_err(Error::Os)?;
        self.status = Some(status);
        Ok(status)
    }

    /// Delivers the cancellation signal to the init.
    pub fn cancel(&self) -> Result<()> {
        let pid = self.pid.ok_or(Error::OpState("container not started"))?;
        signal::kill(pid, Signal::try_from(CANCEL_SIGNAL)?)?;
        Ok(())
    }
}

/// CString conversion rejecting interior nul bytes.
fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::OpState("interior nul in spawn argument"))
}

/// Establishes the per-thread restrictions and clones the init. Must
/// run on the dedicated start thread.
fn start_on_thread(cfg: &ChildConfig, flags: CloneFlags, host_abstract: bool) -> Result<Pid> {
    // SAFETY: no pointer arguments
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } == -1 {
        return Err(Error::Setup { step: "set no_new_privs", source: Errno::last() });
    }
    landlock::enforce_scopes(host_abstract)?;

    let mut stack = vec![0u8; CLONE_STACK_SIZE];
    let cb = Box::new(|| child_main(cfg));
    // SAFETY: the callback only rearranges descriptors and execs
    let pid = unsafe { nix::sched::clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }
        .map_err(|e| Error::Setup { step: "clone", source: e })?;
    Ok(pid)
}

/// Entry point of the cloned child; runs until execve or reports the
/// failure on the inherited stderr.
fn child_main(cfg: &ChildConfig) -> isize {
    match child_setup(cfg) {
        Ok(never) => match never {},
        Err(err) => {
            let _ = writeln!(io::stderr(), "cannot spawn init: {err}");
            127
        }
    }
}

/// Descriptor layout, session, cgroup and capability setup between
/// clone and execve.
fn child_setup(cfg: &ChildConfig) -> std::result::Result<std::convert::Infallible, Error> {
    if !cfg.retain_session {
        unistd::setsid().map_err(|e| Error::Setup { step: "setsid", source: e })?;
    }
    // SAFETY: no pointer arguments
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } == -1 {
        return Err(Error::Setup { step: "set parent-death signal", source: Errno::last() });
    }

    for (fd, target) in [(cfg.stdin, 0), (cfg.stdout, 1), (cfg.stderr, 2)] {
        if let Some(fd) = fd {
            // SAFETY: duplicating an inherited descriptor
            if unsafe { libc::dup2(fd, target) } == -1 {
                return Err(Error::Setup { step: "dup stdio", source: Errno::last() });
            }
            // SAFETY: fd stays open until execve
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
    }

    if let Some(dir) = cfg.cgroup {
        enter_cgroup(dir)?;
    }

    // move every inherited descriptor clear of the target window, then
    // lay them out contiguously from SETUP_FD; dup2 clears
    // close-on-exec on the targets
    let base = SETUP_FD + cfg.inherit.len() as RawFd;
    let mut sources = cfg.inherit.clone();
    for fd in &mut sources {
        if *fd < base {
            // SAFETY: duplicating an inherited descriptor
            let moved = unsafe { libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, base) };
            if moved == -1 {
                return Err(Error::Setup { step: "move inherited fd", source: Errno::last() });
            }
            // SAFETY: the original is fully replaced by the duplicate
            unsafe { libc::close(*fd) };
            *fd = moved;
        } else {
            // SAFETY: fd stays open until execve
            unsafe { libc::fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
    }
    for (i, fd) in sources.iter().enumerate() {
        // SAFETY: both descriptors are valid
        if unsafe { libc::dup2(*fd, SETUP_FD + i as RawFd) } == -1 {
            return Err(Error::Setup { step: "place inherited fd", source: Errno::last() });
        }
    }

    // in the fresh user namespace the child holds a full capability
    // set; the init only needs these to survive execve
    for cap in AMBIENT_CAPS {
        caps::raise(None, CapSet::Inheritable, cap).map_err(Error::Caps)?;
        caps::raise(None, CapSet::Ambient, cap).map_err(Error::Caps)?;
    }

    unistd::chdir("/").map_err(|e| Error::Setup { step: "enter root", source: e })?;
    unistd::execve(&cfg.exe, &cfg.argv, &cfg.envp)
        .map_err(|e| Error::Setup { step: "execve", source: e })
}

/// Writes the child into the `cgroup.procs` of the configured cgroup
/// directory.
fn enter_cgroup(dir: RawFd) -> Result<()> {
    let name = c_string("cgroup.procs")?;
    // SAFETY: name is a valid C string, dir an inherited directory fd
    let fd = unsafe {
        libc::openat(dir, name.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC)
    };
    if fd == -1 {
        return Err(Error::Setup { step: "open cgroup.procs", source: Errno::last() });
    }
    // SAFETY: fd was just opened for writing
    let n = unsafe { libc::write(fd, "0\n".as_ptr().cast(), 2) };
    let errno = Errno::last();
    // SAFETY: fd is owned and not used after this point
    unsafe { libc::close(fd) };
    if n != 2 {
        return Err(Error::Setup { step: "join cgroup", source: errno });
    }
    Ok(())
}
