//! Container init: pid 1 inside the new namespaces.
//!
//! The init receives its plan over an inherited pipe, maps its ids,
//! assembles the container root under an intermediate tmpfs, pivots
//! into it, drops privileges, spawns the initial process and stays
//! behind as the reaper of everything the pid namespace adopts.

#![allow(unsafe_code)]

use std::env;
use std::fs::{self, File};
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{OFlag, open};
use nix::sys::signal::{self, Signal};
use nix::sys::stat::{Mode, umask};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{self, Pid};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use vessel_proto::{CANCEL_SIGNAL, InitPlan, SETUP_ENV};

use crate::error::{Error, Result};
use crate::mount::{
    FSTYPE_TMPFS, HOST_PATH, SOURCE_NONE, SOURCE_TMPFS_ROOTFS, SYSROOT_PATH, mount_call,
    umount_detach,
};
use crate::ops::{SetupOp, SetupState};
use crate::{caps, output, seccomp};

/// Pathname the intermediate root tmpfs is mounted over. Procfs
/// guarantees this dentry exists and nothing else needs it once the
/// plan has been read.
const INTERMEDIATE_HOST_PATH: &str = "/proc/self/fd";

/// prctl PR_SET_DUMPABLE value allowing core dumps and id map writes.
const SUID_DUMP_USER: libc::c_ulong = 1;
/// prctl PR_SET_DUMPABLE value reverting to the protected state.
const SUID_DUMP_DISABLE: libc::c_ulong = 0;

/// Grace window for adopted descendants when the plan does not set one.
const ADOPT_WAIT_DEFAULT_MS: u64 = 5000;

/// Runs the init and never returns if argv 0 names it.
///
/// The container parent executes its own binary with argv 0 set to
/// `"init"`; every main function must call this before doing anything
/// else.
pub fn try_argv0() {
    let argv0 = env::args().next().unwrap_or_default();
    if Path::new(&argv0).file_name().map_or(true, |name| name != "init") {
        return;
    }

    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            // the plan may never have arrived, so logging may not be up
            output::init_logging(false);
            tracing::error!("{}", err.message());
            1
        }
    };
    output::before_exit();
    std::process::exit(code);
}

/// Events multiplexed onto the reap loop.
enum Event {
    /// Delivery of SIGINT or SIGTERM.
    Signal(i32),
    /// A process was reaped.
    Reaped(WaitStatus),
    /// wait4 returned ECHILD: every descendant is gone.
    WaitDone,
    /// The adopt-wait timer expired with descendants still around.
    Timeout,
}

/// The init state machine, from pid 1 assertion to the reap loop.
#[allow(clippy::too_many_lines)]
fn run() -> Result<i32> {
    if unistd::getpid().as_raw() != 1 {
        return Err(Error::NotPid1);
    }

    // SAFETY: no pointer arguments
    let ptracer_err = if unsafe { libc::prctl(libc::PR_SET_PTRACER, 0, 0, 0, 0) } == -1 {
        Some(Errno::last())
    } else {
        None
    };

    let (mut plan, setup) = receive()?;
    output::init_logging(plan.verbose);
    tracing::debug!("received setup parameters with {} ops", plan.params.ops.len());
    if let Some(errno) = ptracer_err {
        tracing::debug!("cannot set ptracer: {errno}");
    }

    map_ids(&mut HostIds, plan.params.uid, plan.host_uid, plan.params.gid, plan.host_gid)?;

    // procfs is unreachable after pivot_root
    let _ = (overflow_uid(), overflow_gid(), cap_last_cap());

    if let Some(hostname) = &plan.params.hostname {
        unistd::sethostname(hostname)
            .map_err(|e| Error::Setup { step: "set hostname", source: e })?;
    }

    let old_mask = umask(Mode::empty());

    // stop propagating to the host, but keep receiving host events
    // until the container root detaches from it
    mount_call(
        SOURCE_NONE,
        "/",
        "",
        libc::MS_SILENT | libc::MS_SLAVE | libc::MS_REC,
        "",
    )?;

    let parent_perm = match plan.params.parent_perm {
        0 => 0o755,
        perm => perm,
    };
    let mut state = SetupState {
        parent_perm,
        retain_session: plan.params.retain_session,
        nonrepeatable: 0,
    };

    let mut ops = std::mem::take(&mut plan.params.ops);
    for (i, op) in ops.iter_mut().enumerate() {
        if !op.valid() {
            return Err(Error::OpInvalid(i));
        }
        if let Err(err) = op.early(&mut state) {
            tracing::error!("cannot prepare op {i}: {err}");
            return Ok(1);
        }
    }

    mount_call(
        SOURCE_TMPFS_ROOTFS,
        INTERMEDIATE_HOST_PATH,
        FSTYPE_TMPFS,
        libc::MS_NODEV | libc::MS_NOSUID,
        "",
    )?;
    unistd::chdir(INTERMEDIATE_HOST_PATH)
        .map_err(|e| Error::Setup { step: "enter intermediate host path", source: e })?;

    fs::create_dir("sysroot").map_err(|e| setup_io("create sysroot", e))?;
    // a mount point so pivot_root accepts it as the new root
    mount_call(
        "sysroot",
        "sysroot",
        "",
        libc::MS_SILENT | libc::MS_MGC_VAL | libc::MS_BIND | libc::MS_REC,
        "",
    )?;

    fs::create_dir("host").map_err(|e| setup_io("create host", e))?;
    unistd::pivot_root(".", "host")
        .map_err(|e| Error::Setup { step: "pivot into intermediate root", source: e })?;
    unistd::chdir("/").map_err(|e| Error::Setup { step: "enter intermediate root", source: e })?;

    for (i, op) in ops.iter_mut().enumerate() {
        tracing::debug!("{} {}", op.prefix(), op);
        if let Err(err) = op.apply(&mut state) {
            tracing::error!("cannot apply op {i}: {err}");
            return Ok(1);
        }
    }

    // no mount beyond this point may reach the host
    mount_call(
        SOURCE_NONE,
        HOST_PATH,
        "",
        libc::MS_SILENT | libc::MS_REC | libc::MS_PRIVATE,
        "",
    )?;
    umount_detach(HOST_PATH)?;

    let root = open_path_fd("/", "open intermediate root")?;
    unistd::chdir(SYSROOT_PATH).map_err(|e| Error::Setup { step: "enter sysroot", source: e })?;
    unistd::pivot_root(".", ".")
        .map_err(|e| Error::Setup { step: "pivot into sysroot", source: e })?;
    unistd::fchdir(&root)
        .map_err(|e| Error::Setup { step: "re-enter intermediate root", source: e })?;
    umount_detach(".")?;
    unistd::chdir("/").map_err(|e| Error::Setup { step: "enter root", source: e })?;
    drop(root);

    // SAFETY: no pointer arguments
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } == -1 {
        return Err(Error::Setup { step: "set no_new_privs", source: Errno::last() });
    }
    caps::drop_all(plan.params.privileged)?;

    if plan.params.seccomp_disable {
        tracing::debug!("syscall filter not configured");
    } else {
        let rules = if plan.params.seccomp_rules.is_empty() {
            tracing::debug!(
                "resolving presets {:#x} flags {:#x}",
                plan.params.seccomp_presets,
                plan.params.seccomp_flags
            );
            seccomp::preset(plan.params.seccomp_presets, plan.params.seccomp_flags)
        } else {
            std::mem::take(&mut plan.params.seccomp_rules)
        };
        seccomp::install(&rules)?;
        tracing::debug!("{} filter rules loaded", rules.len());
    }

    let path = plan.params.path.as_ref().ok_or(Error::NoExecutable)?;
    let mut cmd = Command::new(path.as_str());
    let mut args = plan.params.args.iter();
    if let Some(arg0) = args.next() {
        cmd.arg0(arg0);
    }
    cmd.args(args);
    cmd.env_clear();
    cmd.envs(plan.params.env.iter().filter_map(|kv| kv.split_once('=')));
    cmd.current_dir(plan.params.dir.as_str());

    // user extra files arrive right after the setup pipe and move down
    // to the conventional range for the initial process
    let setup_fd = setup.fd;
    let count = i32::try_from(plan.count).map_err(|_| Error::SetupFdRange(plan.count as i64))?;
    if count > 0 {
        // SAFETY: dup2 and fcntl are async-signal-safe
        unsafe {
            cmd.pre_exec(move || {
                for i in 0..count {
                    let src = setup_fd + 1 + i;
                    if libc::dup2(src, 3 + i) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::fcntl(src, libc::F_SETFD, libc::FD_CLOEXEC) == -1 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
    }

    umask(old_mask);

    let (tx, rx) = mpsc::channel();
    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    output::suspend();
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            output::resume();
            return Err(setup_io("start initial program", e));
        }
    };
    let child_pid = Pid::from_raw(child.id() as i32);

    if let Err(e) = close_fd(setup.into_file()) {
        tracing::error!("cannot close setup pipe: {e}");
    }

    let tx_sig = tx.clone();
    thread::spawn(move || {
        for sig in signals.forever() {
            if tx_sig.send(Event::Signal(sig)).is_err() {
                return;
            }
        }
    });

    let tx_wait = tx.clone();
    thread::spawn(move || {
        loop {
            match waitpid(None, None) {
                Ok(status) => {
                    if tx_wait.send(Event::Reaped(status)).is_err() {
                        return;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(errno) => {
                    tracing::debug!("unexpected wait4 response: {errno}");
                    break;
                }
            }
        }
        let _ = tx_wait.send(Event::WaitDone);
    });

    let adopt_wait_ms = match plan.params.adopt_wait_delay_ms {
        0 => Some(ADOPT_WAIT_DEFAULT_MS),
        ms if ms > 0 => Some(ms as u64),
        _ => None,
    };

    Ok(reap_loop(
        &rx,
        &tx,
        child_pid,
        plan.params.forward_cancel,
        adopt_wait_ms,
        &mut |pid| signal::kill(pid, Signal::SIGINT),
    ))
}

/// Pumps reaper events until an exit code is decided.
///
/// `forward` delivers the translated cancellation signal; the initial
/// process may already be gone by then, in which case the failure is
/// logged and stragglers keep draining.
fn reap_loop(
    rx: &mpsc::Receiver<Event>,
    tx: &mpsc::Sender<Event>,
    child_pid: Pid,
    forward_cancel: bool,
    adopt_wait_ms: Option<u64>,
    forward: &mut dyn FnMut(Pid) -> nix::Result<()>,
) -> i32 {
    let mut code = 2;
    let mut timer_armed = false;
    loop {
        let Ok(event) = rx.recv() else { return code };
        match event {
            Event::Signal(sig) => {
                let name = Signal::try_from(sig).map_or("signal", Signal::as_str);
                if output::resume() {
                    tracing::debug!("{name} after process start");
                } else {
                    tracing::debug!("got {name}");
                }
                if sig == CANCEL_SIGNAL && forward_cancel {
                    tracing::debug!("forwarding cancellation to initial process");
                    if let Err(errno) = forward(child_pid) {
                        tracing::error!("cannot forward cancellation: {errno}");
                    }
                    continue;
                }
                return 0;
            }
            Event::Reaped(status) => {
                if status.pid() != Some(child_pid) {
                    continue;
                }
                output::resume();
                code = match status {
                    WaitStatus::Exited(_, c) => {
                        tracing::debug!("initial process exited with code {c}");
                        c
                    }
                    WaitStatus::Signaled(_, sig, _) => {
                        tracing::debug!("initial process terminated by {}", sig.as_str());
                        128 + sig as i32
                    }
                    _ => {
                        tracing::debug!("initial process in unexpected state {status:?}");
                        255
                    }
                };
                if !timer_armed {
                    if let Some(ms) = adopt_wait_ms {
                        timer_armed = true;
                        let tx_timer = tx.clone();
                        thread::spawn(move || {
                            thread::sleep(Duration::from_millis(ms));
                            let _ = tx_timer.send(Event::Timeout);
                        });
                    }
                }
            }
            Event::WaitDone => return code,
            Event::Timeout => {
                tracing::warn!("timeout exceeded waiting for lingering processes");
                return code;
            }
        }
    }
}

/// The setup pipe, kept open until the initial process has started.
struct SetupPipe {
    file: File,
    fd: RawFd,
}

impl SetupPipe {
    /// Releases the underlying file for explicit closing.
    fn into_file(self) -> File {
        self.file
    }
}

/// Reads the plan from the fd named by the setup environment variable.
fn receive() -> Result<(InitPlan, SetupPipe)> {
    let value = env::var(SETUP_ENV).map_err(|_| Error::SetupEnvNotSet)?;
    let fd: RawFd = value.parse().map_err(|_| Error::SetupEnvFormat(value.clone()))?;
    if fd < 3 {
        return Err(Error::SetupFdRange(fd.into()));
    }

    // SAFETY: the parent passes ownership of this inherited descriptor
    let mut file = unsafe { File::from_raw_fd(fd) };
    // SAFETY: file holds the descriptor for the duration of the call
    unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };

    let plan: InitPlan = vessel_proto::decode(&mut file).map_err(Error::PlanDecode)?;
    Ok((plan, SetupPipe { file, fd }))
}

/// close(2) surfacing the error the File destructor would swallow.
fn close_fd(file: File) -> io::Result<()> {
    let fd = file.into_raw_fd();
    // SAFETY: fd is owned and never used after this point
    if unsafe { libc::close(fd) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Syscall surface of the id-map sequence, split out so the write
/// order stays assertable.
trait IdMapApi {
    /// prctl PR_SET_DUMPABLE.
    fn set_dumpable(&mut self, value: libc::c_ulong, step: &'static str) -> Result<()>;
    /// Whole-file write labelled as a setup step.
    fn write(&mut self, step: &'static str, path: &str, data: &str) -> Result<()>;
}

/// [`IdMapApi`] over the real kernel interfaces.
struct HostIds;

impl IdMapApi for HostIds {
    fn set_dumpable(&mut self, value: libc::c_ulong, step: &'static str) -> Result<()> {
        // SAFETY: no pointer arguments
        if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, value, 0, 0, 0) } == -1 {
            return Err(Error::Setup { step, source: Errno::last() });
        }
        Ok(())
    }

    fn write(&mut self, step: &'static str, path: &str, data: &str) -> Result<()> {
        fs::write(path, data).map_err(|e| setup_io(step, e))
    }
}

/// Maps a single container uid and gid onto their host counterparts.
///
/// The proc id-map files are only writable while the process is
/// dumpable, so the entire write sequence runs between the two
/// dumpable toggles.
fn map_ids(
    api: &mut impl IdMapApi,
    uid: i32,
    host_uid: u32,
    gid: i32,
    host_gid: u32,
) -> Result<()> {
    api.set_dumpable(SUID_DUMP_USER, "set SUID_DUMP_USER")?;
    api.write("write uid_map", "/proc/self/uid_map", &format!("{uid} {host_uid} 1\n"))?;
    match api.write("write setgroups", "/proc/self/setgroups", "deny\n") {
        // only present on kernels with user namespace support
        Err(Error::Setup { source: Errno::ENOENT, .. }) => {}
        other => other?,
    }
    api.write("write gid_map", "/proc/self/gid_map", &format!("{gid} {host_gid} 1\n"))?;
    api.set_dumpable(SUID_DUMP_DISABLE, "set SUID_DUMP_DISABLE")
}

/// Opens `path` as an O_PATH descriptor, retrying on EINTR.
fn open_path_fd(path: &str, step: &'static str) -> Result<OwnedFd> {
    loop {
        match open(path, OFlag::O_PATH | OFlag::O_CLOEXEC, Mode::empty()) {
            Ok(fd) => return Ok(fd),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(Error::Setup { step, source: e }),
        }
    }
}

/// Wraps an io error as a labelled setup step, keeping the errno.
fn setup_io(step: &'static str, e: io::Error) -> Error {
    match e.raw_os_error() {
        Some(code) => Error::Setup { step, source: Errno::from_raw(code) },
        None => Error::Io(e),
    }
}

/// Cached kernel.overflowuid.
static OVERFLOW_UID: OnceLock<u32> = OnceLock::new();
/// Cached kernel.overflowgid.
static OVERFLOW_GID: OnceLock<u32> = OnceLock::new();
/// Cached kernel.cap_last_cap.
static CAP_LAST_CAP: OnceLock<u32> = OnceLock::new();

/// Reads a numeric sysctl under /proc/sys/kernel.
fn read_sysctl(name: &str) -> Option<u32> {
    fs::read_to_string(format!("/proc/sys/kernel/{name}")).ok()?.trim().parse().ok()
}

/// Uid unmapped ids appear as, usually 65534.
pub(crate) fn overflow_uid() -> u32 {
    *OVERFLOW_UID.get_or_init(|| read_sysctl("overflowuid").unwrap_or(65534))
}

/// Gid unmapped ids appear as, usually 65534.
pub(crate) fn overflow_gid() -> u32 {
    *OVERFLOW_GID.get_or_init(|| read_sysctl("overflowgid").unwrap_or(65534))
}

/// Highest capability number the running kernel supports.
pub(crate) fn cap_last_cap() -> u32 {
    *CAP_LAST_CAP.get_or_init(|| read_sysctl("cap_last_cap").unwrap_or(40))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// [`IdMapApi`] recording calls instead of touching the kernel.
    struct RecordIds {
        calls: Vec<String>,
        setgroups_errno: Option<Errno>,
    }

    impl RecordIds {
        fn new(setgroups_errno: Option<Errno>) -> Self {
            Self { calls: Vec::new(), setgroups_errno }
        }
    }

    impl IdMapApi for RecordIds {
        fn set_dumpable(&mut self, value: libc::c_ulong, _step: &'static str) -> Result<()> {
            self.calls.push(format!("dumpable {value}"));
            Ok(())
        }

        fn write(&mut self, step: &'static str, path: &str, data: &str) -> Result<()> {
            self.calls.push(format!("{path} {data:?}"));
            if path == "/proc/self/setgroups" {
                if let Some(errno) = self.setgroups_errno {
                    return Err(Error::Setup { step, source: errno });
                }
            }
            Ok(())
        }
    }

    #[test]
    fn id_maps_bracketed_by_dumpable() {
        let mut api = RecordIds::new(None);
        map_ids(&mut api, 1000, 100_000, 100, 100_100).unwrap();
        assert_eq!(
            api.calls,
            [
                "dumpable 1",
                "/proc/self/uid_map \"1000 100000 1\\n\"",
                "/proc/self/setgroups \"deny\\n\"",
                "/proc/self/gid_map \"100 100100 1\\n\"",
                "dumpable 0",
            ],
        );
    }

    #[test]
    fn setgroups_enoent_tolerated() {
        let mut api = RecordIds::new(Some(Errno::ENOENT));
        map_ids(&mut api, 0, 0, 0, 0).unwrap();
        assert!(api.calls.iter().any(|c| c.starts_with("/proc/self/gid_map")));
        assert_eq!(api.calls.last().unwrap(), "dumpable 0");

        let mut api = RecordIds::new(Some(Errno::EACCES));
        assert!(matches!(
            map_ids(&mut api, 0, 0, 0, 0),
            Err(Error::Setup { source: Errno::EACCES, .. })
        ));
    }

    #[test]
    fn root_fd_opens_with_o_path() {
        use std::os::unix::io::AsRawFd;

        let fd = open_path_fd("/", "open intermediate root").unwrap();
        // SAFETY: no pointer arguments
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        assert_ne!(flags, -1);
        assert_ne!(flags & libc::O_PATH, 0);
    }

    /// Runs [`reap_loop`] over a canned event sequence, counting
    /// forward deliveries.
    fn pump(
        events: Vec<Event>,
        forward_cancel: bool,
        adopt_wait_ms: Option<u64>,
    ) -> (i32, usize) {
        let (tx, rx) = mpsc::channel();
        for ev in events {
            tx.send(ev).unwrap();
        }
        let child = Pid::from_raw(5);
        let mut forwarded = 0;
        let code = reap_loop(&rx, &tx, child, forward_cancel, adopt_wait_ms, &mut |pid| {
            assert_eq!(pid, child);
            forwarded += 1;
            Ok(())
        });
        (code, forwarded)
    }

    #[test]
    fn reap_remembers_exit_code() {
        let events = vec![
            Event::Reaped(WaitStatus::Exited(Pid::from_raw(5), 42)),
            Event::WaitDone,
        ];
        assert_eq!(pump(events, false, None), (42, 0));
    }

    #[test]
    fn reap_ignores_other_descendants() {
        let events = vec![
            Event::Reaped(WaitStatus::Exited(Pid::from_raw(9), 7)),
            Event::WaitDone,
        ];
        // the remembered code never left its default
        assert_eq!(pump(events, false, None), (2, 0));
    }

    #[test]
    fn reap_signal_termination_code() {
        let events = vec![
            Event::Reaped(WaitStatus::Signaled(Pid::from_raw(5), Signal::SIGKILL, false)),
            Event::WaitDone,
        ];
        assert_eq!(pump(events, false, None), (137, 0));
    }

    #[test]
    fn cancel_forwarded_after_initial_exit() {
        // the initial process is already reaped when SIGTERM arrives;
        // the cancellation is still forwarded and the code survives
        let events = vec![
            Event::Reaped(WaitStatus::Exited(Pid::from_raw(5), 42)),
            Event::Signal(CANCEL_SIGNAL),
            Event::WaitDone,
        ];
        assert_eq!(pump(events, true, None), (42, 1));
    }

    #[test]
    fn signal_without_forward_exits_zero() {
        let events = vec![Event::Signal(CANCEL_SIGNAL)];
        assert_eq!(pump(events, false, None), (0, 0));

        // only the cancel signal is ever forwarded
        let events = vec![Event::Signal(signal_hook::consts::SIGINT)];
        assert_eq!(pump(events, true, None), (0, 0));
    }

    #[test]
    fn reap_timeout_keeps_code() {
        // no WaitDone: a straggler holds the pid namespace open until
        // the adopt-wait timer fires
        let events = vec![Event::Reaped(WaitStatus::Exited(Pid::from_raw(5), 3))];
        assert_eq!(pump(events, false, Some(1)), (3, 0));
    }

    #[test]
    fn sysctl_cache_reads_host_values() {
        // values on any supported kernel
        assert!(overflow_uid() > 0);
        assert!(overflow_gid() > 0);
        assert!(cap_last_cap() >= 37);
    }

    #[test]
    fn receive_requires_environment() {
        // the variable is never set under the test harness
        assert!(matches!(receive(), Err(Error::SetupEnvNotSet)));
    }

    #[test]
    fn adopt_wait_defaulting() {
        for (ms, expect) in [
            (0i64, Some(ADOPT_WAIT_DEFAULT_MS)),
            (250, Some(250)),
            (-1, None),
        ] {
            let resolved = match ms {
                0 => Some(ADOPT_WAIT_DEFAULT_MS),
                ms if ms > 0 => Some(ms as u64),
                _ => None,
            };
            assert_eq!(resolved, expect);
        }
    }
}
