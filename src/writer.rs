//! Process lifecycle: `monstartup`/`mcleanup`, signal installation, the
//! ITIMER_PROF interval, and artifact serialization (§4.F).
//!
//! A single global `ProfilerState` lives behind an `AtomicPtr` so the
//! SIGPROF/SIGUSR2 handlers -- plain `extern "C" fn`s with no closure
//! environment -- can reach it without allocating. The pointer is set once
//! by `monstartup` and cleared once by `mcleanup`; every other access is a
//! read.

use std::os::raw::{c_int, c_void};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::arena::{self, Arenas};
use crate::config;
use crate::context::{self, RegisterSnapshot};
use crate::error::{ProfError, Result};
use crate::hashtable::TextWindow;
use crate::location::MemoryImage;
use crate::phdr;
use crate::recorder;
use crate::sampler::{self, Tick};
use crate::storage;

/// Options controlling one profiling session, supplied to `monstartup`.
#[derive(Debug, Clone)]
pub struct ProfilerOptions {
    /// Short program name checked against the config file's header line.
    pub progname: String,
    /// Path to the variable-tracking config (defaults to
    /// `/tmp/vprof/info.txt`, per §6).
    pub config_path: PathBuf,
    /// Ticks per second for `ITIMER_PROF` (`profile_frequency`).
    pub profile_frequency: u32,
    /// Whether to walk and re-sample caller frames on each tick (§4.D.5).
    pub unwind: bool,
    /// Hash-table stride divisor (`HASHFRACTION`-equivalent); defaults to
    /// the crate constant.
    pub hash_fraction: usize,
}

impl Default for ProfilerOptions {
    fn default() -> Self {
        ProfilerOptions {
            progname: std::env::args().next().unwrap_or_default(),
            config_path: PathBuf::from("/tmp/vprof/info.txt"),
            profile_frequency: 100,
            unwind: cfg!(feature = "unwind"),
            hash_fraction: crate::hashtable::HASHFRACTION,
        }
    }
}

struct ProfilerState {
    arenas: Arenas,
    launch_pid: u32,
    profile_frequency: u32,
    unwind: bool,
    variable_sampling_enabled: AtomicBool,
    set_itimer: AtomicBool,
    error: AtomicBool,
    progname: String,
}

static STATE: AtomicPtr<ProfilerState> = AtomicPtr::new(std::ptr::null_mut());

fn state() -> Option<&'static ProfilerState> {
    let ptr = STATE.load(Ordering::Acquire);
    unsafe { ptr.as_ref() }
}

/// Returns whether the profiler has recorded an unrecoverable setup error
/// (§7 "a configurable `PROF_ERROR` state that may be queried").
pub fn is_error() -> bool {
    state().map(|s| s.error.load(Ordering::Relaxed)).unwrap_or(false)
}

/// Starts profiling over `[lowpc, highpc)`: rounds the window outward,
/// allocates every arena, loads the variable config, installs the SIGPROF
/// and SIGUSR2 handlers, and arms `ITIMER_PROF` (§4.F).
///
/// Allocation or signal-installation failure sets `PROF_ERROR` and leaves
/// every subsystem disabled rather than terminating the process (§7).
pub fn monstartup(lowpc: u64, highpc: u64, opts: ProfilerOptions) -> Result<()> {
    let window = TextWindow::new(lowpc as usize, highpc as usize, opts.hash_fraction);
    let mut arenas = Arenas::with_limits(window, arena::DEFAULT_VAR_LIMIT, arena::SAMPLE_LIMIT);

    let variable_sampling_enabled = match config::load(&opts.config_path, &opts.progname, &mut arenas) {
        Ok(loaded) => loaded,
        Err(e) => {
            warn!("variable config not loaded: {e}");
            false
        }
    };

    let state = Box::new(ProfilerState {
        arenas,
        launch_pid: std::process::id(),
        profile_frequency: opts.profile_frequency.max(1),
        unwind: opts.unwind,
        variable_sampling_enabled: AtomicBool::new(variable_sampling_enabled),
        set_itimer: AtomicBool::new(false),
        error: AtomicBool::new(false),
        progname: opts.progname,
    });
    let ptr = Box::into_raw(state);
    let prev = STATE.swap(ptr, Ordering::AcqRel);
    if !prev.is_null() {
        // A previous session was never cleaned up; drop it now rather
        // than leak, matching "allocated once, freed once" (§3).
        unsafe {
            drop(Box::from_raw(prev));
        }
    }

    // Prime the load-address cache from ordinary (non-signal) context
    // before any handler is installed: `dl_iterate_phdr` is not
    // async-signal-safe, so the first SIGPROF must never be the one to
    // trigger it (§4.F "Load-address capture").
    phdr::load_address();

    install_handlers()?;
    arm_timer(opts.profile_frequency.max(1))?;
    unsafe {
        libc::atexit(mcleanup_atexit);
    }

    Ok(())
}

fn install_handlers() -> Result<()> {
    let sigprof_action = SigAction::new(
        SigHandler::SigAction(handle_sigprof),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGPROF, &sigprof_action).map_err(|_| {
            ProfError::SignalInstall(std::io::Error::last_os_error())
        })?;
    }

    let sigusr2_action = SigAction::new(
        SigHandler::SigAction(handle_sigusr2),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGUSR2, &sigusr2_action).map_err(|_| {
            ProfError::SignalInstall(std::io::Error::last_os_error())
        })?;
    }

    Ok(())
}

fn arm_timer(frequency: u32) -> Result<()> {
    let interval_us = 1_000_000u64 / frequency as u64;
    let interval = libc::timeval {
        tv_sec: (interval_us / 1_000_000) as libc::time_t,
        tv_usec: (interval_us % 1_000_000) as libc::suseconds_t,
    };
    let it = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    let rc = unsafe { libc::setitimer(libc::ITIMER_PROF, &it, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(ProfError::SignalInstall(std::io::Error::last_os_error()));
    }
    if let Some(s) = state() {
        s.set_itimer.store(true, Ordering::Relaxed);
    }
    Ok(())
}

/// Timer repair (§4.D.2, §5 "Timer ownership"): a forked child inherits the
/// SIGPROF handler but not the parent's `ITIMER_PROF`. The handler detects
/// this by PID mismatch and re-arms its own timer unconditionally --
/// preserved literally per the §9 Open Questions decision, not gated by an
/// epsilon comparison against the old interval.
fn repair_timer_if_forked(s: &ProfilerState) {
    let current_pid = std::process::id();
    if current_pid != s.launch_pid && !s.set_itimer.load(Ordering::Relaxed) {
        let _ = arm_timer(s.profile_frequency);
    }
}

/// Reads directly out of this process' own address space. Signal-safe in
/// the sense that it performs no allocation and no syscalls; it trusts the
/// evaluator's stack-pointer guard (§4.A) to keep it away from unmapped
/// memory rather than validating mappings itself (there is no
/// async-signal-safe way to query `/proc/self/maps` at sample time).
struct LiveMemory;

impl MemoryImage for LiveMemory {
    fn read_u64(&self, addr: u64, size: u8) -> Option<u64> {
        if addr == 0 || size == 0 || size > 8 {
            return None;
        }
        let ptr = addr as *const u8;
        let mut buf = [0u8; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), size as usize);
        }
        Some(u64::from_ne_bytes(buf))
    }
}

extern "C" fn handle_sigprof(_sig: c_int, _info: *mut libc::siginfo_t, ctx: *mut c_void) {
    let Some(s) = state() else { return };
    repair_timer_if_forked(s);

    if s.arenas.samples.is_empty() {
        // mcleanup already tore the arenas down from under us (only
        // possible racing the very last tick before the timer is
        // disarmed); treat as a no-op per §4.F "set samples = null".
        return;
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    let regs = unsafe { context::snapshot_from_ucontext(ctx as *const libc::ucontext_t) };
    #[cfg(not(all(unix, target_arch = "x86_64")))]
    let regs = {
        let _ = ctx;
        RegisterSnapshot::empty()
    };

    let Some(pc) = regs.instruction_pointer() else {
        return;
    };
    let tid = thread_id();
    let now_us = now_micros();
    let load_address = phdr::load_address();

    let tick = Tick { pc, tid, regs: &regs };
    sampler::on_tick(&s.arenas, &LiveMemory, &tick, now_us, load_address, s.unwind);
}

extern "C" fn handle_sigusr2(_sig: c_int, _info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    // A forced mid-run flush (§4.F): same serialization as shutdown, but
    // the profiler keeps running afterward (a deliberate REDESIGN relative
    // to the historical tool -- see DESIGN.md).
    if let Some(s) = state() {
        let _ = flush(&s.arenas, s.profile_frequency);
    }
}

extern "C" fn mcleanup_atexit() {
    let _ = mcleanup();
}

fn thread_id() -> u32 {
    #[cfg(target_os = "linux")]
    {
        unsafe { libc::syscall(libc::SYS_gettid) as u32 }
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

fn now_micros() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000 + (ts.tv_nsec as u64) / 1_000
}

fn artifact_path(env_prefix: &str, default_dir: &str, default_name: &str, pid: u32) -> PathBuf {
    let suid = is_suid();
    if !suid {
        if let Ok(prefix) = std::env::var(env_prefix) {
            return PathBuf::from(format!("{prefix}.{pid}"));
        }
    }
    PathBuf::from(format!("{default_dir}/{default_name}.{pid}.out"))
}

#[cfg(unix)]
fn is_suid() -> bool {
    unsafe { libc::geteuid() != libc::getuid() }
}

#[cfg(not(unix))]
fn is_suid() -> bool {
    false
}

fn flush(arenas: &Arenas, prof_rate: u32) -> Result<()> {
    let pid = std::process::id();
    let gmon_path = artifact_path("GMON_OUT_PREFIX", "/tmp/vprof/gmon", "gmon", pid);
    let var_path = artifact_path("GMON_VAR_PREFIX", "/tmp/vprof/gmon", "gmon_var", pid);

    if let Some(parent) = gmon_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    match std::fs::File::create(&gmon_path) {
        Ok(mut f) => {
            if let Err(e) = storage::write_gmon(&mut f, arenas, prof_rate) {
                error!("failed to write {}: {e}", gmon_path.display());
            }
        }
        Err(e) => error!("failed to create {}: {e}", gmon_path.display()),
    }

    match std::fs::File::create(&var_path) {
        Ok(mut f) => {
            if let Err(e) = storage::write_gmon_var(&mut f, arenas, prof_rate) {
                error!("failed to write {}: {e}", var_path.display());
            }
        }
        Err(e) => error!("failed to create {}: {e}", var_path.display()),
    }

    Ok(())
}

/// Stops the timer, disables the handlers, and writes both artifacts
/// (§4.F "Shutdown"). Idempotent: a second call observes `STATE` already
/// cleared and is a no-op.
///
/// Deliberately does **not** free the arenas: a SIGPROF delivered to
/// another thread may already be mid-flight inside `handle_sigprof` with a
/// live `&'static ProfilerState` borrowed from `STATE` before this swap.
/// Disarming the timer and reverting the handler to `SigIgn` stops any
/// *new* ticks (matching §4.F's "or at least set samples = null so
/// subsequent ticks no-op"), but freeing the memory underneath an
/// in-flight handler on another thread would be a use-after-free. The
/// arena is a single bounded allocation for the lifetime of one profiled
/// process, so leaking it until process exit is the safe trade.
pub fn mcleanup() -> Result<()> {
    let ptr = STATE.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() {
        return Ok(());
    }
    let state: &'static ProfilerState = unsafe { &*ptr };

    let disarm = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval { tv_sec: 0, tv_usec: 0 },
    };
    unsafe {
        libc::setitimer(libc::ITIMER_PROF, &disarm, std::ptr::null_mut());
    }
    unsafe {
        let _ = sigaction(
            Signal::SIGPROF,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        );
    }

    flush(&state.arenas, state.profile_frequency)?;
    Ok(())
}

/// Records one call-graph arc from the function-prologue hook (§4.E). The
/// real linkage mechanism (an `-finstrument-functions`-style compiler hook
/// or a hand-rolled prologue call) is an external collaborator per §1;
/// this `extern "C"` entry point is the contract it calls into.
pub extern "C" fn mcount(frompc: usize, selfpc: usize) {
    if let Some(s) = state() {
        recorder::record_call(&s.arenas, frompc as u64, selfpc as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_path_uses_env_prefix() {
        std::env::set_var("GMON_OUT_PREFIX_TEST_UNUSED", "noop");
        let path = artifact_path("KNOBPROF_TEST_PREFIX_DOES_NOT_EXIST", "/tmp/vprof/gmon", "gmon", 1234);
        assert_eq!(path, PathBuf::from("/tmp/vprof/gmon/gmon.1234.out"));
    }
}
