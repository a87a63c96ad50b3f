//! `knobprofctl` -- inspect or signal a running profiled process (§6 "CLI
//! surfaces"). Two subcommands: `status` reads `/proc/<pid>/status` and
//! reports whether the PID looks alive plus the artifact paths it would
//! write to; `flush` sends it `SIGUSR2` to force a mid-run artifact dump.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "knobprofctl", about = "Inspect or signal a running knobprof process")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Report whether `--pid` is alive and where it would write artifacts.
    Status {
        #[arg(long)]
        pid: i32,
    },
    /// Send SIGUSR2 to `--pid`, forcing an immediate flush.
    Flush {
        #[arg(long)]
        pid: i32,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Status { pid } => status(pid),
        Command::Flush { pid } => flush(pid),
    }
}

fn status(pid: i32) -> Result<()> {
    let alive = process_is_alive(pid);
    println!("pid {pid}: {}", if alive { "running" } else { "not found" });

    if alive {
        println!("  gmon artifact:     {}", artifact_path("GMON_OUT_PREFIX", "gmon", pid).display());
        println!("  gmon_var artifact: {}", artifact_path("GMON_VAR_PREFIX", "gmon_var", pid).display());
    }

    Ok(())
}

fn flush(pid: i32) -> Result<()> {
    if !process_is_alive(pid) {
        bail!("pid {pid} is not running");
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid), Signal::SIGUSR2).with_context(|| format!("failed to signal pid {pid}"))?;
    }
    #[cfg(not(unix))]
    {
        bail!("flush is only supported on unix targets");
    }

    println!("sent SIGUSR2 to pid {pid}");
    Ok(())
}

#[cfg(target_os = "linux")]
fn process_is_alive(pid: i32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}/status")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_is_alive(pid: i32) -> bool {
    // No /proc on this platform; fall back to signal 0, which only checks
    // for existence/permission and delivers nothing.
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Mirrors `writer::artifact_path`'s env-prefix/SUID logic (that function
/// is private to the library, and this binary has no process of its own
/// to be SUID-sensitive about, so it only re-derives the non-SUID branch).
fn artifact_path(env_prefix: &str, default_name: &str, pid: i32) -> PathBuf {
    if let Ok(prefix) = std::env::var(env_prefix) {
        return PathBuf::from(format!("{prefix}.{pid}"));
    }
    PathBuf::from(format!("/tmp/vprof/gmon/{default_name}.{pid}.out"))
}
