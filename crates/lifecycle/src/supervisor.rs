// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Forking and reaping of auxiliary processes.
//!
//! The orchestrator forks a small fixed set of helpers: a console viewer,
//! a VNC viewer, the daemonizing bootstrap, and the migration transport.
//! The supervisor owns only their identity and reap logic; a spawned body
//! never returns to the caller's continuation, it execs or exits.

use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::process;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, pipe, setsid, ForkResult, Pid};
use slog::{info, o, warn};

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "supervisor"))
    };
}

const CHILD_ROLES: usize = 4;

/// How long to wait for the migration transport to exit before giving up
/// on reporting its status.
const TRANSPORT_REPORT_DEADLINE: Duration = Duration::from_secs(2);
const TRANSPORT_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildRole {
    Console,
    VncViewer,
    Daemon,
    MigrationTransport,
}

impl ChildRole {
    fn index(self) -> usize {
        self as usize
    }

    pub fn description(self) -> &'static str {
        match self {
            ChildRole::Console => "console child",
            ChildRole::VncViewer => "vncviewer child",
            ChildRole::Daemon => "domain monitoring daemonizing child",
            ChildRole::MigrationTransport => "migration transport process",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled(Signal),
    /// The child had not exited within the bounded wait; its status goes
    /// unreported.
    Unreported,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        matches!(self, ExitOutcome::Exited(0))
    }
}

/// Which side of a daemonizing fork the caller continues on.
pub enum DaemonizeOutcome {
    /// The original process; the daemon runs on without it.
    Parent,
    /// The detached daemon, with the opened log file.
    Child(File),
}

#[derive(Default)]
pub struct ChildSupervisor {
    children: [Option<Pid>; CHILD_ROLES],
}

impl ChildSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self, role: ChildRole) -> Option<Pid> {
        self.children[role.index()]
    }

    /// Forks once and runs `body` in the child; the child exits with the
    /// body's return code and never reaches the caller's continuation.
    /// The body must restrict itself to exec/_exit-safe work.
    pub fn spawn<F>(&mut self, role: ChildRole, body: F) -> Result<Pid>
    where
        F: FnOnce() -> i32,
    {
        match unsafe { fork() }.with_context(|| format!("fork {}", role.description()))? {
            ForkResult::Parent { child } => {
                self.children[role.index()] = Some(child);
                Ok(child)
            }
            ForkResult::Child => {
                let code = body();
                unsafe { libc::_exit(code) }
            }
        }
    }

    /// Reaps the child for `role`, blocking until it exits. Returns None
    /// when no child is registered for the role or the wait itself fails.
    pub fn report(&mut self, role: ChildRole) -> Option<ExitOutcome> {
        let pid = self.children[role.index()].take()?;

        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                if code != 0 {
                    warn!(
                        sl!(),
                        "{} [{}] exited with code {}",
                        role.description(),
                        pid,
                        code
                    );
                }
                Some(ExitOutcome::Exited(code))
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                warn!(
                    sl!(),
                    "{} [{}] died from signal {}",
                    role.description(),
                    pid,
                    sig
                );
                Some(ExitOutcome::Signaled(sig))
            }
            Ok(status) => {
                warn!(
                    sl!(),
                    "{} [{}] reported unexpected wait status {:?}",
                    role.description(),
                    pid,
                    status
                );
                Some(ExitOutcome::Unreported)
            }
            Err(e) => {
                warn!(
                    sl!(),
                    "failed to waitpid for {}: {}",
                    role.description(),
                    e
                );
                None
            }
        }
    }

    /// Non-blocking reap with a bounded wait, for children whose exit
    /// confirmation is best-effort only.
    pub fn report_bounded(&mut self, role: ChildRole) -> Option<ExitOutcome> {
        let pid = self.children[role.index()].take()?;
        let deadline = Instant::now() + TRANSPORT_REPORT_DEADLINE;

        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(_, code)) => {
                    if code != 0 {
                        info!(
                            sl!(),
                            "{} [{}] exited with code {}",
                            role.description(),
                            pid,
                            code
                        );
                    }
                    return Some(ExitOutcome::Exited(code));
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    info!(
                        sl!(),
                        "{} [{}] died from signal {}",
                        role.description(),
                        pid,
                        sig
                    );
                    return Some(ExitOutcome::Signaled(sig));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        sl!(),
                        "wait for {} [{}] failed: {}",
                        role.description(),
                        pid,
                        e
                    );
                    return None;
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    sl!(),
                    "{} [{}] not exiting, no longer waiting (exit status will be unreported)",
                    role.description(),
                    pid
                );
                return Some(ExitOutcome::Unreported);
            }
            std::thread::sleep(TRANSPORT_POLL_INTERVAL);
        }
    }

    /// Spawns the migration transport: `sh -c rune` with one pipe pair
    /// wired onto its stdin/stdout. Returns the parent's (send, receive)
    /// ends. SIGPIPE is ignored from here on so a dead peer surfaces as
    /// an ordinary I/O error rather than process termination.
    pub fn spawn_transport(&mut self, rune: &str) -> Result<(File, File)> {
        let (send_r, send_w) = pipe().context("create transport send pipe")?;
        let (recv_r, recv_w) = pipe().context("create transport receive pipe")?;

        match unsafe { fork() }.context("fork migration transport")? {
            ForkResult::Parent { child } => {
                self.children[ChildRole::MigrationTransport.index()] = Some(child);
                let _ = close(send_r);
                let _ = close(recv_w);

                ignore_sigpipe();

                // Safety: the fds are freshly created pipe ends owned by
                // no other object.
                let send = unsafe { File::from_raw_fd(send_w) };
                let recv = unsafe { File::from_raw_fd(recv_r) };
                Ok((send, recv))
            }
            ForkResult::Child => {
                let _ = dup2(send_r, 0);
                let _ = dup2(recv_w, 1);
                for fd in &[send_r, send_w, recv_r, recv_w] {
                    let _ = close(*fd);
                }

                let code = exec_shell(rune);
                unsafe { libc::_exit(code) }
            }
        }
    }

    /// Detaches the monitor into the background: fork, redirect stdin to
    /// /dev/null and stdout/stderr to `logfile` (once, inside the child,
    /// before any other supervised work), new session, optional pid file.
    pub fn daemonize(&mut self, logfile: &Path, pidfile: Option<&Path>) -> Result<DaemonizeOutcome> {
        match unsafe { fork() }.context("fork daemonizing child")? {
            ForkResult::Parent { child } => {
                self.children[ChildRole::Daemon.index()] = Some(child);
                // The intermediate child exits as soon as the daemon is
                // detached; reap it here.
                self.report(ChildRole::Daemon);
                Ok(DaemonizeOutcome::Parent)
            }
            ForkResult::Child => {
                let logfd = open(
                    logfile,
                    OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
                    Mode::from_bits_truncate(0o644),
                )
                .with_context(|| format!("open logfile {}", logfile.display()))?;

                let nullfd = open(Path::new("/dev/null"), OFlag::O_RDONLY, Mode::empty())
                    .context("open /dev/null")?;

                dup2(nullfd, 0).context("redirect stdin")?;
                dup2(logfd, 1).context("redirect stdout")?;
                dup2(logfd, 2).context("redirect stderr")?;
                let _ = close(nullfd);

                // Detach: the intermediate process exits, the grandchild
                // continues as the daemon in its own session.
                match unsafe { fork() }.context("fork daemon")? {
                    ForkResult::Parent { .. } => unsafe { libc::_exit(0) },
                    ForkResult::Child => {}
                }
                setsid().context("setsid")?;

                if let Some(pidfile) = pidfile {
                    let mut f = File::create(pidfile)
                        .with_context(|| format!("open pidfile {}", pidfile.display()))?;
                    writeln!(f, "{}", process::id()).context("write pidfile")?;
                }

                // Safety: logfd stays open for the daemon's logger; no
                // other owner exists.
                Ok(DaemonizeOutcome::Child(unsafe { File::from_raw_fd(logfd) }))
            }
        }
    }
}

pub fn ignore_sigpipe() {
    // Safety: installing SIG_IGN is async-signal-safe and process-wide.
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) };
}

/// Execs `sh -c rune`; only returns (with 127) if the exec fails.
fn exec_shell(rune: &str) -> i32 {
    let argv = vec![
        CString::new("sh").unwrap(),
        CString::new("-c").unwrap(),
        match CString::new(rune) {
            Ok(s) => s,
            Err(_) => return 127,
        },
    ];
    let _ = execvp(&argv[0], &argv);
    eprintln!("failed to exec sh");
    127
}

/// Execs an operator-configured helper command with the domain id
/// appended; only returns (with 127) if the exec fails.
pub fn exec_command(args: &[String]) -> i32 {
    let argv: Vec<CString> = match args.iter().map(|a| CString::new(a.as_str())).collect() {
        Ok(v) => v,
        Err(_) => return 127,
    };
    if argv.is_empty() {
        return 127;
    }
    let _ = execvp(&argv[0], &argv);
    eprintln!("failed to exec {}", args[0]);
    127
}
