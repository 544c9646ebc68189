// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Domain bring-up and the long-running monitor loop.
//!
//! A [`LifecycleController`] owns one domain from creation (or restore,
//! or soft reset) until its final shutdown, reacting to lifecycle events
//! according to the per-reason restart policy in the domain config.

use std::io::Read;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use slog::{info, o, warn};

use platform::{DomainConfig, DomainId, Event, Platform, RestoreParams};

use crate::lock::InstanceLock;
use crate::reclaim;
use crate::restart::{self, RestartDecision};
use crate::supervisor::{ChildRole, ChildSupervisor, DaemonizeOutcome};

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "controller"))
    };
}

/// Host-wide serialization point for non-idempotent bring-up calls.
pub const DEFAULT_LOCK_PATH: &str = "/var/lock/domon";

pub const DEFAULT_DUMP_DIR: &str = "/var/lib/domon/dump";

const DEFAULT_LOG_DIR: &str = "/var/log/domon";

/// Name suffix format for domains kept alive by the preserve policy.
const PRESERVE_SUFFIX_FORMAT: &str = "-%Y%m%dT%H%MZ";

/// Grace period between tearing down a dead domain and building its
/// replacement, so the platform finishes releasing resources.
const RESTART_SETTLE_DELAY: Duration = Duration::from_secs(2);

pub struct ControllerOptions {
    pub lock_path: PathBuf,
    /// Reclaim host memory from the control domain when the build would
    /// not fit otherwise.
    pub autoballoon: bool,
    /// Leave the domain paused after bring-up.
    pub paused: bool,
    /// Stay around after bring-up and react to lifecycle events.
    pub monitor: bool,
    /// Detach the monitor into the background.
    pub daemonize: bool,
    /// Helper command to attach a console, run with the domain id
    /// appended. First boot only.
    pub console_command: Option<Vec<String>>,
    /// Same, for a VNC viewer.
    pub vnc_command: Option<Vec<String>>,
    pub pidfile: Option<PathBuf>,
    pub logfile: Option<PathBuf>,
    pub dump_dir: PathBuf,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            autoballoon: true,
            paused: false,
            monitor: true,
            daemonize: false,
            console_command: None,
            vnc_command: None,
            pidfile: None,
            logfile: None,
            dump_dir: PathBuf::from(DEFAULT_DUMP_DIR),
        }
    }
}

/// The domain under management. `name` is the stable identity; `domid`
/// changes whenever the domain is destroyed and re-created.
pub struct DomainRecord {
    pub domid: Option<DomainId>,
    pub name: String,
    pub config: DomainConfig,
}

/// How the domain comes into existence.
pub enum BringUpMode<'s> {
    Create,
    Restore {
        stream: &'s mut dyn Read,
        stream_version: u32,
        checkpointed: bool,
    },
    SoftReset {
        domid: DomainId,
    },
}

enum RestartKind {
    Create,
    SoftReset(DomainId),
}

pub struct LifecycleController<'p> {
    platform: &'p dyn Platform,
    opts: ControllerOptions,
    record: DomainRecord,
    supervisor: ChildSupervisor,
    // Keep the daemon's logger alive for the lifetime of the monitor.
    daemon_log: Option<(slog_scope::GlobalLoggerGuard, slog_async::AsyncGuard)>,
}

impl<'p> LifecycleController<'p> {
    pub fn new(platform: &'p dyn Platform, config: DomainConfig, opts: ControllerOptions) -> Self {
        let record = DomainRecord {
            domid: None,
            name: config.name.clone(),
            config,
        };
        Self {
            platform,
            opts,
            record,
            supervisor: ChildSupervisor::new(),
            daemon_log: None,
        }
    }

    pub fn record(&self) -> &DomainRecord {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut DomainRecord {
        &mut self.record
    }

    /// Brings the domain up, paused, under the host-wide creation lock.
    /// The lock is held only across the memory check and the platform
    /// call itself.
    pub fn bring_up(&mut self, mode: BringUpMode<'_>) -> Result<DomainId> {
        let mut lock = InstanceLock::new(&self.opts.lock_path);
        lock.acquire().context("failed to acquire creation lock")?;

        // Soft reset re-enters an existing allocation; nothing new to fit.
        if !matches!(mode, BringUpMode::SoftReset { .. })
            && !reclaim::ensure_capacity(self.platform, &self.record.config, self.opts.autoballoon)
        {
            return Err(anyhow!(
                "failed to free enough memory for domain '{}'",
                self.record.name
            ));
        }

        let domid = match mode {
            BringUpMode::Create => {
                info!(sl!(), "creating domain"; "name" => &self.record.name);
                self.platform
                    .create_domain(&self.record.config)
                    .context("domain creation failed")?
            }
            BringUpMode::Restore {
                stream,
                stream_version,
                checkpointed,
            } => {
                info!(sl!(), "restoring domain"; "name" => &self.record.name);
                let params = RestoreParams {
                    stream_version,
                    checkpointed,
                };
                self.platform
                    .restore_domain(&self.record.config, stream, &params)
                    .context("domain restore failed")?
            }
            BringUpMode::SoftReset { domid } => {
                info!(sl!(), "soft-resetting domain";
                    "name" => &self.record.name, "domid" => domid.0);
                self.platform
                    .soft_reset(&self.record.config, domid)
                    .context("domain soft reset failed")?
            }
        };

        self.record.domid = Some(domid);
        Ok(domid)
    }

    /// Post-bring-up steps: console attach, unpause, VNC attach. The
    /// console child is spawned before unpausing so no early boot output
    /// is lost.
    pub fn after_bring_up(&mut self) -> Result<()> {
        let domid = self.current_domid()?;

        if let Some(command) = self.opts.console_command.clone() {
            self.spawn_helper(ChildRole::Console, command, domid)?;
        }

        if !self.opts.paused {
            self.platform
                .unpause_domain(domid)
                .context("failed to unpause domain")?;
        }

        if let Some(command) = self.opts.vnc_command.clone() {
            self.spawn_helper(ChildRole::VncViewer, command, domid)?;
        }

        Ok(())
    }

    /// Full lifecycle: bring up, unpause, then (optionally detached)
    /// monitor until the domain is gone for good. Returns the process
    /// exit code.
    pub fn run(&mut self, mode: BringUpMode<'_>) -> Result<i32> {
        self.bring_up(mode)?;
        self.after_bring_up()?;

        if !self.opts.monitor {
            return Ok(0);
        }

        if self.opts.daemonize {
            let logfile = self.opts.logfile.clone().unwrap_or_else(|| {
                PathBuf::from(format!("{}/{}.log", DEFAULT_LOG_DIR, self.record.name))
            });
            match self
                .supervisor
                .daemonize(&logfile, self.opts.pidfile.as_deref())?
            {
                DaemonizeOutcome::Parent => return Ok(0),
                DaemonizeOutcome::Child(logfile) => {
                    let (logger, async_guard) = logging::create_logger(
                        "domon",
                        "monitor",
                        logging::DEFAULT_LEVEL,
                        logfile,
                    );
                    let scope_guard = slog_scope::set_global_logger(logger);
                    self.daemon_log = Some((scope_guard, async_guard));
                }
            }
        }

        let code = self.monitor()?;

        self.supervisor.report(ChildRole::Console);
        self.supervisor.report(ChildRole::VncViewer);
        Ok(code)
    }

    /// Reacts to lifecycle events until the domain reaches a terminal
    /// state. Destroy-and-recreate restarts change the domain id; events
    /// for any other id are logged and dropped.
    pub fn monitor(&mut self) -> Result<i32> {
        loop {
            let domid = self.current_domid()?;
            let event = self
                .platform
                .wait_event()
                .context("failed to get lifecycle event")?;

            if event.domid() != domid {
                warn!(sl!(),
                    "ignoring unexpected event for domain {} (expected domain {})",
                    event.domid().0, domid.0);
                continue;
            }

            match event {
                Event::Shutdown { reason, .. } => {
                    let action = match restart::action_for(reason, &self.record.config) {
                        Some(action) => action,
                        // Self-suspend; the domain will come back on its own.
                        None => {
                            info!(sl!(), "domain suspended itself"; "domid" => domid.0);
                            continue;
                        }
                    };

                    info!(sl!(), "domain shut down";
                        "domid" => domid.0,
                        "reason" => reason.to_string());

                    if restart::wants_core_dump(action) {
                        let path = self.opts.dump_dir.join(&self.record.name);
                        if let Err(e) = self.platform.core_dump_domain(domid, &path) {
                            warn!(sl!(), "core dump failed: {}", e; "domid" => domid.0);
                        }
                    }

                    match restart::handle_shutdown_event(reason, &self.record.config) {
                        RestartDecision::NoRestart { destroy } => {
                            if destroy {
                                self.platform
                                    .destroy_domain(domid)
                                    .context("failed to destroy domain")?;
                            } else {
                                info!(sl!(), "leaving domain in place"; "domid" => domid.0);
                            }
                            return Ok(0);
                        }
                        RestartDecision::RestartInPlace => {
                            self.reload_config(domid);
                            self.platform
                                .destroy_domain(domid)
                                .context("failed to destroy domain for restart")?;
                            self.restart(RestartKind::Create)?;
                        }
                        RestartDecision::RestartWithRename => {
                            self.reload_config(domid);
                            let suffix =
                                chrono::Utc::now().format(PRESERVE_SUFFIX_FORMAT).to_string();
                            let new_uuid: [u8; 16] = rand::random();
                            // On failure the old domain is left untouched
                            // rather than risking two domains with one name.
                            self.platform
                                .preserve_domain(domid, &self.record.config, &suffix, new_uuid)
                                .context("failed to preserve domain, leaving it as is")?;
                            self.restart(RestartKind::Create)?;
                        }
                        RestartDecision::RestartWithSoftReset => {
                            self.reload_config(domid);
                            self.restart(RestartKind::SoftReset(domid))?;
                        }
                    }
                }
                Event::Death { .. } => {
                    info!(sl!(), "domain is gone"; "domid" => domid.0);
                    return Ok(0);
                }
                Event::Other { kind, .. } => {
                    warn!(sl!(), "ignoring unhandled event type {}", kind; "domid" => domid.0);
                }
            }
        }
    }

    fn current_domid(&self) -> Result<DomainId> {
        self.record
            .domid
            .ok_or_else(|| anyhow!("no domain under management"))
    }

    fn spawn_helper(
        &mut self,
        role: ChildRole,
        mut command: Vec<String>,
        domid: DomainId,
    ) -> Result<()> {
        // One helper per role; reap a leftover from a previous boot.
        if self.supervisor.child(role).is_some() {
            self.supervisor.report(role);
        }

        command.push(domid.to_string());
        let wait_for_server = matches!(role, ChildRole::VncViewer);
        self.supervisor.spawn(role, move || {
            if wait_for_server {
                // Give the VNC server a moment to start listening.
                thread::sleep(Duration::from_secs(1));
            }
            crate::supervisor::exec_command(&command)
        })?;
        Ok(())
    }

    /// Picks up configuration changes made while the domain was running:
    /// an operator-stored config wins, then the live one, else the
    /// original stays. The domain name always stays ours.
    fn reload_config(&mut self, domid: DomainId) {
        let stored = match self.platform.stored_domain_config(domid) {
            Ok(Some(bytes)) => match DomainConfig::from_json(&bytes) {
                Ok(config) => {
                    if let Err(e) = self.platform.clear_stored_domain_config(domid) {
                        warn!(sl!(), "failed to clear stored config: {}", e);
                    }
                    Some(config)
                }
                Err(e) => {
                    warn!(sl!(), "corrupt stored config, ignoring it: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(sl!(), "failed to read stored config: {}", e);
                None
            }
        };

        let reloaded = stored.or_else(|| match self.platform.retrieve_domain_config(domid) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(sl!(), "failed to retrieve domain config, reusing the original: {}", e);
                None
            }
        });

        if let Some(mut config) = reloaded {
            config.name = self.record.name.clone();
            self.record.config = config;
        }
    }

    /// Brings up the replacement after a restart decision. Events queued
    /// against the dead incarnation are drained first so the monitor does
    /// not act on them against the new domain id.
    fn restart(&mut self, kind: RestartKind) -> Result<()> {
        loop {
            match self.platform.poll_event() {
                Ok(Some(event)) => {
                    info!(sl!(), "discarding event for dead domain {}", event.domid().0);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(sl!(), "failed to drain pending events: {}", e);
                    break;
                }
            }
        }

        // Console and VNC attach are a first-boot convenience only, and a
        // replacement domain always starts running.
        self.opts.console_command = None;
        self.opts.vnc_command = None;
        self.opts.paused = false;

        thread::sleep(RESTART_SETTLE_DELAY);

        let mode = match kind {
            RestartKind::Create => BringUpMode::Create,
            RestartKind::SoftReset(domid) => BringUpMode::SoftReset { domid },
        };
        self.bring_up(mode)?;
        self.after_bring_up()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use platform::fake::FakePlatform;
    use platform::{OnShutdown, ShutdownReason};
    use tempfile::tempdir;

    fn test_opts(dir: &tempfile::TempDir) -> ControllerOptions {
        ControllerOptions {
            lock_path: dir.path().join("creation-lock"),
            dump_dir: dir.path().join("dump"),
            autoballoon: false,
            monitor: false,
            ..Default::default()
        }
    }

    fn test_config(name: &str) -> DomainConfig {
        DomainConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_unpause() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut ctl = LifecycleController::new(&fake, test_config("guest"), test_opts(&dir));

        let code = ctl.run(BringUpMode::Create).unwrap();
        assert_eq!(code, 0);

        let (domid, domain) = fake.find_domain("guest").unwrap();
        assert!(!domain.paused);
        assert_eq!(ctl.record().domid, Some(domid));
    }

    #[test]
    fn test_create_paused() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.paused = true;
        let mut ctl = LifecycleController::new(&fake, test_config("guest"), opts);

        ctl.run(BringUpMode::Create).unwrap();

        let (_, domain) = fake.find_domain("guest").unwrap();
        assert!(domain.paused);
    }

    #[test]
    fn test_create_fails_when_memory_cannot_be_freed() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        fake.set_memory(1000, 100);
        fake.fail_call("set_memory_target");

        let mut opts = test_opts(&dir);
        opts.autoballoon = true;
        let mut ctl = LifecycleController::new(&fake, test_config("guest"), opts);

        let err = ctl.run(BringUpMode::Create).unwrap_err();
        assert!(err.to_string().contains("failed to free enough memory"));
        assert_eq!(fake.num_domains(), 0);
    }

    #[test]
    fn test_shutdown_poweroff_destroys_and_exits() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.monitor = true;
        let mut ctl = LifecycleController::new(&fake, test_config("guest"), opts);

        let domid = ctl.bring_up(BringUpMode::Create).unwrap();
        fake.push_event(Event::Shutdown {
            domid,
            reason: ShutdownReason::Poweroff,
        });

        let code = ctl.monitor().unwrap();
        assert_eq!(code, 0);
        assert_eq!(fake.num_domains(), 0);
    }

    #[test]
    fn test_reboot_restarts_under_new_domid() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.monitor = true;
        let mut config = test_config("guest");
        config.on_reboot = OnShutdown::Restart;
        let mut ctl = LifecycleController::new(&fake, config, opts);

        let first = ctl.bring_up(BringUpMode::Create).unwrap();
        fake.push_event(Event::Shutdown {
            domid: first,
            reason: ShutdownReason::Reboot,
        });

        // A poweroff against the replacement terminates the loop; the
        // fake hands the next domid out sequentially.
        let second = DomainId(first.0 + 1);
        fake.push_event(Event::Shutdown {
            domid: second,
            reason: ShutdownReason::Poweroff,
        });

        let code = ctl.monitor().unwrap();
        assert_eq!(code, 0);
        assert_eq!(ctl.record().domid, Some(second));
        assert_eq!(fake.num_domains(), 0);
    }

    #[test]
    fn test_crash_with_rename_preserves_old_domain() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.monitor = true;
        let mut config = test_config("guest");
        config.on_crash = OnShutdown::RestartRename;
        let mut ctl = LifecycleController::new(&fake, config, opts);

        let first = ctl.bring_up(BringUpMode::Create).unwrap();
        fake.push_event(Event::Shutdown {
            domid: first,
            reason: ShutdownReason::Crash,
        });
        fake.push_event(Event::Death {
            domid: DomainId(first.0 + 1),
        });

        ctl.monitor().unwrap();

        // Old incarnation kept under a timestamped name, replacement
        // running under the original one.
        let old = fake.domain(first).unwrap();
        assert!(old.name.starts_with("guest-"), "got {:?}", old.name);
        let (second, replacement) = fake.find_domain("guest").unwrap();
        assert_ne!(second, first);
        assert!(!replacement.paused);
    }

    #[test]
    fn test_crash_coredump_restart_dumps_first() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.monitor = true;
        let mut config = test_config("guest");
        config.on_crash = OnShutdown::CoredumpRestart;
        let mut ctl = LifecycleController::new(&fake, config, opts);

        let first = ctl.bring_up(BringUpMode::Create).unwrap();
        fake.push_event(Event::Shutdown {
            domid: first,
            reason: ShutdownReason::Crash,
        });
        fake.push_event(Event::Death {
            domid: DomainId(first.0 + 1),
        });

        ctl.monitor().unwrap();

        let calls = fake.calls();
        let dump_pos = calls.iter().position(|c| c.starts_with("core_dump")).unwrap();
        let destroy_pos = calls.iter().position(|c| c.starts_with("destroy")).unwrap();
        assert!(dump_pos < destroy_pos);
    }

    #[test]
    fn test_soft_reset_keeps_domid() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.monitor = true;
        let mut config = test_config("guest");
        config.on_reboot = OnShutdown::SoftReset;
        let mut ctl = LifecycleController::new(&fake, config, opts);

        let domid = ctl.bring_up(BringUpMode::Create).unwrap();
        fake.push_event(Event::Shutdown {
            domid,
            reason: ShutdownReason::Reboot,
        });
        fake.push_event(Event::Death { domid });

        ctl.monitor().unwrap();
        assert_eq!(ctl.record().domid, Some(domid));
        assert!(fake.calls().iter().any(|c| c.starts_with("soft_reset")));
    }

    #[test]
    fn test_stored_config_wins_on_restart() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.monitor = true;
        let mut config = test_config("guest");
        config.on_reboot = OnShutdown::Restart;
        let mut ctl = LifecycleController::new(&fake, config, opts);

        let first = ctl.bring_up(BringUpMode::Create).unwrap();

        // An operator stored an updated config under a different name;
        // the name must not leak into the replacement.
        let mut updated = test_config("imposter");
        updated.vcpus = 8;
        updated.on_reboot = OnShutdown::Restart;
        fake.set_stored_config(first, updated.to_json_bytes().unwrap());

        fake.push_event(Event::Shutdown {
            domid: first,
            reason: ShutdownReason::Reboot,
        });
        fake.push_event(Event::Death {
            domid: DomainId(first.0 + 1),
        });

        ctl.monitor().unwrap();

        assert_eq!(ctl.record().config.vcpus, 8);
        assert_eq!(ctl.record().config.name, "guest");
        let (_, replacement) = fake.find_domain("guest").unwrap();
        assert_eq!(replacement.config.unwrap().vcpus, 8);
        // Consumed on use; the next restart goes back to the live config.
        assert!(fake
            .calls()
            .iter()
            .any(|c| c.starts_with("clear_stored_config")));
    }

    #[test]
    fn test_events_for_other_domains_are_ignored() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.monitor = true;
        let mut ctl = LifecycleController::new(&fake, test_config("guest"), opts);

        let domid = ctl.bring_up(BringUpMode::Create).unwrap();
        fake.push_event(Event::Shutdown {
            domid: DomainId(999),
            reason: ShutdownReason::Poweroff,
        });
        fake.push_event(Event::Death { domid });

        let code = ctl.monitor().unwrap();
        assert_eq!(code, 0);
        // The stranger's shutdown caused no destroy.
        assert!(fake.domain(domid).is_some());
    }

    #[test]
    fn test_stale_events_drained_before_restart() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.monitor = true;
        let mut config = test_config("guest");
        config.on_poweroff = OnShutdown::Restart;
        let mut ctl = LifecycleController::new(&fake, config, opts);

        let first = ctl.bring_up(BringUpMode::Create).unwrap();
        fake.push_event(Event::Shutdown {
            domid: first,
            reason: ShutdownReason::Poweroff,
        });
        // Stale event from the dying incarnation, queued behind the
        // decision-making one.
        fake.push_stale_event(Event::Death { domid: first });
        fake.push_event(Event::Death {
            domid: DomainId(first.0 + 1),
        });

        let code = ctl.monitor().unwrap();
        assert_eq!(code, 0);
        assert!(fake
            .calls()
            .iter()
            .any(|c| c.starts_with("poll_event drained")));
    }

    #[test]
    fn test_suspend_event_leaves_domain_alone() {
        let dir = tempdir().unwrap();
        let fake = FakePlatform::new();
        let mut opts = test_opts(&dir);
        opts.monitor = true;
        let mut ctl = LifecycleController::new(&fake, test_config("guest"), opts);

        let domid = ctl.bring_up(BringUpMode::Create).unwrap();
        fake.push_event(Event::Shutdown {
            domid,
            reason: ShutdownReason::Suspend,
        });
        fake.push_event(Event::Death { domid });

        ctl.monitor().unwrap();
        assert!(!fake.calls().iter().any(|c| c.starts_with("destroy")));
    }
}
