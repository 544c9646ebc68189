// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Live migration handshake, both ends.
//!
//! The two hosts talk over an operator-supplied transport (usually ssh)
//! carrying fixed ASCII messages around the binary domain state. The
//! ordering guarantees exactly-one-running-copy at every step except the
//! final report: once the sender has cleared the receiver to unpause,
//! any failure leaves the domain state undefined and is reported as such
//! rather than papered over with a guess.

use std::io::{Read, Write};

use scopeguard::ScopeGuard;
use slog::{info, o, warn};

use platform::{DomainConfig, DomainId, Platform, PlatformError};

use crate::controller::{BringUpMode, ControllerOptions, LifecycleController};
use crate::supervisor::{self, ChildRole, ChildSupervisor};

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "migration"))
    };
}

/// First bytes on the wire, receiver to sender. Also serves as a version
/// check: an incompatible peer fails the handshake before any state moves.
pub const MIGRATE_RECEIVER_BANNER: &[u8] =
    b"domon migration receiver ready, send binary domain data.\n";

/// Receiver to sender: the domain state arrived intact.
pub const MIGRATE_RECEIVER_READY: &[u8] = b"domain received, ready to unpause\0";

/// Sender to receiver: the point of no return.
pub const MIGRATE_PERMISSION_TO_GO: &[u8] = b"domain is yours, you are cleared to unpause\0";

/// Receiver to sender, followed by one status byte.
pub const MIGRATE_REPORT: &[u8] = b"my copy unpause results are as follows\0";

/// Receiver to sender after a failed unpause: the receiver's copy is
/// destroyed and the sender may safely revive its own.
pub const MIGRATE_GO_BACK: &[u8] = b"sorry, take your domain back\0";

/// Name suffix for the sender's suspended copy once the receiver has been
/// cleared to run, freeing the original name host-wide.
pub const MIGRATED_AWAY_SUFFIX: &str = "--migratedaway";

/// Name suffix for the receiver's copy until the sender clears it to run.
pub const INCOMING_SUFFIX: &str = "--incoming";

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("protocol error reading {what}: unexpected data from peer")]
    ProtocolMismatch { what: &'static str },

    #[error("i/o error during {what}")]
    Io {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    SaveFile(#[from] savefile::Error),

    #[error("could not parse transferred domain configuration")]
    Config(#[from] serde_json::Error),

    #[error("remote failed to activate the domain (status {0})")]
    TargetFailed(u8),

    /// Failure after the point of no return. Neither end may assume it
    /// owns the domain; the operator has to check both.
    #[error("migration failed during final handshake, domain state is undefined")]
    UndefinedState(#[source] Box<MigrationError>),

    #[error("stream carries no domain configuration")]
    NoConfig,

    #[error("domain configuration is not in a format this version understands")]
    LegacyConfig,

    #[error("failed to spawn migration transport: {0:#}")]
    Transport(anyhow::Error),

    #[error("failed to bring up received domain: {0:#}")]
    BringUp(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MigrationError>;

fn undefined(e: MigrationError) -> MigrationError {
    MigrationError::UndefinedState(Box::new(e))
}

fn read_fixed_message(rx: &mut dyn Read, expected: &[u8], what: &'static str) -> Result<()> {
    let mut buf = vec![0u8; expected.len()];
    rx.read_exact(&mut buf)
        .map_err(|source| MigrationError::Io { what, source })?;
    if buf != expected {
        return Err(MigrationError::ProtocolMismatch { what });
    }
    Ok(())
}

fn write_message(tx: &mut dyn Write, message: &[u8], what: &'static str) -> Result<()> {
    tx.write_all(message)
        .and_then(|_| tx.flush())
        .map_err(|source| MigrationError::Io { what, source })
}

pub struct SendOptions {
    /// Keep the guest executing through the copy phase.
    pub live: bool,
    /// Configuration to hand the receiver instead of the live one.
    pub config_override: Option<Vec<u8>>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            live: true,
            config_override: None,
        }
    }
}

/// Sender side of the handshake. On success the local copy is destroyed;
/// the domain runs on at the receiver. On failure before the point of no
/// return the local copy is resumed and still owns its name.
pub fn send(
    platform: &dyn Platform,
    domid: DomainId,
    name: &str,
    tx: &mut dyn Write,
    rx: &mut dyn Read,
    opts: &SendOptions,
) -> Result<()> {
    let config = match &opts.config_override {
        Some(bytes) => bytes.clone(),
        None => platform
            .retrieve_domain_config(domid)?
            .to_json_bytes()?,
    };

    read_fixed_message(rx, MIGRATE_RECEIVER_BANNER, "receiver banner")?;

    {
        let mut sink = &mut *tx;
        savefile::write_save_header(&mut sink, &config, true)?;
    }

    info!(sl!(), "sending domain state"; "domid" => domid.0, "live" => opts.live);
    if let Err(e) = platform.suspend_domain(domid, tx, opts.live) {
        resume_after_failure(platform, domid);
        return Err(e.into());
    }
    if let Err(source) = tx.flush() {
        resume_after_failure(platform, domid);
        return Err(MigrationError::Io {
            what: "state stream flush",
            source,
        });
    }

    if let Err(e) = read_fixed_message(rx, MIGRATE_RECEIVER_READY, "ready message") {
        resume_after_failure(platform, domid);
        return Err(e);
    }

    // Free the name before clearing the receiver to run, so no window
    // exists where both hosts answer to it.
    let away_name = format!("{}{}", name, MIGRATED_AWAY_SUFFIX);
    if let Err(e) = platform.rename_domain(domid, name, &away_name) {
        resume_after_failure(platform, domid);
        return Err(e.into());
    }

    // Point of no return. The receiver may unpause at any moment now and
    // every failure from here on leaves ownership undetermined.
    write_message(tx, MIGRATE_PERMISSION_TO_GO, "go message").map_err(undefined)?;

    read_fixed_message(rx, MIGRATE_REPORT, "migration report").map_err(undefined)?;
    let mut status = [0u8; 1];
    rx.read_exact(&mut status).map_err(|source| {
        undefined(MigrationError::Io {
            what: "migration report status",
            source,
        })
    })?;

    if status[0] != 0 {
        // The receiver failed to activate its copy. Take the domain back
        // only on its explicit, byte-exact confirmation that the copy is
        // destroyed; anything else means ownership stays unresolved.
        read_fixed_message(rx, MIGRATE_GO_BACK, "go-back message").map_err(undefined)?;
        platform
            .rename_domain(domid, &away_name, name)
            .map_err(|e| undefined(e.into()))?;
        platform
            .resume_domain(domid)
            .map_err(|e| undefined(e.into()))?;
        warn!(sl!(), "migration refused by remote, domain resumed here"; "domid" => domid.0);
        return Err(MigrationError::TargetFailed(status[0]));
    }

    info!(sl!(), "migration complete, tearing down local copy"; "domid" => domid.0);
    if let Err(e) = platform.destroy_domain(domid) {
        warn!(sl!(), "failed to destroy migrated-away domain {}: {}", domid.0, e);
    }
    Ok(())
}

fn resume_after_failure(platform: &dyn Platform, domid: DomainId) {
    if let Err(e) = platform.resume_domain(domid) {
        warn!(sl!(), "failed to resume domain {} after failed migration: {}", domid.0, e);
    }
}

pub struct ReceiveOptions {
    /// The stream is a continuous-checkpoint feed. The ready/go exchange
    /// is skipped: by the time the stream ends the sender is gone and the
    /// copy here activates unconditionally.
    pub checkpointed: bool,
    /// Leave the domain paused after a successful handshake.
    pub pause_after_migration: bool,
    pub controller: ControllerOptions,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Completed,
    CheckpointFailover,
}

/// A successfully received domain, ready to be monitored.
pub struct Reception<'p> {
    pub controller: LifecycleController<'p>,
    pub outcome: ReceiveOutcome,
}

/// Receiver side of the handshake. On success the domain runs (or sits
/// paused, if so requested) under its original name and the returned
/// controller monitors it. On failure before the report the local copy is
/// destroyed; the sender still owns the domain.
pub fn receive<'p>(
    platform: &'p dyn Platform,
    tx: &mut dyn Write,
    rx: &mut dyn Read,
    opts: ReceiveOptions,
) -> Result<Reception<'p>> {
    let ReceiveOptions {
        checkpointed,
        pause_after_migration,
        controller: controller_opts,
    } = opts;

    supervisor::ignore_sigpipe();

    write_message(tx, MIGRATE_RECEIVER_BANNER, "receiver banner")?;

    let (header, config_bytes) = {
        let mut src = &mut *rx;
        savefile::read_save_header(&mut src)?
    };
    let config_bytes = config_bytes.ok_or(MigrationError::NoConfig)?;
    if !header.config_in_json() {
        return Err(MigrationError::LegacyConfig);
    }
    let mut config = DomainConfig::from_json(&config_bytes)?;

    // The copy stays under a suffixed name until the sender signs off,
    // in case the original still answers to its own.
    let original_name = config.name.clone();
    let incoming_name = format!("{}{}", original_name, INCOMING_SUFFIX);
    config.name = incoming_name.clone();

    info!(sl!(), "receiving domain"; "name" => &original_name);
    let mut controller = LifecycleController::new(platform, config, controller_opts);
    let domid = controller
        .bring_up(BringUpMode::Restore {
            stream: rx,
            stream_version: header.stream_version(),
            checkpointed,
        })
        .map_err(MigrationError::BringUp)?;

    // Until the handshake commits, any exit tears our copy down.
    let teardown = scopeguard::guard((), |_| {
        if let Err(e) = platform.destroy_domain(domid) {
            warn!(sl!(), "failed to destroy received domain {}: {}", domid.0, e);
        }
    });

    if checkpointed {
        // Failover: the sender is dead, this copy is the domain now.
        platform.rename_domain(domid, &incoming_name, &original_name)?;
        platform.unpause_domain(domid)?;
        ScopeGuard::into_inner(teardown);
        adopt_name(&mut controller, &original_name);
        info!(sl!(), "checkpoint failover complete"; "name" => &original_name);
        return Ok(Reception {
            controller,
            outcome: ReceiveOutcome::CheckpointFailover,
        });
    }

    write_message(tx, MIGRATE_RECEIVER_READY, "ready message")?;
    read_fixed_message(rx, MIGRATE_PERMISSION_TO_GO, "go message")?;

    let activation = platform
        .rename_domain(domid, &incoming_name, &original_name)
        .and_then(|_| {
            if pause_after_migration {
                Ok(())
            } else {
                platform.unpause_domain(domid)
            }
        });

    match activation {
        Ok(()) => {
            // Committed; from here the domain is ours even if the report
            // never reaches the sender.
            ScopeGuard::into_inner(teardown);
            tx.write_all(MIGRATE_REPORT)
                .and_then(|_| tx.write_all(&[0u8]))
                .and_then(|_| tx.flush())
                .map_err(|source| MigrationError::Io {
                    what: "migration report",
                    source,
                })?;
            adopt_name(&mut controller, &original_name);
            info!(sl!(), "migration received"; "name" => &original_name, "domid" => domid.0);
            Ok(Reception {
                controller,
                outcome: ReceiveOutcome::Completed,
            })
        }
        Err(e) => {
            warn!(sl!(), "failed to activate received domain: {}", e);
            // Destroy before inviting the sender to take the domain back.
            ScopeGuard::into_inner(teardown);
            if let Err(e) = platform.destroy_domain(domid) {
                warn!(sl!(), "failed to destroy received domain {}: {}", domid.0, e);
            }
            tx.write_all(MIGRATE_REPORT)
                .and_then(|_| tx.write_all(&[1u8]))
                .and_then(|_| tx.flush())
                .map_err(|source| MigrationError::Io {
                    what: "migration report",
                    source,
                })?;
            write_message(tx, MIGRATE_GO_BACK, "go-back message")?;
            Err(e.into())
        }
    }
}

fn adopt_name(controller: &mut LifecycleController<'_>, name: &str) {
    let record = controller.record_mut();
    record.name = name.to_string();
    record.config.name = name.to_string();
}

/// Drives a whole outgoing migration: spawns the transport rune, runs the
/// sender handshake over its pipes, and reaps the transport afterwards.
pub fn migrate_domain(
    platform: &dyn Platform,
    domid: DomainId,
    name: &str,
    rune: &str,
    opts: &SendOptions,
) -> Result<()> {
    let mut sup = ChildSupervisor::new();
    let (mut tx, mut rx) = sup
        .spawn_transport(rune)
        .map_err(MigrationError::Transport)?;

    let result = send(platform, domid, name, &mut tx, &mut rx, opts);

    drop(tx);
    drop(rx);
    sup.report_bounded(ChildRole::MigrationTransport);

    if let Err(MigrationError::UndefinedState(_)) = &result {
        warn!(
            sl!(),
            "migration failed during the final handshake and the domain state is \
             now undefined. Check both hosts for running instances before renaming \
             and restarting at most one of them; two live instances of one domain \
             will corrupt its storage."
        );
    }
    result
}
