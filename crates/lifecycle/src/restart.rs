// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Mapping of shutdown events to restart decisions.

use platform::{DomainConfig, OnShutdown, ShutdownReason};

/// Outcome of evaluating one shutdown event against the configured
/// per-reason policy. Pure data; the controller performs the side effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartDecision {
    /// Leave the monitor loop; `destroy` says whether the domain is torn
    /// down first (a preserved domain stays).
    NoRestart { destroy: bool },
    /// Destroy the domain and bring up a replacement under the same name.
    /// Invalidates the current identifier.
    RestartInPlace,
    /// Keep the old domain under a timestamped name and bring up a
    /// replacement under the original one. Invalidates the identifier.
    RestartWithRename,
    /// Re-enter bring-up in soft-reset mode against the same running
    /// domain. The identifier stays valid.
    RestartWithSoftReset,
}

/// The configured action for a shutdown reason. Unknown reason codes map
/// to destroy: a domain whose fate we cannot interpret is never silently
/// preserved.
pub fn action_for(reason: ShutdownReason, config: &DomainConfig) -> Option<OnShutdown> {
    match reason {
        ShutdownReason::Poweroff => Some(config.on_poweroff),
        ShutdownReason::Reboot => Some(config.on_reboot),
        ShutdownReason::Crash => Some(config.on_crash),
        ShutdownReason::Watchdog => Some(config.on_watchdog),
        ShutdownReason::SoftReset => Some(config.on_soft_reset),
        // The domain suspended itself; no action to take.
        ShutdownReason::Suspend => None,
        ShutdownReason::Unknown(_) => Some(OnShutdown::Destroy),
    }
}

/// Whether the action asks for a best-effort core dump before the
/// destroy/restart it collapses to.
pub fn wants_core_dump(action: OnShutdown) -> bool {
    matches!(
        action,
        OnShutdown::CoredumpDestroy | OnShutdown::CoredumpRestart
    )
}

/// Evaluates a shutdown event. Pure function of the reason and the
/// configured policy.
pub fn handle_shutdown_event(reason: ShutdownReason, config: &DomainConfig) -> RestartDecision {
    let action = match action_for(reason, config) {
        Some(action) => action,
        None => return RestartDecision::NoRestart { destroy: false },
    };

    match action {
        OnShutdown::Destroy | OnShutdown::CoredumpDestroy => {
            RestartDecision::NoRestart { destroy: true }
        }
        OnShutdown::Restart | OnShutdown::CoredumpRestart => RestartDecision::RestartInPlace,
        OnShutdown::RestartRename => RestartDecision::RestartWithRename,
        OnShutdown::Preserve => RestartDecision::NoRestart { destroy: false },
        OnShutdown::SoftReset => RestartDecision::RestartWithSoftReset,
    }
}
