// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Free-memory reclamation ahead of domain bring-up.

use platform::{DomainConfig, DomainId, Platform};
use slog::{info, o, warn};

macro_rules! sl {
    () => {
        slog_scope::logger().new(o!("subsystem" => "reclaim"))
    };
}

const RECLAIM_RETRIES: u32 = 3;
const RECLAIM_WAIT_SECS: u32 = 10;

/// Ensures the host has enough free memory for the pending domain build.
///
/// Returns false if memory can't be freed, but also if any platform call
/// errors out. Returns true when there is already, or we manage to free,
/// enough memory, and unconditionally when autoballoon is disabled. The
/// result is advisory: callers treat false as fatal for this creation
/// attempt, with no partial state left behind.
pub fn ensure_capacity(platform: &dyn Platform, config: &DomainConfig, autoballoon: bool) -> bool {
    if !autoballoon {
        return true;
    }

    let need_kb = match platform.need_memory_kb(config) {
        Ok(v) => v,
        Err(e) => {
            warn!(sl!(), "cannot compute domain memory need: {}", e);
            return false;
        }
    };

    for _ in 0..RECLAIM_RETRIES {
        let free_kb = match platform.free_memory_kb() {
            Ok(v) => v,
            Err(e) => {
                warn!(sl!(), "cannot query free memory: {}", e);
                return false;
            }
        };

        if free_kb >= need_kb {
            return true;
        }

        info!(
            sl!(),
            "short of memory for domain {}: need {} KiB, free {} KiB; ballooning down control domain",
            config.name,
            need_kb,
            free_kb
        );

        // Shrink the control domain by the shortfall (relative target).
        let delta = free_kb as i64 - need_kb as i64;
        if let Err(e) = platform.set_memory_target(DomainId::CONTROL, delta, true) {
            warn!(sl!(), "cannot set control domain memory target: {}", e);
            return false;
        }

        // Wait until the control domain reaches its target, as long as we
        // are making progress.
        if let Err(e) = platform.wait_memory_target(DomainId::CONTROL, RECLAIM_WAIT_SECS) {
            warn!(sl!(), "control domain did not reach memory target: {}", e);
            return false;
        }
    }

    false
}
