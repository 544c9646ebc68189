// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The narrow capability API through which the orchestrator reaches the
//! virtualization platform (device model, scheduler, memory manager).
//!
//! Everything behind [`Platform`] is an external collaborator: the
//! orchestrator passes state streams through as opaque bytes and never
//! reinterprets platform error codes beyond what its callers need to
//! branch on.

use std::io::{Read, Write};
use std::path::Path;

pub mod fake;
mod types;

pub use types::{DiskConfig, DomainConfig, DomainId, Event, OnShutdown, ShutdownReason};

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("operation not implemented by platform")]
    NotImplemented,

    #[error("domain not found")]
    NotFound,

    /// A failed platform call, propagated verbatim with the originating
    /// call's numeric code attached for diagnostics.
    #[error("platform call {call} failed (rc={rc})")]
    Call { call: &'static str, rc: i32 },

    #[error("platform i/o error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Parameters for restoring a domain from a serialized state stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct RestoreParams {
    /// State stream version, from the save-file mandatory flags.
    pub stream_version: u32,
    /// The stream is a continuous-checkpoint replication feed rather than
    /// a one-shot save or planned relocation.
    pub checkpointed: bool,
}

/// Blocking capability API of the virtualization platform.
///
/// Domain bring-up calls (`create_domain`, `restore_domain`, `soft_reset`)
/// leave the new domain paused; unpausing is the caller's decision. They
/// are the only non-idempotent calls here and must be serialized against
/// the host-wide creation lock by the caller.
///
/// Implementations are shared across the threads of a migration pair, so
/// the trait requires `Sync`.
pub trait Platform: Sync {
    fn create_domain(&self, config: &DomainConfig) -> Result<DomainId>;

    /// Creates a domain from a state stream, consuming exactly the
    /// platform's own save format from `stream`.
    fn restore_domain(
        &self,
        config: &DomainConfig,
        stream: &mut dyn Read,
        params: &RestoreParams,
    ) -> Result<DomainId>;

    /// Re-enters bring-up against an existing, still-running domain.
    fn soft_reset(&self, config: &DomainConfig, domid: DomainId) -> Result<DomainId>;

    /// Suspends the domain, streaming its memory/device state to `stream`.
    /// With `live` the guest keeps executing until the final copy phase;
    /// this is the long-running part of save and migration.
    fn suspend_domain(&self, domid: DomainId, stream: &mut dyn Write, live: bool) -> Result<()>;

    fn resume_domain(&self, domid: DomainId) -> Result<()>;
    fn pause_domain(&self, domid: DomainId) -> Result<()>;
    fn unpause_domain(&self, domid: DomainId) -> Result<()>;
    fn destroy_domain(&self, domid: DomainId) -> Result<()>;

    fn rename_domain(&self, domid: DomainId, old_name: &str, new_name: &str) -> Result<()>;

    /// Keeps the domain alive under `name_suffix` appended to its current
    /// name, assigning it a fresh identity, so that a replacement can be
    /// created under the original name.
    fn preserve_domain(
        &self,
        domid: DomainId,
        config: &DomainConfig,
        name_suffix: &str,
        new_uuid: [u8; 16],
    ) -> Result<()>;

    fn core_dump_domain(&self, domid: DomainId, path: &Path) -> Result<()>;

    /// Blocks until the next lifecycle event is available.
    fn wait_event(&self) -> Result<Event>;

    /// Returns a pending event without blocking, if there is one.
    fn poll_event(&self) -> Result<Option<Event>>;

    /// Memory the pending domain build needs, in KiB.
    fn need_memory_kb(&self, config: &DomainConfig) -> Result<u64>;

    /// Currently free (unclaimed) host memory, in KiB.
    fn free_memory_kb(&self) -> Result<u64>;

    /// Sets a domain's memory target; with `relative` the target is a
    /// signed delta against the current allocation.
    fn set_memory_target(&self, domid: DomainId, target_kb: i64, relative: bool) -> Result<()>;

    /// Waits (bounded) for a domain to reach its memory target.
    fn wait_memory_target(&self, domid: DomainId, wait_secs: u32) -> Result<()>;

    /// Live-introspects the domain's current configuration.
    fn retrieve_domain_config(&self, domid: DomainId) -> Result<DomainConfig>;

    /// Reads back a configuration blob previously stored against the
    /// domain (for example by a config-update command). `Ok(None)` when
    /// nothing is stored.
    fn stored_domain_config(&self, domid: DomainId) -> Result<Option<Vec<u8>>>;

    fn clear_stored_domain_config(&self, domid: DomainId) -> Result<()>;
}
