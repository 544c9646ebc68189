// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Domain lifecycle orchestration: creation, restart policy, save and
//! restore, and live migration between hosts.
//!
//! The crate is deliberately single-threaded and blocking. One controller
//! process babysits one domain; concurrency across domains comes from
//! running more processes, serialized where needed by the host-wide
//! creation lock.

pub mod controller;
pub mod lock;
pub mod migration;
pub mod reclaim;
pub mod restart;
pub mod save;
pub mod supervisor;

pub use controller::{
    BringUpMode, ControllerOptions, DomainRecord, LifecycleController, DEFAULT_DUMP_DIR,
    DEFAULT_LOCK_PATH,
};
pub use lock::InstanceLock;
pub use migration::{
    migrate_domain, receive, send, MigrationError, ReceiveOptions, ReceiveOutcome, Reception,
    SendOptions,
};
pub use restart::RestartDecision;
pub use save::{restore_domain_from_file, save_domain, AfterSave};
pub use supervisor::{ChildRole, ChildSupervisor, DaemonizeOutcome, ExitOutcome};
