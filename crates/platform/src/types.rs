// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;

use serde::{Deserialize, Serialize};

/// Platform-assigned identifier of one managed domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

impl DomainId {
    /// The privileged control domain, the designated reclaimable memory
    /// consumer on the host.
    pub const CONTROL: DomainId = DomainId(0);
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reason reported by the platform with a domain-shutdown event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ShutdownReason {
    Poweroff,
    Reboot,
    Suspend,
    Crash,
    Watchdog,
    SoftReset,
    /// A reason code this build does not know about.
    Unknown(i32),
}

/// Configured action for one shutdown reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OnShutdown {
    Destroy,
    Restart,
    RestartRename,
    Preserve,
    CoredumpDestroy,
    CoredumpRestart,
    SoftReset,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub path: String,
    pub removable: bool,
}

/// The orchestrator's parsed view of a domain configuration.
///
/// Carried across save/restore and migration as the JSON config sub-field
/// of the save-file optional data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub name: String,
    pub uuid: Option<String>,
    pub memory_kb: u64,
    pub vcpus: u32,
    pub on_poweroff: OnShutdown,
    pub on_reboot: OnShutdown,
    pub on_crash: OnShutdown,
    pub on_watchdog: OnShutdown,
    pub on_soft_reset: OnShutdown,
    pub disks: Vec<DiskConfig>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        DomainConfig {
            name: String::new(),
            uuid: None,
            memory_kb: 0,
            vcpus: 1,
            on_poweroff: OnShutdown::Destroy,
            on_reboot: OnShutdown::Restart,
            on_crash: OnShutdown::Destroy,
            on_watchdog: OnShutdown::Destroy,
            on_soft_reset: OnShutdown::SoftReset,
            disks: Vec::new(),
        }
    }
}

impl DomainConfig {
    /// Parses the JSON config dialect. A trailing NUL (the save-file
    /// sub-field is a C string on the wire) is tolerated.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let end = bytes
            .iter()
            .rposition(|&b| b != 0)
            .map(|p| p + 1)
            .unwrap_or(0);
        serde_json::from_slice(&bytes[..end])
    }

    /// Serializes to the JSON config dialect, NUL-terminated as stored in
    /// the save-file optional data.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(0);
        Ok(bytes)
    }
}

/// One platform-emitted lifecycle event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Shutdown {
        domid: DomainId,
        reason: ShutdownReason,
    },
    Death {
        domid: DomainId,
    },
    /// Event types this orchestrator does not handle; logged and ignored.
    Other {
        domid: DomainId,
        kind: String,
    },
}

impl Event {
    pub fn domid(&self) -> DomainId {
        match self {
            Event::Shutdown { domid, .. } => *domid,
            Event::Death { domid } => *domid,
            Event::Other { domid, .. } => *domid,
        }
    }
}
