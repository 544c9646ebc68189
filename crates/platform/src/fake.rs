// Copyright (c) 2025 The domon Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Scripted in-memory platform used by unit and integration tests.
//!
//! State streams are framed as a 4-byte little-endian length followed by
//! an opaque payload, so a suspend on one fake can be ingested by a
//! restore on another across a real pipe.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::{
    DomainConfig, DomainId, Event, Platform, PlatformError, RestoreParams, Result,
};

/// Interleaving log shared between the fakes of a multi-party test.
pub type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Clone, Debug, Default)]
pub struct FakeDomain {
    pub name: String,
    pub paused: bool,
    pub config: Option<DomainConfig>,
    pub stored_config: Option<Vec<u8>>,
}

#[derive(Default)]
struct State {
    next_domid: u32,
    domains: HashMap<u32, FakeDomain>,
    events: VecDeque<Event>,
    stale_events: VecDeque<Event>,
    need_memory_kb: u64,
    free_memory_kb: u64,
    free_memory_script: VecDeque<u64>,
    balloon_requests: Vec<(DomainId, i64, bool)>,
    state_payload: Vec<u8>,
    ingested_payload: Option<Vec<u8>>,
    restore_params: Option<RestoreParams>,
    fail: HashSet<&'static str>,
    calls: Vec<String>,
}

pub struct FakePlatform {
    label: String,
    journal: Option<Journal>,
    state: Mutex<State>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        FakePlatform {
            label: String::new(),
            journal: None,
            state: Mutex::new(State {
                next_domid: 1,
                state_payload: b"fake domain state".to_vec(),
                ..Default::default()
            }),
        }
    }

    /// A fake whose journal entries are prefixed with `label`.
    pub fn named(label: &str) -> Self {
        let mut fake = Self::new();
        fake.label = label.to_string();
        fake
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    fn record(&self, st: &mut State, entry: String) {
        if let Some(journal) = &self.journal {
            let tagged = if self.label.is_empty() {
                entry.clone()
            } else {
                format!("{}:{}", self.label, entry)
            };
            journal.lock().unwrap().push(tagged);
        }
        st.calls.push(entry);
    }

    fn check_fail(&self, st: &State, call: &'static str) -> Result<()> {
        if st.fail.contains(call) {
            return Err(PlatformError::Call { call, rc: -3 });
        }
        Ok(())
    }

    // --- test scripting -------------------------------------------------

    pub fn add_domain(&self, name: &str, paused: bool) -> DomainId {
        let mut st = self.state.lock().unwrap();
        let domid = st.next_domid;
        st.next_domid += 1;
        st.domains.insert(
            domid,
            FakeDomain {
                name: name.to_string(),
                paused,
                config: None,
                stored_config: None,
            },
        );
        DomainId(domid)
    }

    pub fn set_domain_config(&self, domid: DomainId, config: DomainConfig) {
        let mut st = self.state.lock().unwrap();
        if let Some(d) = st.domains.get_mut(&domid.0) {
            d.config = Some(config);
        }
    }

    pub fn set_stored_config(&self, domid: DomainId, bytes: Vec<u8>) {
        let mut st = self.state.lock().unwrap();
        if let Some(d) = st.domains.get_mut(&domid.0) {
            d.stored_config = Some(bytes);
        }
    }

    pub fn push_event(&self, event: Event) {
        self.state.lock().unwrap().events.push_back(event);
    }

    /// Queues an already-delivered event that only `poll_event` may see.
    pub fn push_stale_event(&self, event: Event) {
        self.state.lock().unwrap().stale_events.push_back(event);
    }

    /// Makes the named platform call fail with a canned error code.
    pub fn fail_call(&self, call: &'static str) {
        self.state.lock().unwrap().fail.insert(call);
    }

    pub fn set_state_payload(&self, payload: Vec<u8>) {
        self.state.lock().unwrap().state_payload = payload;
    }

    pub fn set_memory(&self, need_kb: u64, free_kb: u64) {
        let mut st = self.state.lock().unwrap();
        st.need_memory_kb = need_kb;
        st.free_memory_kb = free_kb;
    }

    /// Scripts the next answers of `free_memory_kb`, consumed in order
    /// before the static value applies again.
    pub fn push_free_memory(&self, free_kb: u64) {
        self.state.lock().unwrap().free_memory_script.push_back(free_kb);
    }

    // --- test inspection ------------------------------------------------

    pub fn domain(&self, domid: DomainId) -> Option<FakeDomain> {
        self.state.lock().unwrap().domains.get(&domid.0).cloned()
    }

    pub fn find_domain(&self, name: &str) -> Option<(DomainId, FakeDomain)> {
        let st = self.state.lock().unwrap();
        st.domains
            .iter()
            .find(|(_, d)| d.name == name)
            .map(|(id, d)| (DomainId(*id), d.clone()))
    }

    pub fn num_domains(&self) -> usize {
        self.state.lock().unwrap().domains.len()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn balloon_requests(&self) -> Vec<(DomainId, i64, bool)> {
        self.state.lock().unwrap().balloon_requests.clone()
    }

    pub fn ingested_payload(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().ingested_payload.clone()
    }

    pub fn restore_params(&self) -> Option<RestoreParams> {
        self.state.lock().unwrap().restore_params
    }
}

impl Platform for FakePlatform {
    fn create_domain(&self, config: &DomainConfig) -> Result<DomainId> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "create_domain")?;

        let domid = st.next_domid;
        st.next_domid += 1;
        st.domains.insert(
            domid,
            FakeDomain {
                name: config.name.clone(),
                paused: true,
                config: Some(config.clone()),
                stored_config: None,
            },
        );
        self.record(&mut st, format!("create {}", config.name));
        Ok(DomainId(domid))
    }

    fn restore_domain(
        &self,
        config: &DomainConfig,
        stream: &mut dyn Read,
        params: &RestoreParams,
    ) -> Result<DomainId> {
        {
            let st = self.state.lock().unwrap();
            self.check_fail(&st, "restore_domain")?;
        }

        // Consume exactly one framed state payload; holding the state
        // lock across a blocking pipe read would wedge the test peer.
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        stream.read_exact(&mut payload)?;

        let mut st = self.state.lock().unwrap();
        st.ingested_payload = Some(payload);
        st.restore_params = Some(*params);

        let domid = st.next_domid;
        st.next_domid += 1;
        st.domains.insert(
            domid,
            FakeDomain {
                name: config.name.clone(),
                paused: true,
                config: Some(config.clone()),
                stored_config: None,
            },
        );
        self.record(&mut st, format!("restore {}", config.name));
        Ok(DomainId(domid))
    }

    fn soft_reset(&self, config: &DomainConfig, domid: DomainId) -> Result<DomainId> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "soft_reset")?;

        let domain = st
            .domains
            .get_mut(&domid.0)
            .ok_or(PlatformError::NotFound)?;
        domain.paused = true;
        domain.config = Some(config.clone());
        self.record(&mut st, format!("soft_reset {}", domid));
        Ok(domid)
    }

    fn suspend_domain(&self, domid: DomainId, stream: &mut dyn Write, live: bool) -> Result<()> {
        let payload = {
            let mut st = self.state.lock().unwrap();
            self.check_fail(&st, "suspend_domain")?;
            if !st.domains.contains_key(&domid.0) {
                return Err(PlatformError::NotFound);
            }
            self.record(&mut st, format!("suspend {} live={}", domid, live));
            st.state_payload.clone()
        };

        stream.write_all(&(payload.len() as u32).to_le_bytes())?;
        stream.write_all(&payload)?;
        stream.flush()?;
        Ok(())
    }

    fn resume_domain(&self, domid: DomainId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "resume_domain")?;
        let domain = st
            .domains
            .get_mut(&domid.0)
            .ok_or(PlatformError::NotFound)?;
        domain.paused = false;
        self.record(&mut st, format!("resume {}", domid));
        Ok(())
    }

    fn pause_domain(&self, domid: DomainId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "pause_domain")?;
        let domain = st
            .domains
            .get_mut(&domid.0)
            .ok_or(PlatformError::NotFound)?;
        domain.paused = true;
        self.record(&mut st, format!("pause {}", domid));
        Ok(())
    }

    fn unpause_domain(&self, domid: DomainId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "unpause_domain")?;
        let domain = st
            .domains
            .get_mut(&domid.0)
            .ok_or(PlatformError::NotFound)?;
        domain.paused = false;
        self.record(&mut st, format!("unpause {}", domid));
        Ok(())
    }

    fn destroy_domain(&self, domid: DomainId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "destroy_domain")?;
        st.domains
            .remove(&domid.0)
            .ok_or(PlatformError::NotFound)?;
        self.record(&mut st, format!("destroy {}", domid));
        Ok(())
    }

    fn rename_domain(&self, domid: DomainId, old_name: &str, new_name: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "rename_domain")?;
        let domain = st
            .domains
            .get_mut(&domid.0)
            .ok_or(PlatformError::NotFound)?;
        if domain.name != old_name {
            return Err(PlatformError::Call {
                call: "rename_domain",
                rc: -6,
            });
        }
        domain.name = new_name.to_string();
        self.record(&mut st, format!("rename {} -> {}", old_name, new_name));
        Ok(())
    }

    fn preserve_domain(
        &self,
        domid: DomainId,
        config: &DomainConfig,
        name_suffix: &str,
        _new_uuid: [u8; 16],
    ) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "preserve_domain")?;
        let preserved_name = format!("{}{}", config.name, name_suffix);
        let domain = st
            .domains
            .get_mut(&domid.0)
            .ok_or(PlatformError::NotFound)?;
        domain.name = preserved_name.clone();
        self.record(&mut st, format!("preserve {}", preserved_name));
        Ok(())
    }

    fn core_dump_domain(&self, domid: DomainId, path: &Path) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "core_dump_domain")?;
        self.record(&mut st, format!("core_dump {} {}", domid, path.display()));
        Ok(())
    }

    fn wait_event(&self) -> Result<Event> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "wait_event")?;
        st.events.pop_front().ok_or(PlatformError::Call {
            call: "wait_event",
            rc: -1,
        })
    }

    fn poll_event(&self) -> Result<Option<Event>> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "poll_event")?;
        let event = st.stale_events.pop_front();
        if event.is_some() {
            self.record(&mut st, "poll_event drained".to_string());
        }
        Ok(event)
    }

    fn need_memory_kb(&self, _config: &DomainConfig) -> Result<u64> {
        let st = self.state.lock().unwrap();
        self.check_fail(&st, "need_memory_kb")?;
        Ok(st.need_memory_kb)
    }

    fn free_memory_kb(&self) -> Result<u64> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "free_memory_kb")?;
        let free = st
            .free_memory_script
            .pop_front()
            .unwrap_or(st.free_memory_kb);
        self.record(&mut st, format!("free_memory -> {}", free));
        Ok(free)
    }

    fn set_memory_target(&self, domid: DomainId, target_kb: i64, relative: bool) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "set_memory_target")?;
        st.balloon_requests.push((domid, target_kb, relative));
        self.record(
            &mut st,
            format!("set_memory_target {} {} relative={}", domid, target_kb, relative),
        );
        Ok(())
    }

    fn wait_memory_target(&self, domid: DomainId, wait_secs: u32) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "wait_memory_target")?;
        self.record(&mut st, format!("wait_memory_target {} {}s", domid, wait_secs));
        Ok(())
    }

    fn retrieve_domain_config(&self, domid: DomainId) -> Result<DomainConfig> {
        let st = self.state.lock().unwrap();
        self.check_fail(&st, "retrieve_domain_config")?;
        st.domains
            .get(&domid.0)
            .and_then(|d| d.config.clone())
            .ok_or(PlatformError::NotFound)
    }

    fn stored_domain_config(&self, domid: DomainId) -> Result<Option<Vec<u8>>> {
        let st = self.state.lock().unwrap();
        self.check_fail(&st, "stored_domain_config")?;
        let domain = st.domains.get(&domid.0).ok_or(PlatformError::NotFound)?;
        Ok(domain.stored_config.clone())
    }

    fn clear_stored_domain_config(&self, domid: DomainId) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        self.check_fail(&st, "clear_stored_domain_config")?;
        let domain = st
            .domains
            .get_mut(&domid.0)
            .ok_or(PlatformError::NotFound)?;
        domain.stored_config = None;
        self.record(&mut st, format!("clear_stored_config {}", domid));
        Ok(())
    }
}
