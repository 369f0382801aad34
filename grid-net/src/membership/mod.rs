use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use grid_core::version::{self, parse_version, version_string};
use grid_core::{Member, MemberId};

use crate::member_set::MemberIdSet;
use backlog::BacklogBitset;

mod backlog;

const GROW: usize = 8;

/// Lifecycle of one member within one service. A member joins, serves
/// requests while `Joined`, announces departure as `Leaving`, then leaves
/// the directory entirely.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum MemberState {
    #[default]
    Absent,
    Joining,
    Joined,
    Leaving,
}

/// Per-service member directory: who participates in the service, plus the
/// per-member attributes the protocol needs (join time, wire version,
/// endpoint, opaque config map) and the derived seniority pointers.
///
/// All attribute arrays are indexed by member id and grow on demand; a read
/// past the end of an array is an absent member, never a panic.
#[derive(Debug)]
pub struct ServiceMembership {
    service_name: String,
    inner: Mutex<Directory>,
    backlog: BacklogBitset,
}

#[derive(Debug, Default)]
struct Directory {
    ids: MemberIdSet,
    members: Vec<Option<Arc<Member>>>,
    state: Vec<MemberState>,
    join_time: Vec<u64>,
    version: Vec<u32>,
    endpoint: Vec<Option<SocketAddr>>,
    endpoint_name: Vec<Option<String>>,
    config: Vec<Option<HashMap<String, Vec<u8>>>>,
    this_member: Option<Arc<Member>>,
    oldest: Option<Arc<Member>>,
    oldest_local: Option<Arc<Member>>,
    successor: Option<Arc<Member>>,
    last_join_time: u64,
    version_min: u32,
    version_max: u32,
}

impl ServiceMembership {
    pub fn new(service_name: impl Into<String>) -> Self {
        ServiceMembership {
            service_name: service_name.into(),
            inner: Mutex::new(Directory::default()),
            backlog: BacklogBitset::default(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Register a new member. The id must not already be present; a double
    /// add is a protocol bug upstream, not a runtime condition.
    pub fn add(&self, member: Arc<Member>) {
        let id = member.id;
        let mut dir = self.inner.lock();
        dir.ensure_capacity(id.index());
        assert!(
            dir.members[id.index()].is_none(),
            "member {} already present in service {}",
            id,
            self.service_name
        );
        debug!("service {} add {}", self.service_name, member);
        dir.ids.insert(id);
        dir.state[id.index()] = MemberState::Joining;
        dir.members[id.index()] = Some(member);
    }

    /// Drop a member and every attribute recorded for it. The seniority
    /// pointers are rescanned only when the departed member held one.
    pub fn remove(&self, id: MemberId) -> Option<Arc<Member>> {
        let mut dir = self.inner.lock();
        if id.index() >= dir.members.len() {
            return None;
        }
        let departed = dir.members[id.index()].take()?;
        debug!("service {} remove {}", self.service_name, departed);
        dir.ids.remove(id);
        dir.state[id.index()] = MemberState::Absent;
        dir.join_time[id.index()] = 0;
        dir.endpoint[id.index()] = None;
        dir.endpoint_name[id.index()] = None;
        dir.config[id.index()] = None;
        dir.set_version_slot(id, 0);
        self.backlog.set(id, false);
        let was_local = dir.this_member.as_ref().is_some_and(|m| m.id == id);
        if was_local {
            dir.this_member = None;
        }
        let held_pointer = [&dir.oldest, &dir.oldest_local, &dir.successor]
            .iter()
            .any(|p| p.as_ref().is_some_and(|m| m.id == id));
        if held_pointer || was_local {
            dir.rescan_pointers();
        }
        Some(departed)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.inner.lock().ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ids.is_empty()
    }

    pub fn member(&self, id: MemberId) -> Option<Arc<Member>> {
        let dir = self.inner.lock();
        dir.members.get(id.index()).cloned().flatten()
    }

    pub fn ids(&self) -> MemberIdSet {
        self.inner.lock().ids.clone()
    }

    pub fn members(&self) -> Vec<Arc<Member>> {
        let dir = self.inner.lock();
        dir.members.iter().flatten().cloned().collect()
    }

    /// The member that joined the service at exactly `join_time`, if any.
    pub fn joined_member(&self, join_time: u64) -> Option<Arc<Member>> {
        let dir = self.inner.lock();
        dir.members
            .iter()
            .flatten()
            .find(|m| dir.join_time[m.id.index()] == join_time)
            .cloned()
    }

    /// Ids of members currently in the `Joined` state.
    pub fn joined_ids(&self) -> MemberIdSet {
        let dir = self.inner.lock();
        dir.ids
            .iter()
            .filter(|id| dir.state[id.index()] == MemberState::Joined)
            .collect()
    }

    /// Designate the local member. It must already be in the directory; the
    /// local-seniority pointers are only meaningful afterwards.
    pub fn set_this_member(&self, id: MemberId) {
        let mut dir = self.inner.lock();
        assert!(id.is_valid(), "invalid local member id");
        let member = dir
            .members
            .get(id.index())
            .cloned()
            .flatten()
            .unwrap_or_else(|| panic!("local member {} not in directory", id));
        if let Some(current) = &dir.this_member {
            assert_eq!(current.id, id, "local member already designated");
            return;
        }
        dir.this_member = Some(member);
        dir.rescan_pointers();
    }

    pub fn this_member(&self) -> Option<Arc<Member>> {
        self.inner.lock().this_member.clone()
    }

    /// The most senior member of the whole service.
    pub fn oldest_member(&self) -> Option<Arc<Member>> {
        self.inner.lock().oldest.clone()
    }

    /// The most senior member collocated with the local member.
    pub fn oldest_local_member(&self) -> Option<Arc<Member>> {
        self.inner.lock().oldest_local.clone()
    }

    /// The most senior member junior to the local member; the member that
    /// inherits the local member's duties when it leaves.
    pub fn successor_member(&self) -> Option<Arc<Member>> {
        self.inner.lock().successor.clone()
    }

    /// Record when a member joined the service. Seniority pointers are
    /// maintained incrementally; only removal pays for a full rescan.
    pub fn set_join_time(&self, id: MemberId, join_time: u64) {
        let mut dir = self.inner.lock();
        dir.ensure_capacity(id.index());
        dir.join_time[id.index()] = join_time;
        if join_time > dir.last_join_time {
            dir.last_join_time = join_time;
        }
        let Some(member) = dir.members.get(id.index()).cloned().flatten() else {
            return;
        };
        if dir
            .oldest
            .as_ref()
            .is_none_or(|o| dir.is_senior(&member, o))
        {
            dir.oldest = Some(member.clone());
        }
        let Some(this) = dir.this_member.clone() else {
            return;
        };
        if member.is_collocated(&this)
            && dir
                .oldest_local
                .as_ref()
                .is_none_or(|o| dir.is_senior(&member, o))
        {
            dir.oldest_local = Some(member.clone());
        }
        if member.id != this.id
            && dir.is_senior(&this, &member)
            && dir
                .successor
                .as_ref()
                .is_none_or(|s| dir.is_senior(&member, s))
        {
            dir.successor = Some(member);
        }
    }

    pub fn join_time(&self, id: MemberId) -> u64 {
        let dir = self.inner.lock();
        dir.join_time.get(id.index()).copied().unwrap_or(0)
    }

    /// The largest join time ever observed, surviving the departure of the
    /// member that carried it.
    pub fn last_join_time(&self) -> u64 {
        self.inner.lock().last_join_time
    }

    /// Signed seniority comparison: negative when `a` joined before `b`.
    pub fn compare_seniority(&self, a: MemberId, b: MemberId) -> i64 {
        let dir = self.inner.lock();
        let a_time = dir.join_time.get(a.index()).copied().unwrap_or(0);
        let b_time = dir.join_time.get(b.index()).copied().unwrap_or(0);
        a_time.wrapping_sub(b_time) as i64
    }

    pub fn set_version(&self, id: MemberId, encoded: u32) {
        self.inner.lock().set_version_slot(id, encoded);
    }

    pub fn set_version_str(&self, id: MemberId, version: &str) {
        self.set_version(id, parse_version(version));
    }

    pub fn version(&self, id: MemberId) -> u32 {
        let dir = self.inner.lock();
        dir.version.get(id.index()).copied().unwrap_or(0)
    }

    /// The lowest non-zero encoded version across the service, or 0 when no
    /// member has announced one.
    pub fn version_min(&self) -> u32 {
        self.inner.lock().version_min
    }

    pub fn version_max(&self) -> u32 {
        self.inner.lock().version_max
    }

    /// Whether every member that has announced a version runs at least
    /// `required`. False while no member has announced one.
    pub fn is_version_compatible(&self, required: &str) -> bool {
        let min = self.inner.lock().version_min;
        min != 0 && min >= parse_version(required)
    }

    /// Whether every announced version is the same.
    pub fn is_version_consistent(&self) -> bool {
        let dir = self.inner.lock();
        dir.version_min == dir.version_max
    }

    /// Whether the oldest announced version is the same release as
    /// `required` at an equal or higher patch level.
    pub fn is_patch_compatible(&self, required: &str) -> bool {
        let min = self.inner.lock().version_min;
        min != 0 && version::is_patch_compatible(parse_version(required), min)
    }

    /// Record the member's transport endpoint. A (re)announced endpoint also
    /// clears any stale backlog flag for the member.
    pub fn set_endpoint(&self, id: MemberId, addr: SocketAddr) {
        let mut dir = self.inner.lock();
        dir.ensure_capacity(id.index());
        dir.endpoint[id.index()] = Some(addr);
        self.backlog.set(id, false);
    }

    pub fn endpoint(&self, id: MemberId) -> Option<SocketAddr> {
        let dir = self.inner.lock();
        dir.endpoint.get(id.index()).copied().flatten()
    }

    pub fn set_endpoint_name(&self, id: MemberId, name: impl Into<String>) {
        let mut dir = self.inner.lock();
        dir.ensure_capacity(id.index());
        dir.endpoint_name[id.index()] = Some(name.into());
    }

    pub fn endpoint_name(&self, id: MemberId) -> Option<String> {
        let dir = self.inner.lock();
        dir.endpoint_name.get(id.index()).cloned().flatten()
    }

    pub fn update_member_config(&self, id: MemberId, config: HashMap<String, Vec<u8>>) {
        let mut dir = self.inner.lock();
        dir.ensure_capacity(id.index());
        match &mut dir.config[id.index()] {
            Some(existing) => existing.extend(config),
            slot @ None => *slot = Some(config),
        }
    }

    pub fn member_config(&self, id: MemberId) -> Option<HashMap<String, Vec<u8>>> {
        let dir = self.inner.lock();
        dir.config.get(id.index()).cloned().flatten()
    }

    pub fn set_joining(&self, id: MemberId) {
        self.set_state(id, MemberState::Joining);
    }

    pub fn set_joined(&self, id: MemberId) {
        self.set_state(id, MemberState::Joined);
    }

    pub fn set_leaving(&self, id: MemberId) {
        self.set_state(id, MemberState::Leaving);
    }

    pub fn state(&self, id: MemberId) -> MemberState {
        let dir = self.inner.lock();
        dir.state.get(id.index()).copied().unwrap_or_default()
    }

    pub fn is_joining(&self, id: MemberId) -> bool {
        self.state(id) == MemberState::Joining
    }

    pub fn is_joined(&self, id: MemberId) -> bool {
        self.state(id) == MemberState::Joined
    }

    pub fn is_leaving(&self, id: MemberId) -> bool {
        self.state(id) == MemberState::Leaving
    }

    fn set_state(&self, id: MemberId, state: MemberState) {
        let mut dir = self.inner.lock();
        if id.index() < dir.state.len() && dir.members[id.index()].is_some() {
            dir.state[id.index()] = state;
        }
    }

    /// Backlog flag for a member, readable and writable without touching the
    /// directory mutex.
    pub fn is_backlogged(&self, id: MemberId) -> bool {
        self.backlog.get(id)
    }

    pub fn set_backlogged(&self, id: MemberId, excessive: bool) {
        self.backlog.set(id, excessive);
    }

    /// Seed this (empty) directory with a full copy of another one, as done
    /// when a service restarts and re-learns the membership it had.
    pub fn copy_from(&self, source: &ServiceMembership) {
        assert!(
            !std::ptr::eq(self, source),
            "copy source for service {} is the target itself",
            self.service_name
        );
        // both locks taken in address order so two directories copying from
        // each other cannot deadlock
        let (mut dst, src);
        if (self as *const Self) < (source as *const Self) {
            dst = self.inner.lock();
            src = source.inner.lock();
        } else {
            src = source.inner.lock();
            dst = self.inner.lock();
        }
        assert!(
            dst.ids.is_empty(),
            "copy target for service {} is not empty",
            self.service_name
        );
        dst.ids = src.ids.clone();
        dst.members = src.members.clone();
        dst.state = src.state.clone();
        dst.join_time = src.join_time.clone();
        dst.version = src.version.clone();
        dst.endpoint = src.endpoint.clone();
        dst.endpoint_name = src.endpoint_name.clone();
        dst.config = src.config.clone();
        dst.this_member = src.this_member.clone();
        dst.last_join_time = src.last_join_time;
        dst.version_min = src.version_min;
        dst.version_max = src.version_max;
        dst.rescan_pointers();
        debug_assert_eq!(
            dst.oldest.as_ref().map(|m| m.id),
            src.oldest.as_ref().map(|m| m.id),
            "seniority diverged during copy"
        );
    }
}

impl Directory {
    fn ensure_capacity(&mut self, index: usize) {
        if index >= self.members.len() {
            let new_len = index + GROW;
            self.members.resize(new_len, None);
            self.state.resize(new_len, MemberState::Absent);
            self.join_time.resize(new_len, 0);
            self.version.resize(new_len, 0);
            self.endpoint.resize(new_len, None);
            self.endpoint_name.resize(new_len, None);
            self.config.resize(new_len, None);
        }
    }

    /// Seniority order: earlier join time wins, lower id breaks ties.
    fn is_senior(&self, a: &Member, b: &Member) -> bool {
        let a_key = (self.join_time[a.id.index()], a.id);
        let b_key = (self.join_time[b.id.index()], b.id);
        a_key < b_key
    }

    fn set_version_slot(&mut self, id: MemberId, encoded: u32) {
        self.ensure_capacity(id.index());
        self.version[id.index()] = encoded;
        let mut min = 0u32;
        let mut max = 0u32;
        for (i, &version) in self.version.iter().enumerate() {
            if version == 0 || self.members[i].is_none() {
                continue;
            }
            if min == 0 || version < min {
                min = version;
            }
            if version > max {
                max = version;
            }
        }
        self.version_min = min;
        self.version_max = max;
    }

    fn rescan_pointers(&mut self) {
        let mut oldest: Option<&Arc<Member>> = None;
        let mut oldest_local: Option<&Arc<Member>> = None;
        let mut successor: Option<&Arc<Member>> = None;
        let this = self.this_member.as_ref();
        for member in self.members.iter().flatten() {
            if self.join_time[member.id.index()] == 0 {
                continue;
            }
            if oldest.is_none_or(|o| self.is_senior(member, o)) {
                oldest = Some(member);
            }
            if let Some(this) = this {
                if member.is_collocated(this)
                    && oldest_local.is_none_or(|o| self.is_senior(member, o))
                {
                    oldest_local = Some(member);
                }
                if member.id != this.id
                    && self.is_senior(this, member)
                    && successor.is_none_or(|s| self.is_senior(member, s))
                {
                    successor = Some(member);
                }
            }
        }
        let oldest = oldest.cloned();
        let oldest_local = oldest_local.cloned();
        let successor = successor.cloned();
        self.oldest = oldest;
        self.oldest_local = oldest_local;
        self.successor = successor;
    }
}

impl Display for ServiceMembership {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let dir = self.inner.lock();
        writeln!(
            f,
            "ServiceMembership(Name={}, Size={}",
            self.service_name,
            dir.ids.len()
        )?;
        for member in dir.members.iter().flatten() {
            let i = member.id.index();
            writeln!(
                f,
                "  {} State={:?} JoinTime={} Version={} Endpoint={}",
                member,
                dir.state[i],
                dir.join_time[i],
                version_string(dir.version[i]),
                dir.endpoint[i]
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            )?;
        }
        write!(f, ")")
    }
}
