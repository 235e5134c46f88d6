//! Immutable network state.
//!
//! [`NetworkState`] is a value describing the client's current view of the
//! network: itself, known users, joined channels, negotiated capabilities,
//! ISUPPORT tokens, and connection limits. The protocol engine owns the
//! single current state and replaces it wholesale on every mutation; user
//! and channel records are shared between snapshots via `Arc`, so a
//! replaced state is cheap and earlier snapshots stay internally
//! consistent.
//!
//! Every name lookup folds its input through the network's current case
//! mapping. The membership relation is stored on both endpoints (user →
//! channels and channel → users) and kept mirrored by the update methods.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::casemap::CaseMapping;
use crate::error::{Error, Result};
use crate::isupport::Isupport;

static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque identifier for a tracked user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(u64);

/// Opaque identifier for a tracked channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

/// A user visible to this client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserRecord {
    /// State-internal identifier.
    pub id: UserId,
    /// Current nickname.
    pub nick: String,
    /// Ident (username) portion of the hostmask.
    pub ident: String,
    /// Host portion of the hostmask.
    pub host: String,
    /// Services account, if logged in.
    pub account: Option<String>,
    /// Away status.
    pub away: bool,
    /// Real name (GECOS).
    pub realname: String,
    /// User mode letters. Only meaningful for the client's own record.
    pub modes: BTreeSet<char>,
    /// Channels shared with this user, with the user's status prefix
    /// string in each (e.g. `"@+"`), highest rank first.
    pub channels: BTreeMap<ChannelId, String>,
}

impl UserRecord {
    fn new(id: UserId, nick: &str) -> Self {
        Self {
            id,
            nick: nick.to_string(),
            ident: String::new(),
            host: String::new(),
            account: None,
            away: false,
            realname: String::new(),
            modes: BTreeSet::new(),
            channels: BTreeMap::new(),
        }
    }

    /// `nick!ident@host`.
    pub fn hostmask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.ident, self.host)
    }
}

/// A channel this client has joined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelRecord {
    /// State-internal identifier.
    pub id: ChannelId,
    /// Channel name, including its type prefix.
    pub name: String,
    /// Topic, empty when unset.
    pub topic: String,
    /// Tracked channel modes with their arguments where applicable.
    pub modes: BTreeMap<char, Option<String>>,
    /// Members, with each member's status prefix string.
    pub users: BTreeMap<UserId, String>,
}

impl ChannelRecord {
    fn new(id: ChannelId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            topic: String::new(),
            modes: BTreeMap::new(),
            users: BTreeMap::new(),
        }
    }
}

/// Server-imposed connection limits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionLimits {
    /// Maximum wire line length in bytes, including CR LF.
    pub line_length: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            line_length: crate::command::MIN_LINE_LENGTH,
        }
    }
}

/// Immutable snapshot of the network as seen by this client.
#[derive(Clone, Debug)]
pub struct NetworkState {
    network: String,
    client_id: String,
    case_mapping: CaseMapping,
    self_id: UserId,
    users: HashMap<UserId, Arc<UserRecord>>,
    channels: HashMap<ChannelId, Arc<ChannelRecord>>,
    user_index: HashMap<String, UserId>,
    channel_index: HashMap<String, ChannelId>,
    supported_caps: HashMap<String, Option<String>>,
    enabled_caps: HashSet<String>,
    isupport: Isupport,
    limits: ConnectionLimits,
    next_id: u64,
}

impl NetworkState {
    /// A fresh state containing only the client's own user record.
    pub fn new(network: &str, nick: &str) -> Self {
        let client_id = format!(
            "{}-{}",
            std::process::id(),
            CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let self_id = UserId(1);
        let self_user = Arc::new(UserRecord::new(self_id, nick));
        let case_mapping = CaseMapping::Ascii;
        let mut users = HashMap::new();
        users.insert(self_id, self_user);
        let mut user_index = HashMap::new();
        user_index.insert(case_mapping.fold(nick), self_id);
        Self {
            network: network.to_string(),
            client_id,
            case_mapping,
            self_id,
            users,
            channels: HashMap::new(),
            user_index,
            channel_index: HashMap::new(),
            supported_caps: HashMap::new(),
            enabled_caps: HashSet::new(),
            isupport: Isupport::new(),
            limits: ConnectionLimits::default(),
            next_id: 2,
        }
    }

    //
    // Read views
    //

    /// The user-chosen network name.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// The process-unique identifier of this client session.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The active case mapping.
    pub fn case_mapping(&self) -> CaseMapping {
        self.case_mapping
    }

    /// Fold a name through the active case mapping.
    pub fn fold(&self, name: &str) -> String {
        self.case_mapping.fold(name)
    }

    /// The client's own user id.
    pub fn self_id(&self) -> UserId {
        self.self_id
    }

    /// The client's own user record.
    pub fn self_user(&self) -> &Arc<UserRecord> {
        self.users
            .get(&self.self_id)
            .expect("self user record is always present")
    }

    /// Whether `nick` refers to this client under the current mapping.
    pub fn is_self(&self, nick: &str) -> bool {
        self.case_mapping.irc_eq(nick, &self.self_user().nick)
    }

    /// Look up a user record by id.
    pub fn user(&self, id: UserId) -> Option<&Arc<UserRecord>> {
        self.users.get(&id)
    }

    /// Look up a channel record by id.
    pub fn channel_by_id(&self, id: ChannelId) -> Option<&Arc<ChannelRecord>> {
        self.channels.get(&id)
    }

    /// Look up a user by nick under the current case mapping.
    pub fn user_by_nick(&self, nick: &str) -> Option<&Arc<UserRecord>> {
        let id = self.user_index.get(&self.fold(nick))?;
        self.users.get(id)
    }

    /// Look up a channel by name under the current case mapping.
    pub fn channel(&self, name: &str) -> Option<&Arc<ChannelRecord>> {
        let id = self.channel_index.get(&self.fold(name))?;
        self.channels.get(id)
    }

    /// All members of a channel.
    pub fn users_in_channel(&self, name: &str) -> Vec<Arc<UserRecord>> {
        match self.channel(name) {
            Some(chan) => chan
                .users
                .keys()
                .filter_map(|id| self.users.get(id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// All channels shared with a user.
    pub fn channels_for_user(&self, nick: &str) -> Vec<Arc<ChannelRecord>> {
        match self.user_by_nick(nick) {
            Some(user) => user
                .channels
                .keys()
                .filter_map(|id| self.channels.get(id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// All tracked users, including the client itself.
    pub fn all_users(&self) -> impl Iterator<Item = &Arc<UserRecord>> {
        self.users.values()
    }

    /// All tracked channels.
    pub fn all_channels(&self) -> impl Iterator<Item = &Arc<ChannelRecord>> {
        self.channels.values()
    }

    /// Whether a capability is enabled, along with its advertised value.
    pub fn cap_enabled(&self, name: &str) -> (bool, Option<&str>) {
        let enabled = self.enabled_caps.contains(name);
        let value = self.supported_caps.get(name).and_then(|v| v.as_deref());
        (enabled, value)
    }

    /// Capabilities advertised by the server, with values.
    pub fn supported_caps(&self) -> &HashMap<String, Option<String>> {
        &self.supported_caps
    }

    /// Names of currently enabled capabilities.
    pub fn enabled_caps(&self) -> &HashSet<String> {
        &self.enabled_caps
    }

    /// ISUPPORT token lookup.
    pub fn isupport(&self, token: &str) -> Option<Option<&str>> {
        self.isupport.get(token)
    }

    /// ISUPPORT token value with a default.
    pub fn isupport_or_default<'a>(&'a self, token: &str, default: &'a str) -> &'a str {
        self.isupport.get_or_default(token, default)
    }

    /// The full ISUPPORT map with typed accessors.
    pub fn isupport_map(&self) -> &Isupport {
        &self.isupport
    }

    /// Connection limits.
    pub fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    //
    // Value-replacement updates. Each returns a new state; the engine swaps
    // the owning reference.
    //

    fn alloc_user_id(&mut self) -> UserId {
        let id = UserId(self.next_id);
        self.next_id += 1;
        id
    }

    fn alloc_channel_id(&mut self) -> ChannelId {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Add a user record for `nick`. Fails with [`Error::BadState`] if the
    /// nick is already tracked.
    pub fn with_user_added(&self, nick: &str) -> Result<(Self, UserId)> {
        let key = self.fold(nick);
        if self.user_index.contains_key(&key) {
            return Err(Error::BadState(format!("user {:?} already tracked", nick)));
        }
        let mut next = self.clone();
        let id = next.alloc_user_id();
        next.users.insert(id, Arc::new(UserRecord::new(id, nick)));
        next.user_index.insert(key, id);
        Ok((next, id))
    }

    /// Replace a user record through `f`. The lookup index follows nick
    /// changes.
    pub fn with_user_updated(
        &self,
        id: UserId,
        f: impl FnOnce(&mut UserRecord),
    ) -> Result<Self> {
        let mut next = self.clone();
        let record = next
            .users
            .get_mut(&id)
            .ok_or_else(|| Error::BadState(format!("unknown user id {:?}", id)))?;
        let old_nick = record.nick.clone();
        let record = Arc::make_mut(record);
        f(record);
        record.id = id;
        if record.nick != old_nick {
            let new_key = next.case_mapping.fold(&record.nick);
            let nick_taken = next
                .user_index
                .get(&new_key)
                .is_some_and(|existing| *existing != id);
            if nick_taken {
                return Err(Error::BadState(format!(
                    "nick {:?} already tracked",
                    record.nick
                )));
            }
            let old_key = next.case_mapping.fold(&old_nick);
            next.user_index.remove(&old_key);
            next.user_index.insert(new_key, id);
        }
        Ok(next)
    }

    /// Remove a user and all of its membership edges. Removing the client's
    /// own record is a state error.
    pub fn with_user_removed(&self, id: UserId) -> Result<Self> {
        if id == self.self_id {
            return Err(Error::BadState("cannot remove own user record".into()));
        }
        let mut next = self.clone();
        let record = next
            .users
            .remove(&id)
            .ok_or_else(|| Error::BadState(format!("unknown user id {:?}", id)))?;
        next.user_index.remove(&next.case_mapping.fold(&record.nick));
        for chan_id in record.channels.keys() {
            if let Some(chan) = next.channels.get_mut(chan_id) {
                Arc::make_mut(chan).users.remove(&id);
            }
        }
        Ok(next)
    }

    /// Add a channel record. Fails if the name is already tracked.
    pub fn with_channel_added(&self, name: &str) -> Result<(Self, ChannelId)> {
        let key = self.fold(name);
        if self.channel_index.contains_key(&key) {
            return Err(Error::BadState(format!(
                "channel {:?} already tracked",
                name
            )));
        }
        let mut next = self.clone();
        let id = next.alloc_channel_id();
        next.channels
            .insert(id, Arc::new(ChannelRecord::new(id, name)));
        next.channel_index.insert(key, id);
        Ok((next, id))
    }

    /// Replace a channel record through `f`. The lookup index follows
    /// renames.
    pub fn with_channel_updated(
        &self,
        id: ChannelId,
        f: impl FnOnce(&mut ChannelRecord),
    ) -> Result<Self> {
        let mut next = self.clone();
        let record = next
            .channels
            .get_mut(&id)
            .ok_or_else(|| Error::BadState(format!("unknown channel id {:?}", id)))?;
        let old_name = record.name.clone();
        let record = Arc::make_mut(record);
        f(record);
        record.id = id;
        if record.name != old_name {
            let new_key = next.case_mapping.fold(&record.name);
            let name_taken = next
                .channel_index
                .get(&new_key)
                .is_some_and(|existing| *existing != id);
            if name_taken {
                return Err(Error::BadState(format!(
                    "channel {:?} already tracked",
                    record.name
                )));
            }
            let old_key = next.case_mapping.fold(&old_name);
            next.channel_index.remove(&old_key);
            next.channel_index.insert(new_key, id);
        }
        Ok(next)
    }

    /// Remove a channel and its membership edges. Users left without any
    /// shared channel are *not* pruned here; the engine decides that.
    pub fn with_channel_removed(&self, id: ChannelId) -> Result<Self> {
        let mut next = self.clone();
        let record = next
            .channels
            .remove(&id)
            .ok_or_else(|| Error::BadState(format!("unknown channel id {:?}", id)))?;
        next.channel_index
            .remove(&next.case_mapping.fold(&record.name));
        for user_id in record.users.keys() {
            if let Some(user) = next.users.get_mut(user_id) {
                Arc::make_mut(user).channels.remove(&id);
            }
        }
        Ok(next)
    }

    /// Set a user's membership (and status prefix string) in a channel,
    /// mirrored on both records.
    pub fn with_membership(
        &self,
        user_id: UserId,
        chan_id: ChannelId,
        prefixes: &str,
    ) -> Result<Self> {
        let mut next = self.clone();
        let user = next
            .users
            .get_mut(&user_id)
            .ok_or_else(|| Error::BadState(format!("unknown user id {:?}", user_id)))?;
        Arc::make_mut(user)
            .channels
            .insert(chan_id, prefixes.to_string());
        let chan = next
            .channels
            .get_mut(&chan_id)
            .ok_or_else(|| Error::BadState(format!("unknown channel id {:?}", chan_id)))?;
        Arc::make_mut(chan)
            .users
            .insert(user_id, prefixes.to_string());
        Ok(next)
    }

    /// Remove a membership edge from both records.
    pub fn without_membership(&self, user_id: UserId, chan_id: ChannelId) -> Result<Self> {
        let mut next = self.clone();
        if let Some(user) = next.users.get_mut(&user_id) {
            Arc::make_mut(user).channels.remove(&chan_id);
        }
        if let Some(chan) = next.channels.get_mut(&chan_id) {
            Arc::make_mut(chan).users.remove(&user_id);
        }
        Ok(next)
    }

    /// Remove every tracked user (excluding self) that shares no channel
    /// with this client.
    pub fn with_lost_users_pruned(&self) -> Self {
        let lost: Vec<UserId> = self
            .users
            .values()
            .filter(|u| u.id != self.self_id && u.channels.is_empty())
            .map(|u| u.id)
            .collect();
        let mut next = self.clone();
        for id in lost {
            if let Some(record) = next.users.remove(&id) {
                next.user_index
                    .remove(&next.case_mapping.fold(&record.nick));
            }
        }
        next
    }

    /// Switch the case mapping and rebuild both lookup indexes.
    pub fn with_case_mapping(&self, mapping: CaseMapping) -> Self {
        let mut next = self.clone();
        next.case_mapping = mapping;
        next.rebuild_indexes();
        next
    }

    fn rebuild_indexes(&mut self) {
        self.user_index = self
            .users
            .values()
            .map(|u| (self.case_mapping.fold(&u.nick), u.id))
            .collect();
        self.channel_index = self
            .channels
            .values()
            .map(|c| (self.case_mapping.fold(&c.name), c.id))
            .collect();
    }

    /// Record a server-advertised capability and its value.
    pub fn with_cap_supported(&self, name: &str, value: Option<&str>) -> Self {
        let mut next = self.clone();
        next.supported_caps
            .insert(name.to_string(), value.map(str::to_string));
        next
    }

    /// Mark a capability enabled.
    pub fn with_cap_enabled(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.enabled_caps.insert(name.to_string());
        next
    }

    /// Mark a capability disabled.
    pub fn with_cap_disabled(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.enabled_caps.remove(name);
        next
    }

    /// Apply one ISUPPORT token. `CASEMAPPING` changes rebuild the lookup
    /// indexes; `LINELEN` only ever widens the line limit.
    pub fn with_isupport_token(&self, token: &str) -> Self {
        let mut next = self.clone();
        next.isupport.apply(token);

        let mapping = next.isupport.casemapping();
        if mapping != next.case_mapping {
            next.case_mapping = mapping;
            next.rebuild_indexes();
        }
        if let Some(linelen) = next.isupport.linelen() {
            // Servers only raise the limit; keep the larger value.
            next.limits.line_length = next.limits.line_length.max(linelen);
        }
        next
    }

    /// Verify the internal invariants, failing with [`Error::BadState`]
    /// when an index entry or membership edge is inconsistent.
    pub fn check_consistency(&self) -> Result<()> {
        if !self.users.contains_key(&self.self_id) {
            return Err(Error::BadState("self user record missing".into()));
        }
        for (key, id) in &self.user_index {
            let user = self
                .users
                .get(id)
                .ok_or_else(|| Error::BadState(format!("index references unknown user {:?}", id)))?;
            if self.case_mapping.fold(&user.nick) != *key {
                return Err(Error::BadState(format!(
                    "index key {:?} does not match nick {:?}",
                    key, user.nick
                )));
            }
        }
        if self.user_index.len() != self.users.len() {
            return Err(Error::BadState("user index size mismatch".into()));
        }
        for (key, id) in &self.channel_index {
            let chan = self.channels.get(id).ok_or_else(|| {
                Error::BadState(format!("index references unknown channel {:?}", id))
            })?;
            if self.case_mapping.fold(&chan.name) != *key {
                return Err(Error::BadState(format!(
                    "index key {:?} does not match channel {:?}",
                    key, chan.name
                )));
            }
        }
        if self.channel_index.len() != self.channels.len() {
            return Err(Error::BadState("channel index size mismatch".into()));
        }
        for user in self.users.values() {
            for (chan_id, prefixes) in &user.channels {
                let chan = self.channels.get(chan_id).ok_or_else(|| {
                    Error::BadState(format!(
                        "user {:?} references unknown channel {:?}",
                        user.nick, chan_id
                    ))
                })?;
                if chan.users.get(&user.id) != Some(prefixes) {
                    return Err(Error::BadState(format!(
                        "membership of {:?} in {:?} is not mirrored",
                        user.nick, chan.name
                    )));
                }
            }
        }
        for chan in self.channels.values() {
            for user_id in chan.users.keys() {
                let user = self.users.get(user_id).ok_or_else(|| {
                    Error::BadState(format!(
                        "channel {:?} references unknown user {:?}",
                        chan.name, user_id
                    ))
                })?;
                if !user.channels.contains_key(&chan.id) {
                    return Err(Error::BadState(format!(
                        "membership of {:?} in {:?} is not mirrored",
                        user.nick, chan.name
                    )));
                }
            }
        }
        Ok(())
    }
}
