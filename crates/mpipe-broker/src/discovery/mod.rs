//! Consumer registry and discovery
//!
//! The [`ClientRegistry`] is the in-memory map of known consumers, their
//! health and the pipe names (or patterns) they are bound to. It is only
//! mutated through [`ClientRegistry::apply`] with a [`ServiceEvent`]; the
//! [`DiscoveryService`] turns registration RPCs and the expiry ticker into
//! those events.
//!
//! # Binding resolution
//!
//! Bindings are kept in registration order. A pipe name resolves to the
//! client set of the first binding whose pattern fully matches it, so
//! registering `orders\..*` before `orders.created` makes the wider pattern
//! own `orders.created`.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::ClientId;

mod balance;
mod service;

pub use balance::{LoadBalanceNode, LoadBalanceStrategy, RoundRobinStrategy, WeightedRandomStrategy};
pub use service::DiscoveryService;

/// Liveness of a consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    Online,
    Offline,
}

/// Everything the broker knows about one consumer process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInformation {
    pub address: String,
    pub port: u16,
    pub binding_pipe_names: Vec<String>,
    pub online_time: DateTime<Utc>,
    pub last_report_time: DateTime<Utc>,
    pub status: ClientStatus,
    /// Set while the broker has excluded the client after a transport failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excluded_since: Option<DateTime<Utc>>,
}

impl ClientInformation {
    /// An ONLINE client reporting now
    pub fn new(address: impl Into<String>, port: u16, binding_pipe_names: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            address: address.into(),
            port,
            binding_pipe_names,
            online_time: now,
            last_report_time: now,
            status: ClientStatus::Online,
            excluded_since: None,
        }
    }

    /// Parse a comma separated binding list, dropping blanks and duplicates
    pub fn parse_bindings(csv: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        csv.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty() && seen.insert(name.to_string()))
            .map(String::from)
            .collect()
    }

    /// Override the last report time
    pub fn with_last_report_time(mut self, at: DateTime<Utc>) -> Self {
        self.last_report_time = at;
        self
    }

    pub fn client_id(&self) -> ClientId {
        ClientId::new(&self.address, self.port)
    }

    pub fn is_online(&self) -> bool {
        self.status == ClientStatus::Online
    }
}

/// Registry mutations
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// Upsert clients, mark them ONLINE and bind their pipe names
    Register(Vec<ClientInformation>),
    /// Refresh report times; unknown clients are registered
    HeartBeat(Vec<ClientInformation>),
    /// Replace the whole registry with an authoritative list
    ResetInstances(Vec<ClientInformation>),
    /// Sweep every client against the expiry threshold
    Expire,
}

struct Binding {
    pattern: String,
    regex: Regex,
    clients: BTreeSet<ClientId>,
}

impl Binding {
    fn new(pattern: &str) -> Result<Self, regex::Error> {
        // A name that is not a valid regex binds literally
        let regex = Regex::new(&format!("^(?:{})$", pattern))
            .or_else(|_| Regex::new(&format!("^{}$", regex::escape(pattern))))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            clients: BTreeSet::new(),
        })
    }
}

/// In-memory consumer registry
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientInformation>,
    bindings: RwLock<Vec<Binding>>,
    expired_threshold: Duration,
    load_balance: Arc<dyn LoadBalanceStrategy>,
}

impl ClientRegistry {
    /// Registry with weighted-random balancing
    pub fn new(expired_threshold: Duration) -> Self {
        Self::with_strategy(expired_threshold, Arc::new(WeightedRandomStrategy::new()))
    }

    pub fn with_strategy(
        expired_threshold: Duration,
        load_balance: Arc<dyn LoadBalanceStrategy>,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            bindings: RwLock::new(Vec::new()),
            expired_threshold,
            load_balance,
        }
    }

    pub fn expired_threshold(&self) -> Duration {
        self.expired_threshold
    }

    /// Single mutation entry point
    pub fn apply(&self, event: ServiceEvent) {
        match event {
            ServiceEvent::Register(clients) => {
                for client in clients {
                    self.register(client);
                }
            }
            ServiceEvent::HeartBeat(clients) => {
                for client in clients {
                    self.heartbeat(client);
                }
            }
            ServiceEvent::ResetInstances(clients) => {
                info!(count = clients.len(), "Resetting client registry");
                self.clients.clear();
                self.write_bindings().clear();
                for client in clients {
                    self.register(client);
                }
            }
            ServiceEvent::Expire => self.expire_at(Utc::now()),
        }
    }

    fn register(&self, incoming: ClientInformation) {
        let id = incoming.client_id();
        {
            let mut bindings = self.write_bindings();
            for name in &incoming.binding_pipe_names {
                match bindings.iter_mut().find(|b| &b.pattern == name) {
                    Some(binding) => {
                        binding.clients.insert(id.clone());
                    }
                    None => match Binding::new(name) {
                        Ok(mut binding) => {
                            binding.clients.insert(id.clone());
                            bindings.push(binding);
                        }
                        Err(e) => {
                            warn!(client = %id, pattern = %name, error = %e, "Unusable binding pattern");
                        }
                    },
                }
            }
        }

        match self.clients.get_mut(&id) {
            Some(mut existing) => {
                for name in &incoming.binding_pipe_names {
                    if !existing.binding_pipe_names.contains(name) {
                        existing.binding_pipe_names.push(name.clone());
                    }
                }
                existing.last_report_time = incoming.last_report_time;
                existing.status = ClientStatus::Online;
                existing.excluded_since = None;
            }
            None => {
                info!(
                    client = %id,
                    bindings = ?incoming.binding_pipe_names,
                    "Client registered"
                );
                self.clients.insert(
                    id,
                    ClientInformation {
                        status: ClientStatus::Online,
                        excluded_since: None,
                        ..incoming
                    },
                );
            }
        }
    }

    fn heartbeat(&self, incoming: ClientInformation) {
        let id = incoming.client_id();
        match self.clients.get_mut(&id) {
            Some(mut existing) => {
                if !existing.is_online() {
                    info!(client = %id, "Client back online");
                }
                existing.last_report_time = incoming.last_report_time;
                existing.status = ClientStatus::Online;
                existing.excluded_since = None;
            }
            None => {
                debug!(client = %id, "Heartbeat from unknown client, registering");
                self.register(incoming);
            }
        }
    }

    /// Flip clients ONLINE/OFFLINE as of `now`
    ///
    /// An excluded client stays OFFLINE until it reports after the exclusion.
    pub fn expire_at(&self, now: DateTime<Utc>) {
        let threshold =
            chrono::Duration::from_std(self.expired_threshold).unwrap_or(chrono::Duration::MAX);

        for mut entry in self.clients.iter_mut() {
            let silent = now.signed_duration_since(entry.last_report_time) > threshold;
            let still_excluded = entry
                .excluded_since
                .is_some_and(|since| entry.last_report_time <= since);

            let status = if silent || still_excluded {
                ClientStatus::Offline
            } else {
                ClientStatus::Online
            };

            if status != entry.status {
                match status {
                    ClientStatus::Offline => {
                        warn!(client = %entry.key(), "Client expired");
                    }
                    ClientStatus::Online => {
                        info!(client = %entry.key(), "Client back online");
                        entry.excluded_since = None;
                    }
                }
                entry.status = status;
            }
        }
    }

    /// Take a client out of rotation until it reports again
    pub fn exclude(&self, client_id: &ClientId) -> bool {
        match self.clients.get_mut(client_id) {
            Some(mut client) => {
                warn!(client = %client_id, "Excluding unreachable client");
                client.status = ClientStatus::Offline;
                client.excluded_since = Some(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Healthy client for a pipe using the registry's default strategy
    pub fn lookup(&self, pipe_name: &str) -> Option<ClientInformation> {
        self.lookup_with(pipe_name, self.load_balance.as_ref())
    }

    /// Healthy client for a pipe using `strategy`
    ///
    /// `None` means there is no destination right now.
    pub fn lookup_with(
        &self,
        pipe_name: &str,
        strategy: &dyn LoadBalanceStrategy,
    ) -> Option<ClientInformation> {
        let candidates = self.healthy_candidates(pipe_name);
        if candidates.is_empty() {
            return None;
        }
        match strategy.select(&candidates) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(pipe = %pipe_name, error = %e, "Load balancing failed");
                None
            }
        }
    }

    /// Whether any ONLINE client is bound to the pipe
    pub fn check_have_health_client(&self, pipe_name: &str) -> bool {
        self.bound_clients(pipe_name).iter().any(|id| {
            self.clients
                .get(id)
                .is_some_and(|client| client.is_online())
        })
    }

    /// ONLINE clients bound to the pipe, ordered by client id
    pub fn healthy_candidates(&self, pipe_name: &str) -> Vec<ClientInformation> {
        self.bound_clients(pipe_name)
            .iter()
            .filter_map(|id| self.clients.get(id).map(|c| c.value().clone()))
            .filter(ClientInformation::is_online)
            .collect()
    }

    fn bound_clients(&self, pipe_name: &str) -> BTreeSet<ClientId> {
        let bindings = self
            .bindings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bindings
            .iter()
            .find(|binding| binding.regex.is_match(pipe_name))
            .map(|binding| binding.clients.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, client_id: &ClientId) -> Option<ClientInformation> {
        self.clients.get(client_id).map(|c| c.value().clone())
    }

    /// Snapshot of every known client
    pub fn clients(&self) -> Vec<ClientInformation> {
        let mut clients: Vec<_> = self.clients.iter().map(|c| c.value().clone()).collect();
        clients.sort_by(|a, b| (&a.address, a.port).cmp(&(&b.address, b.port)));
        clients
    }

    /// Binding patterns in resolution order
    pub fn binding_patterns(&self) -> Vec<String> {
        self.bindings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|b| b.pattern.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn write_bindings(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Binding>> {
        self.bindings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
