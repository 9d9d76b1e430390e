//! Service directory cache
//!
//! Mirrors the provider's directory. Services are indexed by id and by name;
//! entries are applied with map semantics and every change is reported as a
//! [`ServiceEvent`] so the watchlist can re-drive or recover item streams.
//!
//! Uses BTreeMap for deterministic iteration order.

use std::collections::BTreeMap;

use feed_types::directory::{
    service_filter, MapAction, ServiceEntry, ServiceInfo, ServiceLink, ServiceLinkInfo, ServiceLoad,
    ServiceStateInfo,
};
use feed_types::domain::DomainType;
use feed_types::ids::ServiceId;
use feed_types::qos::Qos;
use tracing::{debug, warn};

use crate::error::ServiceCacheError;

/// Why the cache was last emptied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// The channel went down; services will be re-synced on recovery.
    ConnectionLoss,
    /// The provider cleared its directory.
    ProviderClear,
}

/// Change produced by applying directory entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Added {
        service_id: ServiceId,
        /// Entry as received
        entry: ServiceEntry,
    },
    Updated {
        service_id: ServiceId,
        /// Entry as received; only its present sections were applied
        entry: ServiceEntry,
        /// Previous name, when the update renamed the service
        renamed_from: Option<String>,
    },
    Removed {
        service_id: ServiceId,
        name: Option<String>,
        connection_loss: bool,
    },
}

impl ServiceEvent {
    pub fn service_id(&self) -> ServiceId {
        match self {
            ServiceEvent::Added { service_id, .. }
            | ServiceEvent::Updated { service_id, .. }
            | ServiceEvent::Removed { service_id, .. } => *service_id,
        }
    }
}

/// Result of [`ServiceCache::process_service_list`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceListOutcome {
    pub events: Vec<ServiceEvent>,
    /// Entries that could not be applied
    pub rejected: Vec<ServiceCacheError>,
}

/// One cached service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub service_id: ServiceId,
    pub info: Option<ServiceInfo>,
    pub state: Option<ServiceStateInfo>,
    pub load: Option<ServiceLoad>,
    pub link: Option<ServiceLinkInfo>,
}

impl Service {
    fn from_entry(entry: &ServiceEntry) -> Self {
        let mut service = Self {
            service_id: entry.service_id,
            info: None,
            state: None,
            load: None,
            link: None,
        };
        service.apply(entry);
        service
    }

    /// Apply the sections present in `entry`.
    fn apply(&mut self, entry: &ServiceEntry) {
        if let Some(info) = &entry.info {
            self.info = Some(info.clone());
        }
        if let Some(state) = &entry.state {
            self.state = Some(state.clone());
        }
        if let Some(load) = &entry.load {
            let current = self.load.get_or_insert_with(ServiceLoad::default);
            if load.open_limit.is_some() {
                current.open_limit = load.open_limit;
            }
            if load.open_window.is_some() {
                current.open_window = load.open_window;
            }
            if load.load_factor.is_some() {
                current.load_factor = load.load_factor;
            }
        }
        if let Some(link) = &entry.link {
            let current = self.link.get_or_insert_with(ServiceLinkInfo::default);
            for incoming in &link.links {
                merge_link(&mut current.links, incoming);
            }
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.name.as_str())
    }

    /// Service is up. A service without a state section counts as up.
    pub fn is_up(&self) -> bool {
        self.state.as_ref().map(|s| s.service_state).unwrap_or(true)
    }

    pub fn accepting_requests(&self) -> bool {
        self.state.as_ref().map(|s| s.accepting_requests).unwrap_or(true)
    }

    pub fn supports_domain(&self, domain: DomainType) -> bool {
        self.info
            .as_ref()
            .map(|info| info.capabilities.contains(&domain))
            .unwrap_or(false)
    }

    /// QoS offered by the service; empty means realtime only.
    pub fn qos(&self) -> &[Qos] {
        self.info.as_ref().map(|info| info.qos.as_slice()).unwrap_or(&[])
    }

    pub fn open_window(&self) -> Option<u64> {
        self.load.as_ref().and_then(|load| load.open_window)
    }

    /// Full entry for a refresh, restricted to the sections in `filter`.
    ///
    /// Returns the entry and how many sections it carries.
    pub fn to_refresh_entry(&self, filter: u32) -> (ServiceEntry, usize) {
        let mut entry = ServiceEntry::new(self.service_id, MapAction::Add);
        entry.info = self.info.clone();
        entry.state = Some(self.state.clone().unwrap_or_default());
        entry.load = self.load.clone();
        entry.link = self.link.clone();
        filter_sections(entry, filter)
    }
}

/// Strip from an update the sections the consumer did not ask for.
///
/// Returns the entry and how many sections remain; zero means the update is
/// not worth forwarding. Deletes always pass.
pub fn filter_update_entry(entry: &ServiceEntry, filter: u32) -> (ServiceEntry, usize) {
    if entry.action == MapAction::Delete {
        return (entry.clone(), 1);
    }
    filter_sections(entry.clone(), filter)
}

fn filter_sections(mut entry: ServiceEntry, filter: u32) -> (ServiceEntry, usize) {
    if filter & service_filter::INFO == 0 {
        entry.info = None;
    }
    if filter & service_filter::STATE == 0 {
        entry.state = None;
    }
    if filter & service_filter::GROUP == 0 {
        entry.groups.clear();
    }
    if filter & service_filter::LOAD == 0 {
        entry.load = None;
    }
    if filter & service_filter::LINK == 0 {
        entry.link = None;
    }
    let count = entry.section_flags().count_ones() as usize;
    (entry, count)
}

fn merge_link(links: &mut Vec<ServiceLink>, incoming: &ServiceLink) {
    let existing = links.iter().position(|l| l.name == incoming.name);
    match (incoming.action, existing) {
        (MapAction::Delete, Some(index)) => {
            links.remove(index);
        }
        (MapAction::Delete, None) => {}
        (_, Some(index)) => links[index] = incoming.clone(),
        (_, None) => links.push(incoming.clone()),
    }
}

/// Directory cache indexed by service id and by name.
#[derive(Debug, Default)]
pub struct ServiceCache {
    by_id: BTreeMap<ServiceId, Service>,
    by_name: BTreeMap<String, ServiceId>,
    last_clear: Option<ClearReason>,
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply directory entries in order.
    ///
    /// A failed entry is reported in `rejected` and does not stop the rest.
    pub fn process_service_list(&mut self, entries: &[ServiceEntry]) -> ServiceListOutcome {
        let mut outcome = ServiceListOutcome::default();
        for entry in entries {
            let applied = match entry.action {
                MapAction::Add => self.add(entry),
                MapAction::Update => self.update(entry),
                MapAction::Delete => Ok(self.delete(entry.service_id, false)),
            };
            match applied {
                Ok(Some(event)) => outcome.events.push(event),
                Ok(None) => {}
                Err(err) => {
                    warn!(service_id = entry.service_id, error = %err, "Directory entry rejected");
                    outcome.rejected.push(err);
                }
            }
        }
        outcome
    }

    fn add(&mut self, entry: &ServiceEntry) -> Result<Option<ServiceEvent>, ServiceCacheError> {
        if self.by_id.contains_key(&entry.service_id) {
            return Err(ServiceCacheError::DuplicateId(entry.service_id));
        }
        // A service may arrive without its info section; it joins the name
        // index once an update names it.
        if let Some(name) = entry.name() {
            if self.by_name.contains_key(name) {
                return Err(ServiceCacheError::DuplicateName(name.to_string()));
            }
        }

        let service = Service::from_entry(entry);
        if let Some(name) = service.name() {
            self.by_name.insert(name.to_string(), entry.service_id);
        }
        debug!(service_id = entry.service_id, name = ?service.name(), "Service added");
        self.by_id.insert(entry.service_id, service);
        Ok(Some(ServiceEvent::Added {
            service_id: entry.service_id,
            entry: entry.clone(),
        }))
    }

    fn update(&mut self, entry: &ServiceEntry) -> Result<Option<ServiceEvent>, ServiceCacheError> {
        if !self.by_id.contains_key(&entry.service_id) {
            // Update for an unknown service is an add.
            let mut as_add = entry.clone();
            as_add.action = MapAction::Add;
            return self.add(&as_add);
        }
        if let Some(name) = entry.name() {
            if self.by_name.get(name).is_some_and(|id| *id != entry.service_id) {
                return Err(ServiceCacheError::DuplicateName(name.to_string()));
            }
        }
        let Some(service) = self.by_id.get_mut(&entry.service_id) else {
            return Ok(None);
        };

        let old_name = service.name().map(str::to_string);
        service.apply(entry);
        let new_name = service.name().map(str::to_string);

        let mut renamed_from = None;
        if old_name != new_name {
            if let Some(old) = &old_name {
                self.by_name.remove(old);
            }
            if let Some(new) = &new_name {
                self.by_name.insert(new.clone(), entry.service_id);
            }
            renamed_from = old_name;
        }

        debug!(service_id = entry.service_id, sections = entry.section_flags(), "Service updated");
        Ok(Some(ServiceEvent::Updated {
            service_id: entry.service_id,
            entry: entry.clone(),
            renamed_from,
        }))
    }

    fn delete(&mut self, service_id: ServiceId, connection_loss: bool) -> Option<ServiceEvent> {
        let Some(service) = self.by_id.remove(&service_id) else {
            debug!(service_id, "Delete for unknown service ignored");
            return None;
        };
        let name = service.name().map(str::to_string);
        if let Some(name) = &name {
            self.by_name.remove(name);
        }
        debug!(service_id, connection_loss, "Service removed");
        Some(ServiceEvent::Removed {
            service_id,
            name,
            connection_loss,
        })
    }

    /// Remove every service.
    ///
    /// `connection_loss` marks the removals as temporary: the services are
    /// expected back when the directory is re-requested.
    pub fn clear(&mut self, connection_loss: bool) -> Vec<ServiceEvent> {
        let ids: Vec<ServiceId> = self.by_id.keys().copied().collect();
        self.last_clear = Some(if connection_loss {
            ClearReason::ConnectionLoss
        } else {
            ClearReason::ProviderClear
        });
        ids.into_iter()
            .filter_map(|id| self.delete(id, connection_loss))
            .collect()
    }

    pub fn last_clear(&self) -> Option<ClearReason> {
        self.last_clear
    }

    pub fn service_id(&self, name: &str) -> Option<ServiceId> {
        self.by_name.get(name).copied()
    }

    pub fn service_name(&self, service_id: ServiceId) -> Option<&str> {
        self.by_id.get(&service_id).and_then(Service::name)
    }

    pub fn get(&self, service_id: ServiceId) -> Option<&Service> {
        self.by_id.get(&service_id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Service> {
        self.service_id(name).and_then(|id| self.get(id))
    }

    /// Services ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &Service> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
