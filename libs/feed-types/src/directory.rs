//! Service directory and symbol-list entries
//!
//! A directory message carries a map of services keyed by service id. Each
//! entry holds independently optional capability sections; the filter bits
//! below say which sections a consumer asked for.

use serde::{Deserialize, Serialize};

use crate::domain::DomainType;
use crate::ids::{GroupId, ServiceId};
use crate::qos::Qos;
use crate::state::State;

/// Directory filter bits
pub mod service_filter {
    pub const INFO: u32 = 0x01;
    pub const STATE: u32 = 0x02;
    pub const GROUP: u32 = 0x04;
    pub const LOAD: u32 = 0x08;
    pub const DATA: u32 = 0x10;
    pub const LINK: u32 = 0x20;

    /// Every section the watchlist caches
    pub const ALL: u32 = INFO | STATE | GROUP | LOAD | DATA | LINK;
}

/// Map entry action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MapAction {
    Add,
    Update,
    Delete,
}

/// Info filter: identity and capabilities of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub name: String,
    pub vendor: Option<String>,
    /// Domains the service can provide
    pub capabilities: Vec<DomainType>,
    /// QoS the service offers; empty means realtime tick-by-tick
    pub qos: Vec<Qos>,
    pub supports_qos_range: bool,
    pub dictionaries_provided: Vec<String>,
    pub dictionaries_used: Vec<String>,
    pub item_list: Option<String>,
}

/// State filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStateInfo {
    /// Service is up
    pub service_state: bool,
    pub accepting_requests: bool,
    pub status: Option<State>,
}

impl Default for ServiceStateInfo {
    fn default() -> Self {
        Self {
            service_state: true,
            accepting_requests: true,
            status: None,
        }
    }
}

/// Load filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLoad {
    pub open_limit: Option<u64>,
    /// Maximum number of requests that may await a refresh at once
    pub open_window: Option<u64>,
    pub load_factor: Option<u64>,
}

/// One upstream link of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLink {
    pub name: String,
    pub action: MapAction,
    pub link_up: bool,
    pub text: Option<String>,
}

/// Link filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLinkInfo {
    pub links: Vec<ServiceLink>,
}

/// Group filter entry: bulk status and group merges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub group: GroupId,
    /// Every item of `group` now belongs to this group
    pub merged_to: Option<GroupId>,
    /// Status to apply to every item of `group`
    pub status: Option<State>,
}

/// One service in a directory message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub service_id: ServiceId,
    pub action: MapAction,
    pub info: Option<ServiceInfo>,
    pub state: Option<ServiceStateInfo>,
    pub load: Option<ServiceLoad>,
    pub link: Option<ServiceLinkInfo>,
    pub groups: Vec<ServiceGroup>,
}

impl ServiceEntry {
    /// Entry with no sections
    pub fn new(service_id: ServiceId, action: MapAction) -> Self {
        Self {
            service_id,
            action,
            info: None,
            state: None,
            load: None,
            link: None,
            groups: Vec::new(),
        }
    }

    /// Add entry for a named service that is up and accepting requests.
    pub fn up(service_id: ServiceId, name: impl Into<String>, capabilities: Vec<DomainType>) -> Self {
        Self {
            info: Some(ServiceInfo {
                name: name.into(),
                capabilities,
                ..ServiceInfo::default()
            }),
            state: Some(ServiceStateInfo::default()),
            ..Self::new(service_id, MapAction::Add)
        }
    }

    pub fn delete(service_id: ServiceId) -> Self {
        Self::new(service_id, MapAction::Delete)
    }

    /// Filter bits of the sections present in this entry
    pub fn section_flags(&self) -> u32 {
        let mut flags = 0;
        if self.info.is_some() {
            flags |= service_filter::INFO;
        }
        if self.state.is_some() {
            flags |= service_filter::STATE;
        }
        if !self.groups.is_empty() {
            flags |= service_filter::GROUP;
        }
        if self.load.is_some() {
            flags |= service_filter::LOAD;
        }
        if self.link.is_some() {
            flags |= service_filter::LINK;
        }
        flags
    }

    /// Service name, if the info section is present
    pub fn name(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.name.as_str())
    }
}

/// One symbol in a symbol-list payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolListEntry {
    pub name: String,
    pub action: MapAction,
}

impl SymbolListEntry {
    pub fn add(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: MapAction::Add,
        }
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action: MapAction::Delete,
        }
    }
}
