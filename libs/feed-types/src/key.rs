//! Message keys

use serde::{Deserialize, Serialize};

use crate::ids::ServiceId;

/// Identifies the item a stream carries.
///
/// Every member is optional; equality is structural, so two requests with the
/// same key, domain and QoS can share one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MsgKey {
    pub name: Option<String>,
    pub name_type: Option<u8>,
    pub service_id: Option<ServiceId>,
    pub filter: Option<u32>,
    pub identifier: Option<i32>,
    pub attrib: Option<Vec<u8>>,
}

impl MsgKey {
    /// Key with just a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_service_id(mut self, service_id: ServiceId) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn with_filter(mut self, filter: u32) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_name_type(mut self, name_type: u8) -> Self {
        self.name_type = Some(name_type);
        self
    }

    /// Compare everything except the service id.
    ///
    /// Used when a request is bound by service name: the service id on the
    /// key is filled in by the watchlist, not by the application.
    pub fn matches_ignoring_service(&self, other: &MsgKey) -> bool {
        self.name == other.name
            && self.name_type == other.name_type
            && self.filter == other.filter
            && self.identifier == other.identifier
            && self.attrib == other.attrib
    }
}
