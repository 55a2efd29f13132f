//! Service and provider identity types

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::protocol::constants::DEFAULT_WEIGHT;

/// Identity of a service: group, name, version.
///
/// Equality and hashing depend on exactly these three fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceMeta {
    pub group: String,
    pub name: String,
    pub version: String,
}

impl ServiceMeta {
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ServiceMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.name, self.version)
    }
}

/// `(host, port)` of a provider.
///
/// `host` may be empty at ingress; the server fills it in from the peer
/// socket address before storing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A provider record for one service at one address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMeta {
    pub service: ServiceMeta,
    pub address: Address,
    pub weight: u32,
    pub conn_count: u32,
}

impl RegisterMeta {
    pub fn new(service: ServiceMeta, address: Address) -> Self {
        Self {
            service,
            address,
            weight: DEFAULT_WEIGHT,
            conn_count: 1,
        }
    }
}

// Identity for map keying is the address within a service scope; weight and
// connection count are attributes, not identity.
impl PartialEq for RegisterMeta {
    fn eq(&self, other: &Self) -> bool {
        self.service == other.service && self.address == other.address
    }
}

impl Eq for RegisterMeta {}

impl Hash for RegisterMeta {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service.hash(state);
        self.address.hash(state);
    }
}

impl fmt::Display for RegisterMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service, self.address)
    }
}
