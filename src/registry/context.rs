//! Registry state: versioned per-service provider maps
//!
//! Entries are created lazily on first access and never removed. Mutation
//! of one service (provider map plus version) is serialized by that
//! service's monitor; reads snapshot the version and contents under the
//! same lock so they can never observe a torn pairing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use super::meta::{Address, RegisterMeta, ServiceMeta};

/// Provider map of one service paired with its monotonically increasing
/// version. The version is bumped on every effective publish or unpublish.
#[derive(Debug, Default)]
pub struct ConfigWithVersion {
    version: i64,
    providers: HashMap<Address, RegisterMeta>,
}

impl ConfigWithVersion {
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Increment and return the new version
    pub fn new_version(&mut self) -> i64 {
        self.version += 1;
        self.version
    }

    /// Insert `meta` unless its address is already present. Returns `true`
    /// when newly added.
    pub fn put_if_absent(&mut self, meta: RegisterMeta) -> bool {
        use std::collections::hash_map::Entry;
        match self.providers.entry(meta.address.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(meta);
                true
            }
        }
    }

    pub fn remove(&mut self, address: &Address) -> Option<RegisterMeta> {
        self.providers.remove(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.providers.contains_key(address)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Full provider list (order unspecified)
    pub fn provider_list(&self) -> Vec<RegisterMeta> {
        self.providers.values().cloned().collect()
    }
}

/// One service's entry: the per-service monitor around its versioned map
#[derive(Debug, Default)]
pub struct ServiceConfig {
    inner: Mutex<ConfigWithVersion>,
}

impl ServiceConfig {
    /// Take the per-service monitor
    pub fn lock(&self) -> MutexGuard<'_, ConfigWithVersion> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current version (briefly takes the monitor)
    pub fn version(&self) -> i64 {
        self.lock().version()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Consistent `(version, provider list)` snapshot
    pub fn snapshot(&self) -> (i64, Vec<RegisterMeta>) {
        let guard = self.lock();
        (guard.version(), guard.provider_list())
    }
}

/// Set of services a given provider address currently exposes
#[derive(Debug, Default)]
pub struct ServiceSet {
    inner: Mutex<HashSet<ServiceMeta>>,
}

impl ServiceSet {
    pub fn add(&self, service: ServiceMeta) -> bool {
        self.lock().insert(service)
    }

    pub fn remove(&self, service: &ServiceMeta) -> bool {
        self.lock().remove(service)
    }

    pub fn contains(&self, service: &ServiceMeta) -> bool {
        self.lock().contains(service)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<ServiceMeta> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<ServiceMeta>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Thread-safe registry state
///
/// Two mappings: `service -> versioned provider map` and the inverse
/// `address -> services`. Both sides of a mutation happen under the same
/// per-service monitor, which keeps them consistent with each other.
#[derive(Debug, Default)]
pub struct RegistryContext {
    services: RwLock<HashMap<ServiceMeta, Arc<ServiceConfig>>>,
    provided: RwLock<HashMap<Address, Arc<ServiceSet>>>,
}

impl RegistryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The versioned provider map of `service`, created empty on first
    /// access.
    pub fn register_meta(&self, service: &ServiceMeta) -> Arc<ServiceConfig> {
        if let Some(config) = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
        {
            return Arc::clone(config);
        }

        let mut services = self
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(services.entry(service.clone()).or_default())
    }

    /// The set of services `address` provides, created empty on first
    /// access.
    pub fn service_meta(&self, address: &Address) -> Arc<ServiceSet> {
        if let Some(set) = self
            .provided
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
        {
            return Arc::clone(set);
        }

        let mut provided = self
            .provided
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(provided.entry(address.clone()).or_default())
    }

    /// All services ever seen (including ones whose provider map is empty)
    pub fn services(&self) -> Vec<ServiceMeta> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// All provider addresses ever seen
    pub fn addresses(&self) -> Vec<Address> {
        self.provided
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> ServiceMeta {
        ServiceMeta::new("default", name, "1.0.0")
    }

    fn meta(name: &str, host: &str) -> RegisterMeta {
        RegisterMeta::new(service(name), Address::new(host, 9000))
    }

    #[test]
    fn test_entry_created_lazily_and_shared() {
        let context = RegistryContext::new();
        let svc = service("user");

        let a = context.register_meta(&svc);
        let b = context.register_meta(&svc);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.version(), 0);
        assert!(a.is_empty());
    }

    #[test]
    fn test_put_if_absent_is_idempotent() {
        let context = RegistryContext::new();
        let config = context.register_meta(&service("user"));

        let mut guard = config.lock();
        assert!(guard.put_if_absent(meta("user", "10.0.0.1")));
        assert!(!guard.put_if_absent(meta("user", "10.0.0.1")));
        assert_eq!(guard.provider_list().len(), 1);
    }

    #[test]
    fn test_version_strictly_increases() {
        let context = RegistryContext::new();
        let config = context.register_meta(&service("user"));

        let mut last = 0;
        for _ in 0..10 {
            let next = config.lock().new_version();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_version_strictly_increases_under_contention() {
        let context = Arc::new(RegistryContext::new());
        let svc = service("user");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let context = Arc::clone(&context);
            let svc = svc.clone();
            handles.push(std::thread::spawn(move || {
                let config = context.register_meta(&svc);
                let mut seen = Vec::new();
                for _ in 0..250 {
                    seen.push(config.lock().new_version());
                }
                seen
            }));
        }

        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        // 1000 bumps, no duplicates, ending exactly at 1000
        assert_eq!(all.len(), 1000);
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(*all.last().unwrap(), 1000);
    }

    #[test]
    fn test_snapshot_pairs_version_with_contents() {
        let context = RegistryContext::new();
        let config = context.register_meta(&service("user"));

        {
            let mut guard = config.lock();
            guard.put_if_absent(meta("user", "10.0.0.1"));
            guard.new_version();
        }

        let (version, list) = config.snapshot();
        assert_eq!(version, 1);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_inverse_set() {
        let context = RegistryContext::new();
        let address = Address::new("10.0.0.1", 9000);

        let set = context.service_meta(&address);
        assert!(set.add(service("user")));
        assert!(set.contains(&service("user")));
        assert!(set.remove(&service("user")));
        assert!(set.is_empty());
    }
}
