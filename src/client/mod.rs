//! Consumer-side pieces: channel directory, requests, invoke futures
//!
//! Consumers hold one [`ChannelGroup`](crate::transport::ChannelGroup) per
//! provider address and pick connections round-robin. The RPC transport
//! that carries requests and responses is an external collaborator; this
//! module only models the dispatch path the registry feeds.

pub mod dispatcher;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::registry::meta::{Address, ServiceMeta};
use crate::time::Clock;
use crate::transport::channel::Channel;
use crate::transport::group::ChannelGroup;

pub use dispatcher::BroadcastDispatcher;

/// An outbound invocation before serialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWrapper {
    pub service: ServiceMeta,
    pub method: String,
    pub args: Vec<u8>,
}

impl MessageWrapper {
    pub fn new(service: ServiceMeta, method: impl Into<String>, args: Vec<u8>) -> Self {
        Self {
            service,
            method: method.into(),
            args,
        }
    }
}

/// A serialized request ready to be written.
///
/// The wrapper is serialized once on the dispatching task; every chosen
/// channel gets the same bytes.
#[derive(Debug, Clone)]
pub struct Request {
    pub sequence: u64,
    pub service: ServiceMeta,
    pub bytes: Bytes,
}

/// Hook invoked around consumer-side dispatch
pub trait ConsumerHook: Send + Sync + 'static {
    /// Called after a request was successfully handed to the socket
    fn before(&self, request: &Request);
}

/// Per-channel state of one dispatched request
///
/// Broadcast dispatch returns no aggregate future; individual futures are
/// looked up out-of-band by `(sequence, channel)`.
pub struct InvokeFuture {
    channel: Arc<Channel>,
    sequence: u64,
    sent: AtomicBool,
}

impl InvokeFuture {
    fn new(channel: Arc<Channel>, sequence: u64) -> Self {
        Self {
            channel,
            sequence,
            sent: AtomicBool::new(false),
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether the request reached the socket
    pub fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    fn mark_sent(&self) {
        self.sent.store(true, Ordering::Release);
    }
}

/// Directory of channel groups, keyed by service then provider address
#[derive(Default)]
pub struct ChannelDirectory {
    clock: Clock,
    groups: RwLock<HashMap<ServiceMeta, Vec<Arc<ChannelGroup>>>>,
}

impl ChannelDirectory {
    pub fn new(clock: Clock) -> Self {
        Self {
            clock,
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// The group for `(service, address)`, created on first access
    pub fn group(&self, service: &ServiceMeta, address: &Address) -> Arc<ChannelGroup> {
        {
            let groups = self.groups.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(list) = groups.get(service) {
                if let Some(group) = list.iter().find(|g| g.address() == address) {
                    return Arc::clone(group);
                }
            }
        }

        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let list = groups.entry(service.clone()).or_default();
        if let Some(group) = list.iter().find(|g| g.address() == address) {
            return Arc::clone(group);
        }
        let group = ChannelGroup::new(address.clone(), self.clock);
        list.push(Arc::clone(&group));
        group
    }

    /// All groups currently known for `service`
    pub fn list(&self, service: &ServiceMeta) -> Vec<Arc<ChannelGroup>> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc() -> ServiceMeta {
        ServiceMeta::new("default", "svc-x", "1.0.0")
    }

    #[test]
    fn test_directory_creates_group_once() {
        let directory = ChannelDirectory::new(Clock::new());
        let address = Address::new("10.0.0.1", 9000);

        let a = directory.group(&svc(), &address);
        let b = directory.group(&svc(), &address);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(directory.list(&svc()).len(), 1);
    }

    #[test]
    fn test_directory_separates_addresses() {
        let directory = ChannelDirectory::new(Clock::new());

        directory.group(&svc(), &Address::new("10.0.0.1", 9000));
        directory.group(&svc(), &Address::new("10.0.0.2", 9000));
        assert_eq!(directory.list(&svc()).len(), 2);
    }

    #[test]
    fn test_list_unknown_service_is_empty() {
        let directory = ChannelDirectory::new(Clock::new());
        assert!(directory.list(&svc()).is_empty());
    }

    #[test]
    fn test_invoke_future_sent_transition() {
        let (channel, _rx) = Channel::new(1, None);
        let future = InvokeFuture::new(channel, 9);

        assert!(!future.is_sent());
        future.mark_sent();
        assert!(future.is_sent());
        assert_eq!(future.sequence(), 9);
    }
}
