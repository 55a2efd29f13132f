//! Channel group: an equivalence class of live connections to one address
//!
//! The group owns no channels; it indexes references behind a copy-on-write
//! snapshot pointer so readers never block writers. Each added channel gets
//! a close listener that removes it from the group again, resolved through
//! a weak back-reference so the group and its channels form no cycle.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::error::{Result, TransportError};
use crate::protocol::constants::{DEFAULT_WARM_UP_MILLIS, DEFAULT_WEIGHT};
use crate::registry::meta::Address;
use crate::time::Clock;

use super::channel::Channel;

/// Round-robin selector over the live connections to one provider address
pub struct ChannelGroup {
    address: Address,
    channels: ArcSwap<Vec<Arc<Channel>>>,
    index: AtomicUsize,
    weight: AtomicU32,
    warm_up_millis: AtomicU64,
    timestamp: AtomicU64,
    clock: Clock,
}

impl ChannelGroup {
    pub fn new(address: Address, clock: Clock) -> Arc<Self> {
        Arc::new(Self {
            address,
            channels: ArcSwap::from_pointee(Vec::new()),
            index: AtomicUsize::new(0),
            weight: AtomicU32::new(DEFAULT_WEIGHT),
            warm_up_millis: AtomicU64::new(DEFAULT_WARM_UP_MILLIS),
            timestamp: AtomicU64::new(clock.now_millis()),
            clock,
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Append `channel` unless it is already present. On success a close
    /// listener is registered that removes the channel again.
    pub fn add(self: &Arc<Self>, channel: Arc<Channel>) -> bool {
        let mut added = false;
        self.channels.rcu(|current| {
            if current.iter().any(|c| c.id() == channel.id()) {
                added = false;
                Arc::clone(current)
            } else {
                added = true;
                let mut next = Vec::with_capacity(current.len() + 1);
                next.extend(current.iter().cloned());
                next.push(Arc::clone(&channel));
                Arc::new(next)
            }
        });

        if added {
            let group = Arc::downgrade(self);
            channel.on_close(Box::new(move |ch| {
                if let Some(group) = group.upgrade() {
                    group.remove(ch);
                }
            }));
        }
        added
    }

    /// Remove `channel` from the group
    pub fn remove(&self, channel: &Arc<Channel>) -> bool {
        let mut removed = false;
        self.channels.rcu(|current| {
            let next: Vec<Arc<Channel>> = current
                .iter()
                .filter(|c| c.id() != channel.id())
                .cloned()
                .collect();
            removed = next.len() != current.len();
            Arc::new(next)
        });
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.channels.load().is_empty()
    }

    pub fn len(&self) -> usize {
        self.channels.load().len()
    }

    /// Pick the next channel round-robin.
    ///
    /// An empty group is retried three times with growing parks (200, 400,
    /// 800 ms); if it stays empty, [`TransportError::NoChannelAvailable`] is
    /// raised. Strict fairness across simultaneous callers is not
    /// guaranteed, long-run distribution is uniform.
    pub async fn next(&self) -> Result<Arc<Channel>> {
        let mut attempts = 0u32;
        loop {
            let snapshot = self.channels.load();

            if snapshot.is_empty() {
                attempts += 1;
                if attempts <= 3 {
                    tokio::time::sleep(Duration::from_millis(100 << attempts)).await;
                    continue;
                }
                return Err(
                    TransportError::NoChannelAvailable(self.address.to_string()).into(),
                );
            }

            if snapshot.len() == 1 {
                return Ok(Arc::clone(&snapshot[0]));
            }

            let offset = self.index.fetch_add(1, Ordering::Relaxed) % snapshot.len();
            return Ok(Arc::clone(&snapshot[offset]));
        }
    }

    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    pub fn set_weight(&self, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
    }

    pub fn warm_up(&self) -> Duration {
        Duration::from_millis(self.warm_up_millis.load(Ordering::Relaxed))
    }

    pub fn set_warm_up(&self, warm_up: Duration) {
        self.warm_up_millis
            .store(warm_up.as_millis() as u64, Ordering::Relaxed);
    }

    /// Millis timestamp of the last [`reset_timestamp`](Self::reset_timestamp)
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    pub fn reset_timestamp(&self) {
        self.timestamp
            .store(self.clock.now_millis(), Ordering::Relaxed);
    }
}

impl PartialEq for ChannelGroup {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for ChannelGroup {}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::error::Error;

    use super::*;

    fn group() -> Arc<ChannelGroup> {
        ChannelGroup::new(Address::new("10.0.0.1", 9000), Clock::new())
    }

    #[test]
    fn test_add_is_idempotent() {
        let group = group();
        let (channel, _rx) = Channel::new(1, None);

        assert!(group.add(Arc::clone(&channel)));
        assert!(!group.add(channel));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_close_removes_channel() {
        let group = group();
        let (channel, _rx) = Channel::new(1, None);
        group.add(Arc::clone(&channel));
        assert_eq!(group.len(), 1);

        channel.close();
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_next_single_channel() {
        let group = group();
        let (channel, _rx) = Channel::new(1, None);
        group.add(Arc::clone(&channel));

        let picked = group.next().await.unwrap();
        assert_eq!(picked.id(), channel.id());
    }

    #[tokio::test]
    async fn test_next_round_robins() {
        let group = group();
        let mut receivers = Vec::new();
        for id in 0..3u64 {
            let (channel, rx) = Channel::new(id, None);
            receivers.push(rx);
            group.add(channel);
        }

        let mut counts: HashMap<u64, u32> = HashMap::new();
        for _ in 0..30 {
            let picked = group.next().await.unwrap();
            *counts.entry(picked.id()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert_eq!(*count, 10);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_on_empty_group_backs_off_then_fails() {
        let group = group();

        let started = tokio::time::Instant::now();
        let err = group.next().await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(
            err,
            Error::Transport(TransportError::NoChannelAvailable(_))
        ));
        // three parks: 200 + 400 + 800 ms
        assert!(waited >= Duration::from_millis(1400));
    }

    #[tokio::test]
    async fn test_next_sees_channel_added_during_backoff() {
        let group = group();
        let (channel, _rx) = Channel::new(9, None);

        let adder = {
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                group.add(channel);
            })
        };

        let picked = group.next().await.unwrap();
        assert_eq!(picked.id(), 9);
        adder.await.unwrap();
    }

    #[test]
    fn test_weight_and_warm_up_defaults() {
        let group = group();
        assert_eq!(group.weight(), DEFAULT_WEIGHT);
        assert_eq!(group.warm_up(), Duration::from_millis(DEFAULT_WARM_UP_MILLIS));

        group.set_weight(80);
        assert_eq!(group.weight(), 80);
    }
}
