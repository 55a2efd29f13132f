//! Broadcast dispatch
//!
//! One request goes to the `next()` channel of every non-empty group in the
//! directory. The wrapper is serialized once on the dispatching task to
//! keep that work off the I/O path; each write carries a listener that
//! transitions the per-channel invoke future to *sent* and runs the
//! consumer hooks once the bytes reach the socket.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;

use crate::error::Result;
use crate::protocol::message::Sequence;
use crate::serializer::Serializer;
use crate::transport::channel::Channel;

use super::{ChannelDirectory, ConsumerHook, InvokeFuture, MessageWrapper, Request};

/// Dispatches one request to every known provider of a service
pub struct BroadcastDispatcher {
    directory: Arc<ChannelDirectory>,
    serializer: Arc<dyn Serializer>,
    sequence: Sequence,
    hooks: Vec<Arc<dyn ConsumerHook>>,
    futures: RwLock<HashMap<String, Arc<InvokeFuture>>>,
}

impl BroadcastDispatcher {
    pub fn new(directory: Arc<ChannelDirectory>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            directory,
            serializer,
            sequence: Sequence::new(),
            hooks: Vec::new(),
            futures: RwLock::new(HashMap::new()),
        }
    }

    /// Add a consumer hook
    pub fn hook(mut self, hook: Arc<dyn ConsumerHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Send `message` to the next channel of every non-empty group.
    ///
    /// Returns no aggregate future; per-channel futures are addressed via
    /// [`future`](Self::future).
    pub async fn dispatch(&self, message: &MessageWrapper) -> Result<()> {
        let groups = self.directory.list(&message.service);

        let mut channels: Vec<Arc<Channel>> = Vec::with_capacity(groups.len());
        for group in groups {
            if group.is_empty() {
                continue;
            }
            match group.next().await {
                Ok(channel) => channels.push(channel),
                Err(e) => {
                    tracing::warn!(address = %group.address(), error = %e, "skipping group");
                }
            }
        }

        // Serialize once on the calling task.
        let bytes = Bytes::from(self.serializer.write_request(message)?);
        let sequence = self.sequence.next();
        let request = Arc::new(Request {
            sequence,
            service: message.service.clone(),
            bytes: bytes.clone(),
        });

        for channel in channels {
            let future = Arc::new(InvokeFuture::new(Arc::clone(&channel), sequence));
            self.futures
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(future_key(sequence, &channel), Arc::clone(&future));

            let hooks = self.hooks.clone();
            let request = Arc::clone(&request);
            channel.write_with_listener(
                bytes.clone(),
                Some(Box::new(move |success| {
                    if success {
                        future.mark_sent();
                        for hook in &hooks {
                            hook.before(&request);
                        }
                    }
                })),
            );
        }
        Ok(())
    }

    /// Look up the per-channel future of a dispatched request
    pub fn future(&self, sequence: u64, channel: &Arc<Channel>) -> Option<Arc<InvokeFuture>> {
        self.futures
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&future_key(sequence, channel))
            .cloned()
    }
}

fn future_key(sequence: u64, channel: &Channel) -> String {
    format!("{}-{}", sequence, channel.short_id())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::sync::mpsc;

    use crate::registry::meta::{Address, ServiceMeta};
    use crate::serializer::BincodeSerializer;
    use crate::time::Clock;
    use crate::transport::channel::Outbound;

    use super::*;

    fn svc() -> ServiceMeta {
        ServiceMeta::new("default", "svc-x", "1.0.0")
    }

    struct CountingHook(AtomicU32);

    impl ConsumerHook for CountingHook {
        fn before(&self, _request: &Request) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Act as the channel's writer task: pop one frame, report success.
    fn complete_one_write(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Bytes {
        match rx.try_recv().expect("no frame queued") {
            Outbound::Frame { bytes, listener } => {
                if let Some(listener) = listener {
                    listener(true);
                }
                bytes
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }

    fn dispatcher_with_two_groups() -> (
        Arc<CountingHook>,
        BroadcastDispatcher,
        Vec<(Arc<Channel>, mpsc::UnboundedReceiver<Outbound>)>,
    ) {
        let directory = Arc::new(ChannelDirectory::new(Clock::new()));
        let hook = Arc::new(CountingHook(AtomicU32::new(0)));
        let dispatcher =
            BroadcastDispatcher::new(Arc::clone(&directory), Arc::new(BincodeSerializer::new()))
                .hook(Arc::clone(&hook) as Arc<dyn ConsumerHook>);

        let mut endpoints = Vec::new();
        for (i, host) in ["10.0.0.1", "10.0.0.2"].iter().enumerate() {
            let group = directory.group(&svc(), &Address::new(*host, 9000));
            let (channel, rx) = Channel::new(i as u64 + 1, None);
            group.add(Arc::clone(&channel));
            endpoints.push((channel, rx));
        }
        (hook, dispatcher, endpoints)
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_group() {
        let (hook, dispatcher, mut endpoints) = dispatcher_with_two_groups();

        let message = MessageWrapper::new(svc(), "ping", vec![1, 2, 3]);
        dispatcher.dispatch(&message).await.unwrap();

        let first = complete_one_write(&mut endpoints[0].1);
        let second = complete_one_write(&mut endpoints[1].1);
        // Serialized once: both channels got identical bytes.
        assert_eq!(first, second);
        // before() ran once per successful send.
        assert_eq!(hook.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_futures_transition_to_sent_and_hooks_run() {
        let (hook, dispatcher, mut endpoints) = dispatcher_with_two_groups();

        let message = MessageWrapper::new(svc(), "ping", Vec::new());
        dispatcher.dispatch(&message).await.unwrap();

        let future = dispatcher.future(1, &endpoints[0].0).expect("future registered");
        assert!(!future.is_sent());
        assert_eq!(hook.0.load(Ordering::SeqCst), 0);

        complete_one_write(&mut endpoints[0].1);
        assert!(future.is_sent());
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        // The second channel's future is independent.
        let other = dispatcher.future(1, &endpoints[1].0).unwrap();
        assert!(!other.is_sent());
    }

    #[tokio::test]
    async fn test_empty_groups_are_skipped() {
        let directory = Arc::new(ChannelDirectory::new(Clock::new()));
        let dispatcher =
            BroadcastDispatcher::new(Arc::clone(&directory), Arc::new(BincodeSerializer::new()));

        // A group exists but holds no channels.
        directory.group(&svc(), &Address::new("10.0.0.1", 9000));

        let message = MessageWrapper::new(svc(), "ping", Vec::new());
        dispatcher.dispatch(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_leaves_future_unsent() {
        let (hook, dispatcher, mut endpoints) = dispatcher_with_two_groups();

        let message = MessageWrapper::new(svc(), "ping", Vec::new());
        dispatcher.dispatch(&message).await.unwrap();

        // Writer reports failure for the first channel.
        match endpoints[0].1.try_recv().unwrap() {
            Outbound::Frame { listener, .. } => {
                if let Some(listener) = listener {
                    listener(false);
                }
            }
            other => panic!("unexpected item: {other:?}"),
        }

        let future = dispatcher.future(1, &endpoints[0].0).unwrap();
        assert!(!future.is_sent());
        assert_eq!(hook.0.load(Ordering::SeqCst), 0);
    }
}
