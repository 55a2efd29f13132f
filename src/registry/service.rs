//! Registry service: the publish/unpublish/subscribe state machine
//!
//! One instance per server. Every inbound message is answered with an ACK
//! carrying its sequence *before* it is processed, so clients can release
//! their own pending entries without waiting for fan-out effects. Pushes to
//! subscribers always carry the full provider list of the service at the
//! version the push was built under, and are tracked in the pending-ack map
//! until the subscriber's ACK arrives (or the retransmitter gives up).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use dashmap::DashMap;

use crate::error::Result;
use crate::protocol::codec::{Encoder, Inbound};
use crate::protocol::message::{Acknowledge, Message, Payload, Sequence, Sign};
use crate::serializer::Serializer;
use crate::stats::RegistryMetrics;
use crate::time::Clock;
use crate::transport::channel::Channel;

use super::context::RegistryContext;
use super::meta::{RegisterMeta, ServiceMeta};

/// Attachment slot holding the metas a channel has published
const PUBLISH_KEY: &str = "registry.publish";
/// Attachment slot holding the services a channel has subscribed to
const SUBSCRIBE_KEY: &str = "registry.subscribe";

type PublishSet = Mutex<HashSet<RegisterMeta>>;
type SubscribeSet = Mutex<HashSet<ServiceMeta>>;

/// A push awaiting its subscriber's ACK
#[derive(Clone)]
pub struct MessageNonAck {
    /// `"{sequence}-{channel-short-id}"`
    pub(crate) id: String,
    pub(crate) service: ServiceMeta,
    pub(crate) msg: Message,
    /// Encoded frame, built once at fan-out and reused on retransmit
    pub(crate) frame: Bytes,
    pub(crate) channel: Arc<Channel>,
    pub(crate) version: i64,
    /// Clock millis of the (re)send
    pub(crate) timestamp: u64,
}

impl MessageNonAck {
    fn new(
        service: ServiceMeta,
        msg: Message,
        frame: Bytes,
        channel: Arc<Channel>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: non_ack_key(msg.sequence, &channel),
            version: msg.version,
            service,
            msg,
            frame,
            channel,
            timestamp,
        }
    }
}

fn non_ack_key(sequence: u64, channel: &Channel) -> String {
    format!("{}-{}", sequence, channel.short_id())
}

/// Registry state machine plus fan-out plumbing
pub struct RegistryService {
    context: RegistryContext,
    subscribers: RwLock<HashMap<u64, Arc<Channel>>>,
    messages_non_ack: DashMap<String, MessageNonAck>,
    sequence: Sequence,
    encoder: Encoder,
    clock: Clock,
    metrics: Arc<RegistryMetrics>,
}

impl RegistryService {
    pub fn new(serializer: Arc<dyn Serializer>, clock: Clock) -> Arc<Self> {
        Arc::new(Self {
            context: RegistryContext::new(),
            subscribers: RwLock::new(HashMap::new()),
            messages_non_ack: DashMap::new(),
            sequence: Sequence::new(),
            encoder: Encoder::new(serializer),
            clock,
            metrics: Arc::new(RegistryMetrics::new()),
        })
    }

    pub fn context(&self) -> &RegistryContext {
        &self.context
    }

    pub fn metrics(&self) -> &Arc<RegistryMetrics> {
        &self.metrics
    }

    pub(crate) fn messages_non_ack(&self) -> &DashMap<String, MessageNonAck> {
        &self.messages_non_ack
    }

    pub(crate) fn clock(&self) -> Clock {
        self.clock
    }

    /// Handle one decoded inbound frame from `channel`.
    ///
    /// Invoked from the connection's read loop; a given connection's frames
    /// are processed serially.
    pub fn process_inbound(self: &Arc<Self>, inbound: Inbound, channel: &Arc<Channel>) -> Result<()> {
        match inbound {
            Inbound::Message(msg) => self.process_message(msg, channel),
            Inbound::Ack(ack) => {
                self.handle_acknowledge(ack, channel);
                Ok(())
            }
        }
    }

    fn process_message(self: &Arc<Self>, msg: Message, channel: &Arc<Channel>) -> Result<()> {
        match msg.sign {
            Sign::Publish | Sign::Unpublish => {
                // ACK first, then process.
                self.acknowledge(msg.sequence, channel)?;

                let Payload::Register(mut meta) = msg.data else {
                    tracing::warn!(
                        channel = channel.id(),
                        sign = ?msg.sign,
                        "unexpected payload for register message"
                    );
                    return Ok(());
                };

                if meta.address.host.is_empty() {
                    match channel.peer() {
                        Some(peer) => meta.address.host = peer.ip().to_string(),
                        None => {
                            tracing::warn!(
                                channel = channel.id(),
                                meta = %meta,
                                "could not resolve remote host, dropping publish"
                            );
                            self.metrics.incr_dropped_publishes();
                            return Ok(());
                        }
                    }
                }

                if msg.sign == Sign::Publish {
                    self.handle_publish(meta, channel)
                } else {
                    self.handle_unpublish(meta, channel)
                }
            }
            Sign::Subscribe => {
                self.acknowledge(msg.sequence, channel)?;

                let Payload::Subscribe(service) = msg.data else {
                    tracing::warn!(
                        channel = channel.id(),
                        "unexpected payload for subscribe message"
                    );
                    return Ok(());
                };
                self.handle_subscribe(service, channel)
            }
            Sign::Heartbeat | Sign::Ack => {
                // The decoder never emits messages with these signs.
                tracing::warn!(channel = channel.id(), sign = ?msg.sign, "unexpected message sign");
                Ok(())
            }
        }
    }

    /// Register `meta` as a provider. Publishing an already-present address
    /// is a no-op: no version bump, no fan-out.
    pub fn handle_publish(self: &Arc<Self>, meta: RegisterMeta, channel: &Arc<Channel>) -> Result<()> {
        self.attach_publish(meta.clone(), channel);

        let service = meta.service.clone();
        let config = self.context.register_meta(&service);

        // put_if_absent and the version bump must be atomic.
        let mut guard = config.lock();
        if !guard.put_if_absent(meta.clone()) {
            return Ok(());
        }
        self.context.service_meta(&meta.address).add(service.clone());

        let version = guard.new_version();
        let list = guard.provider_list();
        self.metrics.incr_publishes();
        tracing::info!(
            service = %service,
            provider = %meta.address,
            version,
            "service published"
        );

        // Fan-out writes are non-blocking enqueues; issuing them under the
        // monitor keeps version order identical to send order.
        self.fan_out(&service, version, list)
    }

    /// Remove `meta` as a provider. Unpublishing an absent address is a
    /// no-op.
    pub fn handle_unpublish(
        self: &Arc<Self>,
        meta: RegisterMeta,
        channel: &Arc<Channel>,
    ) -> Result<()> {
        self.detach_publish(&meta, channel);

        let service = meta.service.clone();
        let config = self.context.register_meta(&service);
        if config.is_empty() {
            return Ok(());
        }

        let mut guard = config.lock();
        if guard.remove(&meta.address).is_none() {
            return Ok(());
        }
        self.context.service_meta(&meta.address).remove(&service);

        let version = guard.new_version();
        let list = guard.provider_list();
        self.metrics.incr_unpublishes();
        tracing::info!(
            service = %service,
            provider = %meta.address,
            version,
            remaining = list.len(),
            "service unpublished"
        );

        self.fan_out(&service, version, list)
    }

    /// Subscribe `channel` to `service` and send it the current provider
    /// list (if non-empty) at the current version. The version is not
    /// bumped.
    pub fn handle_subscribe(
        self: &Arc<Self>,
        service: ServiceMeta,
        channel: &Arc<Channel>,
    ) -> Result<()> {
        self.attach_subscribe(service.clone(), channel);
        self.add_subscriber(channel);
        self.metrics.incr_subscribes();

        let config = self.context.register_meta(&service);
        let (version, list) = config.snapshot();
        if list.is_empty() {
            return Ok(());
        }

        let msg = Message::providers(self.sequence.next(), version, service.clone(), list);
        let frame = self.encoder.encode_message(&msg)?;
        self.track_and_send(service, msg, frame, channel);
        Ok(())
    }

    /// Delete the pending entry matching `ack` on `channel`
    pub fn handle_acknowledge(&self, ack: Acknowledge, channel: &Arc<Channel>) {
        self.metrics.incr_acks();
        let key = non_ack_key(ack.sequence, channel);
        if self.messages_non_ack.remove(&key).is_none() {
            tracing::debug!(channel = channel.id(), sequence = ack.sequence, "ack for unknown push");
        }
    }

    /// Implicit unpublish of everything `channel` published.
    ///
    /// The subscriber side needs no action here: the close listener
    /// installed by [`add_subscriber`](Self::add_subscriber) drops the
    /// channel from the subscriber set when it closes.
    pub fn channel_inactive(self: &Arc<Self>, channel: &Arc<Channel>) {
        let Some(published) = channel.attributes().get::<PublishSet>(PUBLISH_KEY) else {
            return;
        };
        let metas: Vec<RegisterMeta> = lock(&published).iter().cloned().collect();
        for meta in metas {
            if let Err(e) = self.handle_unpublish(meta, channel) {
                tracing::error!(channel = channel.id(), error = %e, "implicit unpublish failed");
            }
        }
    }

    /// Write an ACK for an inbound sequence
    fn acknowledge(&self, sequence: u64, channel: &Arc<Channel>) -> Result<()> {
        let frame = self.encoder.encode_ack(&Acknowledge::new(sequence))?;
        channel.write(frame);
        Ok(())
    }

    /// Push the full provider list to every subscriber of `service`,
    /// tracking each push in the pending-ack map before it is written.
    fn fan_out(
        self: &Arc<Self>,
        service: &ServiceMeta,
        version: i64,
        list: Vec<RegisterMeta>,
    ) -> Result<()> {
        let msg = Message::providers(self.sequence.next(), version, service.clone(), list);
        let frame = self.encoder.encode_message(&msg)?;

        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for channel in subscribers.values() {
            if !self.is_subscribed(service, channel) {
                continue;
            }
            self.track_and_send(service.clone(), msg.clone(), frame.clone(), channel);
        }
        Ok(())
    }

    fn track_and_send(
        &self,
        service: ServiceMeta,
        msg: Message,
        frame: Bytes,
        channel: &Arc<Channel>,
    ) {
        let non_ack = MessageNonAck::new(
            service,
            msg,
            frame.clone(),
            Arc::clone(channel),
            self.clock.now_millis(),
        );
        // Insert before writing: the ACK must always find its entry.
        self.messages_non_ack.insert(non_ack.id.clone(), non_ack);
        channel.write(frame);
        self.metrics.incr_pushes();
    }

    /// Re-track a pending push under its original id with a fresh
    /// timestamp, then re-send the original frame.
    pub(crate) fn retransmit(&self, entry: MessageNonAck) {
        let refreshed = MessageNonAck {
            timestamp: self.clock.now_millis(),
            ..entry
        };
        let frame = refreshed.frame.clone();
        let channel = Arc::clone(&refreshed.channel);
        self.messages_non_ack
            .insert(refreshed.id.clone(), refreshed);
        channel.write(frame);
        self.metrics.incr_retransmits();
    }

    fn attach_publish(&self, meta: RegisterMeta, channel: &Arc<Channel>) {
        let set = channel
            .attributes()
            .get_or_init::<PublishSet, _>(PUBLISH_KEY, Default::default);
        lock(&set).insert(meta);
    }

    fn detach_publish(&self, meta: &RegisterMeta, channel: &Arc<Channel>) {
        if let Some(set) = channel.attributes().get::<PublishSet>(PUBLISH_KEY) {
            lock(&set).remove(meta);
        }
    }

    fn attach_subscribe(&self, service: ServiceMeta, channel: &Arc<Channel>) {
        let set = channel
            .attributes()
            .get_or_init::<SubscribeSet, _>(SUBSCRIBE_KEY, Default::default);
        lock(&set).insert(service);
    }

    fn is_subscribed(&self, service: &ServiceMeta, channel: &Arc<Channel>) -> bool {
        channel
            .attributes()
            .get::<SubscribeSet>(SUBSCRIBE_KEY)
            .is_some_and(|set| lock(&set).contains(service))
    }

    fn add_subscriber(self: &Arc<Self>, channel: &Arc<Channel>) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if subscribers.insert(channel.id(), Arc::clone(channel)).is_none() {
            let service = Arc::downgrade(self);
            channel.on_close(Box::new(move |ch| {
                if let Some(service) = service.upgrade() {
                    service.remove_subscriber(ch.id());
                }
            }));
        }
    }

    fn remove_subscriber(&self, channel_id: u64) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel_id);
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
