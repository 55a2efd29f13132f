//! Ack-timeout scanner
//!
//! A single background task sweeps the pending-ack map. Entries older than
//! the ack timeout are claimed by atomic removal, then either dropped (a
//! newer version of the service exists, or the subscriber's connection is
//! gone) or re-tracked with a fresh timestamp and re-sent. Together with
//! the tracking in the registry service this gives at-least-once delivery
//! of each version to every subscriber whose connection stays up.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::protocol::constants::{ACK_SCAN_INTERVAL_MILLIS, ACK_TIMEOUT_MILLIS};

use super::service::RegistryService;

/// Background retransmitter over a registry service's pending-ack map
pub struct AckRetransmitter {
    service: Arc<RegistryService>,
    ack_timeout_millis: u64,
    scan_interval: Duration,
}

impl AckRetransmitter {
    /// Retransmitter with the protocol defaults (10 s timeout, 300 ms scan)
    pub fn new(service: Arc<RegistryService>) -> Self {
        Self::with_timing(
            service,
            Duration::from_millis(ACK_TIMEOUT_MILLIS),
            Duration::from_millis(ACK_SCAN_INTERVAL_MILLIS),
        )
    }

    pub fn with_timing(
        service: Arc<RegistryService>,
        ack_timeout: Duration,
        scan_interval: Duration,
    ) -> Self {
        Self {
            service,
            ack_timeout_millis: ack_timeout.as_millis() as u64,
            scan_interval,
        }
    }

    /// Spawn the scan loop. Aborting the handle stops it.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.scan_interval);
            loop {
                ticker.tick().await;
                self.scan();
            }
        })
    }

    /// One sweep over the pending-ack map
    pub fn scan(&self) {
        let now = self.service.clock().now_millis();

        let due: Vec<String> = self
            .service
            .messages_non_ack()
            .iter()
            .filter(|entry| now.saturating_sub(entry.value().timestamp) > self.ack_timeout_millis)
            .map(|entry| entry.key().clone())
            .collect();

        for id in due {
            // Atomic removal claims exclusive ownership; a concurrent ACK
            // may have beaten us to it.
            let Some((_, entry)) = self.service.messages_non_ack().remove(&id) else {
                continue;
            };

            if self
                .service
                .context()
                .register_meta(&entry.service)
                .version()
                > entry.version
            {
                // Superseded by a newer push; not worth re-sending.
                self.service.metrics().incr_stale_drops();
                tracing::debug!(
                    service = %entry.service,
                    version = entry.version,
                    "dropping stale unacked push"
                );
                continue;
            }

            if entry.channel.is_active() {
                tracing::debug!(
                    service = %entry.service,
                    version = entry.version,
                    channel = entry.channel.id(),
                    "retransmitting unacked push"
                );
                self.service.retransmit(entry);
            }
            // Inactive channel: in-flight versions are forgotten; the
            // subscriber re-subscribes on reconnect.
        }
    }
}
